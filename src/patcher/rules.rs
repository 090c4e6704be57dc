//! Line rules, one per error class.
//!
//! Each rule pairs a matcher over `(error, line)` with a pure rewrite of
//! that line. The registry tries rules in order; the first rule that
//! produces a fix wins. Date/string handling comes before the general
//! type-assignment rule because both recognise the same messages.

use regex::Regex;
use tracing::debug;

use super::symbols::{strip_strings, DeclKind, Declaration};
use super::{rename_identifier, ErrorClass, LineRule, RuleContext, RuleFix, StubInsertion};
use crate::diagnostics::BuildError;
use crate::manifest::Manifest;
use crate::workspace::{file_stem, join_relative, parent_dir, strip_extension};

/// Verb families treated as interchangeable in method names.
const VERB_GROUPS: &[&[&str]] = &[
    &["get", "find", "fetch", "retrieve", "load", "read"],
    &["create", "add", "insert", "save"],
    &["update", "modify", "edit", "patch"],
    &["delete", "remove", "destroy"],
];

/// Prefixes of the "list everything" family, longest first.
const LIST_PREFIXES: &[&str] = &["fetchAll", "getAll", "findAll", "listAll", "list"];

/// Ordered collection of line rules.
pub struct RuleRegistry {
    rules: Vec<Box<dyn LineRule>>,
}

impl RuleRegistry {
    /// Empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// All built-in rules.
    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .with_rule(DateStringRule::new())
            .with_rule(TypeAssignmentRule::new())
            .with_rule(ArgumentCountRule::new())
            .with_rule(UnresolvedImportRule::new())
            .with_rule(MissingPropertyRule::new())
            .with_rule(MissingMethodRule::new())
    }

    /// Append a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: impl LineRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// First fix any matching rule proposes.
    pub fn fix(
        &self,
        ctx: &RuleContext<'_>,
        error: &BuildError,
        line: &str,
    ) -> Option<(ErrorClass, RuleFix)> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(error, line))
            .find_map(|rule| {
                let fix = rule.apply(ctx, error, line);
                if fix.is_none() {
                    debug!("{} rule matched but produced no fix", rule.class());
                }
                fix.map(|f| (rule.class(), f))
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// Type mismatches
// ============================================================================

/// `Type 'A' is not assignable to type 'B'` and the argument variant.
struct Mismatch {
    from: String,
    to: String,
    argument: bool,
}

fn mismatch_patterns() -> Vec<(Regex, bool)> {
    [
        (r"Type '(.+?)' is not assignable to type '(.+?)'", false),
        (r"Argument of type '(.+?)' is not assignable to parameter of type '(.+?)'", true),
    ]
    .into_iter()
    .filter_map(|(p, arg)| Regex::new(p).ok().map(|re| (re, arg)))
    .collect()
}

fn parse_mismatch(patterns: &[(Regex, bool)], message: &str) -> Option<Mismatch> {
    patterns.iter().find_map(|(re, argument)| {
        re.captures(message).map(|caps| Mismatch {
            from: caps[1].to_string(),
            to: caps[2].to_string(),
            argument: *argument,
        })
    })
}

/// Rewrite the offending expression: the argument at the error column for
/// argument mismatches, otherwise the right-hand side of the line.
fn rewrite_expression(
    line: &str,
    error: &BuildError,
    argument: bool,
    f: impl Fn(&str) -> String,
) -> Option<String> {
    let (start, end) = if argument {
        let col = error.column?;
        expression_at(line, col.checked_sub(1)? as usize)?
    } else {
        assignment_rhs(line)?
    };
    let expr = &line[start..end];
    if expr.trim().is_empty() {
        return None;
    }
    Some(format!("{}{}{}", &line[..start], f(expr), &line[end..]))
}

/// Wrap an expression in parentheses unless it is a simple operand.
fn operand(expr: &str) -> String {
    let simple = expr
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '(' | ')' | '[' | ']' | '\'' | '"'));
    if simple {
        expr.to_string()
    } else {
        format!("({})", expr)
    }
}

pub struct DateStringRule {
    patterns: Vec<(Regex, bool)>,
}

impl DateStringRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: mismatch_patterns(),
        }
    }
}

impl Default for DateStringRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for DateStringRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::DateString
    }

    fn matches(&self, error: &BuildError, _line: &str) -> bool {
        parse_mismatch(&self.patterns, &error.message).is_some_and(|m| {
            matches!(
                (m.from.as_str(), m.to.as_str()),
                ("string" | "number", "Date") | ("Date", "string")
            )
        })
    }

    fn apply(&self, _ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let m = parse_mismatch(&self.patterns, &error.message)?;
        let fixed = if m.to == "Date" {
            rewrite_expression(line, error, m.argument, |e| format!("new Date({})", e))?
        } else {
            rewrite_expression(line, error, m.argument, |e| format!("{}.toISOString()", operand(e)))?
        };
        Some(RuleFix::Line(fixed))
    }
}

pub struct TypeAssignmentRule {
    patterns: Vec<(Regex, bool)>,
}

impl TypeAssignmentRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: mismatch_patterns(),
        }
    }

    fn conversion(from: &str, to: &str) -> Option<Box<dyn Fn(&str) -> String>> {
        let nullable = from
            .strip_suffix(" | undefined")
            .or_else(|| from.strip_suffix(" | null"));
        if let Some(base) = nullable {
            if base == to {
                let fallback = match to {
                    "string" => "''",
                    "number" => "0",
                    "boolean" => "false",
                    _ => return Some(Box::new(|e: &str| format!("{}!", operand(e)))),
                };
                return Some(Box::new(move |e: &str| format!("{} ?? {}", operand(e), fallback)));
            }
        }
        match (from, to) {
            ("string", "number") => Some(Box::new(|e: &str| format!("Number({})", e))),
            ("number" | "boolean", "string") => Some(Box::new(|e: &str| format!("String({})", e))),
            ("string" | "number", "boolean") => Some(Box::new(|e: &str| format!("Boolean({})", e))),
            _ => None,
        }
    }
}

impl Default for TypeAssignmentRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for TypeAssignmentRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::TypeAssignment
    }

    fn matches(&self, error: &BuildError, _line: &str) -> bool {
        parse_mismatch(&self.patterns, &error.message)
            .is_some_and(|m| Self::conversion(&m.from, &m.to).is_some())
    }

    fn apply(&self, _ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let m = parse_mismatch(&self.patterns, &error.message)?;
        let convert = Self::conversion(&m.from, &m.to)?;
        rewrite_expression(line, error, m.argument, convert).map(RuleFix::Line)
    }
}

// ============================================================================
// Argument count
// ============================================================================

pub struct ArgumentCountRule {
    pattern: Option<Regex>,
}

impl ArgumentCountRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(
                r"Expected (at least )?(\d+)(?:-(\d+))? arguments?, but got (\d+)(?: or more)?",
            )
            .ok(),
        }
    }

    /// `(min, max, got)`; `max` is `None` for "at least".
    fn counts(&self, message: &str) -> Option<(usize, Option<usize>, usize)> {
        let caps = self.pattern.as_ref()?.captures(message)?;
        let min: usize = caps[2].parse().ok()?;
        let max = if caps.get(1).is_some() {
            None
        } else {
            Some(caps.get(3).map_or(Some(min), |m| m.as_str().parse().ok())?)
        };
        let got: usize = caps[4].parse().ok()?;
        Some((min, max, got))
    }
}

impl Default for ArgumentCountRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for ArgumentCountRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::ArgumentCount
    }

    fn matches(&self, error: &BuildError, _line: &str) -> bool {
        self.counts(&error.message).is_some()
    }

    fn apply(&self, _ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let (min, max, got) = self.counts(&error.message)?;
        let calls: Vec<CallSite> = find_calls(line)
            .into_iter()
            .filter(|c| c.args.len() == got)
            .collect();
        let col = error.column.map_or(0, |c| c.saturating_sub(1) as usize);
        let call = calls
            .iter()
            .find(|c| c.name_start <= col && col <= c.close)
            .or_else(|| calls.first())?;

        let mut args: Vec<String> = call
            .args
            .iter()
            .map(|&(s, e)| line[s..e].to_string())
            .collect();
        match max {
            Some(max) if got > max => args.truncate(max),
            _ if got < min => args.resize(min, "undefined".to_string()),
            _ => return None,
        }

        Some(RuleFix::Line(format!(
            "{}{}{}",
            &line[..=call.open],
            args.join(", "),
            &line[call.close..]
        )))
    }
}

// ============================================================================
// Imports and exports
// ============================================================================

pub struct UnresolvedImportRule {
    missing_module: Option<Regex>,
    missing_member: Option<Regex>,
    no_default: Option<Regex>,
    default_import: Option<Regex>,
    named_import: Option<Regex>,
}

impl UnresolvedImportRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            missing_module: Regex::new(r"Cannot find module '([^']+)'").ok(),
            missing_member: Regex::new(
                r#"Module '"([^"]+)"' has no exported member '([\w$]+)'(?:\. Did you mean '([\w$]+)'\?)?"#,
            )
            .ok(),
            no_default: Regex::new(r#"Module '"([^"]+)"' has no default export"#).ok(),
            default_import: Regex::new(r"^(\s*import\s+)([\w$]+)(\s+from\s+)").ok(),
            named_import: Regex::new(r"^(\s*import\s+)\{\s*([\w$]+)\s*\}(\s+from\s+)").ok(),
        }
    }

    fn fix_specifier(&self, ctx: &RuleContext<'_>, line: &str, spec: &str) -> Option<String> {
        if !spec.starts_with('.') {
            return None;
        }
        let wanted = file_stem(spec).to_lowercase();
        let from_sub_root = ctx.manifest.sub_root_of(ctx.path).unwrap_or_default();
        let mut candidates: Vec<_> = ctx
            .manifest
            .entries()
            .filter(|e| e.path != ctx.path && file_stem(&e.path).to_lowercase() == wanted)
            .collect();
        candidates.sort_by_key(|e| e.sub_root != from_sub_root);
        let target = candidates.first()?;
        let replacement = relative_specifier(ctx.path, &target.path);
        if replacement == spec {
            return None;
        }
        replace_quoted(line, spec, &replacement)
    }

    fn fix_member(&self, ctx: &RuleContext<'_>, line: &str, spec: &str, member: &str, suggestion: Option<&str>) -> Option<String> {
        if let Some(suggestion) = suggestion {
            return Some(rename_identifier(line, member, suggestion, false));
        }
        let module = resolve_module(ctx, spec)?;
        let exports = ctx.symbols.named_exports(&module);
        let lowered = member.to_lowercase();
        if let Some(found) = exports.iter().find(|e| e.to_lowercase() == lowered) {
            return Some(rename_identifier(line, member, found, false));
        }
        if ctx.symbols.default_export(&module) == Some(member) {
            let re = self.named_import.as_ref()?;
            let caps = re.captures(line)?;
            let whole = caps.get(0)?;
            return Some(format!(
                "{}{}{}{}",
                &caps[1],
                &caps[2],
                &caps[3],
                &line[whole.end()..]
            ));
        }
        None
    }

    fn fix_default(&self, ctx: &RuleContext<'_>, line: &str, spec: &str) -> Option<String> {
        let module = resolve_module(ctx, spec)?;
        let re = self.default_import.as_ref()?;
        let caps = re.captures(line)?;
        let local = &caps[2];
        let exports = ctx.symbols.named_exports(&module);
        let specifier = if exports.contains(&local) {
            local.to_string()
        } else if let [only] = exports.as_slice() {
            format!("{} as {}", only, local)
        } else {
            return None;
        };
        let whole = caps.get(0)?;
        Some(format!(
            "{}{{ {} }}{}{}",
            &caps[1],
            specifier,
            &caps[3],
            &line[whole.end()..]
        ))
    }
}

impl Default for UnresolvedImportRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for UnresolvedImportRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::UnresolvedImport
    }

    fn matches(&self, error: &BuildError, _line: &str) -> bool {
        [&self.missing_module, &self.missing_member, &self.no_default]
            .iter()
            .any(|re| re.as_ref().is_some_and(|re| re.is_match(&error.message)))
    }

    fn apply(&self, ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let message = &error.message;
        let fixed = if let Some(caps) = self.missing_member.as_ref().and_then(|re| re.captures(message)) {
            self.fix_member(ctx, line, &caps[1], &caps[2], caps.get(3).map(|m| m.as_str()))
        } else if let Some(caps) = self.no_default.as_ref().and_then(|re| re.captures(message)) {
            self.fix_default(ctx, line, &caps[1])
        } else if let Some(caps) = self.missing_module.as_ref().and_then(|re| re.captures(message)) {
            self.fix_specifier(ctx, line, &caps[1])
        } else {
            None
        };
        fixed.map(RuleFix::Line)
    }
}

pub(crate) fn resolve_module(ctx: &RuleContext<'_>, spec: &str) -> Option<String> {
    resolve_specifier(ctx.manifest, ctx.path, spec)
}

/// Resolve a relative module specifier written in `from_file` to a
/// manifest path.
#[must_use]
pub fn resolve_specifier(manifest: &Manifest, from_file: &str, spec: &str) -> Option<String> {
    if !spec.starts_with('.') {
        return None;
    }
    let joined = join_relative(parent_dir(from_file), spec)?;
    let index = format!("{}/index", joined);
    manifest
        .entries()
        .find(|e| {
            e.path == joined
                || strip_extension(&e.path) == joined
                || strip_extension(&e.path) == index
        })
        .map(|e| e.path.clone())
}

/// Relative import specifier from one project file to another, without
/// the target's extension.
#[must_use]
pub fn relative_specifier(from_file: &str, to_file: &str) -> String {
    let from_dir: Vec<&str> = parent_dir(from_file).split('/').filter(|s| !s.is_empty()).collect();
    let target = strip_extension(to_file);
    let to: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();

    let common = from_dir
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let ups = from_dir.len() - common;
    let rest = to[common..].join("/");
    if ups == 0 {
        format!("./{}", rest)
    } else {
        format!("{}{}", "../".repeat(ups), rest)
    }
}

fn replace_quoted(line: &str, old: &str, new: &str) -> Option<String> {
    for quote in ['\'', '"', '`'] {
        let needle = format!("{q}{old}{q}", q = quote);
        if line.contains(&needle) {
            return Some(line.replacen(&needle, &format!("{q}{new}{q}", q = quote), 1));
        }
    }
    None
}

// ============================================================================
// Missing members
// ============================================================================

fn missing_member_pattern() -> Option<Regex> {
    Regex::new(r"Property '([\w$]+)' does not exist on type '(.+?)'(?:\. Did you mean '([\w$]+)'\?)?").ok()
}

fn calls_member(line: &str, name: &str) -> bool {
    Regex::new(&format!(r"\.\s*{}\s*(?:<[^>]*>)?\s*\(", regex::escape(name)))
        .is_ok_and(|re| re.is_match(&strip_strings(line)))
}

/// Strip `typeof`, generics, nullability and array suffixes from a type name.
fn base_type_name(type_name: &str) -> (String, bool) {
    let is_static = type_name.starts_with("typeof ");
    let name = type_name
        .trim_start_matches("typeof ")
        .split(" | ")
        .next()
        .unwrap_or_default();
    let name = name.split('<').next().unwrap_or_default().trim_end_matches("[]");
    (name.trim().to_string(), is_static)
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

pub struct MissingPropertyRule {
    property: Option<Regex>,
    unknown_name: Option<Regex>,
    object_literal: Option<Regex>,
}

impl MissingPropertyRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            property: missing_member_pattern(),
            unknown_name: Regex::new(r"Cannot find name '([\w$]+)'\. Did you mean '([\w$]+)'\?").ok(),
            object_literal: Regex::new(
                r"Object literal may only specify known properties, and '([\w$]+)' does not exist in type '(.+?)'(?:\. Did you mean to write '([\w$]+)'\?)?",
            )
            .ok(),
        }
    }

    /// Member of the type whose name differs only in case or underscores.
    fn similar_member(decl: &Declaration, name: &str) -> Option<String> {
        let wanted = normalize_name(name);
        let matches: Vec<&str> = decl
            .members
            .iter()
            .filter(|m| m.name != name && normalize_name(&m.name) == wanted)
            .map(|m| m.name.as_str())
            .collect();
        match matches.as_slice() {
            [only] => Some((*only).to_string()),
            _ => None,
        }
    }

    fn rename_key(line: &str, old: &str, new: &str) -> Option<String> {
        let re = Regex::new(&format!(r"(^|[{{,\s]){}(\s*\??\s*:)", regex::escape(old))).ok()?;
        let replaced = re.replace(line, format!("${{1}}{}${{2}}", new).as_str());
        (replaced != line).then(|| replaced.into_owned())
    }
}

impl Default for MissingPropertyRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for MissingPropertyRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::MissingProperty
    }

    fn matches(&self, error: &BuildError, line: &str) -> bool {
        let message = &error.message;
        if let Some(caps) = self.property.as_ref().and_then(|re| re.captures(message)) {
            return caps.get(3).is_some() || !calls_member(line, &caps[1]);
        }
        [&self.unknown_name, &self.object_literal]
            .iter()
            .any(|re| re.as_ref().is_some_and(|re| re.is_match(message)))
    }

    fn apply(&self, ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let message = &error.message;

        if let Some(caps) = self.unknown_name.as_ref().and_then(|re| re.captures(message)) {
            let fixed = rename_identifier(line, &caps[1], &caps[2], false);
            return (fixed != line).then_some(RuleFix::Line(fixed));
        }

        if let Some(caps) = self.object_literal.as_ref().and_then(|re| re.captures(message)) {
            let new = match caps.get(3) {
                Some(s) => s.as_str().to_string(),
                None => {
                    let (type_name, _) = base_type_name(&caps[2]);
                    Self::similar_member(ctx.symbols.lookup(&type_name)?, &caps[1])?
                }
            };
            return Self::rename_key(line, &caps[1], &new).map(RuleFix::Line);
        }

        let caps = self.property.as_ref()?.captures(message)?;
        let new = match caps.get(3) {
            Some(s) => s.as_str().to_string(),
            None => {
                let (type_name, _) = base_type_name(&caps[2]);
                Self::similar_member(ctx.symbols.lookup(&type_name)?, &caps[1])?
            }
        };
        let fixed = rename_identifier(line, &caps[1], &new, true);
        (fixed != line).then_some(RuleFix::Line(fixed))
    }
}

/// Split a method name into its verb family and the remainder.
fn verb_family(name: &str) -> Option<(usize, &str)> {
    let boundary = |rest: &str| rest.is_empty() || rest.starts_with(|c: char| c.is_uppercase());

    for prefix in LIST_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            if boundary(rest) {
                return Some((VERB_GROUPS.len(), rest));
            }
        }
    }
    for (group, verbs) in VERB_GROUPS.iter().enumerate() {
        for verb in verbs.iter() {
            if let Some(rest) = name.strip_prefix(verb) {
                if boundary(rest) {
                    return Some((group, rest));
                }
            }
        }
    }
    None
}

/// Find an existing member that is a synonym of `name`.
///
/// Members in the same verb family with the same remainder win; otherwise a
/// unique member whose remainder extends the requested one (`getUser` →
/// `findUserById`) is accepted.
#[must_use]
pub fn synonym_for<'a>(name: &str, members: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let (group, rest) = verb_family(name)?;
    let rest = rest.to_lowercase();

    let mut exact = Vec::new();
    let mut extended = Vec::new();
    for member in members {
        if member == name {
            return None;
        }
        let Some((member_group, member_rest)) = verb_family(member) else {
            continue;
        };
        if member_group != group {
            continue;
        }
        let member_rest = member_rest.to_lowercase();
        if member_rest == rest {
            exact.push(member);
        } else if member_rest.starts_with(&rest) {
            extended.push(member);
        }
    }

    match (exact.as_slice(), extended.as_slice()) {
        ([only], _) | ([], [only]) => Some((*only).to_string()),
        _ => None,
    }
}

pub struct MissingMethodRule {
    property: Option<Regex>,
}

impl MissingMethodRule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            property: missing_member_pattern(),
        }
    }

    fn stub(decl: &Declaration, method: &str, is_static: bool) -> Option<StubInsertion> {
        let before_line = decl.end_line?;
        let indent = &decl.member_indent;
        let mut lines = Vec::new();
        if !decl.members.is_empty() {
            lines.push(String::new());
        }
        lines.push(format!(
            "{}// eslint-disable-next-line @typescript-eslint/no-explicit-any",
            indent
        ));
        lines.push(format!(
            "{}{}{}(..._args: unknown[]): any {{",
            indent,
            if is_static { "static " } else { "" },
            method
        ));
        lines.push(format!(
            "{}{}throw new Error('{}.{} is not implemented');",
            indent, indent, decl.name, method
        ));
        lines.push(format!("{}}}", indent));

        Some(StubInsertion {
            path: decl.path.clone(),
            type_name: decl.name.clone(),
            method: method.to_string(),
            before_line,
            lines,
        })
    }
}

impl Default for MissingMethodRule {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRule for MissingMethodRule {
    fn class(&self) -> ErrorClass {
        ErrorClass::MissingMethod
    }

    fn matches(&self, error: &BuildError, line: &str) -> bool {
        self.property
            .as_ref()
            .and_then(|re| re.captures(&error.message))
            .is_some_and(|caps| calls_member(line, &caps[1]))
    }

    fn apply(&self, ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix> {
        let caps = self.property.as_ref()?.captures(&error.message)?;
        let method = &caps[1];
        let (type_name, is_static) = base_type_name(&caps[2]);
        let decl = ctx.symbols.lookup(&type_name)?;

        if let Some(found) = synonym_for(method, decl.members.iter().map(|m| m.name.as_str())) {
            debug!("Using existing {}.{} for {}", decl.name, found, method);
            return Some(RuleFix::Line(rename_identifier(line, method, &found, true)));
        }

        if decl.kind != DeclKind::Class || decl.path == ctx.path {
            return None;
        }
        if ctx.manifest.is_protected(&decl.path) {
            debug!(
                "Not synthesizing {}.{}: {} carries prior content",
                decl.name, method, decl.path
            );
            return None;
        }
        Self::stub(decl, method, is_static).map(RuleFix::Stub)
    }
}

// ============================================================================
// Line scanning
// ============================================================================

/// A call expression found on a line. Offsets are byte positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub name: String,
    pub name_start: usize,
    /// Position of `(`.
    pub open: usize,
    /// Position of the matching `)`.
    pub close: usize,
    /// Trimmed argument ranges.
    pub args: Vec<(usize, usize)>,
}

enum Frame {
    Call(usize, usize),
    Group,
    Bracket,
}

const NOT_CALLEES: &[&str] = &["if", "for", "while", "switch", "catch", "function", "return", "typeof"];

/// Find every complete call expression on a line.
#[must_use]
pub fn find_calls(line: &str) -> Vec<CallSite> {
    let masked = strip_strings(line);
    let bytes = masked.as_bytes();
    let mut calls: Vec<CallSite> = Vec::new();
    let mut open: Vec<Option<CallSite>> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                let name_start = masked[..i]
                    .char_indices()
                    .rev()
                    .take_while(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '$')
                    .last()
                    .map_or(i, |(idx, _)| idx);
                let name = &masked[name_start..i];
                if name.is_empty() || NOT_CALLEES.contains(&name) {
                    stack.push(Frame::Group);
                } else {
                    stack.push(Frame::Call(open.len(), i + 1));
                    open.push(Some(CallSite {
                        name: name.to_string(),
                        name_start,
                        open: i,
                        close: i,
                        args: Vec::new(),
                    }));
                }
            }
            b'[' | b'{' => stack.push(Frame::Bracket),
            b']' | b'}' => {
                if matches!(stack.last(), Some(Frame::Bracket)) {
                    stack.pop();
                }
            }
            b',' => {
                if let Some(Frame::Call(slot, arg_start)) = stack.last_mut() {
                    if let Some(Some(call)) = open.get_mut(*slot) {
                        call.args.push(trim_range(&masked, *arg_start, i));
                    }
                    *arg_start = i + 1;
                }
            }
            b')' => match stack.pop() {
                Some(Frame::Call(slot, arg_start)) => {
                    if let Some(mut call) = open.get_mut(slot).and_then(Option::take) {
                        let last = trim_range(&masked, arg_start, i);
                        if last.0 < last.1 || !call.args.is_empty() {
                            call.args.push(last);
                        }
                        call.close = i;
                        calls.push(call);
                    }
                }
                Some(_) | None => {}
            },
            _ => {}
        }
    }

    calls.sort_by_key(|c| c.open);
    calls
}

fn trim_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    (start + lead, (end - trail).max(start + lead))
}

/// Range of the expression starting at byte `start`.
fn expression_at(line: &str, start: usize) -> Option<(usize, usize)> {
    let masked = strip_strings(line);
    if start >= masked.len() || !masked.is_char_boundary(start) {
        return None;
    }
    let mut depth = 0i32;
    let mut end = masked.len();
    for (i, ch) in masked[start..].char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth == 0 => {
                end = start + i;
                break;
            }
            ')' | ']' | '}' => depth -= 1,
            ',' | ';' if depth == 0 => {
                end = start + i;
                break;
            }
            _ => {}
        }
    }
    let range = trim_range(&masked, start, end);
    (range.0 < range.1).then_some(range)
}

/// Range of the value assigned, returned or bound by a line.
fn assignment_rhs(line: &str) -> Option<(usize, usize)> {
    let masked = strip_strings(line);
    let trimmed_start = masked.len() - masked.trim_start().len();

    if masked[trimmed_start..].starts_with("return ") {
        return expression_at(line, trimmed_start + "return ".len());
    }

    let bytes = masked.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = i.checked_sub(1).map(|p| bytes[p]);
                let next = bytes.get(i + 1).copied();
                let compound = prev.is_some_and(|p| b"=!<>+-*/%&|^?".contains(&p));
                if !compound && !matches!(next, Some(b'=') | Some(b'>')) {
                    return expression_at(line, skip_spaces(&masked, i + 1));
                }
            }
            _ => {}
        }
    }

    let key = Regex::new(r#"^\s*[\w$'"]+\s*\??\s*:\s*"#).ok()?;
    let m = key.find(&masked)?;
    expression_at(line, m.end())
}

fn skip_spaces(text: &str, from: usize) -> usize {
    from + text[from..].len() - text[from..].trim_start().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;
    use crate::manifest::{FileRole, Manifest, ManifestEntry, SubRootManifest};
    use crate::patcher::SymbolIndex;
    use crate::workspace::ProjectTree;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        tree: ProjectTree,
        manifest: Manifest,
        symbols: SymbolIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let tree = ProjectTree::open(temp.path()).unwrap();
            tree.write(
                "src/models/User.ts",
                "export interface User {\n  userId: string;\n  created_at: Date;\n}\n",
            )
            .unwrap();
            tree.write(
                "src/services/UserService.ts",
                "export default class UserService {\n  findUserById(id: string) {\n    return id;\n  }\n}\n",
            )
            .unwrap();
            tree.write("src/controllers/UserController.ts", "// placeholder\n").unwrap();
            let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
                "",
                vec![
                    ManifestEntry::new("src/models/User.ts", FileRole::Model),
                    ManifestEntry::new("src/services/UserService.ts", FileRole::Service),
                    ManifestEntry::new("src/controllers/UserController.ts", FileRole::Controller),
                ],
            )]);
            let symbols = SymbolIndex::build(&manifest, &tree);
            Self {
                _temp: temp,
                tree,
                manifest,
                symbols,
            }
        }

        fn ctx(&self) -> RuleContext<'_> {
            RuleContext {
                path: "src/controllers/UserController.ts",
                manifest: &self.manifest,
                symbols: &self.symbols,
                tree: &self.tree,
            }
        }

        fn fix(&self, message: &str, column: Option<u32>, line: &str) -> Option<(ErrorClass, String)> {
            let mut error = BuildError::new(ErrorKind::Type, message)
                .with_location("src/controllers/UserController.ts", 1);
            error.column = column;
            match RuleRegistry::standard().fix(&self.ctx(), &error, line)? {
                (class, RuleFix::Line(text)) => Some((class, text)),
                (_, RuleFix::Stub(_)) => None,
            }
        }
    }

    #[test]
    fn test_standard_registry_order() {
        assert_eq!(RuleRegistry::standard().len(), 6);
        let (class, _) = Fixture::new()
            .fix("Type 'string' is not assignable to type 'Date'.", Some(5), "    createdAt: row.created,")
            .unwrap();
        assert_eq!(class, ErrorClass::DateString);
    }

    #[test]
    fn test_date_string_wraps_property_value() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix("Type 'string' is not assignable to type 'Date'.", Some(5), "    createdAt: row.created_at,")
            .unwrap();
        assert_eq!(class, ErrorClass::DateString);
        assert_eq!(fixed, "    createdAt: new Date(row.created_at),");
    }

    #[test]
    fn test_date_to_string_in_return() {
        let f = Fixture::new();
        let (_, fixed) = f
            .fix("Type 'Date' is not assignable to type 'string'.", Some(5), "    return user.createdAt;")
            .unwrap();
        assert_eq!(fixed, "    return user.createdAt.toISOString();");
    }

    #[test]
    fn test_type_assignment_conversions() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix("Type 'string' is not assignable to type 'number'.", Some(7), "const count: number = req.query.count;")
            .unwrap();
        assert_eq!(class, ErrorClass::TypeAssignment);
        assert_eq!(fixed, "const count: number = Number(req.query.count);");

        let (_, fixed) = f
            .fix(
                "Argument of type 'number' is not assignable to parameter of type 'string'.",
                Some(22),
                "service.findUserById(id + 1, true);",
            )
            .unwrap();
        assert_eq!(fixed, "service.findUserById(String(id + 1), true);");

        let (_, fixed) = f
            .fix("Type 'string | undefined' is not assignable to type 'string'.", Some(7), "const name: string = req.body.name;")
            .unwrap();
        assert_eq!(fixed, "const name: string = req.body.name ?? '';");
    }

    #[test]
    fn test_argument_count() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix("Expected 1 arguments, but got 2.", Some(30), "const u = await service.find(id, extra);")
            .unwrap();
        assert_eq!(class, ErrorClass::ArgumentCount);
        assert_eq!(fixed, "const u = await service.find(id);");

        let (_, fixed) = f
            .fix("Expected 2 arguments, but got 1.", Some(1), "update(id);")
            .unwrap();
        assert_eq!(fixed, "update(id, undefined);");
    }

    #[test]
    fn test_import_specifier_case() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix(
                "Cannot find module '../services/userService' or its corresponding type declarations.",
                None,
                "import UserService from '../services/userService';",
            )
            .unwrap();
        assert_eq!(class, ErrorClass::UnresolvedImport);
        assert_eq!(fixed, "import UserService from '../services/UserService';");
    }

    #[test]
    fn test_named_import_of_default_export() {
        let f = Fixture::new();
        let (_, fixed) = f
            .fix(
                "Module '\"../services/UserService\"' has no exported member 'UserService'.",
                None,
                "import { UserService } from '../services/UserService';",
            )
            .unwrap();
        assert_eq!(fixed, "import UserService from '../services/UserService';");
    }

    #[test]
    fn test_default_import_without_default_export() {
        let f = Fixture::new();
        let (_, fixed) = f
            .fix(
                "Module '\"../models/User\"' has no default export.",
                None,
                "import User from '../models/User';",
            )
            .unwrap();
        assert_eq!(fixed, "import { User } from '../models/User';");
    }

    #[test]
    fn test_missing_property_suggestion_and_similar_member() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix(
                "Property 'usrId' does not exist on type 'User'. Did you mean 'userId'?",
                None,
                "const id = user.usrId;",
            )
            .unwrap();
        assert_eq!(class, ErrorClass::MissingProperty);
        assert_eq!(fixed, "const id = user.userId;");

        let (_, fixed) = f
            .fix("Property 'createdAt' does not exist on type 'User'.", None, "return user.createdAt;")
            .unwrap();
        assert_eq!(fixed, "return user.created_at;");
    }

    #[test]
    fn test_missing_method_synonym() {
        let f = Fixture::new();
        let (class, fixed) = f
            .fix(
                "Property 'getUser' does not exist on type 'UserService'.",
                None,
                "const user = await this.service.getUser(id);",
            )
            .unwrap();
        assert_eq!(class, ErrorClass::MissingMethod);
        assert_eq!(fixed, "const user = await this.service.findUserById(id);");
    }

    #[test]
    fn test_synonym_for() {
        assert_eq!(synonym_for("getUser", ["findUser", "deleteUser"]).as_deref(), Some("findUser"));
        assert_eq!(synonym_for("removeUser", ["deleteUser"]).as_deref(), Some("deleteUser"));
        assert_eq!(synonym_for("getAll", ["list", "findUser"]).as_deref(), Some("list"));
        assert_eq!(synonym_for("getUser", ["findUser", "fetchUser"]), None);
        assert_eq!(synonym_for("getter", ["find"]), None);
        assert_eq!(synonym_for("saveUser", ["updateUser"]), None);
    }

    #[test]
    fn test_find_calls() {
        let calls = find_calls("a(b(1, 2), [3, 4], 'x,)') + c()");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[0].args.len(), 3);
        assert_eq!(calls[1].name, "b");
        assert_eq!(calls[1].args.len(), 2);
        assert_eq!(calls[2].name, "c");
        assert!(calls[2].args.is_empty());
    }

    #[test]
    fn test_relative_specifier() {
        assert_eq!(
            relative_specifier("src/controllers/A.ts", "src/services/B.ts"),
            "../services/B"
        );
        assert_eq!(relative_specifier("src/a.ts", "src/b.ts"), "./b");
        assert_eq!(relative_specifier("a.ts", "lib/x/b.tsx"), "./lib/x/b");
    }
}
