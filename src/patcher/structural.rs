//! File-wide structural passes.
//!
//! These run regardless of which lines carry errors:
//!
//! 1. Import normalization: a default import of a module that only has
//!    named exports becomes a named import, and a named import of a
//!    module's default export becomes a default import.
//! 2. Entity reconciliation: `model` files define the canonical field names
//!    of the project's entities. In files importing an entity, field
//!    spellings that differ only in case or underscores are rewritten to
//!    the canonical spelling.
//!
//! Both passes return replacement lines and never add or remove lines.

use regex::Regex;
use std::collections::{HashMap, HashSet};

use super::rules::resolve_module;
use super::symbols::{strip_strings, MemberKind};
use super::RuleContext;
use crate::manifest::FileRole;

/// Run every pass over the given lines. Returns `(line, new_text)` for each
/// line that changed, 1-indexed.
#[must_use]
pub fn run_passes(ctx: &RuleContext<'_>, lines: &[String]) -> Vec<(u32, String)> {
    let mut current: Vec<String> = lines.to_vec();
    let mut changed: Vec<usize> = Vec::new();

    for (idx, text) in normalize_imports(ctx, &current) {
        current[idx] = text;
        changed.push(idx);
    }
    for (idx, text) in reconcile_entities(ctx, &current) {
        current[idx] = text;
        changed.push(idx);
    }

    changed.sort_unstable();
    changed.dedup();
    changed
        .into_iter()
        .filter(|&idx| current[idx] != lines[idx])
        .map(|idx| (u32::try_from(idx + 1).unwrap_or(u32::MAX), current[idx].clone()))
        .collect()
}

// ============================================================================
// Import normalization
// ============================================================================

struct ImportLine<'l> {
    head: &'l str,
    clause: &'l str,
    tail: &'l str,
    spec: &'l str,
}

fn import_pattern() -> Option<Regex> {
    Regex::new(r#"^(\s*import\s+(?:type\s+)?)(.+?)(\s+from\s+(['"])([^'"]+)['"].*)$"#).ok()
}

fn parse_import<'l>(re: &Regex, line: &'l str) -> Option<ImportLine<'l>> {
    let caps = re.captures(line)?;
    Some(ImportLine {
        head: caps.get(1)?.as_str(),
        clause: caps.get(2)?.as_str(),
        tail: caps.get(3)?.as_str(),
        spec: caps.get(5)?.as_str(),
    })
}

/// Split an import clause into its default binding and named specifiers.
fn split_clause(clause: &str) -> Option<(Option<&str>, Vec<&str>)> {
    let clause = clause.trim();
    if clause.contains('*') {
        return None;
    }
    let (default, named) = match clause.find('{') {
        Some(open) => {
            let close = clause.rfind('}')?;
            let default = clause[..open].trim().trim_end_matches(',').trim();
            let named = clause[open + 1..close]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            (default, named)
        }
        None => (clause, Vec::new()),
    };
    let default = (!default.is_empty()).then_some(default);
    Some((default, named))
}

fn build_clause(default: Option<&str>, named: &[String]) -> String {
    match (default, named.is_empty()) {
        (Some(d), true) => d.to_string(),
        (Some(d), false) => format!("{}, {{ {} }}", d, named.join(", ")),
        (None, _) => format!("{{ {} }}", named.join(", ")),
    }
}

fn normalize_imports(ctx: &RuleContext<'_>, lines: &[String]) -> Vec<(usize, String)> {
    let Some(re) = import_pattern() else {
        return Vec::new();
    };
    let mut out = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let Some(import) = parse_import(&re, line) else {
            continue;
        };
        let Some(module) = resolve_module(ctx, import.spec) else {
            continue;
        };
        if !ctx.symbols.has_file(&module) {
            continue;
        }
        let Some((default, named)) = split_clause(import.clause) else {
            continue;
        };
        let exports = ctx.symbols.named_exports(&module);
        let module_default = ctx.symbols.default_export(&module);

        let mut new_default = default.map(str::to_string);
        let mut new_named: Vec<String> = Vec::new();

        if let Some(local) = default {
            if module_default.is_none() && exports.contains(&local) {
                new_default = None;
                new_named.push(local.to_string());
            }
        }
        for spec in named {
            let imported = spec.split(" as ").next().unwrap_or(spec).trim();
            let is_named = exports.contains(&imported);
            if !is_named && new_default.is_none() && module_default == Some(imported) {
                new_default = Some(spec.split(" as ").last().unwrap_or(spec).trim().to_string());
            } else {
                new_named.push(spec.to_string());
            }
        }

        let clause = build_clause(new_default.as_deref(), &new_named);
        if clause != import.clause.trim() {
            out.push((idx, format!("{}{}{}", import.head, clause, import.tail)));
        }
    }
    out
}

// ============================================================================
// Entity reconciliation
// ============================================================================

/// Canonical field names of the entities defined in `model` files.
#[derive(Debug, Default)]
pub struct EntityTable {
    fields: HashMap<String, Vec<String>>,
}

impl EntityTable {
    #[must_use]
    pub fn build(ctx: &RuleContext<'_>) -> Self {
        let mut table = Self::default();
        for entry in ctx.manifest.entries().filter(|e| e.role == FileRole::Model) {
            for decl in ctx.symbols.declarations_in(&entry.path) {
                if !decl.kind.has_members() {
                    continue;
                }
                let fields: Vec<String> = decl
                    .members
                    .iter()
                    .filter(|m| m.kind == MemberKind::Property)
                    .map(|m| m.name.clone())
                    .collect();
                if !fields.is_empty() {
                    table.fields.insert(decl.name.clone(), fields);
                }
            }
        }
        table
    }

    #[must_use]
    pub fn fields(&self, entity: &str) -> Option<&[String]> {
        self.fields.get(entity).map(Vec::as_slice)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn canonical_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether the nearest unclosed bracket before `pos` is a parenthesis.
fn inside_parens(masked: &str, pos: usize) -> bool {
    let mut depth = 0i32;
    for ch in masked[..pos].chars().rev() {
        match ch {
            ')' | ']' | '}' => depth += 1,
            '(' | '[' | '{' if depth > 0 => depth -= 1,
            '(' => return true,
            '[' | '{' => return false,
            _ => {}
        }
    }
    false
}

fn reconcile_entities(ctx: &RuleContext<'_>, lines: &[String]) -> Vec<(usize, String)> {
    let table = EntityTable::build(ctx);
    if table.is_empty() {
        return Vec::new();
    }
    let Some(import_re) = import_pattern() else {
        return Vec::new();
    };

    // Entities this file imports.
    let mut imported: Vec<&str> = Vec::new();
    for line in lines {
        if let Some(import) = parse_import(&import_re, line) {
            imported.extend(table.fields.keys().map(String::as_str).filter(|name| {
                import
                    .clause
                    .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                    .any(|word| word == *name)
            }));
        }
    }
    if imported.is_empty() {
        return Vec::new();
    }

    let mut canonical: HashMap<String, Option<String>> = HashMap::new();
    for entity in &imported {
        for field in table.fields(entity).unwrap_or_default() {
            canonical
                .entry(canonical_key(field))
                .and_modify(|existing| {
                    if existing.as_deref() != Some(field.as_str()) {
                        *existing = None;
                    }
                })
                .or_insert_with(|| Some(field.clone()));
        }
    }
    let known: HashSet<&str> = ctx
        .symbols
        .iter()
        .flat_map(|d| d.members.iter().map(|m| m.name.as_str()))
        .collect();

    let (Ok(access), Ok(key)) = (
        Regex::new(r"\.\s*([A-Za-z_$][\w$]*)\b"),
        Regex::new(r"(?:^|[{,\s])([A-Za-z_$][\w$]*)\s*\??\s*:"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if parse_import(&import_re, line).is_some() {
            continue;
        }
        let masked = strip_strings(line);
        let mut renames: Vec<(usize, usize, String)> = Vec::new();

        let mut consider = |start: usize, end: usize| {
            let word = &line[start..end];
            if known.contains(word) {
                return;
            }
            if let Some(Some(field)) = canonical.get(&canonical_key(word)) {
                if field != word {
                    renames.push((start, end, field.clone()));
                }
            }
        };

        for caps in access.captures_iter(&masked) {
            let Some(name) = caps.get(1) else { continue };
            if masked[name.end()..].trim_start().starts_with('(') {
                continue;
            }
            consider(name.start(), name.end());
        }
        for caps in key.captures_iter(&masked) {
            let Some(name) = caps.get(1) else { continue };
            if inside_parens(&masked, name.start()) || masked[..name.start()].trim_end().ends_with('?') {
                continue;
            }
            consider(name.start(), name.end());
        }

        if renames.is_empty() {
            continue;
        }
        renames.sort_by_key(|r| r.0);
        renames.dedup_by_key(|r| r.0);
        let mut fixed = String::with_capacity(line.len());
        let mut last = 0;
        for (start, end, field) in renames {
            fixed.push_str(&line[last..start]);
            fixed.push_str(&field);
            last = end;
        }
        fixed.push_str(&line[last..]);
        out.push((idx, fixed));
    }
    out
}
