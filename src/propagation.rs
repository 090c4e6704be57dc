//! Propagation of symbol changes to dependent files.
//!
//! After a file changes, the symbols it no longer provides are derived by
//! token-diffing each [`SurgicalChange`] (or, for regenerated files, by
//! diffing the declared surface before and after). Dependents are scanned
//! for direct, property-access and call-site usages. Renames are applied
//! by rule; usages of removed symbols get a single-line oracle request
//! built from a [`ContextWindow`].

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manifest::{DependencyGraph, Manifest};
use crate::oracle::{FixOracleAdapter, FixRequest, OracleOutcome};
use crate::patcher::rules::resolve_specifier;
use crate::patcher::symbols::strip_strings;
use crate::patcher::{rename_identifier, SurgicalChange, SymbolIndex};
use crate::workspace::ProjectTree;

/// TypeScript keywords never treated as symbols.
const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "case", "catch", "class", "const", "continue", "default",
    "delete", "else", "enum", "export", "extends", "false", "finally", "for", "from", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null", "of",
    "private", "protected", "public", "readonly", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "type", "typeof", "undefined", "var", "void", "while",
];

// ============================================================================
// Usage scanning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Bare reference: `foo`, `import { foo }`.
    Direct,
    /// `x.foo`
    PropertyAccess,
    /// `foo(...)` or `x.foo(...)`
    CallSite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    /// 1-indexed line.
    pub line: u32,
    pub kind: UsageKind,
    pub text: String,
}

/// Every usage of `symbol` in `content`, ignoring string literals and line
/// comments.
#[must_use]
pub fn find_usages(content: &str, symbol: &str) -> Vec<Usage> {
    let Ok(re) = Regex::new(&format!(r"(^|[^\w$])({})\b", regex::escape(symbol))) else {
        return Vec::new();
    };
    let mut usages = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let masked = strip_strings(line);
        for caps in re.captures_iter(&masked) {
            let Some(name) = caps.get(2) else { continue };
            if masked[name.end()..].starts_with('$') {
                continue;
            }
            let accessed = masked[..name.start()].trim_end().ends_with('.');
            let called = masked[name.end()..].trim_start().starts_with('(');
            let kind = match (accessed, called) {
                (_, true) => UsageKind::CallSite,
                (true, false) => UsageKind::PropertyAccess,
                (false, false) => UsageKind::Direct,
            };
            usages.push(Usage {
                line: u32::try_from(idx + 1).unwrap_or(u32::MAX),
                kind,
                text: line.to_string(),
            });
        }
    }
    usages
}

// ============================================================================
// Affected symbols
// ============================================================================

/// A symbol a changed file no longer provides under its old name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AffectedSymbol {
    Renamed { from: String, to: String },
    Removed { name: String },
}

impl AffectedSymbol {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Renamed { from, .. } => from,
            Self::Removed { name } => name,
        }
    }
}

fn identifiers(text: &str) -> BTreeSet<String> {
    let masked = strip_strings(text);
    let Ok(re) = Regex::new(r"[A-Za-z_$][\w$]*") else {
        return BTreeSet::new();
    };
    re.find_iter(&masked)
        .map(|m| m.as_str().to_string())
        .filter(|word| !KEYWORDS.contains(&word.as_str()))
        .collect()
}

/// Token diff of one line edit.
///
/// One identifier swapped for another is a rename; identifiers that only
/// disappear are removals. Pure additions affect nothing.
#[must_use]
pub fn diff_line(original: &str, fixed: &str) -> Vec<AffectedSymbol> {
    let before = identifiers(original);
    let after = identifiers(fixed);
    let removed: Vec<&String> = before.difference(&after).collect();
    let added: Vec<&String> = after.difference(&before).collect();

    match (removed.as_slice(), added.as_slice()) {
        ([], _) => Vec::new(),
        ([from], [to]) => vec![AffectedSymbol::Renamed {
            from: (*from).clone(),
            to: (*to).clone(),
        }],
        (removed, _) => removed
            .iter()
            .map(|name| AffectedSymbol::Removed {
                name: (*name).clone(),
            })
            .collect(),
    }
}

/// Names a file provides: its declarations and their members.
#[must_use]
pub fn declared_surface(index: &SymbolIndex, path: &str) -> BTreeSet<String> {
    index
        .declarations_in(path)
        .flat_map(|d| {
            std::iter::once(d.name.clone()).chain(d.members.iter().map(|m| m.name.clone()))
        })
        .collect()
}

// ============================================================================
// Context windows
// ============================================================================

/// A usage line with its surroundings and enclosing declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    pub path: String,
    /// 1-indexed target line.
    pub line: u32,
    pub target: String,
    /// First line number shown in `lines`.
    pub start: u32,
    pub lines: Vec<String>,
    /// Nearest declaration above the target, when outside the window.
    pub enclosing: Option<(u32, String)>,
}

fn declaration_pattern() -> Option<Regex> {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:(?:abstract|async|public|private|protected|static|readonly)\s+)*(?:(?:class|interface|function\*?|enum)\s+[A-Za-z_$]|(?:const|let)\s+[A-Za-z_$][\w$]*\s*=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]*)?=>|[A-Za-z_$][\w$]*\s*(?:<[^>]*>)?\s*\([^)]*\)\s*(?::[^{]*)?\{\s*$)",
    )
    .ok()
}

const CONTROL_WORDS: &[&str] = &["if", "for", "while", "switch", "catch", "with", "return"];

impl ContextWindow {
    /// Build the window around a 1-indexed line.
    #[must_use]
    pub fn around(path: &str, lines: &[String], line: u32, radius: usize) -> Option<Self> {
        let idx = (line as usize).checked_sub(1)?;
        let target = lines.get(idx)?.clone();
        let first = idx.saturating_sub(radius);
        let last = (idx + radius).min(lines.len().saturating_sub(1));

        let enclosing = declaration_pattern().and_then(|re| {
            lines[..idx]
                .iter()
                .enumerate()
                .rev()
                .find(|(_, l)| {
                    let word = l.trim_start().split(|c: char| !c.is_alphanumeric()).next().unwrap_or_default();
                    re.is_match(l) && !CONTROL_WORDS.contains(&word)
                })
                .filter(|(i, _)| *i < first)
                .map(|(i, l)| (u32::try_from(i + 1).unwrap_or(u32::MAX), l.clone()))
        });

        Some(Self {
            path: path.to_string(),
            line,
            target,
            start: u32::try_from(first + 1).unwrap_or(u32::MAX),
            lines: lines[first..=last].to_vec(),
            enclosing,
        })
    }

    /// Numbered listing with the target line marked.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        if let Some((line, text)) = &self.enclosing {
            out.push(format!("  {:>5} | {}", line, text));
            out.push("        | ...".to_string());
        }
        for (offset, text) in self.lines.iter().enumerate() {
            let number = self.start + u32::try_from(offset).unwrap_or(0);
            let marker = if number == self.line { '>' } else { ' ' };
            out.push(format!("{} {:>5} | {}", marker, number, text));
        }
        out.join("\n")
    }
}

// ============================================================================
// Propagator
// ============================================================================

/// Changes made to dependents for one changed file.
#[derive(Debug, Clone, Default)]
pub struct PropagationOutcome {
    pub changes: BTreeMap<String, Vec<SurgicalChange>>,
    pub logs: Vec<String>,
}

impl PropagationOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn merge(&mut self, other: PropagationOutcome) {
        for (path, changes) in other.changes {
            self.changes.entry(path).or_default().extend(changes);
        }
        self.logs.extend(other.logs);
    }
}

pub struct DependentPropagator<'a> {
    tree: &'a ProjectTree,
    manifest: &'a Manifest,
    graph: &'a DependencyGraph,
    /// Symbol index from before the round's edits.
    before: &'a SymbolIndex,
    radius: usize,
    oracle: Option<&'a FixOracleAdapter<'a>>,
}

impl<'a> DependentPropagator<'a> {
    pub fn new(
        tree: &'a ProjectTree,
        manifest: &'a Manifest,
        graph: &'a DependencyGraph,
        before: &'a SymbolIndex,
        radius: usize,
    ) -> Self {
        Self {
            tree,
            manifest,
            graph,
            before,
            radius,
            oracle: None,
        }
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: &'a FixOracleAdapter<'a>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Symbols a file stopped providing through its line changes.
    #[must_use]
    pub fn affected_by_changes(&self, path: &str, changes: &[SurgicalChange]) -> Vec<AffectedSymbol> {
        let surface = declared_surface(self.before, path);
        let affected: BTreeSet<AffectedSymbol> = changes
            .iter()
            .flat_map(|c| diff_line(&c.original_text, &c.fixed_text))
            .filter(|symbol| surface.contains(symbol.name()))
            .collect();
        affected.into_iter().collect()
    }

    /// Symbols a rewritten file stopped providing, from its new content.
    #[must_use]
    pub fn affected_by_rewrite(&self, path: &str, content: &str) -> Vec<AffectedSymbol> {
        let before = declared_surface(self.before, path);
        let after_index = SymbolIndex::from_sources([(path.to_string(), content.to_string())]);
        let after = declared_surface(&after_index, path);
        let removed: Vec<&String> = before.difference(&after).collect();
        let added: Vec<&String> = after.difference(&before).collect();
        match (removed.as_slice(), added.as_slice()) {
            ([from], [to]) => vec![AffectedSymbol::Renamed {
                from: (*from).clone(),
                to: (*to).clone(),
            }],
            (removed, _) => removed
                .iter()
                .map(|name| AffectedSymbol::Removed {
                    name: (*name).clone(),
                })
                .collect(),
        }
    }

    /// Update every dependent of `path` that uses an affected symbol.
    ///
    /// # Errors
    ///
    /// Fails on write errors and fatal oracle conditions.
    pub async fn propagate(&self, path: &str, affected: &[AffectedSymbol]) -> Result<PropagationOutcome> {
        let mut outcome = PropagationOutcome::default();
        if affected.is_empty() {
            debug!("No symbol of {} changed, nothing to propagate", path);
            return Ok(outcome);
        }

        for dependent in self.graph.dependents(path) {
            outcome.merge(self.propagate_to(path, dependent, affected).await?);
        }
        Ok(outcome)
    }

    async fn propagate_to(
        &self,
        source: &str,
        dependent: &str,
        affected: &[AffectedSymbol],
    ) -> Result<PropagationOutcome> {
        let mut outcome = PropagationOutcome::default();
        let Some(content) = self.tree.read_optional(dependent) else {
            warn!("Dependent {} of {} is missing, skipping", dependent, source);
            return Ok(outcome);
        };
        let original: Vec<String> = content.lines().map(str::to_string).collect();
        let mut lines = original.clone();
        let mut reasons: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for symbol in affected {
            let usages = find_usages(&content, symbol.name());
            if usages.is_empty() {
                continue;
            }
            match symbol {
                AffectedSymbol::Renamed { from, to } => {
                    let by_name = self.imports_by_name(dependent, source, &original, from);
                    let reason = format!("propagated rename {} -> {} from {}", from, to, source);
                    for usage in &usages {
                        let idx = usage.line as usize - 1;
                        let renamed = rename_identifier(&lines[idx], from, to, !by_name);
                        if renamed != lines[idx] {
                            lines[idx] = renamed;
                            reasons.entry(idx).or_default().push(reason.clone());
                        }
                    }
                }
                AffectedSymbol::Removed { name } => {
                    let Some(adapter) = self.oracle.filter(|a| a.is_available()) else {
                        outcome.logs.push(format!(
                            "{} still uses {} removed from {}; no oracle to update it",
                            dependent, name, source
                        ));
                        continue;
                    };
                    let mut seen = BTreeSet::new();
                    for usage in usages.iter().filter(|u| seen.insert(u.line)) {
                        if usage.text.trim_start().starts_with("import ") {
                            outcome.logs.push(format!(
                                "{}:{} imports {} removed from {}",
                                dependent, usage.line, name, source
                            ));
                            continue;
                        }
                        let Some(window) = ContextWindow::around(dependent, &lines, usage.line, self.radius) else {
                            continue;
                        };
                        let summary = format!(
                            "`{}` is no longer provided by {}; update line {} of {} accordingly.",
                            name, source, usage.line, dependent
                        );
                        let request = FixRequest::targeted(&window, summary, self.manifest.summary());
                        match adapter.request(&request).await? {
                            OracleOutcome::Response(response) => {
                                if let Some(line) = response.single_line(dependent) {
                                    let idx = usage.line as usize - 1;
                                    if line != lines[idx] {
                                        lines[idx] = line;
                                        reasons
                                            .entry(idx)
                                            .or_default()
                                            .push(format!("propagated removal of {} from {}", name, source));
                                    }
                                }
                            }
                            OracleOutcome::Failed(reason) => outcome.logs.push(format!(
                                "Could not update {}:{} for removed {}: {}",
                                dependent, usage.line, name, reason
                            )),
                        }
                    }
                }
            }
        }

        let changes: Vec<SurgicalChange> = reasons
            .into_iter()
            .filter(|(idx, _)| original[*idx] != lines[*idx])
            .map(|(idx, why)| {
                SurgicalChange::new(
                    u32::try_from(idx + 1).unwrap_or(u32::MAX),
                    original[idx].clone(),
                    lines[idx].clone(),
                    why,
                )
            })
            .collect();
        if changes.is_empty() {
            return Ok(outcome);
        }

        self.tree.apply_changes(dependent, &changes)?;
        info!(
            "Propagated {} change(s) from {} into {}",
            changes.len(),
            source,
            dependent
        );
        outcome.logs.push(format!(
            "Propagated {} line change(s) from {} into {}",
            changes.len(),
            source,
            dependent
        ));
        outcome.changes.insert(dependent.to_string(), changes);
        Ok(outcome)
    }

    /// Whether `dependent` imports `name` by name from `source`.
    fn imports_by_name(&self, dependent: &str, source: &str, lines: &[String], name: &str) -> bool {
        let Ok(re) = Regex::new(r#"^\s*import\s+(.+?)\s+from\s+['"]([^'"]+)['"]"#) else {
            return false;
        };
        lines.iter().filter_map(|l| re.captures(l)).any(|caps| {
            resolve_specifier(self.manifest, dependent, &caps[2]).as_deref() == Some(source)
                && caps[1]
                    .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                    .any(|word| word == name)
        })
    }
}
