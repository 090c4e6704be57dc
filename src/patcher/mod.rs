//! Deterministic line-level repair of known error classes.
//!
//! - [`rules`] - One [`LineRule`] per error class
//! - [`structural`] - File-wide import and entity-shape passes
//! - [`symbols`] - Declaration index the rules consult
//!
//! # Flow
//!
//! ```text
//! errors_by_line ──> RuleRegistry (first matching rule wins)
//!        │                  │
//!        │                  ├── line replacement ──> SurgicalChange
//!        │                  └── method stub ──────> StubInsertion (other file)
//!        │
//!        └──> structural passes ──> SurgicalChange
//! ```
//!
//! Changes never add or remove lines in the patched file. Files carrying
//! prior content only have their error lines touched.

pub mod rules;
pub mod structural;
pub mod symbols;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::diagnostics::{BuildError, ErrorFileMapping};
use crate::error::Result;
use crate::manifest::Manifest;
use crate::workspace::{FileLines, ProjectTree};

pub use rules::RuleRegistry;
pub use symbols::SymbolIndex;

/// A single in-place line replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurgicalChange {
    /// 1-indexed line.
    pub line: u32,
    pub original_text: String,
    pub fixed_text: String,
    /// Formatted errors that caused the change.
    pub triggering_errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SurgicalChange {
    pub fn new(
        line: u32,
        original_text: impl Into<String>,
        fixed_text: impl Into<String>,
        triggering_errors: Vec<String>,
    ) -> Self {
        Self {
            line,
            original_text: original_text.into(),
            fixed_text: fixed_text.into(),
            triggering_errors,
            timestamp: Utc::now(),
        }
    }
}

/// Error classes the deterministic layer knows how to repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    DateString,
    TypeAssignment,
    MissingProperty,
    ArgumentCount,
    UnresolvedImport,
    MissingMethod,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DateString => "date/string mismatch",
            Self::TypeAssignment => "type-assignment mismatch",
            Self::MissingProperty => "missing property",
            Self::ArgumentCount => "argument-count mismatch",
            Self::UnresolvedImport => "unresolved import/export",
            Self::MissingMethod => "missing method",
        };
        f.write_str(name)
    }
}

/// A method stub to insert into the file defining a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubInsertion {
    pub path: String,
    pub type_name: String,
    pub method: String,
    /// Line of the closing brace the stub goes above.
    pub before_line: u32,
    pub lines: Vec<String>,
}

/// What a rule proposes for one error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFix {
    /// Replace the error line.
    Line(String),
    /// Add a method to another file.
    Stub(StubInsertion),
}

/// Read-only view rules work against.
pub struct RuleContext<'a> {
    pub path: &'a str,
    pub manifest: &'a Manifest,
    pub symbols: &'a SymbolIndex,
    pub tree: &'a ProjectTree,
}

/// A `{matcher → fix}` strategy for one error class.
pub trait LineRule: Send + Sync {
    fn class(&self) -> ErrorClass;

    /// Whether the rule recognises the error on this line.
    fn matches(&self, error: &BuildError, line: &str) -> bool;

    /// Propose a fix, or `None` when the rule cannot help after all.
    fn apply(&self, ctx: &RuleContext<'_>, error: &BuildError, line: &str) -> Option<RuleFix>;
}

/// Result of patching one file.
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    pub changes: Vec<SurgicalChange>,
    pub stubs: Vec<StubInsertion>,
    /// Error classes that produced a fix.
    pub classes: Vec<ErrorClass>,
}

impl PatchOutcome {
    /// Patching succeeds only when something changed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.changes.is_empty() || !self.stubs.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let mut classes: Vec<String> = self.classes.iter().map(ToString::to_string).collect();
        classes.dedup();
        format!(
            "surgical: {} line change(s), {} stub(s) [{}]",
            self.changes.len(),
            self.stubs.len(),
            classes.join(", ")
        )
    }
}

/// Applies the rule registry and structural passes to a file.
pub struct SurgicalPatcher {
    registry: RuleRegistry,
}

impl Default for SurgicalPatcher {
    fn default() -> Self {
        Self::new(RuleRegistry::standard())
    }
}

impl SurgicalPatcher {
    pub fn new(registry: RuleRegistry) -> Self {
        Self { registry }
    }

    /// Compute changes for a file's errors without writing anything.
    pub fn patch(&self, ctx: &RuleContext<'_>, mapping: &ErrorFileMapping) -> Result<PatchOutcome> {
        let content = ctx.tree.read(ctx.path)?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let original = lines.clone();
        let mut triggers: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut outcome = PatchOutcome::default();

        for (&line_no, errors) in &mapping.errors_by_line {
            let Some(idx) = (line_no as usize).checked_sub(1) else {
                continue;
            };
            if idx >= lines.len() {
                debug!("{}:{} is past the end of the file", ctx.path, line_no);
                continue;
            }
            for error in errors {
                let current = lines[idx].clone();
                let Some((class, fix)) = self.registry.fix(ctx, error, &current) else {
                    continue;
                };
                match fix {
                    RuleFix::Line(text) if text != current => {
                        debug!("{}:{} {} -> {:?}", ctx.path, line_no, class, text);
                        lines[idx] = text;
                        triggers.entry(line_no).or_default().push(error.format());
                        outcome.classes.push(class);
                    }
                    RuleFix::Line(_) => {}
                    RuleFix::Stub(stub) => {
                        if !outcome
                            .stubs
                            .iter()
                            .any(|s| s.path == stub.path && s.method == stub.method)
                        {
                            outcome.stubs.push(stub);
                            outcome.classes.push(class);
                        }
                    }
                }
            }
        }

        let restrict_to_error_lines = ctx.manifest.is_protected(ctx.path);
        let error_lines: Vec<u32> = mapping.errors_by_line.keys().copied().collect();
        for (line_no, text) in structural::run_passes(ctx, &lines) {
            if restrict_to_error_lines && !error_lines.contains(&line_no) {
                continue;
            }
            let Some(idx) = (line_no as usize).checked_sub(1) else {
                continue;
            };
            if lines.get(idx).is_some_and(|current| *current != text) {
                lines[idx] = text;
                triggers
                    .entry(line_no)
                    .or_default()
                    .push("structural normalization".to_string());
            }
        }

        for (line_no, reasons) in triggers {
            let idx = line_no as usize - 1;
            if original[idx] != lines[idx] {
                outcome.changes.push(SurgicalChange::new(
                    line_no,
                    original[idx].clone(),
                    lines[idx].clone(),
                    reasons,
                ));
            }
        }

        Ok(outcome)
    }
}

/// Insert stubs into their files, bottom-up per file so line numbers from
/// the index stay valid. Returns the paths written.
pub fn apply_stubs(tree: &ProjectTree, manifest: &Manifest, stubs: &[StubInsertion]) -> Result<Vec<String>> {
    let mut by_file: BTreeMap<&str, Vec<&StubInsertion>> = BTreeMap::new();
    for stub in stubs {
        if manifest.is_protected(&stub.path) {
            warn!("Not inserting stub into protected file {}", stub.path);
            continue;
        }
        by_file.entry(stub.path.as_str()).or_default().push(stub);
    }

    let mut written = Vec::new();
    for (path, mut file_stubs) in by_file {
        let content = tree.read(path)?;
        let mut lines = FileLines::parse(&content);
        file_stubs.sort_by(|a, b| b.before_line.cmp(&a.before_line));

        for stub in file_stubs {
            let member_pattern = format!(r"^\s*(?:\w+\s+)*{}\s*\(", regex::escape(&stub.method));
            let exists = Regex::new(&member_pattern)
                .map(|re| lines.iter().any(|l| re.is_match(l)))
                .unwrap_or(false);
            if exists {
                debug!("{} already defines {}", path, stub.method);
                continue;
            }
            let at = (stub.before_line as usize).saturating_sub(1).min(lines.len());
            for (offset, line) in stub.lines.iter().enumerate() {
                lines.insert(at + offset, line.clone());
            }
        }

        let updated = lines.render();
        if updated != content {
            tree.write(path, &updated)?;
            written.push(path.to_string());
        }
    }
    Ok(written)
}

/// Rename an identifier on a line.
///
/// With `members_only`, only property accesses (`.old`) are renamed;
/// otherwise every whole-word occurrence outside string literals is.
#[must_use]
pub fn rename_identifier(line: &str, old: &str, new: &str, members_only: bool) -> String {
    let pattern = if members_only {
        format!(r"(\.\s*){}\b", regex::escape(old))
    } else {
        format!(r"(^|[^\w$.]|\.\s*){}\b", regex::escape(old))
    };
    let Ok(re) = Regex::new(&pattern) else {
        return line.to_string();
    };
    let masked = symbols::strip_strings(line);

    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for caps in re.captures_iter(&masked) {
        let (Some(whole), Some(prefix)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name_start = prefix.end();
        if line[whole.end()..].starts_with('$') {
            continue;
        }
        out.push_str(&line[last..name_start]);
        out.push_str(new);
        last = whole.end();
    }
    out.push_str(&line[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{ErrorKind, ErrorMapper, FixLedger};
    use crate::manifest::{DependencyGraph, FileRole, ManifestEntry, SubRootManifest};
    use tempfile::TempDir;

    #[test]
    fn test_rename_identifier() {
        assert_eq!(rename_identifier("a.foo(); foo();", "foo", "bar", true), "a.bar(); foo();");
        assert_eq!(
            rename_identifier("import { foo } from './a'; foo(1); x.foo; fooBar", "foo", "bar", false),
            "import { bar } from './a'; bar(1); x.bar; fooBar"
        );
        assert_eq!(rename_identifier("log('foo')", "foo", "bar", false), "log('foo')");
    }

    fn setup(service_protected: bool) -> (TempDir, ProjectTree, Manifest) {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write(
            "src/UserService.ts",
            "export class UserService {\n  findUser(id: string) {\n    return id;\n  }\n}\n",
        )
        .unwrap();
        tree.write(
            "src/UserController.ts",
            "import { UserService } from './UserService';\nconst service = new UserService();\nexport const show = (id: string) => service.getUser(id);\nexport const list = () => service.getAll();\n",
        )
        .unwrap();
        let mut service = ManifestEntry::new("src/UserService.ts", FileRole::Service);
        if service_protected {
            service = service.with_existing_content();
        }
        let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
            "",
            vec![
                service,
                ManifestEntry::new("src/UserController.ts", FileRole::Controller)
                    .with_dependencies(["./UserService"]),
            ],
        )]);
        (temp, tree, manifest)
    }

    fn patch(tree: &ProjectTree, manifest: &Manifest, errors: Vec<BuildError>) -> PatchOutcome {
        let graph = DependencyGraph::build(manifest);
        let map = ErrorMapper::new(manifest, &graph, tree).map(&errors, &FixLedger::new(3));
        let symbols = SymbolIndex::build(manifest, tree);
        let ctx = RuleContext {
            path: "src/UserController.ts",
            manifest,
            symbols: &symbols,
            tree,
        };
        SurgicalPatcher::default()
            .patch(&ctx, map.get("src/UserController.ts").unwrap())
            .unwrap()
    }

    #[test]
    fn test_synonym_rename_preferred_over_stub() {
        let (_temp, tree, manifest) = setup(false);
        let outcome = patch(
            &tree,
            &manifest,
            vec![BuildError::new(
                ErrorKind::Type,
                "Property 'getUser' does not exist on type 'UserService'.",
            )
            .with_location("src/UserController.ts", 3)],
        );
        assert_eq!(outcome.changes.len(), 1);
        assert!(outcome.changes[0].fixed_text.contains("service.findUser(id)"));
        assert!(outcome.stubs.is_empty());
    }

    #[test]
    fn test_stub_synthesis_and_application() {
        let (_temp, tree, manifest) = setup(false);
        let outcome = patch(
            &tree,
            &manifest,
            vec![BuildError::new(
                ErrorKind::Type,
                "Property 'getAll' does not exist on type 'UserService'.",
            )
            .with_location("src/UserController.ts", 4)],
        );
        assert!(outcome.is_success());
        assert_eq!(outcome.stubs.len(), 1);

        let written = apply_stubs(&tree, &manifest, &outcome.stubs).unwrap();
        assert_eq!(written, vec!["src/UserService.ts".to_string()]);
        let service = tree.read("src/UserService.ts").unwrap();
        assert!(service.contains("  getAll("));
        assert!(service.trim_end().ends_with('}'));

        // A second application is a no-op.
        assert!(apply_stubs(&tree, &manifest, &outcome.stubs).unwrap().is_empty());
    }

    #[test]
    fn test_stub_insertion_keeps_crlf() {
        let (_temp, tree, manifest) = setup(false);
        tree.write(
            "src/UserService.ts",
            "export class UserService {\r\n  findUser(id: string) {\r\n    return id;\r\n  }\r\n}\r\n",
        )
        .unwrap();
        let stub = StubInsertion {
            path: "src/UserService.ts".to_string(),
            type_name: "UserService".to_string(),
            method: "getAll".to_string(),
            before_line: 5,
            lines: vec!["  getAll(..._args: unknown[]): any {".to_string(), "  }".to_string()],
        };

        apply_stubs(&tree, &manifest, &[stub]).unwrap();

        assert_eq!(
            tree.read("src/UserService.ts").unwrap(),
            "export class UserService {\r\n  findUser(id: string) {\r\n    return id;\r\n  }\r\n  getAll(..._args: unknown[]): any {\r\n  }\r\n}\r\n"
        );
    }

    #[test]
    fn test_no_stub_into_protected_file() {
        let (_temp, tree, manifest) = setup(true);
        let outcome = patch(
            &tree,
            &manifest,
            vec![BuildError::new(
                ErrorKind::Type,
                "Property 'getAll' does not exist on type 'UserService'.",
            )
            .with_location("src/UserController.ts", 4)],
        );
        assert!(!outcome.is_success());
    }
}
