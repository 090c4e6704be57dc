//! Attribution of build errors to files.
//!
//! The mapping set is rebuilt from the current diagnostics every round.
//! Per-file attempt counters and fix history live in the [`FixLedger`],
//! which the session keeps across rounds and copies into each mapping.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::BuildError;
use crate::manifest::{DependencyGraph, Manifest};
use crate::patcher::SurgicalChange;
use crate::propagation::find_usages;
use crate::workspace::{file_name, ProjectTree};

/// One fix attempt against a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub timestamp: DateTime<Utc>,
    /// Short description of what was tried.
    pub summary: String,
    pub success: bool,
}

impl FixRecord {
    pub fn new(summary: impl Into<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            summary: summary.into(),
            success,
        }
    }
}

/// Attempts and history of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFixState {
    pub attempts: u32,
    pub history: Vec<FixRecord>,
}

/// Session-wide record of fix attempts, keyed by path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixLedger {
    files: BTreeMap<String, FileFixState>,
    max_attempts: u32,
}

impl FixLedger {
    /// Create a ledger bounding attempts per file.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            files: BTreeMap::new(),
            max_attempts,
        }
    }

    #[must_use]
    pub fn attempts(&self, path: &str) -> u32 {
        self.files.get(path).map_or(0, |state| state.attempts)
    }

    #[must_use]
    pub fn history(&self, path: &str) -> &[FixRecord] {
        self.files.get(path).map_or(&[], |state| state.history.as_slice())
    }

    /// Whether a file has used all its attempts.
    #[must_use]
    pub fn is_exhausted(&self, path: &str) -> bool {
        self.attempts(path) >= self.max_attempts
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record an attempt. Returns `false` without recording once the file
    /// is out of attempts.
    pub fn record(&mut self, path: &str, record: FixRecord) -> bool {
        if self.is_exhausted(path) {
            warn!("Refusing to record attempt for {}: attempts exhausted", path);
            return false;
        }
        let state = self.files.entry(path.to_string()).or_default();
        state.attempts += 1;
        state.history.push(record);
        true
    }
}

/// Errors and repair context of one file.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFileMapping {
    pub path: String,
    pub errors: Vec<BuildError>,
    /// Errors indexed by 1-indexed line.
    pub errors_by_line: BTreeMap<u32, Vec<BuildError>>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    /// Dependents using a symbol named in this file's errors.
    pub affected_dependents: Vec<String>,
    pub priority: u32,
    pub fix_attempts: u32,
    pub fix_history: Vec<FixRecord>,
    pub surgical_changes: Vec<SurgicalChange>,
}

impl ErrorFileMapping {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn push(&mut self, error: BuildError) {
        if let Some(line) = error.line {
            self.errors_by_line
                .entry(line)
                .or_default()
                .push(error.clone());
        }
        self.errors.push(error);
    }

    /// Errors without a line number.
    pub fn file_level_errors(&self) -> impl Iterator<Item = &BuildError> {
        self.errors.iter().filter(|e| e.line.is_none())
    }

    /// Summary of all errors, one per line.
    #[must_use]
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(BuildError::format)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of mapping one round's diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMap {
    pub files: BTreeMap<String, ErrorFileMapping>,
    /// Errors no file could be determined for.
    pub unattributed: Vec<BuildError>,
}

impl ErrorMap {
    #[must_use]
    pub fn total_errors(&self) -> usize {
        self.files.values().map(|m| m.errors.len()).sum::<usize>() + self.unattributed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_errors() == 0
    }

    pub fn get(&self, path: &str) -> Option<&ErrorFileMapping> {
        self.files.get(path)
    }
}

/// Builds [`ErrorMap`]s against a manifest, its graph and the working tree.
pub struct ErrorMapper<'a> {
    manifest: &'a Manifest,
    graph: &'a DependencyGraph,
    tree: &'a ProjectTree,
}

impl<'a> ErrorMapper<'a> {
    pub fn new(manifest: &'a Manifest, graph: &'a DependencyGraph, tree: &'a ProjectTree) -> Self {
        Self {
            manifest,
            graph,
            tree,
        }
    }

    /// Attribute errors to files and compute per-file context.
    pub fn map(&self, errors: &[BuildError], ledger: &FixLedger) -> ErrorMap {
        let mut map = ErrorMap::default();

        for error in errors {
            match error.file.as_deref().and_then(|f| self.attribute(f)) {
                Some(path) => map
                    .files
                    .entry(path.clone())
                    .or_insert_with(|| ErrorFileMapping::new(&path))
                    .push(error.clone()),
                None => {
                    debug!("Unattributed error: {}", error.format());
                    map.unattributed.push(error.clone());
                }
            }
        }

        for mapping in map.files.values_mut() {
            mapping.dependencies = self.graph.dependencies(&mapping.path).to_vec();
            mapping.dependents = self.graph.dependents(&mapping.path).to_vec();
            mapping.fix_attempts = ledger.attempts(&mapping.path);
            mapping.fix_history = ledger.history(&mapping.path).to_vec();
            mapping.affected_dependents = self.affected_dependents(mapping);
        }

        debug!(
            "Mapped {} errors onto {} files ({} unattributed)",
            map.total_errors(),
            map.files.len(),
            map.unattributed.len()
        );
        map
    }

    /// Resolve a reported project-relative path to the file it names.
    fn attribute(&self, reported: &str) -> Option<String> {
        if self.manifest.contains(reported) || self.tree.exists(reported) {
            return Some(reported.to_string());
        }

        let candidates: Vec<_> = self.manifest.by_file_name(file_name(reported)).collect();
        if let [only] = candidates.as_slice() {
            warn!(
                "Reported path {} not found, attributing to {} by file name",
                reported, only.path
            );
            return Some(only.path.clone());
        }
        None
    }

    /// Dependents whose code uses a symbol named in the file's errors.
    fn affected_dependents(&self, mapping: &ErrorFileMapping) -> Vec<String> {
        let symbols = broken_symbols(&mapping.errors);
        if symbols.is_empty() {
            return Vec::new();
        }

        mapping
            .dependents
            .iter()
            .filter(|dependent| {
                self.tree.read_optional(dependent).is_some_and(|content| {
                    symbols
                        .iter()
                        .any(|symbol| !find_usages(&content, symbol).is_empty())
                })
            })
            .cloned()
            .collect()
    }
}

/// Identifiers quoted in error messages, excluding built-in type names.
#[must_use]
pub fn broken_symbols(errors: &[BuildError]) -> BTreeSet<String> {
    const BUILTINS: &[&str] = &[
        "string", "number", "boolean", "any", "unknown", "void", "never", "null",
        "undefined", "object", "Date", "Promise", "Array", "Record", "this",
    ];
    let Ok(re) = Regex::new(r"'([A-Za-z_$][\w$]*)'") else {
        return BTreeSet::new();
    };
    errors
        .iter()
        .flat_map(|error| {
            re.captures_iter(&error.message)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect::<Vec<_>>()
        })
        .filter(|symbol| !BUILTINS.contains(&symbol.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;
    use crate::manifest::{FileRole, ManifestEntry, SubRootManifest};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, ProjectTree, Manifest) {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write(
            "backend/src/UserService.ts",
            "export class UserService {\n}\n",
        )
        .unwrap();
        tree.write(
            "backend/src/UserController.ts",
            "import { UserService } from './UserService';\nconst s = new UserService();\ns.getUser(1);\n",
        )
        .unwrap();
        let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
            "backend",
            vec![
                ManifestEntry::new("src/UserService.ts", FileRole::Service),
                ManifestEntry::new("src/UserController.ts", FileRole::Controller)
                    .with_dependencies(["./UserService"]),
            ],
        )]);
        (temp, tree, manifest)
    }

    #[test]
    fn test_every_error_lands_in_exactly_one_bucket() {
        let (_temp, tree, manifest) = fixture();
        let graph = DependencyGraph::build(&manifest);
        let mapper = ErrorMapper::new(&manifest, &graph, &tree);

        let errors = vec![
            BuildError::new(ErrorKind::Type, "Property 'getUser' does not exist on type 'UserService'.")
                .with_location("backend/src/UserController.ts", 3),
            BuildError::new(ErrorKind::Lint, "unused").with_location("backend/src/UserController.ts", 1),
            BuildError::new(ErrorKind::Build, "npm ERR! missing script"),
            BuildError::new(ErrorKind::Type, "x").with_file("nowhere/Ghost.ts"),
        ];
        let map = mapper.map(&errors, &FixLedger::new(3));

        assert_eq!(map.total_errors(), errors.len());
        assert_eq!(map.unattributed.len(), 2);
        let controller = map.get("backend/src/UserController.ts").unwrap();
        assert_eq!(controller.errors.len(), 2);
        assert_eq!(controller.errors_by_line.get(&3).map(Vec::len), Some(1));
        assert_eq!(controller.dependencies, vec!["backend/src/UserService.ts".to_string()]);
    }

    #[test]
    fn test_file_name_fallback_requires_unique_match() {
        let (_temp, tree, manifest) = fixture();
        let graph = DependencyGraph::build(&manifest);
        let mapper = ErrorMapper::new(&manifest, &graph, &tree);

        let errors = vec![BuildError::new(ErrorKind::Type, "x").with_location("src/UserService.ts", 1)];
        let map = mapper.map(&errors, &FixLedger::new(3));
        assert!(map.get("backend/src/UserService.ts").is_some());
    }

    #[test]
    fn test_affected_dependents() {
        let (_temp, tree, manifest) = fixture();
        let graph = DependencyGraph::build(&manifest);
        let mapper = ErrorMapper::new(&manifest, &graph, &tree);

        let errors = vec![BuildError::new(ErrorKind::Type, "Property 'getUser' is missing")
            .with_location("backend/src/UserService.ts", 1)];
        let map = mapper.map(&errors, &FixLedger::new(3));
        let service = map.get("backend/src/UserService.ts").unwrap();
        assert_eq!(
            service.affected_dependents,
            vec!["backend/src/UserController.ts".to_string()]
        );
    }

    #[test]
    fn test_ledger_bounds_attempts() {
        let mut ledger = FixLedger::new(2);
        assert!(ledger.record("a.ts", FixRecord::new("rule", false)));
        assert!(ledger.record("a.ts", FixRecord::new("oracle", false)));
        assert!(!ledger.record("a.ts", FixRecord::new("again", false)));
        assert_eq!(ledger.attempts("a.ts"), 2);
        assert!(ledger.is_exhausted("a.ts"));
        assert_eq!(ledger.history("a.ts").len(), 2);
    }

    #[test]
    fn test_broken_symbols_skip_builtins() {
        let errors = vec![BuildError::new(
            ErrorKind::Type,
            "Type 'string' is not assignable to type 'Date'. Did you mean 'createdAt'?",
        )];
        let symbols = broken_symbols(&errors);
        assert_eq!(symbols.into_iter().collect::<Vec<_>>(), vec!["createdAt".to_string()]);
    }
}
