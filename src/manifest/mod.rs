//! Project manifest: the declared files, their symbolic dependencies and
//! metadata, grouped by independently buildable sub-root.
//!
//! - [`graph`] - Dependency graph resolution over manifest entries
//!
//! The manifest is read from `<project>/.fixloop/manifest.json`:
//!
//! ```json
//! {
//!   "subRoots": [
//!     {
//!       "root": "backend",
//!       "files": [
//!         { "path": "src/services/UserService.ts", "role": "service" },
//!         {
//!           "path": "src/controllers/UserController.ts",
//!           "dependencies": ["UserService"],
//!           "role": "controller",
//!           "hasExistingContent": true
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Entry paths are written relative to their sub-root and normalized to
//! project-relative paths on load.

pub mod graph;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::FixloopConfig;
use crate::error::{FixloopError, Result};
use crate::workspace::{file_name, join_relative, normalize_relative};

pub use graph::{DependencyGraph, GraphNode, UnresolvedReference};

/// Structural role of a file in the generated project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Model,
    Service,
    Controller,
    Repository,
    Config,
    Route,
    Middleware,
    Component,
    Page,
    Util,
    Test,
    #[default]
    #[serde(other)]
    Other,
}

impl FileRole {
    /// Core files are structurally central and get scheduling priority.
    #[must_use]
    pub fn is_core(&self) -> bool {
        matches!(
            self,
            Self::Model | Self::Service | Self::Controller | Self::Repository | Self::Config
        )
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Model => "model",
            Self::Service => "service",
            Self::Controller => "controller",
            Self::Repository => "repository",
            Self::Config => "config",
            Self::Route => "route",
            Self::Middleware => "middleware",
            Self::Component => "component",
            Self::Page => "page",
            Self::Util => "util",
            Self::Test => "test",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// A declared file in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Project-relative path after loading.
    pub path: String,

    /// Symbolic references to other files (names, partial or relative paths).
    #[serde(default, rename = "dependencies")]
    pub declared_dependencies: Vec<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub role: FileRole,

    /// File carried prior content before generation; only line edits allowed.
    #[serde(default)]
    pub has_existing_content: bool,

    /// Project-relative sub-root this entry belongs to.
    #[serde(skip)]
    pub sub_root: String,
}

impl ManifestEntry {
    /// Create an entry with no dependencies.
    pub fn new(path: impl Into<String>, role: FileRole) -> Self {
        Self {
            path: path.into(),
            declared_dependencies: Vec::new(),
            description: String::new(),
            role,
            has_existing_content: false,
            sub_root: String::new(),
        }
    }

    /// Add declared dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the entry as carrying prior content.
    #[must_use]
    pub fn with_existing_content(mut self) -> Self {
        self.has_existing_content = true;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Manifest for one independently buildable sub-root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubRootManifest {
    /// Project-relative directory (`""` or `"."` for the project root).
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
}

impl SubRootManifest {
    pub fn new(root: impl Into<String>, files: Vec<ManifestEntry>) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    #[serde(default)]
    sub_roots: Vec<SubRootManifest>,
}

/// The whole project manifest, normalized to project-relative paths.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    sub_roots: Vec<String>,
    entries: Vec<ManifestEntry>,
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Load the manifest of a project. A missing file yields an empty manifest.
    ///
    /// # Errors
    ///
    /// Returns [`FixloopError::Manifest`] when the file exists but is not a
    /// valid manifest.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = FixloopConfig::manifest_path(project_dir);
        if !path.exists() {
            debug!("No manifest at {}, using empty manifest", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let file: ManifestFile =
            serde_json::from_str(&content).map_err(|e| FixloopError::Manifest {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(Self::from_sub_roots(file.sub_roots))
    }

    /// Build a manifest from sub-root declarations.
    ///
    /// Entries whose paths escape their sub-root or repeat an earlier path
    /// are dropped with a warning.
    #[must_use]
    pub fn from_sub_roots(sub_roots: Vec<SubRootManifest>) -> Self {
        let mut manifest = Self::default();

        for sub in sub_roots {
            let Some(root) = normalize_relative(&sub.root) else {
                warn!("Skipping sub-root outside the project: {}", sub.root);
                continue;
            };
            if !manifest.sub_roots.contains(&root) {
                manifest.sub_roots.push(root.clone());
            }

            for mut entry in sub.files {
                let Some(path) = join_relative(&root, &entry.path) else {
                    warn!("Skipping manifest entry outside its sub-root: {}", entry.path);
                    continue;
                };
                if manifest.index.contains_key(&path) {
                    warn!("Duplicate manifest entry ignored: {}", path);
                    continue;
                }
                entry.path = path.clone();
                entry.sub_root = root.clone();
                manifest.index.insert(path, manifest.entries.len());
                manifest.entries.push(entry);
            }
        }

        manifest
    }

    /// True when no files are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of declared files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sub-root directories in declaration order.
    #[must_use]
    pub fn sub_roots(&self) -> &[String] {
        &self.sub_roots
    }

    /// All entries in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    /// Look up an entry by project-relative path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.index.get(path).map(|&idx| &self.entries[idx])
    }

    /// Whether a path is declared.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Whether a file may only receive line-level edits.
    ///
    /// Files not declared in the manifest are treated as carrying prior
    /// content: nothing is known about how they were produced.
    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        self.get(path).is_none_or(|entry| entry.has_existing_content)
    }

    /// Entries whose file name equals `name`.
    pub fn by_file_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .iter()
            .filter(move |entry| file_name(&entry.path) == name)
    }

    /// Sub-root owning a project-relative path (longest matching prefix).
    #[must_use]
    pub fn sub_root_of(&self, path: &str) -> Option<&str> {
        if let Some(entry) = self.get(path) {
            return Some(entry.sub_root.as_str());
        }
        self.sub_roots
            .iter()
            .filter(|root| root.is_empty() || path.starts_with(&format!("{}/", root)))
            .max_by_key(|root| root.len())
            .map(String::as_str)
    }

    /// A compact listing of the manifest for oracle requests.
    #[must_use]
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                if entry.description.is_empty() {
                    format!("- {} ({})", entry.path, entry.role)
                } else {
                    format!("- {} ({}): {}", entry.path, entry.role, entry.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        Manifest::from_sub_roots(vec![
            SubRootManifest::new(
                "backend",
                vec![
                    ManifestEntry::new("src/services/UserService.ts", FileRole::Service),
                    ManifestEntry::new("./src/controllers/UserController.ts", FileRole::Controller)
                        .with_dependencies(["UserService"])
                        .with_existing_content(),
                ],
            ),
            SubRootManifest::new(
                ".",
                vec![ManifestEntry::new("README.md", FileRole::Other)],
            ),
        ])
    }

    #[test]
    fn test_paths_are_project_relative() {
        let manifest = sample();
        assert_eq!(manifest.len(), 3);
        assert!(manifest.contains("backend/src/services/UserService.ts"));
        assert!(manifest.contains("backend/src/controllers/UserController.ts"));
        assert!(manifest.contains("README.md"));
        assert_eq!(manifest.sub_roots(), &["backend".to_string(), String::new()]);
    }

    #[test]
    fn test_entry_carries_sub_root() {
        let manifest = sample();
        let entry = manifest.get("backend/src/services/UserService.ts").unwrap();
        assert_eq!(entry.sub_root, "backend");
        assert_eq!(
            manifest.sub_root_of("backend/src/unknown.ts"),
            Some("backend")
        );
        assert_eq!(manifest.sub_root_of("other/file.ts"), Some(""));
    }

    #[test]
    fn test_is_protected() {
        let manifest = sample();
        assert!(!manifest.is_protected("backend/src/services/UserService.ts"));
        assert!(manifest.is_protected("backend/src/controllers/UserController.ts"));
        assert!(manifest.is_protected("backend/src/not-declared.ts"));
    }

    #[test]
    fn test_role_is_core() {
        assert!(FileRole::Service.is_core());
        assert!(FileRole::Config.is_core());
        assert!(!FileRole::Component.is_core());
        assert!(!FileRole::Other.is_core());
    }

    #[test]
    fn test_escaping_entries_dropped() {
        let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
            "app",
            vec![
                ManifestEntry::new("../../etc/passwd", FileRole::Other),
                ManifestEntry::new("src/a.ts", FileRole::Util),
                ManifestEntry::new("src/a.ts", FileRole::Util),
            ],
        )]);
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_load_missing_manifest_is_empty() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::load(temp.path()).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_load_manifest_json() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".fixloop")).unwrap();
        std::fs::write(
            FixloopConfig::manifest_path(temp.path()),
            r#"{"subRoots": [{"root": "api", "files": [
                {"path": "src/models/User.ts", "role": "model", "description": "User entity"},
                {"path": "src/weird.ts", "role": "gizmo", "hasExistingContent": true}
            ]}]}"#,
        )
        .unwrap();

        let manifest = Manifest::load(temp.path()).unwrap();
        assert_eq!(manifest.len(), 2);
        let weird = manifest.get("api/src/weird.ts").unwrap();
        assert_eq!(weird.role, FileRole::Other);
        assert!(weird.has_existing_content);
        assert!(manifest.summary().contains("User entity"));
    }

    #[test]
    fn test_load_malformed_manifest() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".fixloop")).unwrap();
        std::fs::write(FixloopConfig::manifest_path(temp.path()), "[1, 2").unwrap();
        assert!(matches!(
            Manifest::load(temp.path()),
            Err(FixloopError::Manifest { .. })
        ));
    }
}
