//! Project fixtures.
//!
//! Writes a small generated project (files, build descriptor and
//! `.fixloop/manifest.json`) into a caller-provided directory, usually a
//! `tempfile::TempDir`.

use serde_json::json;
use std::path::{Path, PathBuf};

use crate::config::STATE_DIR;
use crate::manifest::FileRole;

#[derive(Debug, Clone)]
struct FixtureFile {
    path: String,
    role: FileRole,
    content: String,
    dependencies: Vec<String>,
    existing: bool,
}

/// Builder for a single-sub-root project.
///
/// # Example
///
/// ```rust,ignore
/// let temp = TempDir::new()?;
/// ProjectFixture::new(temp.path())
///     .file("src/UserService.ts", FileRole::Service, "export class UserService {}\n")
///     .file("src/UserController.ts", FileRole::Controller, "...")
///     .depends_on(&["UserService"])
///     .write()?;
/// ```
#[derive(Debug, Clone)]
pub struct ProjectFixture {
    root: PathBuf,
    sub_root: String,
    files: Vec<FixtureFile>,
    descriptor: Option<String>,
}

impl ProjectFixture {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sub_root: String::new(),
            files: Vec::new(),
            descriptor: Some("package.json".to_string()),
        }
    }

    /// Place every file under a sub-root directory.
    #[must_use]
    pub fn in_sub_root(mut self, sub_root: &str) -> Self {
        self.sub_root = sub_root.to_string();
        self
    }

    /// Do not write a build descriptor.
    #[must_use]
    pub fn without_descriptor(mut self) -> Self {
        self.descriptor = None;
        self
    }

    /// Declare and write a generated file.
    #[must_use]
    pub fn file(mut self, path: &str, role: FileRole, content: &str) -> Self {
        self.files.push(FixtureFile {
            path: path.to_string(),
            role,
            content: content.to_string(),
            dependencies: Vec::new(),
            existing: false,
        });
        self
    }

    /// Declare and write a file that carried prior content.
    #[must_use]
    pub fn existing_file(mut self, path: &str, role: FileRole, content: &str) -> Self {
        self = self.file(path, role, content);
        if let Some(last) = self.files.last_mut() {
            last.existing = true;
        }
        self
    }

    /// Symbolic dependencies of the most recently added file.
    #[must_use]
    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        if let Some(last) = self.files.last_mut() {
            last.dependencies = dependencies.iter().map(|d| (*d).to_string()).collect();
        }
        self
    }

    /// Project-relative path of a sub-root-relative file.
    #[must_use]
    pub fn project_path(&self, path: &str) -> String {
        if self.sub_root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.sub_root, path)
        }
    }

    /// Write everything to disk and return the project root.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors.
    pub fn write(self) -> std::io::Result<PathBuf> {
        let base = if self.sub_root.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.sub_root)
        };
        std::fs::create_dir_all(&base)?;

        for file in &self.files {
            let target = base.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, &file.content)?;
        }
        if let Some(descriptor) = &self.descriptor {
            std::fs::write(base.join(descriptor), "{\n  \"name\": \"fixture\"\n}\n")?;
        }

        let files: Vec<serde_json::Value> = self
            .files
            .iter()
            .map(|f| {
                json!({
                    "path": f.path,
                    "role": f.role,
                    "dependencies": f.dependencies,
                    "hasExistingContent": f.existing,
                })
            })
            .collect();
        let manifest = json!({ "subRoots": [{ "root": self.sub_root, "files": files }] });

        let state = self.root.join(STATE_DIR);
        std::fs::create_dir_all(&state)?;
        std::fs::write(
            state.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    #[test]
    fn test_fixture_round_trips_through_manifest_loader() {
        let temp = TempDir::new().unwrap();
        let root = ProjectFixture::new(temp.path())
            .in_sub_root("backend")
            .file("src/a.ts", FileRole::Service, "export const a = 1;\n")
            .existing_file("src/b.ts", FileRole::Controller, "import { a } from './a';\n")
            .depends_on(&["./a"])
            .write()
            .unwrap();

        let manifest = Manifest::load(&root).unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.is_protected("backend/src/b.ts"));
        assert!(!manifest.is_protected("backend/src/a.ts"));
        assert!(root.join("backend/package.json").exists());
    }
}
