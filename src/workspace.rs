//! Project tree access gated by the project-root boundary.
//!
//! Every read and write performed by the engine goes through
//! [`ProjectTree`], which resolves project-relative paths and refuses any
//! path that would land outside the root, including through symlinked
//! parents.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{FixloopError, Result};
use crate::patcher::SurgicalChange;

const TMP_SUFFIX: &str = ".fixloop.tmp";

/// Normalize a project-relative path lexically.
///
/// Backslashes become `/`, `.` segments are dropped and `..` pops the
/// previous segment. Returns `None` when the path is absolute or climbs
/// above its starting point.
#[must_use]
pub fn normalize_relative(path: &str) -> Option<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') || Path::new(&unified).is_absolute() {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// Join a path onto a directory (both project-relative) and normalize.
#[must_use]
pub fn join_relative(dir: &str, path: &str) -> Option<String> {
    if dir.is_empty() {
        normalize_relative(path)
    } else {
        normalize_relative(&format!("{}/{}", dir, path))
    }
}

/// Directory part of a project-relative path (`""` for top-level files).
#[must_use]
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// File name part of a project-relative path.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// File name without its final extension.
#[must_use]
pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Path without its final extension.
#[must_use]
pub fn strip_extension(path: &str) -> &str {
    let name_start = path.rfind('/').map_or(0, |idx| idx + 1);
    match path[name_start..].rfind('.') {
        Some(idx) if idx > 0 => &path[..name_start + idx],
        _ => path,
    }
}

/// The project working tree.
#[derive(Debug, Clone)]
pub struct ProjectTree {
    root: PathBuf,
}

impl ProjectTree {
    /// Open a project tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`FixloopError::MissingProject`] when the directory is absent.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(FixloopError::MissingProject {
                path: root.to_path_buf(),
            });
        }
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a tool-reported path into a project-relative one.
    ///
    /// Absolute paths are accepted only when they sit under the root.
    #[must_use]
    pub fn relativize(&self, reported: &str) -> Option<String> {
        let unified = reported.trim().replace('\\', "/");
        let candidate = Path::new(&unified);
        if candidate.is_absolute() {
            let stripped = candidate
                .strip_prefix(&self.root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))?;
            normalize_relative(&stripped)
        } else {
            normalize_relative(&unified)
        }
    }

    /// Resolve a project-relative path to an absolute one inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`FixloopError::PathEscape`] if the path leaves the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let escape = || FixloopError::PathEscape {
            path: relative.to_string(),
        };

        let normalized = self.relativize(relative).ok_or_else(escape)?;
        if normalized.is_empty() {
            return Err(escape());
        }
        let joined = self.root.join(&normalized);

        if joined
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(escape());
        }

        let parent = joined.parent().ok_or_else(escape)?;
        let parent_canon = canonicalize_existing_parent(parent)?;
        if !parent_canon.starts_with(&self.root) {
            return Err(escape());
        }
        if joined.is_symlink() {
            let target = joined.canonicalize()?;
            if !target.starts_with(&self.root) {
                return Err(escape());
            }
        }

        Ok(joined)
    }

    /// Check whether a project-relative file exists.
    #[must_use]
    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Check whether a project-relative directory contains a file.
    #[must_use]
    pub fn dir_contains(&self, dir: &str, file: &str) -> bool {
        let relative = if dir.is_empty() {
            file.to_string()
        } else {
            format!("{}/{}", dir, file)
        };
        self.exists(&relative)
    }

    /// Read a project-relative file.
    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Read a file, returning `None` if it cannot be read.
    #[must_use]
    pub fn read_optional(&self, relative: &str) -> Option<String> {
        self.read(relative).ok()
    }

    /// Write a whole file atomically, creating parent directories.
    ///
    /// Content lands in a sibling temp file that is synced and then renamed
    /// over the target.
    ///
    /// # Errors
    ///
    /// [`FixloopError::PathEscape`] for paths outside the root and
    /// [`FixloopError::WriteFailed`] for filesystem failures.
    pub fn write(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| FixloopError::write_failed(relative, e.to_string()))?;
        }
        let tmp_path = tmp_sibling(&path);
        let written = File::create(&tmp_path).and_then(|mut tmp_file| {
            tmp_file.write_all(content.as_bytes())?;
            tmp_file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, &path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(FixloopError::write_failed(relative, e.to_string()));
        }
        debug!("Wrote {} ({} bytes)", relative, content.len());
        Ok(())
    }

    /// Apply in-place line replacements to a file and return the new content.
    pub fn apply_changes(&self, relative: &str, changes: &[SurgicalChange]) -> Result<String> {
        let content = self.read(relative)?;
        let updated = apply_line_changes(&content, changes);
        if updated != content {
            self.write(relative, &updated)?;
        }
        Ok(updated)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

// ============================================================================
// Line editing
// ============================================================================

/// A file split into lines, each keeping its own terminator.
///
/// Rendering reproduces the input byte for byte apart from edited or
/// inserted lines, so CRLF files stay CRLF.
#[derive(Debug, Clone)]
pub struct FileLines {
    lines: Vec<(String, &'static str)>,
    ending: &'static str,
}

impl FileLines {
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let lines: Vec<(String, &'static str)> = content
            .split_inclusive('\n')
            .map(|raw| {
                if let Some(body) = raw.strip_suffix("\r\n") {
                    (body.to_string(), "\r\n")
                } else if let Some(body) = raw.strip_suffix('\n') {
                    (body.to_string(), "\n")
                } else {
                    (raw.to_string(), "")
                }
            })
            .collect();
        let ending = lines
            .iter()
            .map(|(_, ending)| *ending)
            .find(|ending| !ending.is_empty())
            .unwrap_or("\n");
        Self { lines, ending }
    }

    /// Terminator used for inserted lines.
    #[must_use]
    pub fn ending(&self) -> &'static str {
        self.ending
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line text without its terminator (0-indexed).
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(|(body, _)| body.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|(body, _)| body.as_str())
    }

    /// Replace the text of a line, keeping its terminator.
    pub fn set(&mut self, idx: usize, text: &str) -> bool {
        match self.lines.get_mut(idx) {
            Some((body, _)) => {
                body.clear();
                body.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Insert a line before `idx`, or append when `idx` is past the end.
    pub fn insert(&mut self, idx: usize, text: String) {
        if idx >= self.lines.len() {
            let ending = match self.lines.last_mut() {
                Some((_, last)) if last.is_empty() => {
                    *last = self.ending;
                    ""
                }
                _ => self.ending,
            };
            self.lines.push((text, ending));
        } else {
            self.lines.insert(idx, (text, self.ending));
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (body, ending) in &self.lines {
            out.push_str(body);
            out.push_str(ending);
        }
        out
    }
}

/// Replace 1-indexed lines of `content` with the changes' fixed text.
///
/// A change only applies while the line still equals its original text, so
/// stale changes are skipped rather than clobbering newer edits. Line
/// terminators of the input are preserved.
#[must_use]
pub fn apply_line_changes(content: &str, changes: &[SurgicalChange]) -> String {
    let mut lines = FileLines::parse(content);
    for change in changes {
        let Some(idx) = (change.line as usize).checked_sub(1) else {
            continue;
        };
        if lines.get(idx) == Some(change.original_text.as_str()) {
            lines.set(idx, &change.fixed_text);
        }
    }
    lines.render()
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err(FixloopError::PathEscape {
                path: path.display().to_string(),
            });
        }
    }
    Ok(current.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("./src/a.ts").as_deref(), Some("src/a.ts"));
        assert_eq!(
            normalize_relative("src/x/../a.ts").as_deref(),
            Some("src/a.ts")
        );
        assert_eq!(normalize_relative("src\\a.ts").as_deref(), Some("src/a.ts"));
        assert!(normalize_relative("../a.ts").is_none());
        assert!(normalize_relative("/etc/passwd").is_none());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_dir("src/services/User.ts"), "src/services");
        assert_eq!(parent_dir("User.ts"), "");
        assert_eq!(file_name("src/services/User.ts"), "User.ts");
        assert_eq!(file_stem("src/services/User.service.ts"), "User.service");
        assert_eq!(strip_extension("src/a.ts"), "src/a");
        assert_eq!(strip_extension("src.d/a"), "src.d/a");
        assert_eq!(join_relative("src/controllers", "../services/User").as_deref(), Some("src/services/User"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();

        assert!(matches!(
            tree.resolve("../outside.ts"),
            Err(FixloopError::PathEscape { .. })
        ));
        assert!(matches!(
            tree.resolve("/etc/passwd"),
            Err(FixloopError::PathEscape { .. })
        ));
        assert!(tree.resolve("src/new/file.ts").is_ok());
    }

    #[test]
    fn test_write_outside_root_is_refused() {
        let outer = TempDir::new().unwrap();
        let project = outer.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        let tree = ProjectTree::open(&project).unwrap();

        assert!(tree.write("../evil.ts", "x").is_err());
        assert!(!outer.path().join("evil.ts").exists());
    }

    #[test]
    fn test_relativize_absolute_under_root() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        let abs = tree.root().join("backend/src/a.ts");
        assert_eq!(
            tree.relativize(&abs.display().to_string()).as_deref(),
            Some("backend/src/a.ts")
        );
        assert!(tree.relativize("/somewhere/else.ts").is_none());
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write("src/deep/a.ts", "export const a = 1;\n").unwrap();
        assert!(tree.exists("src/deep/a.ts"));
        assert!(tree.dir_contains("src/deep", "a.ts"));
        assert_eq!(tree.read("src/deep/a.ts").unwrap(), "export const a = 1;\n");
    }

    #[test]
    fn test_apply_line_changes_skips_stale() {
        let content = "a\nb\nc\n";
        let changes = vec![
            SurgicalChange::new(2, "b", "B", vec![]),
            SurgicalChange::new(3, "not-c", "C", vec![]),
        ];
        assert_eq!(apply_line_changes(content, &changes), "a\nB\nc\n");
    }

    #[test]
    fn test_apply_line_changes_keeps_crlf() {
        let changes = vec![SurgicalChange::new(2, "b", "B", vec![])];
        assert_eq!(apply_line_changes("a\r\nb\r\nc\r\n", &changes), "a\r\nB\r\nc\r\n");
        assert_eq!(apply_line_changes("a\r\nb\nc", &changes), "a\r\nB\nc");
    }

    #[test]
    fn test_file_lines_insert_uses_file_ending() {
        let mut lines = FileLines::parse("a\r\nc");
        lines.insert(1, "b".to_string());
        lines.insert(9, "d".to_string());
        assert_eq!(lines.render(), "a\r\nb\r\nc\r\nd");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_write_is_atomic_and_leaves_no_tmp_file() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write("src/a.ts", "first\n").unwrap();
        tree.write("src/a.ts", "second\n").unwrap();

        assert_eq!(tree.read("src/a.ts").unwrap(), "second\n");
        let names: Vec<String> = std::fs::read_dir(temp.path().join("src"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.ts".to_string()]);
    }
}
