//! Parsing and path validation of fix oracle responses.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{FixloopError, Result};
use crate::manifest::Manifest;
use crate::workspace::{file_name, parent_dir, ProjectTree};

/// Structured answer of a fix oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResponse {
    pub success: bool,

    /// Replacement content keyed by path.
    #[serde(default)]
    pub fixed_content: BTreeMap<String, String>,

    /// Files to create.
    #[serde(default)]
    pub new_files: BTreeMap<String, String>,

    #[serde(default)]
    pub explanation: Option<String>,

    /// Shorthand some oracles use for single-line answers.
    #[serde(default)]
    pub fixed_line: Option<String>,
}

impl FixResponse {
    /// The replacement line for a single-line request against `target`.
    ///
    /// Accepts `fixedLine`, or a `fixedContent` entry keyed to the target
    /// holding exactly one line. Entries for other paths and anything
    /// spanning several lines are refused.
    #[must_use]
    pub fn single_line(&self, target: &str) -> Option<String> {
        let candidate = self
            .fixed_line
            .as_deref()
            .or_else(|| self.fixed_content.get(target).map(String::as_str))?;
        let line = candidate.trim_end_matches(['\n', '\r']);
        if line.contains('\n') {
            warn!("Single-line response for {} spans several lines, ignoring", target);
            return None;
        }
        Some(line.to_string())
    }
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Outermost `{ ... }` fragment of a text.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start <= end).then(|| &text[start..=end])
}

/// Parse raw oracle output into a [`FixResponse`].
///
/// # Errors
///
/// Returns [`FixloopError::MalformedResponse`] when no JSON object with a
/// `success` flag can be found.
pub fn parse_response(raw: &str) -> Result<FixResponse> {
    let clean = strip_markdown_fences(raw);
    let json = extract_json_object(clean).ok_or_else(|| {
        FixloopError::malformed(format!("no JSON object in response: {}", preview(clean)))
    })?;
    serde_json::from_str(json)
        .map_err(|e| FixloopError::malformed(format!("{} in response: {}", e, preview(json))))
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        out.push_str("...");
    }
    out
}

/// Where a path proposed by the oracle ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePath {
    /// A manifest entry, possibly after rewriting a guessed path.
    Declared(String),
    /// An existing file the manifest does not declare.
    Undeclared(String),
    /// A file that does not exist yet, inside the project root.
    New(String),
}

impl ResponsePath {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Declared(p) | Self::Undeclared(p) | Self::New(p) => p,
        }
    }
}

/// Validate a path from an oracle response against the manifest.
///
/// Resolution order: the path as given, a unique manifest entry with the
/// same file name, a same-named entry next to `target`, then the path as
/// an existing or new file.
///
/// # Errors
///
/// Returns [`FixloopError::PathEscape`] when the path lands outside the
/// project root.
pub fn resolve_path(
    raw: &str,
    manifest: &Manifest,
    tree: &ProjectTree,
    target: &str,
) -> Result<ResponsePath> {
    let Some(relative) = tree.relativize(raw) else {
        return Err(FixloopError::PathEscape {
            path: raw.to_string(),
        });
    };
    if manifest.contains(&relative) {
        return Ok(ResponsePath::Declared(relative));
    }

    let name = file_name(&relative);
    let candidates: Vec<&str> = manifest.by_file_name(name).map(|e| e.path.as_str()).collect();
    let rewritten = match candidates.as_slice() {
        [only] => Some(*only),
        [] => None,
        many => many
            .iter()
            .find(|p| parent_dir(p) == parent_dir(target))
            .copied(),
    };
    if let Some(path) = rewritten {
        warn!("Rewriting oracle path {} to manifest entry {}", raw, path);
        return Ok(ResponsePath::Declared(path.to_string()));
    }

    if tree.exists(&relative) {
        Ok(ResponsePath::Undeclared(relative))
    } else {
        // Refuse symlinked parents that point outside the root.
        tree.resolve(&relative)?;
        Ok(ResponsePath::New(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileRole, ManifestEntry, SubRootManifest};
    use tempfile::TempDir;

    #[test]
    fn test_parse_fenced_response() {
        let raw = "Here you go:\n```json\n{\"success\": true, \"fixedContent\": {\"src/a.ts\": \"x\"}}\n```";
        let response = parse_response(raw).unwrap();
        assert!(response.success);
        assert_eq!(response.fixed_content["src/a.ts"], "x");
        assert!(response.new_files.is_empty());
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_response("I could not fix this, sorry.").unwrap_err();
        assert!(matches!(err, FixloopError::MalformedResponse { .. }));

        let err = parse_response("{\"fixedContent\": {}}").unwrap_err();
        assert!(matches!(err, FixloopError::MalformedResponse { .. }));
    }

    #[test]
    fn test_single_line() {
        let response = parse_response(r#"{"success": true, "fixedLine": "  return a;\n"}"#).unwrap();
        assert_eq!(response.single_line("src/a.ts").as_deref(), Some("  return a;"));

        let response =
            parse_response(r#"{"success": true, "fixedContent": {"src/a.ts": "a\nb"}}"#).unwrap();
        assert_eq!(response.single_line("src/a.ts"), None);

        let response =
            parse_response(r#"{"success": true, "fixedContent": {"src/a.ts": "  return b;\n"}}"#).unwrap();
        assert_eq!(response.single_line("src/a.ts").as_deref(), Some("  return b;"));
    }

    #[test]
    fn test_single_line_ignores_other_paths() {
        let response =
            parse_response(r#"{"success": true, "fixedContent": {"src/other.ts": "export const x = 1;"}}"#)
                .unwrap();
        assert_eq!(response.single_line("src/a.ts"), None);
        assert_eq!(
            response.single_line("src/other.ts").as_deref(),
            Some("export const x = 1;")
        );
    }

    #[test]
    fn test_resolve_path_heuristics() {
        let temp = TempDir::new().unwrap();
        let tree = ProjectTree::open(temp.path()).unwrap();
        tree.write("src/services/UserService.ts", "x\n").unwrap();
        tree.write("legacy.ts", "x\n").unwrap();
        let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
            "",
            vec![
                ManifestEntry::new("src/services/UserService.ts", FileRole::Service),
                ManifestEntry::new("src/a/index.ts", FileRole::Other),
                ManifestEntry::new("src/b/index.ts", FileRole::Other),
            ],
        )]);
        let target = "src/b/main.ts";

        assert_eq!(
            resolve_path("src/services/UserService.ts", &manifest, &tree, target).unwrap(),
            ResponsePath::Declared("src/services/UserService.ts".into())
        );
        assert_eq!(
            resolve_path("services/UserService.ts", &manifest, &tree, target).unwrap(),
            ResponsePath::Declared("src/services/UserService.ts".into())
        );
        assert_eq!(
            resolve_path("index.ts", &manifest, &tree, target).unwrap(),
            ResponsePath::Declared("src/b/index.ts".into())
        );
        assert_eq!(
            resolve_path("legacy.ts", &manifest, &tree, target).unwrap(),
            ResponsePath::Undeclared("legacy.ts".into())
        );
        assert_eq!(
            resolve_path("src/new/Thing.ts", &manifest, &tree, target).unwrap(),
            ResponsePath::New("src/new/Thing.ts".into())
        );
        assert!(matches!(
            resolve_path("../../etc/passwd", &manifest, &tree, target),
            Err(FixloopError::PathEscape { .. })
        ));
    }
}
