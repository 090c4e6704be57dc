//! Dependency graph over manifest entries.
//!
//! Symbolic references are resolved best-effort, in order:
//!
//! 1. exact path match
//! 2. path match ignoring the extension
//! 3. file name (basename) match
//!
//! Relative references (`./x`, `../x`) are first joined against the
//! referencing file's directory; other references are also tried against
//! the referencing file's sub-root. Anything still unmatched stays dangling
//! and is logged.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{Manifest, ManifestEntry};
use crate::workspace::{file_stem, join_relative, normalize_relative, parent_dir, strip_extension};

/// Edges of a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    /// Files this file depends on.
    pub dependencies: Vec<String>,
    /// Files that depend on this file.
    pub dependents: Vec<String>,
}

/// A declared dependency that matched no manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    pub from: String,
    pub reference: String,
}

/// Directed dependency graph with inverse (dependents) edges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
    unresolved: Vec<UnresolvedReference>,
}

impl DependencyGraph {
    /// Build the graph for a manifest.
    #[must_use]
    pub fn build(manifest: &Manifest) -> Self {
        let mut graph = Self::default();
        for entry in manifest.entries() {
            graph.nodes.entry(entry.path.clone()).or_default();
        }

        for entry in manifest.entries() {
            for reference in &entry.declared_dependencies {
                match resolve_reference(manifest, entry, reference) {
                    Some(target) if target == entry.path => {
                        debug!("Ignoring self reference '{}' in {}", reference, entry.path);
                    }
                    Some(target) => graph.add_edge(&entry.path, &target),
                    None => {
                        warn!(
                            "Unresolved dependency '{}' declared by {}",
                            reference, entry.path
                        );
                        graph.unresolved.push(UnresolvedReference {
                            from: entry.path.clone(),
                            reference: reference.clone(),
                        });
                    }
                }
            }
        }

        debug!(
            "Built dependency graph: {} files, {} unresolved references",
            graph.nodes.len(),
            graph.unresolved.len()
        );
        graph
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let node = self.nodes.entry(from.to_string()).or_default();
        if !node.dependencies.iter().any(|d| d == to) {
            node.dependencies.push(to.to_string());
        }
        let target = self.nodes.entry(to.to_string()).or_default();
        if !target.dependents.iter().any(|d| d == from) {
            target.dependents.push(from.to_string());
        }
    }

    /// Files `path` depends on.
    #[must_use]
    pub fn dependencies(&self, path: &str) -> &[String] {
        self.nodes
            .get(path)
            .map_or(&[], |node| node.dependencies.as_slice())
    }

    /// Files depending on `path`.
    #[must_use]
    pub fn dependents(&self, path: &str) -> &[String] {
        self.nodes
            .get(path)
            .map_or(&[], |node| node.dependents.as_slice())
    }

    /// Node for a path, if declared.
    #[must_use]
    pub fn node(&self, path: &str) -> Option<&GraphNode> {
        self.nodes.get(path)
    }

    /// Iterate nodes in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &GraphNode)> {
        self.nodes.iter()
    }

    /// References that matched nothing.
    #[must_use]
    pub fn unresolved(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Resolve one symbolic reference declared by `from`.
#[must_use]
pub fn resolve_reference(
    manifest: &Manifest,
    from: &ManifestEntry,
    reference: &str,
) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    let mut candidates = Vec::new();
    if reference.starts_with("./") || reference.starts_with("../") {
        candidates.extend(join_relative(parent_dir(&from.path), reference));
    } else {
        let trimmed = reference.trim_start_matches('/');
        candidates.extend(normalize_relative(trimmed));
        if !from.sub_root.is_empty() {
            candidates.extend(join_relative(&from.sub_root, trimmed));
        }
    }

    // exact path
    if let Some(hit) = candidates.iter().find(|c| manifest.contains(c)) {
        return Some(hit.clone());
    }

    // path ignoring extension
    for candidate in &candidates {
        let wanted = strip_extension(candidate);
        if let Some(entry) = manifest
            .entries()
            .find(|entry| strip_extension(&entry.path) == wanted)
        {
            return Some(entry.path.clone());
        }
    }

    // basename
    let stem = candidates
        .first()
        .map_or_else(|| file_stem(reference), |c| file_stem(c))
        .to_string();
    let matches: Vec<&ManifestEntry> = manifest
        .entries()
        .filter(|entry| file_stem(&entry.path) == stem)
        .collect();
    if matches.len() > 1 {
        debug!(
            "Ambiguous reference '{}' from {} ({} candidates)",
            reference,
            from.path,
            matches.len()
        );
    }
    matches
        .iter()
        .find(|entry| entry.sub_root == from.sub_root)
        .or_else(|| matches.first())
        .map(|entry| entry.path.clone())
}
