//! Priority scheduling of files to repair.
//!
//! `priority = 10·dependents + 5·errors + 20·core`, where core files are
//! those whose manifest role is structurally central. Files are visited in
//! descending priority; ties fall back to path order so every round is
//! deterministic.

use tracing::info;

use crate::diagnostics::{ErrorMap, FixLedger};
use crate::manifest::Manifest;

const DEPENDENT_WEIGHT: u32 = 10;
const ERROR_WEIGHT: u32 = 5;
const CORE_WEIGHT: u32 = 20;

/// Compute the priority of a file.
#[must_use]
pub fn priority(dependents: usize, errors: usize, is_core: bool) -> u32 {
    let dependents = u32::try_from(dependents).unwrap_or(u32::MAX);
    let errors = u32::try_from(errors).unwrap_or(u32::MAX);
    DEPENDENT_WEIGHT
        .saturating_mul(dependents)
        .saturating_add(ERROR_WEIGHT.saturating_mul(errors))
        .saturating_add(if is_core { CORE_WEIGHT } else { 0 })
}

/// Visiting order for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Paths to fix, highest priority first.
    pub order: Vec<String>,
    /// Files left out because they ran out of attempts.
    pub exhausted: Vec<String>,
}

/// Assign priorities to every mapping and return the visiting order.
pub fn schedule(map: &mut ErrorMap, manifest: &Manifest, ledger: &FixLedger) -> Schedule {
    let mut result = Schedule::default();
    let mut ranked: Vec<(u32, String)> = Vec::new();

    for mapping in map.files.values_mut() {
        let is_core = manifest
            .get(&mapping.path)
            .is_some_and(|entry| entry.role.is_core());
        mapping.priority = priority(mapping.dependents.len(), mapping.errors.len(), is_core);

        if ledger.is_exhausted(&mapping.path) {
            info!(
                "Skipping {}: reached {} fix attempts",
                mapping.path,
                ledger.max_attempts()
            );
            result.exhausted.push(mapping.path.clone());
            continue;
        }
        ranked.push((mapping.priority, mapping.path.clone()));
    }

    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    result.order = ranked.into_iter().map(|(_, path)| path).collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{BuildError, ErrorFileMapping, ErrorKind, FixRecord};
    use crate::manifest::{FileRole, ManifestEntry, SubRootManifest};

    fn mapping(path: &str, dependents: usize, errors: usize) -> ErrorFileMapping {
        ErrorFileMapping {
            path: path.to_string(),
            errors: (0..errors)
                .map(|i| BuildError::new(ErrorKind::Type, format!("e{}", i)).with_location(path, 1))
                .collect(),
            dependents: (0..dependents).map(|i| format!("dep{}.ts", i)).collect(),
            ..Default::default()
        }
    }

    fn map_of(mappings: Vec<ErrorFileMapping>) -> ErrorMap {
        ErrorMap {
            files: mappings.into_iter().map(|m| (m.path.clone(), m)).collect(),
            unattributed: Vec::new(),
        }
    }

    #[test]
    fn test_priority_formula() {
        assert_eq!(priority(0, 0, false), 0);
        assert_eq!(priority(3, 1, false), 35);
        assert_eq!(priority(1, 2, true), 40);
    }

    #[test]
    fn test_central_file_first() {
        let manifest = Manifest::default();
        let mut map = map_of(vec![mapping("a.ts", 0, 1), mapping("b.ts", 3, 1)]);
        let schedule = schedule(&mut map, &manifest, &FixLedger::new(3));
        assert_eq!(schedule.order, vec!["b.ts".to_string(), "a.ts".to_string()]);
        assert_eq!(map.files["b.ts"].priority, 35);
    }

    #[test]
    fn test_core_role_and_ties() {
        let manifest = Manifest::from_sub_roots(vec![SubRootManifest::new(
            "",
            vec![
                ManifestEntry::new("service.ts", FileRole::Service),
                ManifestEntry::new("util.ts", FileRole::Util),
            ],
        )]);
        let mut map = map_of(vec![
            mapping("util.ts", 1, 1),
            mapping("service.ts", 0, 1),
            mapping("c.ts", 0, 1),
            mapping("b.ts", 0, 1),
        ]);
        let schedule = schedule(&mut map, &manifest, &FixLedger::new(3));
        assert_eq!(schedule.order, vec!["service.ts", "util.ts", "b.ts", "c.ts"]);
    }

    #[test]
    fn test_exhausted_files_are_excluded() {
        let mut ledger = FixLedger::new(1);
        ledger.record("a.ts", FixRecord::new("rule", false));
        let mut map = map_of(vec![mapping("a.ts", 5, 5), mapping("b.ts", 0, 1)]);
        let schedule = schedule(&mut map, &Manifest::default(), &ledger);
        assert_eq!(schedule.order, vec!["b.ts".to_string()]);
        assert_eq!(schedule.exhausted, vec!["a.ts".to_string()]);
    }
}
