//! The build-fix pipeline.
//!
//! Drives one [`Session`] through install, validation and repair rounds
//! until the project validates, a bound is hit, or a round stops making
//! progress. Progress is a `(path, content digest)` state the session has
//! never seen; edits that oscillate back to an earlier state do not count.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CancellationFlag, Session, SessionReports, SessionState, SessionStatus};
use crate::config::FixloopConfig;
use crate::diagnostics::{BuildError, ErrorFileMapping, ErrorMap, ErrorMapper, FixLedger, FixRecord};
use crate::error::{FixloopError, Result};
use crate::manifest::{DependencyGraph, Manifest};
use crate::oracle::{
    apply_file_response, oracle_from_config, FixOracle, FixOracleAdapter, FixRequest, FixStrategy,
    OracleOutcome, RegenerationPermit,
};
use crate::patcher::{apply_stubs, RuleContext, SurgicalChange, SurgicalPatcher, SymbolIndex};
use crate::propagation::{ContextWindow, DependentPropagator};
use crate::scheduler::schedule;
use crate::validation::{CommandValidationOracle, ValidationOracle, ValidationReport, ValidationRunner};
use crate::workspace::{file_name, ProjectTree};

// ============================================================================
// Result
// ============================================================================

/// Outcome of a session, returned to the caller and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    pub status: SessionStatus,
    /// Files changed during the session, sorted.
    pub fixed_files: Vec<String>,
    /// Every error of the last validation, attributed or not.
    pub remaining_errors: Vec<BuildError>,
    pub warnings: Vec<BuildError>,
    /// Errors no file could be determined for.
    pub unattributed_errors: Vec<BuildError>,
    pub logs: Vec<String>,
    /// Install retries consumed.
    pub retry_count: u32,
    /// Fix rounds run.
    pub rounds: u32,
    pub session_id: String,
}

/// Run a session with the oracles configured for the project.
///
/// # Errors
///
/// Only fatal conditions are returned: a missing project directory, an
/// unreadable configuration or manifest, a failed write, or a missing tool.
/// Everything else is reported through [`PipelineResult`].
pub async fn run_build_and_fix_pipeline(
    project_path: impl AsRef<Path>,
    session_id: &str,
) -> Result<PipelineResult> {
    let project_path = project_path.as_ref();
    let config = FixloopConfig::load(project_path)?;
    let validation = CommandValidationOracle::from_config(&config);
    let oracle = oracle_from_config(&config, project_path);
    BuildFixPipeline::new(project_path, config, &validation, oracle.as_ref())
        .run(session_id)
        .await
}

/// SHA-256 of file content, hex encoded.
#[must_use]
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ============================================================================
// Pipeline
// ============================================================================

/// Files touched by one round.
#[derive(Debug, Default)]
struct RoundChanges {
    /// In-place line edits per file, for propagation.
    lines: BTreeMap<String, Vec<SurgicalChange>>,
    /// Files written wholesale (stubs, regenerations, new files).
    rewritten: BTreeSet<String>,
    /// Files changed by propagation.
    propagated: BTreeSet<String>,
}

impl RoundChanges {
    fn touched(&self) -> BTreeSet<String> {
        self.lines
            .keys()
            .chain(self.rewritten.iter())
            .chain(self.propagated.iter())
            .cloned()
            .collect()
    }
}

/// What one file's fix attempt did.
struct FileFix {
    summary: String,
    lines: Vec<SurgicalChange>,
    rewritten: Vec<String>,
}

impl FileFix {
    fn failed(strategy: &FixStrategy, reason: impl std::fmt::Display) -> Self {
        Self {
            summary: format!("{}: {}", strategy.label(), reason),
            lines: Vec::new(),
            rewritten: Vec::new(),
        }
    }

    fn changed(&self) -> bool {
        !self.lines.is_empty() || !self.rewritten.is_empty()
    }
}

/// Read-only inputs shared by every step of a session.
struct Workspace<'w> {
    tree: &'w ProjectTree,
    manifest: &'w Manifest,
    graph: &'w DependencyGraph,
}

/// Orchestrates a build-fix session over a project directory.
///
/// # Example
///
/// ```rust,ignore
/// let validation = CommandValidationOracle::from_config(&config);
/// let oracle = CommandFixOracle::new(argv, &project);
/// let result = BuildFixPipeline::new(&project, config, &validation, &oracle)
///     .with_cancellation(flag)
///     .run("session-1")
///     .await?;
/// ```
pub struct BuildFixPipeline<'a> {
    project_dir: PathBuf,
    config: FixloopConfig,
    validation: &'a dyn ValidationOracle,
    oracle: &'a dyn FixOracle,
    cancellation: CancellationFlag,
    patcher: SurgicalPatcher,
}

impl<'a> BuildFixPipeline<'a> {
    pub fn new(
        project_dir: impl AsRef<Path>,
        config: FixloopConfig,
        validation: &'a dyn ValidationOracle,
        oracle: &'a dyn FixOracle,
    ) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            config,
            validation,
            oracle,
            cancellation: CancellationFlag::new(),
            patcher: SurgicalPatcher::default(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    #[must_use]
    pub fn config(&self) -> &FixloopConfig {
        &self.config
    }

    /// Run a session to a terminal state.
    ///
    /// # Errors
    ///
    /// Configuration, manifest and missing-project errors are returned as
    /// they are. Fatal conditions during the session are returned as
    /// [`FixloopError::SessionAborted`] carrying the full log.
    pub async fn run(&self, session_id: &str) -> Result<PipelineResult> {
        self.config.validate()?;
        let tree = ProjectTree::open(&self.project_dir)?;
        let manifest = Manifest::load(tree.root())?;

        let mut session = Session::new(session_id, tree.root());
        session.log(format!(
            "Session {} started for {} ({} declared files)",
            session_id,
            tree.root().display(),
            manifest.len()
        ));

        let outcome = self.drive(&mut session, &tree, &manifest).await;
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                session.warn(format!("Fatal: {}", err));
                session.transition(SessionState::Fatal);
                let result = Self::finish(
                    &mut session,
                    SessionStatus::Fatal,
                    &ValidationReport::default(),
                    &ErrorMap::default(),
                );
                self.persist(&result);
                return Err(FixloopError::SessionAborted {
                    session_id: session_id.to_string(),
                    reason: err.to_string(),
                    logs: result.logs,
                });
            }
        };
        self.persist(&result);
        Ok(result)
    }

    fn persist(&self, result: &PipelineResult) {
        if !self.config.persist_reports {
            return;
        }
        let reports = SessionReports::new(FixloopConfig::sessions_dir(&self.project_dir));
        if let Err(e) = reports.save(result) {
            warn!("Could not persist session report: {}", e);
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        tree: &ProjectTree,
        manifest: &Manifest,
    ) -> Result<PipelineResult> {
        if manifest.is_empty() {
            session.log("Manifest declares no files; nothing to validate");
            session.transition(SessionState::Done);
            let clean = ValidationReport {
                success: true,
                ..Default::default()
            };
            return Ok(Self::finish(session, SessionStatus::Success, &clean, &ErrorMap::default()));
        }

        let graph = DependencyGraph::build(manifest);
        for unresolved in graph.unresolved() {
            session.warn(format!(
                "{} declares unresolved dependency '{}'",
                unresolved.from, unresolved.reference
            ));
        }
        let ws = Workspace {
            tree,
            manifest,
            graph: &graph,
        };

        for entry in manifest.entries() {
            if let Some(content) = tree.read_optional(&entry.path) {
                session.remember_state(&entry.path, &content_digest(&content));
            }
        }

        let runner = ValidationRunner::new(self.validation, tree, &self.config);
        let sub_roots = runner.buildable_sub_roots(manifest);
        if sub_roots.is_empty() {
            session.warn(format!(
                "No sub-root contains {}; validation passes are skipped",
                self.config.build_descriptor
            ));
        }

        session.transition(SessionState::Installing);
        if let Some(failed) = self.install(session, &runner, &sub_roots).await? {
            let map = ErrorMapper::new(manifest, &graph, tree).map(&failed.errors, &FixLedger::default());
            session.transition(SessionState::Exhausted);
            return Ok(Self::finish(session, SessionStatus::Exhausted, &failed, &map));
        }

        let adapter = FixOracleAdapter::new(
            self.oracle,
            Duration::from_secs(self.config.oracle_timeout_secs),
        );
        if !adapter.is_available() {
            session.log("No fix oracle available; only rule-based fixes will be attempted");
        }
        let mut ledger = FixLedger::new(self.config.max_fix_attempts_per_file);

        loop {
            session.transition(SessionState::Validating);
            let report = runner.validate(&sub_roots).await?;
            if report.success {
                session.log(format!(
                    "Validation passed ({} warnings)",
                    report.warnings.len()
                ));
                session.transition(SessionState::Done);
                return Ok(Self::finish(session, SessionStatus::Success, &report, &ErrorMap::default()));
            }

            session.transition(SessionState::Mapping);
            let mut map = ErrorMapper::new(manifest, &graph, tree).map(&report.errors, &ledger);
            session.log(format!(
                "Validation found {} errors in {} files",
                report.errors.len(),
                map.files.len()
            ));
            for error in &map.unattributed {
                session.warn(format!("Unattributed error: {}", error.format()));
            }

            if self.cancellation.is_cancelled() {
                session.warn("Cancellation requested; stopping at round boundary");
                session.transition(SessionState::Escalated);
                return Ok(Self::finish(session, SessionStatus::Escalated, &report, &map));
            }
            if session.rounds >= self.config.max_rounds {
                session.warn(format!(
                    "Reached the limit of {} fix rounds",
                    self.config.max_rounds
                ));
                session.transition(SessionState::Exhausted);
                return Ok(Self::finish(session, SessionStatus::Exhausted, &report, &map));
            }
            session.rounds += 1;

            session.transition(SessionState::Scheduling);
            let plan = schedule(&mut map, manifest, &ledger);
            for path in &plan.exhausted {
                session.warn(format!(
                    "{} exhausted its {} fix attempts",
                    path,
                    ledger.max_attempts()
                ));
            }
            session.log(format!(
                "Round {}: fixing {} files",
                session.rounds,
                plan.order.len()
            ));

            session.transition(SessionState::Fixing);
            let before = SymbolIndex::build(manifest, tree);
            let mut round = RoundChanges::default();
            for path in &plan.order {
                let Some(mapping) = map.files.get(path) else {
                    continue;
                };
                let fix = self.fix_file(session, &ws, &adapter, mapping, &ledger).await?;
                let changed = fix.changed();
                session.log(format!("{}: {}", path, fix.summary));
                ledger.record(path, FixRecord::new(fix.summary, changed));

                if !fix.lines.is_empty() {
                    if let Some(mapping) = map.files.get_mut(path) {
                        mapping.surgical_changes.extend(fix.lines.iter().cloned());
                    }
                    round.lines.entry(path.clone()).or_default().extend(fix.lines);
                }
                round.rewritten.extend(fix.rewritten);
            }

            session.transition(SessionState::Propagating);
            if self.config.propagation {
                self.propagate(session, &ws, &adapter, &before, &mut round).await?;
            }

            let touched = round.touched();
            let mut progressed = false;
            for path in &touched {
                let Some(content) = tree.read_optional(path) else {
                    continue;
                };
                session.mark_fixed(path);
                if session.remember_state(path, &content_digest(&content)) {
                    progressed = true;
                }
            }
            if !progressed {
                session.warn(format!(
                    "Round {} made no forward progress; escalating",
                    session.rounds
                ));
                session.transition(SessionState::Escalated);
                return Ok(Self::finish(session, SessionStatus::Escalated, &report, &map));
            }

            let descriptor_roots = self.descriptor_roots(manifest, &touched, &sub_roots);
            if !descriptor_roots.is_empty() {
                session.transition(SessionState::Installing);
                if let Some(failed) = self.install(session, &runner, &descriptor_roots).await? {
                    let map = ErrorMapper::new(manifest, &graph, tree).map(&failed.errors, &ledger);
                    session.transition(SessionState::Exhausted);
                    return Ok(Self::finish(session, SessionStatus::Exhausted, &failed, &map));
                }
            }
        }
    }

    /// Install every sub-root. Returns the failing report, if any.
    async fn install(
        &self,
        session: &mut Session,
        runner: &ValidationRunner<'_>,
        sub_roots: &[String],
    ) -> Result<Option<ValidationReport>> {
        for sub_root in sub_roots {
            let report = runner.install(sub_root).await?;
            session.retry_count += report.attempts.saturating_sub(1);
            if !report.success {
                for log in &report.logs {
                    session.warn(log.clone());
                }
                return Ok(Some(report));
            }
            debug!("Installed '{}' after {} attempt(s)", sub_root, report.attempts);
        }
        Ok(None)
    }

    /// Sub-roots whose build descriptor changed this round.
    fn descriptor_roots(
        &self,
        manifest: &Manifest,
        touched: &BTreeSet<String>,
        sub_roots: &[String],
    ) -> Vec<String> {
        let mut roots: Vec<String> = touched
            .iter()
            .filter(|path| file_name(path) == self.config.build_descriptor)
            .filter_map(|path| manifest.sub_root_of(path).map(str::to_string))
            .filter(|root| sub_roots.contains(root))
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    // ========================================================================
    // Fixing
    // ========================================================================

    async fn fix_file(
        &self,
        session: &mut Session,
        ws: &Workspace<'_>,
        adapter: &FixOracleAdapter<'_>,
        mapping: &ErrorFileMapping,
        ledger: &FixLedger,
    ) -> Result<FileFix> {
        let path = mapping.path.as_str();
        let exists = ws.tree.exists(path);

        if exists {
            let symbols = SymbolIndex::build(ws.manifest, ws.tree);
            let ctx = RuleContext {
                path,
                manifest: ws.manifest,
                symbols: &symbols,
                tree: ws.tree,
            };
            let outcome = self.patcher.patch(&ctx, mapping)?;
            if outcome.is_success() {
                if !outcome.changes.is_empty() {
                    ws.tree.apply_changes(path, &outcome.changes)?;
                }
                let rewritten = apply_stubs(ws.tree, ws.manifest, &outcome.stubs)?;
                return Ok(FileFix {
                    summary: outcome.summary(),
                    lines: outcome.changes,
                    rewritten,
                });
            }
            debug!("No rule applies to {}", path);
        }

        if !adapter.is_available() {
            return Ok(FileFix::failed(&FixStrategy::Surgical, "no rule applies and no oracle is available"));
        }

        let targeted_failed = ledger
            .history(path)
            .iter()
            .any(|record| !record.success && record.summary.starts_with(FixStrategy::OracleTargeted.label()));
        let wants_regeneration =
            !exists || mapping.file_level_errors().next().is_some() || targeted_failed;

        if wants_regeneration {
            if let Some(permit) = RegenerationPermit::for_path(ws.manifest, path) {
                return self.regenerate(session, ws, adapter, mapping, permit).await;
            }
        }
        if !exists {
            return Ok(FileFix::failed(&FixStrategy::OracleTargeted, "file is missing"));
        }
        if mapping.errors_by_line.is_empty() {
            return Ok(FileFix::failed(
                &FixStrategy::OracleTargeted,
                "only file-level errors on a file with prior content",
            ));
        }
        self.targeted(session, ws, adapter, mapping).await
    }

    async fn targeted(
        &self,
        session: &mut Session,
        ws: &Workspace<'_>,
        adapter: &FixOracleAdapter<'_>,
        mapping: &ErrorFileMapping,
    ) -> Result<FileFix> {
        let strategy = FixStrategy::OracleTargeted;
        let path = mapping.path.as_str();
        let content = ws.tree.read(path)?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let dependents_note = dependents_context(mapping);

        let mut changes = Vec::new();
        let mut requested = 0usize;
        for (&line, errors) in mapping
            .errors_by_line
            .iter()
            .take(self.config.max_targeted_lines_per_file)
        {
            let Some(window) = ContextWindow::around(path, &lines, line, self.config.context_radius) else {
                continue;
            };
            requested += 1;
            let summary = errors.iter().map(BuildError::format).collect::<Vec<_>>().join("\n");
            let request = FixRequest::targeted(&window, summary, ws.manifest.summary())
                .with_context(dependents_note.clone());

            match adapter.request(&request).await? {
                OracleOutcome::Response(response) => match response.single_line(path) {
                    Some(fixed) if fixed != window.target => changes.push(SurgicalChange::new(
                        line,
                        window.target.clone(),
                        fixed,
                        errors.iter().map(BuildError::format).collect(),
                    )),
                    Some(_) => debug!("Oracle returned {}:{} unchanged", path, line),
                    None => session.warn(format!("Oracle gave no usable line for {}:{}", path, line)),
                },
                OracleOutcome::Failed(reason) => {
                    session.log(format!("Oracle could not fix {}:{}: {}", path, line, reason));
                }
            }
        }

        if changes.is_empty() {
            return Ok(FileFix::failed(&strategy, format!("0 of {} line(s) fixed", requested)));
        }
        ws.tree.apply_changes(path, &changes)?;
        Ok(FileFix {
            summary: format!("{}: {} of {} line(s) fixed", strategy.label(), changes.len(), requested),
            lines: changes,
            rewritten: Vec::new(),
        })
    }

    async fn regenerate(
        &self,
        session: &mut Session,
        ws: &Workspace<'_>,
        adapter: &FixOracleAdapter<'_>,
        mapping: &ErrorFileMapping,
        permit: RegenerationPermit,
    ) -> Result<FileFix> {
        let path = mapping.path.as_str();
        let content = ws.tree.read_optional(path).unwrap_or_default();
        let request = FixRequest::regenerate(&permit, content, mapping.error_summary(), ws.manifest.summary())
            .with_context(dependents_context(mapping));
        let strategy = FixStrategy::OracleFullRegenerate(permit);
        info!("Requesting regeneration of {}", path);

        let response = match adapter.request(&request).await? {
            OracleOutcome::Response(response) => response,
            OracleOutcome::Failed(reason) => return Ok(FileFix::failed(&strategy, reason)),
        };
        let applied = apply_file_response(ws.tree, ws.manifest, path, &response)?;
        for rejected in &applied.rejected {
            session.warn(format!("Rejected oracle write to {}", rejected));
        }
        if applied.written.is_empty() {
            return Ok(FileFix::failed(&strategy, "response wrote no files"));
        }
        Ok(FileFix {
            summary: format!("{}: wrote {}", strategy.label(), applied.written.join(", ")),
            lines: Vec::new(),
            rewritten: applied.written,
        })
    }

    // ========================================================================
    // Propagation
    // ========================================================================

    async fn propagate(
        &self,
        session: &mut Session,
        ws: &Workspace<'_>,
        adapter: &FixOracleAdapter<'_>,
        before: &SymbolIndex,
        round: &mut RoundChanges,
    ) -> Result<()> {
        let propagator = DependentPropagator::new(
            ws.tree,
            ws.manifest,
            ws.graph,
            before,
            self.config.context_radius,
        )
        .with_oracle(adapter);

        let mut work = Vec::new();
        for (path, changes) in &round.lines {
            if !round.rewritten.contains(path) {
                work.push((path.clone(), propagator.affected_by_changes(path, changes)));
            }
        }
        for path in &round.rewritten {
            if let Some(content) = ws.tree.read_optional(path) {
                work.push((path.clone(), propagator.affected_by_rewrite(path, &content)));
            }
        }

        for (path, affected) in work {
            if affected.is_empty() {
                continue;
            }
            let names: Vec<&str> = affected.iter().map(|a| a.name()).collect();
            session.log(format!("Propagating changes to {} from {}", names.join(", "), path));
            let outcome = propagator.propagate(&path, &affected).await?;
            for log in outcome.logs {
                session.warn(log);
            }
            round.propagated.extend(outcome.changes.into_keys());
        }
        Ok(())
    }

    fn finish(
        session: &mut Session,
        status: SessionStatus,
        report: &ValidationReport,
        map: &ErrorMap,
    ) -> PipelineResult {
        session.transition(status.state());
        PipelineResult {
            success: status == SessionStatus::Success,
            status,
            fixed_files: session.fixed_files(),
            remaining_errors: report.errors.clone(),
            warnings: report.warnings.clone(),
            unattributed_errors: map.unattributed.clone(),
            logs: session.rendered_log(),
            retry_count: session.retry_count,
            rounds: session.rounds,
            session_id: session.id().to_string(),
        }
    }
}

fn dependents_context(mapping: &ErrorFileMapping) -> String {
    if mapping.affected_dependents.is_empty() {
        String::new()
    } else {
        format!(
            "Files depending on the affected symbols: {}",
            mapping.affected_dependents.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileRole;
    use crate::testing::{MockFixOracle, ProjectFixture, ScriptedValidationOracle};
    use crate::validation::{PassOutcome, ValidationPass};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn config() -> FixloopConfig {
        FixloopConfig::default()
            .with_retry_backoff_ms(0)
            .with_persist_reports(false)
    }

    #[test]
    fn test_content_digest() {
        assert_eq!(content_digest("a"), content_digest("a"));
        assert_ne!(content_digest("a"), content_digest("b"));
        assert_eq!(content_digest("").len(), 64);
    }

    #[tokio::test]
    async fn test_install_failure_exhausts() {
        let temp = TempDir::new().unwrap();
        ProjectFixture::new(temp.path())
            .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
            .write()
            .unwrap();
        let validation = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::Install => PassOutcome::failed(["npm ERR! code ECONNRESET"]),
            _ => PassOutcome::passed(),
        });
        let oracle = MockFixOracle::new();

        let result = BuildFixPipeline::new(temp.path(), config(), &validation, &oracle)
            .run("install")
            .await
            .unwrap();
        assert_eq!(result.status, SessionStatus::Exhausted);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.rounds, 0);
        assert_eq!(validation.calls(ValidationPass::TypeCheck), 0);
    }

    #[tokio::test]
    async fn test_max_rounds_bound() {
        let temp = TempDir::new().unwrap();
        ProjectFixture::new(temp.path())
            .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
            .write()
            .unwrap();
        let validation = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::TypeCheck => PassOutcome::failed(["src/a.ts(1,14): error TS1005: ';' expected."]),
            _ => PassOutcome::passed(),
        });
        let counter = AtomicU32::new(2);
        let oracle = MockFixOracle::new().with_responder(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            format!(r#"{{"success": true, "fixedLine": "export const a = {};"}}"#, n)
        });

        let result = BuildFixPipeline::new(temp.path(), config().with_max_rounds(2), &validation, &oracle)
            .run("bounded")
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.status, SessionStatus::Exhausted);
        assert_eq!(result.rounds, 2);
        assert_eq!(oracle.call_count(), 2);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("src/a.ts")).unwrap(),
            "export const a = 3;\n"
        );
        assert!(result.logs.iter().any(|l| l.contains("limit of 2 fix rounds")));
    }

    #[tokio::test]
    async fn test_cancellation_checked_at_round_boundary() {
        let temp = TempDir::new().unwrap();
        ProjectFixture::new(temp.path())
            .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
            .write()
            .unwrap();
        let validation = ScriptedValidationOracle::new(|_, pass| match pass {
            ValidationPass::Build => PassOutcome::failed(["build failed"]),
            _ => PassOutcome::passed(),
        });
        let oracle = MockFixOracle::new();
        let flag = CancellationFlag::new();
        flag.cancel();

        let result = BuildFixPipeline::new(temp.path(), config(), &validation, &oracle)
            .with_cancellation(flag)
            .run("cancelled")
            .await
            .unwrap();
        assert_eq!(result.status, SessionStatus::Escalated);
        assert_eq!(result.rounds, 0);
        assert_eq!(result.unattributed_errors.len(), 1);
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_aborts_with_logs() {
        let temp = TempDir::new().unwrap();
        ProjectFixture::new(temp.path())
            .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
            .write()
            .unwrap();
        let validation = ScriptedValidationOracle::failing(|pass| match pass {
            ValidationPass::TypeCheck => Some(FixloopError::MissingTool {
                tool: "npx".to_string(),
            }),
            _ => None,
        });
        let oracle = MockFixOracle::new();

        let err = BuildFixPipeline::new(temp.path(), config(), &validation, &oracle)
            .run("fatal")
            .await
            .unwrap_err();
        match err {
            FixloopError::SessionAborted { session_id, logs, .. } => {
                assert_eq!(session_id, "fatal");
                assert!(logs.iter().any(|l| l.contains("Missing required tool: npx")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_report_is_persisted() {
        let temp = TempDir::new().unwrap();
        ProjectFixture::new(temp.path())
            .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
            .write()
            .unwrap();
        let validation = ScriptedValidationOracle::clean();
        let oracle = MockFixOracle::new();

        let result = BuildFixPipeline::new(
            temp.path(),
            config().with_persist_reports(true),
            &validation,
            &oracle,
        )
        .run("persisted")
        .await
        .unwrap();
        assert!(result.success);

        let reports = SessionReports::new(FixloopConfig::sessions_dir(temp.path()));
        let loaded = reports.load("persisted").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Success);
    }
}
