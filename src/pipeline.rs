//! Run orchestration
//!
//! A run goes through these steps:
//! 1. Create the run context (run id, run directory, provision barrier)
//! 2. Provision emulation once for every distinct enabled arch
//! 3. Fan out over enabled entries with at most `parallel` in flight.
//!    Each entry goes workspace → build → collect → publish → teardown
//! 4. Aggregate entry outcomes, in matrix order, into a [`RunReport`]
//!
//! Entry-scoped errors end up in that entry's [`EntryOutcome`] and never
//! reach sibling entries. Only a provisioning failure stops the whole run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::collect::{ArtifactCollector, ArtifactSpec};
use crate::config::{ConfigError, EffectiveConfig, PipelineSettings, EFFECTIVE_CONFIG_FILE};
use crate::emulation::{BinfmtEmulation, EmulationBackend, EmulationProvisioner};
use crate::job::{generate_run_id, BuildJob};
use crate::matrix::{host_arch, PlatformEntry, PlatformMatrix};
use crate::publish::{ArtifactPublisher, ArtifactSink, NamingRule};
use crate::runner::{BuildError, CliContainerRuntime, ContainerBuildRunner, ContainerRuntime};
use crate::signal::CancellationCoordinator;
use crate::state::{RunState, RunStateData};
use crate::summary::{EntryOutcome, ExitCode, Failure, RunReport, Status, RUN_REPORT_FILE};
use crate::workspace::WorkspaceManager;

pub const RUN_STATE_FILE: &str = "run_state.json";

/// Dry-run description of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedEntry {
    pub platform: String,
    pub arch: String,
    /// Registration would be required for this arch
    pub emulated: bool,
    pub container_name: String,
    /// Full command line, program first
    pub command: Vec<String>,
}

/// Dry-run description of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub run_id: String,
    pub runtime: String,
    pub host_arch: String,
    pub parallel: usize,
    /// Emulation registration would be attempted
    pub provision: bool,
    pub entries: Vec<PlannedEntry>,
}

/// Per-run state shared by the workers
struct RunContext<'a> {
    run_id: String,
    manager: WorkspaceManager,
    runner: ContainerBuildRunner,
    publisher: ArtifactPublisher,
    naming: NamingRule,
    image: &'a str,
    entrypoint: &'a Path,
    spec: &'a ArtifactSpec,
}

pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    runtime: Arc<dyn ContainerRuntime>,
    emulation: Arc<dyn EmulationBackend>,
    sink: Arc<dyn ArtifactSink>,
    cancel: CancellationCoordinator,
    host_arch: String,
    effective_config: Option<EffectiveConfig>,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: PipelineSettings,
        runtime: Arc<dyn ContainerRuntime>,
        emulation: Arc<dyn EmulationBackend>,
        sink: Arc<dyn ArtifactSink>,
        cancel: CancellationCoordinator,
    ) -> Self {
        Self {
            settings,
            runtime,
            emulation,
            sink,
            cancel,
            host_arch: host_arch().to_string(),
            effective_config: None,
        }
    }

    /// Production wiring: container CLI runtime, binfmt emulation, and the
    /// configured local sink
    pub fn from_settings(settings: PipelineSettings, cancel: CancellationCoordinator) -> Self {
        let runtime = CliContainerRuntime::new(&settings.runtime.program, &settings.timeout);
        let emulation = BinfmtEmulation::new(runtime.cli().clone(), settings.emulation.image.clone());
        let sink = settings.bundle.sink(settings.output_dir.clone());
        Self::new(settings, Arc::new(runtime), Arc::new(emulation), sink, cancel)
    }

    /// Override the detected host arch
    pub fn with_host_arch(mut self, host_arch: impl Into<String>) -> Self {
        self.host_arch = host_arch.into();
        self
    }

    /// Record `config` as `effective_config.json` in each run directory
    pub fn with_effective_config(mut self, config: EffectiveConfig) -> Self {
        self.effective_config = Some(config);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the configured matrix with the configured image, entrypoint and
    /// artifact rules
    pub fn run(&self) -> Result<RunReport, ConfigError> {
        let matrix = self.settings.platform_matrix()?;
        let spec = self.settings.artifact_spec()?;
        Ok(self.run_all(&matrix, &self.settings.image, &self.settings.entrypoint, &spec))
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.settings.work_root.join(run_id)
    }

    fn provisioner(&self) -> EmulationProvisioner {
        EmulationProvisioner::with_host_arch(
            Arc::clone(&self.emulation),
            self.settings.emulation.mode,
            self.host_arch.clone(),
        )
    }

    fn workspace_manager(&self, run_dir: PathBuf) -> Result<WorkspaceManager, crate::workspace::WorkspaceError> {
        WorkspaceManager::new(
            self.settings.source_root.clone(),
            run_dir,
            self.settings.workspace.clone(),
            vec![self.settings.work_root.clone(), self.settings.output_dir.clone()],
        )
    }

    fn runner(&self) -> ContainerBuildRunner {
        ContainerBuildRunner::new(
            Arc::clone(&self.runtime),
            self.settings.runtime.clone(),
            self.settings.timeout,
            self.cancel.clone(),
        )
    }

    /// Describe the invocations of a run without side effects
    pub fn plan(&self, matrix: &PlatformMatrix) -> Result<RunPlan, ConfigError> {
        let run_id = generate_run_id();
        let manager = self
            .workspace_manager(self.run_dir(&run_id))
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        let provisioner = self.provisioner();
        let runner = self.runner();

        let entries = matrix
            .entries()
            .map(|entry| {
                let job = BuildJob::new(
                    &run_id,
                    entry.clone(),
                    manager.planned_paths(entry),
                    &self.settings.image,
                    &self.settings.entrypoint,
                );
                let mut command = vec![self.runtime.name().to_string()];
                command.extend(runner.invocation(&job).run_args());
                PlannedEntry {
                    platform: entry.platform.clone(),
                    arch: entry.arch.clone(),
                    emulated: provisioner.needs_emulation(&entry.arch),
                    container_name: job.container_name,
                    command,
                }
            })
            .collect::<Vec<_>>();

        Ok(RunPlan {
            run_id,
            runtime: self.runtime.name().to_string(),
            host_arch: self.host_arch.clone(),
            parallel: self.settings.parallel,
            provision: entries.iter().any(|e| e.emulated),
            entries,
        })
    }

    /// Build, collect and publish every enabled entry of `matrix`.
    ///
    /// Always returns a report; the report is also written to
    /// `<work_root>/<run_id>/run_report.json`.
    pub fn run_all(
        &self,
        matrix: &PlatformMatrix,
        image: &str,
        entrypoint: &Path,
        spec: &ArtifactSpec,
    ) -> RunReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = generate_run_id();
        let run_dir = self.run_dir(&run_id);
        let entries: Vec<&PlatformEntry> = matrix.entries().collect();

        info!(run_id = %run_id, entries = entries.len(), parallel = self.settings.parallel, "run started");

        let mut run_state = RunStateData::new(run_id.clone(), entries.len());
        self.persist_state(&run_state, &run_dir);
        if let Some(config) = &self.effective_config {
            let path = run_dir.join(EFFECTIVE_CONFIG_FILE);
            if let Err(e) = config.clone().with_run_id(&run_id).write_to_file(&path) {
                warn!(run_id = %run_id, error = %e, "failed to write effective config");
            }
        }

        if self.cancel.is_cancelled() {
            let outcomes = entries.iter().map(|e| EntryOutcome::not_started(e)).collect();
            let report = RunReport::from_outcomes(run_id, started_at, None, outcomes, elapsed_ms(started));
            return self.finish(report, run_state, &run_dir);
        }

        self.advance(&mut run_state, RunState::Provisioning, &run_dir);
        let provisioner = self.provisioner();
        let provision = provisioner.ensure_all(&matrix.enabled_arches());
        if let Some(error) = provision.error.clone() {
            warn!(run_id = %run_id, error = %error, "emulation provisioning failed; aborting run");
            let message = format!("emulation provisioning failed: {}", error);
            let report = RunReport::aborted(
                run_id,
                started_at,
                provision,
                ExitCode::ProvisionFailed,
                &message,
                elapsed_ms(started),
            );
            return self.finish(report, run_state, &run_dir);
        }
        self.advance(&mut run_state, RunState::Running, &run_dir);

        let outcomes = match self.workspace_manager(run_dir.clone()) {
            Ok(manager) => {
                let ctx = RunContext {
                    run_id: run_id.clone(),
                    manager,
                    runner: self.runner(),
                    publisher: ArtifactPublisher::new(Arc::clone(&self.sink), self.cancel.clone()),
                    naming: self.settings.bundle.naming_rule(),
                    image,
                    entrypoint,
                    spec,
                };
                self.fan_out(&ctx, &entries)
            }
            Err(e) => {
                let failure = Failure::from_build(&BuildError::Workspace(e));
                entries
                    .iter()
                    .map(|entry| EntryOutcome::failed(entry, failure.clone(), 0))
                    .collect()
            }
        };

        let report = RunReport::from_outcomes(
            run_id,
            started_at,
            Some(provision),
            outcomes,
            elapsed_ms(started),
        );
        self.finish(report, run_state, &run_dir)
    }

    /// Process `entries` on a bounded pool, returning outcomes in input order
    fn fan_out(&self, ctx: &RunContext<'_>, entries: &[&PlatformEntry]) -> Vec<EntryOutcome> {
        let slots: Vec<Mutex<Option<EntryOutcome>>> = entries.iter().map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);
        let workers = self.settings.parallel.max(1).min(entries.len());

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(entry) = entries.get(index) else {
                        break;
                    };
                    let outcome = if self.cancel.is_cancelled() {
                        info!(platform = %entry.platform, "skipping entry: run cancelled");
                        EntryOutcome::not_started(entry)
                    } else {
                        self.process_entry(ctx, entry)
                    };
                    if let Ok(mut slot) = slots[index].lock() {
                        *slot = Some(outcome);
                    }
                });
            }
        });

        slots
            .into_iter()
            .zip(entries)
            .map(|(slot, entry)| {
                slot.into_inner()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| EntryOutcome::not_started(entry))
            })
            .collect()
    }

    fn process_entry(&self, ctx: &RunContext<'_>, entry: &PlatformEntry) -> EntryOutcome {
        let started = Instant::now();
        info!(run_id = %ctx.run_id, platform = %entry.platform, arch = %entry.arch, "processing entry");

        let outputs = match ctx.spec.declared_outputs(entry) {
            Ok(outputs) => outputs,
            Err(e) => {
                let failure = Failure {
                    exit_code: None,
                    ..Failure::from_collect(&e)
                };
                return EntryOutcome::failed(entry, failure, elapsed_ms(started));
            }
        };

        let paths = match ctx.manager.prepare(entry, &outputs) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(platform = %entry.platform, error = %e, "workspace preparation failed");
                let failure = Failure::from_build(&BuildError::Workspace(e));
                return EntryOutcome::failed(entry, failure, elapsed_ms(started));
            }
        };

        let mut job = BuildJob::new(&ctx.run_id, entry.clone(), paths.clone(), ctx.image, ctx.entrypoint);
        let job_key = job
            .key_inputs(&self.settings.runtime.env)
            .compute_job_key()
            .map_err(|e| warn!(platform = %entry.platform, error = %e, "failed to compute job key"))
            .ok();

        let result = self.build_collect_publish(ctx, &mut job);
        let outcome = match result {
            Ok(receipt) => EntryOutcome::published(entry, receipt, elapsed_ms(started)),
            Err(failure) => {
                if !failure.is_cancelled() {
                    warn!(platform = %entry.platform, stage = %failure.stage, error = %failure.message, "entry failed");
                }
                EntryOutcome::failed(entry, failure, elapsed_ms(started))
            }
        };

        let kept = match ctx.manager.teardown(&paths, outcome.status == Status::Success) {
            Ok(removed) => paths.isolated && !removed,
            Err(e) => {
                warn!(platform = %entry.platform, error = %e, "workspace teardown failed");
                paths.isolated
            }
        };
        let workspace = kept.then(|| paths.root.display().to_string());

        outcome.with_job(job.job_id.clone(), job_key).with_workspace(workspace)
    }

    fn build_collect_publish(
        &self,
        ctx: &RunContext<'_>,
        job: &mut BuildJob,
    ) -> Result<crate::publish::PublishReceipt, Failure> {
        let workspace = ctx.runner.run(job).map_err(|e| Failure::from_build(&e))?;

        let bundle = match ArtifactCollector::new().collect(&workspace, &job.entry, ctx.spec) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.downgrade(job);
                return Err(Failure::from_collect(&e));
            }
        };

        ctx.publisher.publish(bundle, &ctx.naming).map_err(|e| {
            let failure = Failure::from_publish(&e);
            if !failure.is_cancelled() {
                self.downgrade(job);
            }
            failure
        })
    }

    /// Succeeded → Failed after a post-build failure
    fn downgrade(&self, job: &mut BuildJob) {
        if let Err(e) = job.transition(crate::state::JobState::Failed) {
            warn!(job_id = %job.job_id, error = %e, "failed to record job failure");
        }
    }

    fn advance(&self, run_state: &mut RunStateData, state: RunState, run_dir: &Path) {
        if let Err(e) = run_state.transition(state) {
            warn!(run_id = %run_state.run_id, error = %e, "invalid run state transition");
            return;
        }
        self.persist_state(run_state, run_dir);
    }

    fn persist_state(&self, run_state: &RunStateData, run_dir: &Path) {
        if let Err(e) = run_state.write_to_file(&run_dir.join(RUN_STATE_FILE)) {
            warn!(run_id = %run_state.run_id, error = %e, "failed to persist run state");
        }
    }

    fn finish(&self, report: RunReport, mut run_state: RunStateData, run_dir: &Path) -> RunReport {
        let terminal = match report.status {
            Status::Success => RunState::Succeeded,
            Status::Failed => RunState::Failed,
            Status::Cancelled => RunState::Cancelled,
        };
        self.advance(&mut run_state, terminal, run_dir);

        let path = run_dir.join(RUN_REPORT_FILE);
        if let Err(e) = report.write_to_file(&path) {
            warn!(run_id = %report.run_id, error = %e, "failed to write run report");
        }
        info!(
            run_id = %report.run_id,
            exit_code = report.exit_code,
            duration_ms = report.duration_ms,
            "{}",
            report.human_summary
        );
        report
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
