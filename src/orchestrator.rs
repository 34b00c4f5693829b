// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The run state machine.
//!
//! A deploy run moves through
//!
//! ```text
//! Idle -> Preflighting -> Rendering -> Deploying -> Verifying -> Succeeded
//! ```
//!
//! and drops to `Failed` from any stage. `Resetting` is entered from `Idle` on an explicit reset,
//! or from `Failed` when the rollback policy asks for it, and returns to `Idle` on success.
//!
//! Every run gets its own `Run` value, so nothing from a previous run's preflight or playbook
//! records leaks into the next one. Only one run may be active at a time: per Orchestrator, and
//! across processes through an advisory lock on a file next to the inventory.

use std::{
    fmt,
    fs::{File, OpenOptions},
    sync::Arc,
};

use {
    log::{debug, error, info, warn},
    nix::{
        errno::Errno,
        fcntl::{Flock, FlockArg},
    },
    tokio::sync::{Mutex, MutexGuard},
    tokio_util::sync::CancellationToken,
};

use crate::{
    cluster::ClusterSpec,
    config::Config,
    error::{ExecutionError, ReadinessError, RunError, VerificationError},
    executor::{
        AnsibleRunner, ExecutionRecord, ExecutionStatus, Executor, Mode, ProcessRunner, Procedure,
    },
    inventory,
    journal::{Event, Journal, Record},
    preflight::{self, Checker, NodeProbe, NodeReport, SshProbe},
    verify::{Backoff, ClusterStatus, KubectlStatus, Verifier},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preflighting,
    Rendering,
    Deploying,
    Verifying,
    Succeeded,
    Failed,
    Resetting,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Preflighting | Verifying | Resetting) => true,
            (Preflighting, Rendering) => true,
            (Rendering, Deploying) => true,
            (Deploying, Verifying) => true,
            (Verifying, Succeeded) => true,
            (Failed, Resetting) => true,
            (Resetting, Idle) => true,
            (Preflighting | Rendering | Deploying | Verifying | Resetting | Idle, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RunState::Idle => "idle",
                RunState::Preflighting => "preflighting",
                RunState::Rendering => "rendering",
                RunState::Deploying => "deploying",
                RunState::Verifying => "verifying",
                RunState::Succeeded => "succeeded",
                RunState::Failed => "failed",
                RunState::Resetting => "resetting",
            }
        )
    }
}

/// Everything that happened during one run.
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    /// Every state entered, starting with `Idle`.
    pub history: Vec<RunState>,
    /// Preflight results in registry order. Empty if preflight did not run.
    pub preflight: Vec<NodeReport>,
    /// Playbook records in the order they were made.
    pub records: Vec<ExecutionRecord>,
    /// Why the run failed.
    pub error: Option<RunError>,
    /// The state the run was in when it failed.
    pub failed_in: Option<RunState>,
    /// Set when the deploy playbook was started and did not succeed, so the cluster may be half
    /// deployed. A run stopped before or after the playbook leaves it unset.
    pub possibly_partial: bool,
    /// If a rollback reset was attempted after a failure and it failed too.
    pub rollback_error: Option<RunError>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            history: vec![RunState::Idle],
            preflight: Vec::new(),
            records: Vec::new(),
            error: None,
            failed_in: None,
            possibly_partial: false,
            rollback_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        match &self.error {
            Some(e) => e.exit_code(),
            None => crate::error::exit_code::SUCCESS,
        }
    }
}

/// Settings that shape a run, beyond the collaborators themselves.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    /// Maximum number of nodes probed at once during preflight.
    pub concurrency: usize,
    /// Run the reset playbook if a deploy fails once the playbook has started.
    pub reset_on_failure: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            reset_on_failure: false,
        }
    }
}

/// The state of a single run. Owned by the task driving it.
struct Run<'a> {
    cluster: &'a str,
    report: RunReport,
}

impl<'a> Run<'a> {
    fn new(cluster: &'a str) -> Self {
        Self {
            cluster,
            report: RunReport::new(),
        }
    }

    fn state(&self) -> RunState {
        self.report.state
    }

    fn enter(&mut self, next: RunState) {
        debug_assert!(
            self.state().can_transition_to(next),
            "invalid transition {} -> {next}",
            self.state()
        );
        info!("{}: {} -> {next}", self.cluster, self.state());
        self.report.state = next;
        self.report.history.push(next);
    }

    /// Move to `next`, unless the run has been canceled.
    fn advance(&mut self, next: RunState, cancel: &CancellationToken) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Canceled {
                stage: self.state(),
            });
        }
        self.enter(next);
        Ok(())
    }

    fn fail(&mut self, e: RunError) {
        let stage = match &e {
            RunError::Canceled { stage } => *stage,
            _ => self.state(),
        };
        error!("{}: run failed during {stage}: {e}", self.cluster);
        if self.report.possibly_partial {
            warn!(
                "{}: the deploy playbook did not finish; nodes may be partially configured",
                self.cluster
            );
        }
        self.report.failed_in = Some(stage);
        self.enter(RunState::Failed);
        self.report.error = Some(e);
    }
}

/// Held for the whole of a run. Dropping it releases both locks.
struct RunGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: Flock<File>,
}

/// Drives deploy, reset and verify runs for one cluster.
pub struct Orchestrator<P, R, S> {
    spec: Arc<ClusterSpec>,
    checker: Checker<P>,
    executor: Executor<R>,
    verifier: Verifier<S>,
    policy: RunPolicy,
    journal: Option<Journal>,
    /// Taken together with the lock file for the whole of a run; a run that cannot take either
    /// fails immediately.
    run_lock: Mutex<()>,
}

/// An Orchestrator wired to real nodes: ssh probes, `ansible-playbook` and `kubectl`.
pub type LiveOrchestrator = Orchestrator<SshProbe, AnsibleRunner, KubectlStatus>;

impl LiveOrchestrator {
    pub fn from_config(config: &Config, spec: ClusterSpec) -> Self {
        Orchestrator::new(
            spec,
            Checker::new(SshProbe::new(&config.preflight)),
            Executor::new(
                AnsibleRunner::new(&config.playbook),
                Procedure::from_options(&config.playbook),
            ),
            Verifier::new(
                KubectlStatus::new(&config.verify),
                Backoff::from_options(&config.verify),
            ),
            RunPolicy {
                concurrency: config.preflight.concurrency,
                reset_on_failure: config.playbook.reset_on_failure,
            },
        )
    }
}

impl<P: NodeProbe, R: ProcessRunner, S: ClusterStatus> Orchestrator<P, R, S> {
    pub fn new(
        spec: ClusterSpec,
        checker: Checker<P>,
        executor: Executor<R>,
        verifier: Verifier<S>,
        policy: RunPolicy,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            checker,
            executor,
            verifier,
            policy,
            journal: None,
            run_lock: Mutex::new(()),
        }
    }

    /// Record run events in `journal` as well as in each RunReport.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn checker(&self) -> &Checker<P> {
        &self.checker
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.executor
    }

    pub fn verifier(&self) -> &Verifier<S> {
        &self.verifier
    }

    /// Take the run lock of this Orchestrator, then the lock file shared with other processes
    /// driving the same inventory. Neither is waited for.
    fn lock_run(&self) -> Result<RunGuard<'_>, RunError> {
        let local = self
            .run_lock
            .try_lock()
            .map_err(|_| RunError::RunInProgress)?;

        let path = self.executor.procedure().lock_path();
        let lock_error = |source| RunError::Lock {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_error)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_error)?;
        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                info!("'{}' is locked by another process", path.display());
                return Err(RunError::RunInProgress);
            }
            Err((_, errno)) => return Err(lock_error(errno.into())),
        };
        debug!("locked '{}'", path.display());

        Ok(RunGuard {
            _local: local,
            _file: file,
        })
    }

    fn note(&self, event: Event, comment: Option<String>) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.write_record(&Record::new(event, self.spec.name(), comment)) {
            warn!("could not write {event} to the journal: {e}");
        }
    }

    fn note_records(&self, records: &[ExecutionRecord]) {
        for record in records {
            self.note(
                Event::Playbook,
                Some(format!(
                    "{} attempt {}: {:?}: {}",
                    record.mode, record.attempt, record.status, record.command
                )),
            );
        }
    }

    fn finish(&self, run: Run) -> RunReport {
        match &run.report.error {
            None => {}
            Some(e) => self.note(Event::RunFailed, Some(e.to_string())),
        }
        run.report
    }

    /// Run preflight on every node without starting a run.
    pub async fn preflight(&self) -> Vec<NodeReport> {
        self.checker
            .check_all(self.spec.nodes().all(), self.policy.concurrency)
            .await
    }

    /// Deploy the cluster: preflight, render, run the deploy playbook and wait for the nodes to
    /// become Ready.
    ///
    /// Returns `Err(RunError::RunInProgress)` without doing anything if another run, in this
    /// process or another one, holds the lock. Otherwise the outcome, successful or not, is in the returned RunReport.
    ///
    /// `observer` receives the playbook's output as it is produced.
    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<RunReport, RunError> {
        let _guard = self.lock_run()?;

        let mut run = Run::new(self.spec.name());
        self.note(Event::RunStart, Some("deploy".to_string()));

        if let Err(e) = self.deploy_stages(&mut run, cancel, observer).await {
            let rollback = self.policy.reset_on_failure
                && matches!(
                    e,
                    RunError::Execution(_) | RunError::Verification(VerificationError::Timeout { .. })
                );
            run.fail(e);
            if rollback {
                warn!("{}: rolling back with the reset playbook", self.spec.name());
                if let Err(e) = self.reset_stage(&mut run, cancel, observer).await {
                    error!("{}: rollback failed: {e}", self.spec.name());
                    if run.state() != RunState::Failed {
                        run.enter(RunState::Failed);
                    }
                    run.report.rollback_error = Some(e);
                }
            }
        }

        Ok(self.finish(run))
    }

    async fn deploy_stages(
        &self,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<(), RunError> {
        run.advance(RunState::Preflighting, cancel)?;
        run.report.preflight = self.preflight().await;
        let failures = preflight::failures(&run.report.preflight);
        if !failures.is_empty() {
            self.note(
                Event::PreflightFailed,
                Some(
                    failures
                        .iter()
                        .map(|f| f.hostname.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
            );
            return Err(ReadinessError { failures }.into());
        }

        run.advance(RunState::Rendering, cancel)?;
        let inventory = inventory::render(&self.spec)?;

        run.advance(RunState::Deploying, cancel)?;
        let execution = self
            .executor
            .execute(&inventory, Mode::Deploy, observer, cancel)
            .await;
        self.note_records(&execution.attempts);
        // A playbook that was started and did not succeed may have changed some nodes.
        let started = execution
            .attempts
            .iter()
            .any(|record| !matches!(record.status, ExecutionStatus::LaunchFailed(_)));
        run.report.records.extend(execution.attempts);
        if execution.result.is_err() && started {
            run.report.possibly_partial = true;
        }
        match execution.result {
            Ok(()) => self.note(Event::Deployed, None),
            Err(ExecutionError::Aborted) => {
                return Err(RunError::Canceled {
                    stage: RunState::Deploying,
                })
            }
            Err(e) => return Err(e.into()),
        }

        run.advance(RunState::Verifying, cancel)?;
        self.verify_stage(cancel).await?;
        run.enter(RunState::Succeeded);
        Ok(())
    }

    async fn verify_stage(&self, cancel: &CancellationToken) -> Result<(), RunError> {
        let expected: Vec<&str> = self
            .spec
            .nodes()
            .all()
            .iter()
            .map(|n| n.hostname())
            .collect();
        match self.verifier.wait_ready(&expected, cancel).await {
            Ok(()) => {
                self.note(Event::Verified, None);
                Ok(())
            }
            Err(VerificationError::Canceled) => Err(RunError::Canceled {
                stage: RunState::Verifying,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the reset playbook against the cluster, tearing down what a deploy installed.
    pub async fn reset(
        &self,
        cancel: &CancellationToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<RunReport, RunError> {
        let _guard = self.lock_run()?;

        let mut run = Run::new(self.spec.name());
        self.note(Event::RunStart, Some("reset".to_string()));

        if let Err(e) = self.reset_stage(&mut run, cancel, observer).await {
            run.fail(e);
        }
        Ok(self.finish(run))
    }

    /// Move `run` from Idle or Failed into Resetting, run the reset playbook, and go back to
    /// Idle. On error the run is left in Resetting for the caller to fail.
    async fn reset_stage(
        &self,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<(), RunError> {
        if !run.state().can_transition_to(RunState::Resetting) {
            return Err(RunError::InvalidTransition(run.state()));
        }
        run.advance(RunState::Resetting, cancel)?;

        let inventory = inventory::render(&self.spec)?;
        let execution = self
            .executor
            .execute(&inventory, Mode::Reset, observer, cancel)
            .await;
        self.note_records(&execution.attempts);
        run.report.records.extend(execution.attempts);
        match execution.result {
            Ok(()) => {
                self.note(Event::Reset, None);
                run.enter(RunState::Idle);
                Ok(())
            }
            Err(ExecutionError::Aborted) => Err(RunError::Canceled {
                stage: RunState::Resetting,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Only wait for the nodes to be Ready, for a cluster deployed earlier.
    pub async fn verify(&self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let _guard = self.lock_run()?;

        let mut run = Run::new(self.spec.name());
        let result = match run.advance(RunState::Verifying, cancel) {
            Ok(()) => self.verify_stage(cancel).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => run.enter(RunState::Succeeded),
            Err(e) => run.fail(e),
        }
        Ok(self.finish(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_path_is_allowed() {
        let path = [
            RunState::Idle,
            RunState::Preflighting,
            RunState::Rendering,
            RunState::Deploying,
            RunState::Verifying,
            RunState::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn terminal_and_reset_edges() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Succeeded.can_transition_to(RunState::Failed));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Resetting));
        assert!(RunState::Failed.can_transition_to(RunState::Resetting));
        assert!(RunState::Idle.can_transition_to(RunState::Resetting));
        assert!(RunState::Resetting.can_transition_to(RunState::Idle));
        assert!(!RunState::Preflighting.can_transition_to(RunState::Deploying));
        assert!(!RunState::Rendering.can_transition_to(RunState::Preflighting));
    }
}
