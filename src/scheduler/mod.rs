//! Processing scheduler.
//!
//! One loop per node. It wakes on the poll interval or on an operator
//! command, sweeps stale claims, discovers new files and works through the
//! queue in order, one claimed file at a time.
//!
//! ```text
//! idle ──tick / trigger──▶ running ──queue drained──▶ idle
//!                            │  ▲
//!            pause (between  │  │ resume
//!               files)       ▼  │
//!                           paused
//! ```
//!
//! Commands are only looked at between files, so a file that has started
//! always finishes (or fails) before a pause takes effect.

mod processor;

pub use processor::{FileProcessor, ProcessedFile, TransactionRange};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claim::{ClaimCoordinator, ClaimDecision};
use crate::config::SchedulerConfig;
use crate::dlq::DeadLetterQueue;
use crate::emit;
use crate::error::{ClaimStorageSnafu, QueueStorageSnafu, SchedulerError};
use crate::metrics::events::{
    FailureStage, FileFailed, FileProcessed, FileProcessingCompleted, FileStatus,
    SchedulerStateChanged,
};
use crate::source::InboxDiscovery;
use crate::store::{FailureOutcome, FileQueueRef, QueueStatus, QueuedFile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Run state of this node's scheduler. Written only by the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRun {
    pub state: SchedulerState,
    pub current_file_id: Option<String>,
    pub current_transaction_range: Option<TransactionRange>,
    pub queued_file_ids: Vec<String>,
    pub processing_errors: BTreeMap<String, String>,
    pub processed_file_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

impl ProcessingRun {
    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state == SchedulerState::Paused
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    Pause,
    Resume,
    /// Process now; an empty list means every queued file.
    Trigger { file_ids: Vec<String> },
}

/// Cloneable handle for sending commands and reading the run state.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    run: watch::Receiver<ProcessingRun>,
}

impl SchedulerHandle {
    pub async fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Resume).await
    }

    pub async fn trigger(&self, file_ids: Vec<String>) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Trigger { file_ids }).await
    }

    pub fn snapshot(&self) -> ProcessingRun {
        self.run.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessingRun> {
        self.run.clone()
    }
}

/// Which queued files a tick works on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TickScope {
    All,
    Files(Vec<String>),
}

impl TickScope {
    fn from_trigger(file_ids: Vec<String>) -> Self {
        if file_ids.is_empty() {
            TickScope::All
        } else {
            TickScope::Files(file_ids)
        }
    }

    fn merge(self, other: TickScope) -> TickScope {
        match (self, other) {
            (TickScope::Files(mut a), TickScope::Files(b)) => {
                a.extend(b);
                TickScope::Files(a)
            }
            _ => TickScope::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    NoWork,
    Drained,
    Paused,
    Shutdown,
}

fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    queue: FileQueueRef,
    claims: ClaimCoordinator,
    processor: FileProcessor,
    discovery: Option<InboxDiscovery>,
    dlq: Option<Arc<DeadLetterQueue>>,
    commands: mpsc::Receiver<SchedulerCommand>,
    commands_open: bool,
    run: watch::Sender<ProcessingRun>,
    paused: bool,
    pending: Option<TickScope>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        queue: FileQueueRef,
        claims: ClaimCoordinator,
        processor: FileProcessor,
        shutdown: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (run_tx, run_rx) = watch::channel(ProcessingRun::default());

        let scheduler = Self {
            config,
            queue,
            claims,
            processor,
            discovery: None,
            dlq: None,
            commands: command_rx,
            commands_open: true,
            run: run_tx,
            paused: false,
            pending: None,
            shutdown,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            run: run_rx,
        };
        (scheduler, handle)
    }

    pub fn with_discovery(mut self, discovery: InboxDiscovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    fn set_state(&self, state: SchedulerState) {
        let changed = self.run.send_if_modified(|run| {
            let changed = run.state != state;
            run.state = state;
            changed
        });
        if changed {
            emit!(SchedulerStateChanged {
                running: state == SchedulerState::Running,
                paused: state == SchedulerState::Paused,
            });
        }
    }

    fn resting_state(&self) -> SchedulerState {
        if self.paused {
            SchedulerState::Paused
        } else {
            SchedulerState::Idle
        }
    }

    /// Run until `shutdown` is cancelled. The first tick starts immediately.
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        info!(node_id = self.claims.node_id(), "Scheduler started");
        let mut next = Some(TickScope::All);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if let Some(scope) = next.take()
                && !self.paused
            {
                let outcome = match self.tick(scope).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            "Tick aborted, retrying on next tick: {}",
                            snafu::Report::from_error(e)
                        );
                        TickOutcome::NoWork
                    }
                };
                self.run.send_modify(|run| run.last_run_at = Some(Utc::now()));
                if outcome == TickOutcome::Shutdown {
                    break;
                }
                self.set_state(self.resting_state());

                if let Some(scope) = self.pending.take()
                    && !self.paused
                {
                    next = Some(scope);
                    continue;
                }
            }

            match self.wait().await {
                Some(scope) => next = Some(scope),
                None => break,
            }
        }

        self.run.send_modify(|run| run.next_scheduled_at = None);
        self.set_state(SchedulerState::Idle);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Sleep until the next scheduled tick or a command that starts one.
    /// Returns `None` on shutdown.
    async fn wait(&mut self) -> Option<TickScope> {
        let delay = self.config.poll_interval() + random_jitter(self.config.poll_jitter_secs);
        let deadline = tokio::time::Instant::now() + delay;
        let scheduled_at = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
        self.run
            .send_modify(|run| run.next_scheduled_at = Some(scheduled_at));
        debug!("Next tick in {}s", delay.as_secs());

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested during poll wait");
                    return None;
                }

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => {
                            if let Some(scope) = self.apply_idle(command) {
                                return Some(scope);
                            }
                        }
                        None => self.commands_open = false,
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    if self.paused {
                        debug!("Paused, skipping scheduled tick");
                        return self.wait_paused().await;
                    }
                    return Some(TickScope::All);
                }
            }
        }
    }

    /// While paused only commands (or shutdown) can move the loop on.
    async fn wait_paused(&mut self) -> Option<TickScope> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => {
                            if let Some(scope) = self.apply_idle(command) {
                                return Some(scope);
                            }
                        }
                        None => self.commands_open = false,
                    }
                }
            }
        }
    }

    /// Apply a command received while no tick is in progress.
    fn apply_idle(&mut self, command: SchedulerCommand) -> Option<TickScope> {
        match command {
            SchedulerCommand::Pause => {
                if !self.paused {
                    info!("Scheduler paused");
                    self.paused = true;
                    self.set_state(SchedulerState::Paused);
                }
                None
            }
            SchedulerCommand::Resume => {
                if self.paused {
                    info!("Scheduler resumed");
                    self.paused = false;
                    self.set_state(SchedulerState::Idle);
                    Some(TickScope::All)
                } else {
                    None
                }
            }
            SchedulerCommand::Trigger { file_ids } => {
                if self.paused {
                    warn!("Ignoring trigger while paused");
                    None
                } else {
                    info!(files = file_ids.len(), "Manual trigger");
                    Some(TickScope::from_trigger(file_ids))
                }
            }
        }
    }

    /// Drain commands at a file boundary. Returns true when a pause is due.
    fn apply_at_boundary(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SchedulerCommand::Pause => {
                    info!("Pause requested, stopping at file boundary");
                    self.paused = true;
                }
                SchedulerCommand::Resume => self.paused = false,
                SchedulerCommand::Trigger { file_ids } => {
                    let scope = TickScope::from_trigger(file_ids);
                    self.pending = Some(match self.pending.take() {
                        Some(pending) => pending.merge(scope),
                        None => scope,
                    });
                }
            }
        }
        self.paused
    }

    async fn tick(&mut self, scope: TickScope) -> Result<TickOutcome, SchedulerError> {
        let started = Instant::now();
        self.claims.sweep_stale().await.context(ClaimStorageSnafu)?;

        if self.config.auto_discover
            && let Some(discovery) = &self.discovery
            && let Err(e) = discovery.discover(self.queue.as_ref()).await
        {
            warn!("Discovery failed, working on the existing queue: {}", e);
        }

        let queued = self.queue.queued().await.context(QueueStorageSnafu)?;
        let files = select_files(queued, &scope);
        self.run.send_modify(|run| {
            run.queued_file_ids = files.iter().map(|f| f.file_id.clone()).collect();
        });
        if files.is_empty() {
            debug!("No queued files");
            return Ok(TickOutcome::NoWork);
        }

        self.set_state(SchedulerState::Running);
        info!("Processing {} queued files", files.len());

        let mut outcome = TickOutcome::Drained;
        for file in files {
            if self.shutdown.is_cancelled() {
                outcome = TickOutcome::Shutdown;
                break;
            }
            if self.apply_at_boundary() {
                outcome = TickOutcome::Paused;
                break;
            }
            self.process_file(&file).await?;
            self.run.send_modify(|run| {
                run.queued_file_ids.retain(|id| id != &file.file_id);
            });
        }

        // A pause that arrived during the last file still applies.
        if outcome == TickOutcome::Drained && self.apply_at_boundary() {
            outcome = TickOutcome::Paused;
        }

        let remaining = self.queue.queued().await.context(QueueStorageSnafu)?;
        self.run.send_modify(|run| {
            run.queued_file_ids = remaining.iter().map(|f| f.file_id.clone()).collect();
        });
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?outcome,
            "Tick finished"
        );
        Ok(outcome)
    }

    async fn process_file(&mut self, file: &QueuedFile) -> Result<(), SchedulerError> {
        match self.claims.try_claim(&file.file_id).await {
            Ok(ClaimDecision::Granted(_)) => {}
            Ok(ClaimDecision::Denied { .. }) => {
                emit!(FileProcessed {
                    status: FileStatus::Yielded
                });
                return Ok(());
            }
            Ok(ClaimDecision::Completed { owner_node_id }) => {
                info!(
                    file_id = %file.file_id,
                    owner = %owner_node_id,
                    "File already processed, dropping from queue"
                );
                emit!(FileProcessed {
                    status: FileStatus::Skipped
                });
                return self
                    .queue
                    .mark_completed(&file.file_id)
                    .await
                    .context(QueueStorageSnafu);
            }
            Err(e) if e.is_transient() => {
                warn!(file_id = %file.file_id, "Claim still contended, yielding: {}", e);
                emit!(FileProcessed {
                    status: FileStatus::Yielded
                });
                return Ok(());
            }
            Err(e) => return Err(e).context(ClaimStorageSnafu),
        }

        // The tick's snapshot may predate another node finishing this file.
        let file = match self.queue.get(&file.file_id).await {
            Ok(Some(current)) if current.status == QueueStatus::Queued => current,
            Ok(_) => {
                debug!(file_id = %file.file_id, "File left the queue before it was claimed");
                self.release_claim(&file.file_id).await;
                emit!(FileProcessed {
                    status: FileStatus::Skipped
                });
                return Ok(());
            }
            Err(e) => {
                self.release_claim(&file.file_id).await;
                return Err(e).context(QueueStorageSnafu);
            }
        };

        self.run
            .send_modify(|run| run.current_file_id = Some(file.file_id.clone()));
        let heartbeat = self.claims.start_heartbeat(&file.file_id);
        let started = Instant::now();

        let result = self.processor.process(&file).await;
        if heartbeat.is_lost() {
            warn!(file_id = %file.file_id, "Claim was taken over while processing");
        }
        drop(heartbeat);

        let succeeded = result.is_ok();
        let bookkeeping = match result {
            Ok(processed) => self.complete(&file, processed, started.elapsed()).await,
            Err(e) => {
                let stage = e.stage();
                let message = snafu::Report::from_error(e).to_string();
                self.fail(&file, stage, message).await
            }
        };

        if succeeded {
            if let Err(e) = self.claims.complete(&file.file_id).await {
                warn!(file_id = %file.file_id, "Failed to mark claim completed: {}", e);
            }
        } else {
            self.release_claim(&file.file_id).await;
        }
        self.run.send_modify(|run| run.current_file_id = None);
        bookkeeping
    }

    async fn release_claim(&self, file_id: &str) {
        if let Err(e) = self.claims.release(file_id).await {
            warn!(file_id, "Failed to release claim: {}", e);
        }
    }

    async fn complete(
        &mut self,
        file: &QueuedFile,
        processed: ProcessedFile,
        elapsed: Duration,
    ) -> Result<(), SchedulerError> {
        self.queue
            .mark_completed(&file.file_id)
            .await
            .context(QueueStorageSnafu)?;

        self.run.send_modify(|run| {
            run.processed_file_count += 1;
            run.processing_errors.remove(&file.file_id);
            if processed.transaction_range.is_some() {
                run.current_transaction_range = processed.transaction_range.clone();
            }
        });
        emit!(FileProcessed {
            status: FileStatus::Success
        });
        emit!(FileProcessingCompleted { duration: elapsed });
        Ok(())
    }

    async fn fail(
        &mut self,
        file: &QueuedFile,
        stage: FailureStage,
        message: String,
    ) -> Result<(), SchedulerError> {
        warn!(file_id = %file.file_id, stage = stage.as_str(), "File failed: {}", message);
        emit!(FileFailed { stage });

        let outcome = self
            .queue
            .record_failure(&file.file_id, &message, self.config.max_attempts)
            .await
            .context(QueueStorageSnafu)?;
        self.run.send_modify(|run| {
            run.processing_errors
                .insert(file.file_id.clone(), message.clone());
        });

        match outcome {
            FailureOutcome::Retry { attempts } => {
                info!(
                    file_id = %file.file_id,
                    attempts,
                    max_attempts = self.config.max_attempts,
                    "File stays queued for retry"
                );
                emit!(FileProcessed {
                    status: FileStatus::Failed
                });
            }
            FailureOutcome::Permanent { attempts } => {
                error!(file_id = %file.file_id, attempts, "File permanently failed");
                emit!(FileProcessed {
                    status: FileStatus::PermanentlyFailed
                });
                if let Some(dlq) = &self.dlq
                    && let Err(e) = dlq
                        .record_failure(&file.file_id, &file.location, &message, stage, attempts)
                        .await
                {
                    error!(file_id = %file.file_id, "Failed to write DLQ record: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Queued files a tick should work on, in queue order.
fn select_files(queued: Vec<QueuedFile>, scope: &TickScope) -> Vec<QueuedFile> {
    match scope {
        TickScope::All => queued,
        TickScope::Files(ids) => {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let selected: Vec<QueuedFile> = queued
                .into_iter()
                .filter(|f| wanted.contains(f.file_id.as_str()))
                .collect();
            if selected.len() < wanted.len() {
                warn!(
                    requested = wanted.len(),
                    queued = selected.len(),
                    "Some triggered files are not queued"
                );
            }
            selected
        }
    }
}
