//! Bounded pool of workers that claim queued jobs and drive them to a terminal state.

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::models::events::JobEvent;
use crate::models::job::{JobStatus, WriteOutcome};
use crate::services::pipeline::{PipelineError, ProgressReporter, RunOutcome};
use crate::services::queue::{
    duration_ms, now_ms, Lease, QueueBackend, QueueError, QueuedTask, ReclaimedTasks,
    TaskOutcome, TaskRecord,
};

/// Progress updates buffered per run before newer ones are dropped.
const PROGRESS_BUFFER: usize = 32;

const MIN_TICK: Duration = Duration::from_millis(10);

pub const STALLED_ERROR: &str = "Job stalled more than the allowed number of times";

/// Work executed for each claimed task.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        job_id: Uuid,
        progress: ProgressReporter,
    ) -> Result<RunOutcome, PipelineError>;
}

/// Running pool. Dropping it stops workers once their current task is done;
/// [`WorkerPool::shutdown`] also waits for that.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers plus the stalled-lease sweeper.
    pub fn start(ctx: PipelineContext, runner: Arc<dyn JobRunner>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let concurrency = ctx.queue.config().concurrency.max(1);

        let mut handles = Vec::with_capacity(concurrency + 1);
        for worker_id in 0..concurrency {
            let worker = Worker {
                id: worker_id,
                ctx: ctx.clone(),
                runner: runner.clone(),
            };
            handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        handles.push(tokio::spawn(sweep_stalled(ctx, shutdown_rx)));

        info!(concurrency, "Worker pool started");
        Self { shutdown, handles }
    }

    /// Stop claiming new tasks and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

/// Sleep for `duration`, waking early on a shutdown signal.
/// Returns false once the pool handle is gone.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok(),
    }
}

struct Worker {
    id: usize,
    ctx: PipelineContext,
    runner: Arc<dyn JobRunner>,
}

impl Worker {
    fn backend(&self) -> &Arc<dyn QueueBackend> {
        self.ctx.queue.backend()
    }

    fn lease_deadline(&self) -> i64 {
        now_ms().saturating_add(duration_ms(self.ctx.queue.config().stall_timeout))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.ctx.queue.config().poll_interval;
        debug!(worker = self.id, "Worker started");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let keep_running = match self.backend().claim(now_ms(), self.lease_deadline()).await {
                Ok(Some(lease)) => {
                    self.process(lease).await;
                    true
                }
                Ok(None) => pause(poll_interval, &mut shutdown).await,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Failed to claim task");
                    pause(poll_interval, &mut shutdown).await
                }
            };
            if !keep_running {
                break;
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, lease: Lease) {
        let job_id = lease.task.job_id;
        let attempt = lease.task.attempts_made + 1;
        info!(worker = self.id, job_id = %job_id, attempt, "Processing job");

        // A retry whose reset did not persist would find a failed record and skip.
        if lease.task.attempts_made > 0 {
            if let Err(e) = self.ctx.store.reset_for_retry(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to reset job before retry, postponing");
                self.postpone(&lease).await;
                return;
            }
        }

        let owner_id = match self.ctx.store.find_by_id(job_id).await {
            Ok(job) => job.map(|j| j.owner_id),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not look up job owner");
                None
            }
        };

        let (progress_tx, progress_rx) = mpsc::channel::<u8>(PROGRESS_BUFFER);
        let reporter = ProgressReporter::new(move |percent| {
            let _ = progress_tx.try_send(percent);
        });
        let forwarder = tokio::spawn(forward_progress(
            progress_rx,
            self.ctx.clone(),
            lease.clone(),
            owner_id,
        ));

        let started = Instant::now();
        let mut run = Box::pin(self.runner.run(job_id, reporter));
        let mut renew = interval((self.ctx.queue.config().stall_timeout / 3).max(MIN_TICK));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut run => break Some(result),
                _ = renew.tick() => {
                    match self.backend().heartbeat(&lease, self.lease_deadline()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job_id, "Lease lost to stall recovery, abandoning run");
                            break None;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        };
        drop(run);
        if let Err(e) = forwarder.await {
            warn!(job_id = %job_id, error = %e, "Progress forwarder panicked");
        }

        let Some(result) = result else {
            return;
        };

        histogram!("plate_scan_job_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(RunOutcome::Completed { owner_id, detections }) => {
                self.finish_completed(&lease, owner_id, detections).await;
            }
            Ok(RunOutcome::Skipped) => {
                if let Err(e) = self.backend().release(&lease).await {
                    warn!(job_id = %job_id, error = %e, "Failed to release skipped task");
                }
            }
            Err(err) if err.is_retryable() && attempt < self.ctx.queue.config().max_attempts => {
                self.retry(&lease, attempt, &err).await;
            }
            Err(err) => self.finish_failed(&lease, owner_id, attempt, &err).await,
        }
    }

    /// Put the task back after its current backoff without using up an attempt.
    async fn postpone(&self, lease: &Lease) {
        let job_id = lease.task.job_id;
        let delay = self.ctx.queue.backoff_delay(lease.task.attempts_made.max(1));
        let ready_at = now_ms().saturating_add(duration_ms(delay));
        match self.backend().reschedule(lease, &lease.task, ready_at).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job_id, "Lease lost before task could be postponed"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to postpone task"),
        }
    }

    /// Drop the copy of a task that stall recovery put back after this run
    /// had already finished the job.
    async fn discard_redispatch(&self, job_id: Uuid) {
        match self.backend().discard(job_id).await {
            Ok(true) => debug!(job_id = %job_id, "Discarded re-dispatched task"),
            Ok(false) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to discard re-dispatched task"),
        }
    }

    /// The completed write was applied by this run, so the bookkeeping is
    /// owed even when the lease was lost meanwhile.
    async fn finish_completed(&self, lease: &Lease, owner_id: Uuid, detections: usize) {
        let job_id = lease.task.job_id;
        match self.backend().release(lease).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "Lease lost before completion bookkeeping");
                self.discard_redispatch(job_id).await;
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to release completed task"),
        }

        let record = TaskRecord {
            task: lease.task.clone(),
            finished_at: Utc::now(),
            outcome: TaskOutcome::Completed {
                detected_plates: detections,
            },
        };
        if let Err(e) = self
            .backend()
            .record(&record, self.ctx.queue.config().keep_completed)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to record completed task");
        }

        self.ctx
            .notifier
            .notify(JobEvent::completed(job_id, owner_id, detections));
        counter!("plate_scan_jobs_completed_total").increment(1);
    }

    async fn retry(&self, lease: &Lease, attempt: u32, err: &PipelineError) {
        let job_id = lease.task.job_id;
        match self.ctx.store.reset_for_retry(job_id).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job_id, "Job was not in failed state before retry"),
            Err(e) => warn!(
                job_id = %job_id,
                error = %e,
                "Failed to reset job for retry, will reset on next attempt"
            ),
        }

        let delay = self.ctx.queue.backoff_delay(attempt);
        let mut task = lease.task.clone();
        task.attempts_made = attempt;
        let ready_at = now_ms().saturating_add(duration_ms(delay));

        match self.backend().reschedule(lease, &task, ready_at).await {
            Ok(true) => {
                counter!("plate_scan_jobs_retried_total").increment(1);
                info!(
                    job_id = %job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job failed, retrying"
                );
            }
            Ok(false) => debug!(job_id = %job_id, "Lease lost before retry could be scheduled"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to reschedule task"),
        }
    }

    async fn finish_failed(
        &self,
        lease: &Lease,
        owner_id: Option<Uuid>,
        attempt: u32,
        err: &PipelineError,
    ) {
        let job_id = lease.task.job_id;
        let message = err.to_string();

        let written = match self.ctx.store.fail(job_id, &message, Utc::now()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to persist job failure");
                None
            }
        };

        match self.backend().release(lease).await {
            Ok(true) => {}
            Ok(false) => {
                if !self.failure_written_by_run(job_id, written, &message).await {
                    debug!(job_id = %job_id, "Lease lost before failure bookkeeping");
                    return;
                }
                self.discard_redispatch(job_id).await;
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to release failed task"),
        }

        let mut task = lease.task.clone();
        task.attempts_made = attempt;
        let record = TaskRecord {
            task,
            finished_at: Utc::now(),
            outcome: TaskOutcome::Failed {
                error: message.clone(),
            },
        };
        if let Err(e) = self
            .backend()
            .record(&record, self.ctx.queue.config().keep_failed)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to record failed task");
        }

        if let Some(owner_id) = owner_id {
            self.ctx
                .notifier
                .notify(JobEvent::failed(job_id, owner_id, &message));
        }
        counter!("plate_scan_jobs_failed_total").increment(1);
        error!(job_id = %job_id, attempt, error = %message, "Job failed permanently");
    }

    /// Whether the failed record carries this run's error. The pipeline
    /// writes the failure itself, so the pool's own write is usually a no-op.
    async fn failure_written_by_run(
        &self,
        job_id: Uuid,
        written: Option<WriteOutcome>,
        message: &str,
    ) -> bool {
        if written == Some(WriteOutcome::Applied) {
            return true;
        }
        match self.ctx.store.find_by_id(job_id).await {
            Ok(Some(job)) => {
                job.status == JobStatus::Failed && job.error_message.as_deref() == Some(message)
            }
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not re-read failed job");
                false
            }
        }
    }
}

/// Persist progress, renew the lease and publish an event for each report.
async fn forward_progress(
    mut progress: mpsc::Receiver<u8>,
    ctx: PipelineContext,
    lease: Lease,
    owner_id: Option<Uuid>,
) {
    let job_id = lease.task.job_id;
    let stall_timeout = duration_ms(ctx.queue.config().stall_timeout);

    while let Some(percent) = progress.recv().await {
        if let Err(e) = ctx.store.update_progress(job_id, percent).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist progress");
        }
        if let Err(e) = ctx
            .queue
            .backend()
            .heartbeat(&lease, now_ms().saturating_add(stall_timeout))
            .await
        {
            warn!(job_id = %job_id, error = %e, "Heartbeat failed");
        }
        if let Some(owner_id) = owner_id {
            ctx.notifier
                .notify(JobEvent::progress(job_id, owner_id, percent));
        }
    }
}

/// Reclaim expired leases once. Tasks over the stall limit are failed with
/// the same bookkeeping as a final pipeline failure.
pub async fn reclaim_stalled_tasks(
    ctx: &PipelineContext,
    now_ms: i64,
) -> Result<ReclaimedTasks, QueueError> {
    let reclaimed = ctx
        .queue
        .backend()
        .reclaim_stalled(now_ms, ctx.queue.config().max_stalled_count)
        .await?;

    for task in &reclaimed.requeued {
        counter!("plate_scan_tasks_stalled_total").increment(1);
        warn!(
            job_id = %task.job_id,
            stalled_count = task.stalled_count,
            "Stalled task returned to queue"
        );
    }
    for task in &reclaimed.exhausted {
        counter!("plate_scan_tasks_stalled_total").increment(1);
        fail_stalled(ctx, task).await;
    }
    Ok(reclaimed)
}

async fn fail_stalled(ctx: &PipelineContext, task: &QueuedTask) {
    let job_id = task.job_id;
    match ctx.store.fail(job_id, STALLED_ERROR, Utc::now()).await {
        Ok(WriteOutcome::Applied) => {}
        Ok(outcome) => {
            debug!(job_id = %job_id, ?outcome, "Dropped stalled task for a finished job");
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to persist stalled job failure");
            return;
        }
    }

    let record = TaskRecord {
        task: task.clone(),
        finished_at: Utc::now(),
        outcome: TaskOutcome::Failed {
            error: STALLED_ERROR.to_string(),
        },
    };
    if let Err(e) = ctx
        .queue
        .backend()
        .record(&record, ctx.queue.config().keep_failed)
        .await
    {
        warn!(job_id = %job_id, error = %e, "Failed to record stalled task");
    }

    match ctx.store.find_by_id(job_id).await {
        Ok(Some(job)) => ctx
            .notifier
            .notify(JobEvent::failed(job_id, job.owner_id, STALLED_ERROR)),
        Ok(None) => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "Could not look up job owner"),
    }
    counter!("plate_scan_jobs_failed_total").increment(1);
    error!(job_id = %job_id, stalled_count = task.stalled_count, "Job failed after stalling");
}

/// Periodically return tasks with expired leases to the waiting set.
async fn sweep_stalled(ctx: PipelineContext, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.queue.config().stall_check_interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        if let Err(e) = reclaim_stalled_tasks(&ctx, now_ms()).await {
            error!(error = %e, "Stalled task sweep failed");
        }
    }
}
