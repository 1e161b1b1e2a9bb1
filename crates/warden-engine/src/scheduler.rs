//! Bounded worker pool for agent turns.
//!
//! Accepted tasks wait in a bounded channel. A dispatcher takes a semaphore
//! permit and then a job, and spawns the job on a [`TaskTracker`]. A task
//! holds its permit for the whole run, including any time spent waiting for
//! permission, so `max_workers` bounds computing and awaiting-approval
//! sessions together.
//!
//! A session owns at most one task from acceptance to completion. A second
//! submission while one is queued or running is rejected with
//! [`SubmitError::SessionBusy`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use warden_core::ids::{SessionId, TaskId};
use warden_core::task::{AgentTask, TaskEvent, TaskOutcome, TaskState};
use warden_core::{Broker, Event, EventKind};
use warden_telemetry::MetricsRecorder;

use crate::error::{EngineError, SubmitError};
use crate::runtime::{AgentRuntime, RunContext};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Per-task wall clock limit.
    pub task_timeout: Option<Duration>,
    /// How long a cancelled runtime gets to wind down before it is dropped.
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            queue_capacity: 1000,
            task_timeout: Some(Duration::from_secs(30 * 60)),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Handle to an accepted task.
#[derive(Debug)]
pub struct TaskTicket {
    pub task_id: TaskId,
    pub outcome: oneshot::Receiver<TaskOutcome>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub rejected: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Tasks still running when the timeout elapsed.
    pub forced: usize,
}

struct Job {
    task_id: TaskId,
    task: AgentTask,
    cancel: CancellationToken,
    outcome_tx: oneshot::Sender<TaskOutcome>,
}

struct ActiveTask {
    task_id: TaskId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    queued: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    rejected: AtomicU64,
}

struct Inner {
    config: SchedulerConfig,
    runtime: Arc<dyn AgentRuntime>,
    active: DashMap<SessionId, ActiveTask>,
    accepting: AtomicBool,
    queue_tx: mpsc::Sender<Job>,
    counters: Counters,
    events: Broker<TaskEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
    /// Parent of every task token; fired when shutdown runs out of time.
    force_cancel: CancellationToken,
    stop_intake: CancellationToken,
    tracker: TaskTracker,
}

pub struct AgentScheduler {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    report: OnceCell<ShutdownReport>,
}

impl AgentScheduler {
    /// Build the pool and start its dispatcher. Must be called inside a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        runtime: Arc<dyn AgentRuntime>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let inner = Arc::new(Inner {
            config,
            runtime,
            active: DashMap::new(),
            accepting: AtomicBool::new(true),
            queue_tx,
            counters: Counters::default(),
            events: Broker::default(),
            metrics,
            force_cancel: CancellationToken::new(),
            stop_intake: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner), queue_rx, semaphore));
        info!(
            max_workers = inner.config.max_workers,
            queue_capacity = inner.config.queue_capacity,
            "agent scheduler started"
        );

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
            report: OnceCell::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<TaskEvent>> {
        self.inner.events.subscribe()
    }

    /// Enqueue a task. Never waits for a worker.
    #[instrument(skip(self, task), fields(session_id = %task.session_id))]
    pub fn submit(&self, task: AgentTask) -> Result<TaskTicket, SubmitError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return Err(inner.reject(SubmitError::ShuttingDown));
        }

        let session_id = task.session_id.clone();
        let task_id = TaskId::new();
        let cancel = inner.force_cancel.child_token();

        match inner.active.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(inner.reject(SubmitError::SessionBusy)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveTask {
                    task_id: task_id.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let job = Job {
            task_id: task_id.clone(),
            task,
            cancel,
            outcome_tx,
        };

        inner.counters.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = inner.queue_tx.try_send(job) {
            inner.counters.queued.fetch_sub(1, Ordering::AcqRel);
            inner.active.remove_if(&session_id, |_, a| a.task_id == task_id);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
            };
            return Err(inner.reject(reason));
        }

        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &inner.metrics {
            m.increment_counter("scheduler_tasks_submitted_total", &[], 1);
        }
        inner.events.publish(
            EventKind::Created,
            TaskEvent::transition(task_id.clone(), session_id.clone(), TaskState::Queued),
        );
        debug!(task_id = %task_id, "task queued");

        Ok(TaskTicket {
            task_id,
            outcome: outcome_rx,
        })
    }

    /// Cancel the session's queued or running task. Other sessions are unaffected.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.inner.active.get(session_id) {
            Some(active) => {
                info!(session_id = %session_id, task_id = %active.task_id, "cancelling task");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.inner.active.contains_key(session_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            running: c.running.load(Ordering::Acquire),
            queued: c.queued.load(Ordering::Acquire),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            canceled: c.canceled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop intake, wait up to `timeout` for in-flight tasks, then cancel
    /// whatever is left. Later calls return the first call's report.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.report
            .get_or_init(|| self.shutdown_once(timeout))
            .await
            .clone()
    }

    async fn shutdown_once(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        info!(timeout_ms = timeout.as_millis() as u64, "scheduler shutting down");
        inner.accepting.store(false, Ordering::Release);
        inner.stop_intake.cancel();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler dispatcher panicked");
            }
        }

        inner.tracker.close();
        let mut forced = 0;
        if tokio::time::timeout(timeout, inner.tracker.wait()).await.is_err() {
            forced = inner.counters.running.load(Ordering::Acquire);
            warn!(forced, "shutdown timeout elapsed, cancelling remaining tasks");
            inner.force_cancel.cancel();
            let grace = inner.config.cancel_grace + Duration::from_millis(100);
            if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
                warn!("tasks still running after forced cancellation");
            }
        }

        let stats = self.stats();
        let report = ShutdownReport {
            completed: stats.completed,
            failed: stats.failed,
            canceled: stats.canceled,
            forced,
        };
        info!(?report, "scheduler stopped");
        report
    }
}

impl Inner {
    fn reject(&self, reason: SubmitError) -> SubmitError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.increment_counter("scheduler_tasks_rejected_total", &[("reason", reason.code())], 1);
        }
        debug!(reason = reason.code(), "task rejected");
        reason
    }

    #[instrument(skip_all, fields(task_id = %job.task_id, session_id = %job.task.session_id))]
    async fn run_job(self: Arc<Self>, job: Job) {
        let Job {
            task_id,
            task,
            cancel,
            outcome_tx,
        } = job;
        let session_id = task.session_id.clone();

        if cancel.is_cancelled() {
            let outcome = self.cancelled_outcome();
            self.finish(&task_id, &session_id, outcome, outcome_tx, None);
            return;
        }

        self.counters.running.fetch_add(1, Ordering::AcqRel);
        self.events.publish(
            EventKind::Updated,
            TaskEvent::transition(task_id.clone(), session_id.clone(), TaskState::Running),
        );
        let started = Instant::now();

        let ctx = RunContext {
            task_id: task_id.clone(),
            cancel: cancel.clone(),
        };
        let runtime = Arc::clone(&self.runtime);
        let mut run = runtime.run(ctx, task);
        let deadline = async {
            match self.config.task_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            result = &mut run => self.classify(result, &cancel),
            () = cancel.cancelled() => {
                self.wind_down(run).await;
                self.cancelled_outcome()
            }
            () = deadline => {
                warn!("task timed out");
                cancel.cancel();
                self.wind_down(run).await;
                TaskOutcome::TimedOut
            }
        };

        self.counters.running.fetch_sub(1, Ordering::AcqRel);
        self.finish(&task_id, &session_id, outcome, outcome_tx, Some(started.elapsed()));
    }

    fn classify(
        &self,
        result: Result<(), EngineError>,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        match result {
            Ok(()) => TaskOutcome::Completed,
            Err(EngineError::Aborted) => self.cancelled_outcome(),
            Err(_) if cancel.is_cancelled() => self.cancelled_outcome(),
            Err(EngineError::RunTimeout(_)) => TaskOutcome::TimedOut,
            Err(e) => TaskOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    fn cancelled_outcome(&self) -> TaskOutcome {
        if self.force_cancel.is_cancelled() {
            TaskOutcome::Shutdown
        } else {
            TaskOutcome::Canceled
        }
    }

    /// Give a cancelled runtime a bounded chance to clean up.
    async fn wind_down<F: std::future::Future>(&self, run: F) {
        if tokio::time::timeout(self.config.cancel_grace, run).await.is_err() {
            warn!("runtime ignored cancellation, dropping it");
        }
    }

    fn finish(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        outcome: TaskOutcome,
        outcome_tx: oneshot::Sender<TaskOutcome>,
        elapsed: Option<Duration>,
    ) {
        // Free the session before announcing, so a client reacting to the
        // event can submit again.
        self.active.remove_if(session_id, |_, a| &a.task_id == task_id);

        let counter = match outcome.state() {
            TaskState::Done => &self.counters.completed,
            TaskState::Failed => &self.counters.failed,
            _ => &self.counters.canceled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(m) = &self.metrics {
            m.increment_counter(
                "scheduler_tasks_finished_total",
                &[("outcome", outcome.label())],
                1,
            );
            if let Some(elapsed) = elapsed {
                m.observe("scheduler_task_duration_ms", &[], elapsed.as_secs_f64() * 1000.0);
            }
        }

        info!(task_id = %task_id, session_id = %session_id, outcome = outcome.label(), "task finished");
        self.events.publish(
            EventKind::Updated,
            TaskEvent::finished(task_id.clone(), session_id.clone(), outcome.clone()),
        );
        let _ = outcome_tx.send(outcome);
    }
}

async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::Receiver<Job>, semaphore: Arc<Semaphore>) {
    loop {
        let permit = tokio::select! {
            biased;
            () = inner.stop_intake.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let job = tokio::select! {
            biased;
            () = inner.stop_intake.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.counters.queued.fetch_sub(1, Ordering::AcqRel);

        let worker = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            worker.run_job(job).await;
            drop(permit);
        });
    }

    // Queued work never starts once intake stops.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        inner.counters.queued.fetch_sub(1, Ordering::AcqRel);
        let session_id = job.task.session_id.clone();
        inner.finish(&job.task_id, &session_id, TaskOutcome::Shutdown, job.outcome_tx, None);
    }
    debug!("scheduler dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Runtime whose behaviour is chosen by the prompt.
    #[derive(Default)]
    struct ScriptRuntime {
        current: AtomicUsize,
        peak: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl AgentRuntime for ScriptRuntime {
        async fn run(&self, ctx: RunContext, task: AgentTask) -> Result<(), EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = match task.prompt.as_str() {
                "ok" => Ok(()),
                "fail" => Err(EngineError::Internal("runtime exploded".into())),
                "block" => {
                    ctx.cancel.cancelled().await;
                    Err(EngineError::Aborted)
                }
                "stubborn" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                other => {
                    let ms: u64 = other.trim_start_matches("wait:").parse().unwrap_or(10);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(())
                }
            };
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn scheduler(config: SchedulerConfig) -> (AgentScheduler, Arc<ScriptRuntime>) {
        let runtime = Arc::new(ScriptRuntime::default());
        let s = AgentScheduler::start(config, runtime.clone(), None);
        (s, runtime)
    }

    fn task(prompt: &str) -> AgentTask {
        AgentTask::new(SessionId::new(), prompt)
    }

    async fn wait_running(s: &AgentScheduler, n: usize) {
        for _ in 0..200 {
            if s.stats().running == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached {n} running tasks: {:?}", s.stats());
    }

    #[tokio::test]
    async fn accepted_task_completes() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let ticket = s.submit(task("ok")).unwrap();
        assert_eq!(ticket.outcome.await.unwrap(), TaskOutcome::Completed);
        let stats = s.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn busy_session_is_rejected_not_queued() {
        let (s, runtime) = scheduler(SchedulerConfig::default());
        let session = SessionId::new();
        let first = s.submit(AgentTask::new(session.clone(), "block")).unwrap();
        wait_running(&s, 1).await;

        let err = s.submit(AgentTask::new(session.clone(), "ok")).unwrap_err();
        assert_eq!(err, SubmitError::SessionBusy);
        let stats = s.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.rejected, 1);

        assert!(s.cancel(&session));
        assert_eq!(first.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert!(!s.is_busy(&session));

        let again = s.submit(AgentTask::new(session, "ok")).unwrap();
        assert_eq!(again.outcome.await.unwrap(), TaskOutcome::Completed);
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let (s, _) = scheduler(SchedulerConfig {
            max_workers: 1,
            queue_capacity: 1,
            ..Default::default()
        });
        let blocker = task("block");
        let blocker_session = blocker.session_id.clone();
        let running = s.submit(blocker).unwrap();
        wait_running(&s, 1).await;
        let queued = s.submit(task("ok")).unwrap();
        assert_eq!(s.stats().queued, 1);

        let rejected = task("ok");
        let session = rejected.session_id.clone();
        assert_eq!(s.submit(rejected).unwrap_err(), SubmitError::QueueFull);
        assert!(!s.is_busy(&session));

        s.cancel(&blocker_session);
        assert_eq!(running.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert_eq!(queued.outcome.await.unwrap(), TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn never_exceeds_worker_limit() {
        let (s, runtime) = scheduler(SchedulerConfig {
            max_workers: 2,
            ..Default::default()
        });
        let tickets: Vec<_> = (0..6).map(|_| s.submit(task("wait:30")).unwrap()).collect();
        for t in tickets {
            assert_eq!(t.outcome.await.unwrap(), TaskOutcome::Completed);
        }
        assert!(runtime.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(s.stats().completed, 6);
    }

    #[tokio::test]
    async fn runtime_error_counts_as_failed() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let t = s.submit(task("fail")).unwrap();
        match t.outcome.await.unwrap() {
            TaskOutcome::Failed { error } => assert!(error.contains("runtime exploded")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.stats().failed, 1);
    }

    #[tokio::test]
    async fn timeout_cancels_the_task() {
        let (s, _) = scheduler(SchedulerConfig {
            task_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let t = s.submit(task("block")).unwrap();
        assert_eq!(t.outcome.await.unwrap(), TaskOutcome::TimedOut);
        assert_eq!(s.stats().failed, 1);
    }

    #[tokio::test]
    async fn cancelled_while_queued_never_runs() {
        let (s, runtime) = scheduler(SchedulerConfig {
            max_workers: 1,
            ..Default::default()
        });
        let blocker = task("block");
        let blocker_session = blocker.session_id.clone();
        let first = s.submit(blocker).unwrap();
        wait_running(&s, 1).await;

        let waiting = task("ok");
        let waiting_session = waiting.session_id.clone();
        let second = s.submit(waiting).unwrap();
        assert!(s.cancel(&waiting_session));
        s.cancel(&blocker_session);

        assert_eq!(first.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert_eq!(second.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_false() {
        let (s, _) = scheduler(SchedulerConfig::default());
        assert!(!s.cancel(&SessionId::new()));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let mut rx = s.subscribe();
        let t = s.submit(task("ok")).unwrap();
        t.outcome.await.unwrap();

        let mut states = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            states.push(ev.payload.state);
        }
        assert_eq!(states, vec![TaskState::Queued, TaskState::Running, TaskState::Done]);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_and_is_idempotent() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let t = s.submit(task("wait:30")).unwrap();
        wait_running(&s, 1).await;

        let report = s.shutdown(Duration::from_secs(2)).await;
        assert_eq!(
            report,
            ShutdownReport {
                completed: 1,
                failed: 0,
                canceled: 0,
                forced: 0
            }
        );
        assert_eq!(t.outcome.await.unwrap(), TaskOutcome::Completed);
        assert_eq!(s.submit(task("ok")).unwrap_err(), SubmitError::ShuttingDown);
        assert_eq!(s.shutdown(Duration::from_millis(1)).await, report);
    }

    #[tokio::test]
    async fn shutdown_forces_stragglers_and_drops_queue() {
        let (s, _) = scheduler(SchedulerConfig {
            max_workers: 1,
            ..Default::default()
        });
        let running = s.submit(task("block")).unwrap();
        wait_running(&s, 1).await;
        let queued = s.submit(task("ok")).unwrap();

        let report = s.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.forced, 1);
        assert_eq!(report.canceled, 2);
        assert_eq!(running.outcome.await.unwrap(), TaskOutcome::Shutdown);
        assert_eq!(queued.outcome.await.unwrap(), TaskOutcome::Shutdown);
    }

    #[tokio::test]
    async fn stubborn_runtime_is_dropped_after_grace() {
        let (s, _) = scheduler(SchedulerConfig {
            cancel_grace: Duration::from_millis(20),
            ..Default::default()
        });
        let t = task("stubborn");
        let session = t.session_id.clone();
        let ticket = s.submit(t).unwrap();
        wait_running(&s, 1).await;
        s.cancel(&session);
        assert_eq!(ticket.outcome.await.unwrap(), TaskOutcome::Canceled);
    }

    #[tokio::test]
    async fn metrics_record_rejections() {
        let metrics = Arc::new(MetricsRecorder::new());
        let s = AgentScheduler::start(
            SchedulerConfig::default(),
            Arc::new(ScriptRuntime::default()),
            Some(Arc::clone(&metrics)),
        );
        let session = SessionId::new();
        let first = s.submit(AgentTask::new(session.clone(), "block")).unwrap();
        let _ = s.submit(AgentTask::new(session.clone(), "ok"));
        assert_eq!(
            metrics.counter("scheduler_tasks_rejected_total", &[("reason", "session_busy")]),
            1
        );
        s.cancel(&session);
        first.outcome.await.unwrap();
        assert_eq!(
            metrics.counter("scheduler_tasks_finished_total", &[("outcome", "canceled")]),
            1
        );
    }
}
