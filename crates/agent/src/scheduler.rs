//! Bounded-concurrency scheduler for delegated sub-agent tasks.
//!
//! Two ceilings gate admission: one across all tasks and one per parent
//! session. A task that cannot start waits in a FIFO queue (or is rejected
//! when queueing is off or the queue is full). Every task has a deadline
//! covering both its wait and its run.
//!
//! Capacity is held by a [`Permit`] and handed back exactly once when the
//! permit drops, whether the task finished, failed, timed out, or was
//! cancelled. Releasing capacity admits whichever queued tasks now fit.

use chrono::Utc;
use sleuth_core::error::Error;
use sleuth_core::event::{DomainEvent, EventBus};
use sleuth_core::message::SessionId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_per_session: usize,
    pub queue_enabled: bool,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_per_session: 3,
            queue_enabled: true,
            queue_capacity: 10,
        }
    }
}

/// Longest deadline a task may be given.
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(86_400);

/// One delegated unit of work.
#[derive(Debug, Clone)]
pub struct DelegationTask {
    pub task_id: String,
    pub parent_session_id: SessionId,
    pub payload: String,
    pub deadline: Instant,
}

impl DelegationTask {
    /// `timeout` is capped at [`MAX_TASK_TIMEOUT`].
    pub fn new(parent_session_id: SessionId, payload: impl Into<String>, timeout: Duration) -> Self {
        let now = Instant::now();
        let capped = timeout.min(MAX_TASK_TIMEOUT);
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            parent_session_id,
            payload: payload.into(),
            deadline: now.checked_add(capped).unwrap_or(now),
        }
    }
}

/// Terminal state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl TaskOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::TimedOut => "timed_out",
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub per_session: BTreeMap<String, usize>,
}

impl SchedulerStats {
    /// Every submitted task has reached exactly one terminal state.
    pub fn is_settled(&self) -> bool {
        self.submitted == self.completed + self.failed + self.timed_out
    }
}

struct Waiter {
    id: u64,
    session: String,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct SchedulerState {
    global_active: usize,
    per_session: HashMap<String, usize>,
    queue: VecDeque<Waiter>,
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
}

impl SchedulerState {
    fn fits(&self, session: &str, config: &SchedulerConfig) -> bool {
        self.global_active < config.max_concurrent
            && self.per_session.get(session).copied().unwrap_or(0) < config.max_per_session
    }

    fn occupy(&mut self, session: &str) {
        self.global_active += 1;
        *self.per_session.entry(session.to_string()).or_default() += 1;
    }

    fn vacate(&mut self, session: &str) {
        self.global_active = self.global_active.saturating_sub(1);
        if let Some(count) = self.per_session.get_mut(session) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_session.remove(session);
            }
        }
    }

    /// Pop every queued waiter that now fits, in FIFO order, and occupy for it.
    fn admit_waiting(&mut self, config: &SchedulerConfig) -> Vec<Waiter> {
        let mut admitted = Vec::new();
        let mut i = 0;
        while i < self.queue.len() && self.global_active < config.max_concurrent {
            if self.fits(&self.queue[i].session, config) {
                if let Some(waiter) = self.queue.remove(i) {
                    self.occupy(&waiter.session);
                    admitted.push(waiter);
                }
            } else {
                i += 1;
            }
        }
        admitted
    }
}

/// Scheduler for delegated tasks. Share it behind an `Arc`.
pub struct DelegationScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    next_waiter: AtomicU64,
    event_bus: Option<Arc<EventBus>>,
}

impl DelegationScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            next_waiter: AtomicU64::new(0),
            event_bus: None,
        }
    }

    /// Publish a `DelegationFinished` event for every terminal task.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state();
        SchedulerStats {
            active: state.global_active,
            queued: state.queue.len(),
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
            timed_out: state.timed_out,
            per_session: state
                .per_session
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Run `work` once capacity allows, bounded by the task's deadline.
    ///
    /// Saturation (queueing off, queue full) and an expired deadline are
    /// both reported as [`Error::SchedulerSaturated`].
    pub async fn submit<T, F, Fut>(&self, task: DelegationTask, work: F) -> Result<T, Error>
    where
        F: FnOnce(DelegationTask) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let session = task.parent_session_id.as_str().to_string();
        let deadline = task.deadline;
        let mut guard = OutcomeGuard::start(self, &task);

        let run = async {
            let _permit = self.acquire(&session).await?;
            work(task).await
        };

        match tokio::time::timeout_at(deadline, run).await {
            Ok(Ok(value)) => {
                guard.outcome = TaskOutcome::Completed;
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.outcome = TaskOutcome::Failed;
                Err(e)
            }
            Err(_) => {
                guard.outcome = TaskOutcome::TimedOut;
                warn!(task_id = %guard.task_id, session_id = %session, "Delegation deadline exceeded");
                Err(Error::SchedulerSaturated(format!(
                    "task {} exceeded its deadline",
                    guard.task_id
                )))
            }
        }
    }

    async fn acquire(&self, session: &str) -> Result<Permit<'_>, Error> {
        let (id, rx) = {
            let mut state = self.state();
            if state.fits(session, &self.config) {
                state.occupy(session);
                return Ok(Permit {
                    scheduler: self,
                    session: session.to_string(),
                });
            }
            if !self.config.queue_enabled {
                return Err(Error::SchedulerSaturated(
                    "concurrency ceiling reached and queueing is disabled".into(),
                ));
            }
            if state.queue.len() >= self.config.queue_capacity {
                return Err(Error::SchedulerSaturated(format!(
                    "delegation queue is full ({} waiting)",
                    state.queue.len()
                )));
            }
            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                session: session.to_string(),
                admit: tx,
            });
            debug!(session_id = %session, queued = state.queue.len(), "Delegation queued");
            (id, rx)
        };

        let mut ticket = WaitTicket {
            scheduler: self,
            id,
            session: session.to_string(),
            rx,
            admitted: false,
        };
        match (&mut ticket.rx).await {
            Ok(()) => {
                ticket.admitted = true;
                Ok(Permit {
                    scheduler: self,
                    session: session.to_string(),
                })
            }
            Err(_) => Err(Error::Internal("delegation scheduler dropped a waiter".into())),
        }
    }

    /// Hand back one unit of capacity for `session` and admit queued work.
    fn release(&self, session: &str) {
        let mut pending = vec![session.to_string()];
        while let Some(session) = pending.pop() {
            let admitted = {
                let mut state = self.state();
                state.vacate(&session);
                state.admit_waiting(&self.config)
            };
            for waiter in admitted {
                debug!(session_id = %waiter.session, "Delegation admitted from queue");
                if waiter.admit.send(()).is_err() {
                    // Waiter gave up between admission and wake-up
                    pending.push(waiter.session);
                }
            }
        }
    }
}

/// Capacity held by a running task.
struct Permit<'a> {
    scheduler: &'a DelegationScheduler,
    session: String,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.scheduler.release(&self.session);
    }
}

/// A queued task's place in line.
struct WaitTicket<'a> {
    scheduler: &'a DelegationScheduler,
    id: u64,
    session: String,
    rx: oneshot::Receiver<()>,
    admitted: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        {
            let mut state = self.scheduler.state();
            if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
                state.queue.remove(pos);
                return;
            }
        }
        // Already admitted but never woken: give the capacity back.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.scheduler.release(&self.session);
        }
    }
}

/// Records the task's terminal state exactly once, even if the submit
/// future is dropped mid-flight.
struct OutcomeGuard<'a> {
    scheduler: &'a DelegationScheduler,
    task_id: String,
    session: String,
    started: Instant,
    outcome: TaskOutcome,
}

impl<'a> OutcomeGuard<'a> {
    fn start(scheduler: &'a DelegationScheduler, task: &DelegationTask) -> Self {
        scheduler.state().submitted += 1;
        Self {
            scheduler,
            task_id: task.task_id.clone(),
            session: task.parent_session_id.as_str().to_string(),
            started: Instant::now(),
            outcome: TaskOutcome::Failed,
        }
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.scheduler.state();
            match self.outcome {
                TaskOutcome::Completed => state.completed += 1,
                TaskOutcome::Failed => state.failed += 1,
                TaskOutcome::TimedOut => state.timed_out += 1,
            }
        }
        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            task_id = %self.task_id,
            session_id = %self.session,
            outcome = self.outcome.as_str(),
            duration_ms,
            "Delegation finished"
        );
        if let Some(bus) = &self.scheduler.event_bus {
            bus.publish(DomainEvent::DelegationFinished {
                task_id: self.task_id.clone(),
                parent_session_id: self.session.clone(),
                outcome: self.outcome.as_str().to_string(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
    }
}
