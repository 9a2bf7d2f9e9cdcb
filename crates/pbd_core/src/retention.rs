//! Retention policies and the background scheduler that enforces them.
//!
//! A deque registers with a [`RetentionScheduler`] when enforcement starts.
//! Worker threads run a pass for every registered deque once per interval,
//! and immediately after a deque rolls to a new segment. A pass detaches
//! head segments under the deque lock and removes their files after
//! releasing it.
//!
//! ```text
//!  rollover ──► wake(key) ──┐
//!                           ▼
//!  ┌──────────────── scheduler state ────────────────┐
//!  │ key ─► Task { deque: Weak<Shared>, due, running }│
//!  └──────────────────────────────────────────────────┘
//!        ▲ register / unregister        │ due
//!        │                              ▼
//!   RetentionControl             worker: enforce_retention()
//! ```

use crate::config::RetentionConfig;
use crate::deque::{Inner, Shared};
use crate::error::{CoreError, CoreResult};
use crate::segment::Segment;
use crate::types::now_millis;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bound on retained data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the smallest suffix of segments holding at least this many bytes.
    MaxBytes(u64),
    /// Delete segments whose newest entry is older than this.
    MaxAge(Duration),
}

/// Per-deque retention settings and scheduler registration.
pub(crate) struct RetentionControl {
    policy: Option<RetentionPolicy>,
    scheduler: Option<Arc<RetentionScheduler>>,
    task: Option<u64>,
}

impl RetentionControl {
    pub(crate) fn new(
        scheduler: Option<Arc<RetentionScheduler>>,
        policy: Option<RetentionPolicy>,
    ) -> Self {
        Self {
            policy,
            scheduler,
            task: None,
        }
    }

    pub(crate) fn policy(&self) -> Option<RetentionPolicy> {
        self.policy
    }

    /// Replaces the policy; enforcement must be stopped.
    pub(crate) fn set_policy(&mut self, policy: RetentionPolicy) -> CoreResult<()> {
        if self.task.is_some() {
            return Err(CoreError::invalid_operation(
                "stop retention enforcement before changing the policy",
            ));
        }
        self.policy = Some(policy);
        Ok(())
    }

    /// Registers the deque with the scheduler, creating one if needed.
    pub(crate) fn start(&mut self, deque: Weak<Shared>) -> CoreResult<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let Some(policy) = self.policy else {
            return Err(CoreError::invalid_operation("no retention policy set"));
        };
        let scheduler = match &self.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => {
                let scheduler = RetentionScheduler::new(RetentionConfig::default())?;
                self.scheduler = Some(Arc::clone(&scheduler));
                scheduler
            }
        };
        let key = scheduler.register(deque);
        self.task = Some(key);
        info!(?policy, task = key, "started retention enforcement");
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if let Some(key) = self.task.take() {
            if let Some(scheduler) = &self.scheduler {
                scheduler.unregister(key);
            }
            debug!(task = key, "stopped retention enforcement");
        }
    }

    fn wake(&self) {
        if let (Some(key), Some(scheduler)) = (self.task, &self.scheduler) {
            scheduler.wake(key);
        }
    }
}

impl Shared {
    /// Unregisters the deque from its scheduler.
    pub(crate) fn stop_retention(&self) {
        self.retention.lock().stop();
    }

    /// Asks the scheduler for an immediate pass.
    pub(crate) fn wake_retention(&self) {
        self.retention.lock().wake();
    }

    /// Runs one retention pass and returns the number of deleted segments.
    pub(crate) fn enforce_retention(&self) -> CoreResult<usize> {
        let policy = self.retention.lock().policy();
        let Some(policy) = policy else {
            return Ok(0);
        };
        let detached = {
            let mut inner = self.lock_open()?;
            inner.retention_candidates(self, policy, now_millis())?
        };
        let deleted = detached.len();
        self.dispose(detached, false);
        self.stats.record_retention_pass();
        if deleted > 0 {
            info!(?policy, deleted, "retention removed segments");
        }
        Ok(deleted)
    }
}

impl Inner {
    /// Detaches head segments that `policy` no longer retains.
    pub(crate) fn retention_candidates(
        &mut self,
        shared: &Shared,
        policy: RetentionPolicy,
        now: i64,
    ) -> CoreResult<Vec<Segment>> {
        let durable = self.durable_positions();
        let mut total: u64 = self.segments.values().map(Segment::file_size).sum();
        let mut detached = Vec::new();
        while let Some((&head, seg)) = self.segments.first_key_value() {
            if !self.head_removable(head, seg) {
                break;
            }
            if !durable.iter().all(|p| self.is_past(*p, head)) {
                break;
            }
            let size = seg.file_size();
            let expired = match policy {
                RetentionPolicy::MaxBytes(limit) => total.saturating_sub(size) >= limit,
                RetentionPolicy::MaxAge(limit) => {
                    let limit = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
                    seg.newest_timestamp() < now.saturating_sub(limit)
                }
            };
            if !expired {
                break;
            }
            total -= size;
            detached.push(self.detach_head(shared)?);
        }
        self.reposition_detached();
        Ok(detached)
    }
}

struct Task {
    deque: Weak<Shared>,
    due: Instant,
    running: bool,
    /// A wake arrived while the pass was running.
    rerun: bool,
}

#[derive(Default)]
struct SchedulerState {
    tasks: BTreeMap<u64, Task>,
    next_key: u64,
    shutdown: bool,
}

struct SchedulerCore {
    interval: Duration,
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

/// Worker pool running retention passes for any number of deques.
///
/// One scheduler may be shared by several deques through
/// [`DequeBuilder::retention_scheduler`](crate::DequeBuilder::retention_scheduler).
/// Deques that start enforcement without one get a private scheduler with
/// the default configuration.
pub struct RetentionScheduler {
    core: Arc<SchedulerCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RetentionScheduler {
    /// Spawns the worker threads.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for zero threads; I/O errors spawning threads.
    pub fn new(config: RetentionConfig) -> CoreResult<Arc<Self>> {
        if config.threads == 0 {
            return Err(CoreError::invalid_operation(
                "retention scheduler needs at least one thread",
            ));
        }
        let core = Arc::new(SchedulerCore {
            interval: config.interval,
            state: Mutex::new(SchedulerState::default()),
            changed: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(config.threads);
        for n in 0..config.threads {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("pbd-retention-{n}"))
                .spawn(move || run_worker(&core))?;
            workers.push(handle);
        }
        debug!(threads = config.threads, interval = ?config.interval, "started retention scheduler");
        Ok(Arc::new(Self {
            core,
            workers: Mutex::new(workers),
        }))
    }

    /// Number of registered deques.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.core.state.lock().tasks.len()
    }

    fn register(&self, deque: Weak<Shared>) -> u64 {
        let mut state = self.core.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.tasks.insert(
            key,
            Task {
                deque,
                due: Instant::now(),
                running: false,
                rerun: false,
            },
        );
        self.core.changed.notify_all();
        key
    }

    fn unregister(&self, key: u64) {
        self.core.state.lock().tasks.remove(&key);
    }

    fn wake(&self, key: u64) {
        let mut state = self.core.state.lock();
        if let Some(task) = state.tasks.get_mut(&key) {
            if task.running {
                task.rerun = true;
            } else {
                task.due = Instant::now();
            }
            self.core.changed.notify_all();
        }
    }

    /// Stops the workers and waits for them to exit.
    pub fn shutdown(&self) {
        {
            let mut state = self.core.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.core.changed.notify_all();
        }
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            // The last handle can be dropped by a worker finishing a pass.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("retention worker panicked");
            }
        }
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RetentionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionScheduler")
            .field("interval", &self.core.interval)
            .field("registered", &self.registered())
            .finish()
    }
}

fn run_worker(core: &SchedulerCore) {
    let mut state = core.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next = state
            .tasks
            .iter()
            .filter(|(_, task)| !task.running)
            .min_by_key(|(_, task)| task.due)
            .map(|(key, task)| (*key, task.due));
        let Some((key, due)) = next else {
            core.changed.wait(&mut state);
            continue;
        };
        if due > Instant::now() {
            core.changed.wait_until(&mut state, due);
            continue;
        }

        let Some(task) = state.tasks.get_mut(&key) else {
            continue;
        };
        task.running = true;
        let deque = task.deque.clone();
        let alive = MutexGuard::unlocked(&mut state, || run_pass(&deque));

        if !alive {
            state.tasks.remove(&key);
            continue;
        }
        if let Some(task) = state.tasks.get_mut(&key) {
            task.running = false;
            task.due = if std::mem::take(&mut task.rerun) {
                Instant::now()
            } else {
                Instant::now() + core.interval
            };
        }
    }
}

/// Returns false once the deque is gone.
fn run_pass(deque: &Weak<Shared>) -> bool {
    let Some(shared) = deque.upgrade() else {
        return false;
    };
    match shared.enforce_retention() {
        Ok(_) => true,
        Err(CoreError::DequeClosed) => false,
        Err(e) => {
            warn!(error = %e, "retention pass failed");
            true
        }
    }
}
