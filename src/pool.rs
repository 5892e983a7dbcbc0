//! Worker thread pool with delayed dispatch.
//!
//! Jobs are opaque closures. Immediate dispatch hands the job straight to a
//! free worker when one exists and queues it FIFO otherwise; delayed
//! dispatch parks it with the process-wide [`TimeKeeper`](crate::timekeeper)
//! until due. Exactly one party gets to act on a job: workers and
//! cancellers race for a single atomic claim, so a job either runs to
//! completion or is cancelled, never both.
//!
//! Workers are [`CancellableThread`]s. Each holds a private busy mutex
//! while executing, which is what `cancel(wait = true)` blocks on, and each
//! job runs with cooperative cancellation disabled so a worker is only ever
//! cancelled between jobs.

use crate::atomic::{AtomicCounter, NegativePolicy};
use crate::error::Error;
use crate::mutex::FastMutex;
use crate::scoped::ScopedLock;
use crate::thread::{self, CancellableThread, Task, TerminationGuard, ThreadState};
use crate::timekeeper;
use crate::wait::WaitCondition;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Result of [`ThreadPool::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was not waiting, not delayed and not running.
    NotFound,
    /// The job was removed before it could run; it will never run.
    Cancelled,
    /// The job was already executing and was left to finish.
    WasRunning,
}

/// Where a job currently is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Delayed = 0,
    Queued = 1,
    Running = 2,
    Done = 3,
    Cancelled = 4,
}

impl JobState {
    fn from_u8(value: u8) -> JobState {
        match value {
            0 => JobState::Delayed,
            1 => JobState::Queued,
            2 => JobState::Running,
            3 => JobState::Done,
            _ => JobState::Cancelled,
        }
    }
}

/// Moment a phase callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// About to execute. Returning `false` vetoes the job, which then
    /// counts as cancelled.
    Before,
    /// Execution finished (return value ignored).
    After,
    /// The job was cancelled before it could run (return value ignored).
    Cancelled,
}

type JobFn = Box<dyn FnOnce() + Send + 'static>;
type PhaseFn = Box<dyn Fn(JobPhase) -> bool + Send + Sync + 'static>;

pub(crate) struct JobInner {
    id: u64,
    pool_id: u64,
    work: Mutex<Option<JobFn>>,
    phase: Option<PhaseFn>,
    /// Exactly one of {executing worker, canceller} wins this flag.
    claimed: AtomicBool,
    state: AtomicU8,
    done: WaitCondition,
}

/// Opaque, cloneable handle to a dispatched job.
#[derive(Clone)]
pub struct JobHandle(pub(crate) Arc<JobInner>);

impl JobHandle {
    fn new(pool_id: u64, work: JobFn, phase: Option<PhaseFn>, state: JobState) -> Self {
        JobHandle(Arc::new(JobInner {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            pool_id,
            work: Mutex::new(Some(work)),
            phase,
            claimed: AtomicBool::new(false),
            state: AtomicU8::new(state as u8),
            done: WaitCondition::new(false, false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.0.pool_id
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.0.state.load(Ordering::SeqCst))
    }

    /// Whether the job has reached a terminal state (done or cancelled).
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), JobState::Done | JobState::Cancelled)
    }

    fn finish(&self, state: JobState) {
        self.0.state.store(state as u8, Ordering::SeqCst);
        self.0.done.wake_all();
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Claims and cancels a job that is known not to be executing. Caller must
/// have removed it from whatever structure held it.
pub(crate) fn cancel_unclaimed(job: &JobHandle) -> bool {
    if job.0.claimed.swap(true, Ordering::SeqCst) {
        return false;
    }
    job.0.work.lock().unwrap().take();
    if let Some(phase) = &job.0.phase {
        phase(JobPhase::Cancelled);
    }
    job.finish(JobState::Cancelled);
    true
}

struct WorkerSlot {
    /// Woken on direct hand-off, shutdown and shrink re-evaluation.
    wc: WaitCondition,
    /// Job handed to this worker directly, before the worker picked it up.
    inbox: Mutex<Option<JobHandle>>,
    /// Job this worker is executing right now.
    current: Mutex<Option<JobHandle>>,
    /// Held for the whole execution of a job; `cancel(wait)` blocks on it.
    busy: FastMutex,
    free: AtomicBool,
    retired: AtomicBool,
    thread_id: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        WorkerSlot {
            wc: WaitCondition::new(true, false),
            inbox: Mutex::new(None),
            current: Mutex::new(None),
            busy: FastMutex::new(),
            free: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            thread_id: AtomicU64::new(0),
        }
    }
}

struct WorkerEntry {
    slot: Arc<WorkerSlot>,
    thread: CancellableThread,
}

pub(crate) struct PoolShared {
    pool_id: u64,
    state: Mutex<PoolState>,
    /// Number of workers currently idle.
    free: AtomicCounter,
    dynamic: AtomicBool,
    /// Set when the pool starts tearing down; late arrivals from the
    /// timekeeper are cancelled instead of queued.
    stopping: AtomicBool,
}

struct PoolState {
    workers: Vec<WorkerEntry>,
    queue: VecDeque<JobHandle>,
    /// Target worker count; idle workers beyond it retire themselves.
    total: usize,
    /// Growth ceiling when the pool is dynamic.
    maximum: usize,
    spawned: u64,
}

/// Queues a job, or hands it straight to a free worker. Also the re-entry
/// point for delayed jobs coming back from the timekeeper.
pub(crate) fn dispatch_queued(shared: &Arc<PoolShared>, job: JobHandle) {
    if shared.stopping.load(Ordering::SeqCst) {
        cancel_unclaimed(&job);
        return;
    }
    job.0.state.store(JobState::Queued as u8, Ordering::SeqCst);
    let mut st = shared.state.lock().unwrap();
    reap_retired(&mut st);
    if shared.free.load() > 0 {
        let free_worker = st
            .workers
            .iter()
            .find(|w| w.slot.free.load(Ordering::SeqCst) && !w.slot.retired.load(Ordering::SeqCst));
        if let Some(entry) = free_worker {
            entry.slot.free.store(false, Ordering::SeqCst);
            shared.free.sub_fetch_with(1, NegativePolicy::DebugCheck);
            *entry.slot.inbox.lock().unwrap() = Some(job);
            entry.slot.wc.wake_all();
            return;
        }
    }
    st.queue.push_back(job);
    if shared.dynamic.load(Ordering::SeqCst) && st.workers.len() < st.maximum {
        let target = st.total.max(st.workers.len() + 1);
        st.total = target;
        if let Err(error) = spawn_workers(shared, &mut st, 1) {
            tracing::warn!(pool = shared.pool_id, %error, "could not grow pool");
        }
    }
}

fn spawn_workers(
    shared: &Arc<PoolShared>,
    st: &mut PoolState,
    count: usize,
) -> Result<(), Error> {
    for _ in 0..count {
        st.spawned += 1;
        let slot = Arc::new(WorkerSlot::new());
        let task = WorkerTask {
            pool: Arc::downgrade(shared),
            slot: slot.clone(),
        };
        let name = format!("pool-{}-worker-{}", shared.pool_id, st.spawned);
        let mut worker = CancellableThread::new(name, task);
        worker.start(false)?;
        st.workers.push(WorkerEntry { slot, thread: worker });
        tracing::debug!(pool = shared.pool_id, workers = st.workers.len(), "pool grew");
    }
    Ok(())
}

/// Drops entries of workers that retired themselves and have fully
/// finished.
fn reap_retired(st: &mut PoolState) {
    st.workers.retain(|w| {
        !(w.slot.retired.load(Ordering::SeqCst) && w.thread.state() == ThreadState::Finished)
    });
}

struct WorkerTask {
    pool: Weak<PoolShared>,
    slot: Arc<WorkerSlot>,
}

impl WorkerTask {
    /// Blocks until there is a job for this worker. `None` means the worker
    /// should retire (pool gone or shrinking).
    fn next_job(&self) -> Option<JobHandle> {
        loop {
            thread::check_for_terminate();
            let pool = self.pool.upgrade()?;
            {
                let mut st = pool.state.lock().unwrap();
                // Hand-offs fill the inbox under the state lock, so it must
                // be drained here before this worker declares itself free
                // again; a wake without work would otherwise let a second
                // hand-off overwrite the first.
                if let Some(job) = self.slot.inbox.lock().unwrap().take() {
                    if self.slot.free.swap(false, Ordering::SeqCst) {
                        pool.free.sub_fetch_with(1, NegativePolicy::DebugCheck);
                    }
                    return Some(job);
                }
                if let Some(job) = st.queue.pop_front() {
                    if self.slot.free.swap(false, Ordering::SeqCst) {
                        pool.free.sub_fetch_with(1, NegativePolicy::DebugCheck);
                    }
                    return Some(job);
                }
                if !self.slot.free.swap(true, Ordering::SeqCst) {
                    pool.free.fetch_add(1);
                }
                if (pool.free.load() as usize) > st.total {
                    // Surplus idle worker; shrink by retiring ourselves.
                    self.slot.free.store(false, Ordering::SeqCst);
                    pool.free.sub_fetch_with(1, NegativePolicy::DebugCheck);
                    self.slot.retired.store(true, Ordering::SeqCst);
                    tracing::debug!(pool = pool.pool_id, "pool worker retiring");
                    return None;
                }
            }
            drop(pool);
            self.slot.wc.wait(None);
        }
    }

    fn execute(&self, job: JobHandle) {
        if job.0.claimed.swap(true, Ordering::SeqCst) {
            // A canceller got here first.
            return;
        }
        let work = match job.0.work.lock().unwrap().take() {
            Some(work) => work,
            None => {
                job.finish(JobState::Cancelled);
                return;
            }
        };
        // Busy is taken before the job becomes visible in `current`; a
        // canceller that finds it there and locks busy therefore cannot
        // return until the job, phase callbacks included, has completed.
        let _busy = ScopedLock::new(&self.slot.busy);
        *self.slot.current.lock().unwrap() = Some(job.clone());
        if let Some(phase) = &job.0.phase {
            if !phase(JobPhase::Before) {
                *self.slot.current.lock().unwrap() = None;
                phase(JobPhase::Cancelled);
                job.finish(JobState::Cancelled);
                return;
            }
        }
        job.0.state.store(JobState::Running as u8, Ordering::SeqCst);
        {
            let _no_cancel = TerminationGuard::new();
            if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                tracing::warn!(job = job.id(), "job panicked; worker continues");
            }
            if let Some(phase) = &job.0.phase {
                phase(JobPhase::After);
            }
        }
        *self.slot.current.lock().unwrap() = None;
        job.finish(JobState::Done);
    }
}

impl Task for WorkerTask {
    fn run(&mut self) {
        self.slot.thread_id.store(thread::current_thread_id(), Ordering::SeqCst);
        loop {
            thread::check_for_terminate();
            match self.next_job() {
                Some(job) => self.execute(job),
                None => return,
            }
        }
    }

    fn cleanup(&mut self) {
        // Keep the idle count honest if we were cancelled while free.
        if self.slot.free.swap(false, Ordering::SeqCst) {
            if let Some(pool) = self.pool.upgrade() {
                pool.free.sub_fetch_with(1, NegativePolicy::DebugCheck);
            }
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers started up front, and the retirement threshold.
    pub workers: usize,
    /// Ceiling for dynamic growth.
    pub maximum: usize,
    /// Whether dispatch may grow the pool up to `maximum` when all workers
    /// are busy.
    pub dynamic: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = crate::platform::processor_count();
        PoolConfig {
            workers,
            maximum: workers,
            dynamic: false,
        }
    }
}

/// A pool of cancellable worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Fixed pool with `workers` threads.
    pub fn new(workers: usize) -> Result<Self, Error> {
        Self::with_config(PoolConfig {
            workers,
            maximum: workers,
            dynamic: false,
        })
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, Error> {
        let shared = Arc::new(PoolShared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                queue: VecDeque::new(),
                total: config.workers,
                maximum: config.maximum.max(config.workers),
                spawned: 0,
            }),
            free: AtomicCounter::new(0),
            dynamic: AtomicBool::new(config.dynamic),
            stopping: AtomicBool::new(false),
        });
        {
            let mut st = shared.state.lock().unwrap();
            let count = st.total;
            spawn_workers(&shared, &mut st, count)?;
        }
        tracing::debug!(pool = shared.pool_id, workers = config.workers, "pool started");
        Ok(ThreadPool { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Builds a delayed-state job without registering it anywhere, so the
    /// timekeeper tests can drive insertion themselves.
    #[cfg(test)]
    pub(crate) fn make_delayed_job(&self, work: impl FnOnce() + Send + 'static) -> JobHandle {
        JobHandle::new(self.shared.pool_id, Box::new(work), None, JobState::Delayed)
    }

    /// Current target worker count.
    pub fn total(&self) -> usize {
        self.shared.state.lock().unwrap().total
    }

    pub fn maximum(&self) -> usize {
        self.shared.state.lock().unwrap().maximum
    }

    /// Number of workers currently idle.
    pub fn free_count(&self) -> usize {
        self.shared.free.load().max(0) as usize
    }

    pub fn is_dynamic(&self) -> bool {
        self.shared.dynamic.load(Ordering::SeqCst)
    }

    pub fn set_dynamic(&self, dynamic: bool) {
        self.shared.dynamic.store(dynamic, Ordering::SeqCst);
    }

    /// Changes the target worker count. Growth happens here; shrink happens
    /// as surplus workers go idle and retire themselves.
    pub fn set_total(&self, total: usize) -> Result<(), Error> {
        let mut st = self.shared.state.lock().unwrap();
        reap_retired(&mut st);
        st.total = total;
        if st.maximum < total {
            st.maximum = total;
        }
        let alive = st.workers.len();
        if total > alive {
            spawn_workers(&self.shared, &mut st, total - alive)?;
        } else {
            for w in &st.workers {
                if w.slot.free.load(Ordering::SeqCst) {
                    w.slot.wc.wake_all();
                }
            }
        }
        Ok(())
    }

    /// Submits a job. `delay` of zero dispatches immediately; otherwise the
    /// job sits with the timekeeper until due.
    pub fn dispatch(&self, work: impl FnOnce() + Send + 'static, delay: Duration) -> JobHandle {
        self.dispatch_inner(Box::new(work), delay, None)
    }

    /// Like [`dispatch`](ThreadPool::dispatch), with a phase callback that
    /// observes the job's life and may veto execution at
    /// [`JobPhase::Before`].
    pub fn dispatch_with_phase(
        &self,
        work: impl FnOnce() + Send + 'static,
        delay: Duration,
        phase: impl Fn(JobPhase) -> bool + Send + Sync + 'static,
    ) -> JobHandle {
        self.dispatch_inner(Box::new(work), delay, Some(Box::new(phase)))
    }

    fn dispatch_inner(&self, work: JobFn, delay: Duration, phase: Option<PhaseFn>) -> JobHandle {
        if delay.is_zero() {
            let job = JobHandle::new(self.shared.pool_id, work, phase, JobState::Queued);
            dispatch_queued(&self.shared, job.clone());
            job
        } else {
            let job = JobHandle::new(self.shared.pool_id, work, phase, JobState::Delayed);
            timekeeper::global().insert(
                Instant::now() + delay,
                Arc::downgrade(&self.shared),
                job.clone(),
            );
            job
        }
    }

    /// Attempts to cancel a job.
    ///
    /// A job that has not started is removed and will never run
    /// (`Cancelled`). A job already executing is left alone (`WasRunning`);
    /// with `wait = true` the call blocks until it completed. Calling
    /// `cancel(wait = true)` for the job one is currently executing inside
    /// would self-deadlock; that is a programming error and does not block.
    pub fn cancel(&self, job: &JobHandle, wait: bool) -> CancelOutcome {
        if job.pool_id() != self.shared.pool_id {
            return CancelOutcome::NotFound;
        }
        // Still waiting in the queue, or handed to a worker that has not
        // picked it up yet?
        {
            let mut st = self.shared.state.lock().unwrap();
            if let Some(pos) = st.queue.iter().position(|j| Arc::ptr_eq(&j.0, &job.0)) {
                let _ = st.queue.remove(pos);
                drop(st);
                if cancel_unclaimed(job) {
                    return CancelOutcome::Cancelled;
                }
            } else {
                let inbox_holder = st.workers.iter().find_map(|w| {
                    let holds = w
                        .slot
                        .inbox
                        .lock()
                        .unwrap()
                        .as_ref()
                        .is_some_and(|j| Arc::ptr_eq(&j.0, &job.0));
                    holds.then(|| w.slot.clone())
                });
                if let Some(slot) = inbox_holder {
                    if !job.0.claimed.swap(true, Ordering::SeqCst) {
                        let mut inbox = slot.inbox.lock().unwrap();
                        if inbox.as_ref().is_some_and(|j| Arc::ptr_eq(&j.0, &job.0)) {
                            *inbox = None;
                        }
                        drop(inbox);
                        drop(st);
                        job.0.work.lock().unwrap().take();
                        if let Some(phase) = &job.0.phase {
                            phase(JobPhase::Cancelled);
                        }
                        job.finish(JobState::Cancelled);
                        return CancelOutcome::Cancelled;
                    }
                }
            }
        }
        // Parked with the timekeeper?
        if job.state() == JobState::Delayed
            && timekeeper::global().remove(job.id())
            && cancel_unclaimed(job)
        {
            return CancelOutcome::Cancelled;
        }
        // Executing right now?
        let executing = {
            let st = self.shared.state.lock().unwrap();
            st.workers.iter().find_map(|w| {
                let holds = w
                    .slot
                    .current
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|j| Arc::ptr_eq(&j.0, &job.0));
                holds.then(|| w.slot.clone())
            })
        };
        if let Some(slot) = executing {
            if wait {
                if slot.thread_id.load(Ordering::SeqCst) == thread::current_thread_id() {
                    debug_assert!(
                        false,
                        "cancel(wait = true) called from inside the job being cancelled"
                    );
                } else {
                    slot.busy.lock();
                    slot.busy.unlock();
                }
            }
            return CancelOutcome::WasRunning;
        }
        if wait && !job.is_finished() {
            // Completed between our scans, or completing right now.
            self.wait(job, None);
        }
        CancelOutcome::NotFound
    }

    /// Blocks until the job is neither queued nor executing, up to
    /// `timeout` (`None` waits forever). Unknown and already-completed jobs
    /// return `true` immediately.
    pub fn wait(&self, job: &JobHandle, timeout: Option<Duration>) -> bool {
        if job.is_finished() {
            return true;
        }
        job.0.done.wait(timeout)
    }

    /// Re-times a delayed job. Returns whether the job was still with the
    /// timekeeper; a zero delay makes it due immediately.
    pub fn reset(&self, job: &JobHandle, delay: Duration) -> bool {
        timekeeper::global().reset(job.id(), Instant::now() + delay)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        timekeeper::purge_if_running(self.shared.pool_id);
        let (workers, queue) = {
            let mut st = self.shared.state.lock().unwrap();
            st.total = 0;
            (std::mem::take(&mut st.workers), std::mem::take(&mut st.queue))
        };
        for job in queue {
            cancel_unclaimed(&job);
        }
        for w in &workers {
            if let Some(job) = w.slot.inbox.lock().unwrap().take() {
                cancel_unclaimed(&job);
            }
            w.thread.request_termination();
            w.slot.wc.wake_all();
        }
        for w in &workers {
            w.thread.wait(None);
        }
        drop(workers);
        tracing::debug!(pool = self.shared.pool_id, "pool stopped");
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.shared.pool_id)
            .field("total", &self.total())
            .field("free", &self.free_count())
            .finish()
    }
}
