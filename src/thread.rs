//! Cancellable threads.
//!
//! `CancellableThread` wraps a native OS thread with a monotonic lifecycle
//! (Created, Running, InCleanup, Finished), cooperative cancellation, and
//! exactly-once cleanup on every exit path.
//!
//! Cancellation is a token, not an interrupt. `request_termination` sets the
//! token; the thread notices it at the next checkpoint and unwinds from
//! there with a private payload the thread trampoline catches. Checkpoints
//! are explicit [`check_for_terminate`] calls, blocked [`WaitCondition`]
//! waits, and [`sleep`]. Code that must not be interrupted brackets itself
//! with a [`TerminationGuard`]; requests arriving inside the bracket are
//! deferred, never dropped.

use crate::error::Error;
use crate::wait::WaitCondition;
use crate::{exit, platform};
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Unwinding payload used by cooperative cancellation. It never crosses the
/// dying thread's boundary: the trampoline catches it and treats the thread
/// as cleanly cancelled.
pub struct CancellationInProgress;

/// Sentinel meaning "no affinity requested".
const NO_AFFINITY: usize = usize::MAX;

/// How long one uninterruptible sleep slice lasts inside [`sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(50);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Process-unique id of the calling thread, also assigned to threads
    /// not created through this crate so lock ownership always works.
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);

    static CURRENT: RefCell<Option<Arc<ThreadControl>>> = const { RefCell::new(None) };
}

/// Process-unique id of the calling thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Control block of the calling thread, if it was created through
/// [`CancellableThread`]. Foreign threads get `None`; cancellation
/// checkpoints are no-ops for them.
pub fn current() -> Option<Arc<ThreadControl>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Thread lifecycle. Transitions are monotonic; a thread never moves
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadState {
    Created = 0,
    Running = 1,
    InCleanup = 2,
    Finished = 3,
}

impl ThreadState {
    fn from_u8(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Created,
            1 => ThreadState::Running,
            2 => ThreadState::InCleanup,
            _ => ThreadState::Finished,
        }
    }
}

/// The work a [`CancellableThread`] executes.
///
/// `cleanup` runs in the dying thread on every exit path: normal return,
/// cooperative cancellation, or an escaping panic.
pub trait Task: Send + 'static {
    fn run(&mut self);
    fn cleanup(&mut self) {}
}

struct FnTask<F: FnOnce() + Send + 'static>(Option<F>);

impl<F: FnOnce() + Send + 'static> Task for FnTask<F> {
    fn run(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub type CleanupCallId = u64;

struct CleanupCall {
    id: CleanupCallId,
    func: Box<dyn FnOnce() + Send + 'static>,
    in_thread: bool,
}

/// Shared state between a [`CancellableThread`] handle, the OS thread it
/// spawned, and anyone holding a clone of the control block.
pub struct ThreadControl {
    name: String,
    id: AtomicU64,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    cancel_disabled: AtomicU32,
    cleanup_calls: Mutex<Vec<CleanupCall>>,
    next_cleanup_id: AtomicU64,
    started: WaitCondition,
    stopped: WaitCondition,
    affinity: AtomicUsize,
    priority: AtomicI32,
}

impl ThreadControl {
    fn new(name: String) -> Self {
        ThreadControl {
            name,
            id: AtomicU64::new(0),
            state: AtomicU8::new(ThreadState::Created as u8),
            cancel_requested: AtomicBool::new(false),
            cancel_disabled: AtomicU32::new(0),
            cleanup_calls: Mutex::new(Vec::new()),
            next_cleanup_id: AtomicU64::new(1),
            started: WaitCondition::new(false, false),
            stopped: WaitCondition::new(false, false),
            affinity: AtomicUsize::new(NO_AFFINITY),
            priority: AtomicI32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the OS thread, zero until it has started.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves `from` to `to` if the thread is still in `from`. Returns whether
    /// this call performed the transition, so the winner of a race can act
    /// exactly once.
    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Asks the thread to terminate at its next cancellation checkpoint.
    pub fn request_termination(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn termination_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Defers cancellation until the matching [`enable_termination`]. Calls
    /// nest; the request is honored once the depth returns to zero.
    ///
    /// [`enable_termination`]: ThreadControl::enable_termination
    pub fn disable_termination(&self) {
        self.cancel_disabled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn enable_termination(&self) {
        let previous = self.cancel_disabled.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "enable_termination without matching disable");
        if previous == 0 {
            self.cancel_disabled.store(0, Ordering::SeqCst);
        }
    }

    fn termination_armed(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
            && self.cancel_disabled.load(Ordering::SeqCst) == 0
    }

    /// Registers a one-shot hook run when the thread dies. With
    /// `in_thread = true` it runs in the dying thread right after
    /// `Task::cleanup`; otherwise it runs in the thread that destroys the
    /// [`CancellableThread`] handle.
    pub fn add_cleanup_call(
        &self,
        func: impl FnOnce() + Send + 'static,
        in_thread: bool,
    ) -> CleanupCallId {
        let id = self.next_cleanup_id.fetch_add(1, Ordering::Relaxed);
        self.cleanup_calls.lock().unwrap().push(CleanupCall {
            id,
            func: Box::new(func),
            in_thread,
        });
        id
    }

    /// Removes a not-yet-run cleanup hook. Returns whether it was found.
    pub fn remove_cleanup_call(&self, id: CleanupCallId) -> bool {
        let mut calls = self.cleanup_calls.lock().unwrap();
        let before = calls.len();
        calls.retain(|call| call.id != id);
        calls.len() != before
    }

    fn run_cleanup_calls(&self, in_thread: bool) {
        loop {
            // Take one call at a time so a hook may register further hooks.
            let call = {
                let mut calls = self.cleanup_calls.lock().unwrap();
                match calls.iter().position(|c| !in_thread || c.in_thread) {
                    Some(index) => calls.remove(index),
                    None => break,
                }
            };
            (call.func)();
        }
    }

    /// Blocks until the thread has finished, up to `timeout` (`None` waits
    /// forever). Returns whether it finished. A thread that was never
    /// started counts as finished.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        match self.state() {
            ThreadState::Created | ThreadState::Finished => true,
            _ => self.stopped.wait(timeout) && self.state() == ThreadState::Finished,
        }
    }
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Cancellation checkpoint. If the calling thread has been asked to
/// terminate and termination is enabled, this unwinds and does not return;
/// the thread proceeds directly to cleanup. With termination disabled it
/// returns whether a request is pending. Foreign threads always get `false`.
pub fn check_for_terminate() -> bool {
    if let Some(control) = current() {
        if control.termination_armed() {
            panic::panic_any(CancellationInProgress);
        }
        return control.termination_requested();
    }
    false
}

/// Defers cooperative cancellation for the enclosing scope.
pub struct TerminationGuard {
    control: Option<Arc<ThreadControl>>,
}

impl TerminationGuard {
    pub fn new() -> Self {
        let control = current();
        if let Some(control) = &control {
            control.disable_termination();
        }
        TerminationGuard { control }
    }
}

impl Default for TerminationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        if let Some(control) = &self.control {
            control.enable_termination();
        }
    }
}

/// Sleeps for `duration`; a cancellation checkpoint.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        check_for_terminate();
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

pub fn yield_now() {
    platform::yield_now();
}

pub type CreationUpcallId = u64;

type CreationUpcall = Arc<dyn Fn(&ThreadControl) + Send + Sync + 'static>;

lazy_static! {
    static ref CREATION_UPCALLS: Mutex<Vec<(CreationUpcallId, CreationUpcall, bool)>> =
        Mutex::new(Vec::new());
}

static NEXT_UPCALL_ID: AtomicU64 = AtomicU64::new(1);

/// Registers a callback invoked for every thread subsequently started.
/// With `in_thread = true` it runs inside the new thread before `run`;
/// otherwise it runs in the starting thread during `start`.
pub fn add_creation_upcall(
    upcall: impl Fn(&ThreadControl) + Send + Sync + 'static,
    in_thread: bool,
) -> CreationUpcallId {
    let id = NEXT_UPCALL_ID.fetch_add(1, Ordering::Relaxed);
    CREATION_UPCALLS
        .lock()
        .unwrap()
        .push((id, Arc::new(upcall), in_thread));
    id
}

pub fn remove_creation_upcall(id: CreationUpcallId) -> bool {
    let mut upcalls = CREATION_UPCALLS.lock().unwrap();
    let before = upcalls.len();
    upcalls.retain(|(upcall_id, _, _)| *upcall_id != id);
    upcalls.len() != before
}

fn creation_upcalls(in_thread: bool) -> Vec<CreationUpcall> {
    CREATION_UPCALLS
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, _, runs_in_thread)| *runs_in_thread == in_thread)
        .map(|(_, upcall, _)| upcall.clone())
        .collect()
}

/// A native thread with cooperative cancellation and guaranteed cleanup.
pub struct CancellableThread {
    control: Arc<ThreadControl>,
    task: Option<Box<dyn Task>>,
    stack_size: Option<usize>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl CancellableThread {
    pub fn new(name: impl Into<String>, task: impl Task) -> Self {
        CancellableThread {
            control: Arc::new(ThreadControl::new(name.into())),
            task: Some(Box::new(task)),
            stack_size: None,
            join: None,
        }
    }

    /// Convenience constructor for closure bodies without cleanup.
    pub fn with_fn(name: impl Into<String>, f: impl FnOnce() + Send + 'static) -> Self {
        Self::new(name, FnTask(Some(f)))
    }

    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    pub fn state(&self) -> ThreadState {
        self.control.state()
    }

    /// Stack size for the OS thread; set before `start`.
    pub fn set_stack_size(&mut self, bytes: usize) {
        self.stack_size = Some(bytes);
    }

    /// Pins the thread to one logical core; applied as the thread starts.
    pub fn set_processor_affinity(&mut self, core: usize) {
        self.control.affinity.store(core, Ordering::SeqCst);
    }

    /// Portable priority in `-127..=127`, 0 = normal; applied as the thread
    /// starts.
    pub fn set_priority(&mut self, priority: i8) {
        self.control.priority.store(priority as i32, Ordering::SeqCst);
    }

    /// Spawns the OS thread. With `wait_until_started` the call does not
    /// return before the new thread is running.
    pub fn start(&mut self, wait_until_started: bool) -> Result<(), Error> {
        if self.control.state() != ThreadState::Created {
            debug_assert!(false, "thread started twice");
            return Ok(());
        }
        let task = match self.task.take() {
            Some(task) => task,
            None => return Ok(()),
        };
        let control = self.control.clone();
        let mut builder = std::thread::Builder::new().name(self.control.name.clone());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        let handle = builder
            .spawn(move || trampoline(control, task))
            .map_err(Error::ResourceExhaustion)?;
        self.join = Some(handle);
        for upcall in creation_upcalls(false) {
            upcall(&self.control);
        }
        if wait_until_started {
            let started = self.control.started.wait(Some(Duration::from_secs(10)));
            debug_assert!(started, "thread failed to start within ten seconds");
        }
        Ok(())
    }

    pub fn request_termination(&self) {
        self.control.request_termination();
    }

    /// See [`ThreadControl::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.control.wait(timeout)
    }
}

impl Drop for CancellableThread {
    fn drop(&mut self) {
        let state = self.control.state();
        debug_assert!(
            state == ThreadState::Created || state == ThreadState::Finished,
            "CancellableThread dropped while its thread is still running"
        );
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
        // Whatever cleanup the thread itself did not run happens here, in
        // the destroying thread.
        self.control.run_cleanup_calls(false);
    }
}

impl std::fmt::Debug for CancellableThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.control.fmt(f)
    }
}

/// Keeps the default panic hook from reporting cooperative cancellation as a
/// crash; the unwinding payload is caught by the trampoline, never observed
/// by user code.
fn silence_cancellation_panics() {
    static HOOK: std::sync::Once = std::sync::Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<CancellationInProgress>().is_none() {
                previous(info);
            }
        }));
    });
}

fn trampoline(control: Arc<ThreadControl>, mut task: Box<dyn Task>) {
    silence_cancellation_panics();
    let id = current_thread_id();
    control.id.store(id, Ordering::SeqCst);
    CURRENT.with(|current| *current.borrow_mut() = Some(control.clone()));

    let affinity = control.affinity.load(Ordering::SeqCst);
    if affinity != NO_AFFINITY {
        platform::set_current_affinity(affinity);
    }
    let priority = control.priority.load(Ordering::SeqCst);
    if priority != 0 {
        platform::set_current_priority(priority as i8);
    }

    control.transition(ThreadState::Created, ThreadState::Running);
    for upcall in creation_upcalls(true) {
        upcall(&control);
    }
    tracing::debug!(thread = %control.name, id, "thread started");
    control.started.wake_all();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
    let fatal = match outcome {
        Ok(()) => None,
        Err(payload) if payload.downcast_ref::<CancellationInProgress>().is_some() => {
            tracing::debug!(thread = %control.name, "thread cancelled");
            None
        }
        Err(payload) => {
            tracing::warn!(thread = %control.name, "panic escaped thread body");
            Some(payload)
        }
    };

    finish(&control, task.as_mut());

    if let Some(payload) = fatal {
        // Abnormal termination; give collaborators their last chance to
        // flush state, then let the panic continue.
        exit::run_exit_hooks();
        panic::resume_unwind(payload);
    }
}

/// Runs the cleanup phase exactly once, on whichever exit path gets here
/// first, then publishes the Finished state.
fn finish(control: &Arc<ThreadControl>, task: &mut dyn Task) {
    if !control.transition(ThreadState::Running, ThreadState::InCleanup) {
        return;
    }
    // Cleanup itself must not be cancellable.
    control.disable_termination();
    if panic::catch_unwind(AssertUnwindSafe(|| task.cleanup())).is_err() {
        tracing::warn!(thread = %control.name, "panic in thread cleanup");
    }
    control.run_cleanup_calls(true);
    control.state.store(ThreadState::Finished as u8, Ordering::SeqCst);
    tracing::debug!(thread = %control.name, "thread finished");
    CURRENT.with(|current| *current.borrow_mut() = None);
    control.stopped.wake_all();
}
