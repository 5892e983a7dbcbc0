//! Process-exit hooks.
//!
//! Collaborators register hooks that should run before abnormal process
//! termination, for example flushing a journal. The set runs at most once
//! per process: either when the first non-cancellation panic escapes a
//! [`CancellableThread`](crate::thread::CancellableThread)'s `run`, or when
//! a caller invokes [`run_exit_hooks`] directly before aborting.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub type ExitHookId = u64;

type ExitHook = Box<dyn FnOnce() + Send + 'static>;

lazy_static! {
    static ref HOOKS: Mutex<Vec<(ExitHookId, ExitHook)>> = Mutex::new(Vec::new());
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static FIRED: AtomicBool = AtomicBool::new(false);

pub fn register_exit_hook(hook: impl FnOnce() + Send + 'static) -> ExitHookId {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    HOOKS.lock().unwrap().push((id, Box::new(hook)));
    id
}

/// Removes a hook before it has run. Returns whether it was found.
pub fn unregister_exit_hook(id: ExitHookId) -> bool {
    let mut hooks = HOOKS.lock().unwrap();
    let before = hooks.len();
    hooks.retain(|(hook_id, _)| *hook_id != id);
    hooks.len() != before
}

/// Runs all registered hooks, once per process. Later calls do nothing.
pub fn run_exit_hooks() {
    if FIRED.swap(true, Ordering::SeqCst) {
        return;
    }
    let hooks = std::mem::take(&mut *HOOKS.lock().unwrap());
    for (id, hook) in hooks {
        tracing::debug!(hook = id, "running process exit hook");
        hook();
    }
}
