use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadcore::{register_exit_hook, unregister_exit_hook, CancellableThread};

// Exit hooks run at most once per process, so everything about them lives in
// this single test.
#[test]
fn fatal_panic_in_a_thread_fires_exit_hooks_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    register_exit_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let removed = fired.clone();
    let id = register_exit_hook(move || {
        removed.fetch_add(100, Ordering::SeqCst);
    });
    assert!(unregister_exit_hook(id));

    let mut t = CancellableThread::with_fn("fatal", || panic!("unrecoverable"));
    t.start(true).unwrap();
    assert!(t.wait(Some(Duration::from_secs(5))));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // A second fatal thread must not fire them again.
    let mut t = CancellableThread::with_fn("fatal-again", || panic!("still broken"));
    t.start(true).unwrap();
    assert!(t.wait(Some(Duration::from_secs(5))));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
