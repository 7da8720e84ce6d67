//! The containment guard must leave the process panic hook as it found it.
//!
//! Kept in its own test binary: it replaces the global hook.

use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use model_host::loader::containment::{contain, FaultGuard};

static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn test_previous_hook_restored_on_every_path() {
    panic::set_hook(Box::new(|_| {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }));

    // A contained panic does not reach the previous hook.
    assert!(contain(|| -> () { panic!("inside attempt") }).is_err());
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 0);

    // A recoverable error path restores it too.
    let result: Result<Result<(), String>, _> = contain(|| Err("soft".to_string()));
    assert_eq!(result, Ok(Err("soft".to_string())));

    // After the guard is gone the previous hook sees panics again.
    assert!(panic::catch_unwind(|| panic!("outside attempt")).is_err());
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);

    // While one thread holds a guard, other threads still reach the previous hook.
    let guard = FaultGuard::install();
    let other = std::thread::spawn(|| panic::catch_unwind(|| panic!("other thread")).is_err());
    assert!(other.join().unwrap());
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 2);
    drop(guard);

    // Overlapping guards across threads restore once the last one drops.
    let barrier = Arc::new(std::sync::Barrier::new(2));
    let b = Arc::clone(&barrier);
    let worker = std::thread::spawn(move || {
        let fault = contain(|| {
            b.wait();
            panic!("worker attempt")
        });
        fault.is_err()
    });
    let outer = contain(|| {
        barrier.wait();
        1
    });
    assert!(worker.join().unwrap());
    assert_eq!(outer, Ok(1));
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 2);

    assert!(panic::catch_unwind(|| panic!("after all guards")).is_err());
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 3);

    drop(panic::take_hook());
}
