//! Fault injection for the queue's allocation path
//!
//! Node allocation failures are rare enough that the `AllocFailed` path would
//! otherwise never run. Two ways to force it:
//!
//! - [`inject_alloc_failures`]: fail the next `n` node allocations made on the
//!   calling thread. Always available, scoped to one thread so parallel tests
//!   do not see each other's failures.
//! - the `queue_node_alloc_fail` failpoint, only compiled in with the
//!   `failpoints` feature:
//!
//! ```bash
//! cargo test --features failpoints
//! ```
//!
//! ```rust,ignore
//! let scenario = fail::FailScenario::setup();
//! fail::cfg("queue_node_alloc_fail", "1*return->off").unwrap();
//!
//! assert!(queue.try_insert(item).unwrap_err().is_alloc_failed());
//!
//! scenario.teardown();
//! ```

use std::cell::Cell;

/// Failpoint evaluated before every node allocation.
pub const NODE_ALLOC_FAILPOINT: &str = "queue_node_alloc_fail";

thread_local! {
    static PENDING_ALLOC_FAILURES: Cell<usize> = const { Cell::new(0) };
}

/// Make the next `n` node allocations on this thread fail
pub fn inject_alloc_failures(n: usize) {
    PENDING_ALLOC_FAILURES.with(|pending| pending.set(n));
}

/// Cancel any injected failures left on this thread
pub fn clear_alloc_failures() {
    inject_alloc_failures(0);
}

/// Injected failures not yet consumed on this thread
pub fn pending_alloc_failures() -> usize {
    PENDING_ALLOC_FAILURES.with(Cell::get)
}

/// Whether the allocation about to happen should be reported as failed.
pub(crate) fn should_fail_alloc() -> bool {
    if crate::fail_point_is_set!(NODE_ALLOC_FAILPOINT) {
        return true;
    }
    PENDING_ALLOC_FAILURES.with(|pending| match pending.get() {
        0 => false,
        n => {
            pending.set(n - 1);
            true
        }
    })
}

/// Macro to check if a fail point is enabled (for conditional logic)
#[macro_export]
macro_rules! fail_point_is_set {
    ($name:expr) => {{
        #[cfg(feature = "failpoints")]
        {
            ::fail::eval($name, |_| true).is_some()
        }
        #[cfg(not(feature = "failpoints"))]
        {
            false
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failures_are_consumed_one_by_one() {
        assert!(!should_fail_alloc());

        inject_alloc_failures(2);
        assert_eq!(pending_alloc_failures(), 2);
        assert!(should_fail_alloc());
        assert!(should_fail_alloc());
        assert!(!should_fail_alloc());
        assert_eq!(pending_alloc_failures(), 0);
    }

    #[test]
    fn injected_failures_stay_on_their_thread() {
        inject_alloc_failures(3);
        let other = std::thread::spawn(should_fail_alloc)
            .join()
            .expect("probe thread");
        assert!(!other);
        assert_eq!(pending_alloc_failures(), 3);

        clear_alloc_failures();
        assert!(!should_fail_alloc());
    }
}
