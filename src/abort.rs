use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A cooperative cancellation request, polled while a captured child runs.
///
/// [`CapturedProcess`](crate::CapturedProcess) checks `is_set()` once per poll interval.
/// When it returns true, the child is forcibly terminated and the run reports
/// [`ABORTED_EXIT_CODE`](crate::ABORTED_EXIT_CODE).
///
/// Implemented for `AtomicBool` (and references and `Arc`s to it), for closures
/// wrapped in [`AbortWhen`], and for [`Deadline`].
pub trait AbortSignal {
    fn is_set(&self) -> bool;
}

/// An abort signal that is never set.
#[derive(Debug, Default, Copy, Clone)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_set(&self) -> bool {
        false
    }
}

impl AbortSignal for AtomicBool {
    fn is_set(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: AbortSignal + ?Sized> AbortSignal for &T {
    fn is_set(&self) -> bool {
        (**self).is_set()
    }
}

impl<T: AbortSignal + ?Sized> AbortSignal for Arc<T> {
    fn is_set(&self) -> bool {
        (**self).is_set()
    }
}

/// Adapts a closure into an [`AbortSignal`].
///
/// ```
/// use captured_process::{AbortSignal, AbortWhen};
/// let signal = AbortWhen(|| false);
/// assert!(!signal.is_set());
/// ```
#[derive(Debug, Copy, Clone)]
pub struct AbortWhen<F>(pub F);

impl<F: Fn() -> bool> AbortSignal for AbortWhen<F> {
    fn is_set(&self) -> bool {
        (self.0)()
    }
}

/// An abort signal that becomes set once a point in time has passed.
///
/// There is no built-in timeout on a run; a `Deadline` provides one.
#[derive(Debug, Copy, Clone)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Deadline {
        Deadline(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }
}

impl AbortSignal for Deadline {
    fn is_set(&self) -> bool {
        Instant::now() >= self.0
    }
}
