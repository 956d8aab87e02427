//! Monotonic time source.

pub use tokio::time::Instant;

/// Source of the current monotonic time for the event loop.
///
/// Tokio's `Instant` is used so that a paused test runtime (`start_paused = true`) controls
/// every timestamp the core records, not only its timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// `Clock` backed by the tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
