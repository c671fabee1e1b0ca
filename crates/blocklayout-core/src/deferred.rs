//! Deferred work abstraction.
//!
//! Completion callbacks run wherever the transport delivers them, often a
//! context that must not block. Work that may block (extent map updates,
//! waking the caller) is handed to a `Deferred` executor instead.
//!
//! # Implementors
//!
//! - `FinalizePool` (default): N dedicated OS threads draining a
//!   lock-free queue.
//! - `InlineDeferred` (testing): runs the work immediately in the caller.

/// A unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs work items on a context that is allowed to block.
///
/// **Contract:**
/// - `schedule()` must never block the caller.
/// - Each accepted item runs exactly once.
/// - A rejected item (executor shut down) is handed back untouched so the
///   caller can decide how to run it.
pub trait Deferred: Send + Sync {
    fn schedule(&self, work: Work) -> std::result::Result<(), Work>;

    /// Items accepted but not yet started.
    fn pending(&self) -> usize;

    /// Stop accepting work. Already accepted items still run.
    fn shutdown(&self);
}
