//! Per-call context.
//!
//! A `CallContext` is created by the upper layer for one read or write
//! call and shared (behind an `Arc`) with every completion of that call.
//! It holds the request, the accumulated result and the completion
//! signal the caller waits on.
//!
//! Errors are sticky: the first error recorded wins and nothing clears it.

use crate::error::{BlkError, Result};
use crate::page::Page;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// The byte range of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoArgs {
    /// File offset of the first byte.
    pub offset: u64,
    /// Number of bytes requested.
    pub count: u64,
    /// Byte offset of the first byte within the page array.
    pub page_base: u64,
}

impl IoArgs {
    pub fn new(offset: u64, count: u64) -> Self {
        Self {
            offset,
            count,
            page_base: 0,
        }
    }

    pub fn with_page_base(mut self, page_base: u64) -> Self {
        self.page_base = page_base;
        self
    }
}

/// Durability requested by a write caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Unstable,
    DataSync,
    FileSync,
}

/// Durability reported back for a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Unstable,
    DataSync,
    FileSync,
}

/// Snapshot of a call's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub bytes_transferred: u64,
    pub eof: bool,
    pub error: Option<BlkError>,
    /// Set for writes only.
    pub stability: Option<Stability>,
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

type DoneCallback = Box<dyn FnOnce(&CallOutcome) + Send + 'static>;

#[derive(Default)]
struct CallState {
    bytes_transferred: u64,
    eof: bool,
    error: Option<BlkError>,
    stability: Option<Stability>,
    done: bool,
}

impl CallState {
    fn outcome(&self) -> CallOutcome {
        CallOutcome {
            bytes_transferred: self.bytes_transferred,
            eof: self.eof,
            error: self.error.clone(),
            stability: self.stability,
        }
    }
}

pub struct CallContext {
    pages: Vec<Page>,
    args: IoArgs,
    file_size: u64,
    direct: bool,
    started: AtomicBool,
    state: Mutex<CallState>,
    done_cv: Condvar,
    on_done: Mutex<Option<DoneCallback>>,
}

impl CallContext {
    /// A buffered call over `pages`. `file_size` is the file size known to
    /// the caller, used to detect end of file on reads.
    pub fn new(pages: Vec<Page>, args: IoArgs, file_size: u64) -> Self {
        Self {
            pages,
            args,
            file_size,
            direct: false,
            started: AtomicBool::new(false),
            state: Mutex::new(CallState::default()),
            done_cv: Condvar::new(),
            on_done: Mutex::new(None),
        }
    }

    /// Direct I/O: byte ranges within pages are honoured instead of whole
    /// pages being transferred.
    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Run `f` once the call is done, on the finalizing thread.
    pub fn on_done<F>(self, f: F) -> Self
    where
        F: FnOnce(&CallOutcome) + Send + 'static,
    {
        *lock(&self.on_done) = Some(Box::new(f));
        self
    }

    #[inline]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    #[inline]
    pub fn args(&self) -> IoArgs {
        self.args
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Claim the context for one dispatch. A second claim fails.
    pub fn begin(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BlkError::AlreadyUsed);
        }
        Ok(())
    }

    /// Record `err` unless an error is already recorded.
    /// Returns true if `err` became the call's error.
    pub fn record_error(&self, err: BlkError) -> bool {
        let mut state = lock(&self.state);
        if state.error.is_some() {
            return false;
        }
        state.error = Some(err);
        true
    }

    pub fn error(&self) -> Option<BlkError> {
        lock(&self.state).error.clone()
    }

    pub fn set_transfer(&self, bytes_transferred: u64, eof: bool) {
        let mut state = lock(&self.state);
        state.bytes_transferred = bytes_transferred;
        state.eof = eof;
    }

    pub fn set_stability(&self, stability: Stability) {
        lock(&self.state).stability = Some(stability);
    }

    /// Mark the call done, wake waiters and run the `on_done` callback.
    /// Only the first call has any effect.
    pub fn complete(&self) {
        let outcome = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            state.done = true;
            state.outcome()
        };
        self.done_cv.notify_all();

        let callback = lock(&self.on_done).take();
        if let Some(cb) = callback {
            cb(&outcome);
        }
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    /// Current result, whether or not the call is done.
    pub fn outcome(&self) -> CallOutcome {
        lock(&self.state).outcome()
    }

    /// Block until the call is done.
    ///
    /// There is no timeout underneath: if a device never completes a
    /// descriptor, this never returns. Use `wait_timeout` to bound the wait.
    pub fn wait(&self) -> CallOutcome {
        let mut state = lock(&self.state);
        while !state.done {
            state = match self.done_cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.outcome()
    }

    /// Block until done or `timeout` elapses. `None` on timeout; the call
    /// keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CallOutcome> {
        let state = lock(&self.state);
        let (state, _) = match self.done_cv.wait_timeout_while(state, timeout, |s| !s.done) {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.done {
            Some(state.outcome())
        } else {
            None
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("pages", &self.pages.len())
            .field("args", &self.args)
            .field("file_size", &self.file_size)
            .field("direct", &self.direct)
            .field("outcome", &self.outcome())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn ctx() -> CallContext {
        CallContext::new(Page::array(2), IoArgs::new(0, 8192), 8192)
    }

    #[test]
    fn test_error_is_sticky() {
        let c = ctx();
        assert!(c.record_error(BlkError::device_io(5)));
        assert!(!c.record_error(BlkError::device_io(28)));
        assert_eq!(c.error(), Some(BlkError::device_io(5)));
    }

    #[test]
    fn test_begin_once() {
        let c = ctx();
        assert!(c.begin().is_ok());
        assert_eq!(c.begin(), Err(BlkError::AlreadyUsed));
    }

    #[test]
    fn test_complete_wakes_waiter() {
        let c = Arc::new(ctx());
        let c2 = c.clone();
        let waiter = thread::spawn(move || c2.wait());
        c.set_transfer(8192, true);
        c.complete();
        let outcome = waiter.join().unwrap();
        assert_eq!(outcome.bytes_transferred, 8192);
        assert!(outcome.eof);
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c = ctx();
        assert!(c.wait_timeout(Duration::from_millis(10)).is_none());
        c.complete();
        assert!(c.wait_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_on_done_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let c = ctx().on_done(move |o| {
            assert!(o.error.is_some());
            h.fetch_add(1, Ordering::SeqCst);
        });
        c.record_error(BlkError::Allocation);
        c.complete();
        c.complete();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(c.is_done());
    }
}
