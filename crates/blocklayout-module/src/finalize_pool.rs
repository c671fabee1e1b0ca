//! `FinalizePool` — default `Deferred` implementation.
//!
//! N dedicated OS threads drain a lock-free queue of work items. Finalize
//! work (extent map updates, waking the caller) may block, so it never
//! runs on a transport completion thread.
//!
//! A panicking item is caught and logged; the worker keeps going.

use blocklayout_core::deferred::{Deferred, Work};
use blocklayout_core::env::env_get;
use blocklayout_core::{kdebug, kerror, kwarn};

use crossbeam_queue::SegQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct PoolInner {
    queue: SegQueue<Work>,
    pending: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct FinalizePool {
    inner: Arc<PoolInner>,
    threads: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FinalizePool {
    /// Start a pool with `n` threads (at least one).
    pub fn new(n: usize) -> std::io::Result<Self> {
        let n = n.clamp(1, 32);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("bl-finalize-{}", id))
                .spawn(move || worker_loop(worker_inner));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for h in &handles {
                        h.thread().unpark();
                    }
                    return Err(e);
                }
            }
        }
        kdebug!("finalize pool: {} threads", n);

        Ok(Self {
            inner,
            threads: handles.iter().map(|h| h.thread().clone()).collect(),
            handles: Mutex::new(handles),
        })
    }

    /// Pool sized from `BL_FINALIZE_WORKERS` (default 1).
    pub fn from_env() -> std::io::Result<Self> {
        Self::new(env_get("BL_FINALIZE_WORKERS", 1))
    }

    /// Shut down, run what is queued, and wait for the threads to exit.
    pub fn join(&self) {
        self.shutdown();
        let handles = match self.handles.lock() {
            Ok(mut h) => std::mem::take(&mut *h),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for h in handles {
            if h.join().is_err() {
                kwarn!("finalize pool: worker exited abnormally");
            }
        }
    }
}

impl Deferred for FinalizePool {
    fn schedule(&self, work: Work) -> Result<(), Work> {
        // Count the item before looking at the flag: a worker only exits
        // once it has seen the flag with nothing pending.
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.shutdown.load(Ordering::SeqCst) {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(work);
        }
        self.inner.queue.push(work);
        for t in &self.threads {
            t.unpark();
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for t in &self.threads {
            t.unpark();
        }
    }
}

impl Drop for FinalizePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.queue.pop() {
            Some(work) => {
                inner.pending.fetch_sub(1, Ordering::SeqCst);
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    kerror!("finalize pool: work item panicked");
                }
            }
            None => {
                if inner.shutdown.load(Ordering::SeqCst)
                    && inner.pending.load(Ordering::SeqCst) == 0
                {
                    break;
                }
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runs_on_pool_thread() {
        let pool = FinalizePool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        }))
        .map_err(|_| ())
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("bl-finalize-0"));
        pool.join();
    }

    #[test]
    fn test_join_drains_queue() {
        let pool = FinalizePool::new(2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            assert!(pool
                .schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok());
        }
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = FinalizePool::new(1).unwrap();
        pool.shutdown();
        assert!(pool.schedule(Box::new(|| {})).is_err());
        pool.join();
    }

    #[test]
    fn test_accepted_work_survives_concurrent_shutdown() {
        for _ in 0..200 {
            let pool = Arc::new(FinalizePool::new(1).unwrap());
            let ran = Arc::new(AtomicUsize::new(0));
            let scheduler = {
                let pool = pool.clone();
                let ran = ran.clone();
                thread::spawn(move || {
                    let mut accepted = 0;
                    for _ in 0..64 {
                        let r = ran.clone();
                        let work: Work = Box::new(move || {
                            r.fetch_add(1, Ordering::SeqCst);
                        });
                        if pool.schedule(work).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            };
            thread::yield_now();
            pool.shutdown();
            let accepted = scheduler.join().unwrap();
            pool.join();
            assert_eq!(ran.load(Ordering::SeqCst), accepted);
            assert_eq!(pool.pending(), 0);
        }
    }

    #[test]
    fn test_panicking_item_does_not_kill_worker() {
        let pool = FinalizePool::new(1).unwrap();
        assert!(pool.schedule(Box::new(|| panic!("boom"))).is_ok());
        let (tx, rx) = mpsc::channel();
        assert!(pool
            .schedule(Box::new(move || {
                let _ = tx.send(());
            }))
            .is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.join();
    }
}
