//! `ThreadedTransport` — default `BlockTransport` implementation.
//!
//! Spawns N OS threads at creation. `submit()` pushes the descriptor on a
//! lock-free MPMC queue and unparks one worker; workers run the
//! descriptor through `device_io::execute` (this MAY block, which is the
//! point) and complete it on the worker thread.
//!
//! No dynamic scaling. Workers drain the queue before exiting, so every
//! accepted descriptor completes even across `shutdown()`.

use crate::device_io;

use blocklayout_core::descriptor::{BlockTransport, Descriptor};
use blocklayout_core::env::env_get;
use blocklayout_core::{kdebug, kwarn};

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Configuration for `ThreadedTransport`.
#[derive(Debug, Clone)]
pub struct ThreadedTransportConfig {
    /// Worker threads. Default min(8, nproc/2), at least 2.
    pub workers: usize,
    /// Segments per descriptor this transport accepts.
    pub max_segments: usize,
}

impl Default for ThreadedTransportConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers: (cpus / 2).clamp(2, 8),
            max_segments: 256,
        }
    }
}

impl ThreadedTransportConfig {
    /// Defaults overridden by `BL_TRANSPORT_WORKERS` / `BL_TRANSPORT_MAX_SEGMENTS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_get("BL_TRANSPORT_WORKERS", d.workers),
            max_segments: env_get("BL_TRANSPORT_MAX_SEGMENTS", d.max_segments),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.workers == 0 || self.workers > 64 {
            return Err("workers must be in 1..=64");
        }
        if self.max_segments == 0 {
            return Err("max_segments must be at least 1");
        }
        Ok(())
    }
}

/// Shared state between submitters and workers.
struct TransportInner {
    queue: SegQueue<Descriptor>,
    /// Submitted, not yet completed.
    inflight: AtomicUsize,
    /// Workers currently executing a descriptor.
    active: AtomicUsize,
    shutdown: AtomicBool,
    /// Round-robin cursor for unparking.
    next_wake: AtomicUsize,
}

pub struct ThreadedTransport {
    inner: Arc<TransportInner>,
    threads: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    max_segments: usize,
}

impl ThreadedTransport {
    pub fn new(config: ThreadedTransportConfig) -> std::io::Result<Self> {
        config
            .validate()
            .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;

        let inner = Arc::new(TransportInner {
            queue: SegQueue::new(),
            inflight: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            next_wake: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("bl-io-{}", worker_id))
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
        kdebug!(
            "threaded transport: {} workers, max_segments={}",
            config.workers,
            config.max_segments
        );

        Ok(Self {
            inner,
            threads: handles.iter().map(|h| h.thread().clone()).collect(),
            handles: Mutex::new(handles),
            max_segments: config.max_segments,
        })
    }

    /// Workers currently inside a device call.
    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total_workers(&self) -> usize {
        self.threads.len()
    }

    /// Shut down and wait for the workers to drain and exit.
    pub fn join(&self) {
        self.shutdown();
        let handles = match self.handles.lock() {
            Ok(mut h) => std::mem::take(&mut *h),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for h in handles {
            if h.join().is_err() {
                kwarn!("threaded transport: worker panicked");
            }
        }
    }

    fn wake_one(&self) {
        let i = self.inner.next_wake.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].unpark();
    }
}

impl BlockTransport for ThreadedTransport {
    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn submit(&self, desc: Descriptor) {
        // Counted before the flag check; workers exit only when nothing
        // is in flight.
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        if self.inner.shutdown.load(Ordering::SeqCst) {
            self.inner.inflight.fetch_sub(1, Ordering::SeqCst);
            desc.complete(Err(libc::ESHUTDOWN));
            return;
        }
        self.inner.queue.push(desc);
        self.wake_one();
    }

    fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for t in &self.threads {
            t.unpark();
        }
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        // Workers drain the queue and exit on their own; call join() to wait.
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<TransportInner>) {
    loop {
        match inner.queue.pop() {
            Some(desc) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                let result = device_io::execute(&desc);
                inner.active.fetch_sub(1, Ordering::Relaxed);
                desc.complete(result);
                inner.inflight.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if inner.shutdown.load(Ordering::SeqCst)
                    && inner.inflight.load(Ordering::SeqCst) == 0
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
    use crate::mem_device::MemDevice;
    use blocklayout_core::descriptor::Direction;
    use blocklayout_core::device::DeviceId;
    use blocklayout_core::page::Page;
    use std::sync::mpsc;

    fn transport(workers: usize) -> ThreadedTransport {
        ThreadedTransport::new(ThreadedTransportConfig::default().workers(workers)).unwrap()
    }

    #[test]
    fn test_config_validate() {
        assert!(ThreadedTransportConfig::default().validate().is_ok());
        assert!(ThreadedTransportConfig::default().workers(0).validate().is_err());
        assert!(ThreadedTransportConfig::default().max_segments(0).validate().is_err());
        assert!(ThreadedTransport::new(ThreadedTransportConfig::default().workers(0)).is_err());
    }

    #[test]
    fn test_completes_on_worker_thread() {
        let dev = Arc::new(MemDevice::new(DeviceId(1), 64));
        let t = transport(2);
        let (tx, rx) = mpsc::channel();

        for i in 0..8u64 {
            let mut d = Descriptor::try_new(dev.clone(), i * 8, Direction::Write, 1).unwrap();
            d.push_segment(Page::filled(i as u8 + 1), 0, 4096).unwrap();
            let tx = tx.clone();
            d.set_end_io(Box::new(move |r| {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.send((r, name));
            }));
            t.submit(d);
        }
        for _ in 0..8 {
            let (r, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(r, Ok(()));
            assert!(name.unwrap().starts_with("bl-io-"));
        }
        t.join();
        assert_eq!(t.inflight(), 0);
        assert_eq!(dev.read_bytes(7 * 8 * 512, 1), vec![8]);
    }

    #[test]
    fn test_shutdown_drains_then_rejects() {
        let dev = Arc::new(MemDevice::new(DeviceId(1), 64));
        dev.set_latency(Some(Duration::from_millis(5)));
        let t = transport(2);
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let mut d = Descriptor::try_new(dev.clone(), 0, Direction::Read, 1).unwrap();
            d.push_segment(Page::new(), 0, 512).unwrap();
            let tx = tx.clone();
            d.set_end_io(Box::new(move |r| {
                let _ = tx.send(r);
            }));
            t.submit(d);
        }
        t.join();
        let mut results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_ok()));

        let mut d = Descriptor::try_new(dev, 0, Direction::Read, 1).unwrap();
        let tx2 = tx.clone();
        d.set_end_io(Box::new(move |r| {
            let _ = tx2.send(r);
        }));
        t.submit(d);
        results = rx.try_iter().collect();
        assert_eq!(results, vec![Err(libc::ESHUTDOWN)]);
    }

    #[test]
    fn test_submit_racing_shutdown_completes_every_descriptor() {
        let dev = Arc::new(MemDevice::new(DeviceId(1), 64));
        for _ in 0..100 {
            let t = Arc::new(transport(1));
            let completed = Arc::new(AtomicUsize::new(0));
            let submitter = {
                let t = t.clone();
                let dev = dev.clone();
                let completed = completed.clone();
                thread::spawn(move || {
                    for _ in 0..32 {
                        let mut d = Descriptor::try_new(dev.clone(), 0, Direction::Read, 1).unwrap();
                        d.push_segment(Page::new(), 0, 512).unwrap();
                        let c = completed.clone();
                        d.set_end_io(Box::new(move |_| {
                            c.fetch_add(1, Ordering::SeqCst);
                        }));
                        t.submit(d);
                    }
                })
            };
            thread::yield_now();
            t.shutdown();
            submitter.join().unwrap();
            t.join();
            assert_eq!(completed.load(Ordering::SeqCst), 32);
            assert_eq!(t.inflight(), 0);
        }
    }
}
