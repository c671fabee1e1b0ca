//! Page buffers.
//!
//! A `Page` is a shared handle to one `PAGE_SIZE` buffer. The upper layer
//! owns the page array of a call; descriptors hold clones of the handles
//! while they are in flight, so a page outlives every device operation
//! that touches it.
//!
//! **Contract:** while a call is in flight the caller must not touch its
//! pages. Transports that hand raw buffer addresses to the kernel rely on
//! this (see `Page::buf_ptr`).

use crate::sector::PAGE_SIZE;

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Page {
    buf: Arc<Mutex<Box<[u8]>>>,
}

impl Page {
    /// A zero-filled page.
    pub fn new() -> Self {
        Self::filled(0)
    }

    /// A page with every byte set to `byte`.
    pub fn filled(byte: u8) -> Self {
        Self {
            buf: Arc::new(Mutex::new(vec![byte; PAGE_SIZE].into_boxed_slice())),
        }
    }

    /// A page initialised from `data` (truncated to, or zero-padded up to, one page).
    pub fn from_bytes(data: &[u8]) -> Self {
        let page = Self::new();
        {
            let mut buf = page.lock();
            let n = data.len().min(PAGE_SIZE);
            buf[..n].copy_from_slice(&data[..n]);
        }
        page
    }

    /// Allocate `n` zeroed pages.
    pub fn array(n: usize) -> Vec<Page> {
        (0..n).map(|_| Page::new()).collect()
    }

    /// Lock the buffer. A poisoned lock still yields the bytes; page
    /// contents carry no invariant a panic could break.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        match self.buf.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Zero `len` bytes starting at `offset`, clamped to the page.
    pub fn zero_range(&self, offset: usize, len: usize) {
        let start = offset.min(PAGE_SIZE);
        let end = offset.saturating_add(len).min(PAGE_SIZE);
        self.lock()[start..end].fill(0);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().to_vec()
    }

    /// Address of the shared buffer; equal for clones of one page.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.buf) as *const u8 as usize
    }

    /// True when both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    /// Raw address of the buffer, for transports that give the kernel
    /// direct access (io_uring).
    ///
    /// # Safety
    ///
    /// The buffer allocation never moves, so the pointer stays valid while
    /// any clone of this handle is alive. The caller must guarantee no
    /// other access to the page happens until the device operation using
    /// the pointer has completed; this holds for pages owned by an
    /// in-flight call.
    pub unsafe fn buf_ptr(&self) -> *mut u8 {
        self.lock().as_mut_ptr()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("addr", &Arc::as_ptr(&self.buf))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_zeroed() {
        let page = Page::new();
        assert_eq!(page.to_vec().len(), PAGE_SIZE);
        assert!(page.to_vec().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_range_clamps() {
        let page = Page::filled(0xAB);
        page.zero_range(4000, 1000);
        let bytes = page.to_vec();
        assert_eq!(bytes[3999], 0xAB);
        assert!(bytes[4000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_bytes_pads() {
        let page = Page::from_bytes(b"hello");
        let bytes = page.to_vec();
        assert_eq!(&bytes[..5], b"hello");
        assert_eq!(bytes[5], 0);
    }

    #[test]
    fn test_clone_shares_buffer() {
        let a = Page::new();
        let b = a.clone();
        b.lock()[0] = 7;
        assert_eq!(a.to_vec()[0], 7);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Page::new()));
    }
}
