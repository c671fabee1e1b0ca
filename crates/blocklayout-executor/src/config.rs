//! Dispatch configuration

use blocklayout_core::env::env_get;

/// Configuration for the `Dispatcher`.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on segments per descriptor. The effective limit is the
    /// smaller of this and the transport's own limit.
    pub max_segments: usize,

    /// Finalize threads started by `Dispatcher::from_env()`.
    pub finalize_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_segments: 256,
            finalize_workers: 1,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BL_MAX_SEGMENTS` / `BL_FINALIZE_WORKERS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_segments: env_get("BL_MAX_SEGMENTS", d.max_segments),
            finalize_workers: env_get("BL_FINALIZE_WORKERS", d.finalize_workers),
        }
    }

    /// Set the per-descriptor segment bound
    pub fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    /// Set the number of finalize threads
    pub fn finalize_workers(mut self, n: usize) -> Self {
        self.finalize_workers = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_segments == 0 {
            return Err("max_segments must be at least 1");
        }
        if self.finalize_workers == 0 {
            return Err("finalize_workers must be at least 1");
        }
        if self.finalize_workers > 32 {
            return Err("finalize_workers exceeds maximum");
        }
        Ok(())
    }
}
