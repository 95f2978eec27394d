//! Background memory sampler.
//!
//! Periodically snapshots the accountant and emits a debug log line. The
//! accountant is the only state shared with the training loop; its mutex
//! keeps every observation consistent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nanotune_tensor::{format_bytes, MemoryAccountant};

pub struct MemorySampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemorySampler {
    /// Start sampling `accountant` every `interval`.
    pub fn start(accountant: Arc<MemoryAccountant>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                let snap = accountant.snapshot();
                tracing::debug!(
                    current = format_bytes(snap.total_current).as_str(),
                    peak = format_bytes(snap.total_peak).as_str(),
                    event = "memory_sample",
                    "periodic memory sample"
                );
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the sampler and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
