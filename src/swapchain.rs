//! Per-swapchain present results.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

use crate::backend::{GpuBackend, PresentResult};

/// Thread-safe map from swapchain handle to the result of its last present.
///
/// Results are consumed on read: a reader that arrives before the present has
/// happened blocks until the worker records one. Swapchains are independent;
/// a result for one never satisfies a waiter on another.
pub(crate) struct SwapchainStatus<B: GpuBackend> {
    results: Mutex<HashMap<B::Swapchain, PresentResult>>,
    available: Condvar,
}

impl<B: GpuBackend> SwapchainStatus<B> {
    pub(crate) fn new() -> SwapchainStatus<B> {
        SwapchainStatus {
            results: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        }
    }

    /// Runs `present` and records its result, holding the map lock across
    /// both so a reader can never observe a present without its result.
    pub(crate) fn record(
        &self,
        swapchain: B::Swapchain,
        present: impl FnOnce() -> PresentResult,
    ) -> PresentResult {
        let mut results = self.results.lock();
        let result = present();
        results.insert(swapchain, result);
        self.available.notify_all();
        result
    }

    /// Blocks until a present result exists for `swapchain`, then removes and
    /// returns it.
    pub(crate) fn take(&self, swapchain: B::Swapchain) -> PresentResult {
        let mut results = self.results.lock();
        loop {
            if let Some(result) = results.remove(&swapchain) {
                return result;
            }
            self.available.wait(&mut results);
        }
    }
}
