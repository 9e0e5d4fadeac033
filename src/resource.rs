//! Resource lifetime tagging and deferred destruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::serial::Serial;

/// Tracks the last submission serial that uses a resource.
///
/// Shared (via `Arc`) between the caller's resource wrapper and the
/// [`ResourceUseList`] attached to a submit task. The tag is written when the
/// task is assigned its serial; afterwards the resource must not be destroyed
/// until the device's last-completed serial reaches the tag.
#[derive(Debug, Default)]
pub struct ResourceUse {
    last_used: AtomicU64,
}

impl ResourceUse {
    pub fn new() -> ResourceUse {
        ResourceUse {
            last_used: AtomicU64::new(0),
        }
    }

    /// The most recent submission that references this resource.
    pub fn last_used_serial(&self) -> Serial {
        Serial::from_raw(self.last_used.load(Ordering::Acquire))
    }

    /// Whether the resource is unreferenced by the GPU once `completed` has
    /// been reached.
    pub fn is_unused_at(&self, completed: Serial) -> bool {
        self.last_used_serial() <= completed
    }

    pub(crate) fn set_last_used(&self, serial: Serial) {
        self.last_used.fetch_max(serial.raw(), Ordering::AcqRel);
    }
}

/// The set of resources one submission will touch on the GPU.
///
/// Accumulated by the producer while recording, then released against the
/// submission serial when the task is enqueued.
#[derive(Debug, Default)]
pub struct ResourceUseList {
    uses: Vec<Arc<ResourceUse>>,
}

impl ResourceUseList {
    pub fn new() -> ResourceUseList {
        ResourceUseList { uses: Vec::new() }
    }

    pub fn add(&mut self, resource: &Arc<ResourceUse>) {
        self.uses.push(resource.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_empty()
    }

    /// Tags every tracked resource with `serial` and drains the list.
    pub(crate) fn release(&mut self, serial: Serial) {
        for resource in self.uses.drain(..) {
            resource.set_last_used(serial);
        }
    }
}

/// Resources that become destroyable once `serial` completes.
///
/// Entries are appended in submission order, which equals fence completion
/// order, so the garbage queue can be reclaimed from the front.
pub(crate) struct GarbageEntry<B: GpuBackend> {
    pub(crate) resources: Vec<B::Garbage>,
    pub(crate) serial: Serial,
}
