//! In-flight submission tracking and reclamation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, trace_span, warn};

use crate::backend::{
    CommandPoolKind, FenceStatus, GpuBackend, PresentInfo, PresentResult, QueuePriority,
    SharedFence, SubmitDescriptor,
};
use crate::error::DeviceError;
use crate::resource::GarbageEntry;
use crate::serial::Serial;
use crate::swapchain::SwapchainStatus;

/// Hard cap on in-flight submissions. When the list grows past this, the
/// submit path blocks on the oldest excess fence, which in turn throttles
/// producers because the worker stops consuming until the wait returns.
pub const IN_FLIGHT_LIMIT: usize = 100;

/// One in-flight submission and the resources it pins. Immutable from the
/// moment it enters the in-flight list until its fence signals.
pub(crate) struct Batch<B: GpuBackend> {
    pub(crate) primary: B::Primary,
    pub(crate) pool: B::Pool,
    pub(crate) fence: SharedFence<B>,
    pub(crate) serial: Serial,
}

/// Allocates primary command buffers and recycles them after their batch
/// completes. Backed by a single persistent pool, opened on first use.
pub(crate) struct PrimaryCommandPool<B: GpuBackend> {
    pool: Option<B::Pool>,
    free: Vec<B::Primary>,
}

impl<B: GpuBackend> PrimaryCommandPool<B> {
    fn new() -> PrimaryCommandPool<B> {
        PrimaryCommandPool {
            pool: None,
            free: Vec::new(),
        }
    }

    fn allocate(&mut self, backend: &B) -> Result<B::Primary, DeviceError> {
        if let Some(primary) = self.free.pop() {
            return Ok(primary);
        }
        if self.pool.is_none() {
            self.pool = Some(backend.create_command_pool(CommandPoolKind::Persistent)?);
        }
        let pool = self.pool.as_ref().expect("primary pool just opened");
        backend.allocate_primary(pool)
    }

    fn collect(&mut self, backend: &B, mut primary: B::Primary) -> Result<(), DeviceError> {
        backend.reset_primary(&mut primary)?;
        self.free.push(primary);
        Ok(())
    }

    fn destroy(&mut self, backend: &B) {
        for primary in self.free.drain(..) {
            backend.destroy_primary(primary);
        }
        if let Some(pool) = self.pool.take() {
            backend.destroy_command_pool(pool);
        }
    }
}

struct InFlight<B: GpuBackend> {
    commands: VecDeque<Batch<B>>,
    garbage: VecDeque<GarbageEntry<B>>,
}

/// Owns the in-flight list, the garbage queue and the primary pool, and
/// performs every GPU-queue operation.
///
/// Lock order: `inflight` before `primaries`; both are leaves with respect to
/// the task-queue and serial locks. The `inflight` lock is held for fence
/// *status* queries only, never across a blocking wait.
pub(crate) struct SubmissionEngine<B: GpuBackend> {
    backend: Arc<B>,
    inflight: Mutex<InFlight<B>>,
    primaries: Mutex<PrimaryCommandPool<B>>,
    pub(crate) swapchains: SwapchainStatus<B>,
}

impl<B: GpuBackend> SubmissionEngine<B> {
    pub(crate) fn new(backend: Arc<B>) -> SubmissionEngine<B> {
        SubmissionEngine {
            backend,
            inflight: Mutex::new(InFlight {
                commands: VecDeque::new(),
                garbage: VecDeque::new(),
            }),
            primaries: Mutex::new(PrimaryCommandPool::new()),
            swapchains: SwapchainStatus::new(),
        }
    }

    /// Takes a recycled primary, or allocates one from the persistent pool.
    pub(crate) fn acquire_primary(&self) -> Result<B::Primary, DeviceError> {
        self.primaries.lock().allocate(&self.backend)
    }

    /// Submits an ended primary and registers the resulting batch.
    ///
    /// Appends garbage under the batch serial, sweeps completed batches, and
    /// throttles by finishing to the oldest excess serial when the in-flight
    /// list exceeds [`IN_FLIGHT_LIMIT`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_commands(
        &self,
        priority: QueuePriority,
        primary: B::Primary,
        pool: B::Pool,
        wait_semaphores: &[B::Semaphore],
        wait_stage_masks: &[B::StageMask],
        signal_semaphore: Option<B::Semaphore>,
        garbage: Vec<B::Garbage>,
        serial: Serial,
    ) -> Result<(), DeviceError> {
        let _span = trace_span!("submit_commands", serial = ?serial).entered();

        let fence = self.backend.next_submit_fence()?;
        let submit = SubmitDescriptor {
            commands: Some(&primary),
            wait_semaphores,
            wait_stage_masks,
            signal_semaphore,
        };
        if let Err(err) = self.backend.queue_submit(priority, submit, Some(&fence)) {
            self.backend.destroy_primary(primary);
            self.backend.destroy_command_pool(pool);
            return Err(err);
        }
        self.backend.cleanup_garbage();

        let mut inflight = self.inflight.lock();
        if !garbage.is_empty() {
            inflight.garbage.push_back(GarbageEntry {
                resources: garbage,
                serial,
            });
        }
        inflight.commands.push_back(Batch {
            primary,
            pool,
            fence,
            serial,
        });
        self.sweep(&mut inflight)?;

        if inflight.commands.len() > IN_FLIGHT_LIMIT {
            let excess = inflight.commands.len() - IN_FLIGHT_LIMIT;
            let throttle_serial = inflight.commands[excess].serial;
            drop(inflight);
            trace!(serial = ?throttle_serial, "throttling submission");
            return self.finish_to_serial(throttle_serial);
        }

        Ok(())
    }

    /// Submits a caller-owned command buffer with a caller-owned fence, then
    /// sweeps. No batch bookkeeping: nothing here is pinned.
    pub(crate) fn submit_one_off(
        &self,
        priority: QueuePriority,
        commands: Option<&B::OneOffCommands>,
        fence: Option<&B::Fence>,
    ) -> Result<(), DeviceError> {
        let _span = trace_span!("submit_one_off").entered();
        self.backend.queue_submit_one_off(priority, commands, fence)?;
        self.backend.cleanup_garbage();
        self.check_completed()
    }

    /// Presents under the swapchain-status lock so readers always observe the
    /// result of the present they waited on.
    pub(crate) fn present(&self, priority: QueuePriority, info: PresentInfo<B>) -> PresentResult {
        let backend = &self.backend;
        self.swapchains
            .record(info.swapchain, || backend.queue_present(priority, &info))
    }

    /// Blocks until the first batch with serial >= `serial` (or the newest
    /// batch, if all serials are smaller) has completed, then sweeps.
    /// Returns immediately when nothing is in flight.
    pub(crate) fn finish_to_serial(&self, serial: Serial) -> Result<(), DeviceError> {
        let _span = trace_span!("finish_to_serial", serial = ?serial).entered();

        let fence = {
            let inflight = self.inflight.lock();
            if inflight.commands.is_empty() {
                return Ok(());
            }
            // Batch serials are unique and sorted, so the first match is the
            // one to wait on.
            let index = inflight
                .commands
                .iter()
                .position(|batch| batch.serial >= serial)
                .unwrap_or(inflight.commands.len() - 1);
            inflight.commands[index].fence.clone()
        };

        // The wait must not hold the in-flight lock.
        self.backend
            .wait_fence(&fence, self.backend.fence_wait_timeout_ns())?;

        self.check_completed()
    }

    pub(crate) fn check_completed(&self) -> Result<(), DeviceError> {
        let mut inflight = self.inflight.lock();
        self.sweep(&mut inflight)
    }

    /// Walks the in-flight list from the head, reclaiming every batch whose
    /// fence has signaled, then destroys garbage whose serial has been
    /// surpassed. Only queries fence status; never blocks.
    fn sweep(&self, inflight: &mut InFlight<B>) -> Result<(), DeviceError> {
        let _span = trace_span!("completion_sweep").entered();

        let mut recycled = Vec::new();
        let mut sweep_err = None;
        while let Some(batch) = inflight.commands.front() {
            match self.backend.fence_status(&batch.fence) {
                Ok(FenceStatus::Signaled) => {}
                Ok(FenceStatus::NotReady) => break,
                Err(err) => {
                    sweep_err = Some(err);
                    break;
                }
            }
            let batch = inflight
                .commands
                .pop_front()
                .expect("in-flight list emptied during sweep");
            trace!(serial = ?batch.serial, "batch completed");
            self.backend.on_completed_serial(batch.serial);
            self.backend.recycle_fence(batch.fence);
            self.backend.destroy_command_pool(batch.pool);
            recycled.push(batch.primary);
        }

        let last_completed = self.backend.last_completed_serial();
        while let Some(entry) = inflight.garbage.front() {
            if entry.serial > last_completed {
                break;
            }
            let entry = inflight
                .garbage
                .pop_front()
                .expect("garbage queue emptied during sweep");
            trace!(serial = ?entry.serial, count = entry.resources.len(), "destroying garbage");
            for resource in entry.resources {
                self.backend.destroy_garbage(resource);
            }
        }

        if !recycled.is_empty() {
            let mut primaries = self.primaries.lock();
            for primary in recycled {
                primaries.collect(&self.backend, primary)?;
            }
        }

        match sweep_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Shared reference to the fence of the newest in-flight batch.
    pub(crate) fn last_submitted_fence(&self) -> Option<SharedFence<B>> {
        self.inflight
            .lock()
            .commands
            .back()
            .map(|batch| batch.fence.clone())
    }

    /// Device-loss teardown: wait each fence out, then destroy every pinned
    /// resource without recycling anything.
    pub(crate) fn handle_device_lost(&self) {
        let _span = trace_span!("handle_device_lost").entered();
        let timeout = self.backend.fence_wait_timeout_ns();

        let mut inflight = self.inflight.lock();
        for batch in inflight.commands.drain(..) {
            // The fence must be observed before the pinned resources can be
            // freed.
            match self.backend.wait_fence(&batch.fence, timeout) {
                Ok(()) | Err(DeviceError::DeviceLost) => {}
                Err(err) => {
                    warn!(?err, serial = ?batch.serial, "unexpected fence state during device-loss teardown")
                }
            }
            self.backend.destroy_primary(batch.primary);
            self.backend.destroy_command_pool(batch.pool);
            // Fence dropped without recycling.
        }
        for entry in inflight.garbage.drain(..) {
            for resource in entry.resources {
                self.backend.destroy_garbage(resource);
            }
        }
    }

    /// Tears down the primary pool. In-flight state must already be drained.
    pub(crate) fn destroy(&self) {
        debug_assert!(
            {
                let inflight = self.inflight.lock();
                inflight.commands.is_empty() && inflight.garbage.is_empty()
            },
            "engine destroyed with work still in flight"
        );
        self.primaries.lock().destroy(&self.backend);
    }
}
