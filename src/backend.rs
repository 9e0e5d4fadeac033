//! The device seam.
//!
//! The submission engine never talks to a GPU API directly; everything goes
//! through [`GpuBackend`], whose associated types name the handles the engine
//! shuffles around (primary/secondary command buffers, pools, fences,
//! semaphores, swapchains, garbage). The production implementation lives in
//! [`crate::vulkan`]; the test suite drives the engine with an in-memory
//! backend.
//!
//! All queue-touching methods are only ever called from the thread that
//! executes tasks, so implementations need no queue lock of their own.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::DeviceError;
use crate::serial::Serial;

/// A fence shared between the in-flight batch that owns it and any observer
/// (for example [`crate::CommandProcessor::last_submitted_fence`]). The fence
/// lives as long as its longest holder.
pub type SharedFence<B> = Arc<<B as GpuBackend>::Fence>;

/// Host-visible fence state, queried without blocking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FenceStatus {
    Signaled,
    NotReady,
}

/// Which GPU queue a task targets. One queue per priority class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Medium,
    High,
}

/// How a command pool will be used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandPoolKind {
    /// Long-lived pool whose buffers are individually reset and reused.
    Persistent,
    /// Short-lived pool torn down wholesale once its submission completes.
    Transient,
}

/// Outcome of a present operation. `Suboptimal` and `OutOfDate` are
/// non-fatal: the swapchain wants recreating but the device is fine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PresentResult {
    Success,
    Suboptimal,
    OutOfDate,
    Failure(DeviceError),
}

impl PresentResult {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PresentResult::Failure(_))
    }
}

/// Everything one queue submission needs, assembled on the executing thread.
pub struct SubmitDescriptor<'a, B: GpuBackend> {
    pub commands: Option<&'a B::Primary>,
    pub wait_semaphores: &'a [B::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stage_masks: &'a [B::StageMask],
    pub signal_semaphore: Option<B::Semaphore>,
}

/// A damage rectangle within one swapchain layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RectLayer {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub layer: u32,
}

/// An owned present descriptor.
///
/// Deep-copied at task-construction time: the caller's storage is not
/// guaranteed to outlive the enqueue, so nothing in here borrows.
pub struct PresentInfo<B: GpuBackend> {
    pub swapchain: B::Swapchain,
    pub image_index: u32,
    pub wait_semaphore: Option<B::Semaphore>,
    /// Damage regions, if the presentation engine supports incremental
    /// present.
    pub regions: Option<Vec<RectLayer>>,
}

/// The device-side collaborator of the command processor.
///
/// Implementations hand out fences and command buffers, perform the actual
/// queue submits and presents, and keep the last-completed-serial ledger the
/// reclamation sweep reads.
pub trait GpuBackend: Send + Sync + Sized + 'static {
    /// A primary command buffer, recorded by the worker and submitted.
    type Primary: Send;
    /// A secondary command buffer recorded by a producer, flushed into the
    /// current primary.
    type Secondary: Send;
    /// A caller-owned command buffer for one-off submits. The caller retains
    /// ownership; the engine only submits it.
    type OneOffCommands: Send;
    type Pool: Send;
    type Fence: Send + Sync;
    type Semaphore: Copy + Send;
    type StageMask: Copy + Send;
    type Swapchain: Copy + Eq + Hash + fmt::Debug + Send;
    /// Render-pass scope under which a secondary is executed, if any.
    type RenderPass: Send;
    /// A resource scheduled for deferred destruction.
    type Garbage: Send;

    /// Stage mask used to pad wait-stage lists shorter than their semaphore
    /// lists.
    const ALL_COMMANDS: Self::StageMask;

    fn create_command_pool(&self, kind: CommandPoolKind) -> Result<Self::Pool, DeviceError>;
    fn destroy_command_pool(&self, pool: Self::Pool);
    fn allocate_primary(&self, pool: &Self::Pool) -> Result<Self::Primary, DeviceError>;
    fn begin_primary(&self, primary: &mut Self::Primary) -> Result<(), DeviceError>;
    fn end_primary(&self, primary: &mut Self::Primary) -> Result<(), DeviceError>;
    /// Resets a primary for reuse from its pool.
    fn reset_primary(&self, primary: &mut Self::Primary) -> Result<(), DeviceError>;
    fn destroy_primary(&self, primary: Self::Primary);

    /// Replays a recorded secondary into `primary`, inside `render_pass` if
    /// one is given. The secondary is drained by this call.
    fn flush_secondary(
        &self,
        commands: &mut Self::Secondary,
        primary: &mut Self::Primary,
        render_pass: Option<&Self::RenderPass>,
    ) -> Result<(), DeviceError>;
    /// Returns a drained secondary to its originating pool.
    fn recycle_secondary(&self, commands: Self::Secondary);
    fn secondary_is_empty(&self, commands: &Self::Secondary) -> bool;

    /// Acquires a fresh, unsignaled submit fence.
    fn next_submit_fence(&self) -> Result<SharedFence<Self>, DeviceError>;
    fn fence_status(&self, fence: &Self::Fence) -> Result<FenceStatus, DeviceError>;
    /// Blocks until the fence signals or `timeout_ns` elapses.
    fn wait_fence(&self, fence: &Self::Fence, timeout_ns: u64) -> Result<(), DeviceError>;
    /// Releases one reference to a submit fence. The fence returns to the
    /// backend's pool once the last holder lets go.
    fn recycle_fence(&self, fence: SharedFence<Self>) {
        drop(fence);
    }
    /// Upper bound for blocking fence waits, in nanoseconds.
    fn fence_wait_timeout_ns(&self) -> u64 {
        10_000_000_000
    }

    fn queue_submit(
        &self,
        priority: QueuePriority,
        submit: SubmitDescriptor<'_, Self>,
        fence: Option<&Self::Fence>,
    ) -> Result<(), DeviceError>;
    /// Submits a caller-owned command buffer with a caller-owned fence.
    fn queue_submit_one_off(
        &self,
        priority: QueuePriority,
        commands: Option<&Self::OneOffCommands>,
        fence: Option<&Self::Fence>,
    ) -> Result<(), DeviceError>;
    fn queue_present(&self, priority: QueuePriority, present: &PresentInfo<Self>) -> PresentResult;

    /// Called once per completed batch, in serial order.
    fn on_completed_serial(&self, serial: Serial);
    /// The highest serial reported through [`GpuBackend::on_completed_serial`].
    fn last_completed_serial(&self) -> Serial;
    fn destroy_garbage(&self, garbage: Self::Garbage);
    /// Non-blocking device-side cleanup hook, invoked right after every
    /// successful submit.
    fn cleanup_garbage(&self) {}
}
