//! Typed tasks consumed by the worker.

use crate::backend::{GpuBackend, PresentInfo, QueuePriority, SharedFence};
use crate::resource::ResourceUseList;
use crate::serial::Serial;

/// Payload of a flush-and-submit task.
///
/// `serial` is assigned when the task is enqueued, under the same lock that
/// orders the task queue; producers leave it at [`Serial::ZERO`].
pub struct FlushSubmitTask<B: GpuBackend> {
    pub(crate) serial: Serial,
    pub priority: QueuePriority,
    pub wait_semaphores: Vec<B::Semaphore>,
    pub wait_stage_masks: Vec<B::StageMask>,
    pub signal_semaphore: Option<B::Semaphore>,
    /// Resources that become destroyable once this submission completes.
    pub garbage: Vec<B::Garbage>,
    pub resource_uses: ResourceUseList,
}

/// Payload of a one-off submit: a caller-owned command buffer and fence, no
/// batch bookkeeping.
pub struct OneOffSubmitTask<B: GpuBackend> {
    pub(crate) serial: Serial,
    pub priority: QueuePriority,
    pub commands: Option<B::OneOffCommands>,
    pub fence: Option<SharedFence<B>>,
    pub resource_uses: ResourceUseList,
}

/// One unit of work for the command worker.
pub enum Task<B: GpuBackend> {
    /// Flush a recorded secondary buffer into the current primary and return
    /// it to its pool.
    ProcessCommands {
        commands: B::Secondary,
        render_pass: Option<B::RenderPass>,
    },
    /// End the current primary, submit it, and start a fresh one.
    FlushAndSubmit(FlushSubmitTask<B>),
    OneOffSubmit(OneOffSubmitTask<B>),
    Present {
        priority: QueuePriority,
        info: PresentInfo<B>,
    },
    /// Block until the batch carrying this serial (or the last batch, if the
    /// serial is past the end) has completed, then sweep.
    FinishToSerial(Serial),
    /// Non-blocking completion sweep.
    CheckCompleted,
    /// Terminal task: drain everything, tear down recording state, stop.
    Exit,
}

impl<B: GpuBackend> Task<B> {
    pub fn process_commands(commands: B::Secondary, render_pass: Option<B::RenderPass>) -> Task<B> {
        Task::ProcessCommands {
            commands,
            render_pass,
        }
    }

    pub fn flush_and_submit(
        priority: QueuePriority,
        wait_semaphores: Vec<B::Semaphore>,
        wait_stage_masks: Vec<B::StageMask>,
        signal_semaphore: Option<B::Semaphore>,
        garbage: Vec<B::Garbage>,
        resource_uses: ResourceUseList,
    ) -> Task<B> {
        Task::FlushAndSubmit(FlushSubmitTask {
            serial: Serial::ZERO,
            priority,
            wait_semaphores,
            wait_stage_masks,
            signal_semaphore,
            garbage,
            resource_uses,
        })
    }

    pub fn one_off_submit(
        priority: QueuePriority,
        commands: Option<B::OneOffCommands>,
        fence: Option<SharedFence<B>>,
    ) -> Task<B> {
        Task::OneOffSubmit(OneOffSubmitTask {
            serial: Serial::ZERO,
            priority,
            commands,
            fence,
            resource_uses: ResourceUseList::new(),
        })
    }

    pub fn present(priority: QueuePriority, info: PresentInfo<B>) -> Task<B> {
        Task::Present { priority, info }
    }

    pub fn finish_to_serial(serial: Serial) -> Task<B> {
        Task::FinishToSerial(serial)
    }

    pub fn check_completed() -> Task<B> {
        Task::CheckCompleted
    }

    pub fn exit() -> Task<B> {
        Task::Exit
    }

    /// Whether enqueueing this task hands out a submission serial.
    pub(crate) fn is_submission(&self) -> bool {
        matches!(self, Task::FlushAndSubmit(_) | Task::OneOffSubmit(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Task::ProcessCommands { .. } => "process_commands",
            Task::FlushAndSubmit(_) => "flush_and_submit",
            Task::OneOffSubmit(_) => "one_off_submit",
            Task::Present { .. } => "present",
            Task::FinishToSerial(_) => "finish_to_serial",
            Task::CheckCompleted => "check_completed",
            Task::Exit => "exit",
        }
    }
}
