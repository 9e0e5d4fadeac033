//! GPU command submission engine.
//!
//! A single-consumer task queue serializes command-buffer recording, queue
//! submission, presentation and fence-based resource reclamation onto one
//! worker. Producers enqueue typed [`Task`]s through the
//! [`CommandProcessor`]; in-flight submissions are tracked per serial and
//! reclaimed once their fence signals, with producer-side throttling past
//! [`IN_FLIGHT_LIMIT`] outstanding submissions.

mod backend;
mod error;
mod processor;
mod resource;
mod serial;
mod swapchain;
mod task;
pub mod vulkan;

pub use crate::backend::{
    CommandPoolKind, FenceStatus, GpuBackend, PresentInfo, PresentResult, QueuePriority,
    RectLayer, SharedFence, SubmitDescriptor,
};
pub use crate::error::{DeviceError, ErrorReport};
pub use crate::processor::{CommandProcessor, ProcessingMode, IN_FLIGHT_LIMIT};
pub use crate::resource::{ResourceUse, ResourceUseList};
pub use crate::serial::{Serial, SerialFactory};
pub use crate::task::{FlushSubmitTask, OneOffSubmitTask, Task};
pub use ash::vk;
