//! Vulkan implementation of the device seam, built on `ash`.
//!
//! The backend owns the logical device handle, one queue per priority class,
//! and a pool of recycled submit fences. All queue accesses happen on the
//! thread that executes tasks, so no queue mutex is needed; adding a second
//! queue user would require one.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ash::extensions::khr;
use ash::vk;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::backend::{
    CommandPoolKind, FenceStatus, GpuBackend, PresentInfo, PresentResult, QueuePriority,
    RectLayer, SharedFence, SubmitDescriptor,
};
use crate::error::DeviceError;
use crate::serial::Serial;

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> DeviceError {
        match result {
            vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
            vk::Result::TIMEOUT => DeviceError::Timeout,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                DeviceError::OutOfMemory
            }
            vk::Result::ERROR_SURFACE_LOST_KHR => DeviceError::SurfaceLost,
            other => DeviceError::Other(other.as_raw()),
        }
    }
}

/// One GPU queue per priority class. Classes may share a queue on devices
/// that expose only one.
#[derive(Copy, Clone)]
pub struct VulkanQueues {
    pub low: vk::Queue,
    pub medium: vk::Queue,
    pub high: vk::Queue,
}

impl VulkanQueues {
    /// All priority classes mapped to a single queue.
    pub fn single(queue: vk::Queue) -> VulkanQueues {
        VulkanQueues {
            low: queue,
            medium: queue,
            high: queue,
        }
    }

    fn get(&self, priority: QueuePriority) -> vk::Queue {
        match priority {
            QueuePriority::Low => self.low,
            QueuePriority::Medium => self.medium,
            QueuePriority::High => self.high,
        }
    }
}

/// A pooled submit fence. Dropping the last reference returns the raw fence
/// to the backend's free list; it is reset on the next acquire.
pub struct VulkanFence {
    raw: vk::Fence,
    recycler: Weak<Mutex<Vec<vk::Fence>>>,
}

impl VulkanFence {
    pub fn raw(&self) -> vk::Fence {
        self.raw
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.upgrade() {
            recycler.lock().push(self.raw);
        }
    }
}

/// A primary command buffer together with the pool it was allocated from.
pub struct VulkanPrimary {
    buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
}

impl VulkanPrimary {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

/// A recorded secondary command buffer, still owned by the pool of the
/// producer that recorded it.
pub struct VulkanSecondary {
    buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    has_commands: bool,
}

impl VulkanSecondary {
    pub fn new(buffer: vk::CommandBuffer, pool: vk::CommandPool) -> VulkanSecondary {
        VulkanSecondary {
            buffer,
            pool,
            has_commands: true,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

/// Render-pass scope a secondary executes under. The secondary must have been
/// recorded with `RENDER_PASS_CONTINUE`.
pub struct RenderPassScope {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
}

/// A Vulkan object scheduled for deferred destruction.
pub enum VulkanGarbage {
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    DeviceMemory(vk::DeviceMemory),
}

pub struct VulkanBackend {
    device: ash::Device,
    vk_khr_swapchain: khr::Swapchain,
    queues: VulkanQueues,
    queue_family_index: u32,
    free_fences: Arc<Mutex<Vec<vk::Fence>>>,
    last_completed: AtomicU64,
    fence_wait_timeout_ns: u64,
}

impl VulkanBackend {
    /// # Safety
    ///
    /// `device` must be a valid logical device, `queues` must belong to
    /// `queue_family_index` on that device, and the device must outlive the
    /// backend.
    pub unsafe fn new(
        device: ash::Device,
        vk_khr_swapchain: khr::Swapchain,
        queues: VulkanQueues,
        queue_family_index: u32,
        fence_wait_timeout_ns: u64,
    ) -> VulkanBackend {
        VulkanBackend {
            device,
            vk_khr_swapchain,
            queues,
            queue_family_index,
            free_fences: Arc::new(Mutex::new(Vec::new())),
            last_completed: AtomicU64::new(0),
            fence_wait_timeout_ns,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Destroys pooled fences. Call before destroying the device; fences
    /// still referenced by an observer are freed when the device goes away.
    ///
    /// # Safety
    ///
    /// No pooled fence may be in use by the device.
    pub unsafe fn destroy(&self) {
        for fence in self.free_fences.lock().drain(..) {
            self.device.destroy_fence(fence, None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    type Primary = VulkanPrimary;
    type Secondary = VulkanSecondary;
    type OneOffCommands = vk::CommandBuffer;
    type Pool = vk::CommandPool;
    type Fence = VulkanFence;
    type Semaphore = vk::Semaphore;
    type StageMask = vk::PipelineStageFlags;
    type Swapchain = vk::SwapchainKHR;
    type RenderPass = RenderPassScope;
    type Garbage = VulkanGarbage;

    const ALL_COMMANDS: vk::PipelineStageFlags = vk::PipelineStageFlags::ALL_COMMANDS;

    fn create_command_pool(&self, kind: CommandPoolKind) -> Result<vk::CommandPool, DeviceError> {
        let flags = match kind {
            CommandPoolKind::Persistent => vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            CommandPoolKind::Transient => vk::CommandPoolCreateFlags::TRANSIENT,
        };
        let create_info = vk::CommandPoolCreateInfo {
            flags,
            queue_family_index: self.queue_family_index,
            ..Default::default()
        };
        let pool = unsafe { self.device.create_command_pool(&create_info, None)? };
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if pool != vk::CommandPool::null() {
            unsafe { self.device.destroy_command_pool(pool, None) }
        }
    }

    fn allocate_primary(&self, pool: &vk::CommandPool) -> Result<VulkanPrimary, DeviceError> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: *pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        Ok(VulkanPrimary {
            buffer: buffers[0],
            pool: *pool,
        })
    }

    fn begin_primary(&self, primary: &mut VulkanPrimary) -> Result<(), DeviceError> {
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(primary.buffer, &begin_info)? };
        Ok(())
    }

    fn end_primary(&self, primary: &mut VulkanPrimary) -> Result<(), DeviceError> {
        unsafe { self.device.end_command_buffer(primary.buffer)? };
        Ok(())
    }

    fn reset_primary(&self, primary: &mut VulkanPrimary) -> Result<(), DeviceError> {
        unsafe {
            self.device
                .reset_command_buffer(primary.buffer, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_primary(&self, primary: VulkanPrimary) {
        unsafe {
            self.device
                .free_command_buffers(primary.pool, &[primary.buffer])
        }
    }

    fn flush_secondary(
        &self,
        commands: &mut VulkanSecondary,
        primary: &mut VulkanPrimary,
        render_pass: Option<&RenderPassScope>,
    ) -> Result<(), DeviceError> {
        unsafe {
            if let Some(scope) = render_pass {
                let begin_info = vk::RenderPassBeginInfo {
                    render_pass: scope.render_pass,
                    framebuffer: scope.framebuffer,
                    render_area: scope.render_area,
                    ..Default::default()
                };
                self.device.cmd_begin_render_pass(
                    primary.buffer,
                    &begin_info,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
                self.device
                    .cmd_execute_commands(primary.buffer, &[commands.buffer]);
                self.device.cmd_end_render_pass(primary.buffer);
            } else {
                self.device
                    .cmd_execute_commands(primary.buffer, &[commands.buffer]);
            }
        }
        commands.has_commands = false;
        Ok(())
    }

    fn recycle_secondary(&self, commands: VulkanSecondary) {
        unsafe {
            self.device
                .free_command_buffers(commands.pool, &[commands.buffer])
        }
    }

    fn secondary_is_empty(&self, commands: &VulkanSecondary) -> bool {
        !commands.has_commands
    }

    fn next_submit_fence(&self) -> Result<SharedFence<Self>, DeviceError> {
        let raw = match self.free_fences.lock().pop() {
            Some(fence) => fence,
            None => {
                let create_info = vk::FenceCreateInfo::default();
                unsafe { self.device.create_fence(&create_info, None)? }
            }
        };
        // Reset on acquire: a recycled fence may still carry its old signal.
        unsafe { self.device.reset_fences(&[raw])? };
        Ok(Arc::new(VulkanFence {
            raw,
            recycler: Arc::downgrade(&self.free_fences),
        }))
    }

    fn fence_status(&self, fence: &VulkanFence) -> Result<FenceStatus, DeviceError> {
        let signaled = unsafe { self.device.get_fence_status(fence.raw)? };
        Ok(if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotReady
        })
    }

    fn wait_fence(&self, fence: &VulkanFence, timeout_ns: u64) -> Result<(), DeviceError> {
        unsafe { self.device.wait_for_fences(&[fence.raw], true, timeout_ns)? };
        Ok(())
    }

    fn fence_wait_timeout_ns(&self) -> u64 {
        self.fence_wait_timeout_ns
    }

    fn queue_submit(
        &self,
        priority: QueuePriority,
        submit: SubmitDescriptor<'_, Self>,
        fence: Option<&VulkanFence>,
    ) -> Result<(), DeviceError> {
        debug_assert_eq!(submit.wait_semaphores.len(), submit.wait_stage_masks.len());

        let command_buffer = submit.commands.map(|primary| primary.buffer);
        let signal_semaphore = submit.signal_semaphore;
        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: submit.wait_semaphores.len() as u32,
            p_wait_semaphores: submit.wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: submit.wait_stage_masks.as_ptr(),
            command_buffer_count: command_buffer.is_some() as u32,
            p_command_buffers: command_buffer
                .as_ref()
                .map_or(ptr::null(), |buffer| buffer as *const _),
            signal_semaphore_count: signal_semaphore.is_some() as u32,
            p_signal_semaphores: signal_semaphore
                .as_ref()
                .map_or(ptr::null(), |semaphore| semaphore as *const _),
            ..Default::default()
        };
        let fence_handle = fence.map_or(vk::Fence::null(), |fence| fence.raw);
        let queue = self.queues.get(priority);
        unsafe { self.device.queue_submit(queue, &[submit_info], fence_handle)? };
        Ok(())
    }

    fn queue_submit_one_off(
        &self,
        priority: QueuePriority,
        commands: Option<&vk::CommandBuffer>,
        fence: Option<&VulkanFence>,
    ) -> Result<(), DeviceError> {
        let submit_info = vk::SubmitInfo {
            command_buffer_count: commands.is_some() as u32,
            p_command_buffers: commands.map_or(ptr::null(), |buffer| buffer as *const _),
            ..Default::default()
        };
        let fence_handle = fence.map_or(vk::Fence::null(), |fence| fence.raw);
        let queue = self.queues.get(priority);
        unsafe { self.device.queue_submit(queue, &[submit_info], fence_handle)? };
        Ok(())
    }

    fn queue_present(&self, priority: QueuePriority, present: &PresentInfo<Self>) -> PresentResult {
        let wait_semaphore = present.wait_semaphore;
        let swapchain = present.swapchain;
        let image_index = present.image_index;

        let rects: Vec<vk::RectLayerKHR> = present
            .regions
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|rect| vk::RectLayerKHR {
                offset: vk::Offset2D {
                    x: rect.x,
                    y: rect.y,
                },
                extent: vk::Extent2D {
                    width: rect.width,
                    height: rect.height,
                },
                layer: rect.layer,
            })
            .collect();
        let region = vk::PresentRegionKHR {
            rectangle_count: rects.len() as u32,
            p_rectangles: if rects.is_empty() {
                ptr::null()
            } else {
                rects.as_ptr()
            },
        };
        let regions_info = vk::PresentRegionsKHR {
            swapchain_count: 1,
            p_regions: &region,
            ..Default::default()
        };

        let mut present_info = vk::PresentInfoKHR {
            wait_semaphore_count: wait_semaphore.is_some() as u32,
            p_wait_semaphores: wait_semaphore
                .as_ref()
                .map_or(ptr::null(), |semaphore| semaphore as *const _),
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            p_results: ptr::null_mut(),
            ..Default::default()
        };
        if present.regions.is_some() {
            present_info.p_next = &regions_info as *const _ as *const c_void;
        }

        let queue = self.queues.get(priority);
        let result = unsafe { self.vk_khr_swapchain.queue_present(queue, &present_info) };
        match result {
            Ok(false) => PresentResult::Success,
            Ok(true) => PresentResult::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentResult::OutOfDate,
            Err(err) => PresentResult::Failure(err.into()),
        }
    }

    fn on_completed_serial(&self, serial: Serial) {
        self.last_completed.fetch_max(serial.raw(), Ordering::Release);
    }

    fn last_completed_serial(&self) -> Serial {
        Serial::from_raw(self.last_completed.load(Ordering::Acquire))
    }

    fn destroy_garbage(&self, garbage: VulkanGarbage) {
        unsafe {
            match garbage {
                VulkanGarbage::Semaphore(handle) => self.device.destroy_semaphore(handle, None),
                VulkanGarbage::Fence(handle) => self.device.destroy_fence(handle, None),
                VulkanGarbage::Buffer(handle) => self.device.destroy_buffer(handle, None),
                VulkanGarbage::Image(handle) => self.device.destroy_image(handle, None),
                VulkanGarbage::ImageView(handle) => self.device.destroy_image_view(handle, None),
                VulkanGarbage::Framebuffer(handle) => {
                    self.device.destroy_framebuffer(handle, None)
                }
                VulkanGarbage::Sampler(handle) => self.device.destroy_sampler(handle, None),
                VulkanGarbage::Pipeline(handle) => self.device.destroy_pipeline(handle, None),
                VulkanGarbage::DeviceMemory(handle) => self.device.free_memory(handle, None),
            }
        }
    }
}

impl PresentInfo<VulkanBackend> {
    /// Deep-copies a raw present descriptor, including any recognized
    /// extension-chain entries. Exactly one swapchain and at most one wait
    /// semaphore are supported; an unrecognized chain entry is a fatal
    /// internal error.
    ///
    /// # Safety
    ///
    /// `info` and everything reachable through its pointers must be valid.
    pub unsafe fn from_raw(info: &vk::PresentInfoKHR) -> PresentInfo<VulkanBackend> {
        assert_eq!(info.swapchain_count, 1, "presents cover exactly one swapchain");
        assert!(info.wait_semaphore_count <= 1);
        assert!(info.p_results.is_null());

        let swapchain = *info.p_swapchains;
        let image_index = *info.p_image_indices;
        let wait_semaphore = if info.wait_semaphore_count == 1 {
            Some(*info.p_wait_semaphores)
        } else {
            None
        };

        let mut regions = None;
        let mut next = info.p_next;
        while !next.is_null() {
            let s_type = *(next as *const vk::StructureType);
            match s_type {
                vk::StructureType::PRESENT_REGIONS_KHR => {
                    let chain = &*(next as *const vk::PresentRegionsKHR);
                    let mut rects = Vec::new();
                    if chain.swapchain_count > 0 && !chain.p_regions.is_null() {
                        let region = &*chain.p_regions;
                        for i in 0..region.rectangle_count as usize {
                            let rect = &*region.p_rectangles.add(i);
                            rects.push(RectLayer {
                                x: rect.offset.x,
                                y: rect.offset.y,
                                width: rect.extent.width,
                                height: rect.extent.height,
                                layer: rect.layer,
                            });
                        }
                    }
                    trace!(rects = rects.len(), "copied present regions");
                    regions = Some(rects);
                    next = chain.p_next;
                }
                other => {
                    error!(s_type = ?other, "unknown structure in present info chain");
                    unreachable!("unsupported present info extension");
                }
            }
        }

        PresentInfo {
            swapchain,
            image_index,
            wait_semaphore,
            regions,
        }
    }
}
