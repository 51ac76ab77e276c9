// Vulkan logical device, queues, and timeline-based lifetime tracking
//
// This holds per-GPU state: the logical device, the queue used for both
// graphics/compute/RT work and transfers (a single queue family is
// sufficient for a headless compute/RT core - no presentation queue to
// juggle), and the timeline semaphore + deletion queue discipline the
// teacher uses to retire GPU-owned resources without blocking.
//
// Austin Shafer - 2024
use ash::vk;

extern crate utils as cat5_utils;
use crate::error::{CoreError, Result};
use crate::features::VkDeviceFeatures;
use crate::instance::Instance;
use crate::{DeletionQueue, Droppable};
use cat5_utils::log;

use std::sync::{Arc, RwLock};

/// GPU Device
///
/// Owns the logical device and everything externally synchronized
/// against its single queue.
pub struct Device {
    pub(crate) dev: ash::Device,
    pub(crate) dev_features: VkDeviceFeatures,
    pub(crate) pdev: vk::PhysicalDevice,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
    pub queue_family: u32,
    pub timestamp_period: f32,
    pub(crate) internal: Arc<RwLock<DeviceInternal>>,
}

/// Externally-synchronized, mutable per-device state.
pub struct DeviceInternal {
    pub(crate) queue: vk::Queue,
    /// The latest submitted timeline point on the graphics/RT-frame
    /// timeline. Frame submission bumps this and signals it on completion.
    pub(crate) timeline_point: u64,
    pub(crate) timeline_sema: vk::Semaphore,
    /// A second, independent timeline for staging/transfer uploads
    /// (`StagingArena` flushes, image/BLAS uploads), so a long-running
    /// frame submission never has to wait behind an unrelated copy and
    /// vice versa. Both timelines share the single queue family - this
    /// is headless compute/RT work, not a separate transfer queue - but
    /// keeping their points distinct lets callers wait on exactly the
    /// kind of work they care about.
    pub(crate) transfer_timeline_point: u64,
    pub(crate) transfer_timeline_sema: vk::Semaphore,
    /// Items dropped once their scheduled timeline point has passed.
    pub(crate) deletion_queue: DeletionQueue,
}

impl Device {
    fn select_queue_family(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Result<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .find_map(|(index, info)| {
                info.queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                    .then_some(index as u32)
            })
            .ok_or(CoreError::NoSuitablePhysicalDevice)
    }

    fn create_device(
        dev_features: &VkDeviceFeatures,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = dev_features.get_device_extensions();

        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_int64(true)
            .vertex_pipeline_stores_and_atomics(true)
            .fragment_stores_and_atomics(true)
            .build();

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .build();

        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::builder().synchronization2(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .push_next(&mut vulkan12_features)
            .push_next(&mut sync2_features)
            .push_next(&mut accel_features);

        unsafe {
            inst.create_device(pdev, &create_info, None)
                .map_err(CoreError::from)
        }
    }

    /// Create the logical device for the physical device selected by
    /// `crate::features::select_pdev`.
    pub fn new(instance: &Arc<Instance>, pdev: vk::PhysicalDevice) -> Result<Self> {
        let queue_family = Self::select_queue_family(&instance.inst, pdev)?;
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let props = unsafe { instance.inst.get_physical_device_properties(pdev) };

        let dev_features = VkDeviceFeatures::new(&instance.inst, pdev)?;
        let dev = Self::create_device(&dev_features, &instance.inst, pdev, queue_family)?;

        let queue = unsafe { dev.get_device_queue(queue_family, 0) };

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let sema_create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        let timeline_sema = unsafe { dev.create_semaphore(&sema_create_info, None)? };

        let mut transfer_timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let transfer_sema_create_info =
            vk::SemaphoreCreateInfo::builder().push_next(&mut transfer_timeline_info);
        let transfer_timeline_sema =
            unsafe { dev.create_semaphore(&transfer_sema_create_info, None)? };

        Ok(Self {
            dev,
            dev_features,
            pdev,
            mem_props,
            queue_family,
            timestamp_period: props.limits.timestamp_period,
            internal: Arc::new(RwLock::new(DeviceInternal {
                queue,
                timeline_point: 0,
                timeline_sema,
                transfer_timeline_point: 0,
                transfer_timeline_sema,
                deletion_queue: DeletionQueue::new(),
            })),
        })
    }

    pub fn handle(&self) -> &ash::Device {
        &self.dev
    }

    pub fn supports_calibrated_timestamps(&self) -> bool {
        self.dev_features.supports_calibrated_timestamps
    }

    pub fn queue(&self) -> vk::Queue {
        self.internal.read().unwrap().queue
    }

    /// Submit `cmdbuf`, bumping and signaling the device timeline.
    /// Returns the timeline point this submission will signal.
    pub fn submit_timeline(&self, cmdbuf: vk::CommandBuffer) -> Result<u64> {
        let mut internal = self.internal.write().unwrap();
        internal.timeline_point += 1;
        let signal_value = internal.timeline_point;

        let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(std::slice::from_ref(&signal_value));
        let cmdbufs = [cmdbuf];
        let signal_semas = [internal.timeline_sema];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&cmdbufs)
            .signal_semaphores(&signal_semas)
            .push_next(&mut timeline_submit)
            .build();

        unsafe {
            self.dev
                .queue_submit(internal.queue, &[submit_info], vk::Fence::null())?;
        }
        Ok(signal_value)
    }

    /// Block until `point` has signaled on the device timeline.
    pub fn wait_timeline(&self, point: u64) -> Result<()> {
        if point == 0 {
            return Ok(());
        }
        let sema = self.internal.read().unwrap().timeline_sema;
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&sema))
            .values(std::slice::from_ref(&point));
        unsafe { self.dev.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }

    pub fn latest_timeline_point(&self) -> u64 {
        self.internal.read().unwrap().timeline_point
    }

    /// Submit `cmdbuf` on the transfer timeline (staging flushes, image
    /// and BLAS/TLAS uploads). Returns the timeline point this submission
    /// will signal.
    pub fn submit_transfer_timeline(&self, cmdbuf: vk::CommandBuffer) -> Result<u64> {
        let mut internal = self.internal.write().unwrap();
        internal.transfer_timeline_point += 1;
        let signal_value = internal.transfer_timeline_point;

        let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(std::slice::from_ref(&signal_value));
        let cmdbufs = [cmdbuf];
        let signal_semas = [internal.transfer_timeline_sema];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&cmdbufs)
            .signal_semaphores(&signal_semas)
            .push_next(&mut timeline_submit)
            .build();

        unsafe {
            self.dev
                .queue_submit(internal.queue, &[submit_info], vk::Fence::null())?;
        }
        Ok(signal_value)
    }

    /// Block until `point` has signaled on the transfer timeline.
    pub fn wait_transfer_timeline(&self, point: u64) -> Result<()> {
        if point == 0 {
            return Ok(());
        }
        let sema = self.internal.read().unwrap().transfer_timeline_sema;
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&sema))
            .values(std::slice::from_ref(&point));
        unsafe { self.dev.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }

    pub fn latest_transfer_timeline_point(&self) -> u64 {
        self.internal.read().unwrap().transfer_timeline_point
    }

    /// Schedule `item` to be dropped once `sync_point` has signaled.
    pub fn schedule_drop_at_point(&self, item: Box<dyn Droppable + Send + Sync>, sync_point: u64) {
        self.internal
            .write()
            .unwrap()
            .deletion_queue
            .schedule_drop_at_point(item, sync_point);
    }

    /// Drain everything in the deletion queue whose timeline point has
    /// already passed (one less than the latest submitted point, mirroring
    /// the teacher's `flush_deletion_queue`: the previous point must
    /// already have completed by the time we submit the next one).
    pub fn flush_deletion_queue(&self) {
        let mut internal = self.internal.write().unwrap();
        let point = internal.timeline_point.saturating_sub(1);
        if point == 0 {
            return;
        }
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&internal.timeline_sema))
            .values(std::slice::from_ref(&point));
        unsafe {
            if let Err(e) = self.dev.wait_semaphores(&wait_info, u64::MAX) {
                log::error!(
                    "device: failed waiting on deletion queue timeline point: {:?}",
                    e
                );
                return;
            }
        }
        internal.deletion_queue.drop_all_at_point(point);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().ok();
            let internal = self.internal.read().unwrap();
            self.dev.destroy_semaphore(internal.timeline_sema, None);
            self.dev
                .destroy_semaphore(internal.transfer_timeline_sema, None);
            drop(internal);
            self.dev.destroy_device(None);
        }
    }
}
