// GPU context: wires every subsystem into the one object a host actually
// holds on to
//
// Mirrors `thundr::Renderer` in spirit - a single struct owning Instance,
// Device and every subsystem built on top of it, constructed in the order
// each one depends on the last. Unlike `Renderer` there is no swapchain,
// no descriptor-set pool, no display loop: a host drives frames by calling
// `begin_frame`/`submit_frame` and reads results back through
// `resources`/`accel`/`geometry` directly.
//
// Austin Shafer - 2024
use ash::vk;
use std::sync::Arc;

use crate::accel::AccelBuilder;
use crate::combuf::{Combuf, CombufPool};
use crate::config::DebugConfig;
use crate::device::Device;
use crate::error::Result;
use crate::features::{self, VkDeviceFeatures};
use crate::geometry::GeometryBuffer;
use crate::instance::{Instance, InstanceCreateInfo};
use crate::resources::ResourceGraph;
use crate::staging::StagingArena;

/// Sizing knobs for the buffers `GpuContext::new` allocates. There is no
/// sensible one-size-fits-all default for a ray tracer's working set, so
/// every field is mandatory rather than wrapped in `Default`.
pub struct GpuContextCreateInfo {
    pub instance_info: InstanceCreateInfo,
    pub staging_size: u32,
    pub static_geometry_size: u32,
    pub dynamic_geometry_size: u32,
    pub accels_buffer_size: u32,
    pub scratch_buffer_size: u32,
}

fn query_scratch_alignment(instance: &ash::Instance, pdev: vk::PhysicalDevice) -> u32 {
    let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut accel_props);
    unsafe { instance.get_physical_device_properties2(pdev, &mut props2) };
    accel_props.min_acceleration_structure_scratch_offset_alignment
}

/// Owns every GPU subsystem this crate implements, in construction order:
/// `Instance`, `Device`, `StagingArena`, `CombufPool`, `GeometryBuffer`,
/// `AccelBuilder`, `ResourceGraph`.
pub struct GpuContext {
    pub instance: Arc<Instance>,
    pub device: Device,
    pub staging: StagingArena,
    pub combuf_pool: CombufPool,
    pub geometry: GeometryBuffer,
    pub accel: AccelBuilder,
    pub resources: ResourceGraph,
    pub debug: DebugConfig,
    /// Set by `reload_pipelines()`, consumed by the host at the next
    /// frame boundary. Mirrors the source's `rt_debug_reload_pipelines`
    /// CVar callback setting a flag `reloadMainpipe` picks up.
    reload_pending: bool,
}

impl GpuContext {
    pub fn new(info: &GpuContextCreateInfo) -> Result<Self> {
        let instance = Arc::new(Instance::new(&info.instance_info)?);
        let pdev = features::select_pdev(&instance)?;
        let device = Device::new(&instance, pdev)?;

        let mut combuf_pool = CombufPool::new(
            &instance.inst,
            device.handle(),
            device.queue_family,
            device.timestamp_period,
            device.supports_calibrated_timestamps(),
        )?;

        let staging = StagingArena::new(device.handle(), &device.mem_props, info.staging_size)?;

        let geometry = GeometryBuffer::new(
            device.handle(),
            &device.mem_props,
            info.static_geometry_size,
            info.dynamic_geometry_size,
            true,
        )?;

        let scratch_alignment = query_scratch_alignment(&instance.inst, pdev);
        let accel = AccelBuilder::new(
            &instance.inst,
            device.handle(),
            &device.mem_props,
            &mut combuf_pool,
            info.accels_buffer_size,
            info.scratch_buffer_size,
            scratch_alignment,
        )?;

        let resources = ResourceGraph::new();

        Ok(Self {
            instance,
            device,
            staging,
            combuf_pool,
            geometry,
            accel,
            resources,
            debug: DebugConfig::default(),
            reload_pending: false,
        })
    }

    /// Start a frame: open a fresh command buffer, retire the previous
    /// frame's flipping allocations, and reset the per-frame scratch
    /// cursor.
    pub fn begin_frame(&mut self) -> Result<Combuf> {
        self.device.flush_deletion_queue();
        self.staging.flip();
        self.geometry.flip();
        self.accel.begin_frame();
        self.combuf_pool.open(self.device.handle())
    }

    /// End recording and submit on the graphics-frame timeline. Returns
    /// the timeline point this frame's GPU work will signal.
    pub fn submit_frame(&mut self, combuf: Combuf) -> Result<u64> {
        self.combuf_pool.end(&combuf, self.device.handle())?;
        let point = self.device.submit_timeline(combuf.cmdbuf)?;
        self.combuf_pool.close(combuf);
        Ok(point)
    }

    /// Equivalent to the `rt_debug_reload_pipelines` console command:
    /// marks a pipeline reload as due at the next frame boundary. This
    /// core doesn't build pipeline objects itself (out of scope per
    /// `spec.md` §14), so this only flips the flag a host's pipeline
    /// loader polls.
    pub fn reload_pipelines(&mut self) {
        self.reload_pending = true;
    }

    /// Consume the pending reload flag, if any.
    pub fn take_reload_pending(&mut self) -> bool {
        std::mem::replace(&mut self.reload_pending, false)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().device_wait_idle().ok();
            self.resources.destroy_all(self.device.handle());
            self.accel.destroy(self.device.handle());
            self.geometry.destroy(self.device.handle());
            self.staging.destroy(self.device.handle());
            self.combuf_pool.destroy(self.device.handle());
        }
    }
}
