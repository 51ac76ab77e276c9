// Bottom/top level acceleration structure lifecycle
//
// A `Blas` owns its own geometry/build-range arrays and remembers
// whether it was built with `ALLOW_UPDATE`, so `AccelBuilder::update_blas`
// can pick an update-in-place vs. rebuild-from-scratch path per the
// BLAS's declared usage. Builds don't happen eagerly: `update_blas` and
// `queue_build` enqueue the BLAS and `AccelBuilder::build_pending`
// flushes the queue once per frame so every pending build shares one
// barrier against the geometry buffer.
//
// Austin Shafer - 2024
use ash::extensions::khr::AccelerationStructure as AccelExt;
use ash::vk;

use crate::alloc::{Range, RangeAllocator};
use crate::buffer::{Buffer, FlippingBuffer};
use crate::combuf::{BarrierBatch, BufferBarrierDecl, Combuf, CombufPool};
use crate::error::{CoreError, Result};
use crate::geometry::{GeometryBuffer, VERTEX_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlasUsage {
    /// Built once, never updated.
    Static,
    /// Rebuilt in place via `VK_BUILD_ACCELERATION_STRUCTURE_MODE_UPDATE_KHR`
    /// once the first build has happened.
    DynamicUpdate,
    /// Rebuilt from scratch every time, optimized for build speed
    /// rather than trace quality.
    DynamicFast,
}

pub struct BlasGeometryInput {
    pub vertex_device_offset: u32,
    pub max_vertex: u32,
    pub index_offset: u32,
    pub element_count: u32,
}

pub struct Blas {
    accel: vk::AccelerationStructureKHR,
    usage: BlasUsage,
    info: vk::AccelerationStructureBuildGeometryInfoKHR,
    geoms: Vec<vk::AccelerationStructureGeometryKHR>,
    max_prim_counts: Vec<u32>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    sizes: vk::AccelerationStructureBuildSizesInfoKHR,
    accel_range: Range,
    max_geoms: u32,
    built: bool,
}

impl Blas {
    pub fn device_address(&self, ext: &AccelExt) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(self.accel);
        unsafe { ext.get_acceleration_structure_device_address(&info) }
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.accel
    }
}

fn fill_geometries(
    geoms: &mut [vk::AccelerationStructureGeometryKHR],
    max_prim_counts: &mut [u32],
    ranges: &mut [vk::AccelerationStructureBuildRangeInfoKHR],
    inputs: &[BlasGeometryInput],
) {
    for (i, g) in inputs.iter().enumerate() {
        let prim_count = g.element_count / 3;
        max_prim_counts[i] = prim_count;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .index_type(vk::IndexType::UINT16)
            .max_vertex(g.max_vertex)
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_stride(VERTEX_SIZE as u64)
            .build();

        geoms[i] = vk::AccelerationStructureGeometryKHR::builder()
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .build();

        ranges[i] = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: prim_count,
            primitive_offset: g.index_offset * std::mem::size_of::<u16>() as u32,
            first_vertex: g.vertex_device_offset,
            transform_offset: 0,
        };
    }
}

/// Owns the shared accel-structure storage buffer, the per-frame
/// scratch buffer used to build into, and the flipping buffer holding
/// TLAS instance data.
pub struct AccelBuilder {
    ext: AccelExt,
    accels_buffer: Buffer,
    accels_alloc: RangeAllocator,
    accels_buffer_addr: vk::DeviceAddress,
    scratch_buffer: Buffer,
    scratch_buffer_addr: vk::DeviceAddress,
    scratch_offset: u32,
    scratch_alignment: u32,
    tlas_geom_buffer: Buffer,
    tlas_geom_buffer_addr: vk::DeviceAddress,
    tlas_geom_alloc: FlippingBuffer,
    tlas: Option<vk::AccelerationStructureKHR>,
    pending_builds: Vec<*mut Blas>,
    scope_id: i32,
}

const MAX_INSTANCES: u32 = 4096;

impl AccelBuilder {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        pool: &mut CombufPool,
        accels_buffer_size: u32,
        scratch_buffer_size: u32,
        min_scratch_offset_alignment: u32,
    ) -> Result<Self> {
        let ext = AccelExt::new(instance, device);
        let as_usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let accels_buffer = Buffer::create(
            device,
            mem_props,
            as_usage,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            accels_buffer_size as u64,
            None,
        )?;
        let accels_buffer_addr = accels_buffer.device_address(device);

        let scratch_usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let scratch_buffer = Buffer::create(
            device,
            mem_props,
            scratch_usage,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            scratch_buffer_size as u64,
            None,
        )?;
        let scratch_buffer_addr = scratch_buffer.device_address(device);

        let tlas_geom_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u32;
        let tlas_geom_buffer = Buffer::create(
            device,
            mem_props,
            tlas_geom_usage,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            (instance_size * MAX_INSTANCES) as u64,
            None,
        )?;
        let tlas_geom_buffer_addr = tlas_geom_buffer.device_address(device);

        Ok(Self {
            ext,
            accels_buffer,
            accels_alloc: RangeAllocator::new(accels_buffer_size, 256, 256),
            accels_buffer_addr,
            scratch_buffer,
            scratch_buffer_addr,
            scratch_offset: 0,
            scratch_alignment: min_scratch_offset_alignment.max(1),
            tlas_geom_buffer,
            tlas_geom_buffer_addr,
            tlas_geom_alloc: FlippingBuffer::new(instance_size * MAX_INSTANCES),
            tlas: None,
            pending_builds: Vec::new(),
            scope_id: pool.register_scope("build_as"),
        })
    }

    fn build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_prim_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        unsafe {
            self.ext.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                max_prim_counts,
            )
        }
    }

    fn create_accel(
        &mut self,
        device: &ash::Device,
        accel_type: vk::AccelerationStructureTypeKHR,
        size: u32,
    ) -> Result<(vk::AccelerationStructureKHR, Range)> {
        let range = self.accels_alloc.allocate(size, 256);
        if range.failed() {
            return Err(CoreError::PoolExhausted { requested: size });
        }

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(self.accels_buffer.buffer)
            .offset(range.offset as u64)
            .ty(accel_type)
            .size(size as u64);
        let accel = match unsafe { self.ext.create_acceleration_structure(&create_info, None) } {
            Ok(a) => a,
            Err(e) => {
                self.accels_alloc.free(range);
                return Err(e.into());
            }
        };
        let _ = device;
        Ok((accel, range))
    }

    /// Build a BLAS for the first time. The returned `Blas` is not
    /// queued for building - callers must move it into its final
    /// resting place (a `Box`, a slot in a `Vec`) and then call
    /// `queue_build` on that stable address, the same convention
    /// `ImageUploadQueue` uses for `Image`.
    pub fn create_blas(&mut self, device: &ash::Device, usage: BlasUsage, inputs: &[BlasGeometryInput]) -> Result<Blas> {
        let n = inputs.len();
        let mut geoms = vec![vk::AccelerationStructureGeometryKHR::default(); n];
        let mut max_prim_counts = vec![0u32; n];
        let mut ranges = vec![vk::AccelerationStructureBuildRangeInfoKHR::default(); n];
        fill_geometries(&mut geoms, &mut max_prim_counts, &mut ranges, inputs);

        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        match usage {
            BlasUsage::Static => {}
            BlasUsage::DynamicUpdate => flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            BlasUsage::DynamicFast => flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
        }

        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(flags)
            .geometries(&geoms)
            .build();

        let sizes = self.build_sizes(&info, &max_prim_counts);
        let (accel, accel_range) =
            self.create_accel(device, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, sizes.acceleration_structure_size as u32)?;

        info.dst_acceleration_structure = accel;
        let max_geoms = n as u32;

        Ok(Blas {
            accel,
            usage,
            info,
            geoms,
            max_prim_counts,
            ranges,
            sizes,
            accel_range,
            max_geoms,
            built: false,
        })
    }

    /// Queue `blas` for the next `build_pending`. `blas` must already
    /// live at its final, stable address.
    pub fn queue_build(&mut self, blas: &mut Blas) {
        self.pending_builds.push(blas as *mut Blas);
    }

    /// Rebuild or update-in-place `blas`'s geometry. Queues it for the
    /// next `build_pending`.
    pub fn update_blas(&mut self, blas: &mut Blas, inputs: &[BlasGeometryInput]) -> Result<()> {
        match blas.usage {
            BlasUsage::Static => return Err(CoreError::StaticBlasUpdate),
            BlasUsage::DynamicUpdate => {
                debug_assert_eq!(inputs.len() as u32, blas.max_geoms);
                if blas.built {
                    blas.info.mode = vk::BuildAccelerationStructureModeKHR::UPDATE;
                    blas.info.src_acceleration_structure = blas.accel;
                }
            }
            BlasUsage::DynamicFast => {}
        }

        fill_geometries(&mut blas.geoms, &mut blas.max_prim_counts, &mut blas.ranges, inputs);
        blas.info.geometry_count = blas.geoms.len() as u32;
        blas.info.p_geometries = blas.geoms.as_ptr();

        let sizes = self.build_sizes(&blas.info, &blas.max_prim_counts);
        if sizes.acceleration_structure_size > blas.sizes.acceleration_structure_size {
            return Err(CoreError::BlasGrewOnUpdate);
        }

        self.queue_build(blas);
        Ok(())
    }

    pub fn destroy_blas(&mut self, device: &ash::Device, mut blas: Blas) {
        unsafe { self.ext.destroy_acceleration_structure(blas.accel, None) };
        self.accels_alloc.free(blas.accel_range);
        blas.accel = vk::AccelerationStructureKHR::null();
        let _ = device;
    }

    /// Reset the per-frame scratch cursor. Call once per frame before
    /// any builds.
    pub fn begin_frame(&mut self) {
        self.scratch_offset = 0;
    }

    fn reserve_scratch(&mut self, size: u32) -> Result<vk::DeviceAddress> {
        if self.scratch_offset + size > self.scratch_buffer.size as u32 {
            return Err(CoreError::ScratchExhausted);
        }
        let addr = self.scratch_buffer_addr + self.scratch_offset as u64;
        self.scratch_offset += size;
        self.scratch_offset = align_up(self.scratch_offset, self.scratch_alignment);
        Ok(addr)
    }

    /// Flush every BLAS queued by `create_blas`/`update_blas` into one
    /// barrier against the geometry buffer followed by one
    /// `vkCmdBuildAccelerationStructuresKHR` call per BLAS (the
    /// hardware doesn't let heterogeneous BLAS builds batch into a
    /// single call the way same-type TLAS builds could).
    pub fn build_pending(
        &mut self,
        device: &ash::Device,
        pool: &mut CombufPool,
        combuf: &Combuf,
        geometry: &mut GeometryBuffer,
    ) {
        if self.pending_builds.is_empty() {
            return;
        }

        let geometry_buffer_handle = geometry.buffer.buffer;
        geometry.buffer.staging_commit(pool, device, combuf, geometry_buffer_handle);
        let mut decls = [BufferBarrierDecl {
            buffer: geometry.buffer.buffer,
            sync: &mut geometry.buffer.sync,
            stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        }];
        pool.issue_barrier(
            combuf,
            &mut BarrierBatch {
                stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                buffers: &mut decls,
            },
        );

        let geometry_addr = geometry.buffer.device_address(device);

        for blas_ptr in self.pending_builds.drain(..) {
            let blas = unsafe { &mut *blas_ptr };
            for g in blas.geoms.iter_mut() {
                unsafe {
                    g.geometry.triangles.vertex_data.device_address = geometry_addr;
                    g.geometry.triangles.index_data.device_address = geometry_addr;
                }
            }

            let is_update = blas.info.mode == vk::BuildAccelerationStructureModeKHR::UPDATE;
            let scratch_size = if is_update {
                blas.sizes.update_scratch_size
            } else {
                blas.sizes.build_scratch_size
            } as u32;

            let scratch_addr = match self.reserve_scratch(scratch_size) {
                Ok(a) => a,
                Err(_) => continue,
            };
            unsafe {
                blas.info.scratch_data.device_address = scratch_addr;
            }

            let scope_begin = pool.scope_begin(combuf, self.scope_id);
            let ranges: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> = vec![&blas.ranges[..]];
            unsafe {
                self.ext
                    .cmd_build_acceleration_structures(combuf.cmdbuf, &[blas.info], &ranges);
            }
            pool.scope_end(combuf, scope_begin, vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR);
            blas.built = true;
        }
    }

    /// Rebuild the single TLAS from `instances`, double-buffered
    /// through the flipping instance buffer so the previous frame's
    /// TLAS build (which may still be in flight) isn't clobbered.
    pub fn build_tlas(
        &mut self,
        device: &ash::Device,
        pool: &mut CombufPool,
        combuf: &Combuf,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<()> {
        debug_assert!(!instances.is_empty());
        self.tlas_geom_alloc.flip();

        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u32;
        let offset = self.tlas_geom_alloc.alloc(instance_size * instances.len() as u32, instance_size);
        if offset == crate::alloc::ring::ALLOC_FAILED {
            return Err(CoreError::ScratchExhausted);
        }

        if let Some(mapped) = self.tlas_geom_buffer.mapped_ptr() {
            unsafe {
                let dst = (mapped.add(offset as usize)) as *mut vk::AccelerationStructureInstanceKHR;
                std::ptr::copy_nonoverlapping(instances.as_ptr(), dst, instances.len());
            }
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.tlas_geom_buffer_addr + offset as u64,
            })
            .build();
        let geom = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data })
            .build();
        let geoms = [geom];
        let max_prim_counts = [MAX_INSTANCES];

        let should_create = self.tlas.is_none();
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .geometries(&geoms)
            .build();
        let sizes = self.build_sizes(&info, &max_prim_counts);

        if should_create {
            let (accel, _range) =
                self.create_accel(device, vk::AccelerationStructureTypeKHR::TOP_LEVEL, sizes.acceleration_structure_size as u32)?;
            self.tlas = Some(accel);
        }
        info.dst_acceleration_structure = self.tlas.unwrap();

        let scratch_addr = self.reserve_scratch(sizes.build_scratch_size as u32)?;
        unsafe {
            info.scratch_data.device_address = scratch_addr;
        }

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instances.len() as u32,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        let ranges: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> = vec![std::slice::from_ref(&build_range)];

        let scope_begin = pool.scope_begin(combuf, self.scope_id);
        unsafe {
            self.ext.cmd_build_acceleration_structures(combuf.cmdbuf, &[info], &ranges);
        }
        pool.scope_end(combuf, scope_begin, vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR);

        Ok(())
    }

    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas
    }

    /// # Safety
    /// The GPU must be done with every BLAS/TLAS and the buffers backing
    /// them (caller's job via the deletion queue / device idle wait).
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if let Some(tlas) = self.tlas.take() {
            self.ext.destroy_acceleration_structure(tlas, None);
        }
        self.accels_buffer.destroy(device);
        self.scratch_buffer.destroy(device);
        self.tlas_geom_buffer.destroy(device);
    }
}

fn align_up(pos: u32, align: u32) -> u32 {
    let align = align.max(1);
    (pos + align - 1) / align * align
}
