// Shared vertex/index buffer split into a long-lived static region and a
// per-frame "once" region that is reset wholesale on every flip
//
// Static geometry (level meshes, BLAS inputs) goes through the
// coalescing range allocator so individual meshes can be freed
// independently. Per-frame geometry (dynamic decals, particles) is a
// simple bump allocator over the remaining space that resets to zero
// every flip instead of tracking individual frees, mirroring the
// source's `r_blocks_t` "once" allocations.
//
// Austin Shafer - 2024
use ash::vk;

use crate::alloc::{Range, RangeAllocator};
use crate::buffer::Buffer;
use crate::error::{CoreError, Result};
use crate::staging::StagingArena;

/// Must match the host-side vertex layout used by the ray tracing
/// pipeline's vertex shaders.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

pub const INDEX_SIZE: u32 = std::mem::size_of::<u16>() as u32;
pub const VERTEX_SIZE: u32 = std::mem::size_of::<Vertex>() as u32;

#[derive(Clone, Copy)]
pub struct GeometryRange {
    range: Range,
    pub vertex_unit_offset: u32,
    pub vertex_count: u32,
    pub index_unit_offset: u32,
    pub index_count: u32,
}

enum Backing {
    Static(Range),
    /// Per-frame ranges are never freed individually; `flip()` discards
    /// them all at once.
    Once,
}

pub struct GeometryBuffer {
    pub buffer: Buffer,
    static_alloc: RangeAllocator,
    static_size: u32,
    dynamic_cursor: u32,
    dynamic_size: u32,
}

fn range_byte_layout(vertex_count: u32, index_count: u32) -> (u32, u32) {
    let vertices_size = vertex_count * VERTEX_SIZE;
    let indices_size = index_count * INDEX_SIZE;
    (vertices_size, indices_size)
}

impl GeometryBuffer {
    pub fn new(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        static_size: u32,
        dynamic_size: u32,
        rtx_usage: bool,
    ) -> Result<Self> {
        let mut usage = vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER;
        if rtx_usage {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }

        let buffer = Buffer::create(
            device,
            mem_props,
            usage,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            (static_size + dynamic_size) as u64,
            None,
        )?;

        Ok(Self {
            buffer,
            static_alloc: RangeAllocator::new(static_size, 1024, VERTEX_SIZE),
            static_size,
            dynamic_cursor: 0,
            dynamic_size,
        })
    }

    fn finish_range(backing: Backing, offset: u32, vertex_count: u32, index_count: u32) -> GeometryRange {
        let (vertices_size, _) = range_byte_layout(vertex_count, index_count);
        let range = match backing {
            Backing::Static(r) => r,
            Backing::Once => Range {
                offset,
                size: vertices_size + index_count * INDEX_SIZE,
                alignment_hole: 0,
                // not pool-owned; `free_static` is never called on a
                // once-range, so there is no block index to track.
                index: -1,
            },
        };
        GeometryRange {
            range,
            vertex_unit_offset: offset / VERTEX_SIZE,
            vertex_count,
            index_unit_offset: (offset + vertices_size) / INDEX_SIZE,
            index_count,
        }
    }

    /// Permanently reserve space for `vertex_count`/`index_count`. Freed
    /// explicitly with `free_static`.
    pub fn alloc_static(&mut self, vertex_count: u32, index_count: u32) -> Result<GeometryRange> {
        let (vertices_size, indices_size) = range_byte_layout(vertex_count, index_count);
        let range = self.static_alloc.allocate(vertices_size + indices_size, VERTEX_SIZE);
        if range.failed() {
            return Err(CoreError::PoolExhausted {
                requested: vertices_size + indices_size,
            });
        }
        Ok(Self::finish_range(Backing::Static(range), range.offset, vertex_count, index_count))
    }

    pub fn free_static(&mut self, range: GeometryRange) {
        self.static_alloc.free(range.range);
    }

    /// Reserve space in the per-frame region. Never freed individually;
    /// reclaimed in bulk by the next `flip()`.
    pub fn alloc_once(&mut self, vertex_count: u32, index_count: u32) -> Result<GeometryRange> {
        let (vertices_size, indices_size) = range_byte_layout(vertex_count, index_count);
        let total = vertices_size + indices_size;
        if self.dynamic_cursor + total > self.dynamic_size {
            return Err(CoreError::PoolExhausted { requested: total });
        }
        let offset = self.static_size + self.dynamic_cursor;
        self.dynamic_cursor += total;
        Ok(Self::finish_range(Backing::Once, offset, vertex_count, index_count))
    }

    pub fn flip(&mut self) {
        self.dynamic_cursor = 0;
    }

    /// Stage `vertices`/`indices` and queue their copy into `range`.
    /// Call `Buffer::staging_commit` on `self.buffer` afterward to
    /// actually record the copy.
    pub fn write(
        &mut self,
        staging: &mut StagingArena,
        range: &GeometryRange,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> Result<()> {
        debug_assert_eq!(vertices.len() as u32, range.vertex_count);
        debug_assert_eq!(indices.len() as u32, range.index_count);

        let vertex_byte_offset = range.vertex_unit_offset * VERTEX_SIZE;
        let index_byte_offset = range.index_unit_offset * INDEX_SIZE;

        self.buffer.queue_write(staging, vertex_byte_offset as u64, vertices)?;
        if !indices.is_empty() {
            self.buffer.queue_write(staging, index_byte_offset as u64, indices)?;
        }
        Ok(())
    }

    /// # Safety
    /// The GPU must be done with every draw that reads this buffer.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.buffer.destroy(device);
    }
}
