// Buffer lifecycle, the static/dynamic frame allocator built on it, and
// per-buffer staged upload tracking
//
// Austin Shafer - 2024
use ash::vk;

use crate::alloc::ring::ALLOC_FAILED;
use crate::alloc::RingAllocator;
use crate::combuf::{BarrierBatch, BufferBarrierDecl, BufferSyncState, Combuf, CombufPool};
use crate::devmem::{self, DeviceAlloc};
use crate::error::{CoreError, Result};
use crate::staging::StagingArena;

fn align_up(pos: u64, align: u64) -> u64 {
    let align = align.max(1);
    (pos + align - 1) / align * align
}

/// A buffer and the memory backing it. Tracks its own last-use for
/// `CombufPool::issue_barrier` and its own queue of staged writes, so
/// callers never have to keep a side table mapping buffers to pending
/// copies.
pub struct Buffer {
    pub buffer: vk::Buffer,
    alloc: DeviceAlloc,
    pub size: u64,
    pub sync: BufferSyncState,
    pending_copies: Vec<vk::BufferCopy>,
}

impl Buffer {
    /// Create a buffer of `size` bytes. If `usage` includes
    /// `SHADER_BINDING_TABLE_BIT_KHR`, `size` is rounded up to
    /// `sbt_alignment` first, matching the source's handling of shader
    /// binding table buffers (`shaderGroupBaseAlignment`). If `usage`
    /// includes `SHADER_DEVICE_ADDRESS`, the allocation is made with
    /// `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`.
    pub fn create(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        usage: vk::BufferUsageFlags,
        sharing_mode: vk::SharingMode,
        mem_flags: vk::MemoryPropertyFlags,
        mut size: u64,
        sbt_alignment: Option<u64>,
    ) -> Result<Self> {
        if usage.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR) {
            size = align_up(size, sbt_alignment.unwrap_or(1));
        }

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode);
        let buffer = unsafe { device.create_buffer(&create_info, None)? };

        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };
        let needs_device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let host_visible = mem_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        let alloc = match devmem::allocate(
            device,
            mem_props,
            &reqs,
            mem_flags,
            needs_device_address,
            host_visible,
        ) {
            Ok(a) => a,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe { device.bind_buffer_memory(buffer, alloc.memory, 0)? };

        Ok(Self {
            buffer,
            alloc,
            size,
            sync: BufferSyncState::default(),
            pending_copies: Vec::new(),
        })
    }

    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// A host-visible buffer's mapped pointer, if it was created with a
    /// host-visible memory type.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.alloc.mapped
    }

    /// # Safety
    /// Must only be called once, and the buffer must not be in use by
    /// the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        self.alloc.free(device);
    }

    /// Stage `data` through `staging` for a later copy into this buffer
    /// at `dst_offset`. Multiple calls before a `staging_commit` append
    /// to the same pending copy list; the staging arena itself
    /// coalesces the underlying host writes.
    pub fn queue_write<T: Copy>(
        &mut self,
        staging: &mut StagingArena,
        dst_offset: u64,
        data: &[T],
    ) -> Result<()> {
        let byte_len = std::mem::size_of_val(data) as u64;
        if byte_len == 0 {
            return Ok(());
        }
        let align = std::mem::align_of::<T>() as u64;
        let staging_offset = staging.alloc(byte_len, align)?;

        unsafe {
            let dst = staging.mapped_slice_mut(staging_offset, byte_len);
            let src = std::slice::from_raw_parts(data.as_ptr() as *const u8, byte_len as usize);
            dst.copy_from_slice(src);
        }

        self.pending_copies.push(vk::BufferCopy {
            src_offset: staging_offset,
            dst_offset,
            size: byte_len,
        });
        Ok(())
    }

    /// Emit a `TRANSFER_WRITE` barrier (if needed) and a single
    /// `vkCmdCopyBuffer` covering every queued write. No-op if nothing
    /// is queued, matching the source's early-return when the region
    /// count is zero.
    pub fn staging_commit(
        &mut self,
        pool: &CombufPool,
        device: &ash::Device,
        combuf: &Combuf,
        staging_buffer: vk::Buffer,
    ) {
        if self.pending_copies.is_empty() {
            return;
        }

        let mut decls = [BufferBarrierDecl {
            buffer: self.buffer,
            sync: &mut self.sync,
            stage: vk::PipelineStageFlags2::TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
        }];
        let mut batch = BarrierBatch {
            stage: vk::PipelineStageFlags2::TRANSFER,
            buffers: &mut decls,
        };
        pool.issue_barrier(combuf, &mut batch);

        unsafe {
            device.cmd_copy_buffer(combuf.cmdbuf, staging_buffer, self.buffer, &self.pending_copies);
        }
        self.pending_copies.clear();
    }
}

/// A ring allocator that retires its oldest generation two flips back,
/// so a frame's writes remain valid while the GPU may still be reading
/// the previous frame's.
pub struct FlippingBuffer {
    ring: RingAllocator,
    frame_offsets: [u32; 2],
}

impl FlippingBuffer {
    pub fn new(size: u32) -> Self {
        Self {
            ring: RingAllocator::new(size),
            frame_offsets: [ALLOC_FAILED, ALLOC_FAILED],
        }
    }

    pub fn size(&self) -> u32 {
        self.ring.size()
    }

    /// Allocate from the current generation, lazily recording this
    /// generation's first offset the way `R_FlippingBuffer::Alloc` does
    /// (vk_buffer.c:80-81), so `flip` knows where the *next* generation
    /// will start without assuming the ring head hasn't wrapped.
    pub fn alloc(&mut self, size: u32, alignment: u32) -> u32 {
        let offset = self.ring.alloc(size, alignment);
        if offset != ALLOC_FAILED && self.frame_offsets[1] == ALLOC_FAILED {
            self.frame_offsets[1] = offset;
        }
        offset
    }

    /// Retire the oldest surviving generation and start tracking a new
    /// one. `frame_offsets[0]` may still be the sentinel if the
    /// generation it would name never allocated anything - nothing to
    /// free in that case.
    pub fn flip(&mut self) {
        if self.frame_offsets[0] != ALLOC_FAILED {
            self.ring.free(self.frame_offsets[0]);
        }
        self.frame_offsets[0] = self.frame_offsets[1];
        self.frame_offsets[1] = ALLOC_FAILED;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    /// Lives for the lifetime of the buffer; never reclaimed.
    Static,
    /// Reclaimed a couple of flips after its generation is retired.
    Dynamic,
}

/// Splits one buffer into a monotone "static" region (geometry, BLAS
/// inputs - anything uploaded once and read every frame) and a flipping
/// "dynamic" region (per-frame uniforms, TLAS instance buffers).
pub struct DEBuffer {
    dynamic: FlippingBuffer,
    static_size: u32,
    static_offset: u32,
}

impl DEBuffer {
    pub fn new(total_size: u32, static_size: u32) -> Self {
        debug_assert!(static_size <= total_size);
        Self {
            dynamic: FlippingBuffer::new(total_size - static_size),
            static_size,
            static_offset: 0,
        }
    }

    /// Allocate `size` bytes from the requested region. Returns the
    /// offset within the *whole* backing buffer.
    pub fn alloc(&mut self, lifetime: Lifetime, size: u32, alignment: u32) -> Result<u32> {
        match lifetime {
            Lifetime::Static => {
                let offset = {
                    let align = alignment.max(1);
                    (self.static_offset + align - 1) / align * align
                };
                if offset.checked_add(size).map_or(true, |end| end > self.static_size) {
                    return Err(CoreError::PoolExhausted { requested: size });
                }
                self.static_offset = offset + size;
                Ok(offset)
            }
            Lifetime::Dynamic => {
                let offset = self.dynamic.alloc(size, alignment);
                if offset == ALLOC_FAILED {
                    return Err(CoreError::RingExhausted { requested: size });
                }
                Ok(self.static_size + offset)
            }
        }
    }

    pub fn flip(&mut self) {
        self.dynamic.flip();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flipping_buffer_retires_two_generations_back() {
        let mut fb = FlippingBuffer::new(256);
        let a = fb.alloc(64, 1);
        assert_eq!(a, 0);
        fb.flip(); // generation 0 still alive, tracked from offset 0

        let b = fb.alloc(64, 1);
        assert_eq!(b, 64);
        fb.flip(); // generation 0 (offset 0..64) now retired

        // head is at 128 with free space ahead of it (tail is 0, not yet
        // wrapped), so the next allocation continues forward instead of
        // reusing the space generation 0 gave back
        let c = fb.alloc(64, 1);
        assert_eq!(c, 128);
    }

    #[test]
    fn flipping_buffer_guards_free_with_sentinel_on_empty_generation() {
        // a generation that never allocates must not propagate the ring
        // wrap-around sentinel into `ring.free`
        let mut fb = FlippingBuffer::new(128);
        fb.flip();
        fb.flip();
        let a = fb.alloc(32, 1);
        assert_eq!(a, 0);
    }

    #[test]
    fn debuffer_static_and_dynamic_dont_overlap() {
        let mut de = DEBuffer::new(1000, 200);
        let s0 = de.alloc(Lifetime::Static, 50, 1).unwrap();
        let s1 = de.alloc(Lifetime::Static, 50, 1).unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 50);

        let d0 = de.alloc(Lifetime::Dynamic, 100, 1).unwrap();
        assert_eq!(d0, 200); // translated past the static region

        assert!(de.alloc(Lifetime::Static, 901, 1).is_err());
    }

    #[test]
    fn debuffer_static_exhaustion_is_an_error() {
        let mut de = DEBuffer::new(100, 10);
        assert!(de.alloc(Lifetime::Static, 10, 1).is_ok());
        assert!(de.alloc(Lifetime::Static, 1, 1).is_err());
    }
}
