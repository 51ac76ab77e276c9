// Single mapped host-visible scratch buffer for staged uploads
//
// Every `Buffer::queue_write` and image upload borrows space out of one
// shared arena instead of each resource owning its own staging buffer.
// The arena is a `FlippingBuffer` (see `buffer.rs`) so a generation of
// writes is retired once the frames that consumed it have passed,
// without the caller tracking fences itself.
//
// Austin Shafer - 2024
use ash::vk;

use crate::buffer::FlippingBuffer;
use crate::devmem::{self, DeviceAlloc};
use crate::error::{CoreError, Result};

pub struct StagingArena {
    buffer: vk::Buffer,
    alloc: DeviceAlloc,
    allocator: FlippingBuffer,
}

impl StagingArena {
    pub fn new(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        size: u32,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None)? };
        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };

        let alloc = match devmem::allocate(
            device,
            mem_props,
            &reqs,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
            true,
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
            allocator: FlippingBuffer::new(size),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Reserve `size` bytes aligned to `alignment`. Fails if the arena
    /// has no room for this generation; callers should flush/commit and
    /// retry rather than growing the arena on the fly.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let offset = self.allocator.alloc(size as u32, alignment as u32);
        if offset == crate::alloc::ring::ALLOC_FAILED {
            return Err(CoreError::StagingExhausted {
                requested: size as u32,
            });
        }
        Ok(offset as u64)
    }

    /// # Safety
    /// `offset..offset+len` must be within this arena's live allocation
    /// and not aliased by a concurrent borrow.
    pub unsafe fn mapped_slice_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        let base = self.alloc.mapped.expect("staging arena is not host-mapped");
        std::slice::from_raw_parts_mut(base.add(offset as usize), len as usize)
    }

    pub fn flip(&mut self) {
        self.allocator.flip();
    }

    /// # Safety
    /// Must only be called once, with no GPU work still reading from
    /// this arena.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        self.alloc.free(device);
    }
}
