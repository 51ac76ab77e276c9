// Thin wrapper around a single dedicated `vkAllocateMemory` call
//
// Everything above this layer (buffers, images, acceleration structures)
// gets its backing store from here. There is no sub-allocation at this
// level - each call is a dedicated allocation, matching the source's
// `vk_devmem_t`, which exists to centralize memory-type selection and
// optional `VkMemoryAllocateFlagsInfo` (buffer device address / export)
// rather than to pool allocations.
//
// Austin Shafer - 2024
use ash::vk;

use crate::error::{CoreError, Result};

pub struct DeviceAlloc {
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub mapped: Option<*mut u8>,
}

// `*mut u8` is only ever dereferenced by the owner of the matching
// `DeviceAlloc` while holding &mut access to it.
unsafe impl Send for DeviceAlloc {}

fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for (i, mem_type) in props.memory_types.iter().enumerate() {
        if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
            return Some(i as u32);
        }
    }
    None
}

/// Allocate device memory satisfying `reqs`, preferring `flags`. If
/// `host_visible_map` is set, the allocation is mapped for the lifetime
/// of the `DeviceAlloc` (the memory type must be host visible).
pub fn allocate(
    device: &ash::Device,
    mem_props: &vk::PhysicalDeviceMemoryProperties,
    reqs: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    needs_device_address: bool,
    host_visible_map: bool,
) -> Result<DeviceAlloc> {
    let type_index = find_memory_type_index(mem_props, reqs.memory_type_bits, flags)
        .ok_or(CoreError::NoSuitableMemoryType)?;

    let mut alloc_flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(reqs.size)
        .memory_type_index(type_index);
    if needs_device_address {
        alloc_info = alloc_info.push_next(&mut alloc_flags_info);
    }

    let memory = unsafe { device.allocate_memory(&alloc_info, None)? };

    let mapped = if host_visible_map {
        let ptr = unsafe {
            device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        Some(ptr as *mut u8)
    } else {
        None
    };

    Ok(DeviceAlloc {
        memory,
        size: reqs.size,
        mapped,
    })
}

impl DeviceAlloc {
    /// # Safety
    /// `device` must be the same device this allocation came from, and
    /// no other references to `memory` may outlive this call.
    pub unsafe fn free(&self, device: &ash::Device) {
        device.free_memory(self.memory, None);
    }
}
