// Named resource graph: fixed external slots plus pipeline-allocated
// storage images, with prev-frame swapping and barrier collation by
// descriptor type
//
// A resource's backing buffer, when it is one, is never owned by this
// module - the graph stores a raw pointer to the owning `Buffer`'s
// `BufferSyncState` (set by whichever module actually owns the
// buffer: `GeometryBuffer`, `AccelBuilder`, a future lights/UBO
// module) so barrier inference stays anchored on the single real sync
// state instead of a stale copy. Storage images created for a
// pipeline's own use (G-buffer channels, accumulation targets) are
// owned directly by the slot.
//
// Austin Shafer - 2024
use ash::vk;

use crate::combuf::{BufferBarrierDecl, BufferSyncState, BarrierBatch, Combuf, CombufPool};
use crate::error::Result;
use crate::image::{Image, ImageCreateInfo};

pub const MAX_RESOURCES: usize = 128;

/// Names pre-registered at fixed indices `0..EXTERNAL_RESOURCE_COUNT`,
/// matching the source's `EXTERNAL_RESOUCES` X-macro table.
pub const EXTERNAL_RESOURCE_NAMES: &[&str] = &[
    "tlas",
    "ubo",
    "kusochki",
    "model_headers",
    "indices",
    "vertices",
    "lights",
    "light_grid",
    "textures",
    "skybox",
    "blue_noise",
];

pub const EXTERNAL_RESOURCE_COUNT: usize = EXTERNAL_RESOURCE_NAMES.len();

#[derive(Clone)]
pub enum ResourceValue {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    ImageArray(Vec<vk::DescriptorImageInfo>),
    AccelerationStructure(vk::AccelerationStructureKHR),
    Unset,
}

/// One entry in the graph. Unused slots have an empty `name`.
pub struct NamedResource {
    name: String,
    pub descriptor_type: vk::DescriptorType,
    pub value: ResourceValue,
    /// Owned storage image, for slots created via `create_storage_image`.
    pub image: Option<Image>,
    /// Raw pointer into the owning buffer's sync state, for `Buffer`
    /// values. Never dereferenced outside `add_to_barrier`/`commit`.
    buffer_sync: Option<*mut BufferSyncState>,
    pub refcount: i32,
    /// `1 + index` of the slot this one swaps with every frame, or 0
    /// if this slot doesn't participate in prev-frame swapping.
    pub source_index_plus_1: i32,
}

impl NamedResource {
    fn empty() -> Self {
        Self {
            name: String::new(),
            descriptor_type: vk::DescriptorType::SAMPLER,
            value: ResourceValue::Unset,
            image: None,
            buffer_sync: None,
            refcount: 0,
            source_index_plus_1: 0,
        }
    }
}

/// Collects barrier declarations across several named resources before
/// a single `ResourceGraph::commit`.
#[derive(Default)]
pub struct ResourceBarrierBatch {
    image_barriers: Vec<vk::ImageMemoryBarrier2>,
    buffer_indices: Vec<(usize, vk::AccessFlags2)>,
}

pub struct ResourceGraph {
    slots: Vec<NamedResource>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        let mut slots: Vec<NamedResource> = (0..MAX_RESOURCES).map(|_| NamedResource::empty()).collect();
        for (i, name) in EXTERNAL_RESOURCE_NAMES.iter().enumerate() {
            slots[i].name = (*name).to_string();
            slots[i].refcount = 1;
        }
        Self { slots }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    /// Find `name`'s slot, or the first unused slot past the external
    /// table. `None` if the table is full.
    pub fn find_or_alloc(&mut self, name: &str) -> Option<usize> {
        if let Some(i) = self.index_of(name) {
            return Some(i);
        }
        let i = self.slots[EXTERNAL_RESOURCE_COUNT..]
            .iter()
            .position(|s| s.name.is_empty())?;
        let i = i + EXTERNAL_RESOURCE_COUNT;
        self.slots[i].name = name.to_string();
        Some(i)
    }

    pub fn get(&self, index: usize) -> &NamedResource {
        &self.slots[index]
    }

    /// Tear down every slot's owned image regardless of refcount. Only
    /// safe to call when the whole graph is going away (`GpuContext`
    /// shutdown) - `cleanup` is the one to call mid-lifetime.
    pub unsafe fn destroy_all(&mut self, device: &ash::Device) {
        for slot in self.slots.iter_mut() {
            if let Some(mut img) = slot.image.take() {
                img.destroy(device);
            }
            slot.name.clear();
            slot.refcount = 0;
        }
    }

    /// Drop every slot with `refcount == 0` and no owned image, freeing
    /// its name for reuse. Mirrors `R_VkResourcesCleanup`.
    pub unsafe fn cleanup(&mut self, device: &ash::Device) {
        for slot in self.slots.iter_mut() {
            if slot.name.is_empty() || slot.refcount != 0 {
                continue;
            }
            if let Some(mut img) = slot.image.take() {
                img.destroy(device);
            }
            slot.name.clear();
        }
    }

    /// Register `index` as a `VK_DESCRIPTOR_TYPE_STORAGE_BUFFER` /
    /// `UNIFORM_BUFFER` view into a buffer owned elsewhere. `sync` must
    /// outlive every `add_to_barrier`/`commit` call made against this
    /// slot.
    pub fn set_buffer(
        &mut self,
        index: usize,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        sync: &mut BufferSyncState,
        offset: u64,
        range: u64,
    ) {
        let slot = &mut self.slots[index];
        slot.descriptor_type = descriptor_type;
        slot.value = ResourceValue::Buffer { buffer, offset, range };
        slot.buffer_sync = Some(sync as *mut BufferSyncState);
    }

    pub fn set_combined_image_sampler(&mut self, index: usize, view: vk::ImageView, sampler: vk::Sampler) {
        let slot = &mut self.slots[index];
        slot.descriptor_type = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        slot.value = ResourceValue::CombinedImageSampler { view, sampler };
    }

    pub fn set_image_array(&mut self, index: usize, infos: Vec<vk::DescriptorImageInfo>) {
        let slot = &mut self.slots[index];
        slot.descriptor_type = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        slot.value = ResourceValue::ImageArray(infos);
    }

    pub fn set_acceleration_structure(&mut self, index: usize, accel: vk::AccelerationStructureKHR) {
        let slot = &mut self.slots[index];
        slot.descriptor_type = vk::DescriptorType::ACCELERATION_STRUCTURE_KHR;
        slot.value = ResourceValue::AccelerationStructure(accel);
    }

    /// Create (or resize) a storage image backing `index`, sized to the
    /// current max frame extent. Used when loading a meatpipe resource
    /// declared `CREATE`.
    pub fn create_storage_image(
        &mut self,
        index: usize,
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<()> {
        let image = Image::create(
            device,
            mem_props,
            &ImageCreateInfo {
                width,
                height,
                mips: 1,
                layers: 1,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
                memory_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;
        let slot = &mut self.slots[index];
        slot.descriptor_type = vk::DescriptorType::STORAGE_IMAGE;
        slot.image = Some(image);
        Ok(())
    }

    /// Declare that `dst`'s contents for this frame come from `src` one
    /// frame prior; `frame_begin_state_change` will swap their
    /// `{resource, image}` every frame from then on.
    pub fn link_prev_frame(&mut self, dst: usize, src: usize) {
        self.slots[dst].source_index_plus_1 = src as i32 + 1;
    }

    /// Swap every prev-frame-linked pair's resource/image, then clear
    /// images that have never been written or that the host signalled
    /// a discontinuity for. Mirrors
    /// `R_VkResourcesFrameBeginStateChangeFIXME`.
    pub fn frame_begin_state_change(
        &mut self,
        device: &ash::Device,
        pool: &CombufPool,
        combuf: &Combuf,
        discontinuity: bool,
    ) {
        for i in EXTERNAL_RESOURCE_COUNT..self.slots.len() {
            if self.slots[i].name.is_empty() || self.slots[i].image.is_none() || self.slots[i].source_index_plus_1 <= 0 {
                continue;
            }
            let src = (self.slots[i].source_index_plus_1 - 1) as usize;
            debug_assert_ne!(i, src);

            // Swap only the contents (`value`/`image`/`descriptor_type`
            // /`buffer_sync`); `name`, `refcount` and
            // `source_index_plus_1` describe the slot itself and stay
            // put, matching the source's field-by-field swap.
            let (lo, hi) = if i < src { (i, src) } else { (src, i) };
            let (left, right) = self.slots.split_at_mut(hi);
            let (slot_i, slot_src) = if i < src { (&mut left[lo], &mut right[0]) } else { (&mut right[0], &mut left[lo]) };
            std::mem::swap(&mut slot_i.value, &mut slot_src.value);
            std::mem::swap(&mut slot_i.image, &mut slot_src.image);
            std::mem::swap(&mut slot_i.descriptor_type, &mut slot_src.descriptor_type);
            std::mem::swap(&mut slot_i.buffer_sync, &mut slot_src.buffer_sync);

            let needs_clear =
                discontinuity || self.slots[i].image.as_ref().map_or(false, |img| img.sync.write.stage.is_empty());
            if needs_clear {
                if let Some(img) = self.slots[i].image.as_mut() {
                    img.clear(device, pool, combuf);
                }
            }
        }
    }

    /// Route `index`'s descriptor type to the right kind of barrier
    /// declaration. Mirrors `R_VkResourceAddToBarrier`.
    pub fn add_to_barrier(&self, index: usize, write: bool, batch: &mut ResourceBarrierBatch) {
        let slot = &self.slots[index];
        match slot.descriptor_type {
            vk::DescriptorType::STORAGE_IMAGE => {
                let img = slot.image.as_ref().expect("storage image resource has no backing image");
                let access = if write {
                    vk::AccessFlags2::SHADER_WRITE
                } else {
                    vk::AccessFlags2::SHADER_READ
                };
                batch.image_barriers.push(
                    vk::ImageMemoryBarrier2::builder()
                        .image(img.image)
                        .dst_access_mask(access)
                        .old_layout(img.layout)
                        .new_layout(vk::ImageLayout::GENERAL)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: img.mips,
                            base_array_layer: 0,
                            layer_count: img.layers,
                        })
                        .build(),
                );
            }
            vk::DescriptorType::STORAGE_BUFFER => {
                debug_assert!(!write, "storage buffer resources are read-only from the graph's perspective");
                batch.buffer_indices.push((index, vk::AccessFlags2::SHADER_READ));
            }
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            | vk::DescriptorType::UNIFORM_BUFFER => {}
            other => debug_assert!(false, "unsupported resource descriptor type {:?}", other),
        }
    }

    /// Emit every barrier `batch` collected. No-op if empty.
    pub fn commit(&mut self, pool: &CombufPool, combuf: &Combuf, dst_stage: vk::PipelineStageFlags2, mut batch: ResourceBarrierBatch) {
        if batch.image_barriers.is_empty() && batch.buffer_indices.is_empty() {
            return;
        }

        for barrier in batch.image_barriers.iter_mut() {
            barrier.src_stage_mask = vk::PipelineStageFlags2::ALL_COMMANDS;
            barrier.src_access_mask = vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ;
            barrier.dst_stage_mask = dst_stage;
        }
        pool.raw_image_barriers(combuf, &batch.image_barriers);

        if !batch.buffer_indices.is_empty() {
            // Merge by index first - two `BufferBarrierDecl`s can't
            // borrow the same `BufferSyncState` simultaneously.
            let mut merged: Vec<(usize, vk::AccessFlags2)> = Vec::new();
            for &(index, access) in batch.buffer_indices.iter() {
                match merged.iter_mut().find(|(i, _)| *i == index) {
                    Some(entry) => entry.1 |= access,
                    None => merged.push((index, access)),
                }
            }

            let mut decls: Vec<BufferBarrierDecl> = Vec::with_capacity(merged.len());
            for (index, access) in merged {
                let slot = &self.slots[index];
                let (buffer, sync_ptr) = match (&slot.value, slot.buffer_sync) {
                    (ResourceValue::Buffer { buffer, .. }, Some(sync_ptr)) => (*buffer, sync_ptr),
                    _ => continue,
                };
                // SAFETY: `sync_ptr` points at the `BufferSyncState`
                // embedded in the owning `Buffer`, which the caller
                // guaranteed outlives this call when registering the
                // resource via `set_buffer`.
                let sync = unsafe { &mut *sync_ptr };
                decls.push(BufferBarrierDecl {
                    buffer,
                    sync,
                    stage: dst_stage,
                    access,
                });
            }
            let mut resource_batch = BarrierBatch {
                stage: dst_stage,
                buffers: &mut decls,
            };
            pool.issue_barrier(combuf, &mut resource_batch);
        }

        for barrier in batch.image_barriers.drain(..) {
            if let Some(slot) = self.slots.iter_mut().find(|s| s.image.as_ref().map_or(false, |i| i.image == barrier.image)) {
                if let Some(img) = slot.image.as_mut() {
                    img.layout = barrier.new_layout;
                    img.sync.write = crate::combuf::SyncPoint {
                        stage: dst_stage,
                        access: barrier.dst_access_mask,
                    };
                }
            }
        }
    }
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_resources_are_preregistered() {
        let graph = ResourceGraph::new();
        for name in EXTERNAL_RESOURCE_NAMES {
            assert!(graph.index_of(name).is_some());
        }
        assert_eq!(graph.index_of("tlas"), Some(0));
    }

    #[test]
    fn find_or_alloc_reuses_existing_name() {
        let mut graph = ResourceGraph::new();
        let a = graph.find_or_alloc("g_normal").unwrap();
        let b = graph.find_or_alloc("g_normal").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn find_or_alloc_picks_first_free_slot_past_external_table() {
        let mut graph = ResourceGraph::new();
        let a = graph.find_or_alloc("g_albedo").unwrap();
        assert_eq!(a, EXTERNAL_RESOURCE_COUNT);
    }

    #[test]
    fn prev_frame_link_is_recorded() {
        let mut graph = ResourceGraph::new();
        let cur = graph.find_or_alloc("accum_cur").unwrap();
        let prev = graph.find_or_alloc("accum_prev").unwrap();
        graph.link_prev_frame(prev, cur);
        assert_eq!(graph.get(prev).source_index_plus_1, cur as i32 + 1);
    }
}
