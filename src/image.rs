// Image lifecycle and the three-phase upload queue
//
// Austin Shafer - 2024
use ash::vk;

use crate::combuf::{BufferSyncState, Combuf, CombufPool};
use crate::devmem::{self, DeviceAlloc};
use crate::error::Result;
use crate::staging::StagingArena;

/// A created image and its default view. Mip/array support is limited
/// to what the resource graph and texture loader need - 2D images with
/// a flat mip chain, no cube/3D handling, since this core never draws
/// anything but full-screen and G-buffer targets plus loaded textures.
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    alloc: DeviceAlloc,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub mips: u32,
    pub layers: u32,
    pub size: u64,
    /// Index into `ImageUploadQueue`'s slot table while an upload is
    /// pending, `None` otherwise. Mirrors the source's `upload_slot`.
    upload_slot: Option<usize>,
    /// Current layout and last-use sync state. Only maintained by
    /// callers that track it explicitly (the resource graph's storage
    /// images); plain render targets that always transition through
    /// the same fixed path don't need to read it.
    pub layout: vk::ImageLayout,
    pub sync: BufferSyncState,
}

pub struct ImageCreateInfo {
    pub width: u32,
    pub height: u32,
    pub mips: u32,
    pub layers: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_props: vk::MemoryPropertyFlags,
}

const VIEW_IMPLYING_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::SAMPLED.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT.as_raw(),
);

impl Image {
    pub fn create(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        info: &ImageCreateInfo,
    ) -> Result<Self> {
        let is_depth = info
            .usage
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mips.max(1))
            .array_layers(info.layers.max(1))
            .format(info.format)
            .tiling(info.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(info.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&create_info, None)? };

        let reqs = unsafe { device.get_image_memory_requirements(image) };
        let flags = if info.memory_props.is_empty() {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        } else {
            info.memory_props
        };
        let alloc = match devmem::allocate(device, mem_props, &reqs, flags, false, false) {
            Ok(a) => a,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        unsafe { device.bind_image_memory(image, alloc.memory, 0)? };

        let view = if info.usage.intersects(VIEW_IMPLYING_USAGE) {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(info.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: if is_depth {
                        vk::ImageAspectFlags::DEPTH
                    } else {
                        vk::ImageAspectFlags::COLOR
                    },
                    base_mip_level: 0,
                    level_count: info.mips.max(1),
                    base_array_layer: 0,
                    layer_count: info.layers.max(1),
                });
            unsafe { device.create_image_view(&view_info, None)? }
        } else {
            vk::ImageView::null()
        };

        Ok(Self {
            image,
            view,
            alloc,
            format: info.format,
            width: info.width,
            height: info.height,
            mips: info.mips.max(1),
            layers: info.layers.max(1),
            size: reqs.size,
            upload_slot: None,
            layout: vk::ImageLayout::UNDEFINED,
            sync: BufferSyncState::default(),
        })
    }

    /// # Safety
    /// The caller must ensure the GPU is done with this image (no
    /// pending upload, no in-flight command buffer references it).
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view, None);
        }
        device.destroy_image(self.image, None);
        self.alloc.free(device);
    }

    fn aspect(&self) -> vk::ImageAspectFlags {
        vk::ImageAspectFlags::COLOR
    }

    /// Transition from `UNDEFINED` to `GENERAL` and clear to zero.
    pub fn clear(&mut self, device: &ash::Device, pool: &CombufPool, combuf: &Combuf) {
        let barrier = vk::ImageMemoryBarrier2::builder()
            .image(self.image)
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .src_access_mask(vk::AccessFlags2::empty())
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect(),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        pool.raw_image_barrier(combuf, barrier);

        let range = vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            device.cmd_clear_color_image(
                combuf.cmdbuf,
                self.image,
                vk::ImageLayout::GENERAL,
                &vk::ClearColorValue::default(),
                &[range],
            );
        }

        self.layout = vk::ImageLayout::GENERAL;
        self.sync.write = crate::combuf::SyncPoint {
            stage: vk::PipelineStageFlags2::TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
        };
    }
}

struct ImageUploadSlot {
    image_ptr: *mut Image,
    staging_offset: u64,
    staging_cursor: u64,
    staging_size: u64,
    slices_begin: usize,
    /// Slices expected before this upload is complete (`layers * mips`),
    /// matching `R_VkImageUploadBegin`'s `slices.end` (vk_image.c).
    slices_end: usize,
}

/// Batches every image awaiting upload this frame, so the three
/// barrier/copy/barrier phases run once for all of them instead of once
/// per image.
pub struct ImageUploadQueue {
    slots: Vec<ImageUploadSlot>,
    copies: Vec<vk::BufferImageCopy>,
    gpu_scope_id: i32,
}

impl ImageUploadQueue {
    pub fn new(pool: &mut CombufPool) -> Self {
        Self {
            slots: Vec::new(),
            copies: Vec::new(),
            gpu_scope_id: pool.register_scope("image_upload"),
        }
    }

    /// Reserve staging space for `img`'s whole mip/layer chain and
    /// start a new upload slot for it.
    pub fn begin(&mut self, img: &mut Image, staging: &mut StagingArena) -> Result<()> {
        debug_assert!(img.upload_slot.is_none());
        let staging_offset = staging.alloc(img.size, 16)?;

        img.upload_slot = Some(self.slots.len());
        self.slots.push(ImageUploadSlot {
            image_ptr: img as *mut Image,
            staging_offset,
            staging_cursor: 0,
            staging_size: img.size,
            slices_begin: self.copies.len(),
            slices_end: (img.layers as usize) * (img.mips as usize),
        });
        Ok(())
    }

    /// Copy one mip/layer slice's texel data into staging and record the
    /// `VkBufferImageCopy` region for it.
    ///
    /// # Safety
    /// `img` must be the same image most recently passed to `begin`
    /// without an intervening `end`/`cancel`.
    pub unsafe fn upload_slice(
        &mut self,
        img: &mut Image,
        staging: &mut StagingArena,
        layer: u32,
        mip: u32,
        data: &[u8],
    ) {
        let slot_idx = img.upload_slot.expect("upload_slice without begin");
        let width = (img.width >> mip).max(1);
        let height = (img.height >> mip).max(1);

        let slot = &mut self.slots[slot_idx];
        debug_assert!(slot.staging_cursor + data.len() as u64 <= slot.staging_size);

        let dst = staging.mapped_slice_mut(slot.staging_offset + slot.staging_cursor, data.len() as u64);
        dst.copy_from_slice(data);

        self.copies.push(vk::BufferImageCopy {
            buffer_offset: slot.staging_offset + slot.staging_cursor,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        });

        slot.staging_cursor += data.len() as u64;
    }

    /// # Panics (debug only)
    /// Every reserved slice must have been uploaded and every reserved
    /// staging byte consumed, matching `R_VkImageUploadEnd`'s
    /// `slices.cursor == slices.end` / `staging.cursor <= image_size`
    /// asserts (vk_image.c:492-500).
    pub fn end(&mut self, img: &mut Image) {
        let slot_idx = img.upload_slot.expect("end without begin");
        let slot = &self.slots[slot_idx];
        let slices_uploaded = self.copies.len() - slot.slices_begin;
        debug_assert_eq!(
            slices_uploaded, slot.slices_end,
            "image upload ended with {} of {} slices written",
            slices_uploaded, slot.slices_end
        );
        debug_assert!(
            slot.staging_cursor <= slot.staging_size,
            "image upload wrote past its reserved staging range"
        );
    }

    /// Drop a pending upload without issuing its copies (e.g. the image
    /// was deleted before its upload ever ran).
    pub fn cancel(&mut self, img: &mut Image) {
        if img.upload_slot.is_none() {
            return;
        }
        img.upload_slot = None;
    }

    /// Phase 1: barrier every pending image to `TRANSFER_DST_OPTIMAL`.
    /// Phase 2: one `vkCmdCopyBufferToImage` per image with every
    /// queued slice. Phase 3: barrier every image to
    /// `SHADER_READ_ONLY_OPTIMAL` at `dst_stage`. No-op if the queue is
    /// empty.
    pub fn commit(
        &mut self,
        device: &ash::Device,
        pool: &mut CombufPool,
        combuf: &Combuf,
        staging_buffer: vk::Buffer,
        dst_stage: vk::PipelineStageFlags2,
    ) {
        if self.slots.is_empty() {
            return;
        }

        let scope_begin = pool.scope_begin(combuf, self.gpu_scope_id);

        let range_for = |img: &Image| vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: img.mips,
            base_array_layer: 0,
            layer_count: img.layers,
        };

        let to_transfer: Vec<vk::ImageMemoryBarrier2> = self
            .slots
            .iter()
            .map(|s| {
                let img = unsafe { &*s.image_ptr };
                vk::ImageMemoryBarrier2::builder()
                    .image(img.image)
                    .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                    .src_access_mask(vk::AccessFlags2::empty())
                    .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                    .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .subresource_range(range_for(img))
                    .build()
            })
            .collect();
        pool.raw_image_barriers(combuf, &to_transfer);

        for (i, slot) in self.slots.iter().enumerate() {
            let img = unsafe { &*slot.image_ptr };
            let end = if i + 1 < self.slots.len() {
                self.slots[i + 1].slices_begin
            } else {
                self.copies.len()
            };
            let regions = &self.copies[slot.slices_begin..end];
            if regions.is_empty() {
                continue;
            }
            unsafe {
                device.cmd_copy_buffer_to_image(
                    combuf.cmdbuf,
                    staging_buffer,
                    img.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    regions,
                );
            }
        }

        let to_shader_read: Vec<vk::ImageMemoryBarrier2> = self
            .slots
            .iter()
            .map(|s| {
                let img = unsafe { &mut *s.image_ptr };
                img.upload_slot = None;
                vk::ImageMemoryBarrier2::builder()
                    .image(img.image)
                    .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                    .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(vk::AccessFlags2::SHADER_SAMPLED_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .subresource_range(range_for(img))
                    .build()
            })
            .collect();
        pool.raw_image_barriers(combuf, &to_shader_read);

        pool.scope_end(combuf, scope_begin, vk::PipelineStageFlags2::TRANSFER);

        self.slots.clear();
        self.copies.clear();
    }
}
