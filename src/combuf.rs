// Command buffer pool, automatic barrier inference, and GPU timing scopes
//
// A `Combuf` is one of a small fixed pool of primary command buffers. Every
// buffer/image a recording pass touches is declared through `issue_barrier`
// rather than having the caller hand-write `VkMemoryBarrier2`s: each
// resource's last-use (stage, access, tag) is tracked on the resource
// itself, and a barrier is only emitted when the new declaration actually
// conflicts with the outstanding one.
//
// Austin Shafer - 2024
use ash::extensions::ext::CalibratedTimestamps;
use ash::extensions::khr::Synchronization2;
use ash::vk;

extern crate utils as cat5_utils;
use cat5_utils::log;

use crate::alloc::BoundedArray;
use crate::error::{CoreError, Result};

pub const MAX_GPU_SCOPES: usize = 64;
pub const MAX_COMMANDBUFFERS: usize = 6;
pub const MAX_QUERY_COUNT: usize = 128;

const BEGIN_INDEX_TAG: i32 = 0x1000_0000;

/// All write-access bits recognized by `issue_barrier`. Any access bit
/// outside this set (and outside `ACCESS_READ_BITS`) is a programmer
/// error - barriers can't be inferred for accesses we don't know how to
/// classify.
pub const ACCESS_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

pub const ACCESS_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags2::INDEX_READ.as_raw()
        | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags2::UNIFORM_READ.as_raw()
        | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw(),
);

/// Last-use tracking for one buffer. Lives embedded in `Buffer` (see
/// `buffer.rs`); `combuf_tag` is the `Combuf::tag` at the point of last
/// use so a new recording's first touch is detected without clearing
/// every resource's state every frame.
#[derive(Clone, Copy, Default)]
pub struct BufferSyncState {
    pub combuf_tag: u32,
    pub write: SyncPoint,
    pub read: SyncPoint,
}

#[derive(Clone, Copy, Default)]
pub struct SyncPoint {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// Pure barrier-decision logic, factored out of `issue_barrier` so it can
/// be unit tested without a real command buffer. Mutates `sync` to
/// record the new access and returns the `(stage, access)` to source a
/// barrier from, if one is needed.
fn classify_access(
    sync: &mut BufferSyncState,
    tag: u32,
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
) -> Option<SyncPoint> {
    let is_write = !(access & ACCESS_WRITE_BITS).is_empty();
    let is_read = !(access & ACCESS_READ_BITS).is_empty();
    debug_assert!(
        (access & !(ACCESS_WRITE_BITS | ACCESS_READ_BITS)).is_empty(),
        "unrecognized access bits in barrier declaration"
    );

    if sync.combuf_tag != tag {
        sync.combuf_tag = tag;
        sync.write = SyncPoint::default();
        sync.read = SyncPoint::default();
        if is_write {
            sync.write = SyncPoint { stage, access };
        } else {
            sync.read = SyncPoint { stage, access };
        }
        return None;
    }

    debug_assert!(is_read ^ is_write, "mixed read/write barrier declaration");

    if is_write {
        let src = SyncPoint {
            stage: sync.write.stage | sync.read.stage,
            access: sync.write.access | sync.read.access,
        };
        sync.write = SyncPoint { stage, access };

        if sync.read.stage.is_empty() {
            sync.read = SyncPoint::default();
            return None;
        }
        sync.read = SyncPoint::default();
        Some(src)
    } else {
        let already_synced = !((sync.read.access & access) != access
            && (sync.read.stage & stage) != stage);
        if already_synced {
            return None;
        }
        sync.read.access |= access;
        sync.read.stage |= stage;

        if sync.write.stage.is_empty() {
            return None;
        }
        Some(sync.write)
    }
}

/// One resource declaration passed to `issue_barrier`.
pub struct BufferBarrierDecl<'a> {
    pub buffer: vk::Buffer,
    pub sync: &'a mut BufferSyncState,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// A batch of resource declarations for one barrier point. Image barriers
/// are part of the design (layout transitions need them) but are issued
/// by `image.rs` directly via `Combuf::raw_image_barrier`, mirroring the
/// fact that the source only ever exercised the buffer path through this
/// call.
pub struct BarrierBatch<'a, 'b> {
    pub stage: vk::PipelineStageFlags2,
    pub buffers: &'a mut [BufferBarrierDecl<'b>],
}

struct Profiler {
    timestamps_offset: u32,
    scopes: BoundedArray<i32, MAX_GPU_SCOPES>,
    scopes_count: u32,
}

/// One entry in the pool of `MAX_COMMANDBUFFERS` primaries.
struct CombufSlot {
    cmdbuf: vk::CommandBuffer,
    used: bool,
    profiler: Profiler,
    tag: u32,
}

/// A registered named GPU timing scope, shared by every `Combuf` in the
/// pool so timestamp readback can resolve scope ids back to names.
#[derive(Clone, Copy)]
struct ScopeName {
    name: &'static str,
}

pub struct ScopeEntry {
    pub name: &'static str,
    pub gpu_begin_ns: u64,
    pub gpu_end_ns: u64,
}

/// A read-back view of one `Combuf`'s GPU timing scopes, already
/// converted to nanoseconds and aligned to the CPU clock.
pub struct ScopesView {
    pub entries: Vec<ScopeEntry>,
}

/// One opened recording out of the pool. Returned by `CombufPool::open`;
/// `CombufPool::close` must be called once the caller is done submitting
/// it (recording and submission are decoupled so a caller can record on
/// one thread and defer the actual queue submit).
pub struct Combuf {
    pub cmdbuf: vk::CommandBuffer,
    slot: usize,
}

pub struct CombufPool {
    pool: vk::CommandPool,
    slots: Vec<CombufSlot>,
    timestamp_pool: vk::QueryPool,
    scopes: Vec<ScopeName>,
    entire_combuf_scope_id: i32,
    tag: u32,
    sync2: Synchronization2,
    calibrated: Option<CalibratedTimestamps>,
    timestamp_period: f32,
}

impl CombufPool {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        queue_family: u32,
        timestamp_period: f32,
        has_calibrated_timestamps: bool,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_COMMANDBUFFERS as u32);
        let cmdbufs = unsafe { device.allocate_command_buffers(&alloc_info)? };

        let query_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count((MAX_QUERY_COUNT * MAX_COMMANDBUFFERS) as u32);
        let timestamp_pool = unsafe { device.create_query_pool(&query_info, None)? };

        let slots = cmdbufs
            .into_iter()
            .enumerate()
            .map(|(i, cmdbuf)| CombufSlot {
                cmdbuf,
                used: false,
                profiler: Profiler {
                    timestamps_offset: (i * MAX_QUERY_COUNT) as u32,
                    scopes: BoundedArray::new(),
                    scopes_count: 0,
                },
                tag: 0,
            })
            .collect();

        let sync2 = Synchronization2::new(instance, device);
        let calibrated = if has_calibrated_timestamps {
            Some(CalibratedTimestamps::new(instance, device))
        } else {
            None
        };

        let mut ret = Self {
            pool,
            slots,
            timestamp_pool,
            scopes: Vec::new(),
            entire_combuf_scope_id: -1,
            // tag 0 is reserved to mean "never touched"; the first real
            // tag handed to a recording is 1.
            tag: 1,
            sync2,
            calibrated,
            timestamp_period,
        };
        ret.entire_combuf_scope_id = ret.register_scope("GPU");
        Ok(ret)
    }

    /// Register a named timing scope. Returns -1 (and logs) if the
    /// registry is full; dedups by exact name match.
    pub fn register_scope(&mut self, name: &'static str) -> i32 {
        if let Some(i) = self.scopes.iter().position(|s| s.name == name) {
            return i as i32;
        }
        if self.scopes.len() == MAX_GPU_SCOPES {
            log::error!("combuf: GPU scope registry is full, dropping scope {}", name);
            return -1;
        }
        self.scopes.push(ScopeName { name });
        (self.scopes.len() - 1) as i32
    }

    /// Find the first unused slot and mark it in-use.
    pub fn open(&mut self, device: &ash::Device) -> Result<Combuf> {
        let slot_idx = self
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(CoreError::ScratchExhausted)?;

        {
            let slot = &mut self.slots[slot_idx];
            slot.used = true;
            self.tag += 1;
            if self.tag == 0 {
                self.tag = 1;
            }
            slot.tag = self.tag;
            slot.profiler.scopes_count = 0;
            slot.profiler.scopes.clear();
        }

        let cmdbuf = self.slots[slot_idx].cmdbuf;
        unsafe {
            device.reset_command_buffer(cmdbuf, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmdbuf, &begin_info)?;
            device.cmd_reset_query_pool(
                cmdbuf,
                self.timestamp_pool,
                self.slots[slot_idx].profiler.timestamps_offset,
                MAX_QUERY_COUNT as u32,
            );
        }

        let combuf = Combuf { cmdbuf, slot: slot_idx };
        self.scope_begin_inner(&combuf, self.entire_combuf_scope_id);
        Ok(combuf)
    }

    /// End the entire-combuf scope and the recording. Does not submit.
    pub fn end(&mut self, combuf: &Combuf, device: &ash::Device) -> Result<()> {
        let begin_index = 0 | BEGIN_INDEX_TAG;
        self.scope_end_inner(combuf, begin_index, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        unsafe { device.end_command_buffer(combuf.cmdbuf)? };
        Ok(())
    }

    /// Release the slot back to the pool. Must be called once the
    /// caller is fully done with `combuf` (after submission completes,
    /// or immediately if it was never submitted).
    pub fn close(&mut self, combuf: Combuf) {
        self.slots[combuf.slot].used = false;
    }

    pub fn scope_begin(&mut self, combuf: &Combuf, scope_id: i32) -> i32 {
        self.scope_begin_inner(combuf, scope_id)
    }

    fn scope_begin_inner(&mut self, combuf: &Combuf, scope_id: i32) -> i32 {
        let slot = &mut self.slots[combuf.slot];
        if scope_id < 0 || slot.profiler.scopes_count as usize == MAX_GPU_SCOPES {
            return -1;
        }

        let index = slot.profiler.scopes_count;
        slot.profiler.scopes.push(scope_id);
        let query_index = slot.profiler.timestamps_offset + index * 2;
        unsafe {
            self.sync2.cmd_write_timestamp2(
                combuf.cmdbuf,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                self.timestamp_pool,
                query_index,
            );
        }
        slot.profiler.scopes_count += 1;
        (index as i32) | BEGIN_INDEX_TAG
    }

    pub fn scope_end(&mut self, combuf: &Combuf, begin_index: i32, stage: vk::PipelineStageFlags2) {
        self.scope_end_inner(combuf, begin_index, stage)
    }

    fn scope_end_inner(&self, combuf: &Combuf, begin_index: i32, stage: vk::PipelineStageFlags2) {
        if begin_index < 0 {
            return;
        }
        debug_assert!(begin_index & BEGIN_INDEX_TAG != 0);
        let index = (begin_index & !BEGIN_INDEX_TAG) as u32;
        let slot = &self.slots[combuf.slot];
        let query_index = slot.profiler.timestamps_offset + index * 2 + 1;
        unsafe {
            self.sync2
                .cmd_write_timestamp2(combuf.cmdbuf, stage, self.timestamp_pool, query_index);
        }
    }

    /// Infer and emit the minimal set of buffer barriers needed before
    /// `batch`'s declared accesses. Mixed read+write declarations for the
    /// same buffer in one batch are a programmer error.
    pub fn issue_barrier(&self, combuf: &Combuf, batch: &mut BarrierBatch) {
        let mut buffer_barriers: Vec<vk::BufferMemoryBarrier2> = Vec::new();
        let tag = self.slots[combuf.slot].tag;

        for decl in batch.buffers.iter_mut() {
            if let Some(src) = classify_access(decl.sync, tag, decl.stage, decl.access) {
                buffer_barriers.push(
                    vk::BufferMemoryBarrier2::builder()
                        .src_stage_mask(src.stage)
                        .src_access_mask(src.access)
                        .dst_stage_mask(decl.stage)
                        .dst_access_mask(decl.access)
                        .buffer(decl.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build(),
                );
            }
        }

        if buffer_barriers.is_empty() {
            return;
        }

        let dep_info = vk::DependencyInfo::builder().buffer_memory_barriers(&buffer_barriers);
        unsafe {
            self.sync2.cmd_pipeline_barrier2(combuf.cmdbuf, &dep_info);
        }
    }

    /// A raw image barrier helper for layout transitions, used by
    /// `image.rs`. Not inferred: callers always know an image's prior
    /// layout because they own the `Image` wrapper that tracks it.
    pub fn raw_image_barrier(&self, combuf: &Combuf, barrier: vk::ImageMemoryBarrier2) {
        self.raw_image_barriers(combuf, &[barrier]);
    }

    pub fn raw_image_barriers(&self, combuf: &Combuf, barriers: &[vk::ImageMemoryBarrier2]) {
        if barriers.is_empty() {
            return;
        }
        let dep_info = vk::DependencyInfo::builder().image_memory_barriers(barriers);
        unsafe {
            self.sync2.cmd_pipeline_barrier2(combuf.cmdbuf, &dep_info);
        }
    }

    fn gpu_timestamp_offset_ns(&self, device: &ash::Device, queue_family: u32) -> i64 {
        if let Some(calibrated) = &self.calibrated {
            let domains = [
                vk::TimeDomainEXT::DEVICE,
                #[cfg(not(target_os = "windows"))]
                vk::TimeDomainEXT::CLOCK_MONOTONIC,
                #[cfg(target_os = "windows")]
                vk::TimeDomainEXT::QUERY_PERFORMANCE_COUNTER,
            ];
            let infos: Vec<vk::CalibratedTimestampInfoEXT> = domains
                .iter()
                .map(|d| vk::CalibratedTimestampInfoEXT::builder().time_domain(*d).build())
                .collect();
            if let Ok((values, _)) = unsafe { calibrated.get_calibrated_timestamps(&infos) } {
                let gpu_ticks = values[0];
                let cpu_ns = values[1];
                return cpu_ns as i64 - (gpu_ticks as f64 * self.timestamp_period as f64) as i64;
            }
        }

        let _ = (device, queue_family);
        cat5_utils::timing::get_current_nanos() as i64
    }

    /// Read back `combuf`'s recorded scopes, converting GPU ticks to
    /// nanoseconds aligned to the CPU clock. Blocks until the queries
    /// are available.
    pub fn scopes_get(
        &self,
        combuf: &Combuf,
        device: &ash::Device,
        queue_family: u32,
    ) -> Result<ScopesView> {
        let slot = &self.slots[combuf.slot];
        let timestamps_count = (slot.profiler.scopes_count * 2) as usize;
        if timestamps_count == 0 {
            return Ok(ScopesView { entries: Vec::new() });
        }

        let mut timestamps = vec![0u64; timestamps_count];
        unsafe {
            device.get_query_pool_results(
                self.timestamp_pool,
                slot.profiler.timestamps_offset,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }

        // Align GPU ticks to the CPU clock using the first scope's end
        // timestamp, matching the source's calibration anchor.
        let gpu_now = self.gpu_timestamp_offset_ns(device, queue_family);
        let offset_ns = gpu_now - (timestamps[1] as f64 * self.timestamp_period as f64) as i64;

        let tick_to_ns = |tick: u64| -> u64 {
            ((tick as f64 * self.timestamp_period as f64) as i64 + offset_ns).max(0) as u64
        };

        let entries = slot
            .profiler
            .scopes
            .iter()
            .enumerate()
            .map(|(i, scope_id)| ScopeEntry {
                name: self.scopes[*scope_id as usize].name,
                gpu_begin_ns: tick_to_ns(timestamps[i * 2]),
                gpu_end_ns: tick_to_ns(timestamps[i * 2 + 1]),
            })
            .collect();

        Ok(ScopesView { entries })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_query_pool(self.timestamp_pool, None);
            device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: u32 = 1;

    #[test]
    fn first_declaration_emits_no_barrier() {
        let mut sync = BufferSyncState::default();
        let src = classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert!(src.is_none());
    }

    #[test]
    fn write_then_read_then_redundant_read_then_write() {
        let mut sync = BufferSyncState::default();

        // First write: establishes state, no barrier.
        let b1 = classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert!(b1.is_none());

        // First read: sources the write, one barrier.
        let b2 = classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        );
        let b2 = b2.expect("read after write must emit a barrier");
        assert_eq!(b2.stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(b2.access, vk::AccessFlags2::TRANSFER_WRITE);

        // Redundant read with the same (access, stage): no barrier.
        let b3 = classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        );
        assert!(b3.is_none());

        // Final write: sources the merged read set, one barrier.
        let b4 = classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        let b4 = b4.expect("write after read must emit a barrier");
        assert_eq!(b4.stage, vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR);
        assert_eq!(b4.access, vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
    }

    #[test]
    fn new_combuf_tag_resets_state_without_a_barrier() {
        let mut sync = BufferSyncState::default();
        classify_access(
            &mut sync,
            TAG,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );

        // A new recording (different tag) sees a fresh first-touch, not
        // a write-after-write barrier against the previous recording.
        let next_tag = TAG + 1;
        let b = classify_access(
            &mut sync,
            next_tag,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert!(b.is_none());
    }
}
