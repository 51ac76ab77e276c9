// GPU resource & execution core for a Vulkan ray tracer
//
// This crate is the part of a ray-tracing renderer that sits below scene
// walking, shader/pipeline management, and presentation: sub-allocators,
// a staging arena, command-buffer orchestration with automatic barrier
// inference and GPU timing, buffer/image lifecycle, acceleration-structure
// building, and a named resource graph with prev-frame swapping. A host
// engine links this library, drives `GpuContext::begin_frame`/
// `submit_frame` once per frame, and owns everything this crate considers
// out of scope (image decoding, shader compilation and pipeline object
// creation, scene traversal, input, CVar parsing, profiler UI).
//
// Austin Shafer - 2024

pub mod accel;
pub mod alloc;
pub mod buffer;
pub mod combuf;
pub mod config;
pub mod context;
mod deletion_queue;
pub mod devmem;
mod device;
pub mod error;
pub mod features;
pub mod geometry;
pub mod image;
pub mod instance;
pub mod ktx2;
pub mod resources;
pub mod staging;

pub use context::{GpuContext, GpuContextCreateInfo};
pub use deletion_queue::DeletionQueue;
pub use device::Device;
pub use error::{CoreError, Result};
pub use instance::{Instance, InstanceCreateInfo};

/// Marker for anything the `DeletionQueue` can hold until its scheduled
/// timeline point has passed. There's no required behavior beyond `Drop`
/// itself; this only exists so `Box<dyn Droppable + Send + Sync>` has a
/// named trait object to be instead of `Box<dyn Any>`.
pub trait Droppable: Send + Sync {}

impl<T: Send + Sync> Droppable for T {}
