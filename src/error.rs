// Error taxonomy for the GPU resource & execution core
//
// Austin Shafer - 2024
use ash::vk;
use thiserror::Error;

/// Errors returned by this crate.
///
/// Resource exhaustion and format-support problems are recoverable by the
/// caller (skip the draw, retry after a flush, fall back to a default) and
/// are therefore typed variants rather than panics. Only a handful of
/// invariant violations (double-free, begin/end mismatch) remain asserts in
/// debug builds, matching the source's own `ASSERT`-or-no-op split.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("range allocator pool is exhausted (requested {requested} bytes)")]
    PoolExhausted { requested: u32 },

    #[error("ring allocator is exhausted (requested {requested} bytes)")]
    RingExhausted { requested: u32 },

    #[error("acceleration structure scratch buffer is exhausted")]
    ScratchExhausted,

    #[error("staging arena is exhausted (requested {requested} bytes)")]
    StagingExhausted { requested: u32 },

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("KTX2 container rejected: {0}")]
    InvalidKtx2(&'static str),

    #[error("required vulkan extensions are not available on this device")]
    ExtensionsMissing,

    #[error("no suitable physical device was found")]
    NoSuitablePhysicalDevice,

    #[error("no memory type satisfies the requested requirements and flags")]
    NoSuitableMemoryType,

    #[error("resource graph has no room for another named resource")]
    ResourceTableFull,

    #[error("existing resource image is not compatible with the requested create")]
    ImageCompatibility,

    #[error("a static BLAS cannot be updated after it has been built")]
    StaticBlasUpdate,

    #[error("BLAS grew past its initial allocation on update")]
    BlasGrewOnUpdate,

    #[error("vulkan call failed: {0:?}")]
    VulkanError(vk::Result),
}

impl From<vk::Result> for CoreError {
    fn from(r: vk::Result) -> Self {
        CoreError::VulkanError(r)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
