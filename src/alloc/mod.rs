// L0: sub-allocators shared by every layer above
//
// Austin Shafer - 2024
pub mod bounded;
pub mod int_pool;
pub mod range;
pub mod ring;

pub use bounded::BoundedArray;
pub use int_pool::IntPool;
pub use range::{Range, RangeAllocator};
pub use ring::{RingAllocator, ALLOC_FAILED};
