// Re-export glam for convenience
pub use glam::*;

// Ember math types
mod aabb;
mod ray;
mod transform;

pub use aabb::Aabb;
pub use ray::Ray;
pub use transform::Mat4Ext;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of `block`-sized tiles needed to cover `extent`.
#[inline]
pub const fn div_ceil(extent: u32, block: u32) -> u32 {
    extent.div_ceil(block)
}
