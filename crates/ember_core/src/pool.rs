//! Viewport validation and size-dependent buffer sizing.
//!
//! The backends own the actual allocations; this module fixes how big
//! they are so the CPU and GPU paths agree.

use ember_math::div_ceil;

use crate::config::{MAX_VIEWPORT_EXTENT, WORKGROUP_SIZE};
use crate::error::PreconditionError;
use crate::layout::{NearestHit, RayRecord};

/// A validated output size, non-zero and at most [`MAX_VIEWPORT_EXTENT`] per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    width: u32,
    height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Result<Self, PreconditionError> {
        if width == 0 || height == 0 {
            return Err(PreconditionError::DegenerateViewport { width, height });
        }
        if width > MAX_VIEWPORT_EXTENT || height > MAX_VIEWPORT_EXTENT {
            return Err(PreconditionError::ViewportTooLarge {
                width,
                height,
                max: MAX_VIEWPORT_EXTENT,
            });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    /// Work-group grid covering the viewport with 8x8 groups.
    pub fn dispatch_grid(&self) -> (u32, u32) {
        (div_ceil(self.width, WORKGROUP_SIZE), div_ceil(self.height, WORKGROUP_SIZE))
    }
}

/// Byte sizes of the ray/intersection scratch buffers and render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub ray_count: usize,
    pub primary_rays: u64,
    pub shadow_rays: u64,
    pub intersections: u64,
    /// Radiance write target (vec4<f32> per pixel)
    pub render_target: u64,
}

impl PoolSizes {
    pub fn for_viewport(viewport: Viewport) -> Self {
        let rays = viewport.pixel_count() as u64;
        Self {
            ray_count: viewport.pixel_count(),
            primary_rays: RayRecord::STRIDE * rays,
            shadow_rays: RayRecord::STRIDE * rays,
            intersections: NearestHit::STRIDE * rays,
            render_target: 16 * rays,
        }
    }
}
