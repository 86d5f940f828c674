//! GPU record layouts shared by the host, the kernels and the
//! intersection service.
//!
//! Every struct here is `#[repr(C)]` and mirrors a WGSL struct byte for
//! byte (vec3 fields are followed by one f32/u32 of padding).

use bytemuck::{Pod, Zeroable};
use ember_math::Vec3;

/// Triangle classification masks.
pub mod triangle_mask {
    pub const GEOMETRY: u32 = 1;
    pub const LIGHT: u32 = 2;
}

/// Ray filter masks. A triangle is hit only if `ray.mask & triangle.mask != 0`.
pub mod ray_mask {
    use super::triangle_mask;

    pub const PRIMARY: u32 = triangle_mask::GEOMETRY | triangle_mask::LIGHT;
    pub const SHADOW: u32 = triangle_mask::GEOMETRY;
    pub const SECONDARY: u32 = triangle_mask::GEOMETRY;
}

/// One ray as written by ray generation / shading and read by the
/// intersection service.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RayRecord {
    pub origin: [f32; 3],
    pub mask: u32,
    pub direction: [f32; 3],
    /// Negative marks the ray inactive
    pub max_distance: f32,
    /// Path throughput (primary/bounce rays) or light contribution (shadow rays)
    pub color: [f32; 3],
    pub _pad: f32,
}

impl RayRecord {
    pub const STRIDE: u64 = std::mem::size_of::<RayRecord>() as u64;

    pub fn new(origin: Vec3, direction: Vec3, mask: u32, max_distance: f32, color: Vec3) -> Self {
        Self {
            origin: origin.to_array(),
            mask,
            direction: direction.to_array(),
            max_distance,
            color: color.to_array(),
            _pad: 0.0,
        }
    }

    /// A ray that every later stage skips.
    pub fn inactive() -> Self {
        Self {
            max_distance: -1.0,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.max_distance >= 0.0
    }

    #[inline]
    pub fn origin(&self) -> Vec3 {
        Vec3::from_array(self.origin)
    }

    #[inline]
    pub fn direction(&self) -> Vec3 {
        Vec3::from_array(self.direction)
    }

    #[inline]
    pub fn color(&self) -> Vec3 {
        Vec3::from_array(self.color)
    }
}

/// Nearest-hit result: distance, primitive index and barycentrics.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct NearestHit {
    /// Negative on miss
    pub distance: f32,
    pub primitive_index: u32,
    /// Weights of triangle vertices 1 and 2; vertex 0 gets `1 - u - v`
    pub coordinates: [f32; 2],
}

impl NearestHit {
    pub const STRIDE: u64 = std::mem::size_of::<NearestHit>() as u64;

    pub const MISS: NearestHit = NearestHit {
        distance: -1.0,
        primitive_index: 0,
        coordinates: [0.0, 0.0],
    };

    #[inline]
    pub fn is_hit(&self) -> bool {
        self.distance >= 0.0
    }

    /// Barycentric weights for vertices (0, 1, 2).
    pub fn barycentrics(&self) -> Vec3 {
        let [u, v] = self.coordinates;
        Vec3::new(1.0 - u - v, u, v)
    }
}

/// Any-hit result for shadow rays.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ShadowHit {
    /// Negative when nothing occludes the ray
    pub distance: f32,
}

impl ShadowHit {
    pub const STRIDE: u64 = std::mem::size_of::<ShadowHit>() as u64;

    pub const CLEAR: ShadowHit = ShadowHit { distance: -1.0 };

    #[inline]
    pub fn is_occluded(&self) -> bool {
        self.distance >= 0.0
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub position: [f32; 3],
    pub _pad0: f32,
    /// Scaled by the image-plane half width
    pub right: [f32; 3],
    pub _pad1: f32,
    /// Scaled by the image-plane half height
    pub up: [f32; 3],
    pub _pad2: f32,
    pub forward: [f32; 3],
    pub _pad3: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub forward: [f32; 3],
    pub _pad1: f32,
    /// Half extent along the quad's first axis
    pub right: [f32; 3],
    pub _pad2: f32,
    /// Half extent along the quad's second axis
    pub up: [f32; 3],
    pub _pad3: f32,
    pub color: [f32; 3],
    pub _pad4: f32,
}

/// Per-frame uniforms. Written once per frame into one ring slot.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    pub camera: CameraUniform,
    pub light: LightUniform,
    pub width: u32,
    pub height: u32,
    pub blocks_wide: u32,
    pub frame_index: u32,
}

impl Uniforms {
    pub const SIZE: u64 = std::mem::size_of::<Uniforms>() as u64;
}

/// Per-vertex shading attributes as uploaded for the shading kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VertexAttributes {
    pub normal: [f32; 3],
    pub _pad0: f32,
    pub color: [f32; 3],
    pub _pad1: f32,
}

/// Bounce parameters, one 256-byte aligned entry per bounce iteration.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BounceUniform {
    pub bounce: u32,
    pub _pad: [u32; 3],
}
