//! Sampling helpers shared by the CPU kernels. The WGSL kernels implement
//! the same functions so both backends draw identical sample patterns.

use std::f32::consts::PI;

use ember_core::{LightUniform, RANDOM_TABLE_LEN, RANDOM_TILE_SIZE};
use ember_math::{Vec2, Vec3};

/// Stand-in for an unbounded ray (WGSL has no infinity literal).
pub const MAX_RAY_DISTANCE: f32 = 1.0e30;

/// Offset along the normal for rays leaving a surface.
pub const SURFACE_EPSILON: f32 = 1.0e-3;

/// Table stride between sample streams; coprime with the table length.
const STREAM_STRIDE: u32 = 67;

/// Stream for the primary-ray jitter.
pub const PRIMARY_STREAM: u32 = 0;

/// Stream for the light-position sample of `bounce`.
#[inline]
pub fn light_stream(bounce: u32) -> u32 {
    1 + 2 * bounce
}

/// Stream for the hemisphere direction of `bounce`.
#[inline]
pub fn direction_stream(bounce: u32) -> u32 {
    2 + 2 * bounce
}

/// Integer avalanche hash (lowbias32).
#[inline]
pub fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Top 24 bits of `h` as a float in [0, 1).
#[inline]
fn to_unit(h: u32) -> f32 {
    (h >> 8) as f32 / 16_777_216.0
}

/// Random pair for pixel `(x, y)` and sample stream `stream`.
///
/// Pixels of a 16x16 tile read distinct table entries; each tile and stream
/// gets its own Cranley-Patterson rotation so neighbouring tiles and
/// successive bounces decorrelate.
pub fn sample_pair(random: &[[f32; 2]], x: u32, y: u32, blocks_wide: u32, stream: u32) -> Vec2 {
    let tile_len = RANDOM_TILE_SIZE;
    let index = ((y % tile_len) * tile_len + (x % tile_len) + STREAM_STRIDE * stream) as usize % RANDOM_TABLE_LEN;
    let tile = (y / tile_len) * blocks_wide + x / tile_len;

    let h1 = hash(tile ^ hash(stream.wrapping_add(0x9e37_79b9)));
    let h2 = hash(h1);
    let r = Vec2::from(random[index]) + Vec2::new(to_unit(h1), to_unit(h2));
    r - r.floor()
}

/// Cosine-weighted direction about the unit `normal`.
pub fn cosine_hemisphere(normal: Vec3, u: Vec2) -> Vec3 {
    let phi = 2.0 * PI * u.x;
    let cos_theta = u.y.sqrt();
    let sin_theta = (1.0 - u.y).max(0.0).sqrt();
    let (tangent, bitangent) = normal.any_orthonormal_pair();
    (tangent * (phi.cos() * sin_theta) + bitangent * (phi.sin() * sin_theta) + normal * cos_theta).normalize()
}

/// A point sampled on the area light as seen from a surface point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    /// Unit direction from the surface to the light point
    pub direction: Vec3,
    pub distance: f32,
    pub radiance: Vec3,
}

/// Sample the light quad uniformly and evaluate its radiance at `surface`.
pub fn sample_area_light(light: &LightUniform, surface: Vec3, u: Vec2) -> LightSample {
    let point = Vec3::from_array(light.position)
        + Vec3::from_array(light.right) * (2.0 * u.x - 1.0)
        + Vec3::from_array(light.up) * (2.0 * u.y - 1.0);

    let offset = point - surface;
    let distance = offset.length();
    let direction = offset / distance;
    let facing = (-direction).dot(Vec3::from_array(light.forward)).clamp(0.0, 1.0);
    let radiance = Vec3::from_array(light.color) * facing / (distance * distance);

    LightSample {
        direction,
        distance,
        radiance,
    }
}

/// Distance at which a ray hits the emitting side of the light quad.
pub fn intersect_light(light: &LightUniform, origin: Vec3, direction: Vec3) -> Option<f32> {
    let forward = Vec3::from_array(light.forward);
    let denom = direction.dot(forward);
    if denom >= -1e-6 {
        return None;
    }

    let center = Vec3::from_array(light.position);
    let t = (center - origin).dot(forward) / denom;
    if t <= 0.0 {
        return None;
    }

    let local = origin + direction * t - center;
    let right = Vec3::from_array(light.right);
    let up = Vec3::from_array(light.up);
    let s = local.dot(right) / right.length_squared();
    let w = local.dot(up) / up.length_squared();
    (s.abs() <= 1.0 && w.abs() <= 1.0).then_some(t)
}
