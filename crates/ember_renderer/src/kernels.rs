//! CPU implementations of the compute kernels.
//!
//! Each function covers one dispatch over the `width * height` pixel grid
//! and follows the same buffer contract as its WGSL counterpart in the
//! viewport crate. Pixels are processed in parallel with rayon.

use ember_core::{ray_mask, triangle_mask, NearestHit, RayRecord, ShadowHit, Uniforms, VertexAttributes};
use ember_math::{Vec2, Vec3, Vec4};
use rayon::prelude::*;

use crate::sampling::{
    cosine_hemisphere, direction_stream, intersect_light, light_stream, sample_area_light, sample_pair,
    MAX_RAY_DISTANCE, PRIMARY_STREAM, SURFACE_EPSILON,
};

/// Per-frame inputs read from the ring slot.
#[derive(Clone, Copy)]
pub struct FrameInputs<'a> {
    pub uniforms: &'a Uniforms,
    pub random: &'a [[f32; 2]],
}

impl FrameInputs<'_> {
    fn pixel_count(&self) -> usize {
        self.uniforms.width as usize * self.uniforms.height as usize
    }

    #[inline]
    fn pixel(&self, index: usize) -> (u32, u32) {
        let width = self.uniforms.width as usize;
        ((index % width) as u32, (index / width) as u32)
    }

    #[inline]
    fn sample(&self, index: usize, stream: u32) -> Vec2 {
        let (x, y) = self.pixel(index);
        sample_pair(self.random, x, y, self.uniforms.blocks_wide, stream)
    }
}

/// Read-only scene data for shading.
#[derive(Clone, Copy)]
pub struct SceneData<'a> {
    /// Three entries per triangle
    pub attributes: &'a [VertexAttributes],
    pub masks: &'a [u32],
}

/// Jittered camera ray through pixel `index`.
pub fn camera_ray(inputs: &FrameInputs<'_>, index: usize) -> RayRecord {
    let uniforms = inputs.uniforms;
    let (x, y) = inputs.pixel(index);
    let jitter = inputs.sample(index, PRIMARY_STREAM);

    let u = (x as f32 + jitter.x) / uniforms.width as f32 * 2.0 - 1.0;
    let v = 1.0 - (y as f32 + jitter.y) / uniforms.height as f32 * 2.0;

    let camera = &uniforms.camera;
    let direction = (Vec3::from_array(camera.right) * u
        + Vec3::from_array(camera.up) * v
        + Vec3::from_array(camera.forward))
    .normalize();

    RayRecord::new(
        Vec3::from_array(camera.position),
        direction,
        ray_mask::PRIMARY,
        MAX_RAY_DISTANCE,
        Vec3::ONE,
    )
}

/// Write one primary ray per pixel and seed the render target with the
/// light's radiance where the camera ray meets the light quad.
pub fn generate_primary_rays(inputs: &FrameInputs<'_>, rays: &mut [RayRecord], radiance: &mut [Vec4]) {
    let n = inputs.pixel_count();
    rays[..n]
        .par_iter_mut()
        .zip(radiance[..n].par_iter_mut())
        .enumerate()
        .for_each(|(index, (ray, out))| {
            *ray = camera_ray(inputs, index);
            let light = &inputs.uniforms.light;
            let seed = match intersect_light(light, ray.origin(), ray.direction()) {
                Some(_) => Vec3::from_array(light.color),
                None => Vec3::ZERO,
            };
            *out = seed.extend(1.0);
        });
}

/// Shade one nearest hit. Updates the path ray in place, returns the shadow
/// ray to trace. At bounce 0 the emissive seed is cleared unless the camera
/// ray really reached the light.
fn shade_pixel(
    bounce: u32,
    inputs: &FrameInputs<'_>,
    scene: &SceneData<'_>,
    index: usize,
    hit: &NearestHit,
    ray: &mut RayRecord,
    out: &mut Vec4,
) -> RayRecord {
    if !ray.is_active() {
        return RayRecord::inactive();
    }

    let reached_light = hit.is_hit() && scene.masks[hit.primitive_index as usize] & triangle_mask::LIGHT != 0;
    if bounce == 0 && !reached_light {
        *out = Vec4::new(0.0, 0.0, 0.0, 1.0);
    }
    if !hit.is_hit() || reached_light {
        *ray = RayRecord::inactive();
        return RayRecord::inactive();
    }

    let base = hit.primitive_index as usize * 3;
    let weights = hit.barycentrics();
    let vertices = &scene.attributes[base..base + 3];
    let interpolate = |f: fn(&VertexAttributes) -> [f32; 3]| {
        Vec3::from_array(f(&vertices[0])) * weights.x
            + Vec3::from_array(f(&vertices[1])) * weights.y
            + Vec3::from_array(f(&vertices[2])) * weights.z
    };
    let mut normal = interpolate(|a| a.normal).normalize();
    let surface_color = interpolate(|a| a.color);

    let direction = ray.direction();
    if normal.dot(direction) > 0.0 {
        normal = -normal;
    }
    let position = ray.origin() + direction * hit.distance;
    let origin = position + normal * SURFACE_EPSILON;
    let throughput = ray.color();

    let light = sample_area_light(
        &inputs.uniforms.light,
        position,
        inputs.sample(index, light_stream(bounce)),
    );
    let light_color = light.radiance * normal.dot(light.direction).clamp(0.0, 1.0);
    let shadow = if light_color.cmpgt(Vec3::ZERO).any() {
        RayRecord::new(
            origin,
            light.direction,
            ray_mask::SHADOW,
            light.distance - SURFACE_EPSILON,
            light_color * throughput * surface_color,
        )
    } else {
        RayRecord::inactive()
    };

    let bounce_direction = cosine_hemisphere(normal, inputs.sample(index, direction_stream(bounce)));
    *ray = RayRecord::new(
        origin,
        bounce_direction,
        ray_mask::SECONDARY,
        MAX_RAY_DISTANCE,
        throughput * surface_color,
    );
    shadow
}

/// Shading stage for one bounce.
pub fn shade(
    bounce: u32,
    inputs: &FrameInputs<'_>,
    scene: &SceneData<'_>,
    hits: &[NearestHit],
    rays: &mut [RayRecord],
    shadow_rays: &mut [RayRecord],
    radiance: &mut [Vec4],
) {
    let n = inputs.pixel_count();
    rays[..n]
        .par_iter_mut()
        .zip(shadow_rays[..n].par_iter_mut())
        .zip(radiance[..n].par_iter_mut())
        .enumerate()
        .for_each(|(index, ((ray, shadow), out))| {
            *shadow = shade_pixel(bounce, inputs, scene, index, &hits[index], ray, out);
        });
}

/// Add the contribution of every unoccluded shadow ray.
pub fn shadow_test(pixel_count: usize, shadow_rays: &[RayRecord], shadow_hits: &[ShadowHit], radiance: &mut [Vec4]) {
    radiance[..pixel_count]
        .par_iter_mut()
        .enumerate()
        .for_each(|(index, out)| {
            let shadow = &shadow_rays[index];
            if shadow.is_active() && !shadow_hits[index].is_occluded() {
                *out += shadow.color().extend(0.0);
            }
        });
}

/// Running average: `acc_k = (acc_{k-1} * k + x_k) / (k + 1)`.
pub fn accumulate(pixel_count: usize, frame_index: u32, radiance: &[Vec4], previous: &[Vec4], next: &mut [Vec4]) {
    let k = frame_index as f32;
    next[..pixel_count]
        .par_iter_mut()
        .enumerate()
        .for_each(|(index, acc)| {
            let sample = radiance[index];
            *acc = if frame_index == 0 {
                sample
            } else {
                (previous[index] * k + sample) / (k + 1.0)
            };
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intersector::{BruteForce, Intersector};
    use ember_core::{Scene, UniformBuilder, Viewport, RANDOM_TABLE_LEN};

    struct Fixture {
        scene: Scene,
        uniforms: Uniforms,
        random: Vec<[f32; 2]>,
    }

    fn fixture(width: u32, height: u32) -> Fixture {
        let scene = Scene::cornell_box().unwrap();
        let builder = UniformBuilder::new(scene.camera, scene.light, 45.0_f32.to_radians());
        let uniforms = builder.build(Viewport::new(width, height).unwrap(), 0);
        let random = (0..RANDOM_TABLE_LEN)
            .map(|i| [(i as f32 + 0.5) / 256.0, ((i * 7) % 256) as f32 / 256.0])
            .collect();
        Fixture { scene, uniforms, random }
    }

    #[test]
    fn test_camera_rays_span_image_plane() {
        let f = fixture(64, 64);
        let inputs = FrameInputs {
            uniforms: &f.uniforms,
            random: &f.random,
        };
        let top_left = camera_ray(&inputs, 0).direction();
        let bottom_right = camera_ray(&inputs, 64 * 64 - 1).direction();
        assert!(top_left.x < 0.0 && top_left.y > 0.0);
        assert!(bottom_right.x > 0.0 && bottom_right.y < 0.0);

        let ray = camera_ray(&inputs, 32 * 64 + 32);
        assert_eq!(ray.mask, ray_mask::PRIMARY);
        assert!(ray.is_active());
        assert_eq!(ray.color(), Vec3::ONE);
        assert!(ray.direction().dot(-Vec3::Z) > 0.99);
    }

    #[test]
    fn test_shade_clears_seed_on_miss_and_kills_ray() {
        let f = fixture(1, 1);
        let inputs = FrameInputs {
            uniforms: &f.uniforms,
            random: &f.random,
        };
        let attributes = f.scene.geometry.vertex_attributes();
        let scene = SceneData {
            attributes: &attributes,
            masks: f.scene.geometry.masks(),
        };

        let mut rays = [RayRecord::new(Vec3::ZERO, Vec3::Z, ray_mask::PRIMARY, 1e30, Vec3::ONE)];
        let mut shadows = [RayRecord::default()];
        let mut radiance = [Vec4::new(4.0, 4.0, 4.0, 1.0)];
        shade(0, &inputs, &scene, &[NearestHit::MISS], &mut rays, &mut shadows, &mut radiance);

        assert_eq!(radiance[0].truncate(), Vec3::ZERO);
        assert!(!rays[0].is_active());
        assert!(!shadows[0].is_active());
    }

    #[test]
    fn test_shade_floor_hit_emits_shadow_and_bounce() {
        let f = fixture(1, 1);
        let inputs = FrameInputs {
            uniforms: &f.uniforms,
            random: &f.random,
        };
        let geometry = &f.scene.geometry;
        let attributes = geometry.vertex_attributes();
        let scene = SceneData {
            attributes: &attributes,
            masks: geometry.masks(),
        };

        let origin = Vec3::new(-0.6, 1.0, 0.6);
        let mut rays = [RayRecord::new(origin, -Vec3::Y, ray_mask::PRIMARY, 1e30, Vec3::ONE)];
        let bvh = BruteForce::build(geometry.positions(), geometry.masks()).unwrap();
        let hit = bvh.nearest(&rays[0]);
        assert!((hit.distance - 1.0).abs() < 1e-4);

        let mut shadows = [RayRecord::default()];
        let mut radiance = [Vec4::new(0.0, 0.0, 0.0, 1.0)];
        shade(0, &inputs, &scene, &[hit], &mut rays, &mut shadows, &mut radiance);

        let shadow = shadows[0];
        assert!(shadow.is_active());
        assert_eq!(shadow.mask, ray_mask::SHADOW);
        assert!(shadow.direction().y > 0.0);
        assert!(shadow.color().cmpgt(Vec3::ZERO).all());

        let bounce = rays[0];
        assert!(bounce.is_active());
        assert_eq!(bounce.mask, ray_mask::SECONDARY);
        assert!(bounce.direction().y > 0.0);
        assert!(bounce.origin().y > 0.0);
        // Throughput picks up the floor color
        assert!((bounce.color() - Vec3::new(0.725, 0.71, 0.68)).length() < 1e-4);
    }

    #[test]
    fn test_shadow_test_adds_only_unoccluded() {
        let color = Vec3::new(0.5, 0.25, 0.125);
        let shadow_rays = [
            RayRecord::new(Vec3::ZERO, Vec3::Y, ray_mask::SHADOW, 1.0, color),
            RayRecord::new(Vec3::ZERO, Vec3::Y, ray_mask::SHADOW, 1.0, color),
            RayRecord::inactive(),
        ];
        let hits = [ShadowHit::CLEAR, ShadowHit { distance: 0.5 }, ShadowHit::CLEAR];
        let mut radiance = [Vec4::new(1.0, 1.0, 1.0, 1.0); 3];
        shadow_test(3, &shadow_rays, &hits, &mut radiance);

        assert_eq!(radiance[0], Vec4::new(1.5, 1.25, 1.125, 1.0));
        assert_eq!(radiance[1], Vec4::ONE);
        assert_eq!(radiance[2], Vec4::ONE);
    }

    #[test]
    fn test_accumulate_running_mean() {
        let samples = [1.0f32, 3.0, 5.0, 7.0];
        let mut acc = [Vec4::ZERO];
        let mut next = [Vec4::ZERO];
        for (k, &s) in samples.iter().enumerate() {
            accumulate(1, k as u32, &[Vec4::splat(s)], &acc, &mut next);
            acc = next;
        }
        assert!((acc[0].x - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_accumulate_frame_zero_is_identity() {
        let radiance = [Vec4::new(0.3, f32::MAX, 0.0, 1.0)];
        let previous = [Vec4::splat(f32::NAN)];
        let mut next = [Vec4::ZERO];
        accumulate(1, 0, &radiance, &previous, &mut next);
        assert_eq!(next, radiance);
    }
}
