//! Acceleration Structure Service contract.
//!
//! An intersector is built once from the flattened scene triangles and then
//! answers batched nearest-hit and any-hit queries over [`RayRecord`]s.
//! Rays are filtered by mask (`ray.mask & triangle.mask != 0`) and inactive
//! rays (`max_distance < 0`) always miss.

use ember_core::{InitError, NearestHit, RayRecord, ShadowHit};
use ember_math::Vec3;
use rayon::prelude::*;

use crate::triangle::TriangleSet;

pub trait Intersector: Send + Sync {
    /// Build the acceleration structure. Three positions per triangle.
    fn build(positions: &[Vec3], masks: &[u32]) -> Result<Self, InitError>
    where
        Self: Sized;

    fn triangle_count(&self) -> usize;

    /// Byte stride of the ray records this service reads.
    fn ray_stride(&self) -> u64 {
        RayRecord::STRIDE
    }

    /// Closest hit for one ray.
    fn nearest(&self, ray: &RayRecord) -> NearestHit;

    /// Any hit for one ray.
    fn any(&self, ray: &RayRecord) -> ShadowHit;

    /// Nearest-hit query for a batch. `hits[i]` receives the result for `rays[i]`.
    fn query_nearest(&self, rays: &[RayRecord], hits: &mut [NearestHit]) {
        debug_assert!(hits.len() >= rays.len());
        hits.par_iter_mut()
            .zip(rays.par_iter())
            .for_each(|(hit, ray)| *hit = self.nearest(ray));
    }

    /// Any-hit query for a batch. `hits[i]` receives the result for `rays[i]`.
    fn query_any(&self, rays: &[RayRecord], hits: &mut [ShadowHit]) {
        debug_assert!(hits.len() >= rays.len());
        hits.par_iter_mut()
            .zip(rays.par_iter())
            .for_each(|(hit, ray)| *hit = self.any(ray));
    }
}

/// Validate inputs shared by every intersector.
pub(crate) fn triangle_set(positions: &[Vec3], masks: &[u32]) -> Result<TriangleSet, InitError> {
    if masks.is_empty() {
        return Err(InitError::EmptyScene);
    }
    Ok(TriangleSet::new(positions, masks)?)
}

/// Linear scan over every triangle. Reference for testing faster services.
#[derive(Debug, Clone)]
pub struct BruteForce {
    triangles: TriangleSet,
}

impl Intersector for BruteForce {
    fn build(positions: &[Vec3], masks: &[u32]) -> Result<Self, InitError> {
        Ok(Self {
            triangles: triangle_set(positions, masks)?,
        })
    }

    fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    fn nearest(&self, ray: &RayRecord) -> NearestHit {
        if !ray.is_active() {
            return NearestHit::MISS;
        }
        let (origin, direction) = (ray.origin(), ray.direction());

        let mut best = NearestHit::MISS;
        let mut closest = ray.max_distance;
        for i in 0..self.triangles.len() {
            if self.triangles.mask(i) & ray.mask == 0 {
                continue;
            }
            if let Some(hit) = self.triangles.intersect(i, origin, direction, closest) {
                closest = hit.t;
                best = NearestHit {
                    distance: hit.t,
                    primitive_index: i as u32,
                    coordinates: [hit.u, hit.v],
                };
            }
        }
        best
    }

    fn any(&self, ray: &RayRecord) -> ShadowHit {
        if !ray.is_active() {
            return ShadowHit::CLEAR;
        }
        let (origin, direction) = (ray.origin(), ray.direction());

        (0..self.triangles.len())
            .filter(|&i| self.triangles.mask(i) & ray.mask != 0)
            .find_map(|i| self.triangles.intersect(i, origin, direction, ray.max_distance))
            .map_or(ShadowHit::CLEAR, |hit| ShadowHit { distance: hit.t })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{ray_mask, triangle_mask, Scene};

    fn cornell() -> BruteForce {
        let scene = Scene::cornell_box().unwrap();
        BruteForce::build(scene.geometry.positions(), scene.geometry.masks()).unwrap()
    }

    #[test]
    fn test_empty_scene_rejected() {
        assert!(matches!(BruteForce::build(&[], &[]), Err(InitError::EmptyScene)));
    }

    #[test]
    fn test_primary_ray_sees_light_shadow_ray_does_not() {
        let scene = Scene::cornell_box().unwrap();
        let bf = cornell();
        let up = Vec3::Y;
        let origin = Vec3::new(0.0, 1.0, 0.0);

        let primary = RayRecord::new(origin, up, ray_mask::PRIMARY, 1e30, Vec3::ONE);
        let hit = bf.nearest(&primary);
        assert!(hit.is_hit());
        assert!((hit.distance - 0.98).abs() < 1e-4);
        assert_eq!(
            scene.geometry.masks()[hit.primitive_index as usize],
            triangle_mask::LIGHT
        );

        // Shadow rays skip the light quad and stop at the ceiling behind it.
        let shadow = RayRecord::new(origin, up, ray_mask::SHADOW, 1e30, Vec3::ONE);
        let hit = bf.nearest(&shadow);
        assert!((hit.distance - 1.0).abs() < 1e-4);
        assert_eq!(
            scene.geometry.masks()[hit.primitive_index as usize],
            triangle_mask::GEOMETRY
        );
    }

    #[test]
    fn test_inactive_ray_misses() {
        let bf = cornell();
        let mut ray = RayRecord::new(Vec3::new(0.0, 1.0, 0.0), -Vec3::Y, ray_mask::PRIMARY, 1e30, Vec3::ONE);
        ray.max_distance = -1.0;
        assert_eq!(bf.nearest(&ray), NearestHit::MISS);
        assert_eq!(bf.any(&ray), ShadowHit::CLEAR);
        assert_eq!(bf.nearest(&RayRecord::inactive()), NearestHit::MISS);
    }

    #[test]
    fn test_any_hit_respects_max_distance() {
        let bf = cornell();
        let origin = Vec3::new(0.0, 1.0, 0.0);
        let short = RayRecord::new(origin, -Vec3::Y, ray_mask::SHADOW, 0.5, Vec3::ONE);
        assert!(!bf.any(&short).is_occluded());
        let long = RayRecord::new(origin, -Vec3::Y, ray_mask::SHADOW, 1.5, Vec3::ONE);
        assert!(bf.any(&long).is_occluded());
    }

    #[test]
    fn test_batched_queries_match_single() {
        let bf = cornell();
        let rays: Vec<RayRecord> = (0..16)
            .map(|i| {
                let a = i as f32 * 0.39;
                let dir = Vec3::new(a.cos(), 0.3, a.sin()).normalize();
                RayRecord::new(Vec3::new(0.0, 1.0, 0.0), dir, ray_mask::PRIMARY, 1e30, Vec3::ONE)
            })
            .collect();

        let mut hits = vec![NearestHit::default(); rays.len()];
        bf.query_nearest(&rays, &mut hits);
        let mut shadows = vec![ShadowHit::default(); rays.len()];
        bf.query_any(&rays, &mut shadows);

        for (i, ray) in rays.iter().enumerate() {
            assert_eq!(hits[i], bf.nearest(ray));
            assert_eq!(shadows[i], bf.any(ray));
        }
        assert!(hits.iter().filter(|h| h.is_hit()).count() >= 8);
    }
}
