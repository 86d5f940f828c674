//! Triangle storage shared by the intersection services.
//!
//! Uses the Möller-Trumbore algorithm for ray-triangle intersection.

use ember_core::PreconditionError;
use ember_math::{Aabb, Vec3};

/// Determinant threshold below which a ray counts as parallel to the triangle.
const PARALLEL_EPSILON: f32 = 1e-8;

/// Padding for thin dimensions of axis-aligned triangles.
const BOUNDS_PADDING: f32 = 1e-4;

/// A triangle hit: distance and the weights of vertices 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
}

/// Flattened triangles with precomputed edges.
#[derive(Debug, Clone)]
pub struct TriangleSet {
    v0: Vec<Vec3>,
    edge1: Vec<Vec3>,
    edge2: Vec<Vec3>,
    masks: Vec<u32>,
}

impl TriangleSet {
    /// `positions` holds three vertices per triangle, `masks` one label per triangle.
    pub fn new(positions: &[Vec3], masks: &[u32]) -> Result<Self, PreconditionError> {
        if positions.len() != masks.len() * 3 {
            return Err(PreconditionError::GeometryMismatch {
                positions: positions.len(),
                triangles: masks.len(),
            });
        }

        let count = masks.len();
        let mut v0 = Vec::with_capacity(count);
        let mut edge1 = Vec::with_capacity(count);
        let mut edge2 = Vec::with_capacity(count);
        for tri in positions.chunks_exact(3) {
            v0.push(tri[0]);
            edge1.push(tri[1] - tri[0]);
            edge2.push(tri[2] - tri[0]);
        }

        Ok(Self {
            v0,
            edge1,
            edge2,
            masks: masks.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn mask(&self, index: usize) -> u32 {
        self.masks[index]
    }

    pub fn vertices(&self, index: usize) -> [Vec3; 3] {
        let v0 = self.v0[index];
        [v0, v0 + self.edge1[index], v0 + self.edge2[index]]
    }

    /// Padded bounding box of triangle `index`.
    pub fn bounds(&self, index: usize) -> Aabb {
        let [a, b, c] = self.vertices(index);
        let tight = Aabb::from_triangle(a, b, c);
        Aabb::from_points(
            tight.min - Vec3::splat(BOUNDS_PADDING),
            tight.max + Vec3::splat(BOUNDS_PADDING),
        )
    }

    /// Möller-Trumbore intersection of triangle `index` over `(0, max_t]`.
    /// Both faces are hit.
    #[inline]
    pub fn intersect(&self, index: usize, origin: Vec3, direction: Vec3, max_t: f32) -> Option<TriangleHit> {
        let edge1 = self.edge1[index];
        let edge2 = self.edge2[index];

        let h = direction.cross(edge2);
        let a = edge1.dot(h);
        if a.abs() < PARALLEL_EPSILON {
            return None;
        }

        let f = 1.0 / a;
        let s = origin - self.v0[index];
        let u = f * s.dot(h);
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let q = s.cross(edge1);
        let v = f * direction.dot(q);
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = f * edge2.dot(q);
        (t > 0.0 && t <= max_t).then_some(TriangleHit { t, u, v })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> TriangleSet {
        let positions = [
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(0.0, 1.0, -1.0),
        ];
        TriangleSet::new(&positions, &[1]).unwrap()
    }

    #[test]
    fn test_hit_returns_vertex_weights() {
        let tris = unit_triangle();
        let hit = tris
            .intersect(0, Vec3::new(0.25, 0.5, 0.0), -Vec3::Z, f32::INFINITY)
            .unwrap();
        assert!((hit.t - 1.0).abs() < 1e-6);
        assert!((hit.u - 0.25).abs() < 1e-6);
        assert!((hit.v - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_back_face_and_range() {
        let tris = unit_triangle();
        // From behind
        assert!(tris.intersect(0, Vec3::new(0.2, 0.2, -2.0), Vec3::Z, 5.0).is_some());
        // Beyond max_t
        assert!(tris.intersect(0, Vec3::new(0.2, 0.2, 0.0), -Vec3::Z, 0.5).is_none());
        // Behind the origin
        assert!(tris.intersect(0, Vec3::new(0.2, 0.2, 0.0), Vec3::Z, 5.0).is_none());
        // Outside the edges
        assert!(tris.intersect(0, Vec3::new(0.8, 0.8, 0.0), -Vec3::Z, 5.0).is_none());
    }

    #[test]
    fn test_parallel_ray_misses() {
        let tris = unit_triangle();
        assert!(tris.intersect(0, Vec3::new(0.0, 0.0, -1.0), Vec3::X, 5.0).is_none());
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        let positions = [Vec3::ZERO; 4];
        assert_eq!(
            TriangleSet::new(&positions, &[1]).unwrap_err(),
            PreconditionError::GeometryMismatch {
                positions: 4,
                triangles: 1
            }
        );
    }
}
