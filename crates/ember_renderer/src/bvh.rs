//! Bounding Volume Hierarchy (BVH) acceleration structure.
//!
//! Binary tree over triangle centroids, built with a median split on the
//! longest centroid axis and flattened depth-first into a node array so the
//! same layout can be traversed on the CPU and uploaded to a compute kernel.

use bytemuck::{Pod, Zeroable};
use ember_core::{InitError, NearestHit, RayRecord, ShadowHit};
use ember_math::{Aabb, Ray, Vec3};

use crate::intersector::{triangle_set, Intersector};
use crate::triangle::TriangleSet;

/// Maximum primitives per leaf node before splitting.
const LEAF_MAX_SIZE: usize = 4;

/// Traversal stack depth. Median splits keep trees far shallower.
pub const MAX_STACK_DEPTH: usize = 64;

/// Flattened BVH node, laid out for GPU storage buffers.
///
/// Interior nodes (`count == 0`): the left child is the next node in the
/// array, `left_or_first` is the right child. Leaves: `left_or_first` is the
/// first entry in the primitive index array.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub min: [f32; 3],
    pub left_or_first: u32,
    pub max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    pub const STRIDE: u64 = std::mem::size_of::<BvhNode>() as u64;

    fn leaf(bounds: Aabb, first: usize, count: usize) -> Self {
        Self {
            min: bounds.min.to_array(),
            left_or_first: first as u32,
            max: bounds.max.to_array(),
            count: count as u32,
        }
    }

    fn interior(bounds: Aabb, right: usize) -> Self {
        Self {
            min: bounds.min.to_array(),
            left_or_first: right as u32,
            max: bounds.max.to_array(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: Vec3::from_array(self.min),
            max: Vec3::from_array(self.max),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bvh {
    triangles: TriangleSet,
    nodes: Vec<BvhNode>,
    indices: Vec<u32>,
}

impl Bvh {
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// Triangle indices referenced by leaf ranges.
    pub fn primitive_indices(&self) -> &[u32] {
        &self.indices
    }

    /// Longest root-to-leaf path, counted in nodes.
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[BvhNode], index: usize) -> usize {
            let node = &nodes[index];
            if node.is_leaf() {
                1
            } else {
                1 + walk(nodes, index + 1).max(walk(nodes, node.left_or_first as usize))
            }
        }
        walk(&self.nodes, 0)
    }

    fn build_recursive(&mut self, centroids: &[Vec3], start: usize, end: usize) -> usize {
        let node_index = self.nodes.len();
        self.nodes.push(BvhNode::default());

        let bounds = self.indices[start..end]
            .iter()
            .fold(Aabb::EMPTY, |acc, &i| Aabb::surrounding(&acc, &self.triangles.bounds(i as usize)));

        let count = end - start;
        if count <= LEAF_MAX_SIZE {
            self.nodes[node_index] = BvhNode::leaf(bounds, start, count);
            return node_index;
        }

        // Choose split axis based on centroid spread
        let mut centroid_bounds = Aabb::EMPTY;
        for &i in &self.indices[start..end] {
            centroid_bounds.grow(centroids[i as usize]);
        }
        let axis = centroid_bounds.longest_axis();

        self.indices[start..end].sort_unstable_by(|&a, &b| {
            centroids[a as usize][axis]
                .partial_cmp(&centroids[b as usize][axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mid = start + count / 2;
        self.build_recursive(centroids, start, mid);
        let right = self.build_recursive(centroids, mid, end);

        self.nodes[node_index] = BvhNode::interior(bounds, right);
        node_index
    }

    /// Walk the tree, calling `visit` for every mask-compatible triangle in
    /// leaves the ray reaches. `visit` returns the new clip distance, or
    /// `None` to stop the traversal.
    #[inline]
    fn traverse(&self, ray: &RayRecord, mut visit: impl FnMut(usize, f32) -> Option<f32>) {
        let math_ray = Ray::new(ray.origin(), ray.direction(), ray.max_distance);
        let inv_dir = Vec3::ONE / math_ray.direction;
        let mut closest = ray.max_distance;

        let mut stack = [0u32; MAX_STACK_DEPTH];
        let mut sp = 1;
        while sp > 0 {
            sp -= 1;
            let index = stack[sp] as usize;
            let node = &self.nodes[index];
            if node.bounds().hit(&math_ray, inv_dir, closest).is_none() {
                continue;
            }

            if node.is_leaf() {
                let first = node.left_or_first as usize;
                for &prim in &self.indices[first..first + node.count as usize] {
                    let prim = prim as usize;
                    if self.triangles.mask(prim) & ray.mask == 0 {
                        continue;
                    }
                    match visit(prim, closest) {
                        Some(t) => closest = t,
                        None => return,
                    }
                }
            } else {
                debug_assert!(sp + 2 <= MAX_STACK_DEPTH);
                stack[sp] = node.left_or_first;
                stack[sp + 1] = (index + 1) as u32;
                sp += 2;
            }
        }
    }
}

impl Intersector for Bvh {
    fn build(positions: &[Vec3], masks: &[u32]) -> Result<Self, InitError> {
        let triangles = triangle_set(positions, masks)?;
        let count = triangles.len();
        let centroids: Vec<Vec3> = (0..count).map(|i| triangles.bounds(i).centroid()).collect();

        let mut bvh = Self {
            triangles,
            nodes: Vec::with_capacity(2 * count),
            indices: (0..count as u32).collect(),
        };
        bvh.build_recursive(&centroids, 0, count);

        log::info!(
            "Built BVH: {} triangles, {} nodes, depth {}",
            count,
            bvh.nodes.len(),
            bvh.depth()
        );
        Ok(bvh)
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
        self.traverse(ray, |prim, closest| {
            match self.triangles.intersect(prim, origin, direction, closest) {
                Some(hit) => {
                    best = NearestHit {
                        distance: hit.t,
                        primitive_index: prim as u32,
                        coordinates: [hit.u, hit.v],
                    };
                    Some(hit.t)
                }
                None => Some(closest),
            }
        });
        best
    }

    fn any(&self, ray: &RayRecord) -> ShadowHit {
        if !ray.is_active() {
            return ShadowHit::CLEAR;
        }
        let (origin, direction) = (ray.origin(), ray.direction());

        let mut result = ShadowHit::CLEAR;
        self.traverse(ray, |prim, closest| {
            match self.triangles.intersect(prim, origin, direction, closest) {
                Some(hit) => {
                    result = ShadowHit { distance: hit.t };
                    None
                }
                None => Some(closest),
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intersector::BruteForce;
    use ember_core::{ray_mask, Scene};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_unit(rng: &mut StdRng) -> Vec3 {
        loop {
            let v = Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let len = v.length();
            if len > 1e-3 && len <= 1.0 {
                return v / len;
            }
        }
    }

    fn random_soup(rng: &mut StdRng, count: usize) -> (Vec<Vec3>, Vec<u32>) {
        let mut positions = Vec::with_capacity(count * 3);
        let mut masks = Vec::with_capacity(count);
        for _ in 0..count {
            let center = Vec3::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0));
            for _ in 0..3 {
                positions.push(center + random_unit(rng) * 0.5);
            }
            masks.push(if rng.gen_bool(0.2) { 2 } else { 1 });
        }
        (positions, masks)
    }

    #[test]
    fn test_bvh_structure() {
        let mut rng = StdRng::seed_from_u64(11);
        let (positions, masks) = random_soup(&mut rng, 300);
        let bvh = Bvh::build(&positions, &masks).unwrap();

        let mut seen = vec![0u32; 300];
        for node in bvh.nodes() {
            if node.is_leaf() {
                assert!(node.count as usize <= LEAF_MAX_SIZE);
                let first = node.left_or_first as usize;
                for &prim in &bvh.primitive_indices()[first..first + node.count as usize] {
                    seen[prim as usize] += 1;
                    let tri = Aabb::from_triangle(
                        positions[prim as usize * 3],
                        positions[prim as usize * 3 + 1],
                        positions[prim as usize * 3 + 2],
                    );
                    let b = node.bounds();
                    assert!(b.min.cmple(tri.min).all() && b.max.cmpge(tri.max).all());
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "every triangle lands in exactly one leaf");
        assert!(bvh.depth() < MAX_STACK_DEPTH / 2);
    }

    #[test]
    fn test_single_triangle_is_leaf() {
        let positions = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let bvh = Bvh::build(&positions, &[1]).unwrap();
        assert_eq!(bvh.nodes().len(), 1);
        assert!(bvh.nodes()[0].is_leaf());

        let ray = RayRecord::new(Vec3::new(0.2, 0.2, 1.0), -Vec3::Z, 1, 1e30, Vec3::ONE);
        let hit = bvh.nearest(&ray);
        assert!((hit.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bvh_matches_brute_force_on_soup() {
        let mut rng = StdRng::seed_from_u64(5);
        let (positions, masks) = random_soup(&mut rng, 500);
        let bvh = Bvh::build(&positions, &masks).unwrap();
        let reference = BruteForce::build(&positions, &masks).unwrap();

        for _ in 0..2000 {
            let origin = Vec3::new(rng.gen_range(-8.0..8.0), rng.gen_range(-8.0..8.0), rng.gen_range(-8.0..8.0));
            let mask = [1, 2, 3][rng.gen_range(0..3)];
            let max_distance = if rng.gen_bool(0.5) { 1e30 } else { rng.gen_range(0.5..10.0) };
            let ray = RayRecord::new(origin, random_unit(&mut rng), mask, max_distance, Vec3::ONE);

            let a = bvh.nearest(&ray);
            let b = reference.nearest(&ray);
            assert_eq!(a.is_hit(), b.is_hit());
            if a.is_hit() {
                assert!((a.distance - b.distance).abs() < 1e-4);
            }
            assert_eq!(bvh.any(&ray).is_occluded(), reference.any(&ray).is_occluded());
        }
    }

    #[test]
    fn test_bvh_matches_brute_force_in_cornell_box() {
        let scene = Scene::cornell_box().unwrap();
        let geometry = &scene.geometry;
        let bvh = Bvh::build(geometry.positions(), geometry.masks()).unwrap();
        let reference = BruteForce::build(geometry.positions(), geometry.masks()).unwrap();
        assert_eq!(bvh.triangle_count(), geometry.triangle_count());

        let mut rng = StdRng::seed_from_u64(8);
        let rays: Vec<RayRecord> = (0..1000)
            .map(|_| {
                let origin = Vec3::new(rng.gen_range(-0.9..0.9), rng.gen_range(0.1..1.9), rng.gen_range(-0.9..0.9));
                let mask = if rng.gen_bool(0.5) { ray_mask::PRIMARY } else { ray_mask::SHADOW };
                RayRecord::new(origin, random_unit(&mut rng), mask, 1e30, Vec3::ONE)
            })
            .collect();

        let mut fast = vec![NearestHit::default(); rays.len()];
        let mut slow = vec![NearestHit::default(); rays.len()];
        bvh.query_nearest(&rays, &mut fast);
        reference.query_nearest(&rays, &mut slow);
        for (a, b) in fast.iter().zip(&slow) {
            assert_eq!(a.is_hit(), b.is_hit());
            if a.is_hit() {
                assert!((a.distance - b.distance).abs() < 1e-4);
            }
        }
    }
}
