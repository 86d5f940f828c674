// Transform utilities for Mat4
//
// glam::Mat4 already provides transform_point3() and transform_vector3().
// Normals need the inverse-transpose so they stay perpendicular to surfaces
// under non-uniform scale.

use glam::{Mat3, Mat4, Vec3};

/// Extension trait for Mat4 used when baking primitives into world space.
pub trait Mat4Ext {
    /// Transform a surface normal (inverse-transpose of the upper 3x3),
    /// returning a unit vector.
    fn transform_normal3(&self, normal: Vec3) -> Vec3;
}

impl Mat4Ext for Mat4 {
    fn transform_normal3(&self, normal: Vec3) -> Vec3 {
        let normal_matrix = Mat3::from_mat4(*self).inverse().transpose();
        (normal_matrix * normal).normalize()
    }
}
