use crate::Vec3;

/// A ray in 3D space with origin, direction, and a maximum hit distance.
///
/// `max_distance` bounds intersection queries. A negative value marks the
/// ray as inactive: it never hits anything.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub max_distance: f32,
}

impl Ray {
    /// Create a new ray.
    pub fn new(origin: Vec3, direction: Vec3, max_distance: f32) -> Self {
        Self {
            origin,
            direction,
            max_distance,
        }
    }

    /// Create an unbounded ray.
    pub fn unbounded(origin: Vec3, direction: Vec3) -> Self {
        Self::new(origin, direction, f32::INFINITY)
    }

    /// Whether intersection queries should consider this ray at all.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.max_distance >= 0.0
    }

    /// Get the point along the ray at parameter t.
    ///
    /// Returns: origin + t * direction
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = Ray::unbounded(Vec3::ZERO, Vec3::X);

        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(1.0), Vec3::X);
        assert_eq!(ray.at(2.0), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(-1.0), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_ray_active() {
        assert!(Ray::unbounded(Vec3::ZERO, Vec3::Y).is_active());
        assert!(Ray::new(Vec3::ZERO, Vec3::Y, 0.0).is_active());
        assert!(!Ray::new(Vec3::ZERO, Vec3::Y, -1.0).is_active());
    }
}
