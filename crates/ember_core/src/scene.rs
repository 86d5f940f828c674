//! Geometry Store: declarative scene construction.
//!
//! Scenes are composed of unit cubes placed by affine transforms. Each box
//! selects which faces to emit, a color, a normal convention and a
//! classification mask. The flattened arrays are built once and never
//! mutated afterwards; the acceleration structure consumes them at startup.

use std::ops::BitOr;

use ember_math::{Aabb, Mat4, Mat4Ext, Vec3};

use crate::error::InitError;
use crate::layout::{triangle_mask, LightUniform, VertexAttributes};

/// Which faces of a unit cube to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceMask(u8);

impl FaceMask {
    pub const NEGATIVE_X: FaceMask = FaceMask(1 << 0);
    pub const POSITIVE_X: FaceMask = FaceMask(1 << 1);
    pub const NEGATIVE_Y: FaceMask = FaceMask(1 << 2);
    pub const POSITIVE_Y: FaceMask = FaceMask(1 << 3);
    pub const NEGATIVE_Z: FaceMask = FaceMask(1 << 4);
    pub const POSITIVE_Z: FaceMask = FaceMask(1 << 5);
    pub const ALL: FaceMask = FaceMask(0x3f);

    pub fn contains(self, other: FaceMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl BitOr for FaceMask {
    type Output = FaceMask;

    fn bitor(self, rhs: FaceMask) -> FaceMask {
        FaceMask(self.0 | rhs.0)
    }
}

/// Normal convention for a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winding {
    /// Normals point out of the box (solid objects)
    Outward,
    /// Normals point into the box (room walls, ceiling light)
    Inward,
}

/// A unit cube `[-0.5, 0.5]^3` placed in the scene.
#[derive(Debug, Clone, Copy)]
pub struct BoxPrimitive {
    pub transform: Mat4,
    pub faces: FaceMask,
    pub color: Vec3,
    pub winding: Winding,
    /// One of [`triangle_mask`] values
    pub mask: u32,
}

const CUBE_CORNERS: [Vec3; 8] = [
    Vec3::new(-0.5, -0.5, -0.5),
    Vec3::new(0.5, -0.5, -0.5),
    Vec3::new(-0.5, 0.5, -0.5),
    Vec3::new(0.5, 0.5, -0.5),
    Vec3::new(-0.5, -0.5, 0.5),
    Vec3::new(0.5, -0.5, 0.5),
    Vec3::new(-0.5, 0.5, 0.5),
    Vec3::new(0.5, 0.5, 0.5),
];

/// (face bit, outward axis, quad corners in counter-clockwise order seen from outside)
const CUBE_FACES: [(FaceMask, Vec3, [usize; 4]); 6] = [
    (FaceMask::NEGATIVE_X, Vec3::NEG_X, [0, 4, 6, 2]),
    (FaceMask::POSITIVE_X, Vec3::X, [1, 3, 7, 5]),
    (FaceMask::NEGATIVE_Y, Vec3::NEG_Y, [0, 1, 5, 4]),
    (FaceMask::POSITIVE_Y, Vec3::Y, [2, 6, 7, 3]),
    (FaceMask::NEGATIVE_Z, Vec3::NEG_Z, [0, 2, 3, 1]),
    (FaceMask::POSITIVE_Z, Vec3::Z, [4, 5, 7, 6]),
];

/// Flattened, immutable scene geometry.
///
/// `positions`, `normals` and `colors` hold three entries per triangle;
/// `masks` holds one entry per triangle.
#[derive(Debug, Clone)]
pub struct Geometry {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    colors: Vec<Vec3>,
    masks: Vec<u32>,
    bounds: Aabb,
}

impl Geometry {
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn masks(&self) -> &[u32] {
        &self.masks
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.masks.len()
    }

    /// Number of triangles carrying exactly `mask`.
    pub fn count_with_mask(&self, mask: u32) -> usize {
        self.masks.iter().filter(|&&m| m == mask).count()
    }

    /// Vertices of triangle `index`.
    pub fn triangle(&self, index: usize) -> [Vec3; 3] {
        let base = index * 3;
        [
            self.positions[base],
            self.positions[base + 1],
            self.positions[base + 2],
        ]
    }

    /// Interleaved normal/color records for upload.
    pub fn vertex_attributes(&self) -> Vec<VertexAttributes> {
        self.normals
            .iter()
            .zip(&self.colors)
            .map(|(n, c)| VertexAttributes {
                normal: n.to_array(),
                color: c.to_array(),
                ..Default::default()
            })
            .collect()
    }

    /// Positions padded to vec4 for storage-buffer upload.
    pub fn padded_positions(&self) -> Vec<[f32; 4]> {
        self.positions.iter().map(|p| p.extend(1.0).to_array()).collect()
    }
}

/// Accumulates boxes into flattened arrays.
#[derive(Debug, Default)]
pub struct GeometryBuilder {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    colors: Vec<Vec3>,
    masks: Vec<u32>,
}

impl GeometryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the selected faces of a transformed unit cube (two triangles per face).
    pub fn add_box(&mut self, primitive: &BoxPrimitive) -> &mut Self {
        let corners = CUBE_CORNERS.map(|c| primitive.transform.transform_point3(c));
        let sign = match primitive.winding {
            Winding::Outward => 1.0,
            Winding::Inward => -1.0,
        };

        for (bit, axis, quad) in CUBE_FACES {
            if !primitive.faces.contains(bit) {
                continue;
            }
            let normal = primitive.transform.transform_normal3(axis) * sign;
            let [a, b, c, d] = quad.map(|i| corners[i]);
            for triangle in [[a, b, c], [a, c, d]] {
                self.positions.extend_from_slice(&triangle);
                self.normals.extend_from_slice(&[normal; 3]);
                self.colors.extend_from_slice(&[primitive.color; 3]);
                self.masks.push(primitive.mask);
            }
        }
        self
    }

    /// Finish construction. An empty scene cannot feed an acceleration structure.
    pub fn build(self) -> Result<Geometry, InitError> {
        if self.masks.is_empty() {
            return Err(InitError::EmptyScene);
        }
        let mut bounds = Aabb::EMPTY;
        for p in &self.positions {
            bounds.grow(*p);
        }
        Ok(Geometry {
            positions: self.positions,
            normals: self.normals,
            colors: self.colors,
            masks: self.masks,
            bounds,
        })
    }
}

/// Fixed scene camera. `right`/`up` are unit vectors; the uniform builder
/// scales them by the image-plane half extents each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneCamera {
    pub position: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
}

/// Rectangular area light. `right`/`up` are half extents of the quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaLight {
    pub position: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub color: Vec3,
}

impl AreaLight {
    pub fn to_uniform(&self) -> LightUniform {
        LightUniform {
            position: self.position.to_array(),
            forward: self.forward.to_array(),
            right: self.right.to_array(),
            up: self.up.to_array(),
            color: self.color.to_array(),
            ..Default::default()
        }
    }
}

/// Geometry plus the fixed camera and light configuration.
#[derive(Debug, Clone)]
pub struct Scene {
    pub geometry: Geometry,
    pub camera: SceneCamera,
    pub light: AreaLight,
}

impl Scene {
    /// The Cornell box: three white walls, red left wall, green right wall,
    /// two rotated boxes and a square ceiling light.
    pub fn cornell_box() -> Result<Self, InitError> {
        let white = Vec3::new(0.725, 0.71, 0.68);
        let room = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)) * Mat4::from_scale(Vec3::splat(2.0));

        let mut builder = GeometryBuilder::new();
        builder
            .add_box(&BoxPrimitive {
                transform: Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))
                    * Mat4::from_scale(Vec3::new(0.5, 1.96, 0.5)),
                faces: FaceMask::POSITIVE_Y,
                color: Vec3::ONE,
                winding: Winding::Inward,
                mask: triangle_mask::LIGHT,
            })
            .add_box(&BoxPrimitive {
                transform: room,
                faces: FaceMask::NEGATIVE_Y | FaceMask::POSITIVE_Y | FaceMask::NEGATIVE_Z,
                color: white,
                winding: Winding::Inward,
                mask: triangle_mask::GEOMETRY,
            })
            .add_box(&BoxPrimitive {
                transform: room,
                faces: FaceMask::NEGATIVE_X,
                color: Vec3::new(0.63, 0.065, 0.05),
                winding: Winding::Inward,
                mask: triangle_mask::GEOMETRY,
            })
            .add_box(&BoxPrimitive {
                transform: room,
                faces: FaceMask::POSITIVE_X,
                color: Vec3::new(0.14, 0.45, 0.091),
                winding: Winding::Inward,
                mask: triangle_mask::GEOMETRY,
            })
            .add_box(&BoxPrimitive {
                transform: Mat4::from_translation(Vec3::new(0.3275, 0.3, 0.3725))
                    * Mat4::from_rotation_y(-0.3)
                    * Mat4::from_scale(Vec3::splat(0.6)),
                faces: FaceMask::ALL,
                color: white,
                winding: Winding::Outward,
                mask: triangle_mask::GEOMETRY,
            })
            .add_box(&BoxPrimitive {
                transform: Mat4::from_translation(Vec3::new(-0.335, 0.6, -0.29))
                    * Mat4::from_rotation_y(0.3)
                    * Mat4::from_scale(Vec3::new(0.6, 1.2, 0.6)),
                faces: FaceMask::ALL,
                color: white,
                winding: Winding::Outward,
                mask: triangle_mask::GEOMETRY,
            });

        let geometry = builder.build()?;
        log::info!(
            "Built scene: {} triangles ({} light, {} geometry)",
            geometry.triangle_count(),
            geometry.count_with_mask(triangle_mask::LIGHT),
            geometry.count_with_mask(triangle_mask::GEOMETRY)
        );

        Ok(Self {
            geometry,
            camera: SceneCamera {
                position: Vec3::new(0.0, 1.0, 3.38),
                forward: Vec3::NEG_Z,
                right: Vec3::X,
                up: Vec3::Y,
            },
            light: AreaLight {
                position: Vec3::new(0.0, 1.98, 0.0),
                forward: Vec3::NEG_Y,
                right: Vec3::new(0.25, 0.0, 0.0),
                up: Vec3::new(0.0, 0.0, 0.25),
                color: Vec3::splat(4.0),
            },
        })
    }
}
