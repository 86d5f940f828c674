//! Uniform Builder: stamps one ring slot per frame.

use ember_math::{div_ceil, Vec3};
use rand::Rng;

use crate::config::RANDOM_TILE_SIZE;
use crate::layout::{CameraUniform, Uniforms};
use crate::pool::Viewport;
use crate::ring::{FrameRing, FrameTicket};
use crate::scene::{AreaLight, SceneCamera};

/// Derives per-frame uniforms from the fixed camera/light configuration.
#[derive(Debug, Clone)]
pub struct UniformBuilder {
    camera: SceneCamera,
    light: AreaLight,
    field_of_view: f32,
}

impl UniformBuilder {
    /// `field_of_view` is the vertical field of view in radians.
    pub fn new(camera: SceneCamera, light: AreaLight, field_of_view: f32) -> Self {
        Self {
            camera,
            light,
            field_of_view,
        }
    }

    /// Image-plane half extents `(width, height)` at unit distance.
    pub fn image_plane(&self, viewport: Viewport) -> (f32, f32) {
        let half_height = (self.field_of_view * 0.5).tan();
        (viewport.aspect_ratio() * half_height, half_height)
    }

    /// Compute the uniforms for one frame.
    pub fn build(&self, viewport: Viewport, frame_index: u32) -> Uniforms {
        let (plane_width, plane_height) = self.image_plane(viewport);
        let right: Vec3 = self.camera.right * plane_width;
        let up: Vec3 = self.camera.up * plane_height;

        Uniforms {
            camera: CameraUniform {
                position: self.camera.position.to_array(),
                right: right.to_array(),
                up: up.to_array(),
                forward: self.camera.forward.to_array(),
                ..Default::default()
            },
            light: self.light.to_uniform(),
            width: viewport.width(),
            height: viewport.height(),
            blocks_wide: div_ceil(viewport.width(), RANDOM_TILE_SIZE),
            frame_index,
        }
    }

    /// Prepare step: claim the next ring slot, write its uniforms and a
    /// fresh random table. Advances the frame counter and slot index.
    pub fn prepare<R: Rng + ?Sized>(&self, ring: &mut FrameRing, viewport: Viewport, rng: &mut R) -> FrameTicket {
        let (ticket, view) = ring.claim();
        *view.uniforms = self.build(viewport, ticket.frame_index);
        for pair in view.random.iter_mut() {
            *pair = [rng.gen::<f32>(), rng.gen::<f32>()];
        }
        ticket
    }
}
