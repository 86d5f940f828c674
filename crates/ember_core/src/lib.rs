//! Ember Core - frame pipeline for a progressive GPU path tracer.
//!
//! This crate provides:
//!
//! - **Scene data**: the Cornell box triangle soup, camera and area light
//! - **Wire records**: ray, intersection and uniform layouts shared with the kernels
//! - **Frame pipeline**: the in-flight gate, the frame resource ring, the
//!   uniform builder and the [`FrameScheduler`] that drives a [`FrameBackend`]
//!
//! # Example
//!
//! ```ignore
//! use ember_core::{FrameScheduler, RendererConfig, Scene};
//!
//! let scene = Scene::cornell_box()?;
//! let mut scheduler = FrameScheduler::new(backend, &scene, RendererConfig::default())?;
//! scheduler.resize(800, 600)?;
//! loop {
//!     scheduler.draw_frame()?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod layout;
pub mod pool;
pub mod ring;
pub mod scene;
pub mod schedule;
pub mod uniforms;

// Re-export commonly used types
pub use config::{
    RendererConfig, MAX_FRAMES_IN_FLIGHT, MAX_UNIFORM_ALIGNMENT, MAX_VIEWPORT_EXTENT, RANDOM_TABLE_LEN,
    RANDOM_TILE_SIZE, WORKGROUP_SIZE,
};
pub use error::{ConfigError, FrameError, InitError, InitResult, PreconditionError};
pub use gate::{FrameGate, FramePermit, GateStats};
pub use layout::{
    ray_mask, triangle_mask, BounceUniform, CameraUniform, LightUniform, NearestHit, RayRecord, ShadowHit, Uniforms,
    VertexAttributes,
};
pub use pool::{PoolSizes, Viewport};
pub use ring::{FrameRing, FrameTicket, RingLayout, SlotBytes, SlotViewMut};
pub use scene::{AreaLight, BoxPrimitive, FaceMask, Geometry, GeometryBuilder, Scene, SceneCamera, Winding};
pub use schedule::{FrameBackend, FrameContext, FrameOutcome, FramePlan, FrameScheduler, FrameStats, Pass};
pub use uniforms::UniformBuilder;
