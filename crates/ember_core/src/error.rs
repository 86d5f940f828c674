//! Error taxonomy for the frame pipeline.
//!
//! - [`InitError`]: fatal, construction aborts and no partial renderer exists.
//! - [`FrameError`]: transient, the frame is skipped after its resources are
//!   released.
//! - [`PreconditionError`]: programmer error, surfaced immediately.

use thiserror::Error;

use crate::ring::RingLayout;

/// Fatal errors raised while constructing a renderer.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    #[error("Failed to create surface: {0}")]
    CreateSurface(String),

    #[error("Failed to request device: {0}")]
    RequestDevice(String),

    #[error("Pipeline '{label}' failed to compile: {message}")]
    PipelineCompilation { label: String, message: String },

    #[error("Failed to allocate '{label}': {message}")]
    Allocation { label: String, message: String },

    #[error("Scene contains no triangles")]
    EmptyScene,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

/// Per-frame failures. The frame is skipped; the next one proceeds normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("No drawable surface available: {0}")]
    SurfaceUnavailable(String),

    #[error("Surface lost")]
    SurfaceLost,

    #[error("Surface outdated")]
    SurfaceOutdated,

    #[error("Device queue unavailable: {0}")]
    DeviceLost(String),
}

impl FrameError {
    /// Whether the surface must be reconfigured before the next frame.
    pub fn needs_reconfigure(&self) -> bool {
        matches!(self, FrameError::SurfaceLost | FrameError::SurfaceOutdated)
    }
}

/// Violated caller contracts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("Degenerate viewport size {width}x{height}")]
    DegenerateViewport { width: u32, height: u32 },

    #[error("Viewport {width}x{height} exceeds the {max} pixel limit per side")]
    ViewportTooLarge { width: u32, height: u32, max: u32 },

    #[error("{record} stride mismatch: host layout is {host} bytes, intersection service expects {service}")]
    StrideMismatch {
        record: &'static str,
        host: u64,
        service: u64,
    },

    #[error("draw_frame called before the first resize")]
    NotResized,

    #[error("Ring slot {slot} out of range (slot count {slot_count})")]
    SlotOutOfRange { slot: usize, slot_count: usize },

    #[error("Geometry arrays disagree: {positions} positions for {triangles} triangle masks")]
    GeometryMismatch { positions: usize, triangles: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend ring layout {backend:?} does not match the scheduler's {scheduler:?}")]
    RingLayoutMismatch { scheduler: RingLayout, backend: RingLayout },
}

/// Errors loading a [`RendererConfig`](crate::RendererConfig) file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] PreconditionError),
}

pub type InitResult<T> = Result<T, InitError>;
