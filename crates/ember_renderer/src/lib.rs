//! Ember Renderer - CPU reference backend.
//!
//! Provides the acceleration structure service ([`Bvh`], [`BruteForce`])
//! behind the [`Intersector`] contract, CPU versions of the compute kernels,
//! and [`CpuBackend`], a [`FrameBackend`](ember_core::FrameBackend) that
//! runs whole frames on a worker thread. Used for offline renders and for
//! testing the frame pipeline without a GPU.

mod backend;
mod bvh;
mod intersector;
pub mod kernels;
mod output;
pub mod sampling;
mod triangle;

pub use backend::{CommandList, CpuBackend, SurfaceFrame};
pub use bvh::{Bvh, BvhNode, MAX_STACK_DEPTH};
pub use intersector::{BruteForce, Intersector};
pub use output::{linear_to_gamma, save_png, to_rgba8, OutputError};
pub use triangle::{TriangleHit, TriangleSet};

use ember_core::{FrameScheduler, InitError, RendererConfig, Scene};

/// Scheduler driving the CPU backend with a BVH.
pub type CpuScheduler = FrameScheduler<CpuBackend<Bvh>>;

/// Build a CPU scheduler for `scene`.
pub fn cpu_scheduler(scene: &Scene, config: RendererConfig) -> Result<CpuScheduler, InitError> {
    let backend = CpuBackend::<Bvh>::new(scene, &config)?;
    FrameScheduler::new(backend, scene, config)
}
