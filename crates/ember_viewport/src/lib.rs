//! Ember Viewport - wgpu frame backend and window renderer.
//!
//! Runs the frame pipeline on the GPU: WGSL compute kernels for ray
//! generation, shading, shadow testing and accumulation, a compute BVH
//! behind the [`GpuIntersector`] contract, and a full-screen present pass.

mod backend;
mod buffers;
mod context;
mod intersect;
mod pipelines;
mod renderer;

pub use backend::WgpuBackend;
pub use buffers::{RayBufferPool, RenderTargets, RingBuffers};
pub use context::GpuContext;
pub use intersect::{linear_dispatch, ComputeBvhIntersector, GpuIntersector, INTERSECT_GROUP_SIZE};
pub use pipelines::Pipelines;
pub use renderer::{Renderer, WgpuScheduler};
