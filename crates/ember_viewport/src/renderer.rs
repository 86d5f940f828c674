//! Window-facing renderer: owns the scheduler over the wgpu backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use ember_core::{FrameOutcome, FrameScheduler, FrameStats, RendererConfig, Scene};
use winit::window::Window;

use crate::backend::WgpuBackend;
use crate::context::GpuContext;
use crate::intersect::ComputeBvhIntersector;

pub type WgpuScheduler = FrameScheduler<WgpuBackend<ComputeBvhIntersector>>;

pub struct Renderer {
    scheduler: WgpuScheduler,
    pub size: (u32, u32),

    // Stats
    pub fps: f32,
    frame_count: u32,
    fps_update_timer: f32,
}

impl Renderer {
    /// Create a renderer for `window` drawing `scene`.
    pub async fn new(window: Arc<Window>, scene: Scene, config: RendererConfig) -> Result<Self> {
        let size = window.inner_size();
        let context = GpuContext::new(window).await?;

        // Random table offsets share the ring's alignment
        let alignment = config
            .uniform_alignment
            .max(context.uniform_alignment())
            .max(context.storage_alignment());
        let config = config.with_uniform_alignment(alignment);

        let intersector = ComputeBvhIntersector::new(&context.device, &scene.geometry)?;
        let backend = WgpuBackend::new(context, &scene, &config, intersector)?;
        let scheduler = FrameScheduler::new(backend, &scene, config)?;

        let mut renderer = Self {
            scheduler,
            size: (size.width, size.height),
            fps: 0.0,
            frame_count: 0,
            fps_update_timer: 0.0,
        };
        renderer.resize(renderer.size)?;
        Ok(renderer)
    }

    /// Handle window resize.
    ///
    /// A zero-sized window (minimized) is the one degenerate size not
    /// reported as an error: the resize is skipped with a warning and the
    /// previous frame resources stay in place. Any other size the scheduler
    /// rejects is returned.
    pub fn resize(&mut self, new_size: (u32, u32)) -> Result<()> {
        if new_size.0 == 0 || new_size.1 == 0 {
            log::warn!("Ignoring resize to {}x{} (window minimized)", new_size.0, new_size.1);
            return Ok(());
        }
        self.size = new_size;
        self.scheduler
            .resize(new_size.0, new_size.1)
            .context("Failed to resize frame resources")?;
        Ok(())
    }

    /// Draw one frame. Skipped frames are logged and the surface is
    /// reconfigured when it was lost or outdated.
    pub fn render(&mut self) -> Result<FrameOutcome> {
        let outcome = self.scheduler.draw_frame()?;
        if let FrameOutcome::Skipped(err) = &outcome {
            if err.needs_reconfigure() {
                log::info!("{}, reconfiguring", err);
                self.scheduler.backend().reconfigure_surface();
            } else {
                log::warn!("Frame skipped: {}", err);
            }
        }
        Ok(outcome)
    }

    /// Samples accumulated since the last resize.
    pub fn samples(&self) -> u32 {
        self.scheduler.frame_index()
    }

    pub fn stats(&self) -> FrameStats {
        self.scheduler.stats()
    }

    pub fn config(&self) -> &RendererConfig {
        self.scheduler.config()
    }

    /// Wait for every in-flight frame. Call before the window goes away.
    pub fn drain(&mut self) {
        self.scheduler.drain();
    }

    pub fn update_fps(&mut self, delta_time: f32) {
        self.frame_count += 1;
        self.fps_update_timer += delta_time;

        // Update FPS every 0.5 seconds
        if self.fps_update_timer >= 0.5 {
            self.fps = self.frame_count as f32 / self.fps_update_timer;
            self.frame_count = 0;
            self.fps_update_timer = 0.0;
        }
    }
}
