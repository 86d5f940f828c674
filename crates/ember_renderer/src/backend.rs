//! CPU reference backend.
//!
//! The host side records each frame as a command list; a worker thread plays
//! the role of the device queue, executing submitted lists strictly in
//! order against device memory and releasing each frame's permit once its
//! list has run. Nothing but the worker touches device memory while frames
//! are in flight; read-back is only meaningful after the scheduler drains.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ember_core::{
    FrameBackend, FrameContext, FrameError, FramePermit, InitError, NearestHit, Pass, PoolSizes,
    PreconditionError, RayRecord, RendererConfig, RingLayout, Scene, ShadowHit, SlotBytes, Uniforms,
    VertexAttributes, Viewport, RANDOM_TABLE_LEN,
};
use ember_math::Vec4;
use parking_lot::{Condvar, Mutex};

use crate::intersector::Intersector;
use crate::kernels::{self, FrameInputs, SceneData};

/// One recorded device operation.
#[derive(Debug)]
enum Command {
    /// Staged ring-slot upload (the equivalent of a queue buffer write)
    Upload {
        uniform_offset: usize,
        uniforms: Vec<u8>,
        random_offset: usize,
        random: Vec<u8>,
    },
    Dispatch {
        pass: Pass,
        ctx: FrameContext,
    },
    Present {
        ctx: FrameContext,
        sequence: u64,
    },
}

/// Commands recorded for one frame.
#[derive(Debug, Default)]
pub struct CommandList {
    commands: Vec<Command>,
}

/// The presentation surface image handed out for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceFrame {
    pub sequence: u64,
}

struct Job {
    commands: Vec<Command>,
    permit: FramePermit,
}

/// Buffers owned by the "device".
#[derive(Default)]
struct DeviceMemory {
    uniform_ring: Vec<u32>,
    random_ring: Vec<u32>,
    rays: Vec<RayRecord>,
    shadow_rays: Vec<RayRecord>,
    /// Nearest-hit records, or shadow-hit records in the leading words
    intersections: Vec<u32>,
    radiance: Vec<Vec4>,
    accumulation: [Vec<Vec4>; 2],
    surface: Vec<Vec4>,
    presented: Option<u64>,
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

struct Device<I> {
    memory: Mutex<DeviceMemory>,
    intersector: I,
    attributes: Vec<VertexAttributes>,
    masks: Vec<u32>,
    progress: Mutex<Progress>,
    completed: Condvar,
}

impl<I: Intersector> Device<I> {
    fn execute(&self, commands: &[Command]) {
        let mut memory = self.memory.lock();
        for command in commands {
            match command {
                Command::Upload {
                    uniform_offset,
                    uniforms,
                    random_offset,
                    random,
                } => {
                    let ring: &mut [u8] = bytemuck::cast_slice_mut(memory.uniform_ring.as_mut_slice());
                    ring[*uniform_offset..*uniform_offset + uniforms.len()].copy_from_slice(uniforms);
                    let ring: &mut [u8] = bytemuck::cast_slice_mut(memory.random_ring.as_mut_slice());
                    ring[*random_offset..*random_offset + random.len()].copy_from_slice(random);
                }
                Command::Dispatch { pass, ctx } => self.dispatch(&mut memory, *pass, ctx),
                Command::Present { ctx, sequence } => {
                    let DeviceMemory {
                        accumulation,
                        surface,
                        presented,
                        ..
                    } = &mut *memory;
                    surface.copy_from_slice(&accumulation[ctx.accumulation_parity()]);
                    *presented = Some(*sequence);
                }
            }
        }
    }

    fn dispatch(&self, memory: &mut DeviceMemory, pass: Pass, ctx: &FrameContext) {
        let DeviceMemory {
            uniform_ring,
            random_ring,
            rays,
            shadow_rays,
            intersections,
            radiance,
            accumulation,
            ..
        } = memory;

        let uniform_bytes: &[u8] = bytemuck::cast_slice(uniform_ring.as_slice());
        let offset = ctx.ticket.uniform_offset as usize;
        let uniforms: &Uniforms = bytemuck::from_bytes(&uniform_bytes[offset..offset + Uniforms::SIZE as usize]);
        let random_bytes: &[u8] = bytemuck::cast_slice(random_ring.as_slice());
        let offset = ctx.ticket.random_offset as usize;
        let random: &[[f32; 2]] = bytemuck::cast_slice(&random_bytes[offset..offset + RANDOM_TABLE_LEN * 8]);

        let inputs = FrameInputs { uniforms, random };
        let scene = SceneData {
            attributes: &self.attributes,
            masks: &self.masks,
        };
        let n = ctx.viewport.pixel_count();
        let hit_words = n * (NearestHit::STRIDE as usize / 4);

        match pass {
            Pass::GeneratePrimaryRays => kernels::generate_primary_rays(&inputs, rays, radiance),
            Pass::IntersectNearest { .. } => {
                let hits: &mut [NearestHit] = bytemuck::cast_slice_mut(&mut intersections[..hit_words]);
                self.intersector.query_nearest(&rays[..n], hits);
            }
            Pass::Shade { bounce } => {
                let hits: &[NearestHit] = bytemuck::cast_slice(&intersections[..hit_words]);
                kernels::shade(bounce, &inputs, &scene, hits, rays, shadow_rays, radiance);
            }
            Pass::IntersectShadow { .. } => {
                let hits: &mut [ShadowHit] = bytemuck::cast_slice_mut(&mut intersections[..n]);
                self.intersector.query_any(&shadow_rays[..n], hits);
            }
            Pass::ShadowTest { .. } => {
                let hits: &[ShadowHit] = bytemuck::cast_slice(&intersections[..n]);
                kernels::shadow_test(n, shadow_rays, hits, radiance);
            }
            Pass::Accumulate => {
                let parity = ctx.accumulation_parity();
                let [even, odd] = accumulation;
                let (previous, next) = if parity == 0 { (&*odd, even) } else { (&*even, odd) };
                kernels::accumulate(n, ctx.ticket.frame_index, radiance, previous, next);
            }
            // Handled by the Present command, which knows the surface frame.
            Pass::Present => {}
        }
    }

    fn complete(&self) {
        let mut progress = self.progress.lock();
        progress.completed += 1;
        drop(progress);
        self.completed.notify_all();
    }
}

/// Marks the job being executed as completed when dropped, so a job that
/// panics on the queue thread still wakes waiters.
struct CompletionGuard<'a, I: Intersector>(&'a Device<I>);

impl<I: Intersector> Drop for CompletionGuard<'_, I> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("CPU queue job panicked, the queue is stopping");
        }
        self.0.complete();
    }
}

/// Frame backend executing the kernels on the CPU.
pub struct CpuBackend<I: Intersector + 'static> {
    device: Arc<Device<I>>,
    queue: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    layout: RingLayout,
    viewport: Option<Viewport>,
    surface_failures: VecDeque<FrameError>,
    sequence: u64,
}

impl<I: Intersector + 'static> CpuBackend<I> {
    /// Build the intersection service over the scene and start the device queue.
    pub fn new(scene: &Scene, config: &RendererConfig) -> Result<Self, InitError> {
        let geometry = &scene.geometry;
        let intersector = I::build(geometry.positions(), geometry.masks())?;
        Self::with_intersector(scene, intersector, config)
    }

    pub fn with_intersector(scene: &Scene, intersector: I, config: &RendererConfig) -> Result<Self, InitError> {
        config.validate()?;
        let geometry = &scene.geometry;

        if intersector.ray_stride() != RayRecord::STRIDE {
            return Err(PreconditionError::StrideMismatch {
                record: "RayRecord",
                host: RayRecord::STRIDE,
                service: intersector.ray_stride(),
            }
            .into());
        }
        if intersector.triangle_count() != geometry.triangle_count() {
            return Err(PreconditionError::GeometryMismatch {
                positions: geometry.positions().len(),
                triangles: intersector.triangle_count(),
            }
            .into());
        }

        let layout = RingLayout::new(config.max_frames_in_flight, config.uniform_alignment);
        let memory = DeviceMemory {
            uniform_ring: vec![0; (layout.uniform_buffer_size() / 4) as usize],
            random_ring: vec![0; (layout.random_buffer_size() / 4) as usize],
            ..Default::default()
        };
        let device = Arc::new(Device {
            memory: Mutex::new(memory),
            intersector,
            attributes: geometry.vertex_attributes(),
            masks: geometry.masks().to_vec(),
            progress: Mutex::new(Progress::default()),
            completed: Condvar::new(),
        });

        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_device = Arc::clone(&device);
        let worker = thread::Builder::new()
            .name("ember-cpu-queue".into())
            .spawn(move || {
                for Job { commands, permit } in receiver {
                    let _completion = CompletionGuard(&*worker_device);
                    worker_device.execute(&commands);
                    permit.release();
                }
            })
            .map_err(|e| InitError::RequestDevice(format!("failed to start CPU queue: {}", e)))?;

        let bounds = geometry.bounds();
        log::info!(
            "CPU backend ready: {} triangles within {:?}..{:?}, {} rayon threads",
            geometry.triangle_count(),
            bounds.min,
            bounds.max,
            rayon::current_num_threads()
        );

        Ok(Self {
            device,
            queue: Some(sender),
            worker: Some(worker),
            layout,
            viewport: None,
            surface_failures: VecDeque::new(),
            sequence: 0,
        })
    }

    pub fn intersector(&self) -> &I {
        &self.device.intersector
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Make the next surface acquisition fail with `error`.
    pub fn inject_surface_failure(&mut self, error: FrameError) {
        self.surface_failures.push_back(error);
    }

    /// Copy of the current frame's unaccumulated radiance.
    pub fn read_radiance(&self) -> Vec<Vec4> {
        self.device.memory.lock().radiance.clone()
    }

    /// Copy of accumulation target `parity` (frame index modulo 2).
    pub fn read_accumulation(&self, parity: usize) -> Vec<Vec4> {
        self.device.memory.lock().accumulation[parity % 2].clone()
    }

    /// Last presented image and the sequence number of the frame that produced it.
    pub fn read_surface(&self) -> Option<(Vec<Vec4>, u64)> {
        let memory = self.device.memory.lock();
        memory.presented.map(|sequence| (memory.surface.clone(), sequence))
    }

    fn wait_until(&self, done: impl Fn(&Progress) -> bool) {
        let mut progress = self.device.progress.lock();
        while !done(&progress) {
            self.device.completed.wait(&mut progress);
        }
    }
}

impl<I: Intersector + 'static> FrameBackend for CpuBackend<I> {
    type Target = SurfaceFrame;
    type Encoder = CommandList;

    fn ring_layout(&self) -> RingLayout {
        self.layout
    }

    fn resize(&mut self, viewport: Viewport) {
        let sizes = PoolSizes::for_viewport(viewport);
        let pixels = viewport.pixel_count();
        let mut memory = self.device.memory.lock();
        memory.rays = vec![RayRecord::inactive(); sizes.ray_count];
        memory.shadow_rays = vec![RayRecord::inactive(); sizes.ray_count];
        memory.intersections = vec![0; (sizes.intersections / 4) as usize];
        memory.radiance = vec![Vec4::ZERO; pixels];
        memory.accumulation = [vec![Vec4::ZERO; pixels], vec![Vec4::ZERO; pixels]];
        memory.surface = vec![Vec4::ZERO; pixels];
        memory.presented = None;
        drop(memory);

        self.viewport = Some(viewport);
        log::debug!(
            "CPU backend reallocated for {}x{}",
            viewport.width(),
            viewport.height()
        );
    }

    fn wait_for_completion(&mut self) {
        let completed = self.device.progress.lock().completed;
        self.wait_until(|p| p.completed > completed || p.completed == p.submitted);
    }

    fn wait_idle(&mut self) {
        self.wait_until(|p| p.completed == p.submitted);
    }

    fn acquire_target(&mut self) -> Result<SurfaceFrame, FrameError> {
        if let Some(err) = self.surface_failures.pop_front() {
            return Err(err);
        }
        self.sequence += 1;
        Ok(SurfaceFrame {
            sequence: self.sequence,
        })
    }

    fn begin_frame(&mut self, ctx: &FrameContext, slot: SlotBytes<'_>) -> CommandList {
        debug_assert_eq!(ctx.ticket.uniform_offset, self.layout.uniform_offset(ctx.ticket.slot));
        CommandList {
            commands: vec![Command::Upload {
                uniform_offset: ctx.ticket.uniform_offset as usize,
                uniforms: slot.uniforms.to_vec(),
                random_offset: ctx.ticket.random_offset as usize,
                random: slot.random.to_vec(),
            }],
        }
    }

    fn encode(&mut self, encoder: &mut CommandList, ctx: &FrameContext, pass: Pass, target: &SurfaceFrame) {
        let command = match pass {
            Pass::Present => Command::Present {
                ctx: *ctx,
                sequence: target.sequence,
            },
            pass => Command::Dispatch { pass, ctx: *ctx },
        };
        encoder.commands.push(command);
    }

    fn submit(&mut self, encoder: CommandList, target: SurfaceFrame, permit: FramePermit) -> Result<(), FrameError> {
        let Some(queue) = &self.queue else {
            return Err(FrameError::DeviceLost("CPU queue is shut down".into()));
        };

        log::trace!("Queueing {} commands for surface frame {}", encoder.commands.len(), target.sequence);
        self.device.progress.lock().submitted += 1;
        let job = Job {
            commands: encoder.commands,
            permit,
        };
        if let Err(mpsc::SendError(job)) = queue.send(job) {
            drop(job.permit);
            self.device.complete();
            return Err(FrameError::DeviceLost("CPU queue thread has stopped".into()));
        }
        Ok(())
    }
}

impl<I: Intersector + 'static> Drop for CpuBackend<I> {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued jobs and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("CPU queue worker panicked");
            }
        }
    }
}
