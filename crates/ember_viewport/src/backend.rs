//! wgpu implementation of the frame backend.

use std::collections::VecDeque;

use ember_core::{
    FrameBackend, FrameContext, FrameError, FramePermit, InitError, Pass, PreconditionError, RayRecord,
    RendererConfig, RingLayout, Scene, SlotBytes, Viewport,
};
use wgpu::util::DeviceExt;
use wgpu::{BindGroup, Buffer, BufferUsages, CommandEncoder, ComputePipeline, SubmissionIndex, SurfaceTexture};

use crate::buffers::{allocated, RayBufferPool, RenderTargets, RingBuffers};
use crate::context::GpuContext;
use crate::intersect::GpuIntersector;
use crate::pipelines::{scratch, Pipelines};

/// Size-dependent bind groups, rebuilt on resize.
struct FrameBindings {
    generate: BindGroup,
    shade: BindGroup,
    shadow_test: BindGroup,
    accumulate: BindGroup,
    /// Indexed by the parity of the frame that writes the target
    accumulation: [BindGroup; 2],
    present: [BindGroup; 2],
}

struct SizedResources {
    viewport: Viewport,
    pool: RayBufferPool,
    _targets: RenderTargets,
    bindings: FrameBindings,
}

pub struct WgpuBackend<G: GpuIntersector> {
    context: GpuContext,
    pipelines: Pipelines,
    ring: RingBuffers,
    attributes: Buffer,
    masks: Buffer,
    intersector: G,
    sized: Option<SizedResources>,
    /// Oldest first, at most one per frame in flight
    submissions: VecDeque<SubmissionIndex>,
    max_in_flight: usize,
}

impl<G: GpuIntersector> WgpuBackend<G> {
    /// Compile pipelines and upload scene data. `config.uniform_alignment`
    /// must already satisfy the device limit.
    pub fn new(context: GpuContext, scene: &Scene, config: &RendererConfig, intersector: G) -> Result<Self, InitError> {
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

        let device = &context.device;
        let pipelines = Pipelines::new(device, context.config.format)?;

        let layout = RingLayout::new(config.max_frames_in_flight, config.uniform_alignment);
        let ring = RingBuffers::new(
            device,
            &pipelines,
            layout,
            config.bounce_count,
            config.uniform_alignment,
        )?;

        let attributes = allocated(device, "Vertex Attributes", || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Vertex Attributes"),
                contents: bytemuck::cast_slice(&geometry.vertex_attributes()),
                usage: BufferUsages::STORAGE,
            })
        })?;
        let masks = allocated(device, "Triangle Masks", || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Triangle Masks"),
                contents: bytemuck::cast_slice(geometry.masks()),
                usage: BufferUsages::STORAGE,
            })
        })?;

        log::info!(
            "wgpu backend: {} triangles, ring {} slots ({} B uniforms, {} B random)",
            geometry.triangle_count(),
            layout.slot_count,
            layout.uniform_buffer_size(),
            layout.random_buffer_size()
        );

        Ok(Self {
            context,
            pipelines,
            ring,
            attributes,
            masks,
            intersector,
            sized: None,
            submissions: VecDeque::with_capacity(config.max_frames_in_flight),
            max_in_flight: config.max_frames_in_flight,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn intersector(&self) -> &G {
        &self.intersector
    }

    /// Reconfigure the surface after it was lost or outdated.
    pub fn reconfigure_surface(&self) {
        self.context.reconfigure();
    }

    fn build_bindings(&self, pool: &RayBufferPool, targets: &RenderTargets) -> FrameBindings {
        let device = &self.context.device;
        let scratch_group = |label: &str, layout: &wgpu::BindGroupLayout, bindings: &[u32]| {
            let entries: Vec<_> = bindings
                .iter()
                .map(|&binding| {
                    let buffer = match binding {
                        scratch::RAYS => &pool.rays,
                        scratch::SHADOW_RAYS => &pool.shadow_rays,
                        scratch::HITS | scratch::SHADOW_HITS => &pool.intersections,
                        scratch::ATTRIBUTES => &self.attributes,
                        scratch::MASKS => &self.masks,
                        _ => &pool.radiance,
                    };
                    wgpu::BindGroupEntry {
                        binding,
                        resource: buffer.as_entire_binding(),
                    }
                })
                .collect();
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &entries,
            })
        };

        // Frame `p` reads target `1 - p` and writes target `p`
        let accumulation = |parity: usize| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Accumulation Bind Group"),
                layout: &self.pipelines.accumulation_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&targets.views[1 - parity]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&targets.views[parity]),
                    },
                ],
            })
        };
        let present = |parity: usize| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Present Bind Group"),
                layout: &self.pipelines.present_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&targets.views[parity]),
                }],
            })
        };

        FrameBindings {
            generate: scratch_group("Generate Bind Group", &self.pipelines.generate_layout, scratch::GENERATE),
            shade: scratch_group("Shade Bind Group", &self.pipelines.shade_layout, scratch::SHADE),
            shadow_test: scratch_group(
                "Shadow Test Bind Group",
                &self.pipelines.shadow_test_layout,
                scratch::SHADOW_TEST,
            ),
            accumulate: scratch_group(
                "Accumulate Bind Group",
                &self.pipelines.accumulate_layout,
                scratch::ACCUMULATE,
            ),
            accumulation: [accumulation(0), accumulation(1)],
            present: [present(0), present(1)],
        }
    }

    fn dispatch_kernel(
        &self,
        encoder: &mut CommandEncoder,
        ctx: &FrameContext,
        label: &str,
        pipeline: &ComputePipeline,
        bounce: u32,
        groups: &[&BindGroup],
    ) {
        let (x, y) = ctx.viewport.dispatch_grid();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, self.ring.bind_group(), &self.ring.offsets(&ctx.ticket, bounce));
        for (index, group) in groups.iter().enumerate() {
            pass.set_bind_group(index as u32 + 1, group, &[]);
        }
        pass.dispatch_workgroups(x, y, 1);
    }
}

impl<G: GpuIntersector> FrameBackend for WgpuBackend<G> {
    type Target = SurfaceTexture;
    type Encoder = CommandEncoder;

    fn resize(&mut self, viewport: Viewport) {
        self.context.resize(viewport.width(), viewport.height());

        let device = &self.context.device;
        let pool = RayBufferPool::new(device, viewport);
        let targets = RenderTargets::new(device, viewport);
        self.intersector.bind(device, &pool);
        let bindings = self.build_bindings(&pool, &targets);

        log::debug!(
            "Reallocated frame resources for {}x{} ({} rays)",
            viewport.width(),
            viewport.height(),
            pool.sizes.ray_count
        );
        self.sized = Some(SizedResources {
            viewport,
            pool,
            _targets: targets,
            bindings,
        });
    }

    fn ring_layout(&self) -> RingLayout {
        *self.ring.layout()
    }

    fn wait_for_completion(&mut self) {
        if let Some(index) = self.submissions.pop_front() {
            let _ = self.context.device.poll(wgpu::Maintain::wait_for(index));
        }
    }

    fn wait_idle(&mut self) {
        self.submissions.clear();
        let _ = self.context.device.poll(wgpu::Maintain::Wait);
    }

    fn acquire_target(&mut self) -> Result<SurfaceTexture, FrameError> {
        // Run completion callbacks that are already due
        let _ = self.context.device.poll(wgpu::Maintain::Poll);

        self.context.surface.get_current_texture().map_err(|err| match err {
            wgpu::SurfaceError::Lost => FrameError::SurfaceLost,
            wgpu::SurfaceError::Outdated => FrameError::SurfaceOutdated,
            other => FrameError::SurfaceUnavailable(other.to_string()),
        })
    }

    fn begin_frame(&mut self, ctx: &FrameContext, slot: SlotBytes<'_>) -> CommandEncoder {
        self.ring.write_slot(&self.context.queue, &ctx.ticket, slot);
        self.context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
    }

    fn encode(&mut self, encoder: &mut CommandEncoder, ctx: &FrameContext, pass: Pass, target: &SurfaceTexture) {
        let Some(sized) = &self.sized else {
            log::warn!("Pass {:?} encoded before the first resize", pass);
            return;
        };
        if sized.viewport != ctx.viewport {
            log::warn!("Pass {:?} encoded for a stale viewport", pass);
            return;
        }
        let bindings = &sized.bindings;
        let parity = ctx.accumulation_parity();
        let ray_count = sized.pool.sizes.ray_count as u32;

        match pass {
            Pass::GeneratePrimaryRays => self.dispatch_kernel(
                encoder,
                ctx,
                "Generate Primary Rays",
                &self.pipelines.generate,
                0,
                &[&bindings.generate],
            ),
            Pass::IntersectNearest { .. } => self.intersector.encode_nearest(encoder, ray_count),
            Pass::Shade { bounce } => self.dispatch_kernel(
                encoder,
                ctx,
                "Shade",
                &self.pipelines.shade,
                bounce,
                &[&bindings.shade],
            ),
            Pass::IntersectShadow { .. } => self.intersector.encode_any(encoder, ray_count),
            Pass::ShadowTest { .. } => self.dispatch_kernel(
                encoder,
                ctx,
                "Shadow Test",
                &self.pipelines.shadow_test,
                0,
                &[&bindings.shadow_test],
            ),
            Pass::Accumulate => self.dispatch_kernel(
                encoder,
                ctx,
                "Accumulate",
                &self.pipelines.accumulate,
                0,
                &[&bindings.accumulate, &bindings.accumulation[parity]],
            ),
            Pass::Present => {
                let view = target.texture.create_view(&wgpu::TextureViewDescriptor::default());
                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Present"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                render_pass.set_pipeline(&self.pipelines.present);
                render_pass.set_bind_group(0, &bindings.present[parity], &[]);
                render_pass.draw(0..3, 0..1);
            }
        }
    }

    fn submit(&mut self, encoder: CommandEncoder, target: SurfaceTexture, permit: FramePermit) -> Result<(), FrameError> {
        let queue = &self.context.queue;
        let index = queue.submit(std::iter::once(encoder.finish()));
        queue.on_submitted_work_done(move || permit.release());
        target.present();

        self.submissions.push_back(index);
        while self.submissions.len() > self.max_in_flight {
            self.submissions.pop_front();
        }
        Ok(())
    }
}
