//! GPU-side frame resources: the ring buffers, the ray buffer pool and the
//! accumulation targets.

use ember_core::{BounceUniform, FrameTicket, InitError, PoolSizes, RingLayout, SlotBytes, Uniforms, Viewport};
use ember_math::align_up;
use wgpu::util::DeviceExt;
use wgpu::{BindGroup, Buffer, BufferUsages, Device, Queue, Texture, TextureView};

use crate::pipelines::{scoped, Pipelines, RANDOM_BINDING_SIZE};

/// Run an allocation inside an out-of-memory scope.
pub(crate) fn allocated<T>(device: &Device, label: &str, create: impl FnOnce() -> T) -> Result<T, InitError> {
    scoped(device, wgpu::ErrorFilter::OutOfMemory, create).map_err(|err| InitError::Allocation {
        label: label.to_string(),
        message: err.to_string(),
    })
}

/// One bounce entry per aligned stride, so the shade pass selects its
/// bounce with a dynamic offset.
pub(crate) fn bounce_table(bounce_count: u32, stride: u64) -> Vec<u8> {
    let entries = bounce_count.max(1);
    let mut bytes = vec![0u8; (stride * entries as u64) as usize];
    for bounce in 0..entries {
        let entry = BounceUniform {
            bounce,
            ..Default::default()
        };
        let start = (bounce as u64 * stride) as usize;
        let src = bytemuck::bytes_of(&entry);
        bytes[start..start + src.len()].copy_from_slice(src);
    }
    bytes
}

/// Dynamic offsets for group 0 in binding order: uniforms, random, bounce.
pub(crate) fn dynamic_offsets(ticket: &FrameTicket, bounce: u32, bounce_stride: u64) -> [u32; 3] {
    [
        ticket.uniform_offset as u32,
        ticket.random_offset as u32,
        (bounce as u64 * bounce_stride) as u32,
    ]
}

/// Device copies of the frame ring. The host ring stamps a slot; the
/// backend stages those bytes at the same offsets.
pub struct RingBuffers {
    layout: RingLayout,
    uniforms: Buffer,
    random: Buffer,
    _bounce: Buffer,
    bounce_stride: u64,
    bind_group: BindGroup,
}

impl RingBuffers {
    pub fn new(
        device: &Device,
        pipelines: &Pipelines,
        layout: RingLayout,
        bounce_count: u32,
        alignment: u64,
    ) -> Result<Self, InitError> {
        let bounce_stride = align_up(std::mem::size_of::<BounceUniform>() as u64, alignment);

        let uniforms = allocated(device, "Uniform Ring", || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Uniform Ring"),
                size: layout.uniform_buffer_size(),
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        let random = allocated(device, "Random Ring", || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Random Ring"),
                size: layout.random_buffer_size(),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        let bounce = allocated(device, "Bounce Table", || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Bounce Table"),
                contents: &bounce_table(bounce_count, bounce_stride),
                usage: BufferUsages::UNIFORM,
            })
        })?;

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &pipelines.frame_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &uniforms,
                        offset: 0,
                        size: wgpu::BufferSize::new(Uniforms::SIZE),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &random,
                        offset: 0,
                        size: wgpu::BufferSize::new(RANDOM_BINDING_SIZE),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &bounce,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<BounceUniform>() as u64),
                    }),
                },
            ],
        });

        Ok(Self {
            layout,
            uniforms,
            random,
            _bounce: bounce,
            bounce_stride,
            bind_group,
        })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Stage the prepared slot. Applied before the next queue submission.
    pub fn write_slot(&self, queue: &Queue, ticket: &FrameTicket, slot: SlotBytes<'_>) {
        queue.write_buffer(&self.uniforms, ticket.uniform_offset, slot.uniforms);
        queue.write_buffer(&self.random, ticket.random_offset, slot.random);
    }

    pub fn bind_group(&self) -> &BindGroup {
        &self.bind_group
    }

    pub fn offsets(&self, ticket: &FrameTicket, bounce: u32) -> [u32; 3] {
        dynamic_offsets(ticket, bounce, self.bounce_stride)
    }
}

/// Size-dependent scratch: path rays, shadow rays, intersections and the
/// per-frame radiance target. Shadow hits reuse the intersection buffer.
pub struct RayBufferPool {
    pub sizes: PoolSizes,
    pub rays: Buffer,
    pub shadow_rays: Buffer,
    pub intersections: Buffer,
    pub radiance: Buffer,
}

impl RayBufferPool {
    pub fn new(device: &Device, viewport: Viewport) -> Self {
        let sizes = PoolSizes::for_viewport(viewport);
        let storage = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        Self {
            rays: storage("Ray Buffer", sizes.primary_rays),
            shadow_rays: storage("Shadow Ray Buffer", sizes.shadow_rays),
            intersections: storage("Intersection Buffer", sizes.intersections),
            radiance: storage("Radiance Buffer", sizes.render_target),
            sizes,
        }
    }
}

/// Ping-pong pair of running averages. Frame `p` writes target `p % 2`
/// and reads the other.
pub struct RenderTargets {
    _textures: [Texture; 2],
    pub views: [TextureView; 2],
}

impl RenderTargets {
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

    pub fn new(device: &Device, viewport: Viewport) -> Self {
        let create = |label: &str| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: viewport.width(),
                    height: viewport.height(),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: Self::FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        };
        let textures = [create("Accumulation Target 0"), create("Accumulation Target 1")];
        let views = [
            textures[0].create_view(&wgpu::TextureViewDescriptor::default()),
            textures[1].create_view(&wgpu::TextureViewDescriptor::default()),
        ];
        Self {
            _textures: textures,
            views,
        }
    }
}
