//! Bind group layouts and pipelines for the frame passes.
//!
//! Group 0 holds the per-frame ring slot and is shared by every kernel.
//! Group 1 is kernel-specific scratch. Group 2 is the accumulation
//! ping-pong pair, used only by the accumulate kernel.

use ember_core::{BounceUniform, InitError, Uniforms, RANDOM_TABLE_LEN};
use wgpu::{BindGroupLayout, BindGroupLayoutEntry, ComputePipeline, Device, RenderPipeline, ShaderStages, TextureFormat};

/// Scratch bindings in group 1 of `raytrace.wgsl`.
pub(crate) mod scratch {
    pub const RAYS: u32 = 0;
    pub const SHADOW_RAYS: u32 = 1;
    pub const HITS: u32 = 2;
    pub const SHADOW_HITS: u32 = 3;
    pub const ATTRIBUTES: u32 = 4;
    pub const MASKS: u32 = 5;
    pub const RADIANCE: u32 = 6;

    pub const GENERATE: &[u32] = &[RAYS, RADIANCE];
    pub const SHADE: &[u32] = &[RAYS, SHADOW_RAYS, HITS, ATTRIBUTES, MASKS, RADIANCE];
    pub const SHADOW_TEST: &[u32] = &[SHADOW_RAYS, SHADOW_HITS, RADIANCE];
    pub const ACCUMULATE: &[u32] = &[RADIANCE];

    /// Ray and radiance buffers are written by the kernels.
    pub fn writable(binding: u32) -> bool {
        matches!(binding, RAYS | SHADOW_RAYS | RADIANCE)
    }
}

/// Run `create` inside an error scope and report the first captured error.
pub(crate) fn scoped<T>(device: &Device, filter: wgpu::ErrorFilter, create: impl FnOnce() -> T) -> Result<T, wgpu::Error> {
    device.push_error_scope(filter);
    let value = create();
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

pub(crate) fn compiled<T>(device: &Device, label: &str, create: impl FnOnce() -> T) -> Result<T, InitError> {
    scoped(device, wgpu::ErrorFilter::Validation, create).map_err(|err| InitError::PipelineCompilation {
        label: label.to_string(),
        message: err.to_string(),
    })
}

pub(crate) fn storage_entry(binding: u32, read_only: bool, visibility: ShaderStages) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn dynamic_entry(binding: u32, ty: wgpu::BufferBindingType, size: u64) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: true,
            min_binding_size: wgpu::BufferSize::new(size),
        },
        count: None,
    }
}

fn texture_entry(binding: u32, visibility: ShaderStages) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

/// Byte size of one slot's random table as bound in group 0.
pub(crate) const RANDOM_BINDING_SIZE: u64 = (RANDOM_TABLE_LEN * std::mem::size_of::<[f32; 2]>()) as u64;

pub struct Pipelines {
    pub frame_layout: BindGroupLayout,
    pub generate_layout: BindGroupLayout,
    pub shade_layout: BindGroupLayout,
    pub shadow_test_layout: BindGroupLayout,
    pub accumulate_layout: BindGroupLayout,
    pub accumulation_layout: BindGroupLayout,
    pub present_layout: BindGroupLayout,

    pub generate: ComputePipeline,
    pub shade: ComputePipeline,
    pub shadow_test: ComputePipeline,
    pub accumulate: ComputePipeline,
    pub present: RenderPipeline,
}

impl Pipelines {
    /// Compile the kernels. Any validation error aborts with
    /// [`InitError::PipelineCompilation`].
    pub fn new(device: &Device, surface_format: TextureFormat) -> Result<Self, InitError> {
        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                dynamic_entry(0, wgpu::BufferBindingType::Uniform, Uniforms::SIZE),
                dynamic_entry(
                    1,
                    wgpu::BufferBindingType::Storage { read_only: true },
                    RANDOM_BINDING_SIZE,
                ),
                dynamic_entry(
                    2,
                    wgpu::BufferBindingType::Uniform,
                    std::mem::size_of::<BounceUniform>() as u64,
                ),
            ],
        });

        let scratch_layout = |label: &str, bindings: &[u32]| {
            let entries: Vec<_> = bindings
                .iter()
                .map(|&b| storage_entry(b, !scratch::writable(b), ShaderStages::COMPUTE))
                .collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
        };
        let generate_layout = scratch_layout("Generate Bind Group Layout", scratch::GENERATE);
        let shade_layout = scratch_layout("Shade Bind Group Layout", scratch::SHADE);
        let shadow_test_layout = scratch_layout("Shadow Test Bind Group Layout", scratch::SHADOW_TEST);
        let accumulate_layout = scratch_layout("Accumulate Bind Group Layout", scratch::ACCUMULATE);

        let accumulation_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Accumulation Bind Group Layout"),
            entries: &[
                texture_entry(0, ShaderStages::COMPUTE),
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: TextureFormat::Rgba32Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        let present_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Bind Group Layout"),
            entries: &[texture_entry(0, ShaderStages::FRAGMENT)],
        });

        let raytrace = compiled(device, "raytrace.wgsl", || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Raytrace Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/raytrace.wgsl").into()),
            })
        })?;

        let compute = |label: &str, entry_point: &str, groups: &[&BindGroupLayout]| {
            compiled(device, label, || {
                let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: groups,
                    push_constant_ranges: &[],
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module: &raytrace,
                    entry_point,
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
        };

        let generate = compute(
            "Generate Primary Rays Pipeline",
            "generate_primary_rays",
            &[&frame_layout, &generate_layout],
        )?;
        let shade = compute("Shade Pipeline", "shade", &[&frame_layout, &shade_layout])?;
        let shadow_test = compute(
            "Shadow Test Pipeline",
            "shadow_test",
            &[&frame_layout, &shadow_test_layout],
        )?;
        let accumulate = compute(
            "Accumulate Pipeline",
            "accumulate",
            &[&frame_layout, &accumulate_layout, &accumulation_layout],
        )?;

        let present = compiled(device, "Present Pipeline", || {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Present Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/present.wgsl").into()),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Present Pipeline Layout"),
                bind_group_layouts: &[&present_layout],
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Present Pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })?;

        log::info!("Compiled frame pipelines for surface format {:?}", surface_format);

        Ok(Self {
            frame_layout,
            generate_layout,
            shade_layout,
            shadow_test_layout,
            accumulate_layout,
            accumulation_layout,
            present_layout,
            generate,
            shade,
            shadow_test,
            accumulate,
            present,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_bindings_are_sorted_and_unique() {
        for set in [scratch::GENERATE, scratch::SHADE, scratch::SHADOW_TEST, scratch::ACCUMULATE] {
            assert!(set.windows(2).all(|w| w[0] < w[1]), "{set:?}");
            assert!(set.contains(&scratch::RADIANCE));
        }
    }

    #[test]
    fn test_only_ray_and_radiance_buffers_are_writable() {
        assert!(scratch::writable(scratch::RAYS));
        assert!(scratch::writable(scratch::SHADOW_RAYS));
        assert!(scratch::writable(scratch::RADIANCE));
        assert!(!scratch::writable(scratch::HITS));
        assert!(!scratch::writable(scratch::SHADOW_HITS));
        assert!(!scratch::writable(scratch::ATTRIBUTES));
        assert!(!scratch::writable(scratch::MASKS));
    }

    #[test]
    fn test_random_binding_matches_table() {
        assert_eq!(RANDOM_BINDING_SIZE, 2048);
    }
}
