//! Acceleration structure service on the device.
//!
//! A [`GpuIntersector`] reads the pool's ray buffers and writes the
//! intersection buffer in its own compute passes, recorded into the frame's
//! command stream between the ray producer and the consumer.

use ember_core::{Geometry, InitError, RayRecord};
use ember_math::div_ceil;
use ember_renderer::{Bvh, BvhNode, Intersector};
use wgpu::util::DeviceExt;
use wgpu::{BindGroup, BindGroupLayout, BufferUsages, CommandEncoder, ComputePipeline, Device, ShaderStages};

use crate::buffers::{allocated, RayBufferPool};
use crate::pipelines::{compiled, storage_entry};

/// Threads per work group in `intersect.wgsl`.
pub const INTERSECT_GROUP_SIZE: u32 = 64;

/// Largest work-group count allowed in one dispatch dimension.
const MAX_GROUPS_PER_DIMENSION: u32 = 65_535;

/// Work-group grid covering `ray_count` rays with 1D groups, folded into a
/// second dimension once the first one is full.
pub fn linear_dispatch(ray_count: u32) -> (u32, u32) {
    let groups = div_ceil(ray_count, INTERSECT_GROUP_SIZE);
    if groups == 0 {
        return (0, 0);
    }
    let x = groups.min(MAX_GROUPS_PER_DIMENSION);
    (x, div_ceil(groups, x))
}

/// Device-side intersection service injected into the wgpu backend.
pub trait GpuIntersector {
    /// Byte stride of the ray records this service reads.
    fn ray_stride(&self) -> u64 {
        RayRecord::STRIDE
    }

    fn triangle_count(&self) -> usize;

    /// Bind the pool's ray and intersection buffers. Called after every
    /// pool reallocation.
    fn bind(&mut self, device: &Device, pool: &RayBufferPool);

    /// Nearest hit for every primary/bounce ray into the intersection buffer.
    fn encode_nearest(&self, encoder: &mut CommandEncoder, ray_count: u32);

    /// Any hit for every shadow ray into the intersection buffer.
    fn encode_any(&self, encoder: &mut CommandEncoder, ray_count: u32);
}

struct QueryBindings {
    nearest: BindGroup,
    any: BindGroup,
}

/// BVH built on the host and traversed by a compute kernel.
pub struct ComputeBvhIntersector {
    triangle_count: usize,
    scene_bind_group: BindGroup,
    nearest_layout: BindGroupLayout,
    any_layout: BindGroupLayout,
    nearest: ComputePipeline,
    any: ComputePipeline,
    queries: Option<QueryBindings>,
}

impl ComputeBvhIntersector {
    pub fn new(device: &Device, geometry: &Geometry) -> Result<Self, InitError> {
        let bvh = Bvh::build(geometry.positions(), geometry.masks())?;
        let nodes: &[BvhNode] = bvh.nodes();

        let storage = |label: &str, contents: &[u8]| {
            allocated(device, label, || {
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage: BufferUsages::STORAGE,
                })
            })
        };
        let node_buffer = storage("BVH Nodes", bytemuck::cast_slice(nodes))?;
        let index_buffer = storage("BVH Primitive Indices", bytemuck::cast_slice(bvh.primitive_indices()))?;
        let position_buffer = storage("Triangle Positions", bytemuck::cast_slice(&geometry.padded_positions()))?;
        let mask_buffer = storage("Intersector Triangle Masks", bytemuck::cast_slice(geometry.masks()))?;

        let scene_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("BVH Scene Bind Group Layout"),
            entries: &[
                storage_entry(0, true, ShaderStages::COMPUTE),
                storage_entry(1, true, ShaderStages::COMPUTE),
                storage_entry(2, true, ShaderStages::COMPUTE),
                storage_entry(3, true, ShaderStages::COMPUTE),
            ],
        });
        let scene_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("BVH Scene Bind Group"),
            layout: &scene_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: node_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: index_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: position_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: mask_buffer.as_entire_binding(),
                },
            ],
        });

        let nearest_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Nearest Query Bind Group Layout"),
            entries: &[
                storage_entry(0, true, ShaderStages::COMPUTE),
                storage_entry(1, false, ShaderStages::COMPUTE),
            ],
        });
        let any_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Any Query Bind Group Layout"),
            entries: &[
                storage_entry(0, true, ShaderStages::COMPUTE),
                storage_entry(2, false, ShaderStages::COMPUTE),
            ],
        });

        let shader = compiled(device, "intersect.wgsl", || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Intersect Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/intersect.wgsl").into()),
            })
        })?;
        let pipeline = |label: &str, entry_point: &str, query_layout: &BindGroupLayout| {
            compiled(device, label, || {
                let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[&scene_layout, query_layout],
                    push_constant_ranges: &[],
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module: &shader,
                    entry_point,
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
        };
        let nearest = pipeline("Nearest Hit Pipeline", "nearest_hit", &nearest_layout)?;
        let any = pipeline("Any Hit Pipeline", "any_hit", &any_layout)?;

        log::info!(
            "GPU BVH: {} triangles, {} nodes ({} KB)",
            bvh.triangle_count(),
            nodes.len(),
            nodes.len() as u64 * BvhNode::STRIDE / 1024
        );

        Ok(Self {
            triangle_count: bvh.triangle_count(),
            scene_bind_group,
            nearest_layout,
            any_layout,
            nearest,
            any,
            queries: None,
        })
    }

    fn dispatch(&self, encoder: &mut CommandEncoder, label: &str, pipeline: &ComputePipeline, group: &BindGroup, ray_count: u32) {
        let (x, y) = linear_dispatch(ray_count);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.scene_bind_group, &[]);
        pass.set_bind_group(1, group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

impl GpuIntersector for ComputeBvhIntersector {
    fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    fn bind(&mut self, device: &Device, pool: &RayBufferPool) {
        let query = |label: &str, layout: &BindGroupLayout, rays: &wgpu::Buffer, out_binding: u32| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: rays.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: out_binding,
                        resource: pool.intersections.as_entire_binding(),
                    },
                ],
            })
        };
        self.queries = Some(QueryBindings {
            nearest: query("Nearest Query Bind Group", &self.nearest_layout, &pool.rays, 1),
            any: query("Any Query Bind Group", &self.any_layout, &pool.shadow_rays, 2),
        });
    }

    fn encode_nearest(&self, encoder: &mut CommandEncoder, ray_count: u32) {
        match &self.queries {
            Some(queries) => self.dispatch(encoder, "Intersect Nearest", &self.nearest, &queries.nearest, ray_count),
            None => log::warn!("Nearest query encoded before the ray pool was bound"),
        }
    }

    fn encode_any(&self, encoder: &mut CommandEncoder, ray_count: u32) {
        match &self.queries {
            Some(queries) => self.dispatch(encoder, "Intersect Shadow", &self.any, &queries.any, ray_count),
            None => log::warn!("Shadow query encoded before the ray pool was bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_dispatch_covers_rays() {
        assert_eq!(linear_dispatch(0), (0, 0));
        assert_eq!(linear_dispatch(1), (1, 1));
        assert_eq!(linear_dispatch(64), (1, 1));
        assert_eq!(linear_dispatch(65), (2, 1));

        let (x, y) = linear_dispatch(1280 * 720);
        assert_eq!((x, y), (14_400, 1));
    }

    #[test]
    fn test_linear_dispatch_folds_large_batches() {
        let rays = 3840 * 2160 * 2;
        let (x, y) = linear_dispatch(rays);
        assert!(x <= MAX_GROUPS_PER_DIMENSION);
        assert!(y > 1);
        assert!(x as u64 * y as u64 * INTERSECT_GROUP_SIZE as u64 >= rays as u64);
    }
}
