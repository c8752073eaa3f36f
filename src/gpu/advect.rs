//! Compute path of the advection step.

use wgpu::util::DeviceExt;

use crate::advect::{AdvectParams, WORKGROUP_SIZE};
use crate::error::{ResourceError, ResourceErrorKind};
use crate::field::VectorField;
use crate::gpu::particle_buffer::DeviceParticleBuffer;
use crate::gpu::GpuContext;
use crate::shaders::advect_shader;

/// Advection compute pipeline plus the field and parameter buffers it reads.
pub struct GpuAdvector {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    field_buffer: Option<wgpu::Buffer>,
    bind_group: Option<wgpu::BindGroup>,
}

impl GpuAdvector {
    #[track_caller]
    pub fn new(ctx: &GpuContext) -> Result<Self, ResourceError> {
        let source = advect_shader();
        ctx.scoped(ResourceErrorKind::ShaderCompile, "advection kernel", |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Advect Shader"),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });

            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Advect Bind Group Layout"),
                entries: &[
                    // Particles
                    storage_entry(0, false),
                    // Field cells
                    storage_entry(1, true),
                    // Params
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Advect Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Advect Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

            let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Advect Params Buffer"),
                contents: bytemuck::bytes_of(&AdvectParams::default()),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

            Self {
                pipeline,
                bind_group_layout,
                params_buffer,
                field_buffer: None,
                bind_group: None,
            }
        })
    }

    /// Upload a field's cells. The bindings must be rebuilt afterwards.
    #[track_caller]
    pub fn upload_field(&mut self, ctx: &GpuContext, field: &VectorField) -> Result<(), ResourceError> {
        let buffer = ctx.scoped(ResourceErrorKind::Allocation, "field buffer", |device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Field Cell Buffer"),
                contents: bytemuck::cast_slice(field.cells()),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            })
        })?;
        self.field_buffer = Some(buffer);
        self.bind_group = None;
        Ok(())
    }

    /// Bind the current particle and field buffers.
    #[track_caller]
    pub fn rebuild_bindings(&mut self, ctx: &GpuContext, particles: &DeviceParticleBuffer) -> Result<(), ResourceError> {
        let Some(field_buffer) = &self.field_buffer else {
            return Err(ResourceError::new(
                ResourceErrorKind::Device,
                "advection bindings need a field buffer",
            ));
        };

        let bind_group = ctx.scoped(ResourceErrorKind::Device, "advect bind group", |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Advect Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: particles.buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: field_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.params_buffer.as_entire_binding(),
                    },
                ],
            })
        })?;
        self.bind_group = Some(bind_group);
        Ok(())
    }

    pub fn has_bindings(&self) -> bool {
        self.bind_group.is_some()
    }

    /// Dispatch one tick over `params.count` particles.
    #[track_caller]
    pub fn step(&self, ctx: &GpuContext, params: &AdvectParams) -> Result<(), ResourceError> {
        let Some(bind_group) = &self.bind_group else {
            return Err(ResourceError::new(
                ResourceErrorKind::Device,
                "advection step dispatched without bindings",
            ));
        };
        let limit = ctx.device().limits().max_compute_workgroups_per_dimension.max(1);
        let (groups_x, groups_y) = dispatch_size(params.count, limit);

        ctx.submit(|device| {
            ctx.queue().write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(params));

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Advect Encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Advect Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            ctx.queue().submit(std::iter::once(encoder.finish()));
        })
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Workgroup grid covering `count` invocations, split over y past `limit`.
pub fn dispatch_size(count: u32, limit: u32) -> (u32, u32) {
    let groups = count.div_ceil(WORKGROUP_SIZE);
    if groups <= limit {
        (groups, 1)
    } else {
        (limit, groups.div_ceil(limit))
    }
}
