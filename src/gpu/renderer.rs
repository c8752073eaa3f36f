//! Stroke rendering.
//!
//! Each active particle is one instance. Lines mode draws a two-vertex line
//! from `previous` to `position`; textured mode draws a six-vertex quad
//! around the same segment, widened by the stroke width and sampling the
//! sprite. Both read the particle buffer directly as an instance-rate
//! vertex buffer.
//!
//! [`Renderer::resolve`] brings every derived resource up to date before a
//! draw, leaves first: shader, pipeline, stroke uniforms, sprite, bind
//! group. A node is cleared only after its rebuild succeeds.

use glam::{Vec2, Vec4};
use image::RgbaImage;

use crate::config::RenderMode;
use crate::dependency::{DependencyGraph, NodeId};
use crate::error::{ResourceError, ResourceErrorKind};
use crate::gpu::resources::{ParamHandle, ResourceManager, ShaderHandle, TextureHandle};
use crate::gpu::{DrawTarget, GpuContext};
use crate::particles::Particle;
use crate::prepare::Handoff;
use crate::shaders::{trail_shader, vertices_per_particle, STROKE_UNIFORM_BINDING, STROKE_UNIFORM_GROUP};
use crate::sprite::sprite_image;

/// Graph nodes the renderer resolves.
#[derive(Debug, Clone, Copy)]
pub struct RenderNodes {
    pub trail_shader: NodeId,
    pub stroke_color: NodeId,
    pub stroke_uniforms: NodeId,
    pub sprite_texture: NodeId,
    pub render_bindings: NodeId,
}

/// Per-frame inputs to stroke drawing.
#[derive(Debug, Clone, Copy)]
pub struct StrokeStyle {
    pub color: Vec4,
    /// Width in target pixels.
    pub width: f32,
    /// Field extent in cells.
    pub extent: Vec2,
}

impl StrokeStyle {
    /// Stroke width in NDC units along each axis of `target`.
    pub fn ndc_size(&self, target_width: u32, target_height: u32) -> Vec2 {
        Vec2::new(
            2.0 * self.width / target_width.max(1) as f32,
            2.0 * self.width / target_height.max(1) as f32,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct StrokeParams {
    color: ParamHandle,
    extent: ParamHandle,
    stroke_size: ParamHandle,
}

struct PipelineState {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    format: wgpu::TextureFormat,
}

/// Stroke pipeline and the resources bound to it.
pub struct Renderer {
    mode: RenderMode,
    shader: Option<ShaderHandle>,
    params: Option<StrokeParams>,
    sprite: Option<TextureHandle>,
    sprite_prep: Handoff<RgbaImage>,
    pipeline: Option<PipelineState>,
    bind_group: Option<wgpu::BindGroup>,
    target_size: (u32, u32),
    extra_logging: bool,
}

impl Renderer {
    pub fn new(mode: RenderMode, background_prep: bool, extra_logging: bool) -> Self {
        Self {
            mode,
            shader: None,
            params: None,
            sprite: None,
            sprite_prep: Handoff::new("sprite", background_prep),
            pipeline: None,
            bind_group: None,
            target_size: (0, 0),
            extra_logging,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn shader(&self) -> Option<ShaderHandle> {
        self.shader
    }

    pub fn sprite(&self) -> Option<TextureHandle> {
        self.sprite
    }

    /// Rebuild whatever the graph marks dirty for drawing into `target`.
    #[track_caller]
    pub fn resolve(
        &mut self,
        ctx: &GpuContext,
        resources: &mut ResourceManager,
        graph: &mut DependencyGraph,
        nodes: &RenderNodes,
        style: &StrokeStyle,
        target: &DrawTarget<'_>,
    ) -> Result<(), ResourceError> {
        ctx.check_alive()?;

        // Shader
        let shader_changed = graph.is_dirty(nodes.trail_shader) || self.shader.is_none();
        if shader_changed {
            self.compile(ctx, resources)?;
        }

        // Pipeline, rebuilt for a new shader or target format. The old one
        // stays bound until the new one exists.
        let current = self.pipeline.as_ref().map(|p| p.format);
        if pipeline_outdated(current, target.format, shader_changed) {
            if self.extra_logging {
                tracing::debug!(format = ?target.format, mode = ?self.mode, "building stroke pipeline");
            }
            let pipeline = self.build_pipeline(ctx, resources, target.format)?;
            self.pipeline = Some(pipeline);
            graph.notify_changed(nodes.render_bindings);
        }
        graph.take_dirty(nodes.trail_shader);

        // Stroke colour is an input; its dependents carry the work
        graph.take_dirty(nodes.stroke_color);

        // Uniforms
        let size = (target.width, target.height);
        if graph.is_dirty(nodes.stroke_uniforms) || size != self.target_size {
            self.stage_uniforms(ctx, resources, style, target)?;
            self.target_size = size;
            graph.take_dirty(nodes.stroke_uniforms);
        }
        resources.flush_parameters(ctx)?;

        // Sprite
        if self.mode == RenderMode::Textured {
            self.resolve_sprite(ctx, resources, graph, nodes, style)?;
        } else {
            graph.take_dirty(nodes.sprite_texture);
        }

        // Bind group
        if graph.is_dirty(nodes.render_bindings) || self.bind_group.is_none() {
            self.bind_group = Some(self.build_bind_group(ctx, resources)?);
            graph.take_dirty(nodes.render_bindings);
        }

        Ok(())
    }

    #[track_caller]
    fn compile(&mut self, ctx: &GpuContext, resources: &mut ResourceManager) -> Result<(), ResourceError> {
        let source = trail_shader(self.mode);
        let shader = match self.shader {
            Some(shader) => {
                resources.replace_shader(ctx, shader, &source)?;
                shader
            }
            None => {
                let shader = resources.compile_shader(
                    ctx,
                    "stroke shader",
                    &source,
                    STROKE_UNIFORM_GROUP,
                    STROKE_UNIFORM_BINDING,
                )?;
                self.shader = Some(shader);
                shader
            }
        };

        self.params = Some(StrokeParams {
            color: resources.bind_parameter(ctx, shader, "color")?,
            extent: resources.bind_parameter(ctx, shader, "extent")?,
            stroke_size: resources.bind_parameter(ctx, shader, "stroke_size")?,
        });
        Ok(())
    }

    #[track_caller]
    fn stage_uniforms(
        &self,
        ctx: &GpuContext,
        resources: &mut ResourceManager,
        style: &StrokeStyle,
        target: &DrawTarget<'_>,
    ) -> Result<(), ResourceError> {
        let Some(params) = self.params else {
            return Err(ResourceError::new(
                ResourceErrorKind::InvalidHandle,
                "stroke parameters are not bound",
            ));
        };
        resources.set_color(ctx, params.color, style.color)?;
        resources.set_size(ctx, params.extent, style.extent)?;
        resources.set_size(ctx, params.stroke_size, style.ndc_size(target.width, target.height))?;
        Ok(())
    }

    #[track_caller]
    fn resolve_sprite(
        &mut self,
        ctx: &GpuContext,
        resources: &mut ResourceManager,
        graph: &mut DependencyGraph,
        nodes: &RenderNodes,
        style: &StrokeStyle,
    ) -> Result<(), ResourceError> {
        if graph.is_dirty(nodes.sprite_texture) {
            if self.sprite.is_none() {
                // First sprite is built inline so the first frame has a texture
                self.sprite_prep.cancel();
                self.sprite = Some(resources.create_texture(ctx, style.color)?);
                graph.notify_changed(nodes.render_bindings);
            } else {
                let color = style.color;
                if let Err(e) = self.sprite_prep.request(move || sprite_image(color)) {
                    tracing::warn!("sprite preparation thread failed to start: {}", e);
                    self.install_sprite(ctx, resources, graph, nodes, &sprite_image(color))?;
                }
            }
            graph.take_dirty(nodes.sprite_texture);
        }

        if let Some(image) = self.sprite_prep.try_take() {
            self.install_sprite(ctx, resources, graph, nodes, &image)?;
        }
        Ok(())
    }

    #[track_caller]
    fn install_sprite(
        &mut self,
        ctx: &GpuContext,
        resources: &mut ResourceManager,
        graph: &mut DependencyGraph,
        nodes: &RenderNodes,
        image: &RgbaImage,
    ) -> Result<(), ResourceError> {
        let handle = resources.create_texture_from_image(ctx, "stroke sprite", image)?;
        if let Some(old) = self.sprite.replace(handle) {
            resources.release_texture(old)?;
        }
        graph.notify_changed(nodes.render_bindings);
        if self.extra_logging {
            tracing::debug!("installed new stroke sprite");
        }
        Ok(())
    }

    #[track_caller]
    fn build_pipeline(
        &self,
        ctx: &GpuContext,
        resources: &ResourceManager,
        format: wgpu::TextureFormat,
    ) -> Result<PipelineState, ResourceError> {
        let module = self
            .shader
            .and_then(|s| resources.shader_module(s))
            .ok_or_else(|| ResourceError::new(ResourceErrorKind::InvalidHandle, "stroke shader is missing"))?;
        let mode = self.mode;

        ctx.scoped(ResourceErrorKind::ShaderCompile, "stroke pipeline", |device| {
            let mut entries = vec![wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }];
            if mode == RenderMode::Textured {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                });
            }

            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Stroke Bind Group Layout"),
                entries: &entries,
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Stroke Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

            let topology = match mode {
                RenderMode::Lines => wgpu::PrimitiveTopology::LineList,
                RenderMode::Textured => wgpu::PrimitiveTopology::TriangleList,
            };

            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Stroke Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<Particle>() as wgpu::BufferAddress,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                    }],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

            PipelineState {
                pipeline,
                bind_group_layout,
                format,
            }
        })
    }

    #[track_caller]
    fn build_bind_group(&self, ctx: &GpuContext, resources: &ResourceManager) -> Result<wgpu::BindGroup, ResourceError> {
        let missing = |what: &str| ResourceError::new(ResourceErrorKind::InvalidHandle, format!("{} is missing", what));

        let Some(state) = &self.pipeline else {
            return Err(missing("stroke pipeline"));
        };
        let Some(uniforms) = self.shader.and_then(|s| resources.uniform_buffer(s)) else {
            return Err(missing("stroke uniform buffer"));
        };
        let sprite = match self.mode {
            RenderMode::Lines => None,
            RenderMode::Textured => match self.sprite.and_then(|t| resources.texture(t)) {
                Some(sprite) => Some(sprite),
                None => return Err(missing("stroke sprite")),
            },
        };

        ctx.scoped(ResourceErrorKind::Device, "stroke bind group", |device| {
            let mut entries = vec![wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }];
            if let Some(sprite) = sprite {
                entries.push(wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&sprite.view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sprite.sampler),
                });
            }
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Stroke Bind Group"),
                layout: &state.bind_group_layout,
                entries: &entries,
            })
        })
    }

    /// Draw `[0, active)` from the particle buffer.
    ///
    /// With `clear` set the target is cleared first; otherwise strokes
    /// accumulate over what is already there.
    #[track_caller]
    pub fn draw(
        &self,
        ctx: &GpuContext,
        target: &DrawTarget<'_>,
        particle_buffer: &wgpu::Buffer,
        active: u32,
        clear: Option<wgpu::Color>,
    ) -> Result<(), ResourceError> {
        let (Some(state), Some(bind_group)) = (&self.pipeline, &self.bind_group) else {
            return Err(ResourceError::new(
                ResourceErrorKind::Device,
                "draw called before the stroke pipeline was resolved",
            ));
        };
        let load = match clear {
            Some(color) => wgpu::LoadOp::Clear(color),
            None => wgpu::LoadOp::Load,
        };
        let vertices = vertices_per_particle(self.mode);

        ctx.submit(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Stroke Encoder"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Stroke Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&state.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.set_vertex_buffer(0, particle_buffer.slice(..));
                pass.draw(0..vertices, 0..active);
            }
            ctx.queue().submit(std::iter::once(encoder.finish()));
        })
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("mode", &self.mode)
            .field("shader", &self.shader)
            .field("sprite", &self.sprite)
            .field("sprite_prep", &self.sprite_prep)
            .field("has_pipeline", &self.pipeline.is_some())
            .field("has_bind_group", &self.bind_group.is_some())
            .finish()
    }
}

fn pipeline_outdated(
    current: Option<wgpu::TextureFormat>,
    target: wgpu::TextureFormat,
    shader_changed: bool,
) -> bool {
    shader_changed || current != Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndc_size_scales_with_target() {
        let style = StrokeStyle {
            color: Vec4::ONE,
            width: 4.0,
            extent: Vec2::new(32.0, 32.0),
        };
        assert_eq!(style.ndc_size(800, 400), Vec2::new(0.01, 0.02));
        // Degenerate targets must not divide by zero
        assert!(style.ndc_size(0, 0).is_finite());
    }

    #[test]
    fn test_renderer_starts_unresolved() {
        let renderer = Renderer::new(RenderMode::Textured, false, false);
        assert_eq!(renderer.mode(), RenderMode::Textured);
        assert!(renderer.shader().is_none());
        assert!(renderer.sprite().is_none());
    }

    #[test]
    fn test_pipeline_rebuilt_for_shader_or_format() {
        use wgpu::TextureFormat::{Bgra8Unorm, Rgba8Unorm};

        assert!(pipeline_outdated(None, Rgba8Unorm, false));
        assert!(!pipeline_outdated(Some(Rgba8Unorm), Rgba8Unorm, false));
        assert!(pipeline_outdated(Some(Rgba8Unorm), Bgra8Unorm, false));
        // A replaced shader needs a new pipeline even for the same format
        assert!(pipeline_outdated(Some(Rgba8Unorm), Rgba8Unorm, true));
    }
}
