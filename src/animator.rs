//! The engine facade.
//!
//! [`FieldAnimator`] ties the particle pool, the vector field, the
//! dependency graph and (optionally) the GPU state together. Setters only
//! record changes in the graph; the work happens at the next
//! [`animation_step`](FieldAnimator::animation_step) or
//! [`draw`](FieldAnimator::draw).
//!
//! ```ignore
//! let ctx = Arc::new(GpuContext::new_headless()?);
//! let mut animator = FieldAnimator::with_gpu(AnimatorConfig::default(), ctx)?;
//! animator.set_vector_field_json(&json)?;
//!
//! loop {
//!     animator.animation_step()?;
//!     animator.draw(&DrawTarget::new(&view, format, width, height))?;
//! }
//! ```

use std::sync::Arc;

use glam::{Vec2, Vec4};

use crate::advect::{AdvectParams, CpuAdvector};
use crate::config::{AnimatorConfig, ComputeBackend};
use crate::dependency::{DependencyGraph, NodeId};
use crate::error::{AnimatorError, ConfigError, ResourceError, ResourceErrorKind};
use crate::field::VectorField;
use crate::gpu::renderer::{RenderNodes, StrokeStyle};
use crate::gpu::{DeviceParticleBuffer, DrawTarget, GpuAdvector, GpuContext, Renderer, ResourceManager};
use crate::particles::{MirrorState, ParticleSystem};

/// Graph nodes owned by the animator.
#[derive(Debug, Clone, Copy)]
struct Nodes {
    field_source: NodeId,
    field_buffer: NodeId,
    particle_buffer: NodeId,
    advect_bindings: NodeId,
    render: RenderNodes,
}

impl Nodes {
    fn wire(graph: &mut DependencyGraph) -> Result<Self, AnimatorError> {
        let field_source = graph.add_node("field_source");
        let field_buffer = graph.add_node("field_buffer");
        let particle_buffer = graph.add_node("particle_buffer");
        let advect_bindings = graph.add_node("advect_bindings");
        let render = RenderNodes {
            trail_shader: graph.add_node("trail_shader"),
            stroke_color: graph.add_node("stroke_color"),
            stroke_uniforms: graph.add_node("stroke_uniforms"),
            sprite_texture: graph.add_node("sprite_texture"),
            render_bindings: graph.add_node("render_bindings"),
        };

        graph.add_dependent(field_source, field_buffer)?;
        graph.add_dependent(field_source, render.stroke_uniforms)?;
        graph.add_dependent(field_buffer, advect_bindings)?;
        graph.add_dependent(particle_buffer, advect_bindings)?;
        graph.add_dependent(render.stroke_color, render.stroke_uniforms)?;
        graph.add_dependent(render.stroke_color, render.sprite_texture)?;
        graph.add_dependent(render.sprite_texture, render.render_bindings)?;
        graph.add_dependent(render.trail_shader, render.stroke_uniforms)?;
        graph.add_dependent(render.trail_shader, render.render_bindings)?;

        Ok(Self {
            field_source,
            field_buffer,
            particle_buffer,
            advect_bindings,
            render,
        })
    }
}

/// Everything that needs a device.
struct GpuState {
    ctx: Arc<GpuContext>,
    resources: ResourceManager,
    particle_buffer: DeviceParticleBuffer,
    advector: Option<GpuAdvector>,
    renderer: Renderer,
}

/// Particle animation over a static vector field.
pub struct FieldAnimator {
    config: AnimatorConfig,
    field: Option<VectorField>,
    particles: ParticleSystem,
    graph: DependencyGraph,
    nodes: Nodes,
    tick: u32,
    stroke_color: Vec4,
    stroke_width: f32,
    gpu: Option<GpuState>,
    fallback_warned: bool,
    compute_failed: bool,
    span: tracing::Span,
}

impl FieldAnimator {
    /// Create a CPU-only animator. [`draw`](Self::draw) is unavailable.
    pub fn new(config: AnimatorConfig) -> Result<Self, AnimatorError> {
        config.validate()?;
        let span = tracing::info_span!("flowtrails", prefix = %config.log_prefix);
        let _guard = span.clone().entered();

        let extent = Vec2::new(config.grid_size[0] as f32, config.grid_size[1] as f32);
        let mut particles = ParticleSystem::new(extent, config.seed);
        particles.set_active_count(config.initial_particles)?;

        let mut graph = DependencyGraph::new();
        let nodes = Nodes::wire(&mut graph)?;

        Ok(Self {
            stroke_color: Vec4::from_array(config.stroke_color),
            stroke_width: config.stroke_width,
            config,
            field: None,
            particles,
            graph,
            nodes,
            tick: 0,
            gpu: None,
            fallback_warned: false,
            compute_failed: false,
            span,
        })
    }

    /// Create an animator that steps and draws with `ctx`.
    pub fn with_gpu(config: AnimatorConfig, ctx: Arc<GpuContext>) -> Result<Self, AnimatorError> {
        let mut animator = Self::new(config)?;
        let _guard = animator.span.clone().entered();

        let particle_buffer = DeviceParticleBuffer::new(&ctx, animator.particles.allocated_count())
            .inspect_err(ResourceError::log)?;
        let renderer = Renderer::new(
            animator.config.render_mode,
            animator.config.background_prep,
            animator.config.extra_logging(),
        );

        if animator.config.extra_logging() {
            tracing::debug!(
                compute = ctx.supports_compute(),
                capacity = particle_buffer.capacity(),
                "attached GPU context"
            );
        }

        animator.gpu = Some(GpuState {
            ctx,
            resources: ResourceManager::new(),
            particle_buffer,
            advector: None,
            renderer,
        });
        Ok(animator)
    }

    pub fn config(&self) -> &AnimatorConfig {
        &self.config
    }

    pub fn field(&self) -> Option<&VectorField> {
        self.field.as_ref()
    }

    pub fn particles(&self) -> &ParticleSystem {
        &self.particles
    }

    pub fn gpu_context(&self) -> Option<&Arc<GpuContext>> {
        self.gpu.as_ref().map(|gpu| &gpu.ctx)
    }

    /// Number of steps taken so far.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn stroke_color(&self) -> Vec4 {
        self.stroke_color
    }

    pub fn stroke_width(&self) -> f32 {
        self.stroke_width
    }

    /// Names of graph nodes waiting to be rebuilt.
    pub fn dirty_nodes(&self) -> Vec<&'static str> {
        self.graph.dirty_nodes()
    }

    /// Set how many particles are simulated and drawn.
    ///
    /// Growth reallocates the device buffer before the host pool, so a failed
    /// device allocation leaves both at their previous size.
    pub fn set_active_particle_count(&mut self, count: usize) -> Result<(), AnimatorError> {
        let _guard = self.span.clone().entered();
        if count == 0 {
            return Err(ConfigError::ZeroParticles.into());
        }

        if let Some(gpu) = &mut self.gpu {
            let grown = gpu
                .particle_buffer
                .reserve(&gpu.ctx, count)
                .inspect_err(ResourceError::log)?;
            if grown {
                self.graph.notify_changed(self.nodes.particle_buffer);
            }
        }

        let before = self.particles.allocated_count();
        self.particles
            .set_active_count(count)
            .inspect_err(log_resource_error)?;

        if self.config.extra_logging() && self.particles.allocated_count() != before {
            tracing::debug!(
                from = before,
                to = self.particles.allocated_count(),
                "grew particle pool"
            );
        }
        Ok(())
    }

    /// Re-randomise `count` particles, starting at the next uninitialised slot.
    pub fn randomize_particles(&mut self, count: usize) {
        self.particles.randomize_particles(count);
    }

    /// Replace the vector field.
    ///
    /// A field with different dimensions moves every particle to a random
    /// position inside the new grid.
    pub fn set_vector_field(&mut self, field: VectorField) {
        let _guard = self.span.clone().entered();
        if self.config.extra_logging() {
            tracing::debug!(
                num_x_bins = field.num_x_bins(),
                num_y_bins = field.num_y_bins(),
                max_magnitude = field.max_magnitude(),
                "new vector field"
            );
        }
        self.particles.set_extent(field.extent());
        self.field = Some(field);
        self.graph.notify_changed(self.nodes.field_source);
    }

    /// Parse and install a JSON field structure. On error the current field stays.
    pub fn set_vector_field_json(&mut self, json: &str) -> Result<(), AnimatorError> {
        let field = VectorField::from_json(json)?;
        self.set_vector_field(field);
        Ok(())
    }

    pub fn set_stroke_color(&mut self, color: Vec4) -> Result<(), ConfigError> {
        if !color.is_finite() {
            return Err(ConfigError::NonFiniteColor);
        }
        if color != self.stroke_color {
            self.stroke_color = color;
            self.graph.notify_changed(self.nodes.render.stroke_color);
        }
        Ok(())
    }

    /// Set the stroke width in target pixels.
    pub fn set_stroke_width(&mut self, width: f32) -> Result<(), ConfigError> {
        if !(width.is_finite() && width > 0.0) {
            return Err(ConfigError::InvalidStrokeWidth(width));
        }
        if width != self.stroke_width {
            self.stroke_width = width;
            self.graph.notify_changed(self.nodes.render.stroke_uniforms);
        }
        Ok(())
    }

    /// Advance every active particle by one tick.
    ///
    /// Does nothing until a vector field is set. Runs on the GPU when the
    /// configured backend allows it and the context supports compute, on the
    /// CPU otherwise.
    ///
    /// If the GPU step fails before the device copy ever advanced, compute is
    /// switched off for good and the step runs on the CPU instead. Once the
    /// device copy is ahead of the host mirror the error is returned.
    pub fn animation_step(&mut self) -> Result<(), AnimatorError> {
        let _guard = self.span.clone().entered();
        if self.field.is_none() {
            return Ok(());
        }
        let use_gpu = self.use_gpu();
        let Some(field) = &self.field else {
            return Ok(());
        };

        let count = self.particles.active_count() as u32;
        let params = AdvectParams::new(field, &self.config, self.tick, count);

        let gpu_step = match &mut self.gpu {
            Some(gpu) if use_gpu => Some(step_gpu(
                gpu,
                &mut self.graph,
                &self.nodes,
                field,
                &mut self.particles,
                &params,
            )),
            _ => None,
        };
        self.finish_step(gpu_step, &params)
    }

    fn finish_step(
        &mut self,
        gpu_step: Option<Result<(), ResourceError>>,
        params: &AdvectParams,
    ) -> Result<(), AnimatorError> {
        match gpu_step {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                err.log();
                if self.particles.mirror_state() == MirrorState::Stale {
                    return Err(err.into());
                }
                self.compute_failed = true;
                if self.config.warnings() {
                    tracing::warn!(error = %err, "GPU advection failed, switching to the CPU");
                }
                self.step_cpu(params);
            }
            None => self.step_cpu(params),
        }

        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }

    fn step_cpu(&mut self, params: &AdvectParams) {
        if let Some(field) = &self.field {
            CpuAdvector.step(self.particles.cpu_particles_mut(), field, params);
        }
    }

    fn use_gpu(&mut self) -> bool {
        let compute = !self.compute_failed
            && self.gpu.as_ref().is_some_and(|gpu| gpu.ctx.supports_compute());
        match self.config.compute_backend {
            ComputeBackend::Cpu => false,
            ComputeBackend::Auto => compute,
            ComputeBackend::Gpu => {
                if !compute && !self.fallback_warned {
                    self.fallback_warned = true;
                    if self.config.warnings() {
                        tracing::warn!("GPU compute unavailable, advancing particles on the CPU");
                    }
                }
                compute
            }
        }
    }

    /// Draw the active particles into `target`.
    ///
    /// Rebuilds whatever changed since the last draw first. On error the
    /// previous resources stay in place and nothing is drawn.
    pub fn draw(&mut self, target: &DrawTarget<'_>) -> Result<(), ResourceError> {
        let _guard = self.span.clone().entered();
        let Some(gpu) = &mut self.gpu else {
            return Err(ResourceError::new(
                ResourceErrorKind::Device,
                "draw needs a GPU context",
            ));
        };

        let style = StrokeStyle {
            color: self.stroke_color,
            width: self.stroke_width,
            extent: self.particles.extent(),
        };
        let clear = self.config.clear_background.then(|| {
            let [r, g, b, a] = self.config.background;
            wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }
        });

        draw_gpu(gpu, &mut self.graph, &self.nodes, &mut self.particles, &style, target, clear)
            .inspect_err(ResourceError::log)
    }
}

fn draw_gpu(
    gpu: &mut GpuState,
    graph: &mut DependencyGraph,
    nodes: &Nodes,
    particles: &mut ParticleSystem,
    style: &StrokeStyle,
    target: &DrawTarget<'_>,
    clear: Option<wgpu::Color>,
) -> Result<(), ResourceError> {
    gpu.particle_buffer.upload(&gpu.ctx, particles)?;
    gpu.renderer
        .resolve(&gpu.ctx, &mut gpu.resources, graph, &nodes.render, style, target)?;
    gpu.renderer.draw(
        &gpu.ctx,
        target,
        gpu.particle_buffer.buffer(),
        particles.active_count() as u32,
        clear,
    )
}

fn step_gpu(
    gpu: &mut GpuState,
    graph: &mut DependencyGraph,
    nodes: &Nodes,
    field: &VectorField,
    particles: &mut ParticleSystem,
    params: &AdvectParams,
) -> Result<(), ResourceError> {
    let advector = match gpu.advector.take() {
        Some(advector) => advector,
        None => GpuAdvector::new(&gpu.ctx)?,
    };
    let advector = gpu.advector.insert(advector);

    if graph.is_dirty(nodes.field_buffer) {
        advector.upload_field(&gpu.ctx, field)?;
        graph.take_dirty(nodes.field_buffer);
        graph.notify_changed(nodes.advect_bindings);
    }
    gpu.particle_buffer.upload(&gpu.ctx, particles)?;

    if graph.is_dirty(nodes.advect_bindings) || !advector.has_bindings() {
        advector.rebuild_bindings(&gpu.ctx, &gpu.particle_buffer)?;
        graph.take_dirty(nodes.advect_bindings);
    }
    graph.take_dirty(nodes.particle_buffer);
    graph.take_dirty(nodes.field_source);

    advector.step(&gpu.ctx, params)?;
    particles.mark_device_advanced();
    Ok(())
}

fn log_resource_error(e: &AnimatorError) {
    if let AnimatorError::Resource(e) = e {
        e.log();
    }
}

impl std::fmt::Debug for FieldAnimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldAnimator")
            .field("config", &self.config)
            .field("field", &self.field.as_ref().map(|f| (f.num_x_bins(), f.num_y_bins())))
            .field("particles", &self.particles.active_count())
            .field("tick", &self.tick)
            .field("gpu", &self.gpu.is_some())
            .finish()
    }
}
