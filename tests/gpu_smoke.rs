//! Smoke tests against a real adapter.
//!
//! Ignored by default; run with `cargo test -- --ignored` on a machine with
//! a GPU (or a software adapter such as lavapipe).

use flowtrails::advect::{AdvectParams, CpuAdvector};
use flowtrails::gpu::{DeviceParticleBuffer, GpuAdvector};
use flowtrails::prelude::*;
use flowtrails::{ComputeBackend, Particle, ParticleSystem, ResourceErrorKind};

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

fn context() -> Arc<GpuContext> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(GpuContext::new_headless().expect("no GPU adapter"))
}

fn target(ctx: &GpuContext, width: u32, height: u32) -> wgpu::Texture {
    ctx.device().create_texture(&wgpu::TextureDescriptor {
        label: Some("Smoke Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn run_frames(mode: RenderMode, backend: ComputeBackend) {
    let ctx = context();
    let config = AnimatorConfig::default()
        .with_render_mode(mode)
        .with_compute_backend(backend)
        .with_background_prep(false)
        .with_initial_particles(2_000);
    let mut animator = FieldAnimator::with_gpu(config, ctx.clone()).unwrap();
    animator.set_vector_field(VectorField::uniform(32, 32, Vec2::new(1.0, 0.25), 1.0).unwrap());

    let texture = target(&ctx, 256, 128);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let draw_target = DrawTarget::new(&view, FORMAT, 256, 128);

    for frame in 0..10 {
        animator.animation_step().unwrap();
        if frame == 4 {
            animator.set_stroke_color(Vec4::new(0.2, 0.8, 1.0, 0.5)).unwrap();
            animator.set_active_particle_count(5_000).unwrap();
        }
        animator.draw(&draw_target).unwrap();
    }
    ctx.device().poll(wgpu::Maintain::Wait);

    assert_eq!(animator.particles().active_count(), 5_000);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn test_lines_on_gpu_compute() {
    run_frames(RenderMode::Lines, ComputeBackend::Auto);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn test_textured_on_cpu_compute() {
    run_frames(RenderMode::Textured, ComputeBackend::Cpu);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn test_shader_replacement_keeps_handles() {
    use flowtrails::gpu::ResourceManager;
    use flowtrails::shaders::trail_shader;

    let ctx = context();
    let mut resources = ResourceManager::new();
    let shader = resources
        .compile_shader(&ctx, "stroke", &trail_shader(RenderMode::Lines), 0, 0)
        .unwrap();
    let color = resources.bind_parameter(&ctx, shader, "color").unwrap();
    resources.set_color(&ctx, color, Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap();

    resources
        .replace_shader(&ctx, shader, &trail_shader(RenderMode::Textured))
        .unwrap();
    assert_eq!(resources.bind_parameter(&ctx, shader, "color").unwrap(), color);

    let err = resources.replace_shader(&ctx, shader, "fn broken( {").unwrap_err();
    assert_eq!(err.kind, ResourceErrorKind::ShaderCompile);
    assert!(resources.shader_module(shader).is_some());

    let err = resources.set_scalar(&ctx, color, 1.0).unwrap_err();
    assert_eq!(err.kind, ResourceErrorKind::TypeMismatch);
}

// ============================================================================
// Device readback
// ============================================================================

fn read_particles(ctx: &GpuContext, buffer: &DeviceParticleBuffer, count: usize) -> Vec<Particle> {
    let size = (count * std::mem::size_of::<Particle>()) as u64;
    let staging = ctx.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Particle Readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
    encoder.copy_buffer_to_buffer(buffer.buffer(), 0, &staging, 0, size);
    ctx.queue().submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    ctx.device().poll(wgpu::Maintain::Wait);
    rx.recv().unwrap().unwrap();

    let particles = bytemuck::cast_slice::<u8, Particle>(&slice.get_mapped_range()).to_vec();
    staging.unmap();
    particles
}

/// Distance along one axis on a grid that wraps at `extent`.
fn wrapped_delta(a: f32, b: f32, extent: f32) -> f32 {
    let d = (a - b).abs();
    d.min(extent - d)
}

#[test]
#[ignore = "needs a GPU adapter"]
fn test_gpu_kernel_matches_cpu_step() {
    let ctx = context();
    if !ctx.supports_compute() {
        return;
    }

    let bins = 24;
    let cells = (0..bins * bins)
        .map(|i| {
            let p = Vec2::new((i % bins) as f32, (i / bins) as f32) - Vec2::splat(bins as f32 * 0.5);
            FieldCell::new(p.perp(), p.length())
        })
        .collect();
    let field = VectorField::new(bins, bins, cells).unwrap();
    let config = AnimatorConfig::default()
        .with_step_scale(0.8)
        .with_jitter(0.25)
        .with_respawn_chance(0.02);

    let count = 4_096;
    let mut system = ParticleSystem::new(field.extent(), 11);
    system.set_active_count(count).unwrap();
    let mut expected = system.host_particles().unwrap().to_vec();

    let mut buffer = DeviceParticleBuffer::new(&ctx, count).unwrap();
    buffer.upload(&ctx, &mut system).unwrap();
    let mut advector = GpuAdvector::new(&ctx).unwrap();
    advector.upload_field(&ctx, &field).unwrap();
    advector.rebuild_bindings(&ctx, &buffer).unwrap();

    for tick in 0..8 {
        let params = AdvectParams::new(&field, &config, tick, count as u32);
        advector.step(&ctx, &params).unwrap();
        CpuAdvector.step(&mut expected, &field, &params);
    }

    let actual = read_particles(&ctx, &buffer, count);
    let extent = field.extent();
    for (i, (gpu, cpu)) in actual.iter().zip(&expected).enumerate() {
        let (g, c) = (gpu.position(), cpu.position());
        assert!(
            wrapped_delta(g.x, c.x, extent.x) < 1e-4 && wrapped_delta(g.y, c.y, extent.y) < 1e-4,
            "particle {} diverged: gpu {:?} cpu {:?}",
            i,
            g,
            c
        );
    }
}

#[test]
#[ignore = "needs a GPU adapter"]
fn test_lost_device_reported_without_blocking() {
    let ctx = context();
    let config = AnimatorConfig::default()
        .with_background_prep(false)
        .with_initial_particles(256);
    let mut animator = FieldAnimator::with_gpu(config, ctx.clone()).unwrap();
    animator.set_vector_field(VectorField::uniform(8, 8, Vec2::X, 1.0).unwrap());

    let texture = target(&ctx, 64, 64);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

    ctx.device().destroy();
    ctx.device().poll(wgpu::Maintain::Wait);
    assert!(ctx.is_lost());

    // Nothing reached the device yet, so the step carries on on the CPU
    animator.animation_step().unwrap();
    assert_eq!(animator.tick(), 1);

    let err = animator.draw(&DrawTarget::new(&view, FORMAT, 64, 64)).unwrap_err();
    assert_eq!(err.kind, ResourceErrorKind::ContextLost);
}
