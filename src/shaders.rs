//! WGSL sources.
//!
//! The advection kernel and the two stroke shaders are assembled from the
//! pieces below. Struct layouts here must match the `#[repr(C)]` types in
//! [`crate::particles`], [`crate::field`] and [`crate::advect`].
//!
//! # Bindings
//!
//! Advection (compute, group 0):
//! - `0` particles, `storage, read_write`
//! - `1` field cells, `storage, read`
//! - `2` [`AdvectParams`](crate::advect::AdvectParams), `uniform`
//!
//! Strokes (render, group 0):
//! - `0` `StrokeUniforms { color, extent, stroke_size }`, `uniform`
//! - `1` sprite texture, `2` sprite sampler (textured mode only)

use crate::config::RenderMode;

/// Uniform group used by the stroke shaders.
pub const STROKE_UNIFORM_GROUP: u32 = 0;
/// Uniform binding used by the stroke shaders.
pub const STROKE_UNIFORM_BINDING: u32 = 0;

/// Integer hash and unit-float helpers, bit-identical to [`crate::advect::hash`].
pub const HASH_WGSL: &str = r#"
fn hash(n: u32) -> u32 {
    var x = n;
    x = x ^ (x >> 17u);
    x = x * 0xed5ad4bbu;
    x = x ^ (x >> 11u);
    x = x * 0xac4c1b51u;
    x = x ^ (x >> 15u);
    x = x * 0x31848babu;
    x = x ^ (x >> 14u);
    return x;
}

// Top 24 bits mapped to [0, 1)
fn unit_float(h: u32) -> f32 {
    return f32(h >> 8u) / 16777216.0;
}
"#;

const PARTICLE_STRUCT_WGSL: &str = r#"
struct Particle {
    position: vec2<f32>,
    previous: vec2<f32>,
    seed: vec2<u32>,
};
"#;

const ADVECT_BODY_WGSL: &str = r#"
struct FieldCell {
    direction: vec2<f32>,
    magnitude: f32,
    _pad: f32,
};

struct AdvectParams {
    extent: vec2<f32>,
    bins: vec2<u32>,
    max_magnitude: f32,
    step_scale: f32,
    jitter: f32,
    respawn_chance: f32,
    tick: u32,
    count: u32,
    _pad: vec2<u32>,
};

@group(0) @binding(0) var<storage, read_write> particles: array<Particle>;
@group(0) @binding(1) var<storage, read> cells: array<FieldCell>;
@group(0) @binding(2) var<uniform> params: AdvectParams;

fn wrap_axis(v: f32, extent: f32) -> f32 {
    if (v >= 0.0 && v < extent) {
        return v;
    }
    let r = v - floor(v / extent) * extent;
    if (r >= 0.0 && r < extent) {
        return r;
    }
    return 0.0;
}

fn wrap_position(p: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(wrap_axis(p.x, params.extent.x), wrap_axis(p.y, params.extent.y));
}

fn field_velocity(p: vec2<f32>) -> vec2<f32> {
    if (params.max_magnitude <= 0.0) {
        return vec2<f32>(0.0, 0.0);
    }
    let c = floor(p);
    let inside = c.x >= 0.0 && c.y >= 0.0
        && c.x < f32(params.bins.x) && c.y < f32(params.bins.y);
    if (!inside) {
        return vec2<f32>(0.0, 0.0);
    }
    let cell = cells[u32(c.y) * params.bins.x + u32(c.x)];
    return cell.direction * (cell.magnitude / params.max_magnitude) * params.step_scale;
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    // Large pools dispatch a 2D grid of workgroups
    let i = gid.x + gid.y * groups.x * 256u;
    if (i >= params.count) {
        return;
    }

    var p = particles[i];
    var velocity = field_velocity(p.position);

    let r = hash(p.seed.x ^ hash(p.seed.y ^ params.tick));
    if (params.jitter > 0.0) {
        let angle = unit_float(r) * 6.283185307;
        velocity = velocity + vec2<f32>(cos(angle), sin(angle)) * params.jitter * params.step_scale;
    }

    let moved = p.position + velocity;
    var next = wrap_position(moved);
    var previous = p.position;
    if (any(next != moved)) {
        previous = next;
    }

    if (params.respawn_chance > 0.0 && unit_float(hash(r ^ 0x9e3779b9u)) < params.respawn_chance) {
        next = wrap_position(vec2<f32>(
            unit_float(hash(r + 1u)) * params.extent.x,
            unit_float(hash(r + 2u)) * params.extent.y
        ));
        previous = next;
    }

    p.position = next;
    p.previous = previous;
    particles[i] = p;
}
"#;

const STROKE_COMMON_WGSL: &str = r#"
struct StrokeUniforms {
    color: vec4<f32>,
    extent: vec2<f32>,
    stroke_size: vec2<f32>,
};

@group(0) @binding(0) var<uniform> stroke: StrokeUniforms;

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) previous: vec2<f32>,
};

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

// Field space to NDC, y up
fn to_ndc(p: vec2<f32>) -> vec2<f32> {
    return (p / stroke.extent) * 2.0 - vec2<f32>(1.0, 1.0);
}
"#;

const LINES_WGSL: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32, in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let endpoint = select(in.previous, in.position, vertex_index == 1u);
    out.clip = vec4<f32>(to_ndc(endpoint), 0.0, 1.0);
    out.uv = vec2<f32>(f32(vertex_index), 0.5);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return stroke.color;
}
"#;

const TEXTURED_WGSL: &str = r#"
@group(0) @binding(1) var sprite: texture_2d<f32>;
@group(0) @binding(2) var sprite_sampler: sampler;

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32, in: VertexInput) -> VertexOutput {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(0.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, 1.0)
    );
    let corner = corners[vertex_index];

    let a = to_ndc(in.previous);
    let b = to_ndc(in.position);
    let half_size = stroke.stroke_size * 0.5;

    // Measure direction in stroke units so the width is the same on both axes
    var dir = (b - a) / stroke.stroke_size;
    if (length(dir) < 1e-6) {
        dir = vec2<f32>(1.0, 0.0);
    }
    dir = normalize(dir);
    let tangent = dir * half_size;
    let normal = vec2<f32>(-dir.y, dir.x) * half_size;

    let along = mix(a - tangent, b + tangent, corner.x);
    var out: VertexOutput;
    out.clip = vec4<f32>(along + normal * corner.y, 0.0, 1.0);
    out.uv = vec2<f32>(corner.x, corner.y * 0.5 + 0.5);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(sprite, sprite_sampler, in.uv);
}
"#;

/// The advection compute kernel (entry point `main`).
pub fn advect_shader() -> String {
    let mut code = String::new();
    code.push_str(HASH_WGSL);
    code.push_str(PARTICLE_STRUCT_WGSL);
    code.push_str(ADVECT_BODY_WGSL);
    code
}

/// The stroke render shader for a mode (entry points `vs_main`, `fs_main`).
pub fn trail_shader(mode: RenderMode) -> String {
    let mut code = String::new();
    code.push_str(STROKE_COMMON_WGSL);
    match mode {
        RenderMode::Lines => code.push_str(LINES_WGSL),
        RenderMode::Textured => code.push_str(TEXTURED_WGSL),
    }
    code
}

/// Vertices drawn per particle instance.
pub fn vertices_per_particle(mode: RenderMode) -> u32 {
    match mode {
        RenderMode::Lines => 2,
        RenderMode::Textured => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::reflect::validate_wgsl;

    #[test]
    fn test_advect_shader_validates() {
        let code = advect_shader();
        validate_wgsl(&code).unwrap();
        assert!(code.contains("@workgroup_size(256)"));
        assert_eq!(crate::advect::WORKGROUP_SIZE, 256);
    }

    #[test]
    fn test_trail_shaders_validate() {
        for mode in [RenderMode::Lines, RenderMode::Textured] {
            let code = trail_shader(mode);
            if let Err(e) = validate_wgsl(&code) {
                panic!("{:?} shader failed: {}", mode, e);
            }
        }
    }

    #[test]
    fn test_textured_shader_binds_sprite() {
        assert!(trail_shader(RenderMode::Textured).contains("texture_2d<f32>"));
        assert!(!trail_shader(RenderMode::Lines).contains("texture_2d<f32>"));
    }

    #[test]
    fn test_vertices_per_particle() {
        assert_eq!(vertices_per_particle(RenderMode::Lines), 2);
        assert_eq!(vertices_per_particle(RenderMode::Textured), 6);
    }
}
