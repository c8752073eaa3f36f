//! Field advection: the per-tick particle update.
//!
//! The update law is shared by the CPU path in this module and the WGSL
//! kernel in [`crate::shaders::advect_shader`]:
//!
//! ```text
//! cell = floor(p)
//! p'   = wrap(p + d * (m / max_magnitude) * step_scale, extent)
//! ```
//!
//! Positions outside the grid read zero velocity. Seeded jitter and respawn
//! use the same integer hash on both paths, so CPU and GPU runs follow the
//! same lookup and wrap rules even when their floating point results differ
//! in the last bits.

use std::f32::consts::TAU;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::config::AnimatorConfig;
use crate::field::VectorField;
use crate::particles::Particle;

/// Compute workgroup size; must match `@workgroup_size` in the kernel.
pub const WORKGROUP_SIZE: u32 = 256;

/// Per-tick parameters, uploaded as the kernel's uniform block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AdvectParams {
    pub extent: [f32; 2],
    pub bins: [u32; 2],
    pub max_magnitude: f32,
    pub step_scale: f32,
    pub jitter: f32,
    pub respawn_chance: f32,
    pub tick: u32,
    pub count: u32,
    pub _pad: [u32; 2],
}

impl AdvectParams {
    pub fn new(field: &VectorField, config: &AnimatorConfig, tick: u32, count: u32) -> Self {
        Self {
            extent: field.extent().to_array(),
            bins: [field.num_x_bins(), field.num_y_bins()],
            max_magnitude: field.max_magnitude(),
            step_scale: config.step_scale,
            jitter: config.jitter,
            respawn_chance: config.respawn_chance,
            tick,
            count,
            _pad: [0; 2],
        }
    }

    pub fn extent(&self) -> Vec2 {
        Vec2::from_array(self.extent)
    }
}

/// Integer hash, bit-identical to `hash` in the WGSL utilities.
#[inline]
pub fn hash(n: u32) -> u32 {
    let mut x = n;
    x ^= x >> 17;
    x = x.wrapping_mul(0xed5ad4bb);
    x ^= x >> 11;
    x = x.wrapping_mul(0xac4c1b51);
    x ^= x >> 15;
    x = x.wrapping_mul(0x31848bab);
    x ^= x >> 14;
    x
}

/// Map a hash to `[0, 1)` using its top 24 bits.
#[inline]
pub fn unit_float(h: u32) -> f32 {
    (h >> 8) as f32 / 16_777_216.0
}

/// Toroidal wrap into `[0, extent)`.
#[inline]
pub fn wrap(v: f32, extent: f32) -> f32 {
    if v >= 0.0 && v < extent {
        return v;
    }
    let r = v.rem_euclid(extent);
    // rem_euclid can round up to exactly `extent` for tiny negative inputs
    if r >= 0.0 && r < extent {
        r
    } else {
        0.0
    }
}

#[inline]
pub fn wrap_position(p: Vec2, extent: Vec2) -> Vec2 {
    Vec2::new(wrap(p.x, extent.x), wrap(p.y, extent.y))
}

/// Velocity of a particle at `position` for one tick.
pub fn field_velocity(field: &VectorField, position: Vec2, step_scale: f32) -> Vec2 {
    let max = field.max_magnitude();
    if max <= 0.0 {
        return Vec2::ZERO;
    }
    match field.cell_at(position) {
        Some(cell) => cell.direction() * (cell.magnitude / max) * step_scale,
        None => Vec2::ZERO,
    }
}

/// Advance one particle by one tick.
pub fn advect_particle(particle: &Particle, field: &VectorField, params: &AdvectParams) -> Particle {
    let extent = params.extent();
    let position = particle.position();
    let mut velocity = field_velocity(field, position, params.step_scale);

    let r = hash(particle.seed[0] ^ hash(particle.seed[1] ^ params.tick));
    if params.jitter > 0.0 {
        let angle = unit_float(r) * TAU;
        velocity += Vec2::new(angle.cos(), angle.sin()) * params.jitter * params.step_scale;
    }

    let moved = position + velocity;
    let mut next = wrap_position(moved, extent);
    // A wrapped particle starts a fresh stroke on the opposite edge
    let mut previous = if next != moved { next } else { position };

    if params.respawn_chance > 0.0 && unit_float(hash(r ^ 0x9e37_79b9)) < params.respawn_chance {
        next = wrap_position(
            Vec2::new(
                unit_float(hash(r.wrapping_add(1))) * extent.x,
                unit_float(hash(r.wrapping_add(2))) * extent.y,
            ),
            extent,
        );
        previous = next;
    }

    Particle {
        position: next.to_array(),
        previous: previous.to_array(),
        seed: particle.seed,
    }
}

/// CPU implementation of the advection step.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuAdvector;

impl CpuAdvector {
    /// Advance every particle in `particles` in place.
    pub fn step(&self, particles: &mut [Particle], field: &VectorField, params: &AdvectParams) {
        for particle in particles.iter_mut() {
            *particle = advect_particle(particle, field, params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldCell;

    fn params_for(field: &VectorField, step_scale: f32) -> AdvectParams {
        let config = AnimatorConfig::default().with_step_scale(step_scale);
        AdvectParams::new(field, &config, 0, 1)
    }

    fn particle_at(x: f32, y: f32) -> Particle {
        Particle::new(Vec2::new(x, y), 0x1234_5678_9abc_def0)
    }

    #[test]
    fn test_hash_basic_properties() {
        // Zero is a fixed point of this hash
        assert_eq!(hash(0), 0);
        assert_ne!(hash(1), hash(2));
        assert_eq!(hash(12345), hash(12345));
    }

    #[test]
    fn test_unit_float_range() {
        assert_eq!(unit_float(0), 0.0);
        assert!(unit_float(u32::MAX) < 1.0);
    }

    #[test]
    fn test_wrap_law() {
        assert_eq!(wrap(4.0, 4.0), 0.0);
        assert_eq!(wrap(4.5, 4.0), 0.5);
        assert_eq!(wrap(-0.5, 4.0), 3.5);
        assert_eq!(wrap(9.0, 4.0), 1.0);
        assert_eq!(wrap(2.0, 4.0), 2.0);

        // Tiny negative values must not land on the extent
        let w = wrap(-1e-9, 4.0);
        assert!(w >= 0.0 && w < 4.0);

        assert_eq!(wrap(f32::NAN, 4.0), 0.0);
    }

    #[test]
    fn test_wrap_law_sweep() {
        let extent = 7.0;
        let mut v = -50.0f32;
        while v < 50.0 {
            let w = wrap(v, extent);
            assert!(w >= 0.0 && w < extent, "wrap({}) = {}", v, w);
            v += 0.37;
        }
    }

    #[test]
    fn test_zero_field_holds_position() {
        let field = VectorField::still(8, 8).unwrap();
        let params = params_for(&field, 1.0);

        for (x, y) in [(0.0, 0.0), (3.3, 7.9), (7.999, 0.5)] {
            let p = particle_at(x, y);
            let next = advect_particle(&p, &field, &params);
            assert_eq!(next.position, p.position);
        }
    }

    #[test]
    fn test_single_cell_push() {
        let mut field = VectorField::still(4, 4).unwrap();
        field.set_cell(2, 2, FieldCell::new(Vec2::X, 5.0)).unwrap();
        let params = params_for(&field, 1.0);

        let next = advect_particle(&particle_at(2.0, 2.0), &field, &params);
        assert_eq!(next.position, [3.0, 2.0]);
        assert_eq!(next.previous, [2.0, 2.0]);
    }

    #[test]
    fn test_speed_scales_with_magnitude() {
        let mut cells = vec![FieldCell::new(Vec2::Y, 1.0); 2];
        cells[1] = FieldCell::new(Vec2::Y, 4.0);
        let field = VectorField::new(2, 1, cells).unwrap();
        let params = params_for(&field, 0.4);

        let slow = advect_particle(&particle_at(0.5, 0.0), &field, &params);
        let fast = advect_particle(&particle_at(1.5, 0.0), &field, &params);
        assert!((slow.position[1] - 0.1).abs() < 1e-6);
        assert!((fast.position[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_wrap_resets_stroke_start() {
        let field = VectorField::uniform(4, 4, Vec2::NEG_X, 1.0).unwrap();
        let params = params_for(&field, 1.0);

        let next = advect_particle(&particle_at(0.5, 1.0), &field, &params);
        assert_eq!(next.position, [3.5, 1.0]);
        assert_eq!(next.previous, next.position);
    }

    #[test]
    fn test_out_of_grid_particle_has_zero_velocity() {
        let field = VectorField::uniform(4, 4, Vec2::X, 1.0).unwrap();
        let params = params_for(&field, 1.0);

        // Not reachable after a wrap, but the lookup must not fail
        let next = advect_particle(&particle_at(-3.0, 1.0), &field, &params);
        assert_eq!(next.position, [1.0, 1.0]);
    }

    #[test]
    fn test_jitter_is_deterministic_per_seed() {
        let field = VectorField::still(16, 16).unwrap();
        let config = AnimatorConfig::default().with_jitter(0.5);
        let params = AdvectParams::new(&field, &config, 7, 1);

        let p = particle_at(8.0, 8.0);
        let a = advect_particle(&p, &field, &params);
        let b = advect_particle(&p, &field, &params);
        assert_eq!(a, b);

        let moved = Vec2::from_array(a.position) - p.position();
        assert!((moved.length() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_respawn_always() {
        let field = VectorField::still(16, 16).unwrap();
        let config = AnimatorConfig::default().with_respawn_chance(1.0);
        let params = AdvectParams::new(&field, &config, 3, 1);

        let next = advect_particle(&particle_at(1.0, 1.0), &field, &params);
        assert_eq!(next.previous, next.position);
        assert!(next.position[0] >= 0.0 && next.position[0] < 16.0);
        assert!(next.position[1] >= 0.0 && next.position[1] < 16.0);
    }

    #[test]
    fn test_cpu_advector_steps_slice() {
        let field = VectorField::uniform(4, 4, Vec2::X, 1.0).unwrap();
        let params = params_for(&field, 0.5);
        let mut particles = vec![particle_at(0.0, 0.0), particle_at(3.75, 2.0)];

        CpuAdvector.step(&mut particles, &field, &params);
        assert_eq!(particles[0].position, [0.5, 0.0]);
        assert_eq!(particles[1].position, [0.25, 2.0]);
    }

    #[test]
    fn test_params_layout() {
        // Must match the WGSL AdvectParams struct
        assert_eq!(std::mem::size_of::<AdvectParams>(), 48);
    }
}
