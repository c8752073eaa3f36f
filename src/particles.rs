//! The particle pool.
//!
//! [`ParticleSystem`] owns the host side of the pool: a mirror of the device
//! buffer plus the sizing policy. The mirror is written by the host when
//! particles are (re)initialised and is the authoritative copy only while
//! the CPU path advances particles. Once a GPU step runs, the device copy
//! moves ahead and the mirror is marked [`MirrorState::Stale`]; it is never
//! read back.
//!
//! Host writes that the device has not seen yet are tracked as pending
//! upload ranges and drained by the device buffer before the next dispatch
//! or draw.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{AnimatorError, ConfigError, ResourceError, ResourceErrorKind};

/// One particle, laid out to match the WGSL `Particle` struct.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Particle {
    /// Current position in field space.
    pub position: [f32; 2],
    /// Position at the start of the last tick (stroke start).
    pub previous: [f32; 2],
    /// 64-bit seed as `[low, high]` words.
    pub seed: [u32; 2],
}

impl Particle {
    pub fn new(position: Vec2, seed: u64) -> Self {
        Self {
            position: position.to_array(),
            previous: position.to_array(),
            seed: [seed as u32, (seed >> 32) as u32],
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::from_array(self.position)
    }

    pub fn previous(&self) -> Vec2 {
        Vec2::from_array(self.previous)
    }

    pub fn seed(&self) -> u64 {
        self.seed[0] as u64 | ((self.seed[1] as u64) << 32)
    }
}

/// Whether the host mirror reflects the current particle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorState {
    /// The host copy is current (CPU path, or nothing stepped on the GPU yet).
    Valid,
    /// The device copy advanced past the host copy.
    Stale,
}

/// Host side of the particle pool.
#[derive(Debug)]
pub struct ParticleSystem {
    host: Vec<Particle>,
    active: usize,
    next_init: usize,
    extent: Vec2,
    rng: SmallRng,
    mirror: MirrorState,
    pending: Vec<Range<usize>>,
}

impl ParticleSystem {
    /// Create an empty pool over the given field extent.
    pub fn new(extent: Vec2, seed: u64) -> Self {
        Self {
            host: Vec::new(),
            active: 0,
            next_init: 0,
            extent,
            rng: SmallRng::seed_from_u64(seed),
            mirror: MirrorState::Valid,
            pending: Vec::new(),
        }
    }

    /// Number of particles simulated and drawn.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Number of particle slots backed by storage.
    pub fn allocated_count(&self) -> usize {
        self.host.len()
    }

    /// First slot the next [`randomize_particles`](Self::randomize_particles) call touches.
    pub fn next_particle_init(&self) -> usize {
        self.next_init
    }

    pub fn extent(&self) -> Vec2 {
        self.extent
    }

    pub fn mirror_state(&self) -> MirrorState {
        self.mirror
    }

    /// The host mirror, if it reflects the current state.
    pub fn host_particles(&self) -> Option<&[Particle]> {
        match self.mirror {
            MirrorState::Valid => Some(&self.host[..self.active]),
            MirrorState::Stale => None,
        }
    }

    /// Mutable access to the active slice for the CPU advection path.
    ///
    /// The touched range is queued for upload so a device copy stays in step.
    pub(crate) fn cpu_particles_mut(&mut self) -> &mut [Particle] {
        self.mirror = MirrorState::Valid;
        self.push_pending(0..self.active);
        &mut self.host[..self.active]
    }

    /// Record that a GPU step advanced the device copy.
    pub fn mark_device_advanced(&mut self) {
        self.mirror = MirrorState::Stale;
    }

    /// Set how many particles are simulated and drawn.
    ///
    /// Growing past the allocated count reallocates, keeps the existing
    /// particles, and randomises only the new slots. Shrinking never frees
    /// storage. On error nothing changes.
    pub fn set_active_count(&mut self, count: usize) -> Result<(), AnimatorError> {
        if count == 0 {
            return Err(ConfigError::ZeroParticles.into());
        }
        if count > self.host.len() {
            self.grow(count)?;
        }
        self.active = count;
        Ok(())
    }

    fn grow(&mut self, count: usize) -> Result<(), ResourceError> {
        let old = self.host.len();

        let mut grown: Vec<Particle> = Vec::new();
        grown.try_reserve_exact(count).map_err(|e| {
            ResourceError::new(
                ResourceErrorKind::Allocation,
                format!("host particle buffer for {} particles: {}", count, e),
            )
        })?;
        grown.extend_from_slice(&self.host);
        grown.resize(count, Particle::default());
        self.host = grown;

        self.next_init = old;
        self.randomize_particles(count - old);
        Ok(())
    }

    /// Assign random positions and fresh seeds to `count` particles.
    ///
    /// Starts at the next uninitialised slot and wraps to slot 0 once every
    /// allocated slot has been initialised.
    pub fn randomize_particles(&mut self, count: usize) {
        let allocated = self.host.len();
        if allocated == 0 {
            return;
        }

        let mut remaining = count.min(allocated);
        while remaining > 0 {
            if self.next_init >= allocated {
                self.next_init = 0;
            }
            let start = self.next_init;
            let end = (start + remaining).min(allocated);
            for slot in &mut self.host[start..end] {
                let position = Vec2::new(
                    self.rng.gen_range(0.0..self.extent.x),
                    self.rng.gen_range(0.0..self.extent.y),
                );
                *slot = Particle::new(position, self.rng.gen());
            }
            self.push_pending(start..end);
            remaining -= end - start;
            self.next_init = end;
        }
    }

    /// Move the pool to a new field extent.
    ///
    /// Every allocated particle is re-randomised so all positions lie inside
    /// the new grid, whichever copy is current.
    pub fn set_extent(&mut self, extent: Vec2) {
        if extent == self.extent {
            return;
        }
        self.extent = extent;
        self.next_init = 0;
        self.mirror = MirrorState::Valid;
        let allocated = self.host.len();
        self.randomize_particles(allocated);
    }

    /// Take the host ranges not yet uploaded to the device.
    pub fn take_pending_uploads(&mut self) -> Vec<Range<usize>> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending_uploads(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Host slots backing a pending range.
    pub fn host_slice(&self, range: Range<usize>) -> &[Particle] {
        &self.host[range]
    }

    fn push_pending(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        // Merge with an overlapping or touching range
        for existing in &mut self.pending {
            if range.start <= existing.end && existing.start <= range.end {
                existing.start = existing.start.min(range.start);
                existing.end = existing.end.max(range.end);
                return;
            }
        }
        self.pending.push(range);
    }
}
