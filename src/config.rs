//! Engine configuration.
//!
//! Every behavioural switch lives in [`AnimatorConfig`] and is chosen at
//! runtime. The struct serialises with serde so a host can keep it next to
//! the rest of its composition settings.
//!
//! ```ignore
//! let config = AnimatorConfig::default()
//!     .with_render_mode(RenderMode::Textured)
//!     .with_clear_background(false)
//!     .with_step_scale(0.5);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How particle strokes are drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// One-pixel line segments (fastest).
    #[default]
    Lines,
    /// Wide quads sampling a soft circular sprite.
    Textured,
}

/// Where the advection step runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeBackend {
    /// GPU compute when the context supports it, CPU otherwise.
    #[default]
    Auto,
    /// Prefer GPU compute; still falls back to CPU without a capable device.
    Gpu,
    /// Always advance particles on the CPU.
    Cpu,
}

/// How much diagnostic output the engine emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Errors and warnings.
    #[default]
    Normal,
    /// Adds resource rebuild and resize diagnostics.
    Extra,
}

/// Runtime configuration for a [`FieldAnimator`](crate::FieldAnimator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimatorConfig {
    /// Lines or textured strokes.
    pub render_mode: RenderMode,
    /// Clear the target every frame. When false, strokes accumulate.
    pub clear_background: bool,
    /// Clear colour (RGBA, 0.0-1.0) when `clear_background` is set.
    pub background: [f32; 4],
    /// Logging detail.
    pub verbosity: Verbosity,
    /// Prefix attached to every log record as a span field.
    pub log_prefix: String,
    /// Advection backend selection.
    pub compute_backend: ComputeBackend,
    /// Distance, in cells, that a max-magnitude cell moves a particle per tick.
    pub step_scale: f32,
    /// Length of the seeded random perturbation added each tick, relative to `step_scale`.
    pub jitter: f32,
    /// Probability per tick that a particle respawns at a random position.
    pub respawn_chance: f32,
    /// Stroke colour (RGBA, 0.0-1.0).
    pub stroke_color: [f32; 4],
    /// Stroke width in pixels (textured mode).
    pub stroke_width: f32,
    /// Grid extent used before a vector field is supplied.
    pub grid_size: [u32; 2],
    /// Number of particles allocated at construction.
    pub initial_particles: usize,
    /// Seed for particle placement and per-particle seeds.
    pub seed: u64,
    /// Build sprites and validate shaders on a background thread.
    pub background_prep: bool,
}

impl Default for AnimatorConfig {
    fn default() -> Self {
        Self {
            render_mode: RenderMode::Lines,
            clear_background: true,
            background: [0.0, 0.0, 0.0, 1.0],
            verbosity: Verbosity::Normal,
            log_prefix: "flowtrails: ".to_string(),
            compute_backend: ComputeBackend::Auto,
            step_scale: 1.0,
            jitter: 0.0,
            respawn_chance: 0.0,
            stroke_color: [1.0, 1.0, 1.0, 1.0],
            stroke_width: 2.0,
            grid_size: [32, 32],
            initial_particles: 1000,
            seed: 0x5eed_f1e1d,
            background_prep: true,
        }
    }
}

impl AnimatorConfig {
    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values a setter would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_size[0] == 0 || self.grid_size[1] == 0 {
            return Err(ConfigError::EmptyGrid {
                num_x_bins: self.grid_size[0],
                num_y_bins: self.grid_size[1],
            });
        }
        if self.initial_particles == 0 {
            return Err(ConfigError::ZeroParticles);
        }
        if self.stroke_color.iter().any(|c| !c.is_finite()) {
            return Err(ConfigError::NonFiniteColor);
        }
        if !(self.stroke_width.is_finite() && self.stroke_width > 0.0) {
            return Err(ConfigError::InvalidStrokeWidth(self.stroke_width));
        }
        if !self.step_scale.is_finite() {
            return Err(invalid("step_scale", self.step_scale));
        }
        if !(self.jitter.is_finite() && self.jitter >= 0.0) {
            return Err(invalid("jitter", self.jitter));
        }
        if !(0.0..=1.0).contains(&self.respawn_chance) {
            return Err(invalid("respawn_chance", self.respawn_chance));
        }
        if let Some(&c) = self.background.iter().find(|c| !c.is_finite()) {
            return Err(invalid("background", c));
        }
        Ok(())
    }

    pub fn with_render_mode(mut self, mode: RenderMode) -> Self {
        self.render_mode = mode;
        self
    }

    pub fn with_clear_background(mut self, clear: bool) -> Self {
        self.clear_background = clear;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_compute_backend(mut self, backend: ComputeBackend) -> Self {
        self.compute_backend = backend;
        self
    }

    pub fn with_step_scale(mut self, step_scale: f32) -> Self {
        self.step_scale = step_scale;
        self
    }

    /// Set the seeded perturbation length. Negative values clamp to 0.
    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Set the per-tick respawn probability (clamped to 0.0-1.0).
    pub fn with_respawn_chance(mut self, chance: f32) -> Self {
        self.respawn_chance = chance.clamp(0.0, 1.0);
        self
    }

    pub fn with_grid_size(mut self, num_x_bins: u32, num_y_bins: u32) -> Self {
        self.grid_size = [num_x_bins, num_y_bins];
        self
    }

    pub fn with_initial_particles(mut self, count: usize) -> Self {
        self.initial_particles = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_background_prep(mut self, enabled: bool) -> Self {
        self.background_prep = enabled;
        self
    }

    /// True when warnings should be logged.
    pub(crate) fn warnings(&self) -> bool {
        self.verbosity >= Verbosity::Normal
    }

    /// True when extra diagnostics should be logged.
    pub(crate) fn extra_logging(&self) -> bool {
        self.verbosity >= Verbosity::Extra
    }
}

fn invalid(name: &'static str, value: f32) -> ConfigError {
    ConfigError::InvalidParameter { name, value }
}
