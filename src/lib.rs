//! # flowtrails - particle trails over a vector field
//!
//! Particles drift through a static rectilinear vector field and each
//! particle's last move is drawn as a GPU stroke. The engine renders into a
//! texture the host provides; it never opens a window.
//!
//! ## Quick Start
//!
//! ```ignore
//! use flowtrails::prelude::*;
//!
//! let ctx = Arc::new(GpuContext::new_headless()?);
//! let config = AnimatorConfig::default()
//!     .with_render_mode(RenderMode::Textured)
//!     .with_clear_background(false);
//! let mut animator = FieldAnimator::with_gpu(config, ctx)?;
//!
//! animator.set_vector_field(VectorField::uniform(32, 32, Vec2::X, 1.0)?);
//! animator.set_active_particle_count(10_000)?;
//! animator.set_stroke_color(Vec4::new(1.0, 0.6, 0.1, 0.5))?;
//!
//! // every frame
//! animator.animation_step()?;
//! animator.draw(&DrawTarget::new(&view, format, width, height))?;
//! ```
//!
//! ## Core Concepts
//!
//! ### Vector field
//!
//! A `num_x_bins x num_y_bins` grid of cells, each with a unit direction and
//! a magnitude. Build one with [`VectorField::new`] or parse the JSON
//! structure with [`VectorField::from_json`]:
//!
//! ```json
//! { "numXBins": 2, "numYBins": 1, "cells": [[1, 0, 1.0], [0, 1, 0.5]] }
//! ```
//!
//! ### Advection
//!
//! Each tick a particle at `p` reads the cell under `floor(p)` and moves by
//! `direction * magnitude / max_magnitude * step_scale`, wrapping at the
//! grid edges. The step runs as a compute kernel when the device supports
//! it and on the CPU otherwise (see [`ComputeBackend`]).
//!
//! ### Lazy rebuilds
//!
//! Setters only mark nodes of a [`DependencyGraph`] dirty. Buffers, bind
//! groups, uniforms and the stroke sprite are rebuilt at the next step or
//! draw, and only the ones downstream of what changed.
//!
//! ## Logging
//!
//! Everything goes through `tracing`; install a subscriber in the host to
//! see it. Records are emitted inside a `flowtrails` span carrying the
//! configured `log_prefix`.

pub mod advect;
mod animator;
pub mod config;
pub mod dependency;
pub mod error;
pub mod field;
pub mod gpu;
pub mod particles;
pub mod prepare;
pub mod shaders;
pub mod sprite;

pub use animator::FieldAnimator;
pub use config::{AnimatorConfig, ComputeBackend, RenderMode, Verbosity};
pub use dependency::{DependencyGraph, NodeId};
pub use error::{AnimatorError, ConfigError, GpuError, GraphError, ResourceError, ResourceErrorKind};
pub use field::{FieldCell, VectorField};
pub use glam::{Vec2, Vec4};
pub use gpu::{DrawTarget, GpuContext};
pub use particles::{MirrorState, Particle, ParticleSystem};

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::config::{AnimatorConfig, ComputeBackend, RenderMode, Verbosity};
    pub use crate::error::{AnimatorError, ConfigError, ResourceError};
    pub use crate::field::{FieldCell, VectorField};
    pub use crate::gpu::{DrawTarget, GpuContext};
    pub use crate::FieldAnimator;
    pub use crate::{Vec2, Vec4};
    pub use std::sync::Arc;
}
