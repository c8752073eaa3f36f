//! Error types for flowtrails.
//!
//! Three families of failure exist:
//! - [`ConfigError`]: a setter rejected its input, the previous state is kept.
//! - [`ResourceError`]: a GPU or allocation call failed, the last valid
//!   resource stays bound.
//! - [`GpuError`]: creating a headless device failed.
//!
//! [`GraphError`] is only raised while the dependency graph is wired up.
//!
//! [`AnimatorError`] wraps the first two and [`GraphError`] for the public [`FieldAnimator`](crate::FieldAnimator) API.

use std::fmt;
use std::panic::Location;

/// Errors raised by setters when the requested configuration is invalid.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Grid dimensions must both be non-zero.
    EmptyGrid { num_x_bins: u32, num_y_bins: u32 },
    /// Number of cells does not match `num_x_bins * num_y_bins`.
    CellCountMismatch { expected: usize, actual: usize },
    /// A direction or magnitude was NaN or infinite.
    NonFiniteCell { index: usize },
    /// Cell coordinates lie outside the grid.
    CellOutOfRange { x: u32, y: u32 },
    /// Magnitudes must be zero or positive.
    NegativeMagnitude { index: usize, magnitude: f32 },
    /// The declared maximum magnitude is below a cell's magnitude.
    MaxMagnitudeTooSmall { declared: f32, actual: f32 },
    /// The active particle count must be at least one.
    ZeroParticles,
    /// A colour component was NaN or infinite.
    NonFiniteColor,
    /// Stroke widths must be finite and positive.
    InvalidStrokeWidth(f32),
    /// An advection or clear setting was non-finite or out of its range.
    InvalidParameter { name: &'static str, value: f32 },
    /// The field structure could not be parsed.
    Json(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyGrid { num_x_bins, num_y_bins } => write!(
                f,
                "Vector field grid must be non-empty, got {}x{}",
                num_x_bins, num_y_bins
            ),
            ConfigError::CellCountMismatch { expected, actual } => write!(
                f,
                "Vector field has {} cells but the grid needs {}",
                actual, expected
            ),
            ConfigError::NonFiniteCell { index } => {
                write!(f, "Vector field cell {} is not finite", index)
            }
            ConfigError::CellOutOfRange { x, y } => {
                write!(f, "Cell ({}, {}) is outside the vector field grid", x, y)
            }
            ConfigError::NegativeMagnitude { index, magnitude } => write!(
                f,
                "Vector field cell {} has negative magnitude {}",
                index, magnitude
            ),
            ConfigError::MaxMagnitudeTooSmall { declared, actual } => write!(
                f,
                "Declared max magnitude {} is below the largest cell magnitude {}",
                declared, actual
            ),
            ConfigError::ZeroParticles => write!(f, "Particle count must be at least 1"),
            ConfigError::NonFiniteColor => write!(f, "Stroke colour must be finite"),
            ConfigError::InvalidStrokeWidth(w) => {
                write!(f, "Stroke width must be finite and positive, got {}", w)
            }
            ConfigError::InvalidParameter { name, value } => {
                write!(f, "Config value {} is out of range: {}", name, value)
            }
            ConfigError::Json(msg) => write!(f, "Invalid vector field structure: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e.to_string())
    }
}

/// Category of a [`ResourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    /// Host or device memory could not be allocated.
    Allocation,
    /// WGSL failed to parse, validate, or compile.
    ShaderCompile,
    /// The shader has no uniform member with the requested name.
    ParameterNotFound,
    /// The value type does not match the uniform member type.
    TypeMismatch,
    /// The handle was released or belongs to another manager.
    InvalidHandle,
    /// The device was lost; nothing can be created until it is replaced.
    ContextLost,
    /// Any other error reported by the device.
    Device,
}

impl fmt::Display for ResourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceErrorKind::Allocation => "allocation",
            ResourceErrorKind::ShaderCompile => "shader compile",
            ResourceErrorKind::ParameterNotFound => "parameter not found",
            ResourceErrorKind::TypeMismatch => "type mismatch",
            ResourceErrorKind::InvalidHandle => "invalid handle",
            ResourceErrorKind::ContextLost => "context lost",
            ResourceErrorKind::Device => "device",
        };
        f.write_str(name)
    }
}

/// A failed GPU or allocation call.
///
/// `location` records where the error was raised so log output can be traced
/// back to the failing call site.
#[derive(Debug, Clone)]
pub struct ResourceError {
    pub kind: ResourceErrorKind,
    pub message: String,
    pub location: &'static Location<'static>,
}

impl ResourceError {
    #[track_caller]
    pub fn new(kind: ResourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Emit this error through the logging facade.
    pub fn log(&self) {
        tracing::error!(
            kind = %self.kind,
            file = self.location.file(),
            line = self.location.line(),
            "{}",
            self.message
        );
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error at {}:{}: {}",
            self.kind,
            self.location.file(),
            self.location.line(),
            self.message
        )
    }
}

impl std::error::Error for ResourceError {}

/// Errors that can occur while creating a headless GPU context.
#[derive(Debug)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    NoAdapter,
    /// Failed to create GPU device.
    DeviceCreation(wgpu::RequestDeviceError),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoAdapter => write!(f, "No compatible GPU adapter found"),
            GpuError::DeviceCreation(e) => write!(f, "Failed to create GPU device: {}", e),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceCreation(e) => Some(e),
            GpuError::NoAdapter => None,
        }
    }
}

impl From<wgpu::RequestDeviceError> for GpuError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        GpuError::DeviceCreation(e)
    }
}

/// Errors raised while wiring the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// A node id was removed or belongs to another graph.
    UnknownNode,
    /// The edge would make a node depend on itself.
    Cycle { from: &'static str, to: &'static str },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::UnknownNode => write!(f, "Unknown dependency node"),
            GraphError::Cycle { from, to } => {
                write!(f, "Edge {} -> {} would create a dependency cycle", from, to)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors returned by the [`FieldAnimator`](crate::FieldAnimator) API.
#[derive(Debug, Clone)]
pub enum AnimatorError {
    /// The request was rejected; nothing changed.
    Config(ConfigError),
    /// A resource could not be created; the previous one is still in use.
    Resource(ResourceError),
    /// The dependency graph could not be wired.
    Graph(GraphError),
}

impl fmt::Display for AnimatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnimatorError::Config(e) => write!(f, "Configuration error: {}", e),
            AnimatorError::Resource(e) => write!(f, "Resource error: {}", e),
            AnimatorError::Graph(e) => write!(f, "Dependency graph error: {}", e),
        }
    }
}

impl std::error::Error for AnimatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnimatorError::Config(e) => Some(e),
            AnimatorError::Resource(e) => Some(e),
            AnimatorError::Graph(e) => Some(e),
        }
    }
}

impl From<ConfigError> for AnimatorError {
    fn from(e: ConfigError) -> Self {
        AnimatorError::Config(e)
    }
}

impl From<GraphError> for AnimatorError {
    fn from(e: GraphError) -> Self {
        AnimatorError::Graph(e)
    }
}

impl From<ResourceError> for AnimatorError {
    fn from(e: ResourceError) -> Self {
        AnimatorError::Resource(e)
    }
}
