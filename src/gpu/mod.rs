//! GPU state: device context, resources, compute and render passes.
//!
//! The engine never creates a window or surface. The host either hands over
//! the device and queue it renders with ([`GpuContext::from_parts`]) or asks
//! for a headless device ([`GpuContext::new_headless`]), and supplies a
//! [`DrawTarget`] each frame.

pub mod advect;
pub mod particle_buffer;
pub mod reflect;
pub mod renderer;
pub mod resources;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{GpuError, ResourceError, ResourceErrorKind};

pub use advect::GpuAdvector;
pub use particle_buffer::DeviceParticleBuffer;
pub use renderer::Renderer;
pub use resources::{ParamHandle, ResourceManager, ShaderHandle, TextureHandle};

/// A device and queue plus what the engine needs to know about them.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    compute_supported: bool,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    /// Wrap a device the host already created.
    ///
    /// `compute_supported` should come from the adapter's downlevel flags;
    /// without it the advection step runs on the CPU.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue, compute_supported: bool) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            flag.store(true, Ordering::Release);
            tracing::error!(?reason, "GPU device lost: {}", message);
        });

        Self {
            device,
            queue,
            compute_supported,
            lost,
        }
    }

    /// Create a device without a surface (tests, offscreen rendering).
    pub fn new_headless() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_headless_async())
    }

    async fn new_headless_async() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let compute_supported = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("flowtrails device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        tracing::debug!(
            adapter = %adapter.get_info().name,
            compute_supported,
            "created headless GPU context"
        );

        Ok(Self::from_parts(device, queue, compute_supported))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Whether compute shaders can run on this device.
    pub fn supports_compute(&self) -> bool {
        self.compute_supported && !self.is_lost()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Fail with `ContextLost` once the device is gone.
    #[track_caller]
    pub fn check_alive(&self) -> Result<(), ResourceError> {
        if self.is_lost() {
            return Err(ResourceError::new(
                ResourceErrorKind::ContextLost,
                "the GPU device was lost",
            ));
        }
        Ok(())
    }

    /// Run device calls inside validation and out-of-memory error scopes.
    ///
    /// A validation error is reported with `kind`; an out-of-memory error is
    /// always reported as `Allocation`. Popping the scopes blocks, so this is
    /// for resource creation only; per-frame work goes through
    /// [`submit`](Self::submit).
    #[track_caller]
    pub(crate) fn scoped<R>(
        &self,
        kind: ResourceErrorKind,
        what: &str,
        f: impl FnOnce(&wgpu::Device) -> R,
    ) -> Result<R, ResourceError> {
        self.check_alive()?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        if let Some(e) = out_of_memory {
            return Err(ResourceError::new(
                ResourceErrorKind::Allocation,
                format!("{}: {}", what, e),
            ));
        }
        if let Some(e) = validation {
            return Err(ResourceError::new(kind, format!("{}: {}", what, e)));
        }
        self.check_alive()?;
        Ok(value)
    }

    /// Run per-frame device calls without error scopes.
    ///
    /// Never blocks. A device lost before or during `f` is reported as
    /// `ContextLost`; validation errors reach wgpu's uncaptured error handler.
    #[track_caller]
    pub(crate) fn submit<R>(&self, f: impl FnOnce(&wgpu::Device) -> R) -> Result<R, ResourceError> {
        self.check_alive()?;
        let value = f(&self.device);
        self.check_alive()?;
        Ok(value)
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("compute_supported", &self.compute_supported)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// The texture a frame is drawn into.
#[derive(Clone, Copy, Debug)]
pub struct DrawTarget<'a> {
    pub view: &'a wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

impl<'a> DrawTarget<'a> {
    pub fn new(view: &'a wgpu::TextureView, format: wgpu::TextureFormat, width: u32, height: u32) -> Self {
        Self {
            view,
            format,
            width,
            height,
        }
    }
}
