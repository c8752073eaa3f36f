//! Device copy of the particle pool.

use crate::error::{ResourceError, ResourceErrorKind};
use crate::gpu::GpuContext;
use crate::particles::{Particle, ParticleSystem};

const PARTICLE_SIZE: u64 = std::mem::size_of::<Particle>() as u64;

/// Storage/vertex buffer holding `capacity` particles.
///
/// Growing allocates a new buffer, copies the old contents on the GPU and
/// swaps; the old buffer is dropped once the copy is submitted. The host
/// mirror is never read back.
pub struct DeviceParticleBuffer {
    buffer: wgpu::Buffer,
    capacity: usize,
}

impl DeviceParticleBuffer {
    #[track_caller]
    pub fn new(ctx: &GpuContext, capacity: usize) -> Result<Self, ResourceError> {
        let capacity = capacity.max(1);
        let buffer = create_buffer(ctx, capacity)?;
        Ok(Self { buffer, capacity })
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ensure room for `count` particles, keeping existing contents.
    ///
    /// Returns `true` if the buffer was replaced (bindings must be rebuilt).
    /// On error the current buffer is untouched.
    #[track_caller]
    pub fn reserve(&mut self, ctx: &GpuContext, count: usize) -> Result<bool, ResourceError> {
        if count <= self.capacity {
            return Ok(false);
        }

        let grown = create_buffer(ctx, count)?;
        ctx.scoped(ResourceErrorKind::Device, "particle buffer copy", |device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Particle Buffer Grow"),
            });
            encoder.copy_buffer_to_buffer(&self.buffer, 0, &grown, 0, self.capacity as u64 * PARTICLE_SIZE);
            ctx.queue().submit(std::iter::once(encoder.finish()));
        })?;

        tracing::debug!(from = self.capacity, to = count, "grew device particle buffer");
        self.buffer = grown;
        self.capacity = count;
        Ok(true)
    }

    /// Write host ranges the device has not seen yet.
    #[track_caller]
    pub fn upload(&mut self, ctx: &GpuContext, particles: &mut ParticleSystem) -> Result<(), ResourceError> {
        ctx.check_alive()?;
        if particles.allocated_count() > self.capacity {
            return Err(ResourceError::new(
                ResourceErrorKind::Allocation,
                format!(
                    "{} particles allocated on the host but the device buffer holds {}",
                    particles.allocated_count(),
                    self.capacity
                ),
            ));
        }

        for range in particles.take_pending_uploads() {
            let offset = range.start as u64 * PARTICLE_SIZE;
            let data: &[u8] = bytemuck::cast_slice(particles.host_slice(range));
            ctx.queue().write_buffer(&self.buffer, offset, data);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceParticleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceParticleBuffer")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Check a particle count against the device limits.
pub fn check_capacity(limits: &wgpu::Limits, count: usize) -> Result<u64, String> {
    let bytes = (count as u64)
        .checked_mul(PARTICLE_SIZE)
        .ok_or_else(|| format!("{} particles overflow the buffer size", count))?;
    if bytes > limits.max_buffer_size {
        return Err(format!(
            "{} particles need {} bytes, device max buffer size is {}",
            count, bytes, limits.max_buffer_size
        ));
    }
    if bytes > limits.max_storage_buffer_binding_size as u64 {
        return Err(format!(
            "{} particles need {} bytes, device max storage binding is {}",
            count, bytes, limits.max_storage_buffer_binding_size
        ));
    }
    Ok(bytes)
}

#[track_caller]
fn create_buffer(ctx: &GpuContext, count: usize) -> Result<wgpu::Buffer, ResourceError> {
    let size = match check_capacity(&ctx.device().limits(), count) {
        Ok(size) => size,
        Err(message) => return Err(ResourceError::new(ResourceErrorKind::Allocation, message)),
    };

    ctx.scoped(ResourceErrorKind::Allocation, "particle buffer", |device| {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Particle Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_within_limits() {
        let limits = wgpu::Limits::default();
        assert_eq!(check_capacity(&limits, 1000), Ok(24_000));
    }

    #[test]
    fn test_capacity_over_binding_limit() {
        let limits = wgpu::Limits::default();
        let too_many = limits.max_storage_buffer_binding_size as usize / 24 + 1;
        assert!(check_capacity(&limits, too_many).is_err());
    }

    #[test]
    fn test_capacity_overflow() {
        let limits = wgpu::Limits::default();
        assert!(check_capacity(&limits, usize::MAX).is_err());
    }
}
