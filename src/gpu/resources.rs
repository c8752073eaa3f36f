//! Shader, parameter and texture lifetimes.
//!
//! Every GPU object lives in a [`ResourceManager`] slot and is addressed by a
//! generational handle. Releasing a handle (or dropping the manager) drops
//! the wgpu objects behind it. Handles from a released slot are rejected
//! with [`ResourceErrorKind::InvalidHandle`] rather than aliasing whatever
//! took the slot later.
//!
//! Shader parameters are resolved by name against the reflected uniform
//! block of the shader, checked against the member type, staged on the host
//! and written to the device by [`ResourceManager::flush_parameters`].
//!
//! Every call that fails leaves the previous resource in place.

use std::collections::HashMap;

use glam::{Vec2, Vec4};
use image::RgbaImage;
use slotmap::{new_key_type, SlotMap};
use wgpu::util::DeviceExt;

use crate::error::{ResourceError, ResourceErrorKind};
use crate::gpu::reflect::{reflect_uniform, validate_wgsl, ParamType, UniformLayout};
use crate::gpu::GpuContext;
use crate::sprite::sprite_image;

new_key_type! {
    /// Handle to a compiled shader and its uniform block.
    pub struct ShaderHandle;
    /// Handle to one named member of a shader's uniform block.
    pub struct ParamHandle;
    /// Handle to a sampled texture.
    pub struct TextureHandle;
}

/// Host copy of a shader's uniform block.
#[derive(Debug, Clone)]
struct ParameterBlock {
    layout: UniformLayout,
    staged: Vec<u8>,
    dirty: bool,
}

impl ParameterBlock {
    fn new(layout: UniformLayout) -> Self {
        let staged = vec![0u8; layout.size as usize];
        Self {
            layout,
            staged,
            dirty: true,
        }
    }

    /// Copy values of members that kept their name and type.
    fn carry_over(&mut self, previous: &ParameterBlock) {
        for member in &self.layout.members {
            let Some(old) = previous.layout.member(&member.name) else {
                continue;
            };
            if old.ty != member.ty || member.ty == ParamType::Other {
                continue;
            }
            let len = member.ty.size();
            let (src, dst) = (old.offset as usize, member.offset as usize);
            self.staged[dst..dst + len].copy_from_slice(&previous.staged[src..src + len]);
        }
        self.dirty = true;
    }

    #[track_caller]
    fn write(&mut self, slot: &ParamSlot, expected: ParamType, bytes: &[u8]) -> Result<(), ResourceError> {
        if slot.ty != expected {
            return Err(ResourceError::new(
                ResourceErrorKind::TypeMismatch,
                format!("parameter `{}` is {}, got {}", slot.name, slot.ty, expected),
            ));
        }
        let start = slot.offset as usize;
        let end = start + bytes.len();
        if end > self.staged.len() {
            return Err(ResourceError::new(
                ResourceErrorKind::InvalidHandle,
                format!("parameter `{}` lies outside its uniform block", slot.name),
            ));
        }
        self.staged[start..end].copy_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ParamSlot {
    shader: ShaderHandle,
    name: String,
    offset: u32,
    ty: ParamType,
}

/// Parameter handles, one per `(shader, name)`.
#[derive(Debug, Default)]
struct ParameterTable {
    slots: SlotMap<ParamHandle, ParamSlot>,
    by_name: HashMap<(ShaderHandle, String), ParamHandle>,
}

impl ParameterTable {
    #[track_caller]
    fn bind(&mut self, shader: ShaderHandle, block: &ParameterBlock, name: &str) -> Result<ParamHandle, ResourceError> {
        if let Some(handle) = self.by_name.get(&(shader, name.to_string())) {
            return Ok(*handle);
        }
        let Some(member) = block.layout.member(name) else {
            return Err(ResourceError::new(
                ResourceErrorKind::ParameterNotFound,
                format!("shader has no uniform member `{}`", name),
            ));
        };
        let handle = self.slots.insert(ParamSlot {
            shader,
            name: name.to_string(),
            offset: member.offset,
            ty: member.ty,
        });
        self.by_name.insert((shader, name.to_string()), handle);
        Ok(handle)
    }

    #[track_caller]
    fn slot(&self, handle: ParamHandle) -> Result<&ParamSlot, ResourceError> {
        self.slots.get(handle).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "unknown parameter handle")
        })
    }

    /// Check that every bound name of `shader` exists in `layout`.
    #[track_caller]
    fn check_rebind(&self, shader: ShaderHandle, layout: &UniformLayout) -> Result<(), ResourceError> {
        for slot in self.slots.values().filter(|s| s.shader == shader) {
            if layout.member(&slot.name).is_none() {
                return Err(ResourceError::new(
                    ResourceErrorKind::ParameterNotFound,
                    format!("replacement shader drops bound parameter `{}`", slot.name),
                ));
            }
        }
        Ok(())
    }

    /// Point existing handles of `shader` at the members of a new layout.
    fn rebind(&mut self, shader: ShaderHandle, layout: &UniformLayout) {
        for slot in self.slots.values_mut().filter(|s| s.shader == shader) {
            if let Some(member) = layout.member(&slot.name) {
                slot.offset = member.offset;
                slot.ty = member.ty;
            }
        }
    }

    fn remove_shader(&mut self, shader: ShaderHandle) {
        self.slots.retain(|_, slot| slot.shader != shader);
        self.by_name.retain(|(owner, _), _| *owner != shader);
    }
}

struct ShaderProgram {
    label: String,
    module: wgpu::ShaderModule,
    uniform_buffer: wgpu::Buffer,
    block: ParameterBlock,
}

/// A sampled texture with its view and sampler.
pub struct SpriteTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
}

/// Owner of shaders, parameter handles and textures.
#[derive(Default)]
pub struct ResourceManager {
    shaders: SlotMap<ShaderHandle, ShaderProgram>,
    params: ParameterTable,
    textures: SlotMap<TextureHandle, SpriteTexture>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile WGSL and reflect the uniform block at `group`/`binding`.
    #[track_caller]
    pub fn compile_shader(
        &mut self,
        ctx: &GpuContext,
        label: &str,
        source: &str,
        group: u32,
        binding: u32,
    ) -> Result<ShaderHandle, ResourceError> {
        ctx.check_alive()?;
        let block = ParameterBlock::new(reflect_layout(label, source, group, binding)?);
        let (module, uniform_buffer) = create_program(ctx, label, source, block.layout.size)?;

        Ok(self.shaders.insert(ShaderProgram {
            label: label.to_string(),
            module,
            uniform_buffer,
            block,
        }))
    }

    /// Swap in new source for an existing shader.
    ///
    /// Parameter handles stay valid and keep their staged values. If the new
    /// source fails to compile, or drops a bound parameter, the old program
    /// stays in use.
    #[track_caller]
    pub fn replace_shader(&mut self, ctx: &GpuContext, shader: ShaderHandle, source: &str) -> Result<(), ResourceError> {
        ctx.check_alive()?;
        let program = self.shaders.get(shader).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "unknown shader handle")
        })?;

        let (group, binding) = (program.block.layout.group, program.block.layout.binding);
        let mut block = ParameterBlock::new(reflect_layout(&program.label, source, group, binding)?);
        self.params.check_rebind(shader, &block.layout)?;
        let (module, uniform_buffer) = create_program(ctx, &program.label, source, block.layout.size)?;
        block.carry_over(&program.block);

        self.params.rebind(shader, &block.layout);
        if let Some(program) = self.shaders.get_mut(shader) {
            program.module = module;
            program.uniform_buffer = uniform_buffer;
            program.block = block;
        }
        Ok(())
    }

    /// Drop a shader and every parameter handle bound to it.
    #[track_caller]
    pub fn release_shader(&mut self, shader: ShaderHandle) -> Result<(), ResourceError> {
        self.shaders.remove(shader).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "unknown shader handle")
        })?;
        self.params.remove_shader(shader);
        Ok(())
    }

    /// Resolve a uniform member by name. Binding the same name twice returns
    /// the same handle.
    #[track_caller]
    pub fn bind_parameter(&mut self, ctx: &GpuContext, shader: ShaderHandle, name: &str) -> Result<ParamHandle, ResourceError> {
        ctx.check_alive()?;
        let program = self.shaders.get(shader).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "unknown shader handle")
        })?;
        self.params.bind(shader, &program.block, name)
    }

    #[track_caller]
    pub fn set_color(&mut self, ctx: &GpuContext, param: ParamHandle, color: Vec4) -> Result<(), ResourceError> {
        self.stage(ctx, param, ParamType::Vec4F32, bytemuck::bytes_of(&color.to_array()))
    }

    #[track_caller]
    pub fn set_size(&mut self, ctx: &GpuContext, param: ParamHandle, size: Vec2) -> Result<(), ResourceError> {
        self.stage(ctx, param, ParamType::Vec2F32, bytemuck::bytes_of(&size.to_array()))
    }

    #[track_caller]
    pub fn set_scalar(&mut self, ctx: &GpuContext, param: ParamHandle, value: f32) -> Result<(), ResourceError> {
        self.stage(ctx, param, ParamType::F32, bytemuck::bytes_of(&value))
    }

    #[track_caller]
    fn stage(&mut self, ctx: &GpuContext, param: ParamHandle, expected: ParamType, bytes: &[u8]) -> Result<(), ResourceError> {
        ctx.check_alive()?;
        let slot = self.params.slot(param)?;
        let program = self.shaders.get_mut(slot.shader).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "parameter belongs to a released shader")
        })?;
        program.block.write(slot, expected, bytes)
    }

    /// Upload every staged uniform block that changed.
    #[track_caller]
    pub fn flush_parameters(&mut self, ctx: &GpuContext) -> Result<(), ResourceError> {
        ctx.check_alive()?;
        for program in self.shaders.values_mut() {
            if program.block.dirty {
                ctx.queue().write_buffer(&program.uniform_buffer, 0, &program.block.staged);
                program.block.dirty = false;
            }
        }
        Ok(())
    }

    /// Create the soft circular stroke sprite tinted by `color`.
    #[track_caller]
    pub fn create_texture(&mut self, ctx: &GpuContext, color: Vec4) -> Result<TextureHandle, ResourceError> {
        self.create_texture_from_image(ctx, "stroke sprite", &sprite_image(color))
    }

    /// Upload prepared RGBA pixels with a linear, edge-clamped sampler.
    #[track_caller]
    pub fn create_texture_from_image(
        &mut self,
        ctx: &GpuContext,
        label: &str,
        image: &RgbaImage,
    ) -> Result<TextureHandle, ResourceError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ResourceError::new(
                ResourceErrorKind::Allocation,
                format!("{}: empty image", label),
            ));
        }

        let sprite = ctx.scoped(ResourceErrorKind::Device, label, |device| {
            let size = wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            };
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });

            ctx.queue().write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                image.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * width),
                    rows_per_image: Some(height),
                },
                size,
            );

            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            });

            SpriteTexture {
                texture,
                view,
                sampler,
            }
        })?;

        Ok(self.textures.insert(sprite))
    }

    #[track_caller]
    pub fn release_texture(&mut self, texture: TextureHandle) -> Result<(), ResourceError> {
        self.textures.remove(texture).map(|_| ()).ok_or_else(|| {
            ResourceError::new(ResourceErrorKind::InvalidHandle, "unknown texture handle")
        })
    }

    pub fn texture(&self, texture: TextureHandle) -> Option<&SpriteTexture> {
        self.textures.get(texture)
    }

    pub fn shader_module(&self, shader: ShaderHandle) -> Option<&wgpu::ShaderModule> {
        self.shaders.get(shader).map(|p| &p.module)
    }

    pub fn uniform_buffer(&self, shader: ShaderHandle) -> Option<&wgpu::Buffer> {
        self.shaders.get(shader).map(|p| &p.uniform_buffer)
    }

    pub fn uniform_layout(&self, shader: ShaderHandle) -> Option<&UniformLayout> {
        self.shaders.get(shader).map(|p| &p.block.layout)
    }

    /// Staged (not necessarily flushed) bytes of a shader's uniform block.
    pub fn staged_uniforms(&self, shader: ShaderHandle) -> Option<&[u8]> {
        self.shaders.get(shader).map(|p| p.block.staged.as_slice())
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("shaders", &self.shaders.len())
            .field("params", &self.params.slots.len())
            .field("textures", &self.textures.len())
            .finish()
    }
}

#[track_caller]
fn reflect_layout(label: &str, source: &str, group: u32, binding: u32) -> Result<UniformLayout, ResourceError> {
    let module = match validate_wgsl(source) {
        Ok(module) => module,
        Err(message) => {
            return Err(ResourceError::new(
                ResourceErrorKind::ShaderCompile,
                format!("{}: {}", label, message),
            ))
        }
    };
    match reflect_uniform(&module, group, binding) {
        Some(layout) => Ok(layout),
        None => Err(ResourceError::new(
            ResourceErrorKind::ShaderCompile,
            format!("{}: no uniform block at group {} binding {}", label, group, binding),
        )),
    }
}

#[track_caller]
fn create_program(
    ctx: &GpuContext,
    label: &str,
    source: &str,
    uniform_size: u32,
) -> Result<(wgpu::ShaderModule, wgpu::Buffer), ResourceError> {
    ctx.scoped(ResourceErrorKind::ShaderCompile, label, |device| {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &vec![0u8; uniform_size.max(16) as usize],
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        (module, uniform_buffer)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderMode;
    use crate::shaders::trail_shader;

    fn stroke_block() -> ParameterBlock {
        ParameterBlock::new(reflect_layout("stroke", &trail_shader(RenderMode::Lines), 0, 0).unwrap())
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn shader_key() -> ShaderHandle {
        let mut keys: SlotMap<ShaderHandle, ()> = SlotMap::with_key();
        keys.insert(())
    }

    #[test]
    fn test_bind_is_idempotent() {
        let block = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();

        let a = table.bind(shader, &block, "color").unwrap();
        let b = table.bind(shader, &block, "color").unwrap();
        let c = table.bind(shader, &block, "extent").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.slots.len(), 2);
    }

    #[test]
    fn test_bind_unknown_name() {
        let block = stroke_block();
        let mut table = ParameterTable::default();
        let err = table.bind(shader_key(), &block, "colour").unwrap_err();
        assert_eq!(err.kind, ResourceErrorKind::ParameterNotFound);
    }

    #[test]
    fn test_write_checks_type() {
        let mut block = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();
        let color = table.bind(shader, &block, "color").unwrap();
        let slot = table.slot(color).unwrap().clone();

        let before = block.staged.clone();
        let err = block
            .write(&slot, ParamType::Vec2F32, bytemuck::bytes_of(&[1.0f32, 2.0]))
            .unwrap_err();
        assert_eq!(err.kind, ResourceErrorKind::TypeMismatch);
        assert_eq!(block.staged, before);

        block
            .write(&slot, ParamType::Vec4F32, bytemuck::bytes_of(&[0.25f32, 0.5, 0.75, 1.0]))
            .unwrap();
        assert_eq!(floats(&block.staged[0..16]), vec![0.25, 0.5, 0.75, 1.0]);
        assert!(block.dirty);
    }

    #[test]
    fn test_write_at_member_offset() {
        let mut block = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();
        let size = table.bind(shader, &block, "stroke_size").unwrap();
        let slot = table.slot(size).unwrap().clone();

        block
            .write(&slot, ParamType::Vec2F32, bytemuck::bytes_of(&[3.0f32, 4.0]))
            .unwrap();
        assert_eq!(floats(&block.staged)[6..8], [3.0, 4.0]);
    }

    #[test]
    fn test_rebind_requires_bound_names() {
        let block = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();
        table.bind(shader, &block, "stroke_size").unwrap();

        let mut reduced = block.layout.clone();
        reduced.members.retain(|m| m.name != "stroke_size");
        let err = table.check_rebind(shader, &reduced).unwrap_err();
        assert_eq!(err.kind, ResourceErrorKind::ParameterNotFound);
        assert!(table.check_rebind(shader, &block.layout).is_ok());
    }

    #[test]
    fn test_carry_over_keeps_matching_values() {
        let mut old = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();
        let color = table.bind(shader, &old, "color").unwrap();
        let slot = table.slot(color).unwrap().clone();
        old.write(&slot, ParamType::Vec4F32, bytemuck::bytes_of(&[1.0f32, 0.0, 0.0, 1.0]))
            .unwrap();

        let mut new = stroke_block();
        new.carry_over(&old);
        assert_eq!(&new.staged[0..16], &old.staged[0..16]);
    }

    #[test]
    fn test_remove_shader_drops_handles() {
        let block = stroke_block();
        let shader = shader_key();
        let mut table = ParameterTable::default();
        let color = table.bind(shader, &block, "color").unwrap();

        table.remove_shader(shader);
        assert_eq!(table.slot(color).unwrap_err().kind, ResourceErrorKind::InvalidHandle);
        assert!(table.by_name.is_empty());
    }
}
