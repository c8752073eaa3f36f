//! WGSL validation and uniform reflection with naga.
//!
//! Shader source is parsed and validated before it reaches wgpu so errors
//! come back with source context instead of a device validation panic. The
//! same parse gives the layout of the uniform block, which is what the
//! parameter API type-checks against.

use std::fmt;

use naga::front::wgsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, ScalarKind, TypeInner, VectorSize};

/// Type of a uniform block member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    F32,
    U32,
    I32,
    Vec2F32,
    Vec3F32,
    Vec4F32,
    /// Anything the parameter API cannot write (matrices, arrays, structs).
    Other,
}

impl ParamType {
    /// Size in bytes when written into the uniform block.
    pub fn size(&self) -> usize {
        match self {
            ParamType::F32 | ParamType::U32 | ParamType::I32 => 4,
            ParamType::Vec2F32 => 8,
            ParamType::Vec3F32 => 12,
            ParamType::Vec4F32 => 16,
            ParamType::Other => 0,
        }
    }

    fn from_inner(inner: &TypeInner) -> Self {
        match inner {
            TypeInner::Scalar(scalar) if scalar.width == 4 => match scalar.kind {
                ScalarKind::Float => ParamType::F32,
                ScalarKind::Uint => ParamType::U32,
                ScalarKind::Sint => ParamType::I32,
                _ => ParamType::Other,
            },
            TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float && scalar.width == 4 => {
                match size {
                    VectorSize::Bi => ParamType::Vec2F32,
                    VectorSize::Tri => ParamType::Vec3F32,
                    VectorSize::Quad => ParamType::Vec4F32,
                }
            }
            _ => ParamType::Other,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::F32 => "f32",
            ParamType::U32 => "u32",
            ParamType::I32 => "i32",
            ParamType::Vec2F32 => "vec2<f32>",
            ParamType::Vec3F32 => "vec3<f32>",
            ParamType::Vec4F32 => "vec4<f32>",
            ParamType::Other => "unsupported type",
        };
        f.write_str(name)
    }
}

/// One member of a uniform struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub ty: ParamType,
}

/// Reflected layout of the uniform block at a group/binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformLayout {
    pub group: u32,
    pub binding: u32,
    /// Size of the struct in bytes, padding included.
    pub size: u32,
    pub members: Vec<UniformMember>,
}

impl UniformLayout {
    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Parse and validate WGSL source.
///
/// Errors are rendered with source context.
pub fn validate_wgsl(source: &str) -> Result<naga::Module, String> {
    let module = wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| e.emit_to_string(source))?;

    Ok(module)
}

/// Find the uniform struct bound at `group`/`binding`.
pub fn reflect_uniform(module: &naga::Module, group: u32, binding: u32) -> Option<UniformLayout> {
    let global = module.global_variables.iter().find_map(|(_, var)| {
        let bound = var.binding.as_ref()?;
        (var.space == AddressSpace::Uniform && bound.group == group && bound.binding == binding)
            .then_some(var)
    })?;

    match &module.types[global.ty].inner {
        TypeInner::Struct { members, span } => Some(UniformLayout {
            group,
            binding,
            size: *span,
            members: members
                .iter()
                .filter_map(|m| {
                    Some(UniformMember {
                        name: m.name.clone()?,
                        offset: m.offset,
                        ty: ParamType::from_inner(&module.types[m.ty].inner),
                    })
                })
                .collect(),
        }),
        other => {
            // A bare value at the binding; expose it as a single member
            let ty = ParamType::from_inner(other);
            Some(UniformLayout {
                group,
                binding,
                size: ty.size().max(16) as u32,
                members: vec![UniformMember {
                    name: global.name.clone().unwrap_or_default(),
                    offset: 0,
                    ty,
                }],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderMode;
    use crate::shaders::trail_shader;

    #[test]
    fn test_reflect_stroke_uniforms() {
        let module = validate_wgsl(&trail_shader(RenderMode::Lines)).unwrap();
        let layout = reflect_uniform(&module, 0, 0).unwrap();

        assert_eq!(layout.size, 32);
        assert_eq!(
            layout.member("color"),
            Some(&UniformMember {
                name: "color".into(),
                offset: 0,
                ty: ParamType::Vec4F32
            })
        );
        assert_eq!(layout.member("extent").unwrap().offset, 16);
        assert_eq!(layout.member("stroke_size").unwrap().offset, 24);
        assert_eq!(layout.member("stroke_size").unwrap().ty, ParamType::Vec2F32);
        assert!(layout.member("missing").is_none());
    }

    #[test]
    fn test_reflect_missing_binding() {
        let module = validate_wgsl(&trail_shader(RenderMode::Lines)).unwrap();
        assert!(reflect_uniform(&module, 0, 5).is_none());
        assert!(reflect_uniform(&module, 1, 0).is_none());
    }

    #[test]
    fn test_reflect_scalar_member_types() {
        let source = r#"
struct Params {
    scale: f32,
    count: u32,
    offset: i32,
    tint: vec3<f32>,
    transform: mat4x4<f32>,
};
@group(1) @binding(3) var<uniform> params: Params;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(params.tint * params.scale, f32(params.count) + f32(params.offset)) * params.transform;
}
"#;
        let module = validate_wgsl(source).unwrap();
        let layout = reflect_uniform(&module, 1, 3).unwrap();
        let types: Vec<ParamType> = layout.members.iter().map(|m| m.ty).collect();
        assert_eq!(
            types,
            vec![
                ParamType::F32,
                ParamType::U32,
                ParamType::I32,
                ParamType::Vec3F32,
                ParamType::Other
            ]
        );
    }

    #[test]
    fn test_validate_reports_parse_error() {
        let err = validate_wgsl("fn broken( {").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_validate_reports_type_error() {
        let err = validate_wgsl("fn f() -> f32 { return 1u; }").unwrap_err();
        assert!(!err.is_empty());
    }
}
