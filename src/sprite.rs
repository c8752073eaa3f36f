//! Procedural stroke sprite.
//!
//! The textured render mode samples a small soft circle tinted by the stroke
//! colour. The alpha falls off smoothly from the centre to the edge; RGB is
//! the tint, so the sprite blends correctly with straight alpha.

use glam::Vec4;
use image::{Rgba, RgbaImage};

/// Sprite edge length in pixels.
pub const SPRITE_SIZE: u32 = 32;

/// Build the soft circular sprite for a stroke colour (components in 0.0-1.0).
pub fn sprite_image(color: Vec4) -> RgbaImage {
    let color = color.clamp(Vec4::ZERO, Vec4::ONE);
    let rgb = [to_u8(color.x), to_u8(color.y), to_u8(color.z)];
    let center = SPRITE_SIZE as f32 * 0.5;

    RgbaImage::from_fn(SPRITE_SIZE, SPRITE_SIZE, |x, y| {
        let dx = x as f32 + 0.5 - center;
        let dy = y as f32 + 0.5 - center;
        let r = (dx * dx + dy * dy).sqrt() / center;
        let falloff = 1.0 - smoothstep(0.5, 1.0, r);
        Rgba([rgb[0], rgb[1], rgb[2], to_u8(falloff * color.w)])
    })
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprite_dimensions() {
        let img = sprite_image(Vec4::ONE);
        assert_eq!(img.dimensions(), (SPRITE_SIZE, SPRITE_SIZE));
    }

    #[test]
    fn test_sprite_is_soft_circle() {
        let img = sprite_image(Vec4::new(1.0, 0.5, 0.0, 1.0));
        let center = img.get_pixel(16, 16);
        let corner = img.get_pixel(0, 0);

        assert_eq!(center.0, [255, 128, 0, 255]);
        assert_eq!(corner[3], 0);

        // Alpha never increases moving outward along a row
        let mut last = 255u8;
        for x in 16..32 {
            let a = img.get_pixel(x, 16)[3];
            assert!(a <= last);
            last = a;
        }
    }

    #[test]
    fn test_sprite_scales_alpha() {
        let img = sprite_image(Vec4::new(1.0, 1.0, 1.0, 0.5));
        assert_eq!(img.get_pixel(16, 16)[3], 128);
    }

    #[test]
    fn test_sprite_clamps_out_of_range_color() {
        let img = sprite_image(Vec4::new(2.0, -1.0, 0.0, 1.0));
        assert_eq!(img.get_pixel(16, 16).0, [255, 0, 0, 255]);
    }
}
