//! Rectilinear 2D vector fields.
//!
//! A [`VectorField`] is a `num_x_bins × num_y_bins` grid. Each cell stores a
//! unit direction and a non-negative magnitude; particles inside the cell move
//! along the direction at a speed proportional to `magnitude / max_magnitude`.
//!
//! Cells are stored row-major: the cell containing field-space point `(x, y)`
//! is `floor(y) * num_x_bins + floor(x)`.
//!
//! # Structure Input
//!
//! Fields can be built from the JSON structure a composition supplies:
//!
//! ```ignore
//! let field = VectorField::from_json(r#"{
//!     "numXBins": 2,
//!     "numYBins": 1,
//!     "cells": [
//!         { "direction": [1.0, 0.0], "magnitude": 2.0 },
//!         [0.0, 1.0, 1.0]
//!     ]
//! }"#)?;
//! ```

use bytemuck::{Pod, Zeroable};
use glam::{IVec2, Vec2};
use serde::Deserialize;

use crate::error::ConfigError;

/// One grid cell, laid out for direct upload to a storage buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FieldCell {
    /// Unit direction (or zero).
    pub direction: [f32; 2],
    /// Non-negative magnitude.
    pub magnitude: f32,
    pub _pad: f32,
}

impl FieldCell {
    /// Build a cell, normalising a non-zero direction.
    pub fn new(direction: Vec2, magnitude: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero().to_array(),
            magnitude,
            _pad: 0.0,
        }
    }

    /// A zero-magnitude cell.
    pub fn still() -> Self {
        Self::default()
    }

    pub fn direction(&self) -> Vec2 {
        Vec2::from_array(self.direction)
    }
}

/// An immutable grid of direction + magnitude samples.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorField {
    num_x_bins: u32,
    num_y_bins: u32,
    cells: Vec<FieldCell>,
    max_magnitude: f32,
}

impl VectorField {
    /// Create a field from row-major cells.
    ///
    /// The maximum magnitude is computed from the cells.
    pub fn new(num_x_bins: u32, num_y_bins: u32, cells: Vec<FieldCell>) -> Result<Self, ConfigError> {
        Self::with_max_magnitude(num_x_bins, num_y_bins, cells, None)
    }

    /// Create a field with an optional declared upper bound on magnitude.
    ///
    /// A declared bound below the largest cell magnitude is rejected.
    pub fn with_max_magnitude(
        num_x_bins: u32,
        num_y_bins: u32,
        cells: Vec<FieldCell>,
        declared_max: Option<f32>,
    ) -> Result<Self, ConfigError> {
        if num_x_bins == 0 || num_y_bins == 0 {
            return Err(ConfigError::EmptyGrid { num_x_bins, num_y_bins });
        }
        let expected = num_x_bins as usize * num_y_bins as usize;
        if cells.len() != expected {
            return Err(ConfigError::CellCountMismatch {
                expected,
                actual: cells.len(),
            });
        }

        let mut actual_max = 0.0f32;
        for (index, cell) in cells.iter().enumerate() {
            let finite = cell.direction.iter().all(|c| c.is_finite()) && cell.magnitude.is_finite();
            if !finite {
                return Err(ConfigError::NonFiniteCell { index });
            }
            if cell.magnitude < 0.0 {
                return Err(ConfigError::NegativeMagnitude {
                    index,
                    magnitude: cell.magnitude,
                });
            }
            actual_max = actual_max.max(cell.magnitude);
        }

        let max_magnitude = match declared_max {
            Some(declared) if !declared.is_finite() || declared < actual_max => {
                return Err(ConfigError::MaxMagnitudeTooSmall {
                    declared,
                    actual: actual_max,
                });
            }
            Some(declared) => declared,
            None => actual_max,
        };

        Ok(Self {
            num_x_bins,
            num_y_bins,
            cells,
            max_magnitude,
        })
    }

    /// A field where every cell has zero magnitude.
    pub fn still(num_x_bins: u32, num_y_bins: u32) -> Result<Self, ConfigError> {
        let count = num_x_bins as usize * num_y_bins as usize;
        Self::new(num_x_bins, num_y_bins, vec![FieldCell::still(); count])
    }

    /// A field where every cell shares the same direction and magnitude.
    pub fn uniform(
        num_x_bins: u32,
        num_y_bins: u32,
        direction: Vec2,
        magnitude: f32,
    ) -> Result<Self, ConfigError> {
        let count = num_x_bins as usize * num_y_bins as usize;
        Self::new(num_x_bins, num_y_bins, vec![FieldCell::new(direction, magnitude); count])
    }

    /// Parse the composition's JSON field structure.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let source: FieldSource = serde_json::from_str(json)?;
        source.into_field()
    }

    pub fn num_x_bins(&self) -> u32 {
        self.num_x_bins
    }

    pub fn num_y_bins(&self) -> u32 {
        self.num_y_bins
    }

    /// Grid extent in field space.
    pub fn extent(&self) -> Vec2 {
        Vec2::new(self.num_x_bins as f32, self.num_y_bins as f32)
    }

    pub fn max_magnitude(&self) -> f32 {
        self.max_magnitude
    }

    /// Row-major cells.
    pub fn cells(&self) -> &[FieldCell] {
        &self.cells
    }

    /// The cell at integer coordinates, or `None` outside the grid.
    pub fn cell(&self, coord: IVec2) -> Option<&FieldCell> {
        if coord.x < 0 || coord.y < 0 {
            return None;
        }
        let (x, y) = (coord.x as u32, coord.y as u32);
        if x >= self.num_x_bins || y >= self.num_y_bins {
            return None;
        }
        self.cells.get((y * self.num_x_bins + x) as usize)
    }

    /// The cell containing a field-space position.
    pub fn cell_at(&self, position: Vec2) -> Option<&FieldCell> {
        if !position.is_finite() {
            return None;
        }
        self.cell(position.floor().as_ivec2())
    }

    /// Replace one cell, keeping the magnitude bound valid.
    pub fn set_cell(&mut self, x: u32, y: u32, cell: FieldCell) -> Result<(), ConfigError> {
        if x >= self.num_x_bins || y >= self.num_y_bins {
            return Err(ConfigError::CellOutOfRange { x, y });
        }
        let index = (y * self.num_x_bins + x) as usize;
        if !(cell.magnitude.is_finite() && cell.direction.iter().all(|c| c.is_finite())) {
            return Err(ConfigError::NonFiniteCell { index });
        }
        if cell.magnitude < 0.0 {
            return Err(ConfigError::NegativeMagnitude {
                index,
                magnitude: cell.magnitude,
            });
        }
        self.cells[index] = cell;
        self.max_magnitude = self.max_magnitude.max(cell.magnitude);
        Ok(())
    }
}

/// Cell as it appears in the JSON structure.
#[derive(Deserialize)]
#[serde(untagged)]
enum CellSource {
    Full { direction: [f32; 2], magnitude: f32 },
    Compact([f32; 3]),
}

/// The JSON structure describing a field.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldSource {
    num_x_bins: u32,
    num_y_bins: u32,
    #[serde(default)]
    max_magnitude: Option<f32>,
    cells: Vec<CellSource>,
}

impl FieldSource {
    fn into_field(self) -> Result<VectorField, ConfigError> {
        let cells = self
            .cells
            .into_iter()
            .map(|cell| match cell {
                CellSource::Full { direction, magnitude } => {
                    FieldCell::new(Vec2::from_array(direction), magnitude)
                }
                CellSource::Compact([x, y, magnitude]) => FieldCell::new(Vec2::new(x, y), magnitude),
            })
            .collect();
        VectorField::with_max_magnitude(self.num_x_bins, self.num_y_bins, cells, self.max_magnitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_new_computes_max() {
        let mut cells = vec![FieldCell::still(); 4];
        cells[3] = FieldCell::new(Vec2::new(0.0, 3.0), 2.5);
        let field = VectorField::new(2, 2, cells).unwrap();

        assert_eq!(field.max_magnitude(), 2.5);
        // Direction is normalised
        assert_eq!(field.cells()[3].direction(), Vec2::new(0.0, 1.0));
    }

    #[test]
    fn test_field_rejects_empty_grid() {
        let err = VectorField::new(0, 4, vec![]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyGrid { num_x_bins: 0, num_y_bins: 4 });
    }

    #[test]
    fn test_field_rejects_wrong_cell_count() {
        let err = VectorField::new(2, 2, vec![FieldCell::still(); 3]).unwrap_err();
        assert_eq!(err, ConfigError::CellCountMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn test_field_rejects_negative_magnitude() {
        let mut cells = vec![FieldCell::still(); 2];
        cells[1].magnitude = -1.0;
        let err = VectorField::new(2, 1, cells).unwrap_err();
        assert!(matches!(err, ConfigError::NegativeMagnitude { index: 1, .. }));
    }

    #[test]
    fn test_field_rejects_small_declared_max() {
        let cells = vec![FieldCell::new(Vec2::X, 4.0)];
        let err = VectorField::with_max_magnitude(1, 1, cells, Some(2.0)).unwrap_err();
        assert!(matches!(err, ConfigError::MaxMagnitudeTooSmall { .. }));
    }

    #[test]
    fn test_field_accepts_larger_declared_max() {
        let cells = vec![FieldCell::new(Vec2::X, 1.0)];
        let field = VectorField::with_max_magnitude(1, 1, cells, Some(8.0)).unwrap();
        assert_eq!(field.max_magnitude(), 8.0);
    }

    #[test]
    fn test_cell_lookup() {
        let mut field = VectorField::still(4, 3).unwrap();
        field.set_cell(2, 1, FieldCell::new(Vec2::X, 1.0)).unwrap();

        assert_eq!(field.cell_at(Vec2::new(2.5, 1.9)).unwrap().magnitude, 1.0);
        assert_eq!(field.cell_at(Vec2::new(1.9, 1.5)).unwrap().magnitude, 0.0);
        assert!(field.cell_at(Vec2::new(4.0, 0.0)).is_none());
        assert!(field.cell_at(Vec2::new(-0.1, 0.0)).is_none());
        assert!(field.cell_at(Vec2::new(f32::NAN, 0.0)).is_none());
    }

    #[test]
    fn test_from_json_mixed_cells() {
        let field = VectorField::from_json(
            r#"{
                "numXBins": 2,
                "numYBins": 1,
                "cells": [
                    { "direction": [2.0, 0.0], "magnitude": 2.0 },
                    [0.0, 1.0, 1.0]
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(field.num_x_bins(), 2);
        assert_eq!(field.num_y_bins(), 1);
        assert_eq!(field.max_magnitude(), 2.0);
        assert_eq!(field.cells()[0].direction(), Vec2::X);
        assert_eq!(field.cells()[1].direction(), Vec2::Y);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = VectorField::from_json(r#"{ "numXBins": 2 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_field_cell_gpu_layout() {
        // Must match the WGSL FieldCell struct (16 bytes)
        assert_eq!(std::mem::size_of::<FieldCell>(), 16);
    }
}
