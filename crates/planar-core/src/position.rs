//! Coordinate math for the stator grid.
//!
//! Positions are absolute millimeters with a bottom-left origin (the PLC
//! convention); display conversions belong to the presentation layer.
//! Stator tiles are 240 mm squares. Quadrant reference points sit at
//! 60 mm and 180 mm offsets from each tile's bottom-left corner and are
//! used for snapping teach points and track endpoints.

use serde::{Deserialize, Serialize};

/// Stator tile edge length in millimeters.
pub const TILE_SIZE_MM: f64 = 240.0;

/// Quadrant reference offsets from a tile's bottom-left corner, in mm.
pub const QUADRANT_OFFSETS_MM: [f64; 2] = [60.0, 180.0];

/// Absolute position in millimeters with a heading in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    /// Heading (rotation about the vertical axis) in degrees.
    #[serde(default)]
    pub c: f64,
}

impl Position {
    /// Position with a zero heading.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, c: 0.0 }
    }

    /// Position with an explicit heading.
    pub fn with_heading(x: f64, y: f64, c: f64) -> Self {
        Self { x, y, c }
    }

    /// Planar distance to another position; heading is ignored.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// The grid tile containing this position.
    pub fn grid(&self) -> GridPosition {
        GridPosition::containing(self.x, self.y)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1}°)", self.x, self.y, self.c)
    }
}

/// Tile indices on the stator grid (0-based, bottom-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPosition {
    pub col: i32,
    pub row: i32,
}

impl GridPosition {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// The tile containing an absolute millimeter coordinate.
    pub fn containing(x: f64, y: f64) -> Self {
        Self {
            col: (x / TILE_SIZE_MM).floor() as i32,
            row: (y / TILE_SIZE_MM).floor() as i32,
        }
    }

    /// Center of this tile in absolute millimeters.
    pub fn center(&self) -> Position {
        Position::new(
            f64::from(self.col) * TILE_SIZE_MM + TILE_SIZE_MM / 2.0,
            f64::from(self.row) * TILE_SIZE_MM + TILE_SIZE_MM / 2.0,
        )
    }

    /// Bounding box `(x_min, y_min, x_max, y_max)` in millimeters.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let x = f64::from(self.col) * TILE_SIZE_MM;
        let y = f64::from(self.row) * TILE_SIZE_MM;
        (x, y, x + TILE_SIZE_MM, y + TILE_SIZE_MM)
    }
}

impl std::fmt::Display for GridPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.col, self.row)
    }
}

/// Snap a coordinate to the nearest quadrant reference point of its tile.
///
/// Returns the input unchanged when no quadrant point lies within
/// `tolerance` millimeters.
pub fn snap_to_quadrant(x: f64, y: f64, tolerance: f64) -> (f64, f64) {
    let tile_x = (x / TILE_SIZE_MM).floor() * TILE_SIZE_MM;
    let tile_y = (y / TILE_SIZE_MM).floor() * TILE_SIZE_MM;

    let mut best = (x, y);
    let mut best_dist = f64::INFINITY;

    for qx in QUADRANT_OFFSETS_MM {
        for qy in QUADRANT_OFFSETS_MM {
            let px = tile_x + qx;
            let py = tile_y + qy;
            let dist = ((x - px).powi(2) + (y - py).powi(2)).sqrt();
            if dist < best_dist && dist <= tolerance {
                best_dist = dist;
                best = (px, py);
            }
        }
    }

    best
}
