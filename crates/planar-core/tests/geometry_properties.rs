//! Property-based tests for grid/coordinate math.

use planar_core::{snap_to_quadrant, GridPosition, Position, QUADRANT_OFFSETS_MM, TILE_SIZE_MM};
use proptest::prelude::*;

proptest! {
    /// A tile's center always maps back to the same tile.
    #[test]
    fn tile_center_round_trips(col in -10i32..10, row in -10i32..10) {
        let grid = GridPosition::new(col, row);
        prop_assert_eq!(grid.center().grid(), grid);
    }

    /// Every point inside a tile's bounds resolves to that tile.
    #[test]
    fn bounds_contain_their_tile(
        col in 0i32..8,
        row in 0i32..8,
        dx in 0.0..239.99f64,
        dy in 0.0..239.99f64,
    ) {
        let grid = GridPosition::new(col, row);
        let (x_min, y_min, x_max, y_max) = grid.bounds();
        let x = x_min + dx;
        let y = y_min + dy;
        prop_assert!(x < x_max && y < y_max);
        prop_assert_eq!(GridPosition::containing(x, y), grid);
    }

    /// Snapping either returns a quadrant point within tolerance or
    /// leaves the input untouched.
    #[test]
    fn snap_is_quadrant_or_identity(
        x in 0.0..1200.0f64,
        y in 0.0..1200.0f64,
        tolerance in 0.0..30.0f64,
    ) {
        let (sx, sy) = snap_to_quadrant(x, y, tolerance);
        let moved = (sx, sy) != (x, y);
        if moved {
            let input = Position::new(x, y);
            let snapped = Position::new(sx, sy);
            prop_assert!(input.distance_to(&snapped) <= tolerance + 1e-9);

            let within_tile_x = sx - (sx / TILE_SIZE_MM).floor() * TILE_SIZE_MM;
            let within_tile_y = sy - (sy / TILE_SIZE_MM).floor() * TILE_SIZE_MM;
            prop_assert!(
                QUADRANT_OFFSETS_MM.iter().any(|q| (within_tile_x - q).abs() < 1e-6),
                "x offset {within_tile_x} is not a quadrant offset"
            );
            prop_assert!(
                QUADRANT_OFFSETS_MM.iter().any(|q| (within_tile_y - q).abs() < 1e-6),
                "y offset {within_tile_y} is not a quadrant offset"
            );
        }
    }

    /// Planar distance is symmetric and satisfies the identity axiom.
    #[test]
    fn distance_is_symmetric(
        ax in -500.0..500.0f64,
        ay in -500.0..500.0f64,
        bx in -500.0..500.0f64,
        by in -500.0..500.0f64,
    ) {
        let a = Position::new(ax, ay);
        let b = Position::new(bx, by);
        prop_assert!((a.distance_to(&b) - b.distance_to(&a)).abs() < 1e-9);
        prop_assert!(a.distance_to(&a) == 0.0);
    }
}
