//! Deck, track, location, and workflow data model for Planar.
//!
//! This crate holds the pure data types shared by the planner and the
//! actor layer:
//!
//! - **Positions**: absolute millimeters over a grid of 240 mm stator tiles
//! - **Deck**: tile layout, stations, traversability
//! - **Tracks**: line segments movers follow, plus connectivity queries
//! - **Locations**: named teach points with dual cartesian/track coordinates
//! - **Workflows**: the immutable itinerary a plate executes
//!
//! Everything here is a plain value type; nothing is async and nothing
//! holds live system state.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod deck;
pub mod error;
pub mod location;
pub mod position;
pub mod track;
pub mod workflow;

pub use deck::{DeckConfig, DeviceId, DeviceType, StationId, Station, StatorTile};
pub use error::{Error, Result};
pub use location::{Location, LocationId, LocationMap, LocationType};
pub use position::{snap_to_quadrant, GridPosition, Position, QUADRANT_OFFSETS_MM, TILE_SIZE_MM};
pub use track::{NearestPoint, Track, TrackId, TrackMap, CONNECT_EPSILON_MM};
pub use workflow::{Workflow, WorkflowStep};
