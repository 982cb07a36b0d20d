//! Deck layout: stator tiles, stations, and traversability.
//!
//! The deck is provided at boot as an immutable input. Movers may only
//! travel over enabled stator tiles; disabled tiles are holes in the
//! navigable surface. Stations are the docking points where plates stop
//! for processing, each backed by exactly one device.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::position::{GridPosition, Position, TILE_SIZE_MM};
use crate::track::TrackMap;

/// Identifier of a station on the deck.
pub type StationId = String;

/// Identifier of a physical device instance.
pub type DeviceId = String;

/// Kinds of laboratory devices that can back a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Pipetter,
    Dispenser,
    Washer,
    Incubator,
    Reader,
    Lidmate,
    Decapper,
    Hotel,
    Nest,
    BarcodeReader,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pipetter => "pipetter",
            Self::Dispenser => "dispenser",
            Self::Washer => "washer",
            Self::Incubator => "incubator",
            Self::Reader => "reader",
            Self::Lidmate => "lidmate",
            Self::Decapper => "decapper",
            Self::Hotel => "hotel",
            Self::Nest => "nest",
            Self::BarcodeReader => "barcode_reader",
        };
        write!(f, "{name}")
    }
}

/// A single stator tile (240 mm square).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatorTile {
    pub grid_pos: GridPosition,
    pub enabled: bool,
}

impl StatorTile {
    /// Bounding box `(x_min, y_min, x_max, y_max)` in millimeters.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.grid_pos.bounds()
    }
}

fn default_slots() -> usize {
    1
}

/// A device station: the dock where plates are loaded into a device.
///
/// `slots` is the station's physical capacity (1 for most devices, more
/// for hotels/incubators). `queue_grid_pos` is the tile where plates
/// park while waiting for a slot; the station manager resolves it to an
/// absolute queue position at boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub station_id: StationId,
    pub name: String,
    pub grid_pos: GridPosition,
    pub device_type: DeviceType,
    pub device_id: DeviceId,
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default)]
    pub queue_grid_pos: Option<GridPosition>,
}

impl Station {
    pub fn new(
        station_id: impl Into<StationId>,
        name: impl Into<String>,
        grid_pos: GridPosition,
        device_type: DeviceType,
        device_id: impl Into<DeviceId>,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            name: name.into(),
            grid_pos,
            device_type,
            device_id: device_id.into(),
            slots: 1,
            queue_grid_pos: None,
        }
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_queue(mut self, queue_grid_pos: GridPosition) -> Self {
        self.queue_grid_pos = Some(queue_grid_pos);
        self
    }

    /// Dock position (tile center) in absolute millimeters.
    pub fn position(&self) -> Position {
        self.grid_pos.center()
    }

    /// Absolute queue position, when the station has a queue point.
    pub fn queue_position(&self) -> Option<Position> {
        self.queue_grid_pos.map(|g| g.center())
    }
}

/// Complete deck layout: grid dimensions, disabled tiles, and stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckConfig {
    pub name: String,
    pub cols: i32,
    pub rows: i32,
    #[serde(default)]
    pub disabled_tiles: Vec<GridPosition>,
    #[serde(default)]
    pub stations: Vec<Station>,
}

impl DeckConfig {
    pub fn new(name: impl Into<String>, cols: i32, rows: i32) -> Self {
        Self {
            name: name.into(),
            cols,
            rows,
            disabled_tiles: Vec::new(),
            stations: Vec::new(),
        }
    }

    pub fn with_disabled_tile(mut self, tile: GridPosition) -> Self {
        self.disabled_tiles.push(tile);
        self
    }

    pub fn with_station(mut self, station: Station) -> Self {
        self.stations.push(station);
        self
    }

    pub fn width_mm(&self) -> f64 {
        f64::from(self.cols) * TILE_SIZE_MM
    }

    pub fn height_mm(&self) -> f64 {
        f64::from(self.rows) * TILE_SIZE_MM
    }

    /// Tile at a grid position, or `None` outside the deck.
    pub fn tile(&self, col: i32, row: i32) -> Option<StatorTile> {
        if col < 0 || col >= self.cols || row < 0 || row >= self.rows {
            return None;
        }
        let grid_pos = GridPosition::new(col, row);
        Some(StatorTile {
            grid_pos,
            enabled: !self.disabled_tiles.contains(&grid_pos),
        })
    }

    /// All tiles in row-major order.
    pub fn all_tiles(&self) -> Vec<StatorTile> {
        let mut tiles = Vec::with_capacity((self.cols * self.rows).max(0) as usize);
        for row in 0..self.rows {
            for col in 0..self.cols {
                if let Some(tile) = self.tile(col, row) {
                    tiles.push(tile);
                }
            }
        }
        tiles
    }

    /// Whether an absolute millimeter position lies on an enabled tile.
    pub fn is_traversable(&self, x: f64, y: f64) -> bool {
        let grid = GridPosition::containing(x, y);
        self.tile(grid.col, grid.row).is_some_and(|t| t.enabled)
    }

    pub fn station(&self, station_id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.station_id == station_id)
    }

    pub fn station_for_device(&self, device_id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.device_id == device_id)
    }

    /// Validate that every track endpoint lies over an enabled tile.
    pub fn validate_tracks(&self, tracks: &TrackMap) -> Result<()> {
        for track in tracks.iter() {
            for (x, y) in [
                (track.start_x, track.start_y),
                (track.end_x, track.end_y),
            ] {
                if !self.is_traversable(x, y) {
                    return Err(Error::TrackOffDeck {
                        track_id: track.track_id,
                        x,
                        y,
                    });
                }
            }
        }
        Ok(())
    }

    /// A small demo deck used by tests and examples.
    ///
    /// 4x3 grid with a lidmate, a pipetter, a dispenser, and a
    /// four-slot incubator.
    pub fn demo() -> Self {
        Self::new("Demo Deck", 4, 3)
            .with_station(Station::new(
                "STATION_1",
                "Delid Station",
                GridPosition::new(1, 0),
                DeviceType::Lidmate,
                "lidmate-1",
            ))
            .with_station(Station::new(
                "STATION_2",
                "Pipette Station",
                GridPosition::new(2, 0),
                DeviceType::Pipetter,
                "pipetter-1",
            ))
            .with_station(Station::new(
                "STATION_3",
                "Dispense Station",
                GridPosition::new(3, 1),
                DeviceType::Dispenser,
                "dispenser-1",
            ))
            .with_station(
                Station::new(
                    "STATION_4",
                    "Incubator",
                    GridPosition::new(2, 2),
                    DeviceType::Incubator,
                    "incubator-1",
                )
                .with_slots(4),
            )
    }
}
