//! Named teach points with dual cartesian/track coordinates.
//!
//! A location always has cartesian coordinates; when it sits on a track
//! it additionally carries `(track_id, track_distance)` so planned motion
//! can stay on the track network.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::deck::StationId;
use crate::error::{Error, Result};
use crate::position::Position;
use crate::track::TrackId;

/// Identifier of a teach point.
pub type LocationId = String;

/// What a teach point is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Waypoint,
    /// Dock point of a device; always associated with a station.
    Device,
    Pivot,
    /// Physical waiting spot for station gating.
    Queue,
    TrackService,
}

/// A named point on the deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: LocationId,
    pub name: String,
    pub location_type: LocationType,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub c: f64,
    #[serde(default)]
    pub track_id: Option<TrackId>,
    #[serde(default)]
    pub track_distance: Option<f64>,
    #[serde(default)]
    pub station_id: Option<StationId>,
}

impl Location {
    pub fn new(
        location_id: impl Into<LocationId>,
        name: impl Into<String>,
        location_type: LocationType,
        x: f64,
        y: f64,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            name: name.into(),
            location_type,
            x,
            y,
            c: 0.0,
            track_id: None,
            track_distance: None,
            station_id: None,
        }
    }

    pub fn with_heading(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    pub fn on_track(mut self, track_id: TrackId, distance: f64) -> Self {
        self.track_id = Some(track_id);
        self.track_distance = Some(distance);
        self
    }

    pub fn for_station(mut self, station_id: impl Into<StationId>) -> Self {
        self.station_id = Some(station_id.into());
        self
    }

    pub fn position(&self) -> Position {
        Position::with_heading(self.x, self.y, self.c)
    }

    pub fn has_track_coordinates(&self) -> bool {
        self.track_id.is_some() && self.track_distance.is_some()
    }
}

/// Lookup table of teach points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationMap {
    locations: BTreeMap<LocationId, Location>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_locations(locations: Vec<Location>) -> Result<Self> {
        let mut map = Self::new();
        for location in locations {
            map.insert(location)?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, location: Location) -> Result<()> {
        if self.locations.contains_key(&location.location_id) {
            return Err(Error::DuplicateLocation(location.location_id));
        }
        self.locations.insert(location.location_id.clone(), location);
        Ok(())
    }

    pub fn get(&self, location_id: &str) -> Option<&Location> {
        self.locations.get(location_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Location> {
        self.locations.values().find(|l| l.name == name)
    }

    pub fn by_type(&self, location_type: LocationType) -> Vec<&Location> {
        self.locations
            .values()
            .filter(|l| l.location_type == location_type)
            .collect()
    }

    pub fn by_station(&self, station_id: &str) -> Vec<&Location> {
        self.locations
            .values()
            .filter(|l| l.station_id.as_deref() == Some(station_id))
            .collect()
    }

    /// Queue teach points lying on a given track.
    pub fn queue_points_on_track(&self, track_id: TrackId) -> Vec<&Location> {
        self.locations
            .values()
            .filter(|l| l.location_type == LocationType::Queue && l.track_id == Some(track_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_station() {
        let map = LocationMap::from_locations(vec![
            Location::new("loc-1", "PIPETTER_DOCK", LocationType::Device, 600.0, 120.0)
                .for_station("STATION_2"),
            Location::new("loc-2", "PIPETTER_QUEUE", LocationType::Queue, 360.0, 120.0)
                .on_track(1, 300.0)
                .for_station("STATION_2"),
        ])
        .ok();
        assert!(map.is_some());
        if let Some(map) = map {
            assert_eq!(
                map.by_name("PIPETTER_DOCK").map(|l| l.location_type),
                Some(LocationType::Device)
            );
            assert_eq!(map.by_station("STATION_2").len(), 2);
            assert_eq!(map.queue_points_on_track(1).len(), 1);
            assert!(map.queue_points_on_track(9).is_empty());
        }
    }

    #[test]
    fn duplicate_location_ids_are_rejected() {
        let mut map = LocationMap::new();
        let loc = Location::new("dup", "A", LocationType::Waypoint, 0.0, 0.0);
        assert!(map.insert(loc.clone()).is_ok());
        assert!(matches!(
            map.insert(loc),
            Err(Error::DuplicateLocation(_))
        ));
    }

    #[test]
    fn track_coordinates_are_optional() {
        let free = Location::new("f", "FREE", LocationType::Waypoint, 10.0, 10.0);
        assert!(!free.has_track_coordinates());
        let on_track = free.clone().on_track(3, 42.0);
        assert!(on_track.has_track_coordinates());
    }
}
