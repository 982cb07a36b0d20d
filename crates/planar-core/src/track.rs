//! Tracks: the line segments movers follow.
//!
//! Two tracks are connected when any pair of their endpoints is within
//! [`CONNECT_EPSILON_MM`]. The connected set forms the graph the path
//! planner searches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::position::Position;

/// Identifier of a track.
pub type TrackId = u32;

/// Maximum endpoint separation for two tracks to count as connected.
pub const CONNECT_EPSILON_MM: f64 = 5.0;

/// A straight track segment in absolute millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,
    pub name: String,
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
}

impl Track {
    pub fn new(
        track_id: TrackId,
        name: impl Into<String>,
        start_x: f64,
        start_y: f64,
        end_x: f64,
        end_y: f64,
    ) -> Self {
        Self {
            track_id,
            name: name.into(),
            start_x,
            start_y,
            end_x,
            end_y,
        }
    }

    pub fn start(&self) -> Position {
        Position::new(self.start_x, self.start_y)
    }

    pub fn end(&self) -> Position {
        Position::new(self.end_x, self.end_y)
    }

    pub fn length(&self) -> f64 {
        self.start().distance_to(&self.end())
    }

    /// Cartesian position at a distance from the start endpoint.
    ///
    /// The distance is clamped to the segment.
    pub fn position_at(&self, distance: f64) -> Position {
        let length = self.length();
        if length == 0.0 {
            return self.start();
        }
        let t = (distance / length).clamp(0.0, 1.0);
        Position::new(
            self.start_x + t * (self.end_x - self.start_x),
            self.start_y + t * (self.end_y - self.start_y),
        )
    }

    /// Project a point onto this segment.
    ///
    /// Returns `(distance_along, separation)`: the signed distance from
    /// the start endpoint to the closest segment point, and the
    /// perpendicular distance from the query point to it.
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = self.end_x - self.start_x;
        let dy = self.end_y - self.start_y;
        let length_sq = dx * dx + dy * dy;

        if length_sq == 0.0 {
            let dist = ((x - self.start_x).powi(2) + (y - self.start_y).powi(2)).sqrt();
            return (0.0, dist);
        }

        let t = (((x - self.start_x) * dx + (y - self.start_y) * dy) / length_sq).clamp(0.0, 1.0);
        let closest_x = self.start_x + t * dx;
        let closest_y = self.start_y + t * dy;
        let separation = ((x - closest_x).powi(2) + (y - closest_y).powi(2)).sqrt();
        (t * length_sq.sqrt(), separation)
    }

    /// Whether any endpoint pair of the two tracks is within `epsilon`.
    pub fn connects_to(&self, other: &Track, epsilon: f64) -> bool {
        let mine = [self.start(), self.end()];
        let theirs = [other.start(), other.end()];
        mine.iter()
            .any(|a| theirs.iter().any(|b| a.distance_to(b) <= epsilon))
    }
}

/// The set of configured tracks, indexed by id.
///
/// A `BTreeMap` keeps iteration deterministic, which the planner's
/// tie-breaking relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMap {
    tracks: BTreeMap<TrackId, Track>,
}

/// Result of a nearest-point query against the track set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPoint {
    pub track_id: TrackId,
    /// Distance along the track from its start endpoint.
    pub distance_along: f64,
    /// Perpendicular distance from the query point to the track.
    pub separation: f64,
}

impl TrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a list of tracks, rejecting duplicate ids.
    pub fn from_tracks(tracks: Vec<Track>) -> Result<Self> {
        let mut map = Self::new();
        for track in tracks {
            map.insert(track)?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, track: Track) -> Result<()> {
        if self.tracks.contains_key(&track.track_id) {
            return Err(Error::DuplicateTrack(track.track_id));
        }
        self.tracks.insert(track.track_id, track);
        Ok(())
    }

    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Closest point on any track to `(x, y)`, or `None` with no tracks.
    pub fn nearest_point(&self, x: f64, y: f64) -> Option<NearestPoint> {
        let mut best: Option<NearestPoint> = None;
        for track in self.tracks.values() {
            let (distance_along, separation) = track.project(x, y);
            let candidate = NearestPoint {
                track_id: track.track_id,
                distance_along,
                separation,
            };
            if best.is_none_or(|b| separation < b.separation) {
                best = Some(candidate);
            }
        }
        best
    }

    /// Ids of tracks connected to `track_id` (endpoints within `epsilon`).
    pub fn connected(&self, track_id: TrackId, epsilon: f64) -> Vec<TrackId> {
        let Some(track) = self.tracks.get(&track_id) else {
            return Vec::new();
        };
        self.tracks
            .values()
            .filter(|other| other.track_id != track_id && track.connects_to(other, epsilon))
            .map(|other| other.track_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight(id: TrackId, x0: f64, y0: f64, x1: f64, y1: f64) -> Track {
        Track::new(id, format!("t{id}"), x0, y0, x1, y1)
    }

    #[test]
    fn length_and_position_at() {
        let track = straight(1, 0.0, 0.0, 240.0, 0.0);
        assert_eq!(track.length(), 240.0);
        assert_eq!(track.position_at(120.0), Position::new(120.0, 0.0));
        // Clamped beyond both ends.
        assert_eq!(track.position_at(-50.0), Position::new(0.0, 0.0));
        assert_eq!(track.position_at(500.0), Position::new(240.0, 0.0));
    }

    #[test]
    fn projection_clamps_to_segment() {
        let track = straight(1, 0.0, 0.0, 100.0, 0.0);
        let (along, sep) = track.project(50.0, 30.0);
        assert_eq!(along, 50.0);
        assert_eq!(sep, 30.0);

        let (along, sep) = track.project(-40.0, 30.0);
        assert_eq!(along, 0.0);
        assert_eq!(sep, 50.0);
    }

    #[test]
    fn connectivity_uses_endpoint_epsilon() {
        let a = straight(1, 0.0, 0.0, 100.0, 0.0);
        let b = straight(2, 103.0, 0.0, 200.0, 0.0);
        let c = straight(3, 300.0, 0.0, 400.0, 0.0);
        assert!(a.connects_to(&b, CONNECT_EPSILON_MM));
        assert!(!a.connects_to(&c, CONNECT_EPSILON_MM));

        let map = TrackMap::from_tracks(vec![a, b, c]).ok();
        let map = map.filter(|m| m.len() == 3);
        assert!(map.is_some());
        if let Some(map) = map {
            assert_eq!(map.connected(1, CONNECT_EPSILON_MM), vec![2]);
            assert!(map.connected(3, CONNECT_EPSILON_MM).is_empty());
        }
    }

    #[test]
    fn nearest_point_picks_closest_track() {
        let map = TrackMap::from_tracks(vec![
            straight(1, 0.0, 0.0, 100.0, 0.0),
            straight(2, 0.0, 100.0, 100.0, 100.0),
        ])
        .ok();
        assert!(map.is_some());
        if let Some(map) = map {
            let near = map.nearest_point(50.0, 80.0);
            assert_eq!(near.map(|n| n.track_id), Some(2));
            assert_eq!(near.map(|n| n.separation), Some(20.0));
        }
    }

    #[test]
    fn duplicate_track_ids_are_rejected() {
        let mut map = TrackMap::new();
        assert!(map.insert(straight(7, 0.0, 0.0, 10.0, 0.0)).is_ok());
        assert_eq!(
            map.insert(straight(7, 0.0, 0.0, 20.0, 0.0)),
            Err(Error::DuplicateTrack(7))
        );
    }
}
