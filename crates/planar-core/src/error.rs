//! Error types for the data model.

use thiserror::Error;

use crate::track::TrackId;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Validation errors raised while assembling a deck model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// A track endpoint does not lie over an enabled stator tile.
    #[error("track {track_id} endpoint ({x:.1}, {y:.1}) is off the enabled deck surface")]
    TrackOffDeck { track_id: TrackId, x: f64, y: f64 },

    /// Two tracks share the same id.
    #[error("duplicate track id {0}")]
    DuplicateTrack(TrackId),

    /// Two locations share the same id.
    #[error("duplicate location id {0}")]
    DuplicateLocation(String),

    /// A station id was not found on the deck.
    #[error("unknown station: {0}")]
    UnknownStation(String),

    /// A workflow failed structural validation.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
}

impl Error {
    /// Create an unknown-station error.
    pub fn unknown_station(id: impl Into<String>) -> Self {
        Self::UnknownStation(id.into())
    }

    /// Create an invalid-workflow error.
    pub fn invalid_workflow(reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow(reason.into())
    }
}
