//! Actor-level error types.
//!
//! These are business errors returned in RPC replies. They never crash
//! an actor; the actor keeps running after handing one back.

use std::time::Duration;

use thiserror::Error;

use planar_routing::PlanError;

use crate::MoverId;

/// Business errors flowing through actor replies.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActorError {
    /// A request/response ask hit its deadline.
    #[error("ask timed out after {0:?}")]
    AskTimeout(Duration),

    /// The target actor is stopped or unreachable.
    #[error("actor not available")]
    ActorUnavailable,

    /// Message channel failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// Failed to spawn an actor.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Boot-time wiring or validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown mover: {0}")]
    MoverNotFound(MoverId),

    #[error("unknown device: {0}")]
    DeviceNotFound(String),

    #[error("unknown station: {0}")]
    StationNotFound(String),

    #[error("unknown plate: {0}")]
    PlateNotFound(String),

    /// Routing failure from the path planner.
    #[error("routing failed: {0}")]
    Routing(#[from] PlanError),

    /// A transport was attempted but did not complete.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The device is held by another plate.
    #[error("device {device_id} is busy (held by {holder})")]
    DeviceBusy { device_id: String, holder: String },

    /// The callee declined the operation in its current state.
    #[error("refused: {0}")]
    Refused(String),

    /// A workflow assignment was not acceptable.
    #[error("workflow rejected: {0}")]
    WorkflowRejected(String),

    /// An operation arrived in a phase that cannot serve it.
    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ActorError {
    pub fn channel(reason: impl Into<String>) -> Self {
        Self::Channel(reason.into())
    }

    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed(reason.into())
    }

    pub fn device_not_found(id: impl Into<String>) -> Self {
        Self::DeviceNotFound(id.into())
    }

    pub fn station_not_found(id: impl Into<String>) -> Self {
        Self::StationNotFound(id.into())
    }

    pub fn plate_not_found(id: impl Into<String>) -> Self {
        Self::PlateNotFound(id.into())
    }

    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed(reason.into())
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self::Refused(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Whether the error is worth an automatic local retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AskTimeout(_) | Self::Channel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = ActorError::DeviceBusy {
            device_id: "pipetter-1".into(),
            holder: "P7".into(),
        };
        assert!(err.to_string().contains("pipetter-1"));
        assert!(err.to_string().contains("P7"));
    }

    #[test]
    fn plan_errors_convert() {
        let err: ActorError = PlanError::Unreachable { x: 1.0, y: 2.0 }.into();
        assert!(matches!(err, ActorError::Routing(_)));
    }

    #[test]
    fn transient_classification() {
        assert!(ActorError::AskTimeout(Duration::from_secs(1)).is_transient());
        assert!(!ActorError::Refused("no".into()).is_transient());
    }
}
