//! Physical transport driver contract and simulator.
//!
//! The real system talks to a PLC/fieldbus; the core only depends on
//! this trait. [`SimDriver`] is the in-process stand-in used by tests
//! and demos: it sleeps each command's estimated duration (scaled by a
//! configurable factor) and tracks per-mover poses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use planar_core::Position;
use planar_routing::{PlannedCommand, PrimitiveCommand, TrackCoord};

use crate::MoverId;

/// Driver-level failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// Worth retrying after a short backoff.
    #[error("transient driver fault: {0}")]
    Transient(String),

    /// Not recoverable by retrying the same command.
    #[error("fatal driver fault: {0}")]
    Fatal(String),
}

/// Physical state reported by the driver for one mover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoverPhysical {
    pub position: Position,
    pub track: Option<TrackCoord>,
    /// Current speed in mm/s.
    pub velocity: f64,
}

impl MoverPhysical {
    pub fn at(position: Position) -> Self {
        Self {
            position,
            track: None,
            velocity: 0.0,
        }
    }
}

impl Default for MoverPhysical {
    fn default() -> Self {
        Self::at(Position::new(0.0, 0.0))
    }
}

/// Contract the core consumes to move physical shuttles.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Execute a single planned command to completion.
    async fn execute(&self, mover_id: MoverId, command: &PlannedCommand)
        -> Result<(), DriverError>;

    /// Poll the current physical state of a mover.
    async fn physical_state(&self, mover_id: MoverId) -> Result<MoverPhysical, DriverError>;
}

#[derive(Default)]
struct FailureInjection {
    fail_follow: u32,
}

/// In-process driver simulation.
pub struct SimDriver {
    time_scale: f64,
    states: RwLock<HashMap<MoverId, MoverPhysical>>,
    inject: Mutex<FailureInjection>,
}

impl SimDriver {
    /// `time_scale` multiplies every simulated motion duration;
    /// zero makes commands complete immediately.
    pub fn new(time_scale: f64) -> Arc<Self> {
        Arc::new(Self {
            time_scale: time_scale.max(0.0),
            states: RwLock::new(HashMap::new()),
            inject: Mutex::new(FailureInjection::default()),
        })
    }

    /// Place a mover at a position (boot-time teaching).
    pub async fn place(&self, mover_id: MoverId, position: Position) {
        let mut states = self.states.write().await;
        states.insert(mover_id, MoverPhysical::at(position));
    }

    /// Fail the next `count` follow commands with a transient fault.
    pub async fn fail_next_follow(&self, count: u32) {
        let mut inject = self.inject.lock().await;
        inject.fail_follow = count;
    }

    async fn take_follow_fault(&self) -> bool {
        let mut inject = self.inject.lock().await;
        if inject.fail_follow > 0 {
            inject.fail_follow -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TransportDriver for SimDriver {
    async fn execute(
        &self,
        mover_id: MoverId,
        command: &PlannedCommand,
    ) -> Result<(), DriverError> {
        if matches!(command.command, PrimitiveCommand::Follow { .. })
            && self.take_follow_fault().await
        {
            return Err(DriverError::Transient("injected follow fault".into()));
        }

        let wait = Duration::from_secs_f64(command.estimated.as_secs_f64() * self.time_scale);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut states = self.states.write().await;
        let state = states.entry(mover_id).or_default();
        state.position = command.pose.position;
        state.track = command.pose.track;
        state.velocity = 0.0;
        debug!(mover_id, position = %state.position, "sim command complete");
        Ok(())
    }

    async fn physical_state(&self, mover_id: MoverId) -> Result<MoverPhysical, DriverError> {
        let states = self.states.read().await;
        Ok(states.get(&mover_id).copied().unwrap_or_default())
    }
}
