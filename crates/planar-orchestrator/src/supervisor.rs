//! System supervisor: error isolation for the actor fleet.
//!
//! Every service actor (pools, station manager, movers, devices) and
//! every plate is spawned linked to this supervisor. A handler that
//! fails hard surfaces here as a supervision event, gets logged, and is
//! published as an `actor.error` event so observers see the fault; the
//! rest of the fleet keeps running. Restart policy stays with the
//! coordinator (plates are simply re-admitted).

use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use serde_json::json;
use tracing::{debug, error, info};

use planar_events::{Event, EventBus};

/// The supervisor handles no direct messages; it only observes links.
pub enum SupervisorMessage {}

/// Boot arguments for the supervisor.
pub struct SupervisorArguments {
    pub bus: Arc<EventBus>,
}

pub struct SupervisorState {
    bus: Arc<EventBus>,
}

#[derive(Default)]
pub struct SystemSupervisorDef;

impl Actor for SystemSupervisorDef {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: SupervisorArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!("system supervisor started");
        Ok(SupervisorState { bus: args.bus })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        _message: Self::Msg,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorStarted(cell) => {
                debug!(actor = %cell.get_id(), name = ?cell.get_name(), "actor started");
            }
            SupervisionEvent::ActorTerminated(cell, _state, reason) => {
                debug!(
                    actor = %cell.get_id(),
                    name = ?cell.get_name(),
                    reason = ?reason,
                    "actor terminated"
                );
            }
            SupervisionEvent::ActorFailed(cell, failure) => {
                let name = cell.get_name().unwrap_or_else(|| cell.get_id().to_string());
                error!(actor = %name, error = %failure, "actor failed");
                state
                    .bus
                    .publish(Event::new(
                        "actor.error",
                        name.clone(),
                        json!({ "actor": name, "error": failure.to_string() }),
                    ))
                    .await;
            }
            _ => {}
        }
        Ok(())
    }
}
