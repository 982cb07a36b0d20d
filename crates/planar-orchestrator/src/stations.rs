//! StationManager: station occupancy and FIFO wait queues.
//!
//! Stations have a small integer capacity. Access is granted in strict
//! logical request order (mailbox arrival), never by physical arrival.
//! A queued plate learns its turn via a `station.access_granted` event
//! keyed by plate id; the physical parking spot it should wait at comes
//! back in the `Queued` decision.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use planar_core::{Position, Station, StationId};
use planar_events::{Event, EventBus};

use crate::actors::errors::ActorError;
use crate::PlateId;

/// Outcome of an access request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccessDecision {
    Granted,
    Queued {
        /// 1-based position in the wait queue.
        position: usize,
        /// Where to park while waiting.
        queue_location: Position,
    },
}

/// Messages handled by the station manager.
pub enum StationMessage {
    RequestAccess {
        plate_id: PlateId,
        station_id: StationId,
        reply: RpcReplyPort<Result<AccessDecision, ActorError>>,
    },
    ReleaseAccess {
        plate_id: PlateId,
        station_id: StationId,
    },
    CancelRequest {
        plate_id: PlateId,
        station_id: StationId,
    },
    GetSnapshot {
        reply: RpcReplyPort<Vec<StationSnapshot>>,
    },
}

/// Observer view of one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub station_id: StationId,
    pub slots: usize,
    pub occupants: Vec<PlateId>,
    pub queued: Vec<PlateId>,
}

/// Boot arguments for the station manager.
pub struct StationManagerArguments {
    pub stations: Vec<Station>,
    pub bus: Arc<EventBus>,
}

struct StationState {
    station: Station,
    occupants: Vec<PlateId>,
    queue: VecDeque<PlateId>,
}

impl StationState {
    /// Parking spot for queued plates. Falls back to the dock when the
    /// layout defines no queue point.
    fn queue_location(&self) -> Position {
        self.station
            .queue_position()
            .unwrap_or_else(|| self.station.position())
    }
}

pub struct StationManagerState {
    stations: BTreeMap<StationId, StationState>,
    bus: Arc<EventBus>,
}

impl StationManagerState {
    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, "station-manager", payload))
            .await;
    }
}

#[derive(Default)]
pub struct StationManagerDef;

impl Actor for StationManagerDef {
    type Msg = StationMessage;
    type State = StationManagerState;
    type Arguments = StationManagerArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: StationManagerArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let stations = args
            .stations
            .into_iter()
            .map(|station| {
                (
                    station.station_id.clone(),
                    StationState {
                        station,
                        occupants: Vec::new(),
                        queue: VecDeque::new(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        info!(stations = stations.len(), "station manager started");
        Ok(StationManagerState {
            stations,
            bus: args.bus,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            StationMessage::RequestAccess {
                plate_id,
                station_id,
                reply,
            } => {
                if !state.stations.contains_key(&station_id) {
                    let _ = reply.send(Err(ActorError::station_not_found(station_id)));
                    return Ok(());
                }

                state
                    .emit(
                        "station.access_requested",
                        json!({ "station_id": station_id, "plate_id": plate_id }),
                    )
                    .await;

                let Some(station) = state.stations.get_mut(&station_id) else {
                    return Ok(());
                };

                // Idempotent for occupants and already-queued plates.
                if station.occupants.contains(&plate_id) {
                    let _ = reply.send(Ok(AccessDecision::Granted));
                    return Ok(());
                }
                if let Some(index) = station.queue.iter().position(|p| p == &plate_id) {
                    let _ = reply.send(Ok(AccessDecision::Queued {
                        position: index + 1,
                        queue_location: station.queue_location(),
                    }));
                    return Ok(());
                }

                if station.occupants.len() < station.station.slots {
                    station.occupants.push(plate_id.clone());
                    let _ = reply.send(Ok(AccessDecision::Granted));
                    state
                        .emit(
                            "station.access_granted",
                            json!({ "station_id": station_id, "plate_id": plate_id }),
                        )
                        .await;
                    info!(station_id = %station_id, plate_id = %plate_id, "station access granted");
                } else {
                    station.queue.push_back(plate_id.clone());
                    let decision = AccessDecision::Queued {
                        position: station.queue.len(),
                        queue_location: station.queue_location(),
                    };
                    let _ = reply.send(Ok(decision));
                    info!(
                        station_id = %station_id,
                        plate_id = %plate_id,
                        queue_len = station.queue.len(),
                        "station full, request queued"
                    );
                }
            }
            StationMessage::ReleaseAccess {
                plate_id,
                station_id,
            } => {
                let Some(station) = state.stations.get_mut(&station_id) else {
                    warn!(station_id = %station_id, "release for unknown station");
                    return Ok(());
                };
                let Some(index) = station.occupants.iter().position(|p| p == &plate_id) else {
                    debug!(
                        station_id = %station_id,
                        plate_id = %plate_id,
                        "release from a plate that is not an occupant"
                    );
                    return Ok(());
                };
                station.occupants.remove(index);
                state
                    .emit(
                        "station.access_released",
                        json!({ "station_id": station_id, "plate_id": plate_id }),
                    )
                    .await;

                // Promote queued plates while capacity remains.
                loop {
                    let Some(station) = state.stations.get_mut(&station_id) else {
                        break;
                    };
                    if station.occupants.len() >= station.station.slots {
                        break;
                    }
                    let Some(next) = station.queue.pop_front() else {
                        break;
                    };
                    station.occupants.push(next.clone());
                    state
                        .emit(
                            "station.access_granted",
                            json!({ "station_id": station_id, "plate_id": next }),
                        )
                        .await;
                    info!(station_id = %station_id, plate_id = %next, "queued plate promoted");
                }
            }
            StationMessage::CancelRequest {
                plate_id,
                station_id,
            } => {
                if let Some(station) = state.stations.get_mut(&station_id) {
                    station.queue.retain(|p| p != &plate_id);
                }
            }
            StationMessage::GetSnapshot { reply } => {
                let snapshots = state
                    .stations
                    .values()
                    .map(|s| StationSnapshot {
                        station_id: s.station.station_id.clone(),
                        slots: s.station.slots,
                        occupants: s.occupants.clone(),
                        queued: s.queue.iter().cloned().collect(),
                    })
                    .collect();
                let _ = reply.send(snapshots);
            }
        }
        Ok(())
    }
}
