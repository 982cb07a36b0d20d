//! MoverPool: dispatches movers to requesting plates.
//!
//! Selection picks the cheapest mover by planner-estimated cost from
//! its last known position to the destination hint (ties: lowest mover
//! id). The hint never affects fairness; waiters are strictly FIFO.
//! Positions are cached from `mover.position_changed` /
//! `mover.transport_completed` bus events, so the pool never has to ask
//! a mover anything while dispatching.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use planar_core::Position;
use planar_events::{Event, EventBus};
use planar_routing::PathPlanner;

use crate::actors::errors::ActorError;
use crate::actors::mover::MoverMessage;
use crate::runtime::forward_events;
use crate::{MoverId, PlateId};

/// A granted mover: id plus the ref to command it.
#[derive(Clone)]
pub struct MoverGrant {
    pub mover_id: MoverId,
    pub mover: ActorRef<MoverMessage>,
}

/// Messages handled by the mover pool.
pub enum MoverPoolMessage {
    /// Add a mover to the pool (boot time).
    Register {
        mover_id: MoverId,
        mover: ActorRef<MoverMessage>,
        position: Position,
    },
    /// Request a mover; parks the reply until one is free.
    Request {
        plate_id: PlateId,
        destination: Position,
        reply: RpcReplyPort<Result<MoverGrant, ActorError>>,
    },
    /// Return a mover to the pool.
    Release { mover_id: MoverId },
    /// Drop a parked request (abort path).
    CancelRequest { plate_id: PlateId },
    /// Position cache refresh from the bus.
    PositionUpdate { mover_id: MoverId, position: Position },
    /// Snapshot query.
    GetSnapshot {
        reply: RpcReplyPort<MoverPoolSnapshot>,
    },
}

/// Observer view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoverPoolSnapshot {
    pub total: usize,
    pub available: Vec<MoverId>,
    pub assignments: Vec<(MoverId, PlateId)>,
    pub waiting: Vec<PlateId>,
}

/// Boot arguments for the pool.
pub struct MoverPoolArguments {
    pub planner: Arc<PathPlanner>,
    pub bus: Arc<EventBus>,
}

struct MoverEntry {
    mover: ActorRef<MoverMessage>,
    position: Position,
    assigned_to: Option<PlateId>,
}

struct Waiter {
    plate_id: PlateId,
    destination: Position,
    reply: RpcReplyPort<Result<MoverGrant, ActorError>>,
}

pub struct MoverPoolState {
    movers: BTreeMap<MoverId, MoverEntry>,
    waiters: VecDeque<Waiter>,
    planner: Arc<PathPlanner>,
    bus: Arc<EventBus>,
    forwarder: Option<JoinHandle<()>>,
}

impl MoverPoolState {
    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, "mover-pool", payload))
            .await;
    }

    /// Cheapest available mover for a destination hint.
    fn select(&self, destination: Position) -> Option<MoverId> {
        self.movers
            .iter()
            .filter(|(_, entry)| entry.assigned_to.is_none())
            .map(|(&id, entry)| {
                let cost = self
                    .planner
                    .estimate(entry.position, destination)
                    .unwrap_or_else(|| entry.position.distance_to(&destination));
                (cost, id)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, id)| id)
    }

    fn current_grant(&self, plate_id: &str) -> Option<MoverGrant> {
        self.movers.iter().find_map(|(&id, entry)| {
            (entry.assigned_to.as_deref() == Some(plate_id)).then(|| MoverGrant {
                mover_id: id,
                mover: entry.mover.clone(),
            })
        })
    }

    async fn assign(&mut self, mover_id: MoverId, plate_id: &str) -> Option<MoverGrant> {
        let entry = self.movers.get_mut(&mover_id)?;
        entry.assigned_to = Some(plate_id.to_string());
        let _ = entry.mover.send_message(MoverMessage::Assign {
            plate_id: plate_id.to_string(),
        });
        let grant = MoverGrant {
            mover_id,
            mover: entry.mover.clone(),
        };
        self.emit(
            "mover.assigned",
            json!({ "mover_id": mover_id, "plate_id": plate_id }),
        )
        .await;
        info!(mover_id, plate_id = %plate_id, "mover assigned");
        Some(grant)
    }

    /// Serve parked waiters while movers remain available.
    async fn serve_waiters(&mut self) {
        loop {
            // Drop waiters whose callers already gave up.
            while self
                .waiters
                .front()
                .is_some_and(|w| w.reply.is_closed())
            {
                let gone = self.waiters.pop_front();
                if let Some(w) = gone {
                    debug!(plate_id = %w.plate_id, "dropping dead mover waiter");
                }
            }

            let Some(front) = self.waiters.front() else {
                return;
            };
            let Some(mover_id) = self.select(front.destination) else {
                return;
            };
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };

            match self.assign(mover_id, &waiter.plate_id).await {
                Some(grant) => {
                    if waiter.reply.send(Ok(grant)).is_err() {
                        // Caller vanished between the liveness check and
                        // the send; take the mover back.
                        warn!(mover_id, plate_id = %waiter.plate_id, "waiter vanished, reclaiming mover");
                        self.release_inner(mover_id).await;
                    }
                }
                None => return,
            }
        }
    }

    async fn release_inner(&mut self, mover_id: MoverId) {
        let Some(entry) = self.movers.get_mut(&mover_id) else {
            warn!(mover_id, "release for unknown mover");
            return;
        };
        let Some(plate_id) = entry.assigned_to.take() else {
            debug!(mover_id, "release of an already-available mover");
            return;
        };
        let _ = entry.mover.send_message(MoverMessage::Unassign {
            plate_id: plate_id.clone(),
        });
        self.emit(
            "mover.released",
            json!({ "mover_id": mover_id, "plate_id": plate_id }),
        )
        .await;
        info!(mover_id, plate_id = %plate_id, "mover released");
    }

    fn snapshot(&self) -> MoverPoolSnapshot {
        MoverPoolSnapshot {
            total: self.movers.len(),
            available: self
                .movers
                .iter()
                .filter(|(_, e)| e.assigned_to.is_none())
                .map(|(&id, _)| id)
                .collect(),
            assignments: self
                .movers
                .iter()
                .filter_map(|(&id, e)| e.assigned_to.clone().map(|p| (id, p)))
                .collect(),
            waiting: self.waiters.iter().map(|w| w.plate_id.clone()).collect(),
        }
    }
}

#[derive(Default)]
pub struct MoverPoolActorDef;

impl Actor for MoverPoolActorDef {
    type Msg = MoverPoolMessage;
    type State = MoverPoolState;
    type Arguments = MoverPoolArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: MoverPoolArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        // Keep the position cache warm from mover telemetry.
        let forwarder = match args.bus.subscribe("mover.*").await {
            Ok((_id, subscription)) => Some(forward_events(subscription, myself, |event| {
                if event.event_type != "mover.position_changed"
                    && event.event_type != "mover.transport_completed"
                {
                    return None;
                }
                let mover_id = event.payload_u64("mover_id")? as MoverId;
                let x = event.payload.get("x").and_then(|v| v.as_f64())?;
                let y = event.payload.get("y").and_then(|v| v.as_f64())?;
                Some(MoverPoolMessage::PositionUpdate {
                    mover_id,
                    position: Position::new(x, y),
                })
            })),
            Err(e) => {
                warn!(error = %e, "mover pool could not subscribe to position events");
                None
            }
        };

        Ok(MoverPoolState {
            movers: BTreeMap::new(),
            waiters: VecDeque::new(),
            planner: args.planner,
            bus: args.bus,
            forwarder,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MoverPoolMessage::Register {
                mover_id,
                mover,
                position,
            } => {
                debug!(mover_id, "mover registered with pool");
                state.movers.insert(
                    mover_id,
                    MoverEntry {
                        mover,
                        position,
                        assigned_to: None,
                    },
                );
                state.serve_waiters().await;
            }
            MoverPoolMessage::Request {
                plate_id,
                destination,
                reply,
            } => {
                // A plate that already holds a mover gets it back.
                if let Some(grant) = state.current_grant(&plate_id) {
                    debug!(plate_id = %plate_id, mover_id = grant.mover_id, "request from current holder");
                    let _ = reply.send(Ok(grant));
                    return Ok(());
                }

                if state.waiters.is_empty() {
                    if let Some(mover_id) = state.select(destination) {
                        if let Some(grant) = state.assign(mover_id, &plate_id).await {
                            if reply.send(Ok(grant)).is_err() {
                                state.release_inner(mover_id).await;
                            }
                            return Ok(());
                        }
                    }
                }

                info!(
                    plate_id = %plate_id,
                    queue_len = state.waiters.len() + 1,
                    "no mover available, queueing request"
                );
                state.waiters.push_back(Waiter {
                    plate_id,
                    destination,
                    reply,
                });
            }
            MoverPoolMessage::Release { mover_id } => {
                state.release_inner(mover_id).await;
                state.serve_waiters().await;
            }
            MoverPoolMessage::CancelRequest { plate_id } => {
                state.waiters.retain(|w| w.plate_id != plate_id);
            }
            MoverPoolMessage::PositionUpdate { mover_id, position } => {
                if let Some(entry) = state.movers.get_mut(&mover_id) {
                    entry.position = position;
                }
            }
            MoverPoolMessage::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter
                .reply
                .send(Err(ActorError::refused("mover pool stopped")));
        }
        Ok(())
    }
}
