//! MoverActor: the transport executor.
//!
//! A mover is a taxi. It executes planned transports against the
//! physical driver and tracks its own pose; it knows nothing about
//! workflows. Assignment is owned by the mover pool and mirrored here
//! so the at-most-one-passenger invariant is checkable from both sides.
//!
//! Plan execution runs in a spawned task that reports back with
//! `CommandDone`/`TransportFinished` self-messages, keeping all state
//! mutation inside the actor's own handler.

use std::sync::Arc;
use std::time::Instant;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use planar_core::Position;
use planar_events::{Event, EventBus};
use planar_routing::{PathPlanner, Plan, PlannedPose, TrackCoord};

use crate::actors::errors::ActorError;
use crate::config::OrchestratorConfig;
use crate::driver::{DriverError, MoverPhysical, TransportDriver};
use crate::runtime::{start_ticker, TickHandle};
use crate::{MoverId, PlateId};

/// Assignment-level status of a mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoverStatus {
    Idle,
    Assigned,
    Transporting,
}

impl std::fmt::Display for MoverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Transporting => "transporting",
        };
        write!(f, "{name}")
    }
}

/// Point-in-time view of a mover for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoverSnapshot {
    pub mover_id: MoverId,
    pub position: Position,
    pub track: Option<TrackCoord>,
    pub velocity: f64,
    pub status: MoverStatus,
    pub assigned_plate: Option<PlateId>,
}

/// Messages handled by the mover actor.
pub enum MoverMessage {
    /// Pool protocol: mark this mover assigned to a plate.
    Assign { plate_id: PlateId },
    /// Pool protocol: clear the assignment iff it matches.
    Unassign { plate_id: PlateId },
    /// Execute a transport to a destination position.
    TransportTo {
        destination: Position,
        plate_id: PlateId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },
    /// Internal: one plan command finished.
    CommandDone { index: usize, pose: PlannedPose },
    /// Internal: the whole transport finished.
    TransportFinished { result: Result<(), ActorError> },
    /// Snapshot query.
    GetSnapshot { reply: RpcReplyPort<MoverSnapshot> },
    /// Periodic driver poll.
    Tick,
}

/// Boot arguments for a mover actor.
pub struct MoverArguments {
    pub mover_id: MoverId,
    pub initial_position: Position,
    pub driver: Arc<dyn TransportDriver>,
    pub planner: Arc<PathPlanner>,
    pub bus: Arc<EventBus>,
    pub config: OrchestratorConfig,
}

struct TransportJob {
    plate_id: PlateId,
    destination: Position,
    reply: RpcReplyPort<Result<(), ActorError>>,
    task: JoinHandle<()>,
}

pub struct MoverState {
    mover_id: MoverId,
    physical: MoverPhysical,
    status: MoverStatus,
    assigned_plate: Option<PlateId>,
    transport: Option<TransportJob>,
    ticker: Option<TickHandle>,
    last_published: Option<Instant>,
    last_published_position: Option<Position>,
    driver: Arc<dyn TransportDriver>,
    planner: Arc<PathPlanner>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
}

impl MoverState {
    fn source(&self) -> String {
        format!("mover-{}", self.mover_id)
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, self.source(), payload))
            .await;
    }

    fn snapshot(&self) -> MoverSnapshot {
        MoverSnapshot {
            mover_id: self.mover_id,
            position: self.physical.position,
            track: self.physical.track,
            velocity: self.physical.velocity,
            status: self.status,
            assigned_plate: self.assigned_plate.clone(),
        }
    }
}

#[derive(Default)]
pub struct MoverActorDef;

impl Actor for MoverActorDef {
    type Msg = MoverMessage;
    type State = MoverState;
    type Arguments = MoverArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: MoverArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let physical = match args.driver.physical_state(args.mover_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(mover_id = args.mover_id, error = %e, "driver poll failed at boot, using configured position");
                MoverPhysical::at(args.initial_position)
            }
        };

        let ticker = start_ticker(
            myself,
            args.config.position_publish_interval,
            || MoverMessage::Tick,
        );

        info!(mover_id = args.mover_id, position = %physical.position, "mover actor started");

        Ok(MoverState {
            mover_id: args.mover_id,
            physical,
            status: MoverStatus::Idle,
            assigned_plate: None,
            transport: None,
            ticker: Some(ticker),
            last_published: None,
            last_published_position: None,
            driver: args.driver,
            planner: args.planner,
            bus: args.bus,
            config: args.config,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MoverMessage::Assign { plate_id } => {
                state.assigned_plate = Some(plate_id);
                if state.status == MoverStatus::Idle {
                    state.status = MoverStatus::Assigned;
                }
            }
            MoverMessage::Unassign { plate_id } => {
                if state.assigned_plate.as_deref() == Some(plate_id.as_str()) {
                    state.assigned_plate = None;
                    if state.status == MoverStatus::Assigned {
                        state.status = MoverStatus::Idle;
                    }
                } else {
                    debug!(
                        mover_id = state.mover_id,
                        plate_id = %plate_id,
                        "unassign for a plate this mover does not carry"
                    );
                }
            }
            MoverMessage::TransportTo {
                destination,
                plate_id,
                reply,
            } => {
                handle_transport_to(myself, state, destination, plate_id, reply).await;
            }
            MoverMessage::CommandDone { index, pose } => {
                state.physical.position = pose.position;
                state.physical.track = pose.track;
                state.physical.velocity = 0.0;
                let plate_id = state.transport.as_ref().map(|t| t.plate_id.clone());
                state
                    .emit(
                        "mover.transport_progress",
                        json!({
                            "mover_id": state.mover_id,
                            "plate_id": plate_id,
                            "command_index": index,
                            "x": pose.position.x,
                            "y": pose.position.y,
                        }),
                    )
                    .await;
            }
            MoverMessage::TransportFinished { result } => {
                handle_transport_finished(state, result).await;
            }
            MoverMessage::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            MoverMessage::Tick => {
                handle_tick(state).await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.stop();
        }
        if let Some(job) = state.transport.take() {
            job.task.abort();
            let _ = job
                .reply
                .send(Err(ActorError::refused("mover actor stopped")));
        }
        Ok(())
    }
}

async fn handle_transport_to(
    myself: ActorRef<MoverMessage>,
    state: &mut MoverState,
    destination: Position,
    plate_id: PlateId,
    reply: RpcReplyPort<Result<(), ActorError>>,
) {
    if state.transport.is_some() {
        let _ = reply.send(Err(ActorError::refused("transport already in progress")));
        return;
    }
    if let Some(assigned) = &state.assigned_plate {
        if assigned != &plate_id {
            let _ = reply.send(Err(ActorError::refused(format!(
                "mover is assigned to plate {assigned}"
            ))));
            return;
        }
    }

    let plan = match state.planner.plan(state.physical.position, destination) {
        Ok(plan) => plan,
        Err(e) => {
            state
                .emit(
                    "mover.transport_failed",
                    json!({
                        "mover_id": state.mover_id,
                        "plate_id": plate_id,
                        "error": e.to_string(),
                    }),
                )
                .await;
            let _ = reply.send(Err(e.into()));
            return;
        }
    };

    if plan.is_empty() {
        // Already at the destination.
        let _ = reply.send(Ok(()));
        return;
    }

    state
        .emit(
            "mover.transport_started",
            json!({
                "mover_id": state.mover_id,
                "plate_id": plate_id,
                "from": { "x": state.physical.position.x, "y": state.physical.position.y },
                "to": { "x": destination.x, "y": destination.y },
                "commands": plan.commands.len(),
                "estimated_s": plan.estimated_duration().as_secs_f64(),
            }),
        )
        .await;

    info!(
        mover_id = state.mover_id,
        plate_id = %plate_id,
        commands = plan.commands.len(),
        cost_mm = plan.total_cost_mm,
        "transport started"
    );

    let task = spawn_execution(myself, state, plan);
    state.status = MoverStatus::Transporting;
    state.transport = Some(TransportJob {
        plate_id,
        destination,
        reply,
        task,
    });
}

/// Run the plan against the driver, retrying transient faults per
/// command, and report back through self-messages.
fn spawn_execution(
    myself: ActorRef<MoverMessage>,
    state: &MoverState,
    plan: Plan,
) -> JoinHandle<()> {
    let driver = state.driver.clone();
    let retry = state.config.retry.clone();
    let mover_id = state.mover_id;

    tokio::spawn(async move {
        for (index, planned) in plan.commands.iter().enumerate() {
            let mut attempt = 0u32;
            loop {
                match driver.execute(mover_id, planned).await {
                    Ok(()) => break,
                    Err(DriverError::Transient(reason)) => {
                        attempt += 1;
                        match retry.next_delay(attempt) {
                            Some(delay) => {
                                warn!(
                                    mover_id,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    reason = %reason,
                                    "transient driver fault, retrying command"
                                );
                                tokio::time::sleep(delay).await;
                            }
                            None => {
                                let _ = myself.send_message(MoverMessage::TransportFinished {
                                    result: Err(ActorError::transport_failed(format!(
                                        "retries exhausted: {reason}"
                                    ))),
                                });
                                return;
                            }
                        }
                    }
                    Err(DriverError::Fatal(reason)) => {
                        let _ = myself.send_message(MoverMessage::TransportFinished {
                            result: Err(ActorError::transport_failed(reason)),
                        });
                        return;
                    }
                }
            }
            if myself
                .send_message(MoverMessage::CommandDone {
                    index,
                    pose: planned.pose,
                })
                .is_err()
            {
                return;
            }
        }
        let _ = myself.send_message(MoverMessage::TransportFinished { result: Ok(()) });
    })
}

async fn handle_transport_finished(state: &mut MoverState, result: Result<(), ActorError>) {
    let Some(job) = state.transport.take() else {
        debug!(mover_id = state.mover_id, "transport finished with no job");
        return;
    };

    state.status = if state.assigned_plate.is_some() {
        MoverStatus::Assigned
    } else {
        MoverStatus::Idle
    };

    match &result {
        Ok(()) => {
            state
                .emit(
                    "mover.transport_completed",
                    json!({
                        "mover_id": state.mover_id,
                        "plate_id": job.plate_id,
                        "x": state.physical.position.x,
                        "y": state.physical.position.y,
                    }),
                )
                .await;
            info!(
                mover_id = state.mover_id,
                plate_id = %job.plate_id,
                destination = %job.destination,
                "transport completed"
            );
        }
        Err(e) => {
            state
                .emit(
                    "mover.transport_failed",
                    json!({
                        "mover_id": state.mover_id,
                        "plate_id": job.plate_id,
                        "error": e.to_string(),
                    }),
                )
                .await;
            warn!(mover_id = state.mover_id, plate_id = %job.plate_id, error = %e, "transport failed");
        }
    }

    let _ = job.reply.send(result);
}

async fn handle_tick(state: &mut MoverState) {
    // The execution task owns the pose while transporting.
    if state.status != MoverStatus::Transporting {
        if let Ok(physical) = state.driver.physical_state(state.mover_id).await {
            state.physical = physical;
        }
    }

    let due = state
        .last_published
        .is_none_or(|at| at.elapsed() >= state.config.position_publish_interval);
    let moved = state
        .last_published_position
        .is_none_or(|p| p.distance_to(&state.physical.position) > 0.5);

    if due && moved {
        state.last_published = Some(Instant::now());
        state.last_published_position = Some(state.physical.position);
        state
            .emit(
                "mover.position_changed",
                json!({
                    "mover_id": state.mover_id,
                    "x": state.physical.position.x,
                    "y": state.physical.position.y,
                    "c": state.physical.position.c,
                    "velocity": state.physical.velocity,
                }),
            )
            .await;
    }
}
