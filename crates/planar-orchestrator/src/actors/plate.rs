//! PlateActor: the autonomous passenger.
//!
//! The plate owns its workflow and drives itself through it: it hails
//! movers, negotiates station access, and orchestrates the device
//! load/process/unload protocol, releasing the mover for the whole
//! processing window. Movers and devices never learn the itinerary.
//!
//! The state machine is fully event-driven. Resource waits happen in
//! short-lived helper tasks that post a typed outcome back into the
//! mailbox, so `Pause`/`Resume`/`Abort` are observed at every phase
//! boundary. While paused, completion messages are stashed and replayed
//! on resume; held resources are never reclaimed by a pause.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use planar_core::{DeckConfig, Position, StationId, Workflow, WorkflowStep};
use planar_events::{Event, EventBus, SubscriptionId};

use crate::actors::device::DeviceMessage;
use crate::actors::errors::ActorError;
use crate::actors::mover::MoverMessage;
use crate::config::OrchestratorConfig;
use crate::pools::device_pool::{DeviceGrant, DevicePoolMessage};
use crate::pools::mover_pool::{MoverGrant, MoverPoolMessage};
use crate::runtime::{ask_flat, forward_events, start_ticker, TickHandle};
use crate::stations::{AccessDecision, StationMessage};
use crate::{MoverId, PlateId};

/// Phases of the plate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatePhase {
    Created,
    Ready,
    RequestingMover,
    AwaitingMover,
    InTransit,
    RequestingDevice,
    Loading,
    Processing,
    Unloading,
    Paused,
    Error,
    Aborted,
    Completed,
}

impl PlatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::RequestingMover => "requesting_mover",
            Self::AwaitingMover => "awaiting_mover",
            Self::InTransit => "in_transit",
            Self::RequestingDevice => "requesting_device",
            Self::Loading => "loading",
            Self::Processing => "processing",
            Self::Unloading => "unloading",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for PlatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the plate physically is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlateLocation {
    Unassigned,
    OnMover { mover_id: MoverId },
    InDevice { device_id: String, station_id: StationId },
    InStorage { slot_id: String },
}

/// Error recorded on the plate for operator recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateError {
    pub message: String,
    pub step_index: usize,
}

/// One bounded-history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub entry: String,
    pub detail: serde_json::Value,
}

/// Operator/coordinator control operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlateControl {
    Pause { reason: String },
    Resume,
    Abort { reason: String },
    RetryStep,
    SkipStep { reason: String },
}

/// Point-in-time view of a plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateSnapshot {
    pub plate_id: PlateId,
    pub phase: PlatePhase,
    pub location: PlateLocation,
    pub workflow_id: Option<String>,
    pub step_index: usize,
    pub total_steps: usize,
    pub sample_ids: Vec<String>,
    pub barcode: Option<String>,
    pub assigned_mover: Option<MoverId>,
    pub last_error: Option<PlateError>,
    pub started_at: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
}

/// Why a mover was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverPurpose {
    /// Bring the plate to the step's station.
    Delivery,
    /// Return from the queue spot after a station grant.
    DockReturn,
    /// Collect the plate after processing.
    Pickup,
}

/// What a transport was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPurpose {
    ToDock,
    ToQueue,
    ToDockAfterGrant,
}

/// Messages handled by the plate actor.
pub enum PlateMessage {
    AssignWorkflow {
        workflow: Workflow,
        sample_ids: Vec<String>,
        barcode: Option<String>,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },
    Tick,
    Pause { reason: String },
    Resume,
    Abort { reason: String },
    RetryStep,
    SkipStep { reason: String },
    MoverGranted {
        purpose: MoverPurpose,
        result: Result<MoverGrant, ActorError>,
    },
    TransportDone {
        purpose: TransportPurpose,
        result: Result<(), ActorError>,
    },
    AccessDecided {
        result: Result<AccessDecision, ActorError>,
    },
    /// Bus: our queued station request was granted.
    StationGranted,
    DeviceGranted {
        result: Result<DeviceGrant, ActorError>,
    },
    Loaded {
        result: Result<(), ActorError>,
    },
    /// Bus: device finished (or failed) processing our plate.
    ProcessingCompleted { result: Result<(), String> },
    Unloaded {
        result: Result<(), ActorError>,
    },
    GetSnapshot { reply: RpcReplyPort<PlateSnapshot> },
}

/// Shared service refs a plate needs.
#[derive(Clone)]
pub struct PlateDeps {
    pub mover_pool: ActorRef<MoverPoolMessage>,
    pub device_pool: ActorRef<DevicePoolMessage>,
    pub stations: ActorRef<StationMessage>,
    pub bus: Arc<EventBus>,
    pub deck: Arc<DeckConfig>,
}

/// Boot arguments for a plate actor.
pub struct PlateArguments {
    pub plate_id: PlateId,
    pub deps: PlateDeps,
    pub config: OrchestratorConfig,
}

pub struct PlateState {
    plate_id: PlateId,
    sample_ids: Vec<String>,
    barcode: Option<String>,
    phase: PlatePhase,
    paused_from: Option<PlatePhase>,
    stash: Vec<PlateMessage>,
    location: PlateLocation,
    workflow: Option<Workflow>,
    step_index: usize,
    started_at: Option<DateTime<Utc>>,
    step_started_at: Option<DateTime<Utc>>,
    mover: Option<MoverGrant>,
    device: Option<DeviceGrant>,
    station: Option<StationId>,
    pending_mover: Option<MoverPurpose>,
    pending_device: bool,
    pending_transport: Option<TransportPurpose>,
    station_granted: bool,
    last_error: Option<PlateError>,
    history: VecDeque<HistoryEntry>,
    ticker: Option<TickHandle>,
    subscriptions: Vec<SubscriptionId>,
    forwarders: Vec<JoinHandle<()>>,
    deps: PlateDeps,
    config: OrchestratorConfig,
}

impl PlateState {
    fn source(&self) -> String {
        format!("plate-{}", self.plate_id)
    }

    fn current_step(&self) -> Option<WorkflowStep> {
        self.workflow
            .as_ref()
            .and_then(|w| w.step(self.step_index))
            .cloned()
    }

    fn dock_position(&self, station_id: &str) -> Option<Position> {
        self.deps.deck.station(station_id).map(|s| s.position())
    }

    fn push_history(&mut self, entry: &str, detail: serde_json::Value) {
        if self.history.len() == self.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            entry: entry.to_string(),
            detail,
        });
    }

    fn snapshot(&self) -> PlateSnapshot {
        PlateSnapshot {
            plate_id: self.plate_id.clone(),
            phase: self.phase,
            location: self.location.clone(),
            workflow_id: self.workflow.as_ref().map(|w| w.id().to_string()),
            step_index: self.step_index,
            total_steps: self.workflow.as_ref().map(Workflow::len).unwrap_or(0),
            sample_ids: self.sample_ids.clone(),
            barcode: self.barcode.clone(),
            assigned_mover: self.mover.as_ref().map(|m| m.mover_id),
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            history: self.history.iter().rev().take(20).rev().cloned().collect(),
        }
    }
}

/// Publish a `plate.*` event and record it in the bounded history.
async fn emit(state: &mut PlateState, event_type: &str, mut payload: serde_json::Value) {
    if let Some(map) = payload.as_object_mut() {
        map.entry("plate_id")
            .or_insert_with(|| json!(state.plate_id));
    }
    state.push_history(event_type, payload.clone());
    state
        .deps
        .bus
        .publish(Event::new(event_type, state.source(), payload))
        .await;
}

#[derive(Default)]
pub struct PlateActorDef;

impl Actor for PlateActorDef {
    type Msg = PlateMessage;
    type State = PlateState;
    type Arguments = PlateArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: PlateArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut subscriptions = Vec::new();
        let mut forwarders = Vec::new();

        // Station grants and device completions arrive on the bus keyed
        // by plate id; forward the ones addressed to us.
        let subs: [(&str, fn(&Event) -> Option<PlateMessage>); 3] = [
            ("station.access_granted", |_| Some(PlateMessage::StationGranted)),
            ("device.processing_completed", |_| {
                Some(PlateMessage::ProcessingCompleted { result: Ok(()) })
            }),
            ("device.error", |event| {
                let error = event
                    .payload_str("error")
                    .unwrap_or("device error")
                    .to_string();
                Some(PlateMessage::ProcessingCompleted { result: Err(error) })
            }),
        ];
        for (pattern, to_message) in subs {
            let (id, subscription) = args
                .deps
                .bus
                .subscribe(pattern)
                .await
                .map_err(|e| ActorProcessingErr::from(e.to_string()))?;
            subscriptions.push(id);
            let plate_id = args.plate_id.clone();
            forwarders.push(forward_events(subscription, myself.clone(), move |event| {
                if event.payload_str("plate_id") == Some(plate_id.as_str()) {
                    to_message(event)
                } else {
                    None
                }
            }));
        }

        let ticker = start_ticker(myself, args.config.tick_interval, || PlateMessage::Tick);

        let mut state = PlateState {
            plate_id: args.plate_id,
            sample_ids: Vec::new(),
            barcode: None,
            phase: PlatePhase::Created,
            paused_from: None,
            stash: Vec::new(),
            location: PlateLocation::Unassigned,
            workflow: None,
            step_index: 0,
            started_at: None,
            step_started_at: None,
            mover: None,
            device: None,
            station: None,
            pending_mover: None,
            pending_device: false,
            pending_transport: None,
            station_granted: false,
            last_error: None,
            history: VecDeque::new(),
            ticker: Some(ticker),
            subscriptions,
            forwarders,
            deps: args.deps,
            config: args.config,
        };

        emit(&mut state, "plate.created", json!({})).await;
        info!(plate_id = %state.plate_id, "plate actor started");
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PlateMessage::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            PlateMessage::AssignWorkflow {
                workflow,
                sample_ids,
                barcode,
                reply,
            } => {
                let _ = reply.send(handle_assign(state, workflow, sample_ids, barcode).await);
            }
            PlateMessage::Tick => {
                if state.phase == PlatePhase::Ready {
                    begin_step(&myself, state).await;
                }
            }
            PlateMessage::Pause { reason } => {
                handle_pause(state, reason).await;
            }
            PlateMessage::Resume => {
                handle_resume(&myself, state).await;
            }
            PlateMessage::Abort { reason } => {
                handle_abort(state, reason).await;
            }
            PlateMessage::RetryStep => {
                handle_retry(state).await;
            }
            PlateMessage::SkipStep { reason } => {
                handle_skip(&myself, state, reason).await;
            }
            completion => {
                if state.phase.is_terminal() {
                    handle_late(state, completion).await;
                } else if state.phase == PlatePhase::Paused {
                    state.stash.push(completion);
                } else {
                    dispatch_completion(&myself, state, completion).await;
                }
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
        for id in state.subscriptions.drain(..) {
            state.deps.bus.unsubscribe(id).await;
        }
        for forwarder in state.forwarders.drain(..) {
            forwarder.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Workflow assignment and control
// ============================================================================

async fn handle_assign(
    state: &mut PlateState,
    workflow: Workflow,
    sample_ids: Vec<String>,
    barcode: Option<String>,
) -> Result<(), ActorError> {
    if let Some(existing) = &state.workflow {
        // Re-assignment of the same workflow is a no-op.
        if existing.id() == workflow.id() {
            return Ok(());
        }
        return Err(ActorError::WorkflowRejected(format!(
            "plate already runs workflow {}",
            existing.id()
        )));
    }
    if state.phase != PlatePhase::Created {
        return Err(ActorError::WorkflowRejected(format!(
            "cannot assign in phase {}",
            state.phase
        )));
    }

    let total_steps = workflow.len();
    let workflow_id = workflow.id().to_string();
    state.sample_ids = sample_ids;
    state.barcode = barcode;
    state.workflow = Some(workflow);
    state.step_index = 0;
    state.started_at = Some(Utc::now());
    state.phase = PlatePhase::Ready;

    emit(
        state,
        "plate.workflow_assigned",
        json!({
            "workflow_id": workflow_id,
            "total_steps": total_steps,
            "sample_count": state.sample_ids.len(),
        }),
    )
    .await;
    info!(plate_id = %state.plate_id, workflow_id = %workflow_id, total_steps, "workflow assigned");
    Ok(())
}

async fn handle_pause(state: &mut PlateState, reason: String) {
    if state.phase.is_terminal() || state.phase == PlatePhase::Paused {
        debug!(plate_id = %state.plate_id, phase = %state.phase, "pause ignored");
        return;
    }
    state.paused_from = Some(state.phase);
    state.phase = PlatePhase::Paused;
    let from = state.paused_from.map(|p| p.as_str());
    emit(
        state,
        "plate.paused",
        json!({ "reason": reason, "from_phase": from }),
    )
    .await;
    info!(plate_id = %state.plate_id, from = ?from, "paused");
}

async fn handle_resume(myself: &ActorRef<PlateMessage>, state: &mut PlateState) {
    if state.phase != PlatePhase::Paused {
        debug!(plate_id = %state.plate_id, phase = %state.phase, "resume ignored");
        return;
    }
    let restored = state.paused_from.take().unwrap_or(PlatePhase::Ready);
    state.phase = restored;
    emit(
        state,
        "plate.resumed",
        json!({ "to_phase": restored.as_str() }),
    )
    .await;

    // Replay everything that arrived while paused.
    for message in std::mem::take(&mut state.stash) {
        if myself.send_message(message).is_err() {
            break;
        }
    }
    info!(plate_id = %state.plate_id, to = restored.as_str(), "resumed");
}

async fn handle_abort(state: &mut PlateState, reason: String) {
    if state.phase.is_terminal() {
        debug!(plate_id = %state.plate_id, "abort ignored in terminal phase");
        return;
    }

    let step = state.current_step();

    // Cancel anything still parked in the dispatchers.
    let _ = state
        .deps
        .mover_pool
        .send_message(MoverPoolMessage::CancelRequest {
            plate_id: state.plate_id.clone(),
        });
    if let Some(step) = &step {
        let _ = state
            .deps
            .device_pool
            .send_message(DevicePoolMessage::CancelRequest {
                plate_id: state.plate_id.clone(),
                device_id: step.device_id.clone(),
            });
        if !state.station_granted {
            let _ = state.deps.stations.send_message(StationMessage::CancelRequest {
                plate_id: state.plate_id.clone(),
                station_id: step.station_id.clone(),
            });
        }
    }

    // Reverse-order release: device (abort + unload), device slot,
    // mover, station access.
    if let Some(grant) = state.device.take() {
        spawn_device_cleanup(state, grant);
        state.location = PlateLocation::Unassigned;
    }
    if state.pending_transport.is_none() {
        release_mover(state).await;
    }
    // else: the mover is mid-transport; it is released when its
    // TransportDone lands in the aborted phase.
    if let Some(station_id) = state.station.take() {
        let _ = state.deps.stations.send_message(StationMessage::ReleaseAccess {
            plate_id: state.plate_id.clone(),
            station_id,
        });
        state.station_granted = false;
    }

    state.phase = PlatePhase::Aborted;
    state.pending_mover = None;
    state.pending_device = false;
    emit(
        state,
        "plate.aborted",
        json!({ "reason": reason, "step": state.step_index }),
    )
    .await;
    if let Some(ticker) = state.ticker.take() {
        ticker.stop();
    }

    // Stashed completions may carry grants; run them through the
    // terminal-phase path so everything is returned.
    let stash = std::mem::take(&mut state.stash);
    for message in stash {
        handle_late(state, message).await;
    }
    info!(plate_id = %state.plate_id, reason = %reason, "aborted");
}

/// Abort + unload + slot release for a held device, off the actor loop.
///
/// An in-flight load or unload makes the device refuse for a moment, so
/// the unload is retried until the device settles. The pool slot is only
/// released once the plate is actually out.
fn spawn_device_cleanup(state: &PlateState, grant: DeviceGrant) {
    let plate_id = state.plate_id.clone();
    let device_pool = state.deps.device_pool.clone();
    let timeout = state.config.device_timeout;
    tokio::spawn(async move {
        for _attempt in 0..20u32 {
            let _ = ask_flat(
                &grant.device,
                |reply| DeviceMessage::Abort {
                    plate_id: plate_id.clone(),
                    reply,
                },
                timeout,
            )
            .await;
            let unloaded = ask_flat(
                &grant.device,
                |reply| DeviceMessage::UnloadPlate {
                    plate_id: plate_id.clone(),
                    reply,
                },
                timeout,
            )
            .await;
            match unloaded {
                Ok(()) | Err(ActorError::ActorUnavailable) | Err(ActorError::Channel(_)) => break,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        }
        let _ = device_pool.send_message(DevicePoolMessage::Release {
            device_id: grant.device_id.clone(),
            plate_id,
        });
    });
}

async fn handle_retry(state: &mut PlateState) {
    if state.phase != PlatePhase::Error {
        warn!(plate_id = %state.plate_id, phase = %state.phase, "retry_step only applies in error");
        return;
    }
    state.last_error = None;
    state.pending_transport = None;
    state.pending_mover = None;
    state.pending_device = false;
    state.phase = PlatePhase::Ready;
    emit(state, "plate.step_retry", json!({ "step": state.step_index })).await;
    info!(plate_id = %state.plate_id, step = state.step_index, "retrying step");
}

async fn handle_skip(myself: &ActorRef<PlateMessage>, state: &mut PlateState, reason: String) {
    if state.phase != PlatePhase::Error && state.phase != PlatePhase::Paused {
        warn!(plate_id = %state.plate_id, phase = %state.phase, "skip_step only applies in error or paused");
        return;
    }

    let skipped = state.step_index;
    // Step-scoped resources go back; the mover is kept for the next hop.
    if let Some(grant) = state.device.take() {
        spawn_device_cleanup(state, grant);
        state.location = PlateLocation::Unassigned;
    }
    if let Some(station_id) = state.station.take() {
        let _ = state.deps.stations.send_message(StationMessage::ReleaseAccess {
            plate_id: state.plate_id.clone(),
            station_id,
        });
    } else if let Some(step) = state.current_step() {
        let _ = state.deps.stations.send_message(StationMessage::CancelRequest {
            plate_id: state.plate_id.clone(),
            station_id: step.station_id,
        });
    }
    state.station_granted = false;
    state.pending_transport = None;
    state.pending_mover = None;
    state.pending_device = false;
    state.paused_from = None;
    state.last_error = None;
    state.step_index += 1;
    state.phase = PlatePhase::Ready;
    emit(
        state,
        "plate.step_skipped",
        json!({ "step": skipped, "reason": reason }),
    )
    .await;

    // Anything stashed by an earlier pause is stale now; replay it so
    // the guards can return raced-in grants to their pools.
    for message in std::mem::take(&mut state.stash) {
        if myself.send_message(message).is_err() {
            break;
        }
    }
    info!(plate_id = %state.plate_id, step = skipped, "step skipped");
}

// ============================================================================
// Step execution
// ============================================================================

async fn begin_step(myself: &ActorRef<PlateMessage>, state: &mut PlateState) {
    let total = state.workflow.as_ref().map(Workflow::len).unwrap_or(0);
    if state.step_index >= total {
        complete_workflow(state).await;
        return;
    }
    let Some(step) = state.current_step() else {
        return;
    };

    state.step_started_at = Some(Utc::now());
    emit(
        state,
        "plate.step_started",
        json!({
            "step": state.step_index,
            "step_name": step.name,
            "station_id": step.station_id,
            "device_id": step.device_id,
        }),
    )
    .await;

    let Some(dock) = state.dock_position(&step.station_id) else {
        enter_error(state, format!("unknown station {}", step.station_id)).await;
        return;
    };

    if state.mover.is_some() {
        // Still carrying the pickup mover from the previous step.
        state.phase = PlatePhase::InTransit;
        emit(
            state,
            "plate.transport_started",
            json!({ "station_id": step.station_id }),
        )
        .await;
        spawn_transport(myself, state, dock, TransportPurpose::ToDock);
    } else {
        state.phase = PlatePhase::RequestingMover;
        emit(
            state,
            "plate.mover_requested",
            json!({ "station_id": step.station_id }),
        )
        .await;
        spawn_mover_request(myself, state, MoverPurpose::Delivery, dock);
        state.phase = PlatePhase::AwaitingMover;
    }
}

fn spawn_mover_request(
    myself: &ActorRef<PlateMessage>,
    state: &mut PlateState,
    purpose: MoverPurpose,
    destination: Position,
) {
    state.pending_mover = Some(purpose);
    let pool = state.deps.mover_pool.clone();
    let plate_id = state.plate_id.clone();
    let timeout = state.config.resource_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &pool,
            |reply| MoverPoolMessage::Request {
                plate_id,
                destination,
                reply,
            },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::MoverGranted { purpose, result });
    });
}

fn spawn_transport(
    myself: &ActorRef<PlateMessage>,
    state: &mut PlateState,
    destination: Position,
    purpose: TransportPurpose,
) {
    let Some(grant) = state.mover.clone() else {
        // Cannot happen in a consistent state machine; surface loudly.
        warn!(plate_id = %state.plate_id, "transport without a mover");
        return;
    };
    state.pending_transport = Some(purpose);
    let plate_id = state.plate_id.clone();
    let timeout = state.config.transport_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &grant.mover,
            |reply| MoverMessage::TransportTo {
                destination,
                plate_id,
                reply,
            },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::TransportDone { purpose, result });
    });
}

fn spawn_station_request(myself: &ActorRef<PlateMessage>, state: &PlateState, station_id: StationId) {
    let stations = state.deps.stations.clone();
    let plate_id = state.plate_id.clone();
    let timeout = state.config.ask_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &stations,
            |reply| StationMessage::RequestAccess {
                plate_id,
                station_id,
                reply,
            },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::AccessDecided { result });
    });
}

fn spawn_device_request(myself: &ActorRef<PlateMessage>, state: &mut PlateState, device_id: String) {
    state.pending_device = true;
    let pool = state.deps.device_pool.clone();
    let plate_id = state.plate_id.clone();
    let timeout = state.config.resource_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &pool,
            |reply| DevicePoolMessage::Request {
                plate_id,
                device_id,
                reply,
            },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::DeviceGranted { result });
    });
}

fn spawn_device_load(myself: &ActorRef<PlateMessage>, state: &PlateState, grant: DeviceGrant) {
    let plate_id = state.plate_id.clone();
    let timeout = state.config.device_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &grant.device,
            |reply| DeviceMessage::LoadPlate { plate_id, reply },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::Loaded { result });
    });
}

fn spawn_device_unload(myself: &ActorRef<PlateMessage>, state: &PlateState, grant: DeviceGrant) {
    let plate_id = state.plate_id.clone();
    let timeout = state.config.device_timeout;
    let myself = myself.clone();
    tokio::spawn(async move {
        let result = ask_flat(
            &grant.device,
            |reply| DeviceMessage::UnloadPlate { plate_id, reply },
            timeout,
        )
        .await;
        let _ = myself.send_message(PlateMessage::Unloaded { result });
    });
}

async fn dispatch_completion(
    myself: &ActorRef<PlateMessage>,
    state: &mut PlateState,
    message: PlateMessage,
) {
    match message {
        PlateMessage::MoverGranted { purpose, result } => {
            if state.pending_mover != Some(purpose) {
                debug!(plate_id = %state.plate_id, "stale mover grant");
                if let Ok(grant) = result {
                    if state.mover.as_ref().map(|m| m.mover_id) != Some(grant.mover_id) {
                        let _ = state.deps.mover_pool.send_message(MoverPoolMessage::Release {
                            mover_id: grant.mover_id,
                        });
                    }
                }
                return;
            }
            state.pending_mover = None;
            match result {
                Ok(grant) => {
                    let mover_id = grant.mover_id;
                    state.mover = Some(grant);
                    emit(state, "plate.mover_assigned", json!({ "mover_id": mover_id })).await;

                    match purpose {
                        MoverPurpose::Delivery => {
                            state.location = PlateLocation::OnMover { mover_id };
                            state.phase = PlatePhase::InTransit;
                            let Some(step) = state.current_step() else {
                                return;
                            };
                            let Some(dock) = state.dock_position(&step.station_id) else {
                                enter_error(state, format!("unknown station {}", step.station_id))
                                    .await;
                                return;
                            };
                            emit(
                                state,
                                "plate.transport_started",
                                json!({ "station_id": step.station_id }),
                            )
                            .await;
                            spawn_transport(myself, state, dock, TransportPurpose::ToDock);
                        }
                        MoverPurpose::DockReturn => {
                            state.location = PlateLocation::OnMover { mover_id };
                            go_to_dock_after_grant(myself, state).await;
                        }
                        MoverPurpose::Pickup => {
                            let Some(device) = state.device.clone() else {
                                enter_error(
                                    state,
                                    "pickup mover granted with no device held".into(),
                                )
                                .await;
                                return;
                            };
                            state.phase = PlatePhase::Unloading;
                            emit(
                                state,
                                "plate.unloading",
                                json!({ "device_id": device.device_id }),
                            )
                            .await;
                            spawn_device_unload(myself, state, device);
                        }
                    }
                }
                Err(e) => enter_error(state, format!("mover request failed: {e}")).await,
            }
        }
        PlateMessage::TransportDone { purpose, result } => {
            if state.pending_transport != Some(purpose) {
                debug!(plate_id = %state.plate_id, "stale transport completion ignored");
                return;
            }
            state.pending_transport = None;
            match result {
                Err(e) => enter_error(state, format!("transport failed: {e}")).await,
                Ok(()) => match purpose {
                    TransportPurpose::ToDock => {
                        let Some(step) = state.current_step() else {
                            return;
                        };
                        emit(state, "plate.arrived", json!({ "station_id": step.station_id }))
                            .await;
                        state.phase = PlatePhase::RequestingDevice;
                        spawn_station_request(myself, state, step.station_id);
                    }
                    TransportPurpose::ToQueue => {
                        if state.station_granted {
                            // Granted while we were still driving to the
                            // queue spot; turn straight around.
                            go_to_dock_after_grant(myself, state).await;
                        } else {
                            // Parked. The mover goes back to the pool
                            // while we wait, so occupants can still get
                            // their pickups; a fresh one is hailed on
                            // promotion.
                            release_mover(state).await;
                            state.location = PlateLocation::Unassigned;
                        }
                    }
                    TransportPurpose::ToDockAfterGrant => {
                        request_device(myself, state).await;
                    }
                },
            }
        }
        PlateMessage::AccessDecided { result } => {
            if state.phase != PlatePhase::RequestingDevice {
                debug!(plate_id = %state.plate_id, phase = %state.phase, "stale access decision");
                return;
            }
            match result {
                Ok(AccessDecision::Granted) => {
                    // The grant may already have landed through the bus.
                    if state.station_granted {
                        return;
                    }
                    if let Some(step) = state.current_step() {
                        state.station = Some(step.station_id.clone());
                    }
                    state.station_granted = true;
                    request_device(myself, state).await;
                }
                Ok(AccessDecision::Queued {
                    position,
                    queue_location,
                }) => {
                    if state.station_granted {
                        // Promoted before the queued reply was processed.
                        // The grant handler is already advancing the flow;
                        // only fill in if it had nothing to do yet.
                        if state.pending_transport.is_none() && state.device.is_none() {
                            request_device(myself, state).await;
                        }
                        return;
                    }
                    emit(
                        state,
                        "plate.transport_started",
                        json!({ "queue_position": position }),
                    )
                    .await;
                    spawn_transport(myself, state, queue_location, TransportPurpose::ToQueue);
                }
                Err(e) => enter_error(state, format!("station access failed: {e}")).await,
            }
        }
        PlateMessage::StationGranted => {
            if state.station_granted || state.phase != PlatePhase::RequestingDevice {
                return;
            }
            if let Some(step) = state.current_step() {
                state.station = Some(step.station_id.clone());
            }
            state.station_granted = true;
            if state.pending_transport.is_some() {
                // Still driving to the queue spot; the ToQueue
                // completion turns us around.
                return;
            }
            if state.mover.is_some() {
                go_to_dock_after_grant(myself, state).await;
            } else {
                // Parked at the queue without a mover: hail one for the
                // return leg.
                let Some(step) = state.current_step() else {
                    return;
                };
                let Some(dock) = state.dock_position(&step.station_id) else {
                    enter_error(state, format!("unknown station {}", step.station_id)).await;
                    return;
                };
                emit(
                    state,
                    "plate.mover_requested",
                    json!({ "station_id": step.station_id, "purpose": "dock_return" }),
                )
                .await;
                spawn_mover_request(myself, state, MoverPurpose::DockReturn, dock);
            }
        }
        PlateMessage::DeviceGranted { result } => {
            if !state.pending_device {
                debug!(plate_id = %state.plate_id, "stale device grant");
                if let Ok(grant) = result {
                    if state.device.as_ref().map(|d| &d.device_id) != Some(&grant.device_id) {
                        let _ = state.deps.device_pool.send_message(DevicePoolMessage::Release {
                            device_id: grant.device_id,
                            plate_id: state.plate_id.clone(),
                        });
                    }
                }
                return;
            }
            state.pending_device = false;
            match result {
                Ok(grant) => {
                    state.device = Some(grant.clone());
                    state.phase = PlatePhase::Loading;
                    emit(state, "plate.loading", json!({ "device_id": grant.device_id })).await;
                    spawn_device_load(myself, state, grant);
                }
                Err(e) => enter_error(state, format!("device request failed: {e}")).await,
            }
        }
        PlateMessage::Loaded { result } => {
            if state.phase != PlatePhase::Loading {
                debug!(plate_id = %state.plate_id, phase = %state.phase, "stale load completion");
                return;
            }
            match result {
                Ok(()) => {
                    release_mover(state).await;
                    let Some(step) = state.current_step() else {
                        return;
                    };
                    state.location = PlateLocation::InDevice {
                        device_id: step.device_id.clone(),
                        station_id: step.station_id.clone(),
                    };
                    state.phase = PlatePhase::Processing;
                    emit(
                        state,
                        "plate.processing_started",
                        json!({
                            "device_id": step.device_id,
                            "duration_s": step.duration.map(|d| d.as_secs_f64()),
                        }),
                    )
                    .await;
                    if let Some(device) = &state.device {
                        let _ = device.device.send_message(DeviceMessage::StartProcess {
                            plate_id: state.plate_id.clone(),
                            duration: step.duration,
                            parameters: step.parameters.clone(),
                        });
                    }
                }
                Err(e) => enter_error(state, format!("load failed: {e}")).await,
            }
        }
        PlateMessage::ProcessingCompleted { result } => {
            if state.phase != PlatePhase::Processing {
                debug!(plate_id = %state.plate_id, phase = %state.phase, "stale processing completion");
                return;
            }
            match result {
                Ok(()) => {
                    let Some(step) = state.current_step() else {
                        return;
                    };
                    emit(
                        state,
                        "plate.processing_completed",
                        json!({ "device_id": step.device_id, "step": state.step_index }),
                    )
                    .await;
                    let Some(dock) = state.dock_position(&step.station_id) else {
                        enter_error(state, format!("unknown station {}", step.station_id)).await;
                        return;
                    };
                    state.phase = PlatePhase::RequestingMover;
                    emit(
                        state,
                        "plate.mover_requested",
                        json!({ "station_id": step.station_id, "purpose": "pickup" }),
                    )
                    .await;
                    spawn_mover_request(myself, state, MoverPurpose::Pickup, dock);
                }
                Err(error) => enter_error(state, format!("processing failed: {error}")).await,
            }
        }
        PlateMessage::Unloaded { result } => {
            if state.phase != PlatePhase::Unloading {
                debug!(plate_id = %state.plate_id, phase = %state.phase, "stale unload completion");
                return;
            }
            match result {
                Ok(()) => {
                    let mover_id = state.mover.as_ref().map(|m| m.mover_id);
                    if let Some(mover_id) = mover_id {
                        state.location = PlateLocation::OnMover { mover_id };
                    }
                    if let Some(device) = state.device.take() {
                        let _ = state.deps.device_pool.send_message(DevicePoolMessage::Release {
                            device_id: device.device_id,
                            plate_id: state.plate_id.clone(),
                        });
                    }
                    if let Some(station_id) = state.station.take() {
                        let _ = state.deps.stations.send_message(StationMessage::ReleaseAccess {
                            plate_id: state.plate_id.clone(),
                            station_id,
                        });
                    }
                    state.station_granted = false;

                    let completed = state.step_index;
                    state.step_index += 1;
                    let total = state.workflow.as_ref().map(Workflow::len).unwrap_or(0);
                    state.phase = PlatePhase::Ready;
                    emit(
                        state,
                        "plate.step_completed",
                        json!({ "step_index": completed, "total_steps": total }),
                    )
                    .await;
                    info!(plate_id = %state.plate_id, step = completed, "step completed");
                }
                Err(e) => enter_error(state, format!("unload failed: {e}")).await,
            }
        }
        other => {
            // Queries and controls are matched before dispatch; anything
            // else here is a protocol bug worth seeing in the logs.
            let _ = other;
            warn!(plate_id = %state.plate_id, "unexpected message in dispatch_completion");
        }
    }
}

async fn go_to_dock_after_grant(myself: &ActorRef<PlateMessage>, state: &mut PlateState) {
    let Some(step) = state.current_step() else {
        return;
    };
    let Some(dock) = state.dock_position(&step.station_id) else {
        enter_error(state, format!("unknown station {}", step.station_id)).await;
        return;
    };
    emit(
        state,
        "plate.transport_started",
        json!({ "station_id": step.station_id, "after": "station_grant" }),
    )
    .await;
    spawn_transport(myself, state, dock, TransportPurpose::ToDockAfterGrant);
}

async fn request_device(myself: &ActorRef<PlateMessage>, state: &mut PlateState) {
    let Some(step) = state.current_step() else {
        return;
    };
    emit(
        state,
        "plate.device_requested",
        json!({ "device_id": step.device_id }),
    )
    .await;
    spawn_device_request(myself, state, step.device_id);
}

async fn release_mover(state: &mut PlateState) {
    if let Some(grant) = state.mover.take() {
        let _ = state.deps.mover_pool.send_message(MoverPoolMessage::Release {
            mover_id: grant.mover_id,
        });
        emit(
            state,
            "plate.mover_released",
            json!({ "mover_id": grant.mover_id }),
        )
        .await;
    }
}

async fn complete_workflow(state: &mut PlateState) {
    release_mover(state).await;
    state.location = PlateLocation::Unassigned;
    state.phase = PlatePhase::Completed;
    let duration_s = state
        .started_at
        .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0);
    let workflow_id = state.workflow.as_ref().map(|w| w.id().to_string());
    let total = state.workflow.as_ref().map(Workflow::len).unwrap_or(0);
    emit(
        state,
        "plate.workflow_completed",
        json!({
            "workflow_id": workflow_id,
            "total_steps": total,
            "duration_s": duration_s,
        }),
    )
    .await;
    if let Some(ticker) = state.ticker.take() {
        ticker.stop();
    }
    info!(plate_id = %state.plate_id, total_steps = total, "workflow completed");
}

async fn enter_error(state: &mut PlateState, message: String) {
    if state.phase.is_terminal() {
        return;
    }
    state.last_error = Some(PlateError {
        message: message.clone(),
        step_index: state.step_index,
    });
    state.phase = PlatePhase::Error;
    emit(
        state,
        "plate.error",
        json!({ "error": message, "step": state.step_index }),
    )
    .await;
    warn!(plate_id = %state.plate_id, step = state.step_index, error = %message, "plate entered error");
}

/// Resource completions arriving after the plate reached a terminal
/// phase: hand everything straight back so nothing leaks.
async fn handle_late(state: &mut PlateState, message: PlateMessage) {
    match message {
        PlateMessage::MoverGranted { result: Ok(grant), .. } => {
            let _ = state.deps.mover_pool.send_message(MoverPoolMessage::Release {
                mover_id: grant.mover_id,
            });
        }
        PlateMessage::TransportDone { .. } => {
            state.pending_transport = None;
            release_mover(state).await;
            if matches!(state.location, PlateLocation::OnMover { .. }) {
                state.location = PlateLocation::Unassigned;
            }
        }
        PlateMessage::DeviceGranted { result: Ok(grant), .. } => {
            let _ = state.deps.device_pool.send_message(DevicePoolMessage::Release {
                device_id: grant.device_id,
                plate_id: state.plate_id.clone(),
            });
        }
        PlateMessage::AccessDecided {
            result: Ok(AccessDecision::Granted),
        }
        | PlateMessage::StationGranted => {
            if let Some(step) = state.current_step() {
                let _ = state.deps.stations.send_message(StationMessage::ReleaseAccess {
                    plate_id: state.plate_id.clone(),
                    station_id: step.station_id,
                });
            }
        }
        PlateMessage::AccessDecided {
            result: Ok(AccessDecision::Queued { .. }),
        } => {
            if let Some(step) = state.current_step() {
                let _ = state.deps.stations.send_message(StationMessage::CancelRequest {
                    plate_id: state.plate_id.clone(),
                    station_id: step.station_id,
                });
            }
        }
        _ => {
            debug!(plate_id = %state.plate_id, "late message dropped in terminal phase");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pools::device_pool::DevicePoolActorDef;
    use crate::pools::mover_pool::{MoverPoolActorDef, MoverPoolArguments};
    use crate::runtime::ask;
    use crate::stations::{StationManagerArguments, StationManagerDef};
    use planar_core::{DeviceType, TrackMap};
    use planar_routing::{PathPlanner, PlannerConfig};
    use std::time::Duration;

    async fn test_deps() -> Option<PlateDeps> {
        let deck = Arc::new(DeckConfig::demo());
        let bus = Arc::new(EventBus::new());
        let planner = Arc::new(PathPlanner::new(
            DeckConfig::demo(),
            TrackMap::new(),
            PlannerConfig::default(),
        ));
        let (mover_pool, _) = Actor::spawn(
            None,
            MoverPoolActorDef,
            MoverPoolArguments {
                planner,
                bus: bus.clone(),
            },
        )
        .await
        .ok()?;
        let (device_pool, _) = Actor::spawn(
            None,
            DevicePoolActorDef,
            crate::pools::device_pool::DevicePoolArguments { bus: bus.clone() },
        )
        .await
        .ok()?;
        let (stations, _) = Actor::spawn(
            None,
            StationManagerDef,
            StationManagerArguments {
                stations: deck.stations.clone(),
                bus: bus.clone(),
            },
        )
        .await
        .ok()?;
        Some(PlateDeps {
            mover_pool,
            device_pool,
            stations,
            bus,
            deck,
        })
    }

    fn workflow() -> Workflow {
        Workflow::new(
            "wf-1",
            vec![WorkflowStep::new(
                "s0",
                "delid",
                "STATION_1",
                "lidmate-1",
                DeviceType::Lidmate,
            )],
        )
        .unwrap_or_else(|_| unreachable!())
    }

    async fn spawn_plate(deps: PlateDeps) -> Option<ActorRef<PlateMessage>> {
        let args = PlateArguments {
            plate_id: "P1".into(),
            deps,
            config: OrchestratorConfig::for_tests(),
        };
        Actor::spawn(None, PlateActorDef, args).await.ok().map(|x| x.0)
    }

    #[tokio::test]
    async fn assign_workflow_is_idempotent_for_same_id() {
        let Some(deps) = test_deps().await else {
            return;
        };
        let Some(plate) = spawn_plate(deps).await else {
            return;
        };

        let assign = |wf: Workflow| {
            let plate = plate.clone();
            async move {
                ask_flat(
                    &plate,
                    |reply| PlateMessage::AssignWorkflow {
                        workflow: wf,
                        sample_ids: vec!["S1".into()],
                        barcode: None,
                        reply,
                    },
                    Duration::from_secs(1),
                )
                .await
            }
        };

        assert_eq!(assign(workflow()).await, Ok(()));
        // Same id: accepted as a no-op.
        assert_eq!(assign(workflow()).await, Ok(()));
        // Different id: rejected.
        let other = Workflow::new("wf-2", vec![]).unwrap_or_else(|_| unreachable!());
        assert!(matches!(
            assign(other).await,
            Err(ActorError::WorkflowRejected(_))
        ));

        plate.stop(None);
    }

    #[tokio::test]
    async fn pause_then_resume_restores_the_phase() {
        let Some(deps) = test_deps().await else {
            return;
        };
        let Some(plate) = spawn_plate(deps).await else {
            return;
        };

        let _ = plate.send_message(PlateMessage::Pause {
            reason: "operator".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = ask(
            &plate,
            |reply| PlateMessage::GetSnapshot { reply },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(snapshot.map(|s| s.phase), Ok(PlatePhase::Paused));

        let _ = plate.send_message(PlateMessage::Resume);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = ask(
            &plate,
            |reply| PlateMessage::GetSnapshot { reply },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(snapshot.map(|s| s.phase), Ok(PlatePhase::Created));

        plate.stop(None);
    }

    #[tokio::test]
    async fn abort_is_terminal_and_emits() {
        let Some(deps) = test_deps().await else {
            return;
        };
        let bus = deps.bus.clone();
        let Ok((_sid, mut events)) = bus.subscribe("plate.aborted").await else {
            return;
        };
        let Some(plate) = spawn_plate(deps).await else {
            return;
        };

        let _ = plate.send_message(PlateMessage::Abort {
            reason: "spill".into(),
        });
        let event = events.recv().await;
        assert_eq!(
            event.as_ref().ok().and_then(|e| e.payload_str("reason")),
            Some("spill")
        );

        // Control after the end is ignored.
        let _ = plate.send_message(PlateMessage::Resume);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = ask(
            &plate,
            |reply| PlateMessage::GetSnapshot { reply },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(snapshot.map(|s| s.phase), Ok(PlatePhase::Aborted));

        plate.stop(None);
    }
}
