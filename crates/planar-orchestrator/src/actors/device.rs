//! DeviceActor: load / process / unload protocol.
//!
//! Processing completion never parks a reply channel: `StartProcess`
//! is fire-and-forget and completion lands on the bus as
//! `device.processing_completed` keyed by plate id. Timed devices run
//! a timer task; event-driven devices wait for a `DriverCompleted`
//! injection from the coordinator.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use planar_core::{DeviceId, DeviceType, StationId};
use planar_events::{Event, EventBus};

use crate::actors::errors::ActorError;
use crate::config::OrchestratorConfig;
use crate::PlateId;

/// Device protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Idle,
    Loading,
    Processing,
    Unloading,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Processing => "processing",
            Self::Unloading => "unloading",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub station_id: StationId,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub current_plate: Option<PlateId>,
    pub processing_done: bool,
}

/// Messages handled by the device actor.
pub enum DeviceMessage {
    /// Dock the mover and transfer the plate into the device.
    LoadPlate {
        plate_id: PlateId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },
    /// Internal: load motion finished.
    LoadFinished,
    /// Begin the device operation (completion arrives on the bus).
    StartProcess {
        plate_id: PlateId,
        duration: Option<Duration>,
        parameters: serde_json::Value,
    },
    /// Internal: timed processing finished.
    ProcessFinished { result: Result<(), String> },
    /// Driver callback for event-driven devices.
    DriverCompleted { result: Result<(), String> },
    /// Transfer the plate back onto a mover.
    UnloadPlate {
        plate_id: PlateId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },
    /// Internal: unload motion finished.
    UnloadFinished,
    /// Cancel the current operation if safe.
    Abort {
        plate_id: PlateId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },
    /// Snapshot query.
    GetSnapshot { reply: RpcReplyPort<DeviceSnapshot> },
}

/// Boot arguments for a device actor.
pub struct DeviceArguments {
    pub device_id: DeviceId,
    pub station_id: StationId,
    pub device_type: DeviceType,
    pub bus: Arc<EventBus>,
    pub config: OrchestratorConfig,
}

pub struct DeviceState {
    device_id: DeviceId,
    station_id: StationId,
    device_type: DeviceType,
    status: DeviceStatus,
    current_plate: Option<PlateId>,
    processing_done: bool,
    motion_reply: Option<RpcReplyPort<Result<(), ActorError>>>,
    motion_task: Option<JoinHandle<()>>,
    process_task: Option<JoinHandle<()>>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
}

impl DeviceState {
    fn source(&self) -> String {
        format!("device-{}", self.device_id)
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, self.source(), payload))
            .await;
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            station_id: self.station_id.clone(),
            device_type: self.device_type,
            status: self.status,
            current_plate: self.current_plate.clone(),
            processing_done: self.processing_done,
        }
    }

    fn holds(&self, plate_id: &str) -> bool {
        self.current_plate.as_deref() == Some(plate_id)
    }
}

#[derive(Default)]
pub struct DeviceActorDef;

impl Actor for DeviceActorDef {
    type Msg = DeviceMessage;
    type State = DeviceState;
    type Arguments = DeviceArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: DeviceArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(device_id = %args.device_id, device_type = %args.device_type, "device actor started");
        Ok(DeviceState {
            device_id: args.device_id,
            station_id: args.station_id,
            device_type: args.device_type,
            status: DeviceStatus::Idle,
            current_plate: None,
            processing_done: false,
            motion_reply: None,
            motion_task: None,
            process_task: None,
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
            DeviceMessage::LoadPlate { plate_id, reply } => {
                handle_load(myself, state, plate_id, reply).await;
            }
            DeviceMessage::LoadFinished => {
                state.motion_task = None;
                if let Some(reply) = state.motion_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            DeviceMessage::StartProcess {
                plate_id,
                duration,
                parameters,
            } => {
                handle_start_process(myself, state, plate_id, duration, parameters).await;
            }
            DeviceMessage::ProcessFinished { result }
            | DeviceMessage::DriverCompleted { result } => {
                handle_process_finished(state, result).await;
            }
            DeviceMessage::UnloadPlate { plate_id, reply } => {
                handle_unload(myself, state, plate_id, reply).await;
            }
            DeviceMessage::UnloadFinished => {
                state.motion_task = None;
                state.status = DeviceStatus::Idle;
                state.current_plate = None;
                state.processing_done = false;
                if let Some(reply) = state.motion_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            DeviceMessage::Abort { plate_id, reply } => {
                handle_abort(state, plate_id, reply);
            }
            DeviceMessage::GetSnapshot { reply } => {
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
        for task in [state.motion_task.take(), state.process_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(reply) = state.motion_reply.take() {
            let _ = reply.send(Err(ActorError::refused("device actor stopped")));
        }
        Ok(())
    }
}

async fn handle_load(
    myself: ActorRef<DeviceMessage>,
    state: &mut DeviceState,
    plate_id: PlateId,
    reply: RpcReplyPort<Result<(), ActorError>>,
) {
    // A plate retrying a failed step may already sit in the device.
    if state.holds(&plate_id) && state.status != DeviceStatus::Unloading {
        let _ = reply.send(Ok(()));
        return;
    }
    if state.current_plate.is_some() {
        let holder = state.current_plate.clone().unwrap_or_default();
        let _ = reply.send(Err(ActorError::DeviceBusy {
            device_id: state.device_id.clone(),
            holder,
        }));
        return;
    }
    if state.status != DeviceStatus::Idle {
        let _ = reply.send(Err(ActorError::refused(format!(
            "device is {}",
            state.status
        ))));
        return;
    }

    state.status = DeviceStatus::Loading;
    state.current_plate = Some(plate_id.clone());
    state.processing_done = false;
    state.motion_reply = Some(reply);
    state
        .emit(
            "device.load_started",
            json!({ "device_id": state.device_id, "plate_id": plate_id }),
        )
        .await;

    let wait = state.config.scaled(state.config.device_motion_time);
    state.motion_task = Some(tokio::spawn(async move {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let _ = myself.send_message(DeviceMessage::LoadFinished);
    }));
}

async fn handle_start_process(
    myself: ActorRef<DeviceMessage>,
    state: &mut DeviceState,
    plate_id: PlateId,
    duration: Option<Duration>,
    parameters: serde_json::Value,
) {
    if !state.holds(&plate_id) {
        warn!(
            device_id = %state.device_id,
            plate_id = %plate_id,
            "start_process for a plate not in this device"
        );
        return;
    }

    state.status = DeviceStatus::Processing;
    state.processing_done = false;
    state
        .emit(
            "device.processing_started",
            json!({
                "device_id": state.device_id,
                "plate_id": plate_id,
                "duration_s": duration.map(|d| d.as_secs_f64()),
                "parameters": parameters,
            }),
        )
        .await;

    match duration {
        Some(duration) => {
            let wait = state.config.scaled(duration);
            let progress_every = state.config.scaled(state.config.progress_interval);
            let bus = state.bus.clone();
            let source = state.source();
            let device_id = state.device_id.clone();

            state.process_task = Some(tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                if !progress_every.is_zero() {
                    let mut ticker = tokio::time::interval(progress_every);
                    ticker.tick().await;
                    loop {
                        let remaining = wait.saturating_sub(started.elapsed());
                        if remaining.is_zero() {
                            break;
                        }
                        tokio::select! {
                            _ = ticker.tick() => {
                                let fraction =
                                    (started.elapsed().as_secs_f64() / wait.as_secs_f64().max(1e-9)).min(1.0);
                                bus.publish(Event::new(
                                    "device.processing_progress",
                                    source.clone(),
                                    json!({
                                        "device_id": device_id,
                                        "plate_id": plate_id,
                                        "progress": fraction,
                                    }),
                                ))
                                .await;
                            }
                            _ = tokio::time::sleep(remaining) => break,
                        }
                    }
                } else if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                let _ = myself.send_message(DeviceMessage::ProcessFinished { result: Ok(()) });
            }));
        }
        None => {
            debug!(device_id = %state.device_id, "event-driven processing, awaiting driver completion");
        }
    }
}

async fn handle_process_finished(state: &mut DeviceState, result: Result<(), String>) {
    if state.status != DeviceStatus::Processing || state.processing_done {
        debug!(device_id = %state.device_id, "stale processing completion in status {}", state.status);
        return;
    }
    state.process_task = None;

    let Some(plate_id) = state.current_plate.clone() else {
        return;
    };

    match result {
        Ok(()) => {
            state.processing_done = true;
            state
                .emit(
                    "device.processing_completed",
                    json!({ "device_id": state.device_id, "plate_id": plate_id }),
                )
                .await;
            info!(device_id = %state.device_id, plate_id = %plate_id, "processing completed");
        }
        Err(error) => {
            state.status = DeviceStatus::Error;
            state
                .emit(
                    "device.error",
                    json!({
                        "device_id": state.device_id,
                        "plate_id": plate_id,
                        "error": error,
                    }),
                )
                .await;
            warn!(device_id = %state.device_id, plate_id = %plate_id, error = %error, "device error during processing");
        }
    }
}

async fn handle_unload(
    myself: ActorRef<DeviceMessage>,
    state: &mut DeviceState,
    plate_id: PlateId,
    reply: RpcReplyPort<Result<(), ActorError>>,
) {
    if !state.holds(&plate_id) {
        let _ = reply.send(Err(ActorError::refused(
            "plate is not in this device".to_string(),
        )));
        return;
    }
    let unloadable = match state.status {
        // Loaded but never started: fine to take straight back out.
        DeviceStatus::Loading => state.motion_task.is_none(),
        DeviceStatus::Processing => state.processing_done,
        DeviceStatus::Error => true,
        _ => false,
    };
    if !unloadable {
        let _ = reply.send(Err(ActorError::refused(format!(
            "cannot unload while {}",
            state.status
        ))));
        return;
    }

    state.status = DeviceStatus::Unloading;
    state.motion_reply = Some(reply);
    let wait = state.config.scaled(state.config.device_motion_time);
    state.motion_task = Some(tokio::spawn(async move {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let _ = myself.send_message(DeviceMessage::UnloadFinished);
    }));
}

fn handle_abort(
    state: &mut DeviceState,
    plate_id: PlateId,
    reply: RpcReplyPort<Result<(), ActorError>>,
) {
    if !state.holds(&plate_id) {
        let _ = reply.send(Err(ActorError::refused(
            "plate is not in this device".to_string(),
        )));
        return;
    }
    match state.status {
        DeviceStatus::Processing => {
            if let Some(task) = state.process_task.take() {
                task.abort();
            }
            // Leaves the plate inside, ready for unload.
            state.processing_done = true;
            info!(device_id = %state.device_id, plate_id = %plate_id, "processing aborted");
            let _ = reply.send(Ok(()));
        }
        DeviceStatus::Error => {
            let _ = reply.send(Ok(()));
        }
        _ => {
            let _ = reply.send(Err(ActorError::refused(format!(
                "cannot abort while {}",
                state.status
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ask;

    async fn spawn_device(
        bus: Arc<EventBus>,
    ) -> Option<(ActorRef<DeviceMessage>, tokio::task::JoinHandle<()>)> {
        let args = DeviceArguments {
            device_id: "pipetter-1".into(),
            station_id: "STATION_1".into(),
            device_type: DeviceType::Pipetter,
            bus,
            config: OrchestratorConfig::for_tests(),
        };
        Actor::spawn(None, DeviceActorDef, args).await.ok()
    }

    async fn load(device: &ActorRef<DeviceMessage>, plate: &str) -> Result<(), ActorError> {
        ask(
            device,
            |reply| DeviceMessage::LoadPlate {
                plate_id: plate.to_string(),
                reply,
            },
            Duration::from_secs(5),
        )
        .await
        .and_then(|inner| inner)
    }

    #[tokio::test]
    async fn load_process_unload_emits_completion() {
        let bus = Arc::new(EventBus::new());
        let Some((device, handle)) = spawn_device(bus.clone()).await else {
            return;
        };
        let (_sid, mut events) = match bus.subscribe("device.*").await {
            Ok(sub) => sub,
            Err(_) => return,
        };

        assert_eq!(load(&device, "P1").await, Ok(()));

        let _ = device.send_message(DeviceMessage::StartProcess {
            plate_id: "P1".into(),
            duration: Some(Duration::from_millis(100)),
            parameters: json!({}),
        });

        // Wait for processing to complete on the bus.
        let mut completed = false;
        for _ in 0..10 {
            if let Ok(event) = events.recv().await {
                if event.event_type == "device.processing_completed" {
                    assert_eq!(event.payload_str("plate_id"), Some("P1"));
                    completed = true;
                    break;
                }
            }
        }
        assert!(completed);

        let result = ask(
            &device,
            |reply| DeviceMessage::UnloadPlate {
                plate_id: "P1".into(),
                reply,
            },
            Duration::from_secs(5),
        )
        .await
        .and_then(|inner| inner);
        assert_eq!(result, Ok(()));

        let snapshot = ask(
            &device,
            |reply| DeviceMessage::GetSnapshot { reply },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(snapshot.map(|s| s.status), Ok(DeviceStatus::Idle));

        device.stop(None);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn second_plate_is_rejected_while_held() {
        let bus = Arc::new(EventBus::new());
        let Some((device, handle)) = spawn_device(bus).await else {
            return;
        };

        assert_eq!(load(&device, "P1").await, Ok(()));
        assert!(matches!(
            load(&device, "P2").await,
            Err(ActorError::DeviceBusy { .. })
        ));
        // Idempotent for the holder.
        assert_eq!(load(&device, "P1").await, Ok(()));

        device.stop(None);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unload_is_refused_mid_processing() {
        let bus = Arc::new(EventBus::new());
        let Some((device, handle)) = spawn_device(bus).await else {
            return;
        };

        assert_eq!(load(&device, "P1").await, Ok(()));
        let _ = device.send_message(DeviceMessage::StartProcess {
            plate_id: "P1".into(),
            duration: Some(Duration::from_secs(30)),
            parameters: json!({}),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = ask(
            &device,
            |reply| DeviceMessage::UnloadPlate {
                plate_id: "P1".into(),
                reply,
            },
            Duration::from_secs(1),
        )
        .await
        .and_then(|inner| inner);
        assert!(matches!(result, Err(ActorError::Refused(_))));

        // Abort makes it unloadable.
        let aborted = ask(
            &device,
            |reply| DeviceMessage::Abort {
                plate_id: "P1".into(),
                reply,
            },
            Duration::from_secs(1),
        )
        .await
        .and_then(|inner| inner);
        assert_eq!(aborted, Ok(()));

        let result = ask(
            &device,
            |reply| DeviceMessage::UnloadPlate {
                plate_id: "P1".into(),
                reply,
            },
            Duration::from_secs(5),
        )
        .await
        .and_then(|inner| inner);
        assert_eq!(result, Ok(()));

        device.stop(None);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn event_driven_processing_waits_for_driver() {
        let bus = Arc::new(EventBus::new());
        let Some((device, handle)) = spawn_device(bus.clone()).await else {
            return;
        };
        let (_sid, mut events) = match bus.subscribe("device.processing_completed").await {
            Ok(sub) => sub,
            Err(_) => return,
        };

        assert_eq!(load(&device, "P1").await, Ok(()));
        let _ = device.send_message(DeviceMessage::StartProcess {
            plate_id: "P1".into(),
            duration: None,
            parameters: json!({}),
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_none(), "must wait for the driver");

        let _ = device.send_message(DeviceMessage::DriverCompleted { result: Ok(()) });
        let completed = events.recv().await.map(|e| e.event_type);
        assert_eq!(completed, Ok("device.processing_completed".to_string()));

        device.stop(None);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn driver_failure_marks_the_device_errored() {
        let bus = Arc::new(EventBus::new());
        let Some((device, handle)) = spawn_device(bus.clone()).await else {
            return;
        };
        let (_sid, mut events) = match bus.subscribe("device.error").await {
            Ok(sub) => sub,
            Err(_) => return,
        };

        assert_eq!(load(&device, "P1").await, Ok(()));
        let _ = device.send_message(DeviceMessage::StartProcess {
            plate_id: "P1".into(),
            duration: None,
            parameters: json!({}),
        });
        let _ = device.send_message(DeviceMessage::DriverCompleted {
            result: Err("aspiration jam".into()),
        });

        let error = events.recv().await;
        assert_eq!(
            error.as_ref().ok().and_then(|e| e.payload_str("error")),
            Some("aspiration jam")
        );

        let snapshot = ask(
            &device,
            |reply| DeviceMessage::GetSnapshot { reply },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(snapshot.map(|s| s.status), Ok(DeviceStatus::Error));

        device.stop(None);
        let _ = handle.await;
    }
}
