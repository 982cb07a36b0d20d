//! Shared rig for end-to-end scenario tests.
//!
//! The standard layout is the one from the scheduling scenarios: a 2x2
//! deck with a pipetter station at tile (0,0) and a reader station at
//! tile (1,0), joined by a single 240 mm track between the two docks.
//! Queue spots share the dock tile so parking needs no extra tracks.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use planar_core::{
    DeckConfig, DeviceType, GridPosition, LocationMap, Position, Station, Track, TrackMap,
    Workflow, WorkflowStep,
};
use planar_events::{Event, EventSubscription};
use planar_orchestrator::{
    MoverDefinition, MoverId, Orchestrator, OrchestratorConfig, PlatePhase, SimDriver,
    TransportDriver,
};

pub struct Rig {
    pub orchestrator: Orchestrator,
    pub driver: Arc<SimDriver>,
}

pub fn two_station_deck() -> DeckConfig {
    DeckConfig::new("Scenario Deck", 2, 2)
        .with_station(
            Station::new(
                "STATION_A",
                "Pipetter",
                GridPosition::new(0, 0),
                DeviceType::Pipetter,
                "pipetter-1",
            )
            .with_queue(GridPosition::new(0, 0)),
        )
        .with_station(
            Station::new(
                "STATION_B",
                "Reader",
                GridPosition::new(1, 0),
                DeviceType::Reader,
                "reader-1",
            )
            .with_queue(GridPosition::new(1, 0)),
        )
}

pub fn single_track() -> TrackMap {
    TrackMap::from_tracks(vec![Track::new(1, "main", 120.0, 120.0, 360.0, 120.0)])
        .expect("track layout is valid")
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// Route actor logs through the test harness (`RUST_LOG` controls the
/// filter).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn rig(movers: &[(MoverId, Position)], config: OrchestratorConfig) -> Rig {
    init_tracing();
    let driver = SimDriver::new(config.time_scale);
    for (mover_id, position) in movers {
        driver.place(*mover_id, *position).await;
    }
    let definitions = movers
        .iter()
        .map(|(mover_id, position)| MoverDefinition {
            mover_id: *mover_id,
            initial_position: *position,
        })
        .collect();

    let dyn_driver: Arc<dyn TransportDriver> = driver.clone();
    let orchestrator = Orchestrator::start(
        config,
        two_station_deck(),
        single_track(),
        LocationMap::new(),
        definitions,
        dyn_driver,
    )
    .await
    .expect("orchestrator boots");

    Rig {
        orchestrator,
        driver,
    }
}

pub fn step_at(
    step_id: &str,
    station_id: &str,
    device_id: &str,
    device_type: DeviceType,
    duration: Duration,
) -> WorkflowStep {
    WorkflowStep::new(step_id, step_id, station_id, device_id, device_type)
        .with_duration(duration)
}

pub fn pipetter_step(duration: Duration) -> WorkflowStep {
    step_at("pipette", "STATION_A", "pipetter-1", DeviceType::Pipetter, duration)
}

pub fn reader_step(duration: Duration) -> WorkflowStep {
    step_at("read", "STATION_B", "reader-1", DeviceType::Reader, duration)
}

pub fn two_step_workflow() -> Workflow {
    Workflow::new(
        "wf-two-steps",
        vec![
            pipetter_step(Duration::from_secs(1)),
            reader_step(Duration::from_secs(1)),
        ],
    )
    .expect("workflow is valid")
}

pub fn single_step_workflow(step: WorkflowStep) -> Workflow {
    Workflow::new("wf-single-step", vec![step]).expect("workflow is valid")
}

/// Poll a plate until it reaches `phase`. Fails fast when the plate
/// lands in an unexpected dead end.
pub async fn wait_for_phase(
    orchestrator: &Orchestrator,
    plate_id: &str,
    phase: PlatePhase,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(snapshot) = orchestrator.get_plate_state(plate_id).await {
            if snapshot.phase == phase {
                return true;
            }
            let stuck = matches!(
                snapshot.phase,
                PlatePhase::Error | PlatePhase::Aborted | PlatePhase::Completed
            );
            if stuck && snapshot.phase != phase {
                return false;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain everything currently buffered on a subscription.
pub fn drain(subscription: &mut EventSubscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

/// Index of the first event of a type (optionally per plate).
pub fn index_of(events: &[Event], event_type: &str, plate_id: Option<&str>) -> Option<usize> {
    events.iter().position(|e| {
        e.event_type == event_type
            && plate_id.is_none_or(|p| e.payload_str("plate_id") == Some(p))
    })
}

/// All `plate_id` payloads of events with the given type, in order.
pub fn plate_sequence(events: &[Event], event_type: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .filter_map(|e| e.payload_str("plate_id").map(str::to_string))
        .collect()
}
