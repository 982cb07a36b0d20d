//! The orchestrator facade: boot wiring and the external surface.
//!
//! Owns the bus, the planner, the dispatchers, and the per-plate actor
//! index. This is the API the HTTP/WS layer consumes; nothing here adds
//! scheduling logic of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorRef};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use planar_core::{DeckConfig, LocationMap, Position, TrackMap, Workflow};
use planar_events::{Event, EventBus, EventBusBuilder, EventSubscription, SubscriptionId};
use planar_routing::PathPlanner;

use crate::actors::device::{DeviceActorDef, DeviceArguments, DeviceMessage, DeviceSnapshot};
use crate::actors::errors::ActorError;
use crate::actors::mover::{MoverActorDef, MoverArguments, MoverMessage, MoverSnapshot};
use crate::actors::plate::{
    PlateActorDef, PlateArguments, PlateControl, PlateDeps, PlateMessage, PlateSnapshot,
};
use crate::config::OrchestratorConfig;
use crate::driver::TransportDriver;
use crate::pools::device_pool::{DevicePoolActorDef, DevicePoolArguments, DevicePoolMessage};
use crate::pools::mover_pool::{MoverPoolActorDef, MoverPoolArguments, MoverPoolMessage};
use crate::runtime::{ask, ask_flat};
use crate::stations::{StationManagerArguments, StationManagerDef, StationMessage};
use crate::supervisor::{SupervisorArguments, SupervisorMessage, SystemSupervisorDef};
use crate::{MoverId, PlateId};

/// Handle for commanding a running plate actor.
pub type PlateRef = ActorRef<PlateMessage>;

/// One physical mover to bring up at boot.
#[derive(Debug, Clone, PartialEq)]
pub struct MoverDefinition {
    pub mover_id: MoverId,
    pub initial_position: Position,
}

struct PlateEntry {
    actor: PlateRef,
    join: JoinHandle<()>,
}

/// Single-process coordinator for the whole scheduling substrate.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    deck: Arc<DeckConfig>,
    locations: Arc<LocationMap>,
    supervisor: ActorRef<SupervisorMessage>,
    mover_pool: ActorRef<MoverPoolMessage>,
    device_pool: ActorRef<DevicePoolMessage>,
    stations: ActorRef<StationMessage>,
    movers: HashMap<MoverId, ActorRef<MoverMessage>>,
    devices: HashMap<String, ActorRef<DeviceMessage>>,
    plates: RwLock<HashMap<PlateId, PlateEntry>>,
    service_joins: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Boot the core: validate the layout, build the planner and bus,
    /// spawn dispatchers, one mover actor per physical mover, and one
    /// device actor per configured station.
    pub async fn start(
        config: OrchestratorConfig,
        deck: DeckConfig,
        tracks: TrackMap,
        locations: LocationMap,
        movers: Vec<MoverDefinition>,
        driver: Arc<dyn TransportDriver>,
    ) -> Result<Self, ActorError> {
        deck.validate_tracks(&tracks)
            .map_err(|e| ActorError::InvalidConfiguration(e.to_string()))?;

        let bus = Arc::new(
            EventBusBuilder::new()
                .with_history_capacity(config.event_history)
                .with_channel_capacity(config.event_channel_capacity)
                .build(),
        );
        let planner = Arc::new(PathPlanner::new(
            deck.clone(),
            tracks,
            config.planner.clone(),
        ));
        let deck = Arc::new(deck);
        let locations = Arc::new(locations);
        let mut service_joins = Vec::new();

        let (supervisor, join) = Actor::spawn(
            None,
            SystemSupervisorDef,
            SupervisorArguments { bus: bus.clone() },
        )
        .await
        .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
        service_joins.push(join);

        let (stations, join) = Actor::spawn_linked(
            None,
            StationManagerDef,
            StationManagerArguments {
                stations: deck.stations.clone(),
                bus: bus.clone(),
            },
            supervisor.get_cell(),
        )
        .await
        .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
        service_joins.push(join);

        let (mover_pool, join) = Actor::spawn_linked(
            None,
            MoverPoolActorDef,
            MoverPoolArguments {
                planner: planner.clone(),
                bus: bus.clone(),
            },
            supervisor.get_cell(),
        )
        .await
        .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
        service_joins.push(join);

        let (device_pool, join) = Actor::spawn_linked(
            None,
            DevicePoolActorDef,
            DevicePoolArguments { bus: bus.clone() },
            supervisor.get_cell(),
        )
        .await
        .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
        service_joins.push(join);

        let mut mover_refs = HashMap::new();
        for definition in movers {
            let (mover, join) = Actor::spawn_linked(
                None,
                MoverActorDef,
                MoverArguments {
                    mover_id: definition.mover_id,
                    initial_position: definition.initial_position,
                    driver: driver.clone(),
                    planner: planner.clone(),
                    bus: bus.clone(),
                    config: config.clone(),
                },
                supervisor.get_cell(),
            )
            .await
            .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
            service_joins.push(join);

            let _ = mover_pool.send_message(MoverPoolMessage::Register {
                mover_id: definition.mover_id,
                mover: mover.clone(),
                position: definition.initial_position,
            });
            mover_refs.insert(definition.mover_id, mover);
        }

        let mut device_refs = HashMap::new();
        for station in &deck.stations {
            let (device, join) = Actor::spawn_linked(
                None,
                DeviceActorDef,
                DeviceArguments {
                    device_id: station.device_id.clone(),
                    station_id: station.station_id.clone(),
                    device_type: station.device_type,
                    bus: bus.clone(),
                    config: config.clone(),
                },
                supervisor.get_cell(),
            )
            .await
            .map_err(|e| ActorError::spawn_failed(e.to_string()))?;
            service_joins.push(join);

            let _ = device_pool.send_message(DevicePoolMessage::Register {
                device_id: station.device_id.clone(),
                device: device.clone(),
            });
            device_refs.insert(station.device_id.clone(), device);
        }

        info!(
            deck = %deck.name,
            movers = mover_refs.len(),
            devices = device_refs.len(),
            "orchestrator started"
        );

        Ok(Self {
            config,
            bus,
            deck,
            locations,
            supervisor,
            mover_pool,
            device_pool,
            stations,
            movers: mover_refs,
            devices: device_refs,
            plates: RwLock::new(HashMap::new()),
            service_joins,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn deck(&self) -> &Arc<DeckConfig> {
        &self.deck
    }

    pub fn locations(&self) -> &Arc<LocationMap> {
        &self.locations
    }

    /// Admit a plate: spawn its actor and hand it the workflow.
    pub async fn spawn_plate(
        &self,
        plate_id: impl Into<PlateId>,
        workflow: Workflow,
        sample_ids: Vec<String>,
        barcode: Option<String>,
    ) -> Result<PlateRef, ActorError> {
        let plate_id = plate_id.into();
        {
            let plates = self.plates.read().await;
            if plates.contains_key(&plate_id) {
                return Err(ActorError::WorkflowRejected(format!(
                    "plate {plate_id} is already admitted"
                )));
            }
        }

        let deps = PlateDeps {
            mover_pool: self.mover_pool.clone(),
            device_pool: self.device_pool.clone(),
            stations: self.stations.clone(),
            bus: self.bus.clone(),
            deck: self.deck.clone(),
        };
        let (actor, join) = Actor::spawn_linked(
            None,
            PlateActorDef,
            PlateArguments {
                plate_id: plate_id.clone(),
                deps,
                config: self.config.clone(),
            },
            self.supervisor.get_cell(),
        )
        .await
        .map_err(|e| ActorError::spawn_failed(e.to_string()))?;

        let assigned = ask_flat(
            &actor,
            |reply| PlateMessage::AssignWorkflow {
                workflow,
                sample_ids,
                barcode,
                reply,
            },
            self.config.ask_timeout,
        )
        .await;
        if let Err(e) = assigned {
            warn!(plate_id = %plate_id, error = %e, "workflow assignment failed, discarding plate actor");
            actor.stop(None);
            return Err(e);
        }

        let mut plates = self.plates.write().await;
        plates.insert(
            plate_id,
            PlateEntry {
                actor: actor.clone(),
                join,
            },
        );
        Ok(actor)
    }

    /// Current state of one plate.
    pub async fn get_plate_state(&self, plate_id: &str) -> Result<PlateSnapshot, ActorError> {
        let actor = {
            let plates = self.plates.read().await;
            plates
                .get(plate_id)
                .map(|entry| entry.actor.clone())
                .ok_or_else(|| ActorError::plate_not_found(plate_id))?
        };
        ask(
            &actor,
            |reply| PlateMessage::GetSnapshot { reply },
            self.config.ask_timeout,
        )
        .await
    }

    /// States of all admitted plates.
    pub async fn list_plates(&self) -> Vec<PlateSnapshot> {
        let actors: Vec<_> = {
            let plates = self.plates.read().await;
            plates.values().map(|entry| entry.actor.clone()).collect()
        };
        let mut snapshots = Vec::with_capacity(actors.len());
        for actor in actors {
            if let Ok(snapshot) = ask(
                &actor,
                |reply| PlateMessage::GetSnapshot { reply },
                self.config.ask_timeout,
            )
            .await
            {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.plate_id.cmp(&b.plate_id));
        snapshots
    }

    /// States of all movers.
    pub async fn list_movers(&self) -> Vec<MoverSnapshot> {
        let mut snapshots = Vec::with_capacity(self.movers.len());
        for actor in self.movers.values() {
            if let Ok(snapshot) = ask(
                actor,
                |reply| MoverMessage::GetSnapshot { reply },
                self.config.ask_timeout,
            )
            .await
            {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.mover_id);
        snapshots
    }

    /// State of one device.
    pub async fn get_device_state(&self, device_id: &str) -> Result<DeviceSnapshot, ActorError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| ActorError::device_not_found(device_id))?;
        ask(
            device,
            |reply| DeviceMessage::GetSnapshot { reply },
            self.config.ask_timeout,
        )
        .await
    }

    /// Operator control of a plate.
    pub async fn control_plate(
        &self,
        plate_id: &str,
        control: PlateControl,
    ) -> Result<(), ActorError> {
        let actor = {
            let plates = self.plates.read().await;
            plates
                .get(plate_id)
                .map(|entry| entry.actor.clone())
                .ok_or_else(|| ActorError::plate_not_found(plate_id))?
        };
        let message = match control {
            PlateControl::Pause { reason } => PlateMessage::Pause { reason },
            PlateControl::Resume => PlateMessage::Resume,
            PlateControl::Abort { reason } => PlateMessage::Abort { reason },
            PlateControl::RetryStep => PlateMessage::RetryStep,
            PlateControl::SkipStep { reason } => PlateMessage::SkipStep { reason },
        };
        actor
            .send_message(message)
            .map_err(|e| ActorError::channel(e.to_string()))
    }

    /// Driver callback entry point for event-driven devices.
    pub fn notify_device_completion(
        &self,
        device_id: &str,
        result: Result<(), String>,
    ) -> Result<(), ActorError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| ActorError::device_not_found(device_id))?;
        device
            .send_message(DeviceMessage::DriverCompleted { result })
            .map_err(|e| ActorError::channel(e.to_string()))
    }

    /// Subscribe to bus events.
    pub async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<(SubscriptionId, EventSubscription), ActorError> {
        self.bus
            .subscribe(pattern)
            .await
            .map_err(|e| ActorError::InvalidConfiguration(e.to_string()))
    }

    /// Recent bus events for late observers.
    pub async fn recent_events(
        &self,
        pattern: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>, ActorError> {
        self.bus
            .recent(pattern, limit)
            .await
            .map_err(|e| ActorError::InvalidConfiguration(e.to_string()))
    }

    /// Drop plate actors that reached a terminal phase, after the
    /// observers' grace window has passed. Returns the removed ids.
    pub async fn prune_finished(&self) -> Vec<PlateId> {
        let snapshot_targets: Vec<(PlateId, PlateRef)> = {
            let plates = self.plates.read().await;
            plates
                .iter()
                .map(|(id, entry)| (id.clone(), entry.actor.clone()))
                .collect()
        };

        let mut finished = Vec::new();
        for (plate_id, actor) in snapshot_targets {
            let snapshot = ask(
                &actor,
                |reply| PlateMessage::GetSnapshot { reply },
                self.config.ask_timeout,
            )
            .await;
            if snapshot.map(|s| s.phase.is_terminal()).unwrap_or(true) {
                finished.push(plate_id);
            }
        }

        let mut plates = self.plates.write().await;
        for plate_id in &finished {
            if let Some(entry) = plates.remove(plate_id) {
                entry.actor.stop(None);
                let _ = entry.join;
            }
        }
        finished
    }

    /// Orderly teardown: plates first, then dispatchers, then hardware
    /// actors.
    pub async fn shutdown(self) {
        info!("orchestrator shutting down");
        let mut plates = self.plates.write().await;
        for (_, entry) in plates.drain() {
            entry.actor.stop(None);
            let _ = tokio::time::timeout(Duration::from_secs(5), entry.join).await;
        }
        drop(plates);

        self.mover_pool.stop(None);
        self.device_pool.stop(None);
        self.stations.stop(None);
        for device in self.devices.values() {
            device.stop(None);
        }
        for mover in self.movers.values() {
            mover.stop(None);
        }
        self.supervisor.stop(None);
        for join in self.service_joins {
            let _ = tokio::time::timeout(Duration::from_secs(5), join).await;
        }
        info!("orchestrator shutdown complete");
    }
}
