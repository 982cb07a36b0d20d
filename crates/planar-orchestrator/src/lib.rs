//! Actor-based scheduling substrate for Planar.
//!
//! The orchestrator coordinates many plates and movers over a shared
//! deck using message-passing actors (ractor on tokio):
//!
//! - **Plate actors** own a workflow and drive themselves through it
//! - **Mover actors** execute planned transports against the driver
//! - **Device actors** run the load/process/unload protocol
//! - **Pools** dispatch movers and devices FIFO to requesting plates
//! - **The station manager** gates station capacity with FIFO queues
//! - **The [`Orchestrator`] facade** wires everything and exposes the
//!   surface the HTTP/WS layer consumes
//!
//! No actor reads another's state directly; resource handover is an
//! explicit protocol and every state change lands on the event bus.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod actors;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod pools;
pub mod retry;
pub mod runtime;
pub mod stations;
pub mod supervisor;

/// Identifier of a plate moving through the system.
pub type PlateId = String;

/// Numeric identifier of a physical mover.
pub type MoverId = u32;

pub use actors::device::{DeviceActorDef, DeviceArguments, DeviceMessage, DeviceSnapshot, DeviceStatus};
pub use actors::errors::ActorError;
pub use actors::mover::{MoverActorDef, MoverArguments, MoverMessage, MoverSnapshot, MoverStatus};
pub use actors::plate::{
    HistoryEntry, PlateActorDef, PlateArguments, PlateControl, PlateDeps, PlateError,
    PlateLocation, PlateMessage, PlatePhase, PlateSnapshot,
};
pub use config::OrchestratorConfig;
pub use coordinator::{MoverDefinition, Orchestrator, PlateRef};
pub use driver::{DriverError, MoverPhysical, SimDriver, TransportDriver};
pub use pools::device_pool::{
    DeviceGrant, DevicePoolActorDef, DevicePoolArguments, DevicePoolMessage, DevicePoolSnapshot,
};
pub use pools::mover_pool::{
    MoverGrant, MoverPoolActorDef, MoverPoolArguments, MoverPoolMessage, MoverPoolSnapshot,
};
pub use retry::RetryPolicy;
pub use stations::{
    AccessDecision, StationManagerDef, StationManagerArguments, StationMessage, StationSnapshot,
};
pub use supervisor::{SupervisorArguments, SupervisorMessage, SystemSupervisorDef};
