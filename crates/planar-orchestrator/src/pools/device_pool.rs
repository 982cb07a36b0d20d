//! DevicePool: dispatches devices to requesting plates.
//!
//! Same FIFO reply-port semantics as the mover pool, partitioned per
//! device: every device has capacity one and its own waiter queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use planar_core::DeviceId;
use planar_events::EventBus;

use crate::actors::device::DeviceMessage;
use crate::actors::errors::ActorError;
use crate::PlateId;

/// A granted device: id plus the ref to command it.
#[derive(Clone)]
pub struct DeviceGrant {
    pub device_id: DeviceId,
    pub device: ActorRef<DeviceMessage>,
}

/// Messages handled by the device pool.
pub enum DevicePoolMessage {
    /// Add a device to the pool (boot time).
    Register {
        device_id: DeviceId,
        device: ActorRef<DeviceMessage>,
    },
    /// Request a specific device; parks the reply while it is busy.
    Request {
        plate_id: PlateId,
        device_id: DeviceId,
        reply: RpcReplyPort<Result<DeviceGrant, ActorError>>,
    },
    /// Return a device to the pool.
    Release {
        device_id: DeviceId,
        plate_id: PlateId,
    },
    /// Drop a parked request (abort path).
    CancelRequest {
        plate_id: PlateId,
        device_id: DeviceId,
    },
    /// Snapshot query.
    GetSnapshot {
        reply: RpcReplyPort<DevicePoolSnapshot>,
    },
}

/// Observer view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePoolSnapshot {
    pub total: usize,
    pub holders: Vec<(DeviceId, PlateId)>,
    pub waiting: Vec<(DeviceId, Vec<PlateId>)>,
}

/// Boot arguments for the pool.
pub struct DevicePoolArguments {
    pub bus: Arc<EventBus>,
}

struct DeviceWaiter {
    plate_id: PlateId,
    reply: RpcReplyPort<Result<DeviceGrant, ActorError>>,
}

struct DeviceEntry {
    device: ActorRef<DeviceMessage>,
    holder: Option<PlateId>,
    waiters: VecDeque<DeviceWaiter>,
}

pub struct DevicePoolState {
    devices: BTreeMap<DeviceId, DeviceEntry>,
    // The bus is kept for parity with the other dispatchers even though
    // device grants are only observable through plate events today.
    _bus: Arc<EventBus>,
}

impl DevicePoolState {
    fn snapshot(&self) -> DevicePoolSnapshot {
        DevicePoolSnapshot {
            total: self.devices.len(),
            holders: self
                .devices
                .iter()
                .filter_map(|(id, e)| e.holder.clone().map(|p| (id.clone(), p)))
                .collect(),
            waiting: self
                .devices
                .iter()
                .filter(|(_, e)| !e.waiters.is_empty())
                .map(|(id, e)| {
                    (
                        id.clone(),
                        e.waiters.iter().map(|w| w.plate_id.clone()).collect(),
                    )
                })
                .collect(),
        }
    }
}

fn grant(device_id: &str, entry: &DeviceEntry) -> DeviceGrant {
    DeviceGrant {
        device_id: device_id.to_string(),
        device: entry.device.clone(),
    }
}

/// Serve the head waiter of one device's queue, skipping dead callers.
fn serve_next(device_id: &str, entry: &mut DeviceEntry) {
    while entry.holder.is_none() {
        let Some(waiter) = entry.waiters.pop_front() else {
            return;
        };
        if waiter.reply.is_closed() {
            debug!(device_id, plate_id = %waiter.plate_id, "dropping dead device waiter");
            continue;
        }
        entry.holder = Some(waiter.plate_id.clone());
        let granted = grant(device_id, entry);
        if waiter.reply.send(Ok(granted)).is_err() {
            entry.holder = None;
            continue;
        }
        info!(device_id, plate_id = %waiter.plate_id, "device granted to waiter");
    }
}

#[derive(Default)]
pub struct DevicePoolActorDef;

impl Actor for DevicePoolActorDef {
    type Msg = DevicePoolMessage;
    type State = DevicePoolState;
    type Arguments = DevicePoolArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: DevicePoolArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(DevicePoolState {
            devices: BTreeMap::new(),
            _bus: args.bus,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DevicePoolMessage::Register { device_id, device } => {
                debug!(device_id = %device_id, "device registered with pool");
                state.devices.insert(
                    device_id,
                    DeviceEntry {
                        device,
                        holder: None,
                        waiters: VecDeque::new(),
                    },
                );
            }
            DevicePoolMessage::Request {
                plate_id,
                device_id,
                reply,
            } => {
                let Some(entry) = state.devices.get_mut(&device_id) else {
                    let _ = reply.send(Err(ActorError::device_not_found(device_id)));
                    return Ok(());
                };

                match &entry.holder {
                    // Idempotent for the current holder.
                    Some(holder) if holder == &plate_id => {
                        let _ = reply.send(Ok(grant(&device_id, entry)));
                    }
                    Some(_) => {
                        info!(
                            device_id = %device_id,
                            plate_id = %plate_id,
                            queue_len = entry.waiters.len() + 1,
                            "device busy, queueing request"
                        );
                        entry.waiters.push_back(DeviceWaiter { plate_id, reply });
                    }
                    None => {
                        entry.holder = Some(plate_id.clone());
                        info!(device_id = %device_id, plate_id = %plate_id, "device granted");
                        if reply.send(Ok(grant(&device_id, entry))).is_err() {
                            entry.holder = None;
                            serve_next(&device_id, entry);
                        }
                    }
                }
            }
            DevicePoolMessage::Release {
                device_id,
                plate_id,
            } => {
                let Some(entry) = state.devices.get_mut(&device_id) else {
                    warn!(device_id = %device_id, "release for unknown device");
                    return Ok(());
                };
                if entry.holder.as_deref() != Some(plate_id.as_str()) {
                    warn!(
                        device_id = %device_id,
                        plate_id = %plate_id,
                        holder = ?entry.holder,
                        "release from a plate that does not hold the device"
                    );
                    return Ok(());
                }
                entry.holder = None;
                info!(device_id = %device_id, plate_id = %plate_id, "device released");
                serve_next(&device_id, entry);
            }
            DevicePoolMessage::CancelRequest {
                plate_id,
                device_id,
            } => {
                if let Some(entry) = state.devices.get_mut(&device_id) {
                    entry.waiters.retain(|w| w.plate_id != plate_id);
                }
            }
            DevicePoolMessage::GetSnapshot { reply } => {
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
        for entry in state.devices.values_mut() {
            for waiter in entry.waiters.drain(..) {
                let _ = waiter
                    .reply
                    .send(Err(ActorError::refused("device pool stopped")));
            }
        }
        Ok(())
    }
}
