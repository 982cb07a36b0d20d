//! Event propagation for Planar.
//!
//! Actors emit [`Event`]s; observers subscribe with dotted glob patterns
//! (`plate.*`, `mover.transport_*`, `**`). Key pieces:
//!
//! - **Event**: dotted type name, source actor, JSON payload, timestamp
//! - **Pattern**: compiled matcher, `*` = one segment, `**` = any suffix
//! - **EventBus**: ordered best-effort fan-out with a bounded history
//!   ring for late subscribers
//!
//! # Example
//!
//! ```
//! use planar_events::{Event, EventBus};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new();
//! let (_id, mut sub) = bus.subscribe("plate.*").await.unwrap();
//!
//! bus.publish(Event::new("plate.created", "plate-1", json!({ "plate_id": "P1" })))
//!     .await;
//!
//! let event = sub.recv().await.unwrap();
//! assert_eq!(event.event_type, "plate.created");
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod pattern;

pub use bus::{EventBus, EventBusBuilder, EventSubscription, SubscriptionId};
pub use error::{Error, Result};
pub use event::{Event, EventId};
pub use pattern::Pattern;
