//! Actors: movers, devices, and plates.
//!
//! Message-passing rules, matching the rest of the codebase:
//!
//! - Commands are fire-and-forget (`send_message`); queries and
//!   blocking resource requests carry an `RpcReplyPort`
//! - Business errors travel in replies, never as actor crashes
//! - Long waits run in short-lived helper tasks that post the typed
//!   outcome back into the owning actor's mailbox, so control messages
//!   stay deliverable at every boundary

pub mod device;
pub mod errors;
pub mod mover;
pub mod plate;

pub use errors::ActorError;
