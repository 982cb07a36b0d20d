//! Resource dispatchers.
//!
//! Pools hand interchangeable resources to requesting plates and
//! nothing more: they never track workflow state and never command a
//! plate. Waiters are served strictly FIFO; a request that cannot be
//! satisfied immediately parks the caller's reply port until a release
//! frees a resource.

pub mod device_pool;
pub mod mover_pool;
