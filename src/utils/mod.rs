//! Utility modules shared across the crate

pub mod net;
pub mod task;
pub mod throttle;

pub use net::{bind_tcp_listener, resolve_bind_addr};
pub use task::catch_fault;
pub use throttle::LogThrottler;
