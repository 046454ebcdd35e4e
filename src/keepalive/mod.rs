//! Keeps stored portal sessions alive with jittered periodic pings.

mod registry;
mod scheduler;

pub use registry::{jitter, KeepAliveEntry, KeepAliveRegistry};
pub use scheduler::{bootstrap_candidates, KeepAliveScheduler, RescanReport};
