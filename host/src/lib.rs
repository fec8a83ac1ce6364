//! Host-side lifecycle orchestration for worklets.
//!
//! Maps the embedding application's activity state onto registry-wide
//! suspend/resume broadcasts, with a debounce window for the transient
//! `inactive` state.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{DEFAULT_LINGER_MS, INACTIVE_DEBOUNCE, LifecycleWatcher};
pub use state::HostState;
