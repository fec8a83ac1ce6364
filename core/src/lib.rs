//! Worklet lifecycle control and duplex IPC over a native execution engine.
//!
//! A worklet is a short-lived, isolated script-execution context hosted by an
//! external engine. This crate owns the lifecycle state machine
//! (start/suspend/resume/terminate), bridges the engine's poll-driven byte
//! transport into an async duplex channel, and keeps a registry of live
//! worklets for broadcast lifecycle operations.

pub mod channel;
pub mod engine;
pub mod error;
pub mod registry;
pub mod worklet;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use channel::{ChannelReader, ChannelWriter, IpcChannel, Poller};
pub use engine::{NativeEngine, RawHandle};
pub use error::{ChannelError, NativeError, WorkletError};
pub use registry::WorkletRegistry;
pub use worklet::{ExitNotifier, Source, Worklet, WorkletEvent, WorkletId, WorkletOptions};
