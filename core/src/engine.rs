//! Contract consumed from the native execution engine.
//!
//! The engine hosts the actual script contexts; this crate only drives it.
//! Byte transport is non-blocking and poll-driven: `read`/`write` return
//! immediately, and a previously armed interest (via [`NativeEngine::update`])
//! is reported later through the [`Poller`] handed to `init`.

use crate::channel::Poller;
use crate::error::NativeError;
use crate::worklet::{ExitNotifier, WorkletOptions};

/// Opaque reference to an engine-side worklet context.
///
/// Owned exclusively by the worklet that created it; never reused after
/// termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Operations the native engine must provide.
///
/// `read` returns `None` when no data is currently available; `write` accepts
/// as many bytes as it can (possibly zero) and never blocks. `update` arms a
/// one-shot poll notification for the requested directions; arming with both
/// flags false stops polling entirely.
pub trait NativeEngine: Send + Sync {
    /// Allocate an engine-side context. The engine must deliver poll
    /// notifications for this context through `poller` and report a context
    /// that exits on its own through `exit`. The exit report may be followed
    /// by a redundant [`NativeEngine::terminate`]; the engine must tolerate
    /// that.
    fn init(
        &self,
        options: &WorkletOptions,
        poller: Poller,
        exit: ExitNotifier,
    ) -> Result<RawHandle, NativeError>;

    /// Start executing a script loaded from `filename`.
    fn start_file(
        &self,
        handle: RawHandle,
        filename: &str,
        args: &[String],
    ) -> Result<(), NativeError>;

    /// Start executing textual source; `filename` is advisory.
    fn start_utf8(
        &self,
        handle: RawHandle,
        filename: &str,
        source: &str,
        args: &[String],
    ) -> Result<(), NativeError>;

    /// Start executing pre-compiled source. The engine may retain a reference
    /// into `source` for the duration of execution.
    fn start_bytes(
        &self,
        handle: RawHandle,
        filename: &str,
        source: &std::sync::Arc<[u8]>,
        args: &[String],
    ) -> Result<(), NativeError>;

    /// Arm (or disarm) the one-shot poll notification for this context.
    fn update(&self, handle: RawHandle, readable: bool, writable: bool);

    /// Non-blocking read of inbound bytes. `None` means "would block".
    fn read(&self, handle: RawHandle) -> Option<Vec<u8>>;

    /// Non-blocking write; returns the number of bytes accepted, which may be
    /// less than `buf.len()` (including zero).
    fn write(&self, handle: RawHandle, buf: &[u8]) -> usize;

    /// Freeze execution after `linger_ms`. Negative means the engine's
    /// default linger policy, zero means immediately.
    fn suspend(&self, handle: RawHandle, linger_ms: i32) -> Result<(), NativeError>;

    /// Unfreeze execution.
    fn resume(&self, handle: RawHandle) -> Result<(), NativeError>;

    /// Schedule a timed re-entry without changing suspension state.
    fn wakeup(&self, handle: RawHandle, deadline_ms: u64) -> Result<(), NativeError>;

    /// Tear down the context. Infallible: this is the guaranteed cleanup path.
    fn terminate(&self, handle: RawHandle);
}
