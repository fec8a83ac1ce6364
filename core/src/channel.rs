//! Duplex byte channel multiplexed over a worklet's native handle.
//!
//! The native transport is non-blocking and poll-driven: `read` may return
//! nothing, `write` may accept fewer bytes than offered, and progress is
//! reported through a one-shot poll notification that must be re-armed after
//! every delivery. This module bridges that primitive into ordinary async
//! reads and writes.
//!
//! At most one read and one write are outstanding at a time. The invariant is
//! type-level: [`ChannelReader`] and [`ChannelWriter`] take `&mut self`, and
//! each pending operation is a single [`oneshot`] slot resolved exactly once.
//! Slot transitions and interest re-arming are serialized by the shared-state
//! mutex, so a poll notification arriving concurrently with an in-flight
//! operation cannot observe a half-updated slot.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::sync::oneshot;

use crate::engine::{NativeEngine, RawHandle};
use crate::error::{ChannelError, NativeError};

/// State shared between the channel halves, the owning worklet, and the
/// engine's poll callback.
pub(crate) struct ChannelShared {
    engine: Arc<dyn NativeEngine>,
    /// Bound once the engine has allocated the context. The poll callback is
    /// handed out before `init` returns, so the handle cannot be a plain field.
    handle: OnceLock<RawHandle>,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    /// Set once the owning worklet reaches started.
    opened: bool,
    /// `Some` after teardown; holds the error delivered to late callers.
    closed: Option<ChannelError>,
    pending_open: Option<oneshot::Sender<Result<(), ChannelError>>>,
    pending_read: Option<oneshot::Sender<Result<Vec<u8>, ChannelError>>>,
    pending_write: Option<PendingWrite>,
}

/// The unwritten suffix of the current outbound buffer. Backlog is bounded by
/// one buffer's worth: the remainder shrinks and is never re-queued whole.
struct PendingWrite {
    remainder: Vec<u8>,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

enum ReadProgress {
    Data(Vec<u8>),
    Pending(oneshot::Receiver<Result<Vec<u8>, ChannelError>>),
}

enum WriteProgress {
    Done,
    Pending(oneshot::Receiver<Result<(), ChannelError>>),
}

impl ChannelShared {
    pub(crate) fn new(engine: Arc<dyn NativeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            handle: OnceLock::new(),
            state: Mutex::new(ChannelState::default()),
        })
    }

    /// Poll callback to hand to [`NativeEngine::init`].
    pub(crate) fn poller(shared: &Arc<Self>) -> Poller {
        Poller {
            shared: Arc::downgrade(shared),
        }
    }

    /// Associate the engine-side context once `init` has allocated it.
    pub(crate) fn bind(&self, handle: RawHandle) {
        let _ = self.handle.set(handle);
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        // A poisoned lock only means some thread panicked mid-section; the
        // slot state itself stays coherent, so recover the guard.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Re-arm poll interest to reflect current slot occupancy.
    fn arm(&self) {
        let (readable, writable) = {
            let st = self.lock_state();
            if st.closed.is_some() {
                return;
            }
            (st.pending_read.is_some(), st.pending_write.is_some())
        };
        if let Some(&handle) = self.handle.get() {
            self.engine.update(handle, readable, writable);
        }
    }

    /// Resolve the open phase. Called by the worklet exactly once per
    /// successful or failed start attempt.
    pub(crate) fn resolve_open(&self, result: Result<(), NativeError>) {
        match result {
            Ok(()) => {
                let waiter = {
                    let mut st = self.lock_state();
                    if st.closed.is_some() {
                        return;
                    }
                    st.opened = true;
                    st.pending_open.take()
                };
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(err) => {
                let waiter = { self.lock_state().pending_open.take() };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(ChannelError::Native(err)));
                    }
                    // Nobody is awaiting the open; the stream dies carrying
                    // the start failure instead.
                    None => self.close(ChannelError::Native(err)),
                }
            }
        }
    }

    /// Tear down the channel, failing every pending continuation with
    /// `reason`. Idempotent; the first reason wins.
    pub(crate) fn close(&self, reason: ChannelError) {
        let (open_tx, read_tx, write_pending) = {
            let mut st = self.lock_state();
            if st.closed.is_some() {
                return;
            }
            st.closed = Some(reason.clone());
            (
                st.pending_open.take(),
                st.pending_read.take(),
                st.pending_write.take(),
            )
        };
        if let Some(tx) = open_tx {
            let _ = tx.send(Err(reason.clone()));
        }
        if let Some(tx) = read_tx {
            let _ = tx.send(Err(reason.clone()));
        }
        if let Some(pending) = write_pending {
            let _ = pending.done.send(Err(reason));
        }
    }

    /// Entry point for the native poll notification.
    ///
    /// The native layer may call back after teardown has begun; the closed
    /// check makes that a no-op before any state is touched.
    fn poll(&self, readable: bool, writable: bool) {
        if self.lock_state().closed.is_some() {
            return;
        }
        if readable {
            self.continue_read();
        }
        if writable {
            self.continue_write();
        }
    }

    fn continue_read(&self) {
        let Some(tx) = self.lock_state().pending_read.take() else {
            return;
        };
        // Interest must reflect "no longer waiting" before the retry, which
        // may itself re-register.
        self.arm();
        let Some(&handle) = self.handle.get() else {
            return;
        };
        match self.engine.read(handle) {
            Some(data) => {
                let _ = tx.send(Ok(data));
            }
            None => {
                // Spurious wakeup or a stuck host: park again and wait for
                // the next notification rather than spinning.
                let mut st = self.lock_state();
                if let Some(reason) = st.closed.clone() {
                    drop(st);
                    let _ = tx.send(Err(reason));
                } else {
                    st.pending_read = Some(tx);
                    drop(st);
                    self.arm();
                }
            }
        }
    }

    fn continue_write(&self) {
        let Some(pending) = self.lock_state().pending_write.take() else {
            return;
        };
        let PendingWrite {
            mut remainder,
            done,
        } = pending;
        self.arm();
        let Some(&handle) = self.handle.get() else {
            return;
        };
        let written = self.engine.write(handle, &remainder);
        if written == remainder.len() {
            let _ = done.send(Ok(()));
        } else {
            remainder.drain(..written);
            let mut st = self.lock_state();
            if let Some(reason) = st.closed.clone() {
                drop(st);
                let _ = done.send(Err(reason));
            } else {
                st.pending_write = Some(PendingWrite { remainder, done });
                drop(st);
                self.arm();
            }
        }
    }

    fn begin_ready(&self) -> Result<Option<oneshot::Receiver<Result<(), ChannelError>>>, ChannelError> {
        let mut st = self.lock_state();
        if let Some(reason) = st.closed.clone() {
            return Err(reason);
        }
        if st.opened {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        st.pending_open = Some(tx);
        Ok(Some(rx))
    }

    fn begin_read(&self) -> Result<ReadProgress, ChannelError> {
        {
            let st = self.lock_state();
            if let Some(reason) = st.closed.clone() {
                return Err(reason);
            }
            if !st.opened {
                return Err(ChannelError::NotOpen);
            }
        }
        let Some(&handle) = self.handle.get() else {
            return Err(ChannelError::NotOpen);
        };
        if let Some(data) = self.engine.read(handle) {
            return Ok(ReadProgress::Data(data));
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.lock_state();
            if let Some(reason) = st.closed.clone() {
                return Err(reason);
            }
            // A cancelled read future may have left a stale sender behind;
            // its receiver is gone, so replacing it is harmless.
            st.pending_read = Some(tx);
        }
        self.arm();
        Ok(ReadProgress::Pending(rx))
    }

    fn begin_write(&self, data: &[u8]) -> Result<WriteProgress, ChannelError> {
        {
            let st = self.lock_state();
            if let Some(reason) = st.closed.clone() {
                return Err(reason);
            }
            if !st.opened {
                return Err(ChannelError::NotOpen);
            }
        }
        let Some(&handle) = self.handle.get() else {
            return Err(ChannelError::NotOpen);
        };
        let written = self.engine.write(handle, data);
        if written == data.len() {
            return Ok(WriteProgress::Done);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.lock_state();
            if let Some(reason) = st.closed.clone() {
                return Err(reason);
            }
            st.pending_write = Some(PendingWrite {
                remainder: data[written..].to_vec(),
                done: tx,
            });
        }
        self.arm();
        Ok(WriteProgress::Pending(rx))
    }
}

/// One-shot poll notification callback handed to the native engine.
///
/// Holds only a weak reference: once the worklet is gone, notifications fall
/// through silently.
#[derive(Clone)]
pub struct Poller {
    shared: Weak<ChannelShared>,
}

impl Poller {
    /// Report that a previously armed readable and/or writable condition has
    /// become true.
    pub fn notify(&self, readable: bool, writable: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.poll(readable, writable);
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").finish_non_exhaustive()
    }
}

/// Read half of a worklet's IPC channel.
pub struct ChannelReader {
    shared: Arc<ChannelShared>,
}

impl ChannelReader {
    /// Wait for the owning worklet to reach started.
    ///
    /// Resolves once per worklet: `Ok` after a successful start, the native
    /// failure if start failed while this call was waiting, `Closed` after
    /// termination.
    pub async fn ready(&mut self) -> Result<(), ChannelError> {
        match self.shared.begin_ready()? {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| ChannelError::Closed)?,
        }
    }

    /// Receive the next chunk of inbound bytes.
    ///
    /// Completes synchronously when the engine has data buffered; otherwise
    /// parks until a readable poll notification produces some.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        match self.shared.begin_read()? {
            ReadProgress::Data(data) => Ok(data),
            ReadProgress::Pending(rx) => rx.await.map_err(|_| ChannelError::Closed)?,
        }
    }
}

/// Write half of a worklet's IPC channel.
pub struct ChannelWriter {
    shared: Arc<ChannelShared>,
}

impl ChannelWriter {
    /// Write `data` in full.
    ///
    /// Short native writes park the unwritten suffix and complete across one
    /// or more writable poll notifications, preserving byte order.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        match self.shared.begin_write(data)? {
            WriteProgress::Done => Ok(()),
            WriteProgress::Pending(rx) => rx.await.map_err(|_| ChannelError::Closed)?,
        }
    }
}

/// Duplex byte stream for one worklet, created alongside it.
///
/// Split into halves with [`IpcChannel::split`] when reads and writes need to
/// progress independently.
pub struct IpcChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl IpcChannel {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> Self {
        Self {
            reader: ChannelReader {
                shared: shared.clone(),
            },
            writer: ChannelWriter { shared },
        }
    }

    /// See [`ChannelReader::ready`].
    pub async fn ready(&mut self) -> Result<(), ChannelError> {
        self.reader.ready().await
    }

    /// See [`ChannelReader::recv`].
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.reader.recv().await
    }

    /// See [`ChannelWriter::send`].
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(data).await
    }

    #[must_use]
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}
