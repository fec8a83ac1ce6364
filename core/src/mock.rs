//! In-memory [`NativeEngine`] for tests.
//!
//! Models the observable quirks of the real transport: would-block reads,
//! capacity-limited short writes, one-shot interest arming, and injectable
//! per-operation failures. Poll notifications fire synchronously from the
//! test-control methods, with the engine's own lock released first so the
//! channel may re-enter `read`/`write`/`update`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Poller;
use crate::engine::{NativeEngine, RawHandle};
use crate::error::NativeError;
use crate::worklet::{ExitNotifier, Source, WorkletOptions};

/// Arguments recorded from a `start_*` dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub filename: String,
    pub source: Source,
    pub args: Vec<String>,
}

struct Context {
    poller: Poller,
    exit: ExitNotifier,
    options: WorkletOptions,
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
    /// Bytes the transport will accept before reporting backpressure.
    capacity: usize,
    read_interest: bool,
    write_interest: bool,
    start_call: Option<StartCall>,
    suspend_calls: Vec<i32>,
    resume_count: usize,
    wakeup_calls: Vec<u64>,
    terminated: bool,
    fail_start: Option<NativeError>,
    fail_suspend: Option<NativeError>,
    fail_resume: Option<NativeError>,
    fail_wakeup: Option<NativeError>,
}

impl Context {
    fn new(poller: Poller, exit: ExitNotifier, options: WorkletOptions) -> Self {
        Self {
            poller,
            exit,
            options,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            capacity: usize::MAX,
            read_interest: false,
            write_interest: false,
            start_call: None,
            suspend_calls: Vec::new(),
            resume_count: 0,
            wakeup_calls: Vec::new(),
            terminated: false,
            fail_start: None,
            fail_suspend: None,
            fail_resume: None,
            fail_wakeup: None,
        }
    }
}

/// Scriptable stand-in for the native engine.
#[derive(Default)]
pub struct MockEngine {
    inner: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    next_handle: u64,
    contexts: HashMap<u64, Context>,
}

impl MockEngine {
    /// Handle of the `n`-th allocated context (1-based allocation order).
    #[must_use]
    pub fn handle_of(&self, n: u64) -> RawHandle {
        let state = self.lock();
        assert!(
            state.contexts.contains_key(&n),
            "no context allocated for handle {n}"
        );
        RawHandle(n)
    }

    /// Queue inbound bytes; fires a readable notification if armed.
    pub fn push_inbound(&self, handle: RawHandle, data: &[u8]) {
        let fire = {
            let mut state = self.lock();
            let ctx = state.context(handle);
            ctx.inbound.push_back(data.to_vec());
            ctx.read_interest.then(|| ctx.poller.clone())
        };
        if let Some(poller) = fire {
            poller.notify(true, false);
        }
    }

    /// Replace the remaining write capacity without notifying.
    pub fn set_capacity(&self, handle: RawHandle, capacity: usize) {
        self.lock().context(handle).capacity = capacity;
    }

    /// Add write capacity; fires a writable notification if armed.
    pub fn grant_capacity(&self, handle: RawHandle, extra: usize) {
        let fire = {
            let mut state = self.lock();
            let ctx = state.context(handle);
            ctx.capacity = ctx.capacity.saturating_add(extra);
            (ctx.write_interest && ctx.capacity > 0).then(|| ctx.poller.clone())
        };
        if let Some(poller) = fire {
            poller.notify(false, true);
        }
    }

    /// Deliver a poll notification regardless of interest or conditions.
    pub fn notify(&self, handle: RawHandle, readable: bool, writable: bool) {
        let poller = { self.lock().context(handle).poller.clone() };
        poller.notify(readable, writable);
    }

    /// Report a native-side exit for the context, as a crashed or completed
    /// script would. Delivered with the engine lock released.
    pub fn report_exit(&self, handle: RawHandle) {
        let exit = { self.lock().context(handle).exit.clone() };
        exit.notify();
    }

    /// Drain and return everything written so far.
    pub fn take_outbound(&self, handle: RawHandle) -> Vec<u8> {
        std::mem::take(&mut self.lock().context(handle).outbound)
    }

    /// Currently armed poll interest as `(readable, writable)`.
    #[must_use]
    pub fn interest(&self, handle: RawHandle) -> (bool, bool) {
        let mut state = self.lock();
        let ctx = state.context(handle);
        (ctx.read_interest, ctx.write_interest)
    }

    pub fn fail_next_start(&self, handle: RawHandle, message: &str) {
        self.lock().context(handle).fail_start = Some(NativeError::new(message));
    }

    pub fn fail_next_suspend(&self, handle: RawHandle, message: &str) {
        self.lock().context(handle).fail_suspend = Some(NativeError::new(message));
    }

    pub fn fail_next_resume(&self, handle: RawHandle, message: &str) {
        self.lock().context(handle).fail_resume = Some(NativeError::new(message));
    }

    pub fn fail_next_wakeup(&self, handle: RawHandle, message: &str) {
        self.lock().context(handle).fail_wakeup = Some(NativeError::new(message));
    }

    #[must_use]
    pub fn start_call(&self, handle: RawHandle) -> Option<StartCall> {
        self.lock().context(handle).start_call.clone()
    }

    #[must_use]
    pub fn options(&self, handle: RawHandle) -> WorkletOptions {
        self.lock().context(handle).options.clone()
    }

    #[must_use]
    pub fn suspend_calls(&self, handle: RawHandle) -> Vec<i32> {
        self.lock().context(handle).suspend_calls.clone()
    }

    #[must_use]
    pub fn resume_count(&self, handle: RawHandle) -> usize {
        self.lock().context(handle).resume_count
    }

    #[must_use]
    pub fn wakeup_calls(&self, handle: RawHandle) -> Vec<u64> {
        self.lock().context(handle).wakeup_calls.clone()
    }

    #[must_use]
    pub fn is_terminated(&self, handle: RawHandle) -> bool {
        self.lock().context(handle).terminated
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record_start(
        &self,
        handle: RawHandle,
        filename: &str,
        source: Source,
        args: &[String],
    ) -> Result<(), NativeError> {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if let Some(err) = ctx.fail_start.take() {
            return Err(err);
        }
        ctx.start_call = Some(StartCall {
            filename: filename.to_string(),
            source,
            args: args.to_vec(),
        });
        Ok(())
    }
}

impl EngineState {
    fn context(&mut self, handle: RawHandle) -> &mut Context {
        self.contexts
            .get_mut(&handle.0)
            .expect("unknown worklet handle")
    }
}

impl NativeEngine for MockEngine {
    fn init(
        &self,
        options: &WorkletOptions,
        poller: Poller,
        exit: ExitNotifier,
    ) -> Result<RawHandle, NativeError> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .contexts
            .insert(handle, Context::new(poller, exit, options.clone()));
        Ok(RawHandle(handle))
    }

    fn start_file(
        &self,
        handle: RawHandle,
        filename: &str,
        args: &[String],
    ) -> Result<(), NativeError> {
        self.record_start(handle, filename, Source::File, args)
    }

    fn start_utf8(
        &self,
        handle: RawHandle,
        filename: &str,
        source: &str,
        args: &[String],
    ) -> Result<(), NativeError> {
        self.record_start(handle, filename, Source::Utf8(source.to_string()), args)
    }

    fn start_bytes(
        &self,
        handle: RawHandle,
        filename: &str,
        source: &Arc<[u8]>,
        args: &[String],
    ) -> Result<(), NativeError> {
        self.record_start(handle, filename, Source::Bytes(source.clone()), args)
    }

    fn update(&self, handle: RawHandle, readable: bool, writable: bool) {
        let fire = {
            let mut state = self.lock();
            let ctx = state.context(handle);
            ctx.read_interest = readable;
            ctx.write_interest = writable;
            let fire_readable = readable && !ctx.inbound.is_empty();
            let fire_writable = writable && ctx.capacity > 0;
            (fire_readable || fire_writable)
                .then(|| (ctx.poller.clone(), fire_readable, fire_writable))
        };
        // The armed condition already holds; deliver the one-shot now, after
        // releasing the engine lock so the channel may re-enter.
        if let Some((poller, fire_readable, fire_writable)) = fire {
            poller.notify(fire_readable, fire_writable);
        }
    }

    fn read(&self, handle: RawHandle) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if ctx.terminated {
            return None;
        }
        ctx.inbound.pop_front()
    }

    fn write(&self, handle: RawHandle, buf: &[u8]) -> usize {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if ctx.terminated {
            return 0;
        }
        let accepted = buf.len().min(ctx.capacity);
        ctx.capacity -= accepted;
        ctx.outbound.extend_from_slice(&buf[..accepted]);
        accepted
    }

    fn suspend(&self, handle: RawHandle, linger_ms: i32) -> Result<(), NativeError> {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if let Some(err) = ctx.fail_suspend.take() {
            return Err(err);
        }
        ctx.suspend_calls.push(linger_ms);
        Ok(())
    }

    fn resume(&self, handle: RawHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if let Some(err) = ctx.fail_resume.take() {
            return Err(err);
        }
        ctx.resume_count += 1;
        Ok(())
    }

    fn wakeup(&self, handle: RawHandle, deadline_ms: u64) -> Result<(), NativeError> {
        let mut state = self.lock();
        let ctx = state.context(handle);
        if let Some(err) = ctx.fail_wakeup.take() {
            return Err(err);
        }
        ctx.wakeup_calls.push(deadline_ms);
        Ok(())
    }

    fn terminate(&self, handle: RawHandle) {
        self.lock().context(handle).terminated = true;
    }
}
