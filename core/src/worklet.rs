//! Worklet handle — owns one engine-side context and drives its lifecycle.
//!
//! A worklet is created unstarted, moves to started exactly once, may toggle
//! suspended while started, and ends terminated. Termination is absorbing and
//! idempotent: the channel is torn down first, then the native context.
//! The `started` flag is not cleared by termination; `suspended` is a
//! sub-state of started.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use serde::Deserialize;

use crate::channel::{ChannelShared, IpcChannel};
use crate::engine::{NativeEngine, RawHandle};
use crate::error::{ChannelError, WorkletError};
use crate::registry::WorkletRegistry;

/// Construction options for a worklet. Immutable after creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkletOptions {
    /// Optional stable name. Starting a worklet whose name matches a live one
    /// terminates the previous instance.
    #[serde(default)]
    pub id: Option<String>,
    /// Heap ceiling in bytes; 0 means no limit.
    #[serde(default)]
    pub memory_limit: u64,
    /// Root path the engine resolves bundled assets against.
    #[serde(default)]
    pub assets: Option<String>,
}

/// Script source for [`Worklet::start`], resolved once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Load the script from `filename`.
    File,
    /// Textual source; `filename` is advisory.
    Utf8(String),
    /// Pre-compiled source. The `Arc` keeps the buffer alive for the duration
    /// of execution — the engine may retain a reference into it.
    Bytes(Arc<[u8]>),
}

/// Registry-scoped worklet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkletId(pub(crate) u64);

impl std::fmt::Display for WorkletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worklet-{}", self.0)
    }
}

/// Lifecycle notification delivered through the registry's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkletEvent {
    Started { id: WorkletId },
    Suspended { id: WorkletId },
    Resumed { id: WorkletId },
    Wakeup { id: WorkletId },
    Terminated { id: WorkletId },
}

/// Callback the native engine uses to report a context that exited on its
/// own, whether the script ran to completion, crashed, or was killed by the
/// platform.
///
/// Bound to its worklet after [`NativeEngine::init`] returns and holds only a
/// weak reference, so a notification for a worklet that is already gone falls
/// through silently.
#[derive(Clone)]
pub struct ExitNotifier {
    slot: Arc<OnceLock<Weak<WorkletInner>>>,
}

impl ExitNotifier {
    pub(crate) fn unbound() -> Self {
        Self {
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn bind(&self, worklet: &Worklet) {
        let _ = self.slot.set(Arc::downgrade(&worklet.inner));
    }

    /// Report a native-side exit. Drives the same teardown as
    /// [`Worklet::terminate`]: pending channel operations fail with
    /// [`ChannelError::Closed`] and the registry entry is removed.
    pub fn notify(&self) {
        let Some(inner) = self.slot.get().and_then(Weak::upgrade) else {
            return;
        };
        Worklet { inner }.terminate();
    }
}

impl std::fmt::Debug for ExitNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitNotifier").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct LifecycleState {
    started: bool,
    suspended: bool,
    terminated: bool,
}

struct WorkletInner {
    id: WorkletId,
    name: Option<String>,
    engine: Arc<dyn NativeEngine>,
    handle: RawHandle,
    channel: Arc<ChannelShared>,
    registry: WorkletRegistry,
    state: Mutex<LifecycleState>,
}

/// Cheaply cloneable handle to one worklet.
///
/// Clones share lifecycle state; the registry holds one clone for every live
/// worklet so broadcast operations can reach it.
#[derive(Clone)]
pub struct Worklet {
    inner: Arc<WorkletInner>,
}

impl Worklet {
    /// Allocate an engine context and its IPC channel.
    ///
    /// The worklet is unstarted; the channel's open phase stalls until
    /// [`Worklet::start`] succeeds.
    pub fn create(
        engine: Arc<dyn NativeEngine>,
        registry: &WorkletRegistry,
        options: WorkletOptions,
    ) -> Result<(Self, IpcChannel), WorkletError> {
        let channel = ChannelShared::new(engine.clone());
        let poller = ChannelShared::poller(&channel);
        let exit = ExitNotifier::unbound();
        let handle = engine.init(&options, poller, exit.clone())?;
        channel.bind(handle);

        let worklet = Self {
            inner: Arc::new(WorkletInner {
                id: registry.allocate_id(),
                name: options.id,
                engine,
                handle,
                channel: channel.clone(),
                registry: registry.clone(),
                state: Mutex::new(LifecycleState::default()),
            }),
        };
        exit.bind(&worklet);
        let ipc = IpcChannel::new(channel);
        Ok((worklet, ipc))
    }

    #[must_use]
    pub fn id(&self) -> WorkletId {
        self.inner.id
    }

    /// The stable name given at construction, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.lock_state().started
    }

    #[must_use]
    pub fn suspended(&self) -> bool {
        self.lock_state().suspended
    }

    #[must_use]
    pub fn terminated(&self) -> bool {
        self.lock_state().terminated
    }

    /// Start executing `filename` with the given source and arguments.
    ///
    /// On success the worklet registers for broadcast operations and the
    /// channel's open phase resolves. On native failure the worklet stays
    /// unstarted (start is not partially applied), the open phase is rejected
    /// with the same error, and the error is returned.
    pub fn start(
        &self,
        filename: &str,
        source: Source,
        args: Vec<String>,
    ) -> Result<(), WorkletError> {
        if filename.is_empty() {
            return Err(WorkletError::InvalidArgument(
                "filename must not be empty".to_string(),
            ));
        }

        let mut st = self.lock_state();
        if st.terminated {
            return Err(WorkletError::AlreadyTerminated);
        }
        if st.started {
            return Err(WorkletError::AlreadyStarted);
        }

        let inner = &self.inner;
        let dispatched = match &source {
            Source::File => inner.engine.start_file(inner.handle, filename, &args),
            Source::Utf8(text) => inner.engine.start_utf8(inner.handle, filename, text, &args),
            Source::Bytes(bytes) => inner
                .engine
                .start_bytes(inner.handle, filename, bytes, &args),
        };

        match dispatched {
            Ok(()) => {
                st.started = true;
                drop(st);
                inner.channel.resolve_open(Ok(()));
                inner.registry.emit(WorkletEvent::Started { id: inner.id });
                tracing::info!(id = %inner.id, filename, "worklet started");
                // Registration last: the registry's registration hook may
                // already act on the worklet (suspend it, displace a named
                // predecessor), and those effects belong after the start.
                inner.registry.register(self.clone());
                Ok(())
            }
            Err(err) => {
                drop(st);
                inner.channel.resolve_open(Err(err.clone()));
                tracing::warn!(id = %inner.id, error = %err, "worklet start failed");
                Err(WorkletError::Native(err))
            }
        }
    }

    /// Freeze execution after `linger_ms`.
    ///
    /// Negative means the engine's default linger policy, zero means suspend
    /// immediately, positive grants an explicit grace period. The value is
    /// forwarded verbatim; the grace-period semantics belong to the engine.
    pub fn suspend(&self, linger_ms: i32) -> Result<(), WorkletError> {
        let mut st = self.lock_state();
        if !st.started {
            return Err(WorkletError::NotStarted);
        }
        if st.terminated {
            return Err(WorkletError::AlreadyTerminated);
        }
        self.inner.engine.suspend(self.inner.handle, linger_ms)?;
        st.suspended = true;
        drop(st);
        self.inner
            .registry
            .emit(WorkletEvent::Suspended { id: self.inner.id });
        tracing::debug!(id = %self.inner.id, linger_ms, "worklet suspended");
        Ok(())
    }

    /// Unfreeze execution.
    ///
    /// Forwarded to the engine even when the worklet is not suspended; the
    /// engine's contract decides whether that is a true no-op.
    pub fn resume(&self) -> Result<(), WorkletError> {
        let mut st = self.lock_state();
        if !st.started {
            return Err(WorkletError::NotStarted);
        }
        if st.terminated {
            return Err(WorkletError::AlreadyTerminated);
        }
        self.inner.engine.resume(self.inner.handle)?;
        st.suspended = false;
        drop(st);
        self.inner
            .registry
            .emit(WorkletEvent::Resumed { id: self.inner.id });
        tracing::debug!(id = %self.inner.id, "worklet resumed");
        Ok(())
    }

    /// Schedule a timed re-entry without changing suspension state.
    pub fn wakeup(&self, deadline_ms: u64) -> Result<(), WorkletError> {
        let st = self.lock_state();
        if !st.started {
            return Err(WorkletError::NotStarted);
        }
        if st.terminated {
            return Err(WorkletError::AlreadyTerminated);
        }
        self.inner.engine.wakeup(self.inner.handle, deadline_ms)?;
        drop(st);
        self.inner
            .registry
            .emit(WorkletEvent::Wakeup { id: self.inner.id });
        tracing::debug!(id = %self.inner.id, deadline_ms, "worklet wakeup");
        Ok(())
    }

    /// Tear the worklet down. Idempotent and never fails — safe to call from
    /// an error handler.
    ///
    /// The channel is destroyed first (pending operations fail with
    /// [`ChannelError::Closed`]), then the engine context, but only if the
    /// worklet had been started.
    pub fn terminate(&self) {
        let was_started = {
            let mut st = self.lock_state();
            if st.terminated {
                return;
            }
            st.terminated = true;
            st.started
        };
        self.inner.channel.close(ChannelError::Closed);
        if was_started {
            self.inner.engine.terminate(self.inner.handle);
        }
        self.inner.registry.remove(self.inner.id);
        self.inner
            .registry
            .emit(WorkletEvent::Terminated { id: self.inner.id });
        tracing::info!(id = %self.inner.id, "worklet terminated");
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Worklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock_state();
        f.debug_struct("Worklet")
            .field("id", &self.inner.id)
            .field("started", &st.started)
            .field("suspended", &st.suspended)
            .field("terminated", &st.terminated)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkletInner {
    fn drop(&mut self) {
        // The registry keeps live worklets alive, so reaching here means the
        // worklet was either terminated already or never started. Mirror an
        // explicit terminate for the leftover cases.
        let st = match self.state.get_mut() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !st.terminated {
            self.channel.close(ChannelError::Closed);
            if st.started {
                self.engine.terminate(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<MockEngine>, WorkletRegistry) {
        (Arc::new(MockEngine::default()), WorkletRegistry::new())
    }

    fn create(
        engine: &Arc<MockEngine>,
        registry: &WorkletRegistry,
        options: WorkletOptions,
    ) -> (Worklet, IpcChannel) {
        let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
        Worklet::create(dyn_engine, registry, options).expect("create")
    }

    fn start(worklet: &Worklet) {
        worklet
            .start("main.js", Source::Utf8("console.log(1)".to_string()), vec![])
            .expect("start");
    }

    #[test]
    fn start_sets_started_and_registers() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());

        assert!(!worklet.started());
        start(&worklet);
        assert!(worklet.started());
        assert!(!worklet.suspended());
        assert_eq!(registry.ids(), vec![worklet.id()]);
    }

    #[test]
    fn start_twice_fails_with_already_started() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);

        let err = worklet
            .start("main.js", Source::File, vec![])
            .expect_err("second start");
        assert_eq!(err, WorkletError::AlreadyStarted);
    }

    #[test]
    fn empty_filename_is_rejected_without_state_change() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());

        let err = worklet.start("", Source::File, vec![]).expect_err("start");
        assert!(matches!(err, WorkletError::InvalidArgument(_)));
        assert!(!worklet.started());
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn lifecycle_ops_before_start_fail_with_not_started() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());

        assert_eq!(worklet.suspend(-1), Err(WorkletError::NotStarted));
        assert_eq!(worklet.resume(), Err(WorkletError::NotStarted));
        assert_eq!(worklet.wakeup(0), Err(WorkletError::NotStarted));
    }

    #[test]
    fn native_start_failure_leaves_worklet_unstarted() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        engine.fail_next_start(worklet_handle(&worklet), "no such file");

        let err = worklet
            .start("main.js", Source::File, vec![])
            .expect_err("start");
        assert_eq!(
            err,
            WorkletError::Native(crate::error::NativeError::new("no such file"))
        );
        assert!(!worklet.started());
        assert!(registry.ids().is_empty());

        // Start is not partially applied; a retry goes through.
        start(&worklet);
        assert!(worklet.started());
    }

    #[test]
    fn suspend_resume_round_trip() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);

        worklet.suspend(250).expect("suspend");
        assert!(worklet.suspended());
        worklet.resume().expect("resume");
        assert!(!worklet.suspended());
        assert!(worklet.started());
        assert_eq!(engine.suspend_calls(worklet_handle(&worklet)), vec![250]);
    }

    #[test]
    fn resume_without_suspend_is_still_forwarded() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);

        worklet.resume().expect("resume");
        assert_eq!(engine.resume_count(worklet_handle(&worklet)), 1);
    }

    #[test]
    fn native_suspend_failure_leaves_state_unchanged() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);
        engine.fail_next_suspend(worklet_handle(&worklet), "engine busy");

        assert!(worklet.suspend(-1).is_err());
        assert!(!worklet.suspended());
    }

    #[test]
    fn wakeup_forwards_deadline_without_state_change() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);
        worklet.suspend(-1).expect("suspend");

        worklet.wakeup(3_000).expect("wakeup");
        assert!(worklet.suspended());
        assert_eq!(engine.wakeup_calls(worklet_handle(&worklet)), vec![3_000]);
    }

    #[test]
    fn terminate_is_idempotent_and_absorbing() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);

        worklet.terminate();
        worklet.terminate();
        assert!(worklet.terminated());
        // Historical observable: started is not cleared by termination.
        assert!(worklet.started());
        assert!(registry.ids().is_empty());
        assert!(engine.is_terminated(worklet_handle(&worklet)));

        let err = worklet
            .start("main.js", Source::File, vec![])
            .expect_err("start after terminate");
        assert_eq!(err, WorkletError::AlreadyTerminated);
        assert_eq!(worklet.suspend(-1), Err(WorkletError::AlreadyTerminated));
    }

    #[test]
    fn terminate_before_start_skips_engine_teardown() {
        let (engine, registry) = setup();
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());

        worklet.terminate();
        assert!(worklet.terminated());
        assert!(!engine.is_terminated(worklet_handle(&worklet)));
    }

    #[tokio::test]
    async fn terminate_fails_pending_channel_read() {
        let (engine, registry) = setup();
        let (worklet, mut ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);
        ipc.ready().await.expect("ready");

        let (result, ()) = tokio::join!(ipc.recv(), async {
            worklet.terminate();
        });
        assert_eq!(result, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn native_exit_tears_down_like_terminate() {
        let (engine, registry) = setup();
        let (worklet, mut ipc) = create(&engine, &registry, WorkletOptions::default());
        start(&worklet);
        ipc.ready().await.expect("ready");

        // The engine reports the script exited while a read is parked.
        let (result, ()) = tokio::join!(ipc.recv(), async {
            engine.report_exit(worklet_handle(&worklet));
        });
        assert_eq!(result, Err(ChannelError::Closed));
        assert!(worklet.terminated());
        assert!(registry.is_empty());
    }

    #[test]
    fn native_exit_after_worklet_is_dropped_falls_through() {
        let (engine, registry) = setup();
        let (worklet, ipc) = create(&engine, &registry, WorkletOptions::default());
        let handle = worklet_handle(&worklet);
        drop(ipc);
        drop(worklet);

        engine.report_exit(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn named_worklet_replaces_live_predecessor() {
        let (engine, registry) = setup();
        let options = WorkletOptions {
            id: Some("push".to_string()),
            ..WorkletOptions::default()
        };
        let (first, _ipc1) = create(&engine, &registry, options.clone());
        let (second, _ipc2) = create(&engine, &registry, options);
        start(&first);
        start(&second);

        assert!(first.terminated());
        assert!(!second.terminated());
        assert_eq!(registry.ids(), vec![second.id()]);
    }

    #[test]
    fn source_variants_dispatch_to_matching_entry_points() {
        let (engine, registry) = setup();

        let (by_file, _i1) = create(&engine, &registry, WorkletOptions::default());
        by_file
            .start("app.js", Source::File, vec!["--flag".to_string()])
            .expect("start file");
        let call = engine.start_call(worklet_handle(&by_file)).expect("call");
        assert_eq!(call.filename, "app.js");
        assert_eq!(call.source, Source::File);
        assert_eq!(call.args, vec!["--flag".to_string()]);

        let (by_text, _i2) = create(&engine, &registry, WorkletOptions::default());
        by_text
            .start("inline.js", Source::Utf8("1 + 1".to_string()), vec![])
            .expect("start utf8");
        let call = engine.start_call(worklet_handle(&by_text)).expect("call");
        assert_eq!(call.source, Source::Utf8("1 + 1".to_string()));

        let (by_bytes, _i3) = create(&engine, &registry, WorkletOptions::default());
        let blob: Arc<[u8]> = Arc::from(&b"\x00asm"[..]);
        by_bytes
            .start("blob.bin", Source::Bytes(blob.clone()), vec![])
            .expect("start bytes");
        let call = engine.start_call(worklet_handle(&by_bytes)).expect("call");
        assert_eq!(call.source, Source::Bytes(blob));
    }

    #[test]
    fn events_are_emitted_in_lifecycle_order() {
        let engine = Arc::new(MockEngine::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = WorkletRegistry::with_events(tx);
        let (worklet, _ipc) = create(&engine, &registry, WorkletOptions::default());
        let id = worklet.id();

        start(&worklet);
        worklet.suspend(-1).expect("suspend");
        worklet.resume().expect("resume");
        worklet.wakeup(0).expect("wakeup");
        worklet.terminate();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                WorkletEvent::Started { id },
                WorkletEvent::Suspended { id },
                WorkletEvent::Resumed { id },
                WorkletEvent::Wakeup { id },
                WorkletEvent::Terminated { id },
            ]
        );
    }

    fn worklet_handle(worklet: &Worklet) -> RawHandle {
        worklet.inner.handle
    }
}
