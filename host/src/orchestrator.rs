//! Debounced suspend/resume fan-out driven by host state transitions.
//!
//! The watcher subscribes to a [`watch`] channel of [`HostState`] values and
//! maps transitions onto registry broadcasts. `Inactive` is usually a brief
//! transition artifact (an overlay, an app switcher peek), so worklets are
//! suspended immediately but a recheck timer is armed: if the host is still
//! inactive once the window elapses, the worklets are resumed rather than
//! left frozen in a foreground app. Any state change cancels the timer.
//!
//! Worklets that start while the watcher is live are aligned with the current
//! host state through the registry's registration hook, so backgrounding the
//! host also covers worklets started afterwards.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};

use worklet_core::WorkletRegistry;

use crate::state::HostState;

/// How long the host may sit in `Inactive` before worklets are resumed.
pub const INACTIVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Linger hint forwarded to the engine on lifecycle suspends. Negative means
/// no deadline; the engine keeps the worklet parked until resumed.
pub const DEFAULT_LINGER_MS: i32 = -1;

/// Drives registry-wide suspend/resume from host state transitions.
pub struct LifecycleWatcher {
    registry: WorkletRegistry,
    states: watch::Receiver<HostState>,
    debounce: Duration,
    recheck: Option<Pin<Box<Sleep>>>,
}

impl LifecycleWatcher {
    #[must_use]
    pub fn new(registry: WorkletRegistry, states: watch::Receiver<HostState>) -> Self {
        Self::with_debounce(registry, states, INACTIVE_DEBOUNCE)
    }

    #[must_use]
    pub fn with_debounce(
        registry: WorkletRegistry,
        states: watch::Receiver<HostState>,
        debounce: Duration,
    ) -> Self {
        // Worklets started after the host has already backgrounded must not
        // keep running until the next transition; suspend them on entry.
        // An inactive host is left alone: it is transient, and a lingering
        // one has its worklets resumed by the recheck anyway.
        let admission_states = states.clone();
        registry.on_register(move |worklet| {
            if *admission_states.borrow() == HostState::Background {
                if let Err(err) = worklet.suspend(DEFAULT_LINGER_MS) {
                    tracing::warn!(
                        id = %worklet.id(),
                        error = %err,
                        "failed to suspend worklet started while host is backgrounded"
                    );
                }
            }
        });
        Self {
            registry,
            states,
            debounce,
            recheck: None,
        }
    }

    /// Run the watcher on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process transitions until every state sender is dropped.
    ///
    /// The state current at startup is taken as the baseline, not applied;
    /// only transitions observed afterwards touch the worklets.
    pub async fn run(mut self) {
        self.states.borrow_and_update();
        loop {
            let step = tokio::select! {
                changed = self.states.changed() => {
                    if changed.is_ok() {
                        Step::StateChanged
                    } else {
                        Step::Shutdown
                    }
                }
                () = recheck_elapsed(&mut self.recheck) => Step::Recheck,
            };
            match step {
                Step::StateChanged => {
                    let state = *self.states.borrow_and_update();
                    self.apply(state);
                }
                Step::Recheck => {
                    if *self.states.borrow() == HostState::Inactive {
                        tracing::debug!("host still inactive after debounce, resuming worklets");
                        self.registry.resume_all();
                    }
                }
                Step::Shutdown => {
                    tracing::debug!("host state channel closed, lifecycle watcher stopping");
                    return;
                }
            }
        }
    }

    fn apply(&mut self, state: HostState) {
        // Any transition supersedes a pending inactive recheck.
        self.recheck = None;
        tracing::debug!(state = %state, "host state transition");
        match state {
            HostState::Active => {
                self.registry.resume_all();
            }
            HostState::Background => {
                self.registry.suspend_all(DEFAULT_LINGER_MS);
            }
            HostState::Inactive => {
                self.registry.suspend_all(DEFAULT_LINGER_MS);
                self.recheck = Some(Box::pin(sleep(self.debounce)));
            }
        }
    }
}

enum Step {
    StateChanged,
    Recheck,
    Shutdown,
}

async fn recheck_elapsed(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(timer) => {
            timer.as_mut().await;
            *slot = None;
        }
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for LifecycleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleWatcher")
            .field("debounce", &self.debounce)
            .field("recheck_armed", &self.recheck.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::task::yield_now;
    use tokio::time::{Duration, sleep};

    use worklet_core::mock::MockEngine;
    use worklet_core::{NativeEngine, RawHandle, Source, Worklet, WorkletOptions, WorkletRegistry};

    use super::*;

    struct Fixture {
        engine: Arc<MockEngine>,
        registry: WorkletRegistry,
        worklet: Worklet,
        handle: RawHandle,
        states: watch::Sender<HostState>,
        watcher: JoinHandle<()>,
    }

    fn suspend_count(fixture: &Fixture) -> usize {
        fixture.engine.suspend_calls(fixture.handle).len()
    }

    fn resume_count(fixture: &Fixture) -> usize {
        fixture.engine.resume_count(fixture.handle)
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::default());
        let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
        let registry = WorkletRegistry::new();
        let (worklet, _ipc) =
            Worklet::create(dyn_engine, &registry, WorkletOptions::default()).expect("create");
        worklet
            .start("main.js", Source::Utf8(String::new()), vec![])
            .expect("start");
        let handle = engine.handle_of(1);

        let (states, rx) = watch::channel(HostState::Active);
        let watcher = LifecycleWatcher::new(registry.clone(), rx).spawn();
        yield_now().await;

        Fixture {
            engine,
            registry,
            worklet,
            handle,
            states,
            watcher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_state_is_a_baseline_not_a_transition() {
        let fixture = fixture().await;
        sleep(Duration::from_millis(600)).await;
        assert_eq!(suspend_count(&fixture), 0);
        assert_eq!(resume_count(&fixture), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_suspends_and_active_resumes() {
        let fixture = fixture().await;

        fixture.states.send(HostState::Background).expect("send");
        yield_now().await;
        assert_eq!(
            fixture.engine.suspend_calls(fixture.handle),
            vec![DEFAULT_LINGER_MS]
        );
        assert!(fixture.worklet.suspended());

        fixture.states.send(HostState::Active).expect("send");
        yield_now().await;
        assert_eq!(resume_count(&fixture), 1);
        assert!(!fixture.worklet.suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn background_never_triggers_the_inactive_recheck() {
        let fixture = fixture().await;

        fixture.states.send(HostState::Background).expect("send");
        yield_now().await;
        sleep(Duration::from_millis(600)).await;
        assert_eq!(suspend_count(&fixture), 1);
        assert_eq!(resume_count(&fixture), 0);
        assert!(fixture.worklet.suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_inactive_resumes_after_the_debounce_window() {
        let fixture = fixture().await;

        fixture.states.send(HostState::Inactive).expect("send");
        yield_now().await;
        assert!(fixture.worklet.suspended());

        // Just short of the window, still parked.
        sleep(Duration::from_millis(499)).await;
        assert_eq!(resume_count(&fixture), 0);

        sleep(Duration::from_millis(101)).await;
        assert_eq!(resume_count(&fixture), 1);
        assert!(!fixture.worklet.suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn activation_within_the_window_cancels_the_recheck() {
        let fixture = fixture().await;

        fixture.states.send(HostState::Inactive).expect("send");
        yield_now().await;
        fixture.states.send(HostState::Active).expect("send");
        yield_now().await;
        assert_eq!(suspend_count(&fixture), 1);
        assert_eq!(resume_count(&fixture), 1);

        // The cancelled timer must not fire a second resume.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resume_count(&fixture), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backgrounding_within_the_window_keeps_worklets_suspended() {
        let fixture = fixture().await;

        fixture.states.send(HostState::Inactive).expect("send");
        yield_now().await;
        fixture.states.send(HostState::Background).expect("send");
        yield_now().await;
        sleep(Duration::from_millis(600)).await;

        assert_eq!(suspend_count(&fixture), 2);
        assert_eq!(resume_count(&fixture), 0);
        assert!(fixture.worklet.suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn worklet_started_while_backgrounded_is_suspended_on_start() {
        let engine = Arc::new(MockEngine::default());
        let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
        let registry = WorkletRegistry::new();
        let (states, rx) = watch::channel(HostState::Active);
        let _watcher = LifecycleWatcher::new(registry.clone(), rx).spawn();
        yield_now().await;

        states.send(HostState::Background).expect("send");
        yield_now().await;

        let (worklet, _ipc) =
            Worklet::create(dyn_engine, &registry, WorkletOptions::default()).expect("create");
        worklet
            .start("main.js", Source::Utf8(String::new()), vec![])
            .expect("start");
        assert!(worklet.suspended());
        assert_eq!(
            engine.suspend_calls(engine.handle_of(1)),
            vec![DEFAULT_LINGER_MS]
        );

        // The next activation reaches it like any other member.
        states.send(HostState::Active).expect("send");
        yield_now().await;
        assert!(!worklet.suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn worklet_started_while_active_is_left_running() {
        let engine = Arc::new(MockEngine::default());
        let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
        let registry = WorkletRegistry::new();
        let (_states, rx) = watch::channel(HostState::Active);
        let _watcher = LifecycleWatcher::new(registry.clone(), rx).spawn();
        yield_now().await;

        let (worklet, _ipc) =
            Worklet::create(dyn_engine, &registry, WorkletOptions::default()).expect("create");
        worklet
            .start("main.js", Source::Utf8(String::new()), vec![])
            .expect("start");
        assert!(!worklet.suspended());
        assert!(engine.suspend_calls(engine.handle_of(1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_stops_when_the_state_sender_is_dropped() {
        let fixture = fixture().await;
        assert_eq!(fixture.registry.len(), 1);

        drop(fixture.states);
        fixture.watcher.await.expect("watcher task");
    }
}
