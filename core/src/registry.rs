//! Registry of live worklets and the broadcast operations over them.
//!
//! The registry is an explicitly constructed, cloneable context rather than
//! process-global state — tests and embedders build isolated registries.
//! Membership tracks the live set: insertion on successful start, removal on
//! terminate. Broadcasts visit worklets in insertion order and isolate
//! per-worklet failures so one misbehaving worklet cannot block the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::WorkletError;
use crate::worklet::{Worklet, WorkletEvent, WorkletId};

type RegistrationHook = Box<dyn Fn(&Worklet) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    worklets: Mutex<Vec<Worklet>>,
    next_id: AtomicU64,
    events: Option<mpsc::UnboundedSender<WorkletEvent>>,
    on_register: Mutex<Option<RegistrationHook>>,
}

/// Shared table of live worklets.
///
/// Clones refer to the same table; hand one to the lifecycle orchestrator and
/// to every [`Worklet::create`] call that should participate in broadcasts.
#[derive(Clone, Default)]
pub struct WorkletRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkletRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that reports lifecycle events for every member worklet.
    /// Delivery is best-effort; a dropped receiver is ignored.
    #[must_use]
    pub fn with_events(events: mpsc::UnboundedSender<WorkletEvent>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                events: Some(events),
                ..RegistryInner::default()
            }),
        }
    }

    pub(crate) fn allocate_id(&self) -> WorkletId {
        WorkletId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Install a hook that runs for every worklet entering the registry,
    /// after insertion. The lifecycle orchestrator uses this to align
    /// freshly started worklets with the current host state.
    pub fn on_register(&self, hook: impl Fn(&Worklet) + Send + Sync + 'static) {
        *self.lock_hook() = Some(Box::new(hook));
    }

    /// Insert a freshly started worklet.
    ///
    /// A live worklet carrying the same stable name is displaced: removed
    /// here and terminated after the table lock is released.
    pub(crate) fn register(&self, worklet: Worklet) {
        let displaced = {
            let mut table = self.lock_table();
            let displaced = worklet.name().and_then(|name| {
                table
                    .iter()
                    .position(|other| other.name() == Some(name))
                    .map(|index| table.remove(index))
            });
            table.push(worklet.clone());
            displaced
        };
        if let Some(previous) = displaced {
            tracing::info!(id = %previous.id(), "replacing named worklet");
            previous.terminate();
        }
        if let Some(hook) = self.lock_hook().as_ref() {
            hook(&worklet);
        }
    }

    pub(crate) fn remove(&self, id: WorkletId) {
        self.lock_table().retain(|worklet| worklet.id() != id);
    }

    pub(crate) fn emit(&self, event: WorkletEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }

    /// Identifiers of live worklets, in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<WorkletId> {
        self.lock_table().iter().map(Worklet::id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_table().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_table().is_empty()
    }

    /// Suspend every live worklet, forwarding `linger_ms` to each.
    ///
    /// Failures are collected per worklet and never abort the sweep.
    pub fn suspend_all(&self, linger_ms: i32) -> Vec<(WorkletId, WorkletError)> {
        self.broadcast("suspend", |worklet| worklet.suspend(linger_ms))
    }

    /// Resume every live worklet.
    pub fn resume_all(&self) -> Vec<(WorkletId, WorkletError)> {
        self.broadcast("resume", Worklet::resume)
    }

    /// Wake every live worklet with the given deadline.
    pub fn wakeup_all(&self, deadline_ms: u64) -> Vec<(WorkletId, WorkletError)> {
        self.broadcast("wakeup", |worklet| worklet.wakeup(deadline_ms))
    }

    fn broadcast(
        &self,
        operation: &str,
        apply: impl Fn(&Worklet) -> Result<(), WorkletError>,
    ) -> Vec<(WorkletId, WorkletError)> {
        // Snapshot first: applying the operation must not hold the table
        // lock, since a worklet may re-enter the registry (terminate).
        let snapshot: Vec<Worklet> = self.lock_table().clone();
        let mut failures = Vec::new();
        for worklet in &snapshot {
            if let Err(err) = apply(worklet) {
                tracing::warn!(id = %worklet.id(), operation, error = %err, "broadcast failed for worklet");
                failures.push((worklet.id(), err));
            }
        }
        failures
    }

    fn lock_table(&self) -> MutexGuard<'_, Vec<Worklet>> {
        self.inner
            .worklets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_hook(&self) -> MutexGuard<'_, Option<RegistrationHook>> {
        self.inner
            .on_register
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkletRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkletRegistry")
            .field("worklets", &self.ids())
            .finish_non_exhaustive()
    }
}
