//! Single-flight cache cells for scoped instances

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::error::{DiError, DiResult};
use crate::lifecycle::Disposer;
use crate::value::Value;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// A resolved value together with its disposal hook
#[derive(Clone)]
pub(crate) struct Instance {
    pub value: Value,
    pub disposer: Option<Disposer>,
    /// Creation sequence, used to dispose in reverse order
    pub created: u64,
}

impl Instance {
    pub fn new(value: Value, disposer: Option<Disposer>) -> Self {
        Self {
            value,
            disposer,
            created: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn plain(value: Value) -> Self {
        Self::new(value, None)
    }
}

type InFlight = Shared<BoxFuture<'static, DiResult<Instance>>>;

static NEXT_FLIGHT: AtomicU64 = AtomicU64::new(1);
static WAITS: Mutex<WaitGraph> = parking_lot::const_mutex(WaitGraph::new());

/// Which in-flight resolutions are blocked on which.
///
/// A flight is one run of a cached binding's strategy. An edge `a -> b`
/// means flight `a` cannot finish before flight `b` does, either because
/// `a` started `b` or because `a` joined it.
struct WaitGraph {
    edges: BTreeMap<u64, Vec<u64>>,
    keys: BTreeMap<u64, String>,
}

impl WaitGraph {
    const fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
            keys: BTreeMap::new(),
        }
    }

    /// Flights on a wait path from `from` to `to`, both included
    fn path(&self, from: u64, to: u64) -> Option<Vec<u64>> {
        let mut stack = vec![vec![from]];
        let mut seen = BTreeSet::new();
        while let Some(path) = stack.pop() {
            let last = *path.last()?;
            if last == to {
                return Some(path);
            }
            if !seen.insert(last) {
                continue;
            }
            for next in self.edges.get(&last).into_iter().flatten() {
                let mut extended = path.clone();
                extended.push(*next);
                stack.push(extended);
            }
        }
        None
    }

    fn describe(&self, flights: impl IntoIterator<Item = u64>) -> String {
        flights
            .into_iter()
            .map(|id| self.keys.get(&id).map_or("?", String::as_str))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn remove_edge(&mut self, from: u64, to: u64) {
        if let Some(targets) = self.edges.get_mut(&from) {
            if let Some(index) = targets.iter().position(|t| *t == to) {
                targets.swap_remove(index);
            }
            if targets.is_empty() {
                self.edges.remove(&from);
            }
        }
    }
}

/// Registered wait of one flight on another, removed on drop
struct WaitEdge {
    from: u64,
    to: u64,
}

impl WaitEdge {
    /// Record that `waiter` blocks on `flight`, failing if `flight` already
    /// waits on `waiter`
    fn register(graph: &mut WaitGraph, waiter: Option<u64>, flight: u64) -> DiResult<Option<Self>> {
        let Some(from) = waiter else {
            return Ok(None);
        };
        if let Some(path) = graph.path(flight, from) {
            let path = graph.describe(std::iter::once(from).chain(path));
            return Err(DiError::CircularDependency { path });
        }
        graph.edges.entry(from).or_default().push(flight);
        Ok(Some(Self { from, to: flight }))
    }
}

impl Drop for WaitEdge {
    fn drop(&mut self) {
        WAITS.lock().remove_edge(self.from, self.to);
    }
}

/// Key of a running flight, kept for cycle reports
struct FlightName(u64);

impl Drop for FlightName {
    fn drop(&mut self) {
        WAITS.lock().keys.remove(&self.0);
    }
}

enum SlotState {
    Empty,
    Pending { flight: u64, future: InFlight },
    Ready(Instance),
}

/// Cache cell guaranteeing that at most one resolution runs at a time.
///
/// The in-flight resolution is a shared future stored in the cell, so a
/// waiter that gives up only drops its own handle; the next waiter picks
/// up the same resolution. The lock is never held across an await.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// The cached instance, if resolution has completed
    #[cfg(test)]
    pub fn peek(&self) -> Option<Instance> {
        match &*self.state.lock() {
            SlotState::Ready(instance) => Some(instance.clone()),
            _ => None,
        }
    }

    /// Return the cached instance or join/start the single resolution.
    ///
    /// `waiter` is the flight the caller is running inside, if any; `init`
    /// receives the id of the flight it starts. Joining a flight that
    /// already waits on `waiter` fails with `CircularDependency`.
    ///
    /// With `may_suspend == false` an in-flight resolution started by
    /// another caller is reported as `AsyncResolutionRequired` instead of
    /// being awaited.
    pub async fn get_or_resolve<F>(
        &self,
        key: &str,
        waiter: Option<u64>,
        may_suspend: bool,
        init: F,
    ) -> DiResult<Instance>
    where
        F: FnOnce(u64) -> BoxFuture<'static, DiResult<Instance>>,
    {
        let (flight, future, _edge) = {
            let mut state = self.state.lock();
            match &*state {
                SlotState::Ready(instance) => {
                    trace!("Cache hit for '{}'", key);
                    return Ok(instance.clone());
                }
                SlotState::Pending { flight, future } => {
                    if !may_suspend {
                        return Err(DiError::AsyncResolutionRequired {
                            key: key.to_string(),
                        });
                    }
                    let edge = WaitEdge::register(&mut WAITS.lock(), waiter, *flight)?;
                    trace!("Joining in-flight resolution of '{}'", key);
                    (*flight, future.clone(), edge)
                }
                SlotState::Empty => {
                    let flight = NEXT_FLIGHT.fetch_add(1, Ordering::Relaxed);
                    let (name, edge) = {
                        let mut graph = WAITS.lock();
                        let edge = WaitEdge::register(&mut graph, waiter, flight)?;
                        graph.keys.insert(flight, key.to_string());
                        (FlightName(flight), edge)
                    };
                    let resolution = init(flight);
                    let future = async move {
                        let _name = name;
                        resolution.await
                    }
                    .boxed()
                    .shared();
                    *state = SlotState::Pending {
                        flight,
                        future: future.clone(),
                    };
                    (flight, future, edge)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock();
        if let SlotState::Pending { flight: current, .. } = &*state {
            if *current == flight {
                // Failures are never cached
                *state = match &result {
                    Ok(instance) => SlotState::Ready(instance.clone()),
                    Err(_) => SlotState::Empty,
                };
            }
        }
        result
    }

    /// Drop any cached or in-flight value, returning a completed one
    pub fn reset(&self) -> Option<Instance> {
        match std::mem::replace(&mut *self.state.lock(), SlotState::Empty) {
            SlotState::Ready(instance) => Some(instance),
            _ => None,
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            SlotState::Empty => "empty",
            SlotState::Pending { .. } => "pending",
            SlotState::Ready(_) => "ready",
        };
        f.debug_struct("Slot").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_init(
        counter: Arc<AtomicUsize>,
    ) -> impl FnOnce(u64) -> BoxFuture<'static, DiResult<Instance>> {
        move |_flight| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Instance::plain(value(5u32)))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_resolution() {
        let slot = Slot::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            slot.get_or_resolve("n", None, true, counting_init(counter.clone())),
            slot.get_or_resolve("n", None, true, counting_init(counter.clone())),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.unwrap().value, &b.unwrap().value));
        assert!(slot.peek().is_some());
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let slot = Slot::new();
        let err = slot
            .get_or_resolve("n", None, true, |_flight| {
                async { Err(DiError::Other("boom".into())) }.boxed()
            })
            .await;
        assert!(err.is_err());
        assert!(slot.peek().is_none());

        let counter = Arc::new(AtomicUsize::new(0));
        slot.get_or_resolve("n", None, true, counting_init(counter.clone()))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_restart_resolution() {
        let slot = Slot::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            slot.get_or_resolve("n", None, true, counting_init(counter.clone())),
        )
        .await;
        assert!(abandoned.is_err());

        slot.get_or_resolve("n", None, true, counting_init(counter.clone()))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_suspending_caller_rejects_in_flight() {
        let slot = Slot::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _ = tokio::time::timeout(
            Duration::from_millis(1),
            slot.get_or_resolve("n", None, true, counting_init(counter.clone())),
        )
        .await;

        let result = slot
            .get_or_resolve("n", None, false, counting_init(counter.clone()))
            .await;
        assert!(matches!(
            result,
            Err(DiError::AsyncResolutionRequired { .. })
        ));
    }
}
