//! Event dispatcher.
//!
//! A dispatcher pass takes one registry snapshot, evaluates every active
//! subscription in registration order and submits a delivery for each match.
//! It never waits for a delivery to finish.
//!
//! The hub feeds the dispatcher from a dedicated worker thread that drains a
//! bounded event queue. Producers enqueue with non-blocking `try_send`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{ExecutionError, HubError, HubResult};
use crate::event::Event;
use crate::subscription::ListenerId;

use super::delivery::{Delivery, DeliveryPool};
use super::matcher::{evaluate, MatchOutput};
use super::registry::Registry;

/// Result of one dispatcher pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Registry version the pass ran against.
    pub snapshot_version: u64,
    /// Active subscriptions evaluated.
    pub evaluated: usize,
    /// Listeners a delivery was submitted for, in registration order.
    pub matched: Vec<ListenerId>,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    dispatched: AtomicU64,
    matches: AtomicU64,
}

impl DispatchCounters {
    /// Events that went through a dispatcher pass.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn matches(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }
}

/// Matches events against the registry and hands matches to the delivery pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    deliveries: DeliveryPool,
    hub_identity: Arc<str>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<Registry>, deliveries: DeliveryPool, hub_identity: impl Into<Arc<str>>) -> Self {
        Self {
            registry,
            deliveries,
            hub_identity: hub_identity.into(),
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<DispatchCounters> {
        &self.counters
    }

    #[must_use]
    pub fn deliveries(&self) -> &DeliveryPool {
        &self.deliveries
    }

    /// Runs one pass for `event`.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let snapshot = self.registry.snapshot();
        let mut evaluated = 0usize;
        let mut matched = Vec::new();

        for sub in snapshot.iter().filter(|s| s.active) {
            evaluated += 1;
            match evaluate(sub, event, &self.hub_identity) {
                MatchOutput::Match => {
                    tracing::debug!(listener_id = %sub.listener_id, event_id = %event.id, "listener matched");
                    // Dropping the handle detaches the delivery task.
                    drop(self.deliveries.submit(Delivery::new(sub, event)));
                    matched.push(sub.listener_id.clone());
                }
                MatchOutput::NoMatch(reason) => {
                    tracing::trace!(listener_id = %sub.listener_id, event_id = %event.id, ?reason, "listener skipped");
                }
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .matches
            .fetch_add(matched.len() as u64, Ordering::Relaxed);

        DispatchReport {
            snapshot_version: snapshot.version(),
            evaluated,
            matched,
        }
    }
}

/// Bounded queue in front of a dispatcher worker thread.
#[derive(Debug)]
pub(crate) struct DispatchWorker {
    events_tx: RwLock<Option<Sender<Event>>>,
    dropped: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchWorker {
    pub(crate) fn spawn(dispatcher: Dispatcher, capacity: usize) -> HubResult<Self> {
        let (events_tx, events_rx) = bounded::<Event>(capacity.max(1));

        let join = thread::Builder::new()
            .name("triggerhub-dispatch".to_string())
            .spawn(move || worker_loop(&dispatcher, &events_rx))
            .map_err(|e| {
                HubError::Execution(ExecutionError::Spawn {
                    what: "dispatch worker".to_string(),
                    message: e.to_string(),
                })
            })?;

        Ok(Self {
            events_tx: RwLock::new(Some(events_tx)),
            dropped: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        })
    }

    /// Non-blocking enqueue. Counts and reports the event when it is dropped.
    pub(crate) fn publish(&self, event: Event) -> HubResult<()> {
        let guard = self.events_tx.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(disconnected());
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %ev.id, "event queue full, dropping event");
                Err(HubError::Execution(ExecutionError::QueueFull {
                    queue: "events".to_string(),
                }))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(disconnected())
            }
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn queued(&self) -> usize {
        self.events_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Sender::len)
    }

    /// Closes the queue and waits for already queued events to be dispatched.
    ///
    /// Idempotent.
    pub(crate) fn stop(&self) {
        drop(self.events_tx.write().unwrap_or_else(PoisonError::into_inner).take());
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        // Do not join here: the worker exits once the last sender is gone.
        if let Ok(tx) = self.events_tx.get_mut() {
            drop(tx.take());
        }
    }
}

fn disconnected() -> HubError {
    HubError::Execution(ExecutionError::Disconnected {
        path: "dispatch_queue".to_string(),
    })
}

fn worker_loop(dispatcher: &Dispatcher, events_rx: &Receiver<Event>) {
    tracing::debug!("dispatch worker started");
    while let Ok(event) = events_rx.recv() {
        let report = dispatcher.dispatch(&event);
        if !report.matched.is_empty() {
            tracing::info!(
                event_id = %event.id,
                channel_id = %event.channel_id,
                matched = report.matched.len(),
                "event dispatched"
            );
        }
    }
    tracing::debug!("dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::runtime::Handle;
    use tokio::sync::Notify;

    use crate::error::DeliveryError;
    use crate::event::Author;
    use crate::hub::delivery::{DeliveryReceipt, DeliverySink};
    use crate::subscription::{
        DeliveryTarget, ListenerParameters, PatternKind, Subscription, SubscriptionSpec,
    };

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliverySink for Recorder {
        async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError> {
            self.delivered
                .lock()
                .unwrap()
                .push(delivery.listener_id.to_string());
            Ok(DeliveryReceipt {
                status: 200,
                elapsed: Duration::ZERO,
            })
        }
    }

    /// Blocks one listener's delivery until released.
    struct Gate {
        blocked: String,
        release: Notify,
        done: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliverySink for Gate {
        async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError> {
            if delivery.listener_id.as_str() == self.blocked {
                self.release.notified().await;
            }
            self.done.lock().unwrap().push(delivery.listener_id.to_string());
            Ok(DeliveryReceipt {
                status: 200,
                elapsed: Duration::ZERO,
            })
        }
    }

    fn register(reg: &Registry, id: &str, kind: PatternKind, value: Option<&str>) {
        let delivery = DeliveryTarget {
            callback_id: id.to_string(),
            base_address: "http://localhost:5678".to_string(),
        };
        let spec = SubscriptionSpec::new(id, ListenerParameters::new(kind, value), delivery);
        reg.register(Subscription::from_spec(spec).unwrap());
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn dispatch_reports_matches_in_registration_order() {
        let reg = Arc::new(Registry::new());
        register(&reg, "b", PatternKind::Contains, Some("deploy"));
        register(&reg, "a", PatternKind::Any, None);
        register(&reg, "c", PatternKind::Prefix, Some("nope"));

        let sink = Arc::new(Recorder::default());
        let pool = DeliveryPool::new(sink.clone(), Handle::current(), 0);
        let dispatcher = Dispatcher::new(Arc::clone(&reg), pool, "hub");

        let ev = Event::new("m1", Author::user("u1"), "C1", "please deploy");
        let report = dispatcher.dispatch(&ev);

        assert_eq!(report.evaluated, 3);
        let ids: Vec<&str> = report.matched.iter().map(ListenerId::as_str).collect();
        assert_eq!(ids, vec!["b", "a"]);

        settle().await;
        let mut delivered = sink.delivered.lock().unwrap().clone();
        delivered.sort();
        assert_eq!(delivered, vec!["a", "b"]);
        assert_eq!(dispatcher.counters().matches(), 2);
    }

    #[tokio::test]
    async fn inactive_subscriptions_are_not_evaluated() {
        let reg = Arc::new(Registry::new());
        let delivery = DeliveryTarget {
            callback_id: "x".to_string(),
            base_address: "http://localhost".to_string(),
        };
        let mut spec = SubscriptionSpec::new("x", ListenerParameters::new(PatternKind::Any, None), delivery);
        spec.active = false;
        reg.register(Subscription::from_spec(spec).unwrap());

        let pool = DeliveryPool::new(Arc::new(Recorder::default()), Handle::current(), 0);
        let dispatcher = Dispatcher::new(reg, pool, "hub");
        let report = dispatcher.dispatch(&Event::new("m1", Author::user("u1"), "C1", "hi"));

        assert_eq!(report.evaluated, 0);
        assert!(report.matched.is_empty());
    }

    #[tokio::test]
    async fn slow_delivery_does_not_hold_back_others() {
        let reg = Arc::new(Registry::new());
        register(&reg, "slow", PatternKind::Any, None);
        register(&reg, "fast", PatternKind::Any, None);

        let gate = Arc::new(Gate {
            blocked: "slow".to_string(),
            release: Notify::new(),
            done: Mutex::new(Vec::new()),
        });
        let pool = DeliveryPool::new(gate.clone(), Handle::current(), 0);
        let dispatcher = Dispatcher::new(reg, pool, "hub");

        let report = dispatcher.dispatch(&Event::new("m1", Author::user("u1"), "C1", "one"));
        assert_eq!(report.matched.len(), 2);
        let report = dispatcher.dispatch(&Event::new("m2", Author::user("u1"), "C1", "two"));
        assert_eq!(report.matched.len(), 2);

        settle().await;
        assert_eq!(*gate.done.lock().unwrap(), vec!["fast", "fast"]);

        gate.release.notify_waiters();
        settle().await;
        assert_eq!(gate.done.lock().unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_drains_queue_and_counts_drops() {
        let reg = Arc::new(Registry::new());
        register(&reg, "a", PatternKind::Any, None);

        let sink = Arc::new(Recorder::default());
        let pool = DeliveryPool::new(sink.clone(), Handle::current(), 0);
        let dispatcher = Dispatcher::new(reg, pool, "hub");
        let counters = Arc::clone(dispatcher.counters());

        let worker = DispatchWorker::spawn(dispatcher, 16).unwrap();
        for i in 0..5 {
            worker
                .publish(Event::new(format!("m{i}"), Author::user("u1"), "C1", "x"))
                .unwrap();
        }
        worker.stop();

        assert_eq!(counters.dispatched(), 5);
        assert_eq!(worker.dropped(), 0);
        assert!(worker.publish(Event::new("late", Author::user("u1"), "C1", "x")).is_err());
        assert_eq!(worker.dropped(), 0);
    }
}
