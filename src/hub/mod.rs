//! Trigger registration and event-dispatch hub.
//!
//! The hub owns the listener registry, a dispatcher worker fed by a bounded
//! event queue, the delivery pool and the control plane. External listener
//! processes talk to the control plane; the stream source publishes events.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::HubResult;
use crate::event::Event;

/// Outbound delivery sink and pool.
pub mod delivery;
/// Registry snapshots and dispatcher passes.
pub mod dispatcher;
/// Control-plane requests and sessions.
pub mod control;
/// Pattern compilation and evaluation.
pub mod matcher;
/// Listener registry.
pub mod registry;

pub use control::{Ack, AckAction, ControlPlane, ControlRequest, ControlSession, HubNotice, HubStatus, SessionId};
pub use delivery::{Delivery, DeliveryPayload, DeliveryPool, DeliveryReceipt, DeliverySink, HttpDeliverySink};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use matcher::{escape_literal, evaluate, CompiledPattern, MatchOutput, Rejection};
pub use registry::{Registry, RegistrySnapshot};

use dispatcher::DispatchWorker;

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Platform user id of the hub's own account, used by `mention` listeners.
    pub hub_identity: String,
    /// Max queued inbound events before new ones are dropped.
    pub event_queue_capacity: usize,
    /// Max concurrent deliveries; 0 means unbounded.
    pub max_in_flight_deliveries: usize,
    /// Per-request timeout of the HTTP delivery sink.
    pub delivery_timeout: Duration,
    /// Interval of liveness notices sent to control-plane sessions.
    pub liveness_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_identity: String::new(),
            event_queue_capacity: 4096,
            max_in_flight_deliveries: 256,
            delivery_timeout: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(15),
        }
    }
}

/// Point-in-time counters of a running hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub listeners: usize,
    pub registry_version: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub events_queued: usize,
    pub matches: u64,
    pub deliveries_attempted: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
}

/// The running hub.
#[derive(Debug)]
pub struct TriggerHub {
    config: HubConfig,
    registry: Arc<Registry>,
    control: ControlPlane,
    dispatcher: Dispatcher,
    worker: DispatchWorker,
}

impl TriggerHub {
    /// Starts a hub that delivers over HTTP.
    ///
    /// Delivery tasks run on `runtime`.
    pub fn start(config: HubConfig, runtime: Handle) -> HubResult<Self> {
        let sink = HttpDeliverySink::new(config.delivery_timeout)?;
        Self::with_sink(config, Arc::new(sink), runtime)
    }

    /// Starts a hub with a custom delivery sink.
    pub fn with_sink(config: HubConfig, sink: Arc<dyn DeliverySink>, runtime: Handle) -> HubResult<Self> {
        if config.hub_identity.is_empty() {
            tracing::warn!("hub identity not configured; mention listeners will never match");
        }

        let registry = Arc::new(Registry::new());
        let control = ControlPlane::new(Arc::clone(&registry));
        let pool = DeliveryPool::new(sink, runtime, config.max_in_flight_deliveries);
        let dispatcher = Dispatcher::new(Arc::clone(&registry), pool, config.hub_identity.as_str());
        let worker = DispatchWorker::spawn(dispatcher.clone(), config.event_queue_capacity)?;

        tracing::info!(
            hub_identity = %config.hub_identity,
            event_queue_capacity = config.event_queue_capacity,
            max_in_flight_deliveries = config.max_in_flight_deliveries,
            "trigger hub started"
        );

        Ok(Self {
            config,
            registry,
            control,
            dispatcher,
            worker,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub const fn control(&self) -> &ControlPlane {
        &self.control
    }

    /// Applies a session-less control request.
    pub fn apply(&self, request: ControlRequest) -> HubResult<Ack> {
        self.control.apply(request)
    }

    /// Opens a control-plane session.
    #[must_use]
    pub fn open_session(&self) -> ControlSession {
        self.control.open_session()
    }

    /// Queues an inbound event for the dispatcher worker without blocking.
    ///
    /// Fails with `QueueFull` when the queue is at capacity; the event is dropped.
    pub fn publish(&self, event: Event) -> HubResult<()> {
        self.worker.publish(event)
    }

    /// Runs a dispatcher pass inline on the calling thread.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        self.dispatcher.dispatch(event)
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let snapshot = self.registry.snapshot();
        let deliveries = self.dispatcher.deliveries().counters();
        let dispatch = self.dispatcher.counters();
        HubStats {
            listeners: snapshot.len(),
            registry_version: snapshot.version(),
            events_dispatched: dispatch.dispatched(),
            events_dropped: self.worker.dropped(),
            events_queued: self.worker.queued(),
            matches: dispatch.matches(),
            deliveries_attempted: deliveries.attempted(),
            deliveries_succeeded: deliveries.succeeded(),
            deliveries_failed: deliveries.failed(),
        }
    }

    /// Announces shutdown to sessions and drains the event queue.
    ///
    /// Deliveries already submitted keep running on the runtime.
    pub fn shutdown(&self) {
        self.control.announce_shutdown();
        self.worker.stop();
        tracing::info!("trigger hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bounded() {
        let cfg = HubConfig::default();
        assert!(cfg.event_queue_capacity > 0);
        assert!(cfg.max_in_flight_deliveries > 0);
        assert!(cfg.hub_identity.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_flips_status_and_closes_queue() {
        let hub = TriggerHub::start(HubConfig::default(), Handle::current()).unwrap();
        let session = hub.open_session();
        let status = session.watch_status();

        hub.shutdown();

        assert_eq!(*status.borrow(), HubStatus::ShuttingDown);
        assert!(hub
            .publish(Event::new("m", crate::event::Author::user("u"), "C", "x"))
            .is_err());
        assert_eq!(hub.stats().events_dispatched, 0);
    }
}
