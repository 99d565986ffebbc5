//! # triggerhub - trigger registration and event-dispatch hub
//!
//! triggerhub watches a live stream of chat messages and, for each message,
//! decides which dynamically registered listeners should be notified, then
//! delivers the notification to each of them with an HTTP callback.
//!
//! ## Core Concepts
//!
//! - **Subscription**: a listener's matching rule (pattern kind, value, case
//!   sensitivity, role/channel filters) and its delivery target
//! - **Registry**: process-wide listener map with snapshot reads
//! - **Dispatcher**: evaluates one event against a registry snapshot and
//!   submits fire-and-forget deliveries for every match
//! - **Control plane**: register/deregister requests, optionally bound to a
//!   session that cleans up its listeners when it ends
//!
//! ## Usage
//!
//! ```rust,ignore
//! use triggerhub::{Author, ControlRequest, Event, HubConfig, TriggerHub};
//!
//! let hub = TriggerHub::start(HubConfig::default(), tokio::runtime::Handle::current())?;
//! hub.apply(ControlRequest::Register(spec))?;
//! hub.publish(Event::new("m1", Author::user("u1"), "C1", "!run now"))?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod event;
pub mod hub;
pub mod subscription;

/// gRPC control-plane and ingest transport.
#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use error::{DeliveryError, ExecutionError, HubError, HubResult, TransportError, ValidationError};
pub use event::{Author, Event};
pub use hub::{
    Ack, AckAction, ControlPlane, ControlRequest, ControlSession, DeliverySink, DispatchReport,
    HttpDeliverySink, HubConfig, HubNotice, HubStats, HubStatus, MatchOutput, Registry,
    RegistrySnapshot, TriggerHub,
};
pub use subscription::{
    DeliveryTarget, ListenerId, ListenerParameters, PatternKind, Subscription, SubscriptionSpec,
};
