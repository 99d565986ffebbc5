//! Control-plane channel.
//!
//! External listener processes register and deregister subscriptions here,
//! either session-less through [`ControlPlane::apply`] or through a
//! [`ControlSession`]. A session owns the listeners it registered; closing or
//! dropping it (normal end or abnormal disconnect) deregisters those that it
//! still owns.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ExecutionError, HubResult};
use crate::subscription::{ListenerId, Subscription, SubscriptionSpec};

use super::registry::Registry;

/// Unique identifier for a control-plane session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests accepted from listener processes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Insert or replace the listener's subscription.
    Register(SubscriptionSpec),
    /// Remove the listener's subscription.
    Deregister {
        #[serde(alias = "listenerId", alias = "nodeId")]
        listener_id: String,
    },
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckAction {
    Registered,
    Deregistered,
}

/// Confirmation that a control request was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub listener_id: String,
    pub action: AckAction,
    /// Whether the listener was registered before the request.
    pub existed: bool,
    /// Pattern configuration error; the listener is stored but never matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Hub lifecycle as seen by sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubStatus {
    Running,
    ShuttingDown,
}

/// Hub → listener notifications.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubNotice {
    Ack(Ack),
    /// Request could not be applied.
    Rejected {
        message: String,
        /// Whether resending the same request may succeed.
        #[serde(default)]
        retryable: bool,
    },
    /// Periodic liveness signal.
    Liveness { at: DateTime<Utc> },
    /// The hub is going away; the session will be closed.
    ShuttingDown,
}

/// Applies control requests to the registry.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    registry: Arc<Registry>,
    status: Arc<watch::Sender<HubStatus>>,
}

impl ControlPlane {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        let (status, _) = watch::channel(HubStatus::Running);
        Self {
            registry,
            status: Arc::new(status),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Applies a session-less request. Such registrations are only removed by
    /// an explicit deregistration.
    pub fn apply(&self, request: ControlRequest) -> HubResult<Ack> {
        self.apply_as(request, None)
    }

    /// Opens a session that owns the listeners registered through it.
    #[must_use]
    pub fn open_session(&self) -> ControlSession {
        let session = ControlSession {
            id: SessionId::new(),
            plane: self.clone(),
            owned: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        tracing::debug!(session_id = %session.id, "control session opened");
        session
    }

    /// Current hub status.
    #[must_use]
    pub fn status(&self) -> HubStatus {
        *self.status.borrow()
    }

    /// Receiver that observes status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<HubStatus> {
        self.status.subscribe()
    }

    /// Announces shutdown to every open session.
    pub fn announce_shutdown(&self) {
        self.status.send_replace(HubStatus::ShuttingDown);
    }

    fn apply_as(&self, request: ControlRequest, session: Option<SessionId>) -> HubResult<Ack> {
        match request {
            ControlRequest::Register(spec) => {
                let subscription = Subscription::from_spec(spec)?;
                let listener_id = subscription.listener_id.clone();
                let warning = subscription.config_error().map(ToString::to_string);

                if let Some(w) = &warning {
                    tracing::warn!(listener_id = %listener_id, error = %w, "listener registered with invalid pattern; it will not match");
                }

                let existed = match session {
                    Some(session) => self.registry.register_owned(subscription, session),
                    None => self.registry.register(subscription),
                };
                tracing::info!(listener_id = %listener_id, replaced = existed, "listener registered");

                Ok(Ack {
                    listener_id: listener_id.to_string(),
                    action: AckAction::Registered,
                    existed,
                    warning,
                })
            }
            ControlRequest::Deregister { listener_id } => {
                let listener_id = ListenerId::new(listener_id)?;
                let existed = self.registry.deregister(&listener_id);
                tracing::info!(listener_id = %listener_id, existed, "listener deregistered");

                Ok(Ack {
                    listener_id: listener_id.to_string(),
                    action: AckAction::Deregistered,
                    existed,
                    warning: None,
                })
            }
        }
    }
}

/// One control-plane connection.
///
/// Dropping the session deregisters every listener it still owns.
#[derive(Debug)]
pub struct ControlSession {
    id: SessionId,
    plane: ControlPlane,
    owned: Mutex<HashSet<ListenerId>>,
    closed: AtomicBool,
}

impl ControlSession {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Applies a request on behalf of this session.
    ///
    /// Fails with `Disconnected` once the session is closed.
    pub fn apply(&self, request: ControlRequest) -> HubResult<Ack> {
        // Held across the registry write so `close` cannot drain in between.
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutionError::Disconnected {
                path: "control_session".to_string(),
            }
            .into());
        }

        let ack = self.plane.apply_as(request, Some(self.id))?;
        // Ack ids were validated by `apply_as`.
        if let Ok(listener_id) = ListenerId::new(ack.listener_id.clone()) {
            match ack.action {
                AckAction::Registered => {
                    owned.insert(listener_id);
                }
                AckAction::Deregistered => {
                    owned.remove(&listener_id);
                }
            }
        }
        Ok(ack)
    }

    /// Listener ids currently owned by this session.
    #[must_use]
    pub fn owned_listeners(&self) -> Vec<ListenerId> {
        let owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ListenerId> = owned.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Receiver that observes hub status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<HubStatus> {
        self.plane.watch_status()
    }

    /// Ends the session and deregisters its listeners.
    ///
    /// Idempotent. Listeners re-registered by another session are left alone.
    /// In-flight deliveries are not cancelled.
    pub fn close(&self) {
        let owned: Vec<ListenerId> = {
            let mut guard = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            guard.drain().collect()
        };

        let mut removed = 0usize;
        for listener_id in &owned {
            if self.plane.registry.deregister_owned(listener_id, self.id) {
                removed += 1;
            }
        }
        tracing::info!(session_id = %self.id, removed, "control session closed");
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.close();
    }
}
