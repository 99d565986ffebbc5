//! gRPC transport layer for triggerhub.
//!
//! Control requests, hub notices, events and stats travel as JSON documents in
//! protobuf `bytes` fields; their canonical shapes are the Rust types in this
//! crate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::error::{ExecutionError, HubError, HubResult, TransportError, ValidationError};
use crate::event::Event;
use crate::hub::{ControlRequest, ControlSession, HubNotice, HubStatus, TriggerHub};

pub mod proto {
    tonic::include_proto!("triggerhub");
}

use proto::trigger_hub_server::{TriggerHub as TriggerHubRpc, TriggerHubServer};

pub use proto::trigger_hub_client::TriggerHubClient;

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of any JSON payload carried in a frame.
const MAX_FRAME_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Buffered hub notices per session before the session task waits.
const SESSION_BUFFER: usize = 64;

/// gRPC service implementation backed by a running hub.
pub struct TriggerHubService {
    hub: Arc<TriggerHub>,
}

impl TriggerHubService {
    #[must_use]
    pub fn new(hub: Arc<TriggerHub>) -> Self {
        Self { hub }
    }

    #[must_use]
    pub fn into_server(self) -> TriggerHubServer<Self> {
        TriggerHubServer::new(self)
    }
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> HubResult<T> {
    if bytes.is_empty() {
        return Err(ValidationError::MissingField {
            field: what.to_string(),
        }
        .into());
    }
    if bytes.len() > MAX_FRAME_JSON_BYTES {
        return Err(TransportError::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_JSON_BYTES,
        }
        .into());
    }
    serde_json::from_slice(bytes).map_err(|e| {
        TransportError::DeserializationFailed {
            message: format!("invalid {what}: {e}"),
        }
        .into()
    })
}

fn encode_json<T: Serialize>(value: &T) -> HubResult<Vec<u8>> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::SerializationFailed {
        message: e.to_string(),
    })?;
    if bytes.len() > MAX_FRAME_JSON_BYTES {
        return Err(TransportError::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_JSON_BYTES,
        }
        .into());
    }
    Ok(bytes)
}

fn status_from_hub_error(err: HubError) -> Status {
    match err {
        HubError::Validation(v) => match v {
            ValidationError::FieldTooLong { .. } => Status::out_of_range(v.to_string()),
            _ => Status::invalid_argument(v.to_string()),
        },
        HubError::Transport(t) => match t {
            TransportError::DeserializationFailed { .. } => Status::invalid_argument(t.to_string()),
            TransportError::PayloadTooLarge { .. } => Status::resource_exhausted(t.to_string()),
            TransportError::SerializationFailed { .. } => Status::internal(t.to_string()),
        },
        HubError::Internal { message } => Status::internal(message),
        HubError::Execution(e) => match e {
            ExecutionError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            ExecutionError::Disconnected { .. } => Status::unavailable(e.to_string()),
            ExecutionError::Spawn { .. } => Status::internal(e.to_string()),
        },
    }
}

async fn send_notice(
    tx: &mpsc::Sender<Result<proto::HubFrame, Status>>,
    notice: &HubNotice,
) -> Result<(), ()> {
    let frame = encode_json(notice)
        .map(|notice_json| proto::HubFrame { notice_json })
        .map_err(status_from_hub_error);
    tx.send(frame).await.map_err(|_| ())
}

/// Drives one control-plane session until the listener goes away or the hub
/// shuts down. The session's listeners are deregistered on return.
async fn run_session<S>(
    mut inbound: S,
    session: ControlSession,
    tx: mpsc::Sender<Result<proto::HubFrame, Status>>,
    liveness_interval: Duration,
) where
    S: Stream<Item = Result<proto::ControlFrame, Status>> + Unpin + Send,
{
    let mut status = session.watch_status();
    let mut ticker = tokio::time::interval(liveness_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(frame)) => {
                    let notice = match parse_json::<ControlRequest>(&frame.request_json, "request_json")
                        .and_then(|req| session.apply(req))
                    {
                        Ok(ack) => HubNotice::Ack(ack),
                        Err(e) => HubNotice::Rejected {
                            retryable: e.is_retryable(),
                            message: e.to_string(),
                        },
                    };
                    if send_notice(&tx, &notice).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "control session stream failed");
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let notice = HubNotice::Liveness { at: Utc::now() };
                if send_notice(&tx, &notice).await.is_err() {
                    break;
                }
            }
            changed = status.changed() => {
                let stopping = changed.is_err() || *status.borrow() == HubStatus::ShuttingDown;
                if stopping {
                    let _ = send_notice(&tx, &HubNotice::ShuttingDown).await;
                    break;
                }
            }
        }
    }

    session.close();
}

#[tonic::async_trait]
impl TriggerHubRpc for TriggerHubService {
    type SessionStream = ReceiverStream<Result<proto::HubFrame, Status>>;

    async fn session(
        &self,
        request: Request<Streaming<proto::ControlFrame>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        if self.hub.control().status() == HubStatus::ShuttingDown {
            return Err(Status::unavailable("hub is shutting down"));
        }

        let inbound = request.into_inner();
        let session = self.hub.open_session();
        let liveness = self.hub.config().liveness_interval;
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);

        tokio::spawn(run_session(inbound, session, tx, liveness));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn apply(
        &self,
        request: Request<proto::ControlFrame>,
    ) -> Result<Response<proto::AckFrame>, Status> {
        let req = request.into_inner();
        let control: ControlRequest =
            parse_json(&req.request_json, "request_json").map_err(status_from_hub_error)?;
        let ack = self.hub.apply(control).map_err(status_from_hub_error)?;
        let ack_json = encode_json(&ack).map_err(status_from_hub_error)?;
        Ok(Response::new(proto::AckFrame { ack_json }))
    }

    async fn ingest(
        &self,
        request: Request<Streaming<proto::EventFrame>>,
    ) -> Result<Response<proto::IngestSummary>, Status> {
        let mut inbound = request.into_inner();
        let mut accepted = 0u64;
        let mut rejected = 0u64;

        while let Some(frame) = inbound.message().await? {
            let published = parse_json::<Event>(&frame.event_json, "event_json")
                .and_then(|event| self.hub.publish(event));
            match published {
                Ok(()) => accepted += 1,
                Err(e) => {
                    rejected += 1;
                    tracing::debug!(error = %e, retryable = e.is_retryable(), "ingest frame rejected");
                }
            }
        }

        Ok(Response::new(proto::IngestSummary { accepted, rejected }))
    }

    async fn stats(
        &self,
        _request: Request<proto::StatsRequest>,
    ) -> Result<Response<proto::StatsResponse>, Status> {
        let stats_json = encode_json(&self.hub.stats()).map_err(status_from_hub_error)?;
        Ok(Response::new(proto::StatsResponse { stats_json }))
    }
}
