//! Delivery of matched events.
//!
//! Policy: delivery is fire-and-forget. Every match is handed to the
//! [`DeliveryPool`], which runs it as an independent task. Failures are logged
//! and counted; they are never retried and never reported back to the
//! dispatcher or to other listeners. In-flight deliveries are not cancelled
//! when their listener is deregistered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{DeliveryError, HubError, HubResult};
use crate::event::Event;
use crate::subscription::{DeliveryTarget, ListenerId, PatternKind, Subscription};

/// JSON body posted to a listener's callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// Message id.
    pub id: String,
    pub content: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The subscription value that was listened for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_value: Option<String>,
    pub listener_id: String,
    pub pattern: PatternKind,
}

impl DeliveryPayload {
    #[must_use]
    pub fn from_match(sub: &Subscription, event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            content: event.content.clone(),
            channel_id: event.channel_id.clone(),
            author_id: event.author.id.clone(),
            author_name: event.author.username.clone(),
            timestamp: event.timestamp,
            listen_value: sub.parameters.value.clone(),
            listener_id: sub.listener_id.to_string(),
            pattern: sub.parameters.pattern,
        }
    }
}

/// One matched event bound for one listener.
///
/// Owns everything it needs; shares no state with the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub listener_id: ListenerId,
    pub target: DeliveryTarget,
    pub payload: DeliveryPayload,
}

impl Delivery {
    #[must_use]
    pub fn new(sub: &Subscription, event: &Event) -> Self {
        Self {
            listener_id: sub.listener_id.clone(),
            target: sub.delivery.clone(),
            payload: DeliveryPayload::from_match(sub, event),
        }
    }
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub elapsed: Duration,
}

/// Performs the outbound notification for a match.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Delivers a single match. Errors are observed by the pool only.
    async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Posts deliveries as JSON to `{base_address}/{callback_id}`.
#[derive(Debug, Clone)]
pub struct HttpDeliverySink {
    client: reqwest::Client,
}

impl HttpDeliverySink {
    /// Builds a sink whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("triggerhub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliverySink for HttpDeliverySink {
    async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError> {
        let url = delivery.target.url();
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(&delivery.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout { url: url.clone() }
                } else {
                    DeliveryError::Request {
                        url: url.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(DeliveryReceipt {
            status: status.as_u16(),
            elapsed: started.elapsed(),
        })
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryCounters {
    #[must_use]
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliveries submitted but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.attempted()
            .saturating_sub(self.succeeded())
            .saturating_sub(self.failed())
    }
}

/// Settles one attempted delivery exactly once.
///
/// A task dropped before finishing (runtime shut down, task aborted) counts as
/// failed so `in_flight` drains back to zero.
struct Attempt {
    counters: Arc<DeliveryCounters>,
    settled: bool,
}

impl Attempt {
    fn start(counters: &Arc<DeliveryCounters>) -> Self {
        counters.attempted.fetch_add(1, Ordering::Relaxed);
        Self {
            counters: Arc::clone(counters),
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.settled {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Runs deliveries as independent tasks on a tokio runtime.
#[derive(Clone)]
pub struct DeliveryPool {
    sink: Arc<dyn DeliverySink>,
    runtime: Handle,
    limit: Option<Arc<Semaphore>>,
    counters: Arc<DeliveryCounters>,
}

impl std::fmt::Debug for DeliveryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPool")
            .field("limit", &self.limit.as_ref().map(|s| s.available_permits()))
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl DeliveryPool {
    /// `max_in_flight = 0` leaves concurrency unbounded.
    #[must_use]
    pub fn new(sink: Arc<dyn DeliverySink>, runtime: Handle, max_in_flight: usize) -> Self {
        let limit = match max_in_flight {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            sink,
            runtime,
            limit,
            counters: Arc::new(DeliveryCounters::default()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<DeliveryCounters> {
        &self.counters
    }

    /// Starts a delivery and returns immediately.
    ///
    /// The concurrency permit is acquired inside the task, so submitting never
    /// waits. The returned handle may be dropped.
    pub fn submit(&self, delivery: Delivery) -> JoinHandle<()> {
        let attempt = Attempt::start(&self.counters);
        let sink = Arc::clone(&self.sink);
        let limit = self.limit.clone();

        self.runtime.spawn(async move {
            let _permit = match limit {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => None,
                },
                None => None,
            };

            let listener_id = delivery.listener_id.clone();
            let url = delivery.target.url();
            match sink.deliver(delivery).await {
                Ok(receipt) => {
                    attempt.succeed();
                    tracing::debug!(
                        listener_id = %listener_id,
                        status = receipt.status,
                        elapsed_ms = receipt.elapsed.as_millis() as u64,
                        "delivery completed"
                    );
                }
                Err(e) => {
                    drop(attempt);
                    tracing::warn!(listener_id = %listener_id, url = %url, error = %e, "delivery failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::event::Author;
    use crate::subscription::{ListenerParameters, SubscriptionSpec};

    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscription(base: &str) -> Subscription {
        let params = ListenerParameters::new(PatternKind::Prefix, Some("!run"));
        let delivery = DeliveryTarget {
            callback_id: "webhook/wh-1/webhook".to_string(),
            base_address: base.to_string(),
        };
        Subscription::from_spec(SubscriptionSpec::new("node-1", params, delivery)).unwrap()
    }

    fn event() -> Event {
        let mut author = Author::user("u1");
        author.username = Some("alice".to_string());
        Event::new("m1", author, "C1", "!run now")
    }

    #[test]
    fn payload_carries_listener_facing_fields() {
        let sub = subscription("http://localhost:5678");
        let payload = DeliveryPayload::from_match(&sub, &event());
        let v = serde_json::to_value(&payload).unwrap();

        assert_eq!(v["id"], "m1");
        assert_eq!(v["channelId"], "C1");
        assert_eq!(v["authorId"], "u1");
        assert_eq!(v["authorName"], "alice");
        assert_eq!(v["listenValue"], "!run");
        assert_eq!(v["listenerId"], "node-1");
        assert_eq!(v["pattern"], "prefix");
    }

    #[tokio::test]
    async fn http_sink_posts_to_joined_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/wh-1/webhook"))
            .and(body_partial_json(serde_json::json!({ "content": "!run now" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpDeliverySink::new(Duration::from_secs(5)).unwrap();
        let receipt = sink
            .deliver(Delivery::new(&subscription(&server.uri()), &event()))
            .await
            .unwrap();
        assert_eq!(receipt.status, 200);
    }

    #[tokio::test]
    async fn http_sink_reports_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpDeliverySink::new(Duration::from_secs(5)).unwrap();
        let err = sink
            .deliver(Delivery::new(&subscription(&server.uri()), &event()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Status { status: 503, .. }));
    }

    struct FlakySink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliverySink for FlakySink {
        async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError> {
            self.seen
                .lock()
                .unwrap()
                .push(delivery.listener_id.to_string());
            Err(DeliveryError::Request {
                url: delivery.target.url(),
                message: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn pool_counts_failures_without_propagating() {
        let sink = Arc::new(FlakySink {
            seen: Mutex::new(Vec::new()),
        });
        let pool = DeliveryPool::new(sink.clone(), Handle::current(), 2);

        let sub = subscription("http://localhost:5678");
        let handles: Vec<_> = (0..3)
            .map(|_| pool.submit(Delivery::new(&sub, &event())))
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(pool.counters().attempted(), 3);
        assert_eq!(pool.counters().failed(), 3);
        assert_eq!(pool.counters().in_flight(), 0);
        assert_eq!(sink.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn pool_on_stopped_runtime_settles_as_failed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let sink = Arc::new(FlakySink {
            seen: Mutex::new(Vec::new()),
        });
        let pool = DeliveryPool::new(sink.clone(), handle, 0);
        drop(pool.submit(Delivery::new(&subscription("http://localhost:5678"), &event())));

        assert_eq!(pool.counters().attempted(), 1);
        assert_eq!(pool.counters().failed(), 1);
        assert_eq!(pool.counters().in_flight(), 0);
        assert!(sink.seen.lock().unwrap().is_empty());
    }
}
