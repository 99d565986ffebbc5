use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use triggerhub::hub::{evaluate, Delivery, DeliveryReceipt};
use triggerhub::{
    Author, DeliveryError, DeliverySink, DeliveryTarget, Event, HubConfig, ListenerParameters,
    PatternKind, Subscription, SubscriptionSpec, TriggerHub,
};

struct NoopSink;

#[async_trait]
impl DeliverySink for NoopSink {
    async fn deliver(&self, _delivery: Delivery) -> Result<DeliveryReceipt, DeliveryError> {
        Ok(DeliveryReceipt {
            status: 200,
            elapsed: Duration::ZERO,
        })
    }
}

fn spec(id: &str, kind: PatternKind, value: Option<&str>) -> SubscriptionSpec {
    SubscriptionSpec::new(
        id,
        ListenerParameters::new(kind, value),
        DeliveryTarget {
            callback_id: format!("webhook/{id}"),
            base_address: "http://localhost:5678".to_string(),
        },
    )
}

fn message(content: &str) -> Event {
    Event::new("m1", Author::user("u1"), "C1", content).with_roles(["R1"])
}

fn bench_evaluate(c: &mut Criterion) {
    let cases = [
        ("prefix", PatternKind::Prefix, Some("!run")),
        ("contains", PatternKind::Contains, Some("deploy.prod")),
        ("regex", PatternKind::Regex, Some(r"^ticket-\d{3,6}\b")),
        ("any", PatternKind::Any, None),
    ];
    let event = message("!run ticket-12345 deploy.prod with a reasonably long message body");

    let mut group = c.benchmark_group("matching/evaluate");
    group.throughput(Throughput::Elements(1));
    for (name, kind, value) in cases {
        let sub = Subscription::from_spec(spec(name, kind, value)).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(evaluate(&sub, black_box(&event), "bot-self")));
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let hub = TriggerHub::with_sink(
        HubConfig {
            hub_identity: "bot-self".to_string(),
            ..HubConfig::default()
        },
        Arc::new(NoopSink),
        runtime.handle().clone(),
    )
    .unwrap();

    // 256 listeners, one in sixteen of which matches the benchmark event.
    for i in 0..256u32 {
        let value = if i % 16 == 0 { "!run".to_string() } else { format!("!cmd{i}") };
        hub.apply(triggerhub::ControlRequest::Register(spec(
            &format!("n{i}"),
            PatternKind::Prefix,
            Some(&value),
        )))
        .unwrap();
    }

    let event = message("!run nightly");
    let mut group = c.benchmark_group("matching/dispatch");
    group.throughput(Throughput::Elements(256));
    group.bench_function("256_listeners", |b| {
        b.iter(|| black_box(hub.dispatch(black_box(&event))));
    });
    group.finish();

    hub.shutdown();
}

criterion_group!(matching, bench_evaluate, bench_dispatch);
criterion_main!(matching);
