use std::sync::Arc;
use std::thread;

use tokio::runtime::Handle;

use triggerhub::{
    AckAction, ControlRequest, DeliveryTarget, HubConfig, HubStatus, ListenerId,
    ListenerParameters, PatternKind, SubscriptionSpec, TriggerHub,
};

fn spec(id: &str, value: &str) -> SubscriptionSpec {
    SubscriptionSpec::new(
        id,
        ListenerParameters::new(PatternKind::Contains, Some(value)),
        DeliveryTarget {
            callback_id: format!("webhook/{id}"),
            base_address: "http://127.0.0.1:9".to_string(),
        },
    )
}

fn lid(id: &str) -> ListenerId {
    ListenerId::new(id).unwrap()
}

#[tokio::test]
async fn register_is_idempotent_and_replaces_in_place() {
    let hub = TriggerHub::start(HubConfig::default(), Handle::current()).unwrap();

    let first = hub.apply(ControlRequest::Register(spec("n1", "a"))).unwrap();
    assert!(!first.existed);
    hub.apply(ControlRequest::Register(spec("n2", "b"))).unwrap();
    let again = hub.apply(ControlRequest::Register(spec("n1", "c"))).unwrap();
    assert!(again.existed);
    assert_eq!(again.action, AckAction::Registered);

    let snapshot = hub.registry().snapshot();
    let ids: Vec<&str> = snapshot.iter().map(|s| s.listener_id.as_str()).collect();
    assert_eq!(ids, vec!["n1", "n2"]);
    assert_eq!(
        snapshot.get(&lid("n1")).unwrap().parameters.value.as_deref(),
        Some("c")
    );

    let gone = hub
        .apply(ControlRequest::Deregister {
            listener_id: "n1".to_string(),
        })
        .unwrap();
    assert!(gone.existed);
    let missing = hub
        .apply(ControlRequest::Deregister {
            listener_id: "n1".to_string(),
        })
        .unwrap();
    assert!(!missing.existed);
    assert_eq!(hub.registry().len(), 1);
}

#[tokio::test]
async fn structural_errors_are_rejected_without_side_effects() {
    let hub = TriggerHub::start(HubConfig::default(), Handle::current()).unwrap();
    let before = hub.registry().snapshot().version();

    let mut bad_address = spec("n1", "a");
    bad_address.delivery.base_address = "ftp://example.com".to_string();
    let err = hub.apply(ControlRequest::Register(bad_address)).unwrap_err();
    assert!(err.is_validation());

    let err = hub
        .apply(ControlRequest::Register(spec("", "a")))
        .unwrap_err();
    assert!(err.is_validation());

    assert!(hub.registry().is_empty());
    assert_eq!(hub.registry().snapshot().version(), before);
}

#[tokio::test]
async fn session_end_removes_only_its_own_listeners() {
    let hub = TriggerHub::start(HubConfig::default(), Handle::current()).unwrap();

    let first = hub.open_session();
    let second = hub.open_session();
    first.apply(ControlRequest::Register(spec("shared", "a"))).unwrap();
    first.apply(ControlRequest::Register(spec("mine", "b"))).unwrap();
    // Taking over a listener moves ownership to the other session.
    second.apply(ControlRequest::Register(spec("shared", "c"))).unwrap();
    hub.apply(ControlRequest::Register(spec("unowned", "d"))).unwrap();

    assert_eq!(first.owned_listeners(), vec![lid("mine"), lid("shared")]);
    drop(first);

    let registry = hub.registry();
    assert!(registry.get(&lid("mine")).is_none());
    assert!(registry.get(&lid("shared")).is_some());
    assert!(registry.get(&lid("unowned")).is_some());

    second.close();
    assert!(registry.get(&lid("shared")).is_none());
    assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sessions_keep_registry_consistent() {
    let hub = Arc::new(TriggerHub::start(HubConfig::default(), Handle::current()).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let hub = Arc::clone(&hub);
            thread::spawn(move || {
                let session = hub.open_session();
                for i in 0..50 {
                    let id = format!("w{w}-{i}");
                    session
                        .apply(ControlRequest::Register(spec(&id, "x")))
                        .unwrap();
                    if i % 2 == 0 {
                        session
                            .apply(ControlRequest::Deregister { listener_id: id })
                            .unwrap();
                    }
                }
                session.owned_listeners().len()
            })
        })
        .collect();

    let reader = {
        let hub = Arc::clone(&hub);
        thread::spawn(move || {
            let mut last_version = 0;
            for _ in 0..200 {
                let snapshot = hub.registry().snapshot();
                assert!(snapshot.version() >= last_version);
                last_version = snapshot.version();
                let mut ids: Vec<&str> = snapshot.iter().map(|s| s.listener_id.as_str()).collect();
                let total = ids.len();
                ids.sort_unstable();
                ids.dedup();
                assert_eq!(ids.len(), total);
            }
        })
    };

    // Each writer's session is dropped at thread exit, removing its listeners.
    for w in writers {
        assert_eq!(w.join().unwrap(), 25);
    }
    reader.join().unwrap();
    assert!(hub.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_announced_to_open_sessions() {
    let hub = TriggerHub::start(HubConfig::default(), Handle::current()).unwrap();
    let session = hub.open_session();
    let mut status = session.watch_status();
    assert_eq!(*status.borrow(), HubStatus::Running);

    hub.shutdown();
    status.changed().await.unwrap();
    assert_eq!(*status.borrow_and_update(), HubStatus::ShuttingDown);
}
