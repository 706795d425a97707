// Supervisor + registry integration tests against a mock HTTP service.
//
// Timings here are real (no paused clock: wiremock does real I/O), so
// intervals are short and assertions use generous margins.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use skydeck_api::{
    AdapterClient, Credentials, MemoryInstanceStore, ServiceInstance, ServiceKind,
    TransportConfig,
};
use skydeck_core::{
    ConnectionRegistry, ConnectionState, Payload, SupervisorConfig, Topic, TopicBroker, WireFrame,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        debounce: Duration::from_millis(20),
        reconcile_interval: Duration::from_millis(100),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
    }
}

fn sonarr_instance(server: &MockServer) -> ServiceInstance {
    ServiceInstance {
        id: "tv".into(),
        kind: ServiceKind::Sonarr,
        name: "Sonarr".into(),
        base_url: server.uri().parse().expect("mock uri"),
        credentials: Credentials::Token {
            token: SecretString::from("api-key".to_owned()),
        },
        enabled: true,
    }
}

fn wire(server: &MockServer) -> (ConnectionRegistry, TopicBroker) {
    let store = Arc::new(MemoryInstanceStore::new());
    store.insert(sonarr_instance(server));

    let broker = TopicBroker::new();
    let client = AdapterClient::new(&TransportConfig::default()).expect("client");
    let (registry, _reauth) = ConnectionRegistry::wire(
        store,
        Arc::new(broker.clone()),
        client,
        Arc::new(fast_config()),
    );
    (registry, broker)
}

async fn mount_queue(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/v3/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn recv_frame(rx: &mut mpsc::Receiver<WireFrame>) -> WireFrame {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
}

// ── Lifecycle invariants ────────────────────────────────────────────

#[tokio::test]
async fn one_supervisor_per_instance_regardless_of_subscriber_count() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [] })).await;
    let (registry, _broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let lease_a = registry.acquire(&topic).expect("acquire");
    let lease_b = registry.acquire(&topic).expect("acquire");
    let lease_c = registry.acquire(&topic).expect("acquire");

    assert_eq!(registry.supervisor_count(), 1);

    drop(lease_a);
    drop(lease_b);
    assert_eq!(
        registry.supervisor_count(),
        1,
        "supervisor must survive while subscribers remain"
    );

    drop(lease_c);
    assert_eq!(registry.supervisor_count(), 0);
}

#[tokio::test]
async fn two_streams_of_one_instance_share_a_supervisor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Items/Counts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "MovieCount": 3 })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryInstanceStore::new());
    store.insert(ServiceInstance {
        id: "jf-1".into(),
        kind: ServiceKind::Jellyfin,
        name: "Jellyfin".into(),
        base_url: server.uri().parse().expect("mock uri"),
        credentials: Credentials::Token {
            token: SecretString::from("tok".to_owned()),
        },
        enabled: true,
    });
    let broker = TopicBroker::new();
    let client = AdapterClient::new(&TransportConfig::default()).expect("client");
    let (registry, _reauth) = ConnectionRegistry::wire(
        store,
        Arc::new(broker.clone()),
        client,
        Arc::new(fast_config()),
    );

    let sessions = Topic::parse("jellyfin:jf-1").expect("topic");
    let library = Topic::parse("jellyfin:library:jf-1").expect("topic");

    let (tx, mut rx) = mpsc::channel(32);
    let _sub = broker.subscribe(&library, uuid::Uuid::new_v4(), tx);

    let lease_sessions = registry.acquire(&sessions).expect("acquire");
    let _lease_library = registry.acquire(&library).expect("acquire");
    assert_eq!(registry.supervisor_count(), 1);

    // The library stream, added second, still gets fetched and published.
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.topic, "jellyfin:library:jf-1");
    assert!(matches!(frame.payload, Payload::Data { .. }));

    // Dropping the other stream's lease keeps the supervisor alive.
    drop(lease_sessions);
    assert_eq!(registry.supervisor_count(), 1);
}

#[tokio::test]
async fn last_release_transitions_the_supervisor_to_closed() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [] })).await;
    let (registry, _broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let lease = registry.acquire(&topic).expect("acquire");

    let mut state = registry
        .watch_state(ServiceKind::Sonarr, &"tv".into())
        .expect("supervisor exists");

    drop(lease);

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            if *state.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                // Sender dropped after Closed was published.
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "supervisor must reach Closed");
}

#[tokio::test]
async fn retire_shuts_down_despite_live_leases() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [] })).await;
    let (registry, _broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let lease = registry.acquire(&topic).expect("acquire");

    registry.retire(ServiceKind::Sonarr, &"tv".into());
    assert_eq!(registry.supervisor_count(), 0);

    // Releasing a lease for a retired supervisor is a no-op.
    drop(lease);
    assert_eq!(registry.supervisor_count(), 0);
}

// ── Fetch behavior ──────────────────────────────────────────────────

#[tokio::test]
async fn reconciliation_fetches_on_a_fixed_cadence_without_push() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [] })).await;
    let (registry, _broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let _lease = registry.acquire(&topic).expect("acquire");

    // Initial fetch + one per 100ms reconcile tick.
    sleep(Duration::from_millis(450)).await;

    let hits = server.received_requests().await.expect("recording").len();
    assert!(
        (3..=7).contains(&hits),
        "expected steady reconcile fetches, saw {hits}"
    );
}

#[tokio::test]
async fn identical_snapshots_are_suppressed() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [{ "id": 1 }] })).await;
    let (registry, broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let (tx, mut rx) = mpsc::channel(32);
    let _lease = registry.acquire(&topic).expect("acquire");
    let _sub = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx);

    // Several reconcile rounds, all returning the same body.
    sleep(Duration::from_millis(350)).await;

    let mut data_frames = 0;
    while let Ok(frame) = rx.try_recv() {
        if matches!(frame.payload, Payload::Data { .. }) {
            data_frames += 1;
        }
    }
    assert_eq!(
        data_frames, 1,
        "unchanged snapshots must not be re-delivered"
    );
}

#[tokio::test]
async fn late_joiner_gets_the_retained_snapshot_before_any_new_fetch() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [{ "id": 7 }] })).await;
    let (registry, broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let (tx_a, mut rx_a) = mpsc::channel(32);
    let _lease = registry.acquire(&topic).expect("acquire");
    let _sub_a = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx_a);

    // Wait for the first snapshot to land.
    let first = recv_frame(&mut rx_a).await;
    assert!(matches!(first.payload, Payload::Data { .. }));

    // The late joiner must see it synchronously on subscribe.
    let (tx_b, mut rx_b) = mpsc::channel(32);
    let _sub_b = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx_b);
    let replay = rx_b.try_recv().expect("retained frame, immediately");
    assert_eq!(replay.payload, first.payload);
}

// ── Degradation ─────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_credential_broadcasts_an_auth_error_frame() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/queue"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let (registry, broker) = wire(&server);

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let (tx, mut rx) = mpsc::channel(32);
    let _sub = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx);
    let _lease = registry.acquire(&topic).expect("acquire");

    let frame = recv_frame(&mut rx).await;
    let Payload::Error {
        error, auth_error, config_error, ..
    } = frame.payload
    else {
        panic!("expected an error frame, got {:?}", frame.payload);
    };
    assert!(error);
    assert_eq!(auth_error, Some(true));
    assert_eq!(config_error, None);

    let state = registry.state(ServiceKind::Sonarr, &"tv".into());
    assert_eq!(
        state,
        Some(ConnectionState::Degraded(
            skydeck_core::DegradedReason::Auth
        ))
    );
}

#[tokio::test]
async fn unreachable_service_degrades_and_recovers_on_its_own() {
    let server = MockServer::start().await;
    let (registry, broker) = wire(&server);

    // A failing upstream forces the degraded path; it heals later.
    Mock::given(method("GET"))
        .and(path("/api/v3/queue"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let (tx, mut rx) = mpsc::channel(64);
    let _sub = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx);
    let _lease = registry.acquire(&topic).expect("acquire");

    // Degraded(network) frame first.
    let frame = recv_frame(&mut rx).await;
    assert!(frame.payload.is_error());

    // Upstream heals; the supervisor's own retry must recover without
    // any subscriber intervention.
    server.reset().await;
    mount_queue(&server, json!({ "records": [] })).await;

    let frame = recv_frame(&mut rx).await;
    assert!(
        matches!(frame.payload, Payload::Connected { .. } | Payload::Data { .. }),
        "expected recovery frame, got {:?}",
        frame.payload
    );

    let healthy = timeout(Duration::from_secs(2), async {
        loop {
            if registry.state(ServiceKind::Sonarr, &"tv".into())
                == Some(ConnectionState::Live)
            {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(healthy.is_ok(), "supervisor must return to Live");
}

#[tokio::test]
async fn disabled_instance_degrades_as_config() {
    let server = MockServer::start().await;
    mount_queue(&server, json!({ "records": [] })).await;

    let store = Arc::new(MemoryInstanceStore::new());
    let mut instance = sonarr_instance(&server);
    instance.enabled = false;
    store.insert(instance);

    let broker = TopicBroker::new();
    let client = AdapterClient::new(&TransportConfig::default()).expect("client");
    let (registry, _reauth) = ConnectionRegistry::wire(
        store,
        Arc::new(broker.clone()),
        client,
        Arc::new(fast_config()),
    );

    let topic = Topic::parse("sonarr:tv").expect("topic");
    let (tx, mut rx) = mpsc::channel(32);
    let _sub = broker.subscribe(&topic, uuid::Uuid::new_v4(), tx);
    let _lease = registry.acquire(&topic).expect("acquire");

    let frame = recv_frame(&mut rx).await;
    let Payload::Error { config_error, .. } = frame.payload else {
        panic!("expected config error frame");
    };
    assert_eq!(config_error, Some(true));
}
