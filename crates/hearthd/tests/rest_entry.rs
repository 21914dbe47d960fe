use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use hearthd::Config;
use hearthd::EntryState;
use hearthd::Runtime;
use hearthd::integrations::RestSource;
use hearthd_coordinator::UpdateCoordinator;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Meter {
    reading: u64,
}

/// Serves an ever-increasing meter reading.
async fn spawn_meter() -> (String, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let app = Router::new()
        .route(
            "/meter",
            get(|State(hits): State<Arc<AtomicU64>>| async move {
                let reading = hits.fetch_add(1, Ordering::SeqCst) + 1;
                Json(serde_json::json!({ "reading": reading }))
            }),
        )
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}/meter"), hits)
}

#[tokio::test]
async fn test_configured_entry_polls_rest_endpoint() {
    let (url, hits) = spawn_meter().await;
    let config: Config = format!(
        r#"
        [entries.meter]
        url = "{url}"
        update_interval_secs = 0.1
        request_refresh = {{ cooldown_secs = 0.05 }}
        "#
    )
    .parse()
    .unwrap();
    let entry = &config.entries["meter"];

    let source = RestSource::<Meter>::new(reqwest::Client::new(), entry.url.parse().unwrap());
    let coordinator = UpdateCoordinator::new("meter", entry.coordinator.clone(), source);
    let mut updates = coordinator.subscribe();

    let runtime = Runtime::new();
    assert_eq!(
        runtime.add_entry("meter", coordinator.clone()).await,
        EntryState::Loaded
    );
    assert_eq!(coordinator.data().unwrap().reading, 1);

    // The first-refresh notification, then two polls.
    let mut last = 1;
    for _ in 0..3 {
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("poll did not happen")
            .unwrap();
        assert!(update.success);
        last = update.data.unwrap().reading;
    }
    assert!(last >= 3, "last reading {last}");

    runtime.shutdown();
    let polled = hits.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(hits.load(Ordering::SeqCst) <= polled + 1);
}

#[tokio::test]
async fn test_unreachable_entry_waits_for_retry() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = RestSource::<Meter>::new(
        reqwest::Client::new(),
        format!("http://{addr}/meter").parse().unwrap(),
    );
    let runtime = Runtime::new();
    let state = runtime
        .add_entry(
            "offline",
            UpdateCoordinator::new("offline", Default::default(), source),
        )
        .await;

    assert_eq!(state, EntryState::SetupRetry);
    let snapshot = runtime.entry("offline").unwrap();
    assert_eq!(snapshot.tries, 1);
    assert!(snapshot.last_error.unwrap().starts_with("update failed"));

    runtime.shutdown();
}
