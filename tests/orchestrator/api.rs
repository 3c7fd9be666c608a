use std::sync::{Arc, atomic::{AtomicBool, Ordering}};

use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use frameroute::{
    api::{ApiState, control_router},
    orchestrator::types::RoutingStrategy,
};

use crate::support::Harness;

struct ApiFixture {
    base_url: String,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    client: reqwest::Client,
}

impl ApiFixture {
    async fn start(harness: &Harness) -> Self {
        let ready = Arc::new(AtomicBool::new(true));
        let state = Arc::new(ApiState {
            registry: harness.registry.clone(),
            circuits: harness.circuits.clone(),
            router: harness.router.clone(),
            gate: harness.gate.clone(),
            depths: harness.depths.clone(),
            stats: harness.stats.clone(),
            prometheus: None,
            ready: ready.clone(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let server = tokio::spawn(
            axum::serve(listener, control_router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .into_future(),
        );

        Self {
            base_url: format!("http://{addr}"),
            ready,
            cancel,
            server,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.server.await;
    }
}

fn processor_body(id: &str) -> Value {
    json!({
        "id": id,
        "capabilities": ["face_detection"],
        "capacity": 4,
    })
}

#[tokio::test]
async fn given_valid_spec_when_registered_twice_then_second_attempt_conflicts() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let api = ApiFixture::start(&harness).await;

    let created = api
        .client
        .post(api.url("/processors/register"))
        .json(&processor_body("p1"))
        .send()
        .await
        .expect("request");
    assert_eq!(created.status(), 201);
    let body: Value = created.json().await.expect("json");
    assert_eq!(body["queue"], "frames:ready:p1");

    let duplicate = api
        .client
        .post(api.url("/processors/register"))
        .json(&processor_body("p1"))
        .send()
        .await
        .expect("request");
    assert_eq!(duplicate.status(), 409);

    // The first registration must be untouched by the rejected duplicate.
    assert_eq!(harness.registry.get("p1").expect("registered").capacity, 4);
    api.stop().await;
}

#[tokio::test]
async fn given_invalid_spec_when_registered_then_request_is_rejected() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let api = ApiFixture::start(&harness).await;

    let response = api
        .client
        .post(api.url("/processors/register"))
        .json(&json!({ "id": "p1", "capacity": 0 }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
    api.stop().await;
}

#[tokio::test]
async fn given_unknown_processor_when_read_or_deleted_then_not_found() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let api = ApiFixture::start(&harness).await;

    let read = api
        .client
        .get(api.url("/processors/ghost"))
        .send()
        .await
        .expect("request");
    assert_eq!(read.status(), 404);

    let deleted = api
        .client
        .delete(api.url("/processors/ghost"))
        .send()
        .await
        .expect("request");
    assert_eq!(deleted.status(), 404);
    api.stop().await;
}

#[tokio::test]
async fn given_registered_processor_when_unregistered_then_state_is_fully_cleared() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.circuits.record_failure("p1");
    let api = ApiFixture::start(&harness).await;

    let created = api
        .client
        .post(api.url("/processors/register"))
        .json(&processor_body("p1"))
        .send()
        .await
        .expect("request");
    assert_eq!(created.status(), 201);

    let deleted = api
        .client
        .delete(api.url("/processors/p1"))
        .send()
        .await
        .expect("request");
    assert_eq!(deleted.status(), 204);

    assert!(harness.registry.get("p1").is_none());
    assert_eq!(harness.circuits.summary("p1").consecutive_failures, 0);
    api.stop().await;
}

#[tokio::test]
async fn given_pause_and_resume_when_status_read_then_mode_and_rate_follow() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let api = ApiFixture::start(&harness).await;

    let paused = api
        .client
        .post(api.url("/control/pause"))
        .send()
        .await
        .expect("request");
    assert_eq!(paused.status(), 200);
    let body: Value = paused.json().await.expect("json");
    assert_eq!(body["mode"], "paused");
    assert_eq!(body["consumption_rate"], 0.0);

    let resumed = api
        .client
        .post(api.url("/control/resume"))
        .send()
        .await
        .expect("request");
    let body: Value = resumed.json().await.expect("json");
    assert_eq!(body["mode"], "running");
    assert_eq!(body["consumption_rate"], 1.0);

    let status = api
        .client
        .get(api.url("/control/status"))
        .send()
        .await
        .expect("request");
    let body: Value = status.json().await.expect("json");
    assert_eq!(body["pressure"], "normal");
    api.stop().await;
}

#[tokio::test]
async fn given_readiness_flag_when_toggled_then_liveness_follows() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let api = ApiFixture::start(&harness).await;

    let live = api.client.get(api.url("/health")).send().await.expect("request");
    assert_eq!(live.status(), 200);

    api.ready.store(false, Ordering::Release);
    let starting = api.client.get(api.url("/health")).send().await.expect("request");
    assert_eq!(starting.status(), 503);
    api.stop().await;
}

#[tokio::test]
async fn given_capability_filter_when_listing_then_only_matching_processors_return() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &["face_detection"], 10).await;
    harness.register_healthy("p2", &["object_detection"], 10).await;
    let api = ApiFixture::start(&harness).await;

    let listed = api
        .client
        .get(api.url("/processors?capability=face_detection"))
        .send()
        .await
        .expect("request");
    assert_eq!(listed.status(), 200);
    let body: Value = listed.json().await.expect("json");
    let ids: Vec<&str> = body
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|item| item["id"].as_str())
        .collect();
    assert_eq!(ids, ["p1"]);
    api.stop().await;
}

#[tokio::test]
async fn given_registered_fleet_when_stats_read_then_counts_are_reported() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;
    harness.register_healthy("p2", &[], 10).await;
    harness.depths.set("p1", 3);
    let api = ApiFixture::start(&harness).await;

    let stats = api
        .client
        .get(api.url("/frames/stats"))
        .send()
        .await
        .expect("request");
    assert_eq!(stats.status(), 200);
    let body: Value = stats.json().await.expect("json");
    assert_eq!(body["registered_processors"], 2);
    assert_eq!(body["healthy_processors"], 2);
    assert_eq!(body["queue_depths"]["p1"], 3);

    let backlogs = api
        .client
        .get(api.url("/frames/backlogs"))
        .send()
        .await
        .expect("request");
    let body: Value = backlogs.json().await.expect("json");
    assert_eq!(body["p1"], 3);
    api.stop().await;
}
