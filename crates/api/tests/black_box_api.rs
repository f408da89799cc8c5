use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use notiq_api::app::{build_app, services::AppServices};
use notiq_core::NotificationId;
use notiq_delivery::{Channel, NewQueueItem, RetryPolicy};
use notiq_infra::{
    ChannelDispatcher, DispatchError, InMemoryQueueStore, Maintenance, Producer, QueueProcessor,
    QueueRunner, QueueRunnerHandle, RunnerConfig,
};

/// Transport that rejects every message as a transient failure.
struct GatewayDown;

#[async_trait]
impl ChannelDispatcher for GatewayDown {
    async fn send(&self, _: Channel, _: NotificationId) -> Result<bool, DispatchError> {
        Err(DispatchError::transport("gateway unavailable"))
    }
}

struct TestServer {
    base_url: String,
    store: Arc<InMemoryQueueStore>,
    handle: tokio::task::JoinHandle<()>,
    runner: Option<QueueRunnerHandle>,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = Arc::new(InMemoryQueueStore::new());

        // Same router as prod, in-memory store, a runner that retries within milliseconds.
        let app = build_app(Arc::new(AppServices::new(store.clone(), "in_memory")));
        let processor = QueueProcessor::new(store.clone(), GatewayDown)
            .with_policy(RetryPolicy::new(Duration::from_millis(1), 1));
        let runner = QueueRunner::new(processor, Maintenance::new(store.clone()))
            .spawn(RunnerConfig::default().with_poll_interval(Duration::from_millis(10)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            handle,
            runner: Some(runner),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        // Dropping the runner handle stops the runner.
        self.runner.take();
    }
}

async fn stats(client: &reqwest::Client, base_url: &str) -> serde_json::Value {
    client
        .get(format!("{}/queue/stats", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_failed(client: &reqwest::Client, base_url: &str, expected: u64) {
    for _ in 0..300 {
        if stats(client, base_url).await["failed"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not reach {expected} failed item(s) in time");
}

#[tokio::test]
async fn health_reports_backend() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "in_memory");
}

#[tokio::test]
async fn dead_item_can_be_inspected_and_retried() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let item = Producer::new(srv.store.clone())
        .enqueue(NewQueueItem::new(NotificationId::new(), Channel::Email).priority(5))
        .await
        .unwrap();

    // Three failures in a row leave the item dead.
    wait_for_failed(&client, &srv.base_url, 1).await;

    let res = client
        .get(format!("{}/queue/items?status=failed&channel=email", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 1);
    let dead = &page["items"][0];
    assert_eq!(dead["id"], item.id.to_string());
    assert_eq!(dead["attempts"], 3);
    assert_eq!(dead["error_message"], "transport error: gateway unavailable");

    // Manual retry puts it back in line; the runner exhausts it again.
    let res = client
        .post(format!("{}/queue/items/{}/retry", srv.base_url, item.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let retried: serde_json::Value = res.json().await.unwrap();
    assert_eq!(retried["attempts"], 0);

    wait_for_failed(&client, &srv.base_url, 1).await;
    let body = stats(&client, &srv.base_url).await;
    assert_eq!(body["sent"], 0);
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn cancel_then_retry_reports_errors_as_json() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let scheduled = chrono::Utc::now() + chrono::Duration::hours(1);
    let notification = NotificationId::new();
    let item = Producer::new(srv.store.clone())
        .enqueue(NewQueueItem::new(notification, Channel::Push).scheduled_for(scheduled))
        .await
        .unwrap();

    let res = client
        .post(format!("{}/queue/items/{}/retry", srv.base_url, item.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(format!("{}/queue/notifications/{}/cancel", srv.base_url, notification))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], 1);

    let res = client
        .get(format!("{}/queue/items?status=failed", srv.base_url))
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["items"][0]["error_message"], "Cancelled");
}
