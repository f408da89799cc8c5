//! Operator endpoints for queue inspection and repair.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use notiq_core::{NotificationId, QueueItemId};

use crate::app::{dto, errors, services::AppServices};

/// GET /queue/stats
///
/// Item counts per status; every status is present.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.maintenance.get_queue_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /queue/items?status=failed&channel=email&user_id=X&limit=50&offset=0
///
/// List items newest first.
///
/// Query parameters:
/// - `status`: `pending` (or `queued`), `processing`, `retry`, `sent`, `failed`
/// - `channel`: `email` or `push`
/// - `user_id`: recipient of the referenced notification (UUID)
/// - `limit`: maximum number of items to return (default: 50, max: 1000)
/// - `offset`: pagination offset (default: 0)
pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListItemsQuery>,
) -> axum::response::Response {
    let (filter, pagination) = match query.into_filter() {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    match services.maintenance.find_all(&filter, pagination).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /queue/items/:id/retry
///
/// Give a failed item a fresh attempt budget. 404 for unknown items, 400 for
/// items that are not failed, 409 if the item changed concurrently.
pub async fn retry_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: QueueItemId = match errors::parse_param(&id, "invalid_id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services.maintenance.retry_item(id).await {
        Ok(item) => (StatusCode::OK, Json(item)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /queue/notifications/:id/cancel
///
/// Fail every waiting item of a notification.
pub async fn cancel_notification(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let notification_id: NotificationId = match errors::parse_param(&id, "invalid_id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services
        .maintenance
        .cancel_by_notification(notification_id)
        .await
    {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(dto::CancelResponse {
                notification_id,
                cancelled,
            }),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    use notiq_delivery::{Channel, NewQueueItem, QueueItem, QueueStatus};
    use notiq_infra::QueueStore;

    use super::*;
    use crate::app::build_app;

    async fn call(
        services: Arc<AppServices>,
        method: &str,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = build_app(services)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn failed_item() -> QueueItem {
        let mut item = QueueItem::new(
            NewQueueItem::new(NotificationId::new(), Channel::Email),
            Utc::now(),
        );
        item.attempts = 3;
        item.cancel("smtp down");
        item
    }

    #[tokio::test]
    async fn stats_list_every_status() {
        let (services, _) = AppServices::in_memory();
        let (status, body) = call(Arc::new(services), "GET", "/queue/stats").await;

        assert_eq!(status, StatusCode::OK);
        for s in QueueStatus::ALL {
            assert_eq!(body[s.as_str()], 0);
        }
    }

    #[tokio::test]
    async fn retry_maps_errors_to_status_codes() {
        let (services, store) = AppServices::in_memory();
        let services = Arc::new(services);
        let item = failed_item();
        store.insert(item.clone()).await.unwrap();

        let (status, body) = call(services.clone(), "POST", &format!("/queue/items/{}/retry", item.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "retry");
        assert_eq!(body["attempts"], 0);

        let (status, body) = call(services.clone(), "POST", &format!("/queue/items/{}/retry", item.id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let unknown = QueueItemId::new();
        let (status, body) = call(services.clone(), "POST", &format!("/queue/items/{unknown}/retry")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, body) = call(services, "POST", "/queue/items/not-a-uuid/retry").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_id");
    }

    #[tokio::test]
    async fn list_rejects_unqueueable_channels() {
        let (services, _) = AppServices::in_memory();
        let (status, body) = call(Arc::new(services), "GET", "/queue/items?channel=in_app").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_channel");
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (services, store) = AppServices::in_memory();
        let failed = failed_item();
        store.insert(failed.clone()).await.unwrap();
        store
            .insert(QueueItem::new(
                NewQueueItem::new(NotificationId::new(), Channel::Push),
                Utc::now(),
            ))
            .await
            .unwrap();

        let (status, body) = call(Arc::new(services), "GET", "/queue/items?status=failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["id"], failed.id.to_string());
        assert_eq!(body["has_more"], false);
    }

    #[tokio::test]
    async fn cancel_reports_count() {
        let (services, store) = AppServices::in_memory();
        let notification = NotificationId::new();
        for channel in Channel::ALL {
            store
                .insert(QueueItem::new(NewQueueItem::new(notification, channel), Utc::now()))
                .await
                .unwrap();
        }

        let (status, body) = call(
            Arc::new(services),
            "POST",
            &format!("/queue/notifications/{notification}/cancel"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 2);
    }
}
