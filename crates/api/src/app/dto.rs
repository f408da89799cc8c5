use serde::{Deserialize, Serialize};

use notiq_core::{NotificationId, UserId};
use notiq_delivery::{Channel, QueueStatus};
use notiq_infra::{Pagination, QueueFilter};

use crate::app::errors;

/// `GET /queue/items` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ListItemsQuery {
    pub status: Option<String>,
    pub channel: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListItemsQuery {
    /// Validate the raw parameters into a store filter and pagination.
    pub fn into_filter(self) -> Result<(QueueFilter, Pagination), axum::response::Response> {
        let mut filter = QueueFilter::default();
        if let Some(raw) = self.status.as_deref() {
            filter = filter.status(errors::parse_param::<QueueStatus>(raw, "invalid_status")?);
        }
        if let Some(raw) = self.channel.as_deref() {
            filter = filter.channel(errors::parse_param::<Channel>(raw, "invalid_channel")?);
        }
        if let Some(raw) = self.user_id.as_deref() {
            filter = filter.user(errors::parse_param::<UserId>(raw, "invalid_user_id")?);
        }
        Ok((filter, Pagination::new(self.limit, self.offset)))
    }
}

/// `POST /queue/notifications/:id/cancel` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub notification_id: NotificationId,
    pub cancelled: u64,
}
