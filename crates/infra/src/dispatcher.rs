//! Channel dispatch contract consumed by the worker.
//!
//! Transports (SMTP, push gateways) live outside this crate. They plug in as
//! [`ChannelSender`]s behind a [`ChannelRouter`], or implement
//! [`ChannelDispatcher`] directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use notiq_core::NotificationId;
use notiq_delivery::{Channel, DeliveryOutcome};

/// Dispatch failure.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The referenced notification no longer exists. Retrying cannot help.
    #[error("notification not found: {0}")]
    NotificationNotFound(NotificationId),

    #[error("no sender registered for channel {0}")]
    NoSender(Channel),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the failure will recur on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DispatchError::NotificationNotFound(_))
    }
}

/// Hands one notification to the transport of a channel.
///
/// `Ok(true)` means the transport accepted the message. `Ok(false)` and any
/// error count as a failed attempt. Implementations fetch the notification
/// content themselves from `notification_id`.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        notification_id: NotificationId,
    ) -> Result<bool, DispatchError>;
}

#[async_trait]
impl<D> ChannelDispatcher for Arc<D>
where
    D: ChannelDispatcher + ?Sized,
{
    async fn send(
        &self,
        channel: Channel,
        notification_id: NotificationId,
    ) -> Result<bool, DispatchError> {
        (**self).send(channel, notification_id).await
    }
}

/// Convert a dispatch result into the retry policy's input.
pub fn outcome_of(result: Result<bool, DispatchError>) -> DeliveryOutcome {
    match result {
        Ok(true) => DeliveryOutcome::Delivered,
        Ok(false) => DeliveryOutcome::Failed("transport declined the message".to_string()),
        Err(err) if err.is_permanent() => DeliveryOutcome::Rejected(err.to_string()),
        Err(err) => DeliveryOutcome::Failed(err.to_string()),
    }
}

/// Transport for a single channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, notification_id: NotificationId) -> Result<bool, DispatchError>;
}

/// Dispatcher that routes each channel to its registered sender.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the sender for a channel.
    pub fn register(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn has_sender(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.senders.keys().copied()
    }
}

impl core::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("channels", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ChannelDispatcher for ChannelRouter {
    async fn send(
        &self,
        channel: Channel,
        notification_id: NotificationId,
    ) -> Result<bool, DispatchError> {
        let sender = self
            .senders
            .get(&channel)
            .ok_or(DispatchError::NoSender(channel))?;
        sender.send(notification_id).await
    }
}
