//! Queue item model and its status lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notiq_core::{ClaimId, DomainError, NotificationId, QueueItemId};

use crate::retry::{Decision, Transition};

/// Attempts allowed per item unless the producer says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Transport a queued notification is delivered over.
///
/// In-app notifications are written synchronously by the notification API and
/// never enter this queue, so there is no variant for them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            "in_app" => Err(DomainError::validation(
                "in_app notifications are delivered synchronously and cannot be queued",
            )),
            other => Err(DomainError::validation(format!("unknown channel: {other}"))),
        }
    }
}

/// Queue item status.
///
/// ```text
/// pending ──claim──▶ processing ──▶ sent
///                        │
///                        ├──▶ retry ──claim (when due)──▶ processing
///                        └──▶ failed
/// ```
///
/// `sent` and `failed` are terminal. Older rows may carry `queued`, which is
/// read as `pending`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Awaiting its first attempt.
    #[serde(alias = "queued")]
    Pending,
    /// Claimed by exactly one worker, dispatch in flight.
    Processing,
    /// A previous attempt failed; eligible again once `scheduled_for` passes.
    Retry,
    /// Handed off to the channel transport.
    Sent,
    /// Attempts exhausted, permanently rejected, or cancelled.
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Retry,
        QueueStatus::Sent,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Retry => "retry",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }

    /// Waiting to be claimed (first attempt or a scheduled retry).
    pub fn is_awaiting(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Retry)
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "queued" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "retry" => Ok(QueueStatus::Retry),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(DomainError::validation(format!("unknown queue status: {other}"))),
        }
    }
}

/// Admission request for one queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub notification_id: NotificationId,
    pub channel: Channel,
    /// Earliest processing time; `None` means now.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
}

impl NewQueueItem {
    pub fn new(notification_id: NotificationId, channel: Channel) -> Self {
        Self {
            notification_id,
            channel,
            scheduled_for: None,
            priority: 0,
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A unit of asynchronous delivery work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    /// Weak reference: the notification may be deleted while this item lives.
    pub notification_id: NotificationId,
    pub channel: Channel,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher is claimed first; FIFO among equal priorities.
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    /// Set when the item is claimed and again when its outcome is recorded.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Token of the claim that owns the item while it is `processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<ClaimId>,
}

impl QueueItem {
    /// Build a fresh `pending` item.
    ///
    /// A `scheduled_for` in the past is clamped to `now`.
    pub fn new(request: NewQueueItem, now: DateTime<Utc>) -> Self {
        let scheduled_for = request.scheduled_for.map_or(now, |at| at.max(now));
        Self {
            id: QueueItemId::new(),
            notification_id: request.notification_id,
            channel: request.channel,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: request.priority,
            scheduled_for,
            last_attempt_at: None,
            error_message: None,
            created_at: now,
            claim_id: None,
        }
    }

    /// Whether the item may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_awaiting() && self.scheduled_for <= now
    }

    /// Whether the item is waiting but not yet due at `now`.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.status.is_awaiting() && self.scheduled_for > now
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `processing` on behalf of the claim `claim`.
    pub fn mark_claimed(&mut self, claim: ClaimId, now: DateTime<Utc>) {
        self.status = QueueStatus::Processing;
        self.last_attempt_at = Some(now);
        self.claim_id = Some(claim);
    }

    /// Whether the item is `processing` under `claim`.
    pub fn is_claimed_by(&self, claim: ClaimId) -> bool {
        self.status == QueueStatus::Processing && self.claim_id == Some(claim)
    }

    /// Give up an abandoned claim; the item is due again at `now`.
    pub fn release_claim(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Retry;
        self.scheduled_for = now;
        self.claim_id = None;
    }

    /// Record the outcome of an attempt as decided by the retry policy.
    pub fn apply(&mut self, decision: Decision, now: DateTime<Utc>) {
        self.attempts = decision.attempts;
        self.last_attempt_at = Some(now);
        self.claim_id = None;
        match decision.transition {
            Transition::Sent => {
                self.status = QueueStatus::Sent;
                self.error_message = None;
            }
            Transition::Retry {
                scheduled_for,
                error,
            } => {
                self.status = QueueStatus::Retry;
                self.scheduled_for = scheduled_for;
                self.error_message = Some(error);
            }
            Transition::Failed { error } => {
                self.status = QueueStatus::Failed;
                self.error_message = Some(error);
            }
        }
    }

    /// Put a dead item back in line for an immediate attempt with a fresh budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Retry;
        self.attempts = 0;
        self.scheduled_for = now;
        self.error_message = None;
    }

    /// Terminate a not-yet-claimed item.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = QueueStatus::Failed;
        self.error_message = Some(reason.into());
    }

    /// Timestamp cleanup compares against: the last attempt, or creation if
    /// the item was never attempted (e.g. cancelled before its first claim).
    pub fn processed_at(&self) -> DateTime<Utc> {
        self.last_attempt_at.unwrap_or(self.created_at)
    }
}
