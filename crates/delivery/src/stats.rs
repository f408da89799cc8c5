//! Per-status queue counters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::item::QueueStatus;

/// Item counts grouped by status.
///
/// Every known status is always present (zero when absent from the store) so
/// dashboards get a stable shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueStats {
    counts: BTreeMap<QueueStatus, u64>,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStats {
    pub fn new() -> Self {
        Self {
            counts: QueueStatus::ALL.iter().map(|s| (*s, 0)).collect(),
        }
    }

    /// Add `count` items to a status bucket.
    pub fn record(&mut self, status: QueueStatus, count: u64) {
        *self.counts.entry(status).or_insert(0) += count;
    }

    pub fn get(&self, status: QueueStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueueStatus, u64)> + '_ {
        self.counts.iter().map(|(s, c)| (*s, *c))
    }
}

impl FromIterator<(QueueStatus, u64)> for QueueStats {
    fn from_iter<I: IntoIterator<Item = (QueueStatus, u64)>>(iter: I) -> Self {
        let mut stats = Self::new();
        for (status, count) in iter {
            stats.record(status, count);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_have_every_bucket() {
        let stats = QueueStats::new();
        assert_eq!(stats.iter().count(), QueueStatus::ALL.len());
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn serializes_as_status_map() {
        let stats: QueueStats = [(QueueStatus::Failed, 1), (QueueStatus::Sent, 4)]
            .into_iter()
            .collect();

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "pending": 0,
                "processing": 0,
                "retry": 0,
                "sent": 4,
                "failed": 1,
            })
        );
    }
}
