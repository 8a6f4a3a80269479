use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::entry::LogEntry;

/// Selection of stored entries. Results are ordered by node, then sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub node_id: Option<String>,
    /// Exclusive lower sequence bound.
    pub after_sequence: Option<u64>,
    /// Inclusive upper sequence bound.
    pub up_to_sequence: Option<u64>,
    /// Inclusive lower timestamp bound.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl LogQuery {
    pub fn node(node_id: &str) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            ..Self::default()
        }
    }

    pub fn after(mut self, sequence_number: u64) -> Self {
        self.after_sequence = Some(sequence_number);
        self
    }

    pub fn up_to(mut self, sequence_number: u64) -> Self {
        self.up_to_sequence = Some(sequence_number);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entry` falls inside every bound except the limit.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.node_id.as_deref().map_or(true, |n| n == entry.node_id)
            && self.after_sequence.map_or(true, |s| entry.sequence_number > s)
            && self.up_to_sequence.map_or(true, |s| entry.sequence_number <= s)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

/// Position of the last exported entry of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBoundary {
    pub sequence_number: u64,
    pub current_hash: String,
}

/// Export watermark of one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCursor {
    pub epoch: u64,
    pub boundaries: BTreeMap<String, ChainBoundary>,
    pub last_export: Option<DateTime<Utc>>,
}

impl ExportCursor {
    pub fn fresh(epoch: u64) -> Self {
        Self {
            epoch,
            boundaries: BTreeMap::new(),
            last_export: None,
        }
    }

    pub fn boundary(&self, node_id: &str) -> Option<&ChainBoundary> {
        self.boundaries.get(node_id)
    }

    /// True when `other` is not behind `self` for any chain.
    pub fn is_superseded_by(&self, other: &ExportCursor) -> bool {
        if other.epoch != self.epoch {
            return other.epoch > self.epoch;
        }
        self.boundaries.iter().all(|(node, boundary)| {
            other
                .boundaries
                .get(node)
                .map_or(false, |b| b.sequence_number >= boundary.sequence_number)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(seq: u64) -> ChainBoundary {
        ChainBoundary {
            sequence_number: seq,
            current_hash: format!("sha256:{}", seq),
        }
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut old = ExportCursor::fresh(0);
        old.boundaries.insert("node-1".to_string(), boundary(4));

        let mut ahead = old.clone();
        ahead.boundaries.insert("node-1".to_string(), boundary(9));
        ahead.boundaries.insert("node-2".to_string(), boundary(0));
        assert!(old.is_superseded_by(&ahead));
        assert!(!ahead.is_superseded_by(&old));

        assert!(old.is_superseded_by(&ExportCursor::fresh(1)));
        assert!(!ExportCursor::fresh(1).is_superseded_by(&old));
    }
}
