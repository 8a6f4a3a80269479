//! Protected Log Entry
//!
//! Defines the structure of tamper-evident log entries and the per-node
//! chain bookkeeping that links them together.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::SigningCertificate;

/// Module name used for entries written by the log itself.
pub const MODULE_LOG: &str = "log";

/// First entry written by a device session.
pub const EVENT_LOG_INITIALIZED: &str = "log_initialized";
/// Last entry written by a device session on orderly shutdown.
pub const EVENT_LOG_STOPPED: &str = "log_stopped";
/// Genesis entry written by an administrative reset.
pub const EVENT_LOG_RESET: &str = "log_reset";
/// Written when an operator purges another node's chain.
pub const EVENT_CHAIN_REMOVED: &str = "chain_removed";

/// Administrative actors that are neither certificate users nor web users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialAdminKind {
    RaCommandLine,
    CaCommandLine,
    BatchCommandLine,
}

impl SpecialAdminKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialAdminKind::RaCommandLine => "ra_command_line",
            SpecialAdminKind::CaCommandLine => "ca_command_line",
            SpecialAdminKind::BatchCommandLine => "batch_command_line",
        }
    }
}

/// Who performed the audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    InternalSystem,
    CertificateUser { fingerprint: String },
    PublicWebUser { address: String },
    SpecialAdmin { kind: SpecialAdminKind },
}

impl Actor {
    /// Stable textual form that takes part in the entry hash.
    pub fn canonical(&self) -> String {
        match self {
            Actor::InternalSystem => "internal".to_string(),
            Actor::CertificateUser { fingerprint } => format!("certificate:{}", fingerprint),
            Actor::PublicWebUser { address } => format!("public_web:{}", address),
            Actor::SpecialAdmin { kind } => format!("special:{}", kind.as_str()),
        }
    }
}

/// Checkpoint signature binding a chain position to a CA key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    /// Hex encoded DER signature over the entry's `current_hash`.
    pub signature: String,
    pub certificate: SigningCertificate,
    pub signed_at: DateTime<Utc>,
}

/// Content of an entry as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub actor: Actor,
    pub module: String,
    pub event_kind: String,
    pub comment: String,
    pub username: Option<String>,
    pub certificate_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(actor: Actor, module: &str, event_kind: &str, comment: impl Into<String>) -> Self {
        Self {
            actor,
            module: module.to_string(),
            event_kind: event_kind.to_string(),
            comment: comment.into(),
            username: None,
            certificate_ref: None,
            timestamp: now_millis(),
        }
    }

    /// Event emitted by the log subsystem itself.
    pub fn internal(event_kind: &str, comment: impl Into<String>) -> Self {
        Self::new(Actor::InternalSystem, MODULE_LOG, event_kind, comment)
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_certificate_ref(mut self, certificate_ref: impl Into<String>) -> Self {
        self.certificate_ref = Some(certificate_ref.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = truncate_to_millis(timestamp);
        self
    }

    /// Fold a failure into the comment so it becomes part of the record.
    pub fn exception(mut self, err: &dyn std::fmt::Display) -> Self {
        self.comment = format!("{}, Exception: {}", self.comment, err);
        self
    }
}

/// One immutable record in a node's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub node_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub module: String,
    pub event_kind: String,
    pub comment: String,
    pub username: Option<String>,
    pub certificate_ref: Option<String>,
    pub previous_hash: Option<String>,
    pub current_hash: String,
    pub protection: Option<Protection>,
}

impl LogEntry {
    /// Build the entry following `previous` (or a genesis entry) and seal its hash.
    pub fn chained(
        node_id: &str,
        sequence_number: u64,
        previous_hash: Option<String>,
        event: LogEvent,
    ) -> Self {
        let mut entry = Self {
            node_id: node_id.to_string(),
            sequence_number,
            timestamp: truncate_to_millis(event.timestamp),
            actor: event.actor,
            module: event.module,
            event_kind: event.event_kind,
            comment: event.comment,
            username: event.username,
            certificate_ref: event.certificate_ref,
            previous_hash,
            current_hash: String::new(),
            protection: None,
        };
        entry.current_hash = entry.calculate_hash();
        entry
    }

    /// Length-prefixed encoding of everything the chain hash covers.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let actor = self.actor.canonical();
        let millis = self.timestamp.timestamp_millis().to_be_bytes();
        let sequence = self.sequence_number.to_be_bytes();
        let fields: [&[u8]; 10] = [
            actor.as_bytes(),
            self.module.as_bytes(),
            self.event_kind.as_bytes(),
            self.comment.as_bytes(),
            self.username.as_deref().unwrap_or("").as_bytes(),
            self.certificate_ref.as_deref().unwrap_or("").as_bytes(),
            &millis,
            self.previous_hash.as_deref().unwrap_or("").as_bytes(),
            self.node_id.as_bytes(),
            &sequence,
        ];

        let mut out = Vec::new();
        for field in fields {
            out.extend_from_slice(&(field.len() as u64).to_be_bytes());
            out.extend_from_slice(field);
        }
        out
    }

    /// Calculate SHA256 hash of this entry
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    pub fn verify_hash(&self) -> bool {
        self.current_hash == self.calculate_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence_number == 0
    }

    pub fn is_checkpoint(&self) -> bool {
        self.protection.is_some()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}#{} {}/{}: {}",
            self.node_id, self.sequence_number, self.module, self.event_kind, self.comment
        )
    }
}

/// Per-node chain bookkeeping kept by the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChainState {
    pub node_id: String,
    pub last_sequence_number: u64,
    pub last_hash: String,
    pub last_checkpoint_sequence: Option<u64>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
}

impl NodeChainState {
    /// Resume bookkeeping from the newest stored entry of a chain.
    pub fn from_tail(entry: &LogEntry) -> Self {
        Self {
            node_id: entry.node_id.clone(),
            last_sequence_number: entry.sequence_number,
            last_hash: entry.current_hash.clone(),
            last_checkpoint_sequence: entry.protection.as_ref().map(|_| entry.sequence_number),
            last_checkpoint_time: entry.protection.as_ref().map(|p| p.signed_at),
        }
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.last_sequence_number + 1
    }

    /// Entries appended since the last checkpoint.
    pub fn unsigned_count(&self) -> u64 {
        match self.last_checkpoint_sequence {
            Some(seq) => self.last_sequence_number - seq,
            None => self.last_sequence_number + 1,
        }
    }

    pub fn advance(&mut self, entry: &LogEntry) {
        self.last_sequence_number = entry.sequence_number;
        self.last_hash = entry.current_hash.clone();
        if let Some(protection) = &entry.protection {
            self.last_checkpoint_sequence = Some(entry.sequence_number);
            self.last_checkpoint_time = Some(protection.signed_at);
        }
    }
}

/// Current time truncated to the millisecond precision entries are stored with.
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Convert a number of seconds from configuration into a chrono duration.
pub fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(comment: &str) -> LogEvent {
        LogEvent::new(Actor::InternalSystem, "custom", "info", comment)
    }

    #[test]
    fn test_genesis_entry() {
        let genesis = LogEntry::chained("node-1", 0, None, event("first"));
        assert!(genesis.is_genesis());
        assert!(genesis.previous_hash.is_none());
        assert!(genesis.verify_hash());
        assert!(genesis.current_hash.starts_with("sha256:"));
        assert_eq!(genesis.current_hash.len(), 71);
    }

    #[test]
    fn test_hash_covers_link_and_position() {
        let genesis = LogEntry::chained("node-1", 0, None, event("first"));
        let ts = genesis.timestamp;
        let next = LogEntry::chained(
            "node-1",
            1,
            Some(genesis.current_hash.clone()),
            event("second").at(ts),
        );

        let mut moved = next.clone();
        moved.sequence_number = 2;
        assert!(!moved.verify_hash());

        let mut relinked = next.clone();
        relinked.previous_hash = Some("sha256:00".to_string());
        assert!(!relinked.verify_hash());

        let mut renamed = next.clone();
        renamed.node_id = "node-2".to_string();
        assert!(!renamed.verify_hash());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let ts = now_millis();
        let a = LogEntry::chained(
            "n",
            0,
            None,
            LogEvent::new(Actor::InternalSystem, "ab", "c", "x").at(ts),
        );
        let b = LogEntry::chained(
            "n",
            0,
            None,
            LogEvent::new(Actor::InternalSystem, "a", "bc", "x").at(ts),
        );
        assert_ne!(a.current_hash, b.current_hash);
    }

    #[test]
    fn test_actor_canonical_forms() {
        assert_eq!(Actor::InternalSystem.canonical(), "internal");
        assert_eq!(
            Actor::PublicWebUser {
                address: "10.0.0.1".to_string()
            }
            .canonical(),
            "public_web:10.0.0.1"
        );
        assert_eq!(
            Actor::SpecialAdmin {
                kind: SpecialAdminKind::CaCommandLine
            }
            .canonical(),
            "special:ca_command_line"
        );
    }

    #[test]
    fn test_exception_is_folded_into_comment() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let event = event("store write").exception(&err);
        assert_eq!(event.comment, "store write, Exception: disk full");
    }

    #[test]
    fn test_chain_state_unsigned_count() {
        let genesis = LogEntry::chained("node-1", 0, None, event("first"));
        let mut state = NodeChainState::from_tail(&genesis);
        assert_eq!(state.unsigned_count(), 1);

        let next = LogEntry::chained("node-1", 1, Some(genesis.current_hash.clone()), event("b"));
        state.advance(&next);
        assert_eq!(state.unsigned_count(), 2);
        assert_eq!(state.next_sequence_number(), 2);
    }
}
