#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use protected_log::audit::{Actor, FailureCause, LogEntry, LogEvent, ProtectedLog, Protection};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::CaKeyRing;
use protected_log::database::{ExportCursor, LogQuery, LogStore, MemoryLogStore};
use protected_log::error::{ProtectedLogError, Result};

pub const CA_NAME: &str = "AdminCA1";

/// Key ring holding a freshly generated key for `AdminCA1`.
pub fn create_test_key_ring() -> Arc<CaKeyRing> {
    let ring = CaKeyRing::new();
    ring.generate(CA_NAME).expect("Failed to generate CA key");
    Arc::new(ring)
}

/// Node that signs every entry with `AdminCA1` and records dispatched causes.
pub fn protected_config(node_id: &str) -> ProtectedLogConfig {
    ProtectedLogConfig {
        node_id: node_id.to_string(),
        token_ref_type: "CA-NAME".to_string(),
        token_ref: Some(CA_NAME.to_string()),
        use_test_action: true,
        ..ProtectedLogConfig::default()
    }
}

/// Node that writes unsigned entries.
pub fn unprotected_config(node_id: &str) -> ProtectedLogConfig {
    ProtectedLogConfig {
        node_id: node_id.to_string(),
        use_test_action: true,
        ..ProtectedLogConfig::default()
    }
}

/// Adds a bundle destination under `dir`.
pub fn with_export(mut config: ProtectedLogConfig, dir: &Path) -> ProtectedLogConfig {
    config.export_path = Some(
        dir.join("bundles")
            .join("protected-log-")
            .to_string_lossy()
            .to_string(),
    );
    config.export_signer_ca_name = Some(CA_NAME.to_string());
    config
}

pub fn create_test_device(
    config: ProtectedLogConfig,
    store: Arc<dyn LogStore>,
    ring: Arc<CaKeyRing>,
) -> ProtectedLog {
    ProtectedLog::new(config, store, ring).expect("Failed to create protected log")
}

pub fn admin_event(comment: &str) -> LogEvent {
    LogEvent::new(
        Actor::CertificateUser {
            fingerprint: "3f2a9c".to_string(),
        },
        "ca",
        "certificate_issued",
        comment,
    )
    .with_username("alice")
    .with_certificate_ref("01ab")
}

pub fn admin_event_at(comment: &str, timestamp: DateTime<Utc>) -> LogEvent {
    admin_event(comment).at(timestamp)
}

pub async fn write_events(device: &ProtectedLog, count: usize) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for i in 0..count {
        entries.push(
            device
                .log(admin_event(&format!("event {}", i)))
                .await
                .expect("Failed to log event"),
        );
    }
    entries
}

pub async fn node_entries(store: &dyn LogStore, node_id: &str) -> Vec<LogEntry> {
    store
        .query(&LogQuery::node(node_id))
        .await
        .expect("Failed to query entries")
}

pub fn captured(device: &ProtectedLog) -> Vec<FailureCause> {
    device
        .test_capture()
        .map(|capture| capture.causes())
        .unwrap_or_default()
}

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryLogStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ProtectedLogError::Store("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogStore for FailingStore {
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        self.check()?;
        self.inner.append(entry).await
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        self.inner.query(query).await
    }

    async fn newest_entry(&self, node_id: Option<&str>) -> Result<Option<LogEntry>> {
        self.inner.newest_entry(node_id).await
    }

    async fn node_ids(&self) -> Result<Vec<String>> {
        self.inner.node_ids().await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn set_protection(
        &self,
        node_id: &str,
        sequence_number: u64,
        protection: &Protection,
    ) -> Result<()> {
        self.check()?;
        self.inner
            .set_protection(node_id, sequence_number, protection)
            .await
    }

    async fn remove_node(&self, node_id: &str) -> Result<u64> {
        self.check()?;
        self.inner.remove_node(node_id).await
    }

    async fn remove_all(&self) -> Result<u64> {
        self.check()?;
        self.inner.remove_all().await
    }

    async fn load_cursor(&self, destination: &str) -> Result<Option<ExportCursor>> {
        self.inner.load_cursor(destination).await
    }

    async fn save_cursor(&self, destination: &str, cursor: &ExportCursor) -> Result<()> {
        self.check()?;
        self.inner.save_cursor(destination, cursor).await
    }

    async fn reset_epoch(&self) -> Result<u64> {
        self.inner.reset_epoch().await
    }

    async fn advance_reset_epoch(&self) -> Result<u64> {
        self.check()?;
        self.inner.advance_reset_epoch().await
    }
}
