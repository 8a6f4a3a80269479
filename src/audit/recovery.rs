//! Recovery Operations
//!
//! Administrative operations run after a confirmed incident. All of them
//! hold the maintenance lock so they never interleave with an export.

use tracing::{info, warn};

use crate::audit::device::ProtectedLog;
use crate::audit::entry::{
    LogEntry, LogEvent, EVENT_CHAIN_REMOVED, EVENT_LOG_INITIALIZED, EVENT_LOG_RESET,
    EVENT_LOG_STOPPED,
};
use crate::audit::signer::SigningSummary;
use crate::database::LogQuery;
use crate::error::{ProtectedLogError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The log held nothing but a reset genesis and session markers.
    AlreadyReset,
    Reset {
        removed_entries: u64,
        epoch: u64,
        genesis: LogEntry,
    },
}

impl ProtectedLog {
    /// Only this node's `log_reset` genesis and later session markers remain.
    async fn is_already_reset(&self) -> Result<bool> {
        let nodes = self.store.node_ids().await?;
        if nodes.len() != 1 || nodes[0] != self.node_id() {
            return Ok(false);
        }
        let entries = self.store.query(&LogQuery::node(self.node_id())).await?;
        let mut entries = entries.iter();
        let reset_genesis = entries
            .next()
            .map_or(false, |e| e.is_genesis() && e.event_kind == EVENT_LOG_RESET);
        Ok(reset_genesis
            && entries.all(|e| {
                e.event_kind == EVENT_LOG_STOPPED || e.event_kind == EVENT_LOG_INITIALIZED
            }))
    }

    /// Purge every chain and start over from a signed `log_reset` entry.
    ///
    /// Without `force` the unexported remainder is exported first, and the
    /// reset is abandoned if that fails.
    pub async fn reset_entire_log(&self, force: bool, reason: &str) -> Result<ResetOutcome> {
        let _maintenance = self.maintenance.lock().await;
        let mut session = self.session.lock().await;

        if self.is_already_reset().await? {
            info!("Protected log is already reset");
            return Ok(ResetOutcome::AlreadyReset);
        }

        if let Some(exporter) = &self.exporter {
            match exporter.export_log().await {
                Ok(receipt) => {
                    if let Some(receipt) = receipt {
                        info!("Exported {} entries before reset", receipt.entry_count);
                    }
                }
                Err(e) if force => warn!("Export before forced reset failed: {}", e),
                Err(e) => return Err(e),
            }
        }

        let removed_entries = self.store.remove_all().await?;
        let epoch = self.store.advance_reset_epoch().await?;
        self.linker.clear()?;
        self.verifier.reset()?;
        session.last_written = None;
        session.last_own_check = None;

        let genesis = self
            .append_locked(&mut session, LogEvent::internal(EVENT_LOG_RESET, reason))
            .await?;
        self.seal(&genesis).await?;
        session.initialized = true;

        warn!(
            "Protected log reset: {} entries removed, epoch {} ({})",
            removed_entries, epoch, reason
        );
        Ok(ResetOutcome::Reset {
            removed_entries,
            epoch,
            genesis,
        })
    }

    /// Purge another node's chain and record the removal in this node's chain.
    pub async fn remove_node_chain(&self, node_id: &str) -> Result<u64> {
        if node_id == self.node_id() {
            return Err(ProtectedLogError::misuse(
                "a node cannot remove its own chain, reset the log instead",
            ));
        }

        let removed = {
            let _maintenance = self.maintenance.lock().await;
            let removed = self.store.remove_node(node_id).await?;
            self.linker.forget(node_id)?;
            self.verifier.forget(node_id)?;

            if let Some(exporter) = &self.exporter {
                if let Some(mut cursor) = self.store.load_cursor(exporter.export_path()).await? {
                    if cursor.boundaries.remove(node_id).is_some() {
                        self.store
                            .save_cursor(exporter.export_path(), &cursor)
                            .await?;
                    }
                }
            }
            removed
        };

        self.log(LogEvent::internal(
            EVENT_CHAIN_REMOVED,
            format!("Removed chain of node {} ({} entries)", node_id, removed),
        ))
        .await?;
        warn!("Removed chain of node {} ({} entries)", node_id, removed);
        Ok(removed)
    }

    /// Sign every unsigned chain tail, replacing stale signatures with `force_resign`.
    pub async fn sign_all_unsigned_chains(&self, force_resign: bool) -> Result<SigningSummary> {
        let _maintenance = self.maintenance.lock().await;
        self.signer
            .sign_all_unsigned_chains(&self.linker, force_resign)
            .await
    }
}
