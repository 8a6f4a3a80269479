//! Protected Log Export
//!
//! Produces signed, non-overlapping evidence bundles. Every bundle starts
//! exactly where the previous one for the same destination ended; the
//! watermark is persisted only after the bundle is safely on disk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::actions::{ActionDispatcher, FailureCause};
use crate::audit::entry::LogEntry;
use crate::audit::merkle::{merkle_root, verify_merkle_root};
use crate::audit::verify::{check_chain_segment, Anomaly};
use crate::crypto::{SigningCapability, SigningCertificate, TokenReference};
use crate::database::{ChainBoundary, ExportCursor, LogQuery, LogStore};
use crate::error::{ProtectedLogError, Result};

pub const BUNDLE_CONTENT_TYPE: &str = "application/vnd.protected-log.export+json";
pub const BUNDLE_SUFFIX: &str = ".p7m.json";

/// Entries of one chain contained in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedChain {
    pub node_id: String,
    /// Last entry of this chain in the previous bundle.
    pub previous: Option<ChainBoundary>,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSlice {
    pub bundle_id: Uuid,
    pub epoch: u64,
    pub exported_at: DateTime<Utc>,
    pub chains: Vec<ExportedChain>,
    pub merkle_root: String,
}

impl ExportSlice {
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.chains.iter().flat_map(|c| c.entries.iter())
    }

    pub fn entry_count(&self) -> usize {
        self.chains.iter().map(|c| c.entries.len()).sum()
    }
}

/// Detached-content style signature wrapper written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub content_type: String,
    /// Base64 of the serialized [`ExportSlice`].
    pub content: String,
    pub content_digest: String,
    pub signature: String,
    pub certificate: SigningCertificate,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReceipt {
    pub bundle_id: Uuid,
    pub path: PathBuf,
    pub entry_count: usize,
    pub merkle_root: String,
    pub cursor: ExportCursor,
}

fn digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

pub struct LogExporter {
    store: Arc<dyn LogStore>,
    capability: Arc<dyn SigningCapability>,
    dispatcher: ActionDispatcher,
    export_path: String,
    signer: Option<TokenReference>,
    older_than: Duration,
}

impl LogExporter {
    pub fn new(
        store: Arc<dyn LogStore>,
        capability: Arc<dyn SigningCapability>,
        dispatcher: ActionDispatcher,
        export_path: &str,
        signer_ca_name: Option<&str>,
        older_than: Duration,
    ) -> Self {
        Self {
            store,
            capability,
            dispatcher,
            export_path: export_path.to_string(),
            signer: signer_ca_name.map(|name| TokenReference::CaName(name.to_string())),
            older_than,
        }
    }

    pub fn export_path(&self) -> &str {
        &self.export_path
    }

    fn abort(&self, anomaly: Anomaly) -> ProtectedLogError {
        self.dispatcher.dispatch(anomaly.cause, &anomaly.context());
        ProtectedLogError::integrity(anomaly.cause, anomaly.detail)
    }

    /// Export everything written since the last bundle for this destination.
    ///
    /// Returns `None` without writing anything when there is nothing new.
    pub async fn export_log(&self) -> Result<Option<ExportReceipt>> {
        let signer = self.signer.clone().ok_or_else(|| {
            ProtectedLogError::misuse("export requires export_signer_ca_name")
        })?;

        let epoch = self.store.reset_epoch().await?;
        let cursor = match self.store.load_cursor(&self.export_path).await? {
            Some(cursor) if cursor.epoch == epoch => cursor,
            Some(cursor) if cursor.epoch > epoch => {
                return Err(self.abort(Anomaly {
                    cause: FailureCause::RolledBack,
                    node_id: None,
                    sequence_number: None,
                    detail: format!(
                        "export cursor epoch {} is ahead of the store epoch {}",
                        cursor.epoch, epoch
                    ),
                }));
            }
            _ => ExportCursor::fresh(epoch),
        };

        let cutoff = (self.older_than > Duration::zero()).then(|| {
            Utc::now()
                .checked_sub_signed(self.older_than)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        let mut chains = Vec::new();
        for node_id in self.store.node_ids().await? {
            let tail = match self.store.newest_entry(Some(&node_id)).await? {
                Some(tail) => tail,
                None => continue,
            };
            if let Some(chain) = self.select(&cursor, &node_id, &tail, cutoff).await? {
                chains.push(chain);
            }
        }

        if chains.is_empty() {
            debug!("Nothing to export to {}", self.export_path);
            return Ok(None);
        }

        let all_entries: Vec<LogEntry> = chains.iter().flat_map(|c| c.entries.clone()).collect();
        let slice = ExportSlice {
            bundle_id: Uuid::new_v4(),
            epoch,
            exported_at: Utc::now(),
            merkle_root: merkle_root(&all_entries)?,
            chains,
        };

        let content = serde_json::to_vec(&slice)?;
        let (signature, certificate) = self.capability.sign(&content, &signer)?;
        let envelope = SignedEnvelope {
            content_type: BUNDLE_CONTENT_TYPE.to_string(),
            content_digest: digest(&content),
            content: STANDARD.encode(&content),
            signature,
            certificate,
            signed_at: Utc::now(),
        };

        let path = self.bundle_path(&slice);
        self.write_bundle(&path, &envelope).await?;

        let mut next = cursor.clone();
        next.last_export = Some(slice.exported_at);
        for chain in &slice.chains {
            if let Some(last) = chain.entries.last() {
                next.boundaries.insert(
                    chain.node_id.clone(),
                    ChainBoundary {
                        sequence_number: last.sequence_number,
                        current_hash: last.current_hash.clone(),
                    },
                );
            }
        }

        let saved = match self.store.load_cursor(&self.export_path).await {
            Ok(Some(current)) if current != cursor && !current.is_superseded_by(&next) => {
                Err(ProtectedLogError::Store(format!(
                    "export cursor of {} moved during the export",
                    self.export_path
                )))
            }
            Ok(_) => self.store.save_cursor(&self.export_path, &next).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!("Removing bundle {:?}: cursor could not be saved: {}", path, e);
            if let Err(remove) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove bundle {:?}: {}", path, remove);
            }
            return Err(e);
        }

        info!(
            "Exported {} entries to {:?} (root {})",
            slice.entry_count(),
            path,
            slice.merkle_root
        );
        Ok(Some(ExportReceipt {
            bundle_id: slice.bundle_id,
            path,
            entry_count: slice.entry_count(),
            merkle_root: slice.merkle_root,
            cursor: next,
        }))
    }

    /// Entries of one chain after the cursor boundary, checked against it.
    async fn select(
        &self,
        cursor: &ExportCursor,
        node_id: &str,
        tail: &LogEntry,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<ExportedChain>> {
        let boundary = cursor.boundary(node_id).cloned();
        if let Some(boundary) = &boundary {
            if boundary.sequence_number > tail.sequence_number {
                return Err(self.abort(Anomaly::new(
                    FailureCause::RolledBack,
                    node_id,
                    Some(tail.sequence_number),
                    format!(
                        "chain ends at {} but {} was already exported",
                        tail.sequence_number, boundary.sequence_number
                    ),
                )));
            }
            if boundary.sequence_number == tail.sequence_number {
                if boundary.current_hash != tail.current_hash {
                    return Err(self.abort(Anomaly::new(
                        FailureCause::ModifiedLogRow,
                        node_id,
                        Some(tail.sequence_number),
                        "exported entry was replaced",
                    )));
                }
                return Ok(None);
            }
        }

        let mut query = LogQuery::node(node_id).up_to(tail.sequence_number);
        if let Some(boundary) = &boundary {
            query = query.after(boundary.sequence_number);
        }
        let mut entries = self.store.query(&query).await?;
        if let Some(cutoff) = cutoff {
            let keep = entries
                .iter()
                .position(|e| e.timestamp >= cutoff)
                .unwrap_or(entries.len());
            entries.truncate(keep);
        }

        let first = boundary.as_ref().map_or(0, |b| b.sequence_number + 1);
        let previous_hash = boundary.as_ref().map(|b| b.current_hash.as_str());
        if let Some(anomaly) = check_chain_segment(&entries, first, previous_hash) {
            return Err(self.abort(anomaly));
        }

        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExportedChain {
            node_id: node_id.to_string(),
            previous: boundary,
            entries,
        }))
    }

    fn bundle_path(&self, slice: &ExportSlice) -> PathBuf {
        PathBuf::from(format!(
            "{}{}-{}{}",
            self.export_path,
            slice.exported_at.format("%Y%m%d%H%M%S%3f"),
            slice.bundle_id,
            BUNDLE_SUFFIX
        ))
    }

    async fn write_bundle(&self, path: &Path, envelope: &SignedEnvelope) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(envelope)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Read a bundle, check its digest, signature, Merkle root and chain links,
/// and return its content.
pub async fn open_bundle(
    path: &Path,
    capability: &dyn SigningCapability,
) -> Result<ExportSlice> {
    let raw = tokio::fs::read(path).await?;
    let envelope: SignedEnvelope = serde_json::from_slice(&raw)?;
    if envelope.content_type != BUNDLE_CONTENT_TYPE {
        return Err(ProtectedLogError::Serialization(format!(
            "unexpected content type {}",
            envelope.content_type
        )));
    }

    let content = STANDARD
        .decode(envelope.content.as_bytes())
        .map_err(|e| ProtectedLogError::Serialization(format!("Invalid bundle content: {}", e)))?;
    if digest(&content) != envelope.content_digest {
        return Err(ProtectedLogError::integrity(
            FailureCause::ModifiedLogRow,
            "bundle content does not match its digest",
        ));
    }
    let signed = capability
        .verify(&content, &envelope.signature, &envelope.certificate)
        .unwrap_or(false);
    if !signed {
        return Err(ProtectedLogError::integrity(
            FailureCause::UnverifiableChain,
            "bundle signature does not verify",
        ));
    }

    let slice: ExportSlice = serde_json::from_slice(&content)?;
    let all_entries: Vec<LogEntry> = slice.entries().cloned().collect();
    if !verify_merkle_root(&all_entries, &slice.merkle_root)? {
        return Err(ProtectedLogError::integrity(
            FailureCause::ModifiedLogRow,
            "bundle Merkle root does not match its entries",
        ));
    }

    let mut seen = BTreeSet::new();
    for chain in &slice.chains {
        let first = chain.previous.as_ref().map_or(0, |b| b.sequence_number + 1);
        let previous_hash = chain.previous.as_ref().map(|b| b.current_hash.as_str());
        if let Some(anomaly) = check_chain_segment(&chain.entries, first, previous_hash) {
            return Err(ProtectedLogError::integrity(anomaly.cause, anomaly.detail));
        }
        if !seen.insert(chain.node_id.as_str()) {
            return Err(ProtectedLogError::integrity(
                FailureCause::ModifiedLogRow,
                format!("chain {} appears twice", chain.node_id),
            ));
        }
    }

    Ok(slice)
}
