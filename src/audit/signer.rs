//! Chain Signer
//!
//! Binds chain positions to a CA signature. A checkpoint signature covers
//! the entry's `current_hash`, which in turn covers every earlier entry of
//! the chain through the hash links.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::audit::entry::{now_millis, LogEntry, NodeChainState, Protection};
use crate::audit::linker::ChainLinker;
use crate::crypto::{SigningCapability, TokenReference};
use crate::database::{LogQuery, LogStore};
use crate::error::{ProtectedLogError, Result};

/// Result of a bulk signing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningSummary {
    pub chains_signed: usize,
    pub signatures_replaced: usize,
}

pub struct ChainSigner {
    store: Arc<dyn LogStore>,
    capability: Arc<dyn SigningCapability>,
    token: TokenReference,
    sign_after_appends: u64,
    protection_interval: Option<Duration>,
}

impl ChainSigner {
    pub fn new(
        store: Arc<dyn LogStore>,
        capability: Arc<dyn SigningCapability>,
        token: TokenReference,
        sign_after_appends: u64,
        protection_interval: Option<Duration>,
    ) -> Self {
        Self {
            store,
            capability,
            token,
            sign_after_appends: sign_after_appends.max(1),
            protection_interval,
        }
    }

    pub fn token(&self) -> &TokenReference {
        &self.token
    }

    /// Sign an entry's hash with the configured token.
    pub fn sign(&self, entry: &LogEntry) -> Result<Protection> {
        self.sign_hash(&entry.current_hash)
    }

    fn sign_hash(&self, current_hash: &str) -> Result<Protection> {
        let (signature, certificate) = self.capability.sign(current_hash.as_bytes(), &self.token)?;
        Ok(Protection {
            signature,
            certificate,
            signed_at: now_millis(),
        })
    }

    /// Inline signing decision for an entry about to be appended.
    pub fn protection_for(
        &self,
        state: Option<&NodeChainState>,
        entry: &LogEntry,
    ) -> Result<Option<Protection>> {
        if self.token.is_none() {
            return Ok(None);
        }

        let pending = state.map_or(0, NodeChainState::unsigned_count) + 1;
        let interval_elapsed = self.protection_interval.map_or(false, |interval| {
            match state.and_then(|s| s.last_checkpoint_time) {
                Some(last) => entry.timestamp - last >= interval,
                None => true,
            }
        });

        if pending >= self.sign_after_appends || interval_elapsed {
            debug!(
                "Signing {}#{} ({} pending)",
                entry.node_id, entry.sequence_number, pending
            );
            return self.sign(entry).map(Some);
        }
        Ok(None)
    }

    fn require_token(&self, operation: &str) -> Result<()> {
        if self.token.is_none() {
            return Err(ProtectedLogError::misuse(format!(
                "{} requires a CA signing token",
                operation
            )));
        }
        Ok(())
    }

    /// Sign the tail of every chain this process writes that has unsigned entries.
    pub async fn sign_pending(&self, linker: &ChainLinker) -> Result<usize> {
        self.require_token("sign_pending")?;

        let mut signed = 0;
        for state in linker.chain_states().await? {
            if state.unsigned_count() == 0 {
                continue;
            }
            let protection = self.sign_hash(&state.last_hash)?;
            self.store
                .set_protection(&state.node_id, state.last_sequence_number, &protection)
                .await?;
            linker
                .note_checkpoint(&state.node_id, state.last_sequence_number, &protection)
                .await?;
            signed += 1;
        }
        if signed > 0 {
            info!("Signed {} pending chain tails", signed);
        }
        Ok(signed)
    }

    fn signature_holds(&self, entry: &LogEntry, protection: &Protection) -> bool {
        matches!(
            self.capability.verify(
                entry.current_hash.as_bytes(),
                &protection.signature,
                &protection.certificate,
            ),
            Ok(true)
        )
    }

    /// Sign every unsigned chain tail in the store. With `force_resign`,
    /// checkpoint signatures that no longer verify are replaced as well.
    ///
    /// Entries whose recomputed hash does not match are never signed.
    pub async fn sign_all_unsigned_chains(
        &self,
        linker: &ChainLinker,
        force_resign: bool,
    ) -> Result<SigningSummary> {
        self.require_token("sign_all_unsigned_chains")?;

        let mut summary = SigningSummary::default();
        for node_id in self.store.node_ids().await? {
            let entries = self.store.query(&LogQuery::node(&node_id)).await?;

            if force_resign {
                for entry in entries.iter().filter(|e| e.verify_hash()) {
                    let stale = match &entry.protection {
                        Some(protection) => !self.signature_holds(entry, protection),
                        None => false,
                    };
                    if stale {
                        let protection = self.sign(entry)?;
                        self.store
                            .set_protection(&node_id, entry.sequence_number, &protection)
                            .await?;
                        summary.signatures_replaced += 1;
                    }
                }
            }

            let tail = match entries.last() {
                Some(tail) => tail,
                None => continue,
            };
            if tail.is_checkpoint() {
                continue;
            }
            if !tail.verify_hash() {
                warn!("Not signing {}: recomputed hash does not match", tail.summary());
                continue;
            }
            let protection = self.sign(tail)?;
            self.store
                .set_protection(&node_id, tail.sequence_number, &protection)
                .await?;
            linker
                .note_checkpoint(&node_id, tail.sequence_number, &protection)
                .await?;
            summary.chains_signed += 1;
        }

        info!(
            "Signed {} chains, replaced {} signatures",
            summary.chains_signed, summary.signatures_replaced
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::LogEvent;
    use crate::crypto::CaKeyRing;
    use crate::database::MemoryLogStore;

    fn signer(
        store: Arc<MemoryLogStore>,
        ring: Arc<CaKeyRing>,
        token: TokenReference,
        every: u64,
    ) -> ChainSigner {
        ChainSigner::new(store, ring, token, every, None)
    }

    #[tokio::test]
    async fn test_inline_signing_every_n_entries() {
        let store = Arc::new(MemoryLogStore::new());
        let ring = Arc::new(CaKeyRing::new());
        ring.generate("AdminCA1").unwrap();
        let signer = signer(
            store.clone(),
            ring,
            TokenReference::CaName("AdminCA1".to_string()),
            3,
        );
        let linker = ChainLinker::new(store.clone());

        let mut signed = Vec::new();
        for i in 0..6 {
            let entry = linker
                .append_with("node-1", LogEvent::internal("test", format!("{}", i)), |s, e| {
                    signer.protection_for(s, e)
                })
                .await
                .unwrap();
            signed.push(entry.is_checkpoint());
        }
        assert_eq!(signed, vec![false, false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_none_token_rejects_bulk_signing() {
        let store = Arc::new(MemoryLogStore::new());
        let linker = ChainLinker::new(store.clone());
        linker.append("node-1", LogEvent::internal("test", "a")).await.unwrap();

        let signer = signer(store.clone(), Arc::new(CaKeyRing::new()), TokenReference::None, 1);
        assert!(matches!(
            signer.sign_all_unsigned_chains(&linker, false).await,
            Err(ProtectedLogError::Misuse(_))
        ));
        let tail = store.newest_entry(Some("node-1")).await.unwrap().unwrap();
        assert!(tail.protection.is_none());
    }

    #[tokio::test]
    async fn test_force_resign_replaces_rotated_signatures() {
        let store = Arc::new(MemoryLogStore::new());
        let ring = Arc::new(CaKeyRing::new());
        ring.generate("AdminCA1").unwrap();
        let signer = signer(
            store.clone(),
            ring.clone(),
            TokenReference::CaName("AdminCA1".to_string()),
            1,
        );
        let linker = ChainLinker::new(store.clone());
        for i in 0..3 {
            linker
                .append_with("node-1", LogEvent::internal("test", format!("{}", i)), |s, e| {
                    signer.protection_for(s, e)
                })
                .await
                .unwrap();
        }

        ring.generate("AdminCA1").unwrap();
        let summary = signer.sign_all_unsigned_chains(&linker, true).await.unwrap();
        assert_eq!(summary.signatures_replaced, 3);
        assert_eq!(summary.chains_signed, 0);

        let current = ring.certificate("AdminCA1").unwrap().unwrap();
        for entry in store.query(&LogQuery::node("node-1")).await.unwrap() {
            assert_eq!(entry.protection.unwrap().certificate, current);
        }
    }
}
