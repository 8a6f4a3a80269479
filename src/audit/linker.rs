//! Chain Linker
//!
//! Appends entries to per-node hash chains. Each node has its own async
//! mutex held across the store write, so one node's appends are strictly
//! ordered while other nodes proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audit::entry::{LogEntry, LogEvent, NodeChainState, Protection};
use crate::database::{LogQuery, LogStore};
use crate::error::{ProtectedLogError, Result};

type ChainSlot = Arc<Mutex<Option<NodeChainState>>>;

pub struct ChainLinker {
    store: Arc<dyn LogStore>,
    chains: StdMutex<HashMap<String, ChainSlot>>,
}

impl ChainLinker {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            chains: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, node_id: &str) -> Result<ChainSlot> {
        let mut chains = self
            .chains
            .lock()
            .map_err(|_| ProtectedLogError::Store("chain table lock poisoned".to_string()))?;
        Ok(chains
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    /// Rebuild bookkeeping for a chain from what the store holds.
    async fn resume(&self, node_id: &str) -> Result<Option<NodeChainState>> {
        let tail = match self.store.newest_entry(Some(node_id)).await? {
            Some(tail) => tail,
            None => return Ok(None),
        };
        let mut state = NodeChainState::from_tail(&tail);
        if state.last_checkpoint_sequence.is_none() {
            let entries = self.store.query(&LogQuery::node(node_id)).await?;
            if let Some(checkpoint) = entries.iter().rev().find(|e| e.is_checkpoint()) {
                state.last_checkpoint_sequence = Some(checkpoint.sequence_number);
                state.last_checkpoint_time = checkpoint.protection.as_ref().map(|p| p.signed_at);
            }
        }
        info!(
            "Resumed chain {} at sequence {}",
            node_id, state.last_sequence_number
        );
        Ok(Some(state))
    }

    pub async fn append(&self, node_id: &str, event: LogEvent) -> Result<LogEntry> {
        self.append_with(node_id, event, |_, _| Ok(None)).await
    }

    /// Append `event` to the chain of `node_id`.
    ///
    /// `protect` sees the chain state before the append (`None` for a new
    /// chain) and the sealed entry, and may return a checkpoint signature.
    /// Nothing is advanced unless both signing and the store write succeed.
    pub async fn append_with<F>(&self, node_id: &str, event: LogEvent, protect: F) -> Result<LogEntry>
    where
        F: FnOnce(Option<&NodeChainState>, &LogEntry) -> Result<Option<Protection>> + Send,
    {
        let slot = self.slot(node_id)?;
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.resume(node_id).await?;
        }

        let (sequence_number, previous_hash) = match guard.as_ref() {
            Some(state) => (state.next_sequence_number(), Some(state.last_hash.clone())),
            None => (0, None),
        };
        let mut entry = LogEntry::chained(node_id, sequence_number, previous_hash, event);
        entry.protection = protect(guard.as_ref(), &entry)?;

        self.store.append(&entry).await?;

        match guard.as_mut() {
            Some(state) => state.advance(&entry),
            None => *guard = Some(NodeChainState::from_tail(&entry)),
        }
        debug!("Appended {}", entry.summary());
        Ok(entry)
    }

    pub async fn chain_state(&self, node_id: &str) -> Result<Option<NodeChainState>> {
        let slot = self.slot(node_id)?;
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.resume(node_id).await?;
        }
        Ok(guard.clone())
    }

    /// States of every chain this linker has written or resumed.
    pub async fn chain_states(&self) -> Result<Vec<NodeChainState>> {
        let slots: Vec<ChainSlot> = {
            let chains = self
                .chains
                .lock()
                .map_err(|_| ProtectedLogError::Store("chain table lock poisoned".to_string()))?;
            chains.values().cloned().collect()
        };

        let mut states = Vec::new();
        for slot in slots {
            if let Some(state) = slot.lock().await.clone() {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(states)
    }

    /// Record a signature attached after the fact.
    pub async fn note_checkpoint(
        &self,
        node_id: &str,
        sequence_number: u64,
        protection: &Protection,
    ) -> Result<()> {
        let slot = self.slot(node_id)?;
        let mut guard = slot.lock().await;
        if let Some(state) = guard.as_mut() {
            let newer = state
                .last_checkpoint_sequence
                .map_or(true, |seq| sequence_number > seq);
            if newer && sequence_number <= state.last_sequence_number {
                state.last_checkpoint_sequence = Some(sequence_number);
                state.last_checkpoint_time = Some(protection.signed_at);
            }
        }
        Ok(())
    }

    pub fn forget(&self, node_id: &str) -> Result<()> {
        self.chains
            .lock()
            .map_err(|_| ProtectedLogError::Store("chain table lock poisoned".to_string()))?
            .remove(node_id);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.chains
            .lock()
            .map_err(|_| ProtectedLogError::Store("chain table lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryLogStore;

    #[tokio::test]
    async fn test_append_links_entries() {
        let store = Arc::new(MemoryLogStore::new());
        let linker = ChainLinker::new(store.clone());

        let first = linker.append("node-1", LogEvent::internal("test", "a")).await.unwrap();
        let second = linker.append("node-1", LogEvent::internal("test", "b")).await.unwrap();
        let other = linker.append("node-2", LogEvent::internal("test", "c")).await.unwrap();

        assert_eq!(first.sequence_number, 0);
        assert_eq!(second.sequence_number, 1);
        assert_eq!(second.previous_hash.as_deref(), Some(first.current_hash.as_str()));
        assert_eq!(other.sequence_number, 0);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resume_from_store() {
        let store = Arc::new(MemoryLogStore::new());
        let linker = ChainLinker::new(store.clone());
        let last = linker.append("node-1", LogEvent::internal("test", "a")).await.unwrap();

        let restarted = ChainLinker::new(store.clone());
        let next = restarted.append("node-1", LogEvent::internal("test", "b")).await.unwrap();
        assert_eq!(next.sequence_number, 1);
        assert_eq!(next.previous_hash, Some(last.current_hash));
    }

    #[tokio::test]
    async fn test_failed_signature_leaves_state_unchanged() {
        let store = Arc::new(MemoryLogStore::new());
        let linker = ChainLinker::new(store.clone());
        linker.append("node-1", LogEvent::internal("test", "a")).await.unwrap();

        let result = linker
            .append_with("node-1", LogEvent::internal("test", "b"), |_, _| {
                Err(ProtectedLogError::TokenUnavailable("offline".to_string()))
            })
            .await;
        assert!(result.is_err());

        let state = linker.chain_state("node-1").await.unwrap().unwrap();
        assert_eq!(state.last_sequence_number, 0);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
