//! In-memory log store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::models::{ExportCursor, LogQuery};
use super::LogStore;
use crate::audit::entry::{LogEntry, Protection};
use crate::error::{ProtectedLogError, Result};

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<(String, u64), LogEntry>,
    cursors: HashMap<String, ExportCursor>,
    reset_epoch: u64,
}

/// Log store backed by a `RwLock<BTreeMap>`.
///
/// Used by tests and by short-lived tools. The fault injection helpers
/// simulate an attacker with direct write access to the rows.
#[derive(Default)]
pub struct MemoryLogStore {
    state: RwLock<MemoryState>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| ProtectedLogError::Store("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| ProtectedLogError::Store("memory store lock poisoned".to_string()))
    }

    /// Drop a row behind the log's back.
    pub fn delete_entry(&self, node_id: &str, sequence_number: u64) -> Result<bool> {
        let mut state = self.write()?;
        Ok(state
            .entries
            .remove(&(node_id.to_string(), sequence_number))
            .is_some())
    }

    /// Rewrite a row behind the log's back.
    pub fn tamper<F>(&self, node_id: &str, sequence_number: u64, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut LogEntry),
    {
        let mut state = self.write()?;
        match state.entries.get_mut(&(node_id.to_string(), sequence_number)) {
            Some(entry) => {
                edit(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.write()?;
        let key = (entry.node_id.clone(), entry.sequence_number);
        if state.entries.contains_key(&key) {
            return Err(ProtectedLogError::Store(format!(
                "entry {}#{} already exists",
                entry.node_id, entry.sequence_number
            )));
        }
        debug!("Stored entry {}#{}", entry.node_id, entry.sequence_number);
        state.entries.insert(key, entry.clone());
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let state = self.read()?;
        let matching = state.entries.values().filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit as usize).collect(),
            None => matching.collect(),
        })
    }

    async fn newest_entry(&self, node_id: Option<&str>) -> Result<Option<LogEntry>> {
        let state = self.read()?;
        let newest = match node_id {
            Some(node) => state
                .entries
                .values()
                .filter(|e| e.node_id == node)
                .max_by_key(|e| e.sequence_number),
            None => state.entries.values().max_by_key(|e| e.timestamp),
        };
        Ok(newest.cloned())
    }

    async fn node_ids(&self) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut nodes: Vec<String> = state.entries.keys().map(|(n, _)| n.clone()).collect();
        nodes.dedup();
        Ok(nodes)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read()?.entries.len() as u64)
    }

    async fn set_protection(
        &self,
        node_id: &str,
        sequence_number: u64,
        protection: &Protection,
    ) -> Result<()> {
        let mut state = self.write()?;
        let entry = state
            .entries
            .get_mut(&(node_id.to_string(), sequence_number))
            .ok_or_else(|| {
                ProtectedLogError::Store(format!(
                    "entry {}#{} does not exist",
                    node_id, sequence_number
                ))
            })?;
        entry.protection = Some(protection.clone());
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<u64> {
        let mut state = self.write()?;
        let before = state.entries.len();
        state.entries.retain(|(n, _), _| n != node_id);
        Ok((before - state.entries.len()) as u64)
    }

    async fn remove_all(&self) -> Result<u64> {
        let mut state = self.write()?;
        let removed = state.entries.len() as u64;
        state.entries.clear();
        Ok(removed)
    }

    async fn load_cursor(&self, destination: &str) -> Result<Option<ExportCursor>> {
        Ok(self.read()?.cursors.get(destination).cloned())
    }

    async fn save_cursor(&self, destination: &str, cursor: &ExportCursor) -> Result<()> {
        self.write()?
            .cursors
            .insert(destination.to_string(), cursor.clone());
        Ok(())
    }

    async fn reset_epoch(&self) -> Result<u64> {
        Ok(self.read()?.reset_epoch)
    }

    async fn advance_reset_epoch(&self) -> Result<u64> {
        let mut state = self.write()?;
        state.reset_epoch += 1;
        Ok(state.reset_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::LogEvent;

    fn chain(store_node: &str, len: u64) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = Vec::new();
        for seq in 0..len {
            let prev = entries.last().map(|e| e.current_hash.clone());
            entries.push(LogEntry::chained(
                store_node,
                seq,
                prev,
                LogEvent::internal("test", format!("entry {}", seq)),
            ));
        }
        entries
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let store = MemoryLogStore::new();
        for entry in chain("node-b", 3).iter().chain(chain("node-a", 2).iter()) {
            store.append(entry).await.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 5);
        assert_eq!(store.node_ids().await.unwrap(), vec!["node-a", "node-b"]);

        let slice = store
            .query(&LogQuery::node("node-b").after(0).up_to(1))
            .await
            .unwrap();
        assert_eq!(slice.len(), 1);
        assert_eq!(slice[0].sequence_number, 1);

        let tail = store.newest_entry(Some("node-b")).await.unwrap().unwrap();
        assert_eq!(tail.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_duplicate_position_is_rejected() {
        let store = MemoryLogStore::new();
        let entries = chain("node-a", 1);
        store.append(&entries[0]).await.unwrap();
        assert!(store.append(&entries[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_and_epoch() {
        let store = MemoryLogStore::new();
        for entry in chain("node-a", 2).iter().chain(chain("node-b", 2).iter()) {
            store.append(entry).await.unwrap();
        }
        assert_eq!(store.remove_node("node-a").await.unwrap(), 2);
        assert_eq!(store.node_ids().await.unwrap(), vec!["node-b"]);
        assert_eq!(store.remove_all().await.unwrap(), 2);

        assert_eq!(store.reset_epoch().await.unwrap(), 0);
        assert_eq!(store.advance_reset_epoch().await.unwrap(), 1);
        assert_eq!(store.reset_epoch().await.unwrap(), 1);
    }
}
