//! Merkle Tree for Export Bundles
//!
//! Commits to the ordered entry hashes of an export slice so a bundle can
//! be checked against a single root.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::audit::entry::LogEntry;
use crate::error::{ProtectedLogError, Result};

fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Root over the entry hashes in order. An odd node out is paired with itself.
pub fn merkle_root(entries: &[LogEntry]) -> Result<String> {
    let mut level: Vec<String> = entries.iter().map(|e| e.current_hash.clone()).collect();
    if level.is_empty() {
        return Err(ProtectedLogError::misuse(
            "cannot build a Merkle tree from no entries",
        ));
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                combine(left, pair.get(1).unwrap_or(left))
            })
            .collect();
    }

    let root = level.swap_remove(0);
    debug!("Merkle root over {} entries: {}", entries.len(), root);
    Ok(root)
}

pub fn verify_merkle_root(entries: &[LogEntry], claimed_root: &str) -> Result<bool> {
    Ok(merkle_root(entries)? == claimed_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::LogEvent;

    fn entries(count: u64) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = Vec::new();
        for seq in 0..count {
            let prev = entries.last().map(|e| e.current_hash.clone());
            entries.push(LogEntry::chained(
                "node-1",
                seq,
                prev,
                LogEvent::internal("test", format!("{}", seq)),
            ));
        }
        entries
    }

    #[test]
    fn test_root_depends_on_order_and_content() {
        let mut list = entries(5);
        let root = merkle_root(&list).unwrap();
        assert!(root.starts_with("sha256:"));
        assert!(verify_merkle_root(&list, &root).unwrap());

        list.swap(1, 2);
        assert!(!verify_merkle_root(&list, &root).unwrap());
    }

    #[test]
    fn test_single_entry_and_empty() {
        let list = entries(1);
        assert_eq!(merkle_root(&list).unwrap(), list[0].current_hash);
        assert!(merkle_root(&[]).is_err());
    }

    #[test]
    fn test_odd_hash_is_paired_with_itself() {
        let list = entries(3);
        let left = combine(&list[0].current_hash, &list[1].current_hash);
        let right = combine(&list[2].current_hash, &list[2].current_hash);
        assert_eq!(merkle_root(&list).unwrap(), combine(&left, &right));
    }
}
