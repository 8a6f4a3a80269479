//! Protected Log Verification
//!
//! Walks stored chains against a snapshot of every node's tail, recomputes
//! hashes and links, validates checkpoint signatures and classifies what it
//! finds as a [`FailureCause`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audit::actions::{ActionDispatcher, DispatchContext, FailureCause};
use crate::audit::entry::{LogEntry, EVENT_LOG_STOPPED};
use crate::crypto::SigningCapability;
use crate::database::{LogQuery, LogStore};
use crate::error::{ProtectedLogError, Result};

/// Which entries a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationScope {
    EntireLog,
    /// Entries written at or after the given time.
    Since(DateTime<Utc>),
}

/// One detected integrity problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub cause: FailureCause,
    pub node_id: Option<String>,
    pub sequence_number: Option<u64>,
    pub detail: String,
}

impl Anomaly {
    pub fn new(
        cause: FailureCause,
        node_id: &str,
        sequence_number: Option<u64>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            cause,
            node_id: Some(node_id.to_string()),
            sequence_number,
            detail: detail.into(),
        }
    }

    pub fn context(&self) -> DispatchContext {
        DispatchContext {
            node_id: self.node_id.clone(),
            sequence_number: self.sequence_number,
            detail: self.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Most severe cause found, `VERIFY_SUCCESS` when clean.
    pub cause: FailureCause,
    pub anomalies: Vec<Anomaly>,
    pub nodes_checked: usize,
    pub entries_checked: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn is_success(&self) -> bool {
        self.cause.is_success()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} nodes, {} entries, {} anomalies",
            self.cause,
            self.nodes_checked,
            self.entries_checked,
            self.anomalies.len()
        )
    }
}

/// Check hashes, links and contiguity of a run of one node's entries.
///
/// `expected_first` is the sequence number the run must start at and
/// `previous_hash` the hash the first entry must link to (`None` for a
/// genesis entry).
pub fn check_chain_segment(
    entries: &[LogEntry],
    expected_first: u64,
    previous_hash: Option<&str>,
) -> Option<Anomaly> {
    let mut expected_sequence = expected_first;
    let mut expected_previous = previous_hash.map(str::to_string);

    for entry in entries {
        if !entry.verify_hash() {
            return Some(Anomaly::new(
                FailureCause::ModifiedLogRow,
                &entry.node_id,
                Some(entry.sequence_number),
                "recomputed hash does not match",
            ));
        }
        if entry.sequence_number != expected_sequence {
            return Some(Anomaly::new(
                FailureCause::MissingLogRow,
                &entry.node_id,
                Some(expected_sequence),
                format!(
                    "expected sequence {}, found {}",
                    expected_sequence, entry.sequence_number
                ),
            ));
        }
        if entry.previous_hash != expected_previous {
            return Some(Anomaly::new(
                FailureCause::ModifiedLogRow,
                &entry.node_id,
                Some(entry.sequence_number),
                "previous hash does not link to the prior entry",
            ));
        }
        expected_sequence += 1;
        expected_previous = Some(entry.current_hash.clone());
    }
    None
}

/// Entries of one node selected for a pass and where they must attach.
struct Segment {
    entries: Vec<LogEntry>,
    first_sequence: u64,
    previous_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownTail {
    sequence_number: u64,
    current_hash: String,
}

pub struct VerificationEngine {
    store: Arc<dyn LogStore>,
    capability: Arc<dyn SigningCapability>,
    dispatcher: ActionDispatcher,
    search_window: Duration,
    protection_interval: Option<Duration>,
    known_tails: StdMutex<HashMap<String, KnownTail>>,
    observed_entries: AtomicBool,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn LogStore>,
        capability: Arc<dyn SigningCapability>,
        dispatcher: ActionDispatcher,
        search_window: Duration,
        protection_interval: Option<Duration>,
    ) -> Self {
        Self {
            store,
            capability,
            dispatcher,
            search_window,
            protection_interval,
            known_tails: StdMutex::new(HashMap::new()),
            observed_entries: AtomicBool::new(false),
        }
    }

    fn known_tails(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, KnownTail>>> {
        self.known_tails
            .lock()
            .map_err(|_| ProtectedLogError::Store("verifier state lock poisoned".to_string()))
    }

    /// Drop everything remembered about `node_id`.
    pub fn forget(&self, node_id: &str) -> Result<()> {
        self.known_tails()?.remove(node_id);
        Ok(())
    }

    /// Forget every node and treat the log as never observed.
    pub fn reset(&self) -> Result<()> {
        self.known_tails()?.clear();
        self.observed_entries.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Note a tail this process wrote itself.
    pub fn observe(&self, entry: &LogEntry) -> Result<()> {
        let mut known = self.known_tails()?;
        let advance = known
            .get(&entry.node_id)
            .map_or(true, |k| entry.sequence_number >= k.sequence_number);
        if advance {
            known.insert(
                entry.node_id.clone(),
                KnownTail {
                    sequence_number: entry.sequence_number,
                    current_hash: entry.current_hash.clone(),
                },
            );
        }
        self.observed_entries.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run a pass and dispatch every anomaly found.
    pub async fn verify(
        &self,
        scope: VerificationScope,
        freeze_threshold: Duration,
    ) -> Result<VerificationReport> {
        match self.run(scope, freeze_threshold).await {
            Ok(report) => {
                for anomaly in &report.anomalies {
                    self.dispatcher.dispatch(anomaly.cause, &anomaly.context());
                }
                if report.is_success() {
                    info!("Protected log verified: {}", report.summary());
                } else {
                    warn!("Protected log verification failed: {}", report.summary());
                }
                Ok(report)
            }
            Err(e) => {
                error!("Protected log verification aborted: {}", e);
                self.dispatcher.dispatch(
                    FailureCause::InternalError,
                    &DispatchContext::new(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        scope: VerificationScope,
        freeze_threshold: Duration,
    ) -> Result<VerificationReport> {
        let started_at = Utc::now();

        let mut tails = BTreeMap::new();
        for node_id in self.store.node_ids().await? {
            if let Some(tail) = self.store.newest_entry(Some(&node_id)).await? {
                tails.insert(node_id, tail);
            }
        }
        debug!("Verification snapshot covers {} nodes", tails.len());

        let known = self.known_tails()?.clone();
        let mut anomalies = Vec::new();
        let mut entries_checked = 0;

        if tails.is_empty() && known.is_empty() && !self.observed_entries.load(Ordering::SeqCst) {
            anomalies.push(Anomaly {
                cause: FailureCause::EmptyLog,
                node_id: None,
                sequence_number: None,
                detail: "no entries have been written".to_string(),
            });
        }

        for (node_id, tail) in &tails {
            let (checked, anomaly) = self
                .check_node(scope, freeze_threshold, tail, known.get(node_id))
                .await?;
            entries_checked += checked;
            if let Some(anomaly) = anomaly {
                anomalies.push(anomaly);
            }
        }

        for (node_id, tail) in &known {
            if !tails.contains_key(node_id) {
                anomalies.push(Anomaly::new(
                    FailureCause::MissingLogRow,
                    node_id,
                    Some(tail.sequence_number),
                    "chain vanished from the store",
                ));
            }
        }

        {
            let mut remembered = self.known_tails()?;
            for (node_id, tail) in &tails {
                let advance = remembered
                    .get(node_id)
                    .map_or(true, |k| tail.sequence_number >= k.sequence_number);
                if advance {
                    remembered.insert(
                        node_id.clone(),
                        KnownTail {
                            sequence_number: tail.sequence_number,
                            current_hash: tail.current_hash.clone(),
                        },
                    );
                }
            }
        }
        if !tails.is_empty() {
            self.observed_entries.store(true, Ordering::SeqCst);
        }

        let cause = anomalies
            .iter()
            .fold(FailureCause::VerifySuccess, |worst, a| worst.worst(a.cause));
        Ok(VerificationReport {
            cause,
            anomalies,
            nodes_checked: tails.len(),
            entries_checked,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn check_node(
        &self,
        scope: VerificationScope,
        freeze_threshold: Duration,
        tail: &LogEntry,
        known: Option<&KnownTail>,
    ) -> Result<(u64, Option<Anomaly>)> {
        let node_id = tail.node_id.as_str();

        let segment = match scope {
            VerificationScope::EntireLog => Segment {
                entries: self
                    .store
                    .query(&LogQuery::node(node_id).up_to(tail.sequence_number))
                    .await?,
                first_sequence: 0,
                previous_hash: None,
            },
            VerificationScope::Since(since) => match self.segment_since(node_id, since, tail).await? {
                Ok(segment) => segment,
                Err(anomaly) => return Ok((0, Some(anomaly))),
            },
        };
        let first_sequence = segment.first_sequence;
        let entries = segment.entries;
        let checked = entries.len() as u64;

        if let Some(anomaly) = check_chain_segment(
            &entries,
            first_sequence,
            segment.previous_hash.as_deref(),
        ) {
            return Ok((checked, Some(anomaly)));
        }

        if let Some(anomaly) = self.check_signatures(&entries) {
            return Ok((checked, Some(anomaly)));
        }

        if let Some(known) = known {
            if tail.sequence_number < known.sequence_number {
                return Ok((
                    checked,
                    Some(Anomaly::new(
                        FailureCause::RolledBack,
                        node_id,
                        Some(tail.sequence_number),
                        format!(
                            "tail moved back from {} to {}",
                            known.sequence_number, tail.sequence_number
                        ),
                    )),
                ));
            }
            if tail.sequence_number == known.sequence_number
                && tail.current_hash != known.current_hash
            {
                return Ok((
                    checked,
                    Some(Anomaly::new(
                        FailureCause::ModifiedLogRow,
                        node_id,
                        Some(tail.sequence_number),
                        "tail entry was replaced since the last pass",
                    )),
                ));
            }
        }

        if let Some(anomaly) = self.check_coverage(node_id, &entries, first_sequence).await? {
            return Ok((checked, Some(anomaly)));
        }

        Ok((checked, self.check_freeze(tail, freeze_threshold).await?))
    }

    /// Entries of `node_id` from the first one written at or after `since`.
    async fn segment_since(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        tail: &LogEntry,
    ) -> Result<std::result::Result<Segment, Anomaly>> {
        let first = self
            .store
            .query(&LogQuery::node(node_id).up_to(tail.sequence_number).since(since).limit(1))
            .await?;
        let first_sequence = match first.first() {
            Some(entry) => entry.sequence_number,
            None => {
                return Ok(Ok(Segment {
                    entries: Vec::new(),
                    first_sequence: tail.sequence_number + 1,
                    previous_hash: Some(tail.current_hash.clone()),
                }))
            }
        };
        if first_sequence == 0 {
            let entries = self
                .store
                .query(&LogQuery::node(node_id).up_to(tail.sequence_number))
                .await?;
            return Ok(Ok(Segment {
                entries,
                first_sequence: 0,
                previous_hash: None,
            }));
        }

        let entries = self
            .store
            .query(
                &LogQuery::node(node_id)
                    .after(first_sequence - 1)
                    .up_to(tail.sequence_number),
            )
            .await?;
        let mut predecessor_query = LogQuery::node(node_id).up_to(first_sequence - 1);
        if first_sequence >= 2 {
            predecessor_query = predecessor_query.after(first_sequence - 2);
        }
        let predecessor = self.store.query(&predecessor_query).await?;
        match predecessor.into_iter().find(|e| e.sequence_number == first_sequence - 1) {
            Some(previous) => Ok(Ok(Segment {
                entries,
                first_sequence,
                previous_hash: Some(previous.current_hash),
            })),
            None => Ok(Err(Anomaly::new(
                FailureCause::MissingLogRow,
                node_id,
                Some(first_sequence - 1),
                "predecessor of the verified range is missing",
            ))),
        }
    }

    fn check_signatures(&self, entries: &[LogEntry]) -> Option<Anomaly> {
        for entry in entries {
            let protection = match &entry.protection {
                Some(protection) => protection,
                None => continue,
            };
            let verdict = self.capability.verify(
                entry.current_hash.as_bytes(),
                &protection.signature,
                &protection.certificate,
            );
            let detail = match verdict {
                Ok(true) => continue,
                Ok(false) => "checkpoint signature is invalid".to_string(),
                Err(e) => format!("checkpoint certificate cannot be trusted: {}", e),
            };
            return Some(Anomaly::new(
                FailureCause::UnverifiableChain,
                &entry.node_id,
                Some(entry.sequence_number),
                detail,
            ));
        }
        None
    }

    /// A chain with no checkpoint is unverifiable. An unsigned tail after a
    /// checkpoint is tolerated for `protection_interval + search_window`.
    async fn check_coverage(
        &self,
        node_id: &str,
        entries: &[LogEntry],
        first_sequence: u64,
    ) -> Result<Option<Anomaly>> {
        let last_checkpoint = entries.iter().rposition(LogEntry::is_checkpoint);
        if last_checkpoint.is_none() && !self.has_checkpoint_before(node_id, first_sequence).await? {
            return Ok(Some(Anomaly::new(
                FailureCause::UnverifiableChain,
                node_id,
                Some(0),
                "chain has no checkpoint signature",
            )));
        }
        let first_unsigned = match last_checkpoint {
            Some(index) => entries.get(index + 1),
            None => entries.first(),
        };
        let first_unsigned = match first_unsigned {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let grace = match self.protection_interval {
            Some(interval) => self.search_window.checked_add(&interval),
            None => Some(self.search_window),
        };
        let age = Utc::now().signed_duration_since(first_unsigned.timestamp);
        if grace.map_or(false, |grace| age >= grace) {
            return Ok(Some(Anomaly::new(
                FailureCause::UnverifiableChain,
                node_id,
                Some(first_unsigned.sequence_number),
                "unsigned tail is older than the protection grace period",
            )));
        }
        Ok(None)
    }

    async fn has_checkpoint_before(&self, node_id: &str, first_sequence: u64) -> Result<bool> {
        if first_sequence == 0 {
            return Ok(false);
        }
        let earlier = self
            .store
            .query(&LogQuery::node(node_id).up_to(first_sequence - 1))
            .await?;
        Ok(earlier.iter().any(LogEntry::is_checkpoint))
    }

    async fn check_freeze(&self, tail: &LogEntry, threshold: Duration) -> Result<Option<Anomaly>> {
        if tail.event_kind == EVENT_LOG_STOPPED {
            return Ok(None);
        }
        let now = Utc::now();
        if now - tail.timestamp <= threshold {
            return Ok(None);
        }

        // The node may have committed after the snapshot was taken.
        let newest = self.store.newest_entry(Some(&tail.node_id)).await?;
        let latest = newest.as_ref().unwrap_or(tail);
        if latest.event_kind == EVENT_LOG_STOPPED || now - latest.timestamp <= threshold {
            return Ok(None);
        }

        Ok(Some(Anomaly::new(
            FailureCause::Frozen,
            &tail.node_id,
            Some(latest.sequence_number),
            format!("no entry since {}", latest.timestamp),
        )))
    }
}
