//! Protected Log Device
//!
//! Owns one node's logging session and wires the linker, signer, verifier,
//! exporter and action dispatcher together. Constructed explicitly and shut
//! down explicitly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::actions::{ActionDispatcher, DispatchContext, FailureCause, TestAction};
use crate::audit::entry::{
    LogEntry, LogEvent, NodeChainState, EVENT_LOG_INITIALIZED, EVENT_LOG_STOPPED,
};
use crate::audit::export::{ExportReceipt, LogExporter};
use crate::audit::linker::ChainLinker;
use crate::audit::signer::ChainSigner;
use crate::audit::verify::{VerificationEngine, VerificationReport, VerificationScope};
use crate::config::ProtectedLogConfig;
use crate::crypto::{SigningCapability, TokenReference};
use crate::database::{LogQuery, LogStore};
use crate::error::{ProtectedLogError, Result};

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) initialized: bool,
    pub(crate) stopped: bool,
    pub(crate) last_written: Option<(u64, String)>,
    pub(crate) last_own_check: Option<DateTime<Utc>>,
}

pub struct ProtectedLog {
    pub(crate) config: ProtectedLogConfig,
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) dispatcher: ActionDispatcher,
    pub(crate) linker: ChainLinker,
    pub(crate) signer: ChainSigner,
    pub(crate) verifier: VerificationEngine,
    pub(crate) exporter: Option<LogExporter>,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) verification: Mutex<()>,
    pub(crate) maintenance: Mutex<()>,
}

impl ProtectedLog {
    pub fn new(
        config: ProtectedLogConfig,
        store: Arc<dyn LogStore>,
        capability: Arc<dyn SigningCapability>,
    ) -> Result<Self> {
        config.validate()?;
        let token = config.token_reference()?;
        let dispatcher = ActionDispatcher::from_config(&config);

        let signer = ChainSigner::new(
            store.clone(),
            capability.clone(),
            token.clone(),
            config.sign_after_appends,
            config.protection_interval(),
        );
        let verifier = VerificationEngine::new(
            store.clone(),
            capability.clone(),
            dispatcher.clone(),
            config.search_window(),
            config.protection_interval(),
        );
        let exporter = config.export_path.as_deref().map(|path| {
            LogExporter::new(
                store.clone(),
                capability.clone(),
                dispatcher.clone(),
                path,
                config.export_signer_ca_name.as_deref(),
                config.export_older_than(),
            )
        });

        info!(
            "Protected log device for node {} (token {})",
            config.node_id, token
        );
        Ok(Self {
            linker: ChainLinker::new(store.clone()),
            config,
            store,
            dispatcher,
            signer,
            verifier,
            exporter,
            session: Mutex::new(SessionState::default()),
            verification: Mutex::new(()),
            maintenance: Mutex::new(()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &ProtectedLogConfig {
        &self.config
    }

    pub fn token(&self) -> &TokenReference {
        self.signer.token()
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Capture action configured through `use_test_action`.
    pub fn test_capture(&self) -> Option<TestAction> {
        self.dispatcher.test_capture()
    }

    pub async fn chain_state(&self) -> Result<Option<NodeChainState>> {
        self.linker.chain_state(self.node_id()).await
    }

    /// Append an event to this node's chain.
    pub async fn log(&self, event: LogEvent) -> Result<LogEntry> {
        let mut session = self.session.lock().await;

        if !session.initialized {
            let was_empty = self.store.count().await? == 0;
            let started = LogEvent::internal(EVENT_LOG_INITIALIZED, "Initiating log")
                .at(event.timestamp - Duration::milliseconds(1));
            self.append_locked(&mut session, started).await?;
            session.initialized = true;
            if was_empty {
                self.dispatcher.dispatch(
                    FailureCause::EmptyLog,
                    &DispatchContext::for_node(self.node_id(), None, "log was empty at startup"),
                );
            }
        }

        self.check_own_tail(&mut session).await;
        self.append_locked(&mut session, event).await
    }

    pub(crate) async fn append_locked(
        &self,
        session: &mut SessionState,
        event: LogEvent,
    ) -> Result<LogEntry> {
        let stopped = session.stopped;
        let entry = self
            .linker
            .append_with(self.node_id(), event, |state, entry| {
                if stopped {
                    Ok(None)
                } else {
                    self.signer.protection_for(state, entry)
                }
            })
            .await?;
        session.last_written = Some((entry.sequence_number, entry.current_hash.clone()));
        self.verifier.observe(&entry)?;
        Ok(entry)
    }

    /// Sign `entry` after the fact if a CA is configured and it is not signed yet.
    pub(crate) async fn seal(&self, entry: &LogEntry) -> Result<()> {
        if self.token().is_none() || entry.is_checkpoint() {
            return Ok(());
        }
        let protection = self.signer.sign(entry)?;
        self.store
            .set_protection(&entry.node_id, entry.sequence_number, &protection)
            .await?;
        self.linker
            .note_checkpoint(&entry.node_id, entry.sequence_number, &protection)
            .await
    }

    /// Make sure the store still holds the last entry this session wrote.
    async fn check_own_tail(&self, session: &mut SessionState) {
        if self.token().is_none() {
            return;
        }
        let interval = match self.config.verify_own_interval() {
            Some(interval) => interval,
            None => return,
        };
        let now = Utc::now();
        if session.last_own_check.map_or(false, |last| now - last < interval) {
            return;
        }
        session.last_own_check = Some(now);

        let (sequence_number, hash) = match &session.last_written {
            Some(last) => last.clone(),
            None => return,
        };
        let mut query = LogQuery::node(self.node_id()).up_to(sequence_number);
        if sequence_number > 0 {
            query = query.after(sequence_number - 1);
        }
        let stored = match self.store.query(&query).await {
            Ok(entries) => entries.into_iter().find(|e| e.sequence_number == sequence_number),
            Err(e) => {
                warn!("Own tail check failed: {}", e);
                return;
            }
        };

        let cause = match stored {
            None => FailureCause::MissingLogRow,
            Some(entry) if entry.current_hash != hash || !entry.verify_hash() => {
                FailureCause::ModifiedLogRow
            }
            Some(_) => return,
        };
        error!(
            "Last entry {}#{} written by this node is no longer intact",
            self.node_id(),
            sequence_number
        );
        self.dispatcher.dispatch(
            cause,
            &DispatchContext::for_node(self.node_id(), Some(sequence_number), "own tail check"),
        );
    }

    /// Write `log_stopped` and stop signing. Later entries are appended unsigned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.stopped {
            return Ok(());
        }
        let entry = self
            .append_locked(
                &mut session,
                LogEvent::internal(EVENT_LOG_STOPPED, "Terminating log session"),
            )
            .await?;
        self.seal(&entry).await?;
        session.stopped = true;
        info!("Protected log session of {} stopped", self.node_id());
        Ok(())
    }

    pub async fn verify_entire_log(&self, freeze_threshold: Duration) -> Result<VerificationReport> {
        let _pass = self.verification.lock().await;
        self.verifier
            .verify(VerificationScope::EntireLog, freeze_threshold)
            .await
    }

    pub async fn verify_since(
        &self,
        since: DateTime<Utc>,
        freeze_threshold: Duration,
    ) -> Result<VerificationReport> {
        let _pass = self.verification.lock().await;
        self.verifier
            .verify(VerificationScope::Since(since), freeze_threshold)
            .await
    }

    /// Scheduled pass; `None` when another pass is still running.
    pub async fn run_verification_if_not_busy(&self) -> Result<Option<VerificationReport>> {
        let _pass = match self.verification.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Verification already running, skipping");
                return Ok(None);
            }
        };
        self.verifier
            .verify(VerificationScope::EntireLog, self.config.freeze_threshold())
            .await
            .map(Some)
    }

    fn exporter(&self) -> Result<&LogExporter> {
        self.exporter
            .as_ref()
            .ok_or_else(|| ProtectedLogError::misuse("no export_path configured"))
    }

    pub async fn export_log(&self) -> Result<Option<ExportReceipt>> {
        let exporter = self.exporter()?;
        let _maintenance = self.maintenance.lock().await;
        exporter.export_log().await
    }

    /// Scheduled export; `Ok(None)` also when maintenance is already running.
    pub async fn run_export_if_not_busy(&self) -> Result<Option<ExportReceipt>> {
        let exporter = self.exporter()?;
        let _maintenance = match self.maintenance.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Export or recovery already running, skipping");
                return Ok(None);
            }
        };
        exporter.export_log().await
    }

    /// Sign the open tails of the chains this device writes.
    pub async fn sign_pending(&self) -> Result<usize> {
        if self.token().is_none() {
            return Ok(0);
        }
        if self.session.lock().await.stopped {
            return Ok(0);
        }
        self.signer.sign_pending(&self.linker).await
    }
}
