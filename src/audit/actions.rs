//! Failure Causes and Actions
//!
//! Integrity anomalies are plain values. The dispatcher routes each detected
//! cause to the configured actions without ever failing the caller.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::ProtectedLogConfig;

/// Outcome of a verification pass or export slice check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCause {
    EmptyLog,
    Frozen,
    MissingLogRow,
    ModifiedLogRow,
    RolledBack,
    UnverifiableChain,
    InternalError,
    VerifySuccess,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::EmptyLog => "EMPTY_LOG",
            FailureCause::Frozen => "FROZEN",
            FailureCause::MissingLogRow => "MISSING_LOG_ROW",
            FailureCause::ModifiedLogRow => "MODIFIED_LOG_ROW",
            FailureCause::RolledBack => "ROLLED_BACK",
            FailureCause::UnverifiableChain => "UNVERIFIABLE_CHAIN",
            FailureCause::InternalError => "INTERNAL_ERROR",
            FailureCause::VerifySuccess => "VERIFY_SUCCESS",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureCause::EmptyLog => "The protected log is empty",
            FailureCause::Frozen => "A node has stopped writing to the protected log",
            FailureCause::MissingLogRow => "A protected log row is missing",
            FailureCause::ModifiedLogRow => "A protected log row has been modified",
            FailureCause::RolledBack => "A node's protected log chain has been rolled back",
            FailureCause::UnverifiableChain => "A protected log chain could not be verified",
            FailureCause::InternalError => "Verification of the protected log failed internally",
            FailureCause::VerifySuccess => "The protected log verified successfully",
        }
    }

    /// Lower is more severe.
    pub fn severity(&self) -> u8 {
        match self {
            FailureCause::ModifiedLogRow => 0,
            FailureCause::MissingLogRow => 1,
            FailureCause::RolledBack => 2,
            FailureCause::UnverifiableChain => 3,
            FailureCause::Frozen => 4,
            FailureCause::InternalError => 5,
            FailureCause::EmptyLog => 6,
            FailureCause::VerifySuccess => 7,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FailureCause::VerifySuccess)
    }

    /// The more severe of two causes.
    pub fn worst(self, other: FailureCause) -> FailureCause {
        if other.severity() < self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an anomaly was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchContext {
    pub node_id: Option<String>,
    pub sequence_number: Option<u64>,
    pub detail: String,
}

impl DispatchContext {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            node_id: None,
            sequence_number: None,
            detail: detail.into(),
        }
    }

    pub fn for_node(node_id: &str, sequence_number: Option<u64>, detail: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            sequence_number,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node_id, self.sequence_number) {
            (Some(node), Some(seq)) => write!(f, "{}#{}: {}", node, seq, self.detail),
            (Some(node), None) => write!(f, "{}: {}", node, self.detail),
            _ => f.write_str(&self.detail),
        }
    }
}

/// Records dispatched causes so tests can assert on them.
#[derive(Debug, Clone, Default)]
pub struct TestAction {
    causes: Arc<Mutex<Vec<FailureCause>>>,
}

impl TestAction {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, cause: FailureCause) {
        match self.causes.lock() {
            Ok(mut causes) => causes.push(cause),
            Err(poisoned) => poisoned.into_inner().push(cause),
        }
    }

    pub fn causes(&self) -> Vec<FailureCause> {
        match self.causes.lock() {
            Ok(causes) => causes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_cause(&self) -> Option<FailureCause> {
        self.causes().last().copied()
    }

    pub fn clear(&self) {
        match self.causes.lock() {
            Ok(mut causes) => causes.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProtectedLogAction {
    NoOp,
    /// Runs `target <CAUSE> <description>`.
    Script { target: String },
    Test(TestAction),
}

impl ProtectedLogAction {
    fn run(&self, cause: FailureCause, context: &DispatchContext) {
        match self {
            ProtectedLogAction::NoOp => {
                debug!("No action taken for {} ({})", cause, context);
            }
            ProtectedLogAction::Script { target } => run_script(target, cause),
            ProtectedLogAction::Test(capture) => capture.record(cause),
        }
    }
}

fn run_script(target: &str, cause: FailureCause) {
    let mut parts = target.split_whitespace();
    let program = match parts.next() {
        Some(program) => program.to_string(),
        None => {
            error!("Script action has no target configured");
            return;
        }
    };
    let mut args: Vec<String> = parts.map(str::to_string).collect();
    args.push(cause.as_str().to_string());
    args.push(cause.description().to_string());

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match tokio::process::Command::new(&program).args(&args).status().await {
                    Ok(status) if status.success() => {
                        debug!("Script action {} finished for {}", program, cause)
                    }
                    Ok(status) => error!("Script action {} exited with {}", program, status),
                    Err(e) => error!("Script action {} failed to start: {}", program, e),
                }
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                match std::process::Command::new(&program).args(&args).status() {
                    Ok(status) if status.success() => {}
                    Ok(status) => error!("Script action {} exited with {}", program, status),
                    Err(e) => error!("Script action {} failed to start: {}", program, e),
                }
            });
        }
    }
}

/// Routes detected causes to every configured action.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    actions: Vec<ProtectedLogAction>,
}

impl ActionDispatcher {
    pub fn new(actions: Vec<ProtectedLogAction>) -> Self {
        let actions = if actions.is_empty() {
            vec![ProtectedLogAction::NoOp]
        } else {
            actions
        };
        Self { actions }
    }

    pub fn from_config(config: &ProtectedLogConfig) -> Self {
        let mut actions = Vec::new();
        if let Some(target) = config
            .script_action_target
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            actions.push(ProtectedLogAction::Script {
                target: target.to_string(),
            });
        }
        if config.use_test_action {
            actions.push(ProtectedLogAction::Test(TestAction::new()));
        }
        Self::new(actions)
    }

    /// The capture action, when one is configured.
    pub fn test_capture(&self) -> Option<TestAction> {
        self.actions.iter().find_map(|action| match action {
            ProtectedLogAction::Test(capture) => Some(capture.clone()),
            _ => None,
        })
    }

    pub fn dispatch(&self, cause: FailureCause, context: &DispatchContext) {
        if cause.is_success() {
            return;
        }
        warn!("Protected log anomaly {}: {}", cause, context);
        for action in &self.actions {
            action.run(cause, context);
        }
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
