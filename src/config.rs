pub mod loader;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::audit::entry::seconds;
use crate::crypto::TokenReference;
use crate::error::ProtectedLogError;

/// Upper bound for every `*_secs` setting, about a hundred years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// A CA key file loaded into the key ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaKeyConfig {
    pub name: String,
    pub secret_key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectedLogConfig {
    pub node_id: String,
    pub database_url: String,
    pub token_ref_type: String,
    pub token_ref: Option<String>,
    pub search_window_secs: u64,
    pub freeze_threshold_secs: u64,
    pub protection_interval_secs: u64,
    pub sign_after_appends: u64,
    pub verify_own_interval_secs: u64,
    pub use_test_action: bool,
    pub script_action_target: Option<String>,
    pub export_path: Option<String>,
    pub export_signer_ca_name: Option<String>,
    pub export_older_than_secs: u64,
    pub verification_interval_secs: u64,
    pub export_interval_secs: u64,
    pub signing_interval_secs: u64,
    pub ca_keys: Vec<CaKeyConfig>,
}

impl Default for ProtectedLogConfig {
    fn default() -> Self {
        Self {
            node_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            database_url: "sqlite://protected-log.db".to_string(),
            token_ref_type: "NONE".to_string(),
            token_ref: None,
            search_window_secs: 300,
            freeze_threshold_secs: 3600,
            protection_interval_secs: 0,
            sign_after_appends: 1,
            verify_own_interval_secs: 1,
            use_test_action: false,
            script_action_target: None,
            export_path: None,
            export_signer_ca_name: None,
            export_older_than_secs: 0,
            verification_interval_secs: 60,
            export_interval_secs: 3600,
            signing_interval_secs: 60,
            ca_keys: Vec::new(),
        }
    }
}

impl ProtectedLogConfig {
    pub fn token_reference(&self) -> Result<TokenReference, ProtectedLogError> {
        TokenReference::from_config(&self.token_ref_type, self.token_ref.as_deref())
    }

    pub fn search_window(&self) -> Duration {
        seconds(self.search_window_secs)
    }

    pub fn freeze_threshold(&self) -> Duration {
        seconds(self.freeze_threshold_secs)
    }

    /// `None` when time-based signing is disabled.
    pub fn protection_interval(&self) -> Option<Duration> {
        (self.protection_interval_secs > 0).then(|| seconds(self.protection_interval_secs))
    }

    /// `None` when own-tail checks are disabled.
    pub fn verify_own_interval(&self) -> Option<Duration> {
        (self.verify_own_interval_secs > 0).then(|| seconds(self.verify_own_interval_secs))
    }

    pub fn export_older_than(&self) -> Duration {
        seconds(self.export_older_than_secs)
    }

    pub fn validate(&self) -> Result<(), ProtectedLogError> {
        if self.node_id.trim().is_empty() {
            return Err(ProtectedLogError::Config("node_id must not be empty".to_string()));
        }
        self.token_reference()?;
        if self.sign_after_appends == 0 {
            return Err(ProtectedLogError::Config(
                "sign_after_appends must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("search_window_secs", self.search_window_secs),
            ("freeze_threshold_secs", self.freeze_threshold_secs),
            ("protection_interval_secs", self.protection_interval_secs),
            ("verify_own_interval_secs", self.verify_own_interval_secs),
            ("export_older_than_secs", self.export_older_than_secs),
            ("verification_interval_secs", self.verification_interval_secs),
            ("export_interval_secs", self.export_interval_secs),
            ("signing_interval_secs", self.signing_interval_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ProtectedLogError::Config(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if self.export_path.is_some() && self.export_signer_ca_name.is_none() {
            return Err(ProtectedLogError::Config(
                "export_path requires export_signer_ca_name".to_string(),
            ));
        }
        for key in &self.ca_keys {
            if key.name.trim().is_empty() {
                return Err(ProtectedLogError::Config(format!(
                    "CA key {:?} has no name",
                    key.secret_key_path
                )));
            }
        }
        Ok(())
    }
}
