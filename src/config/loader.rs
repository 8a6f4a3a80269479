//! Configuration loader for the protected log
//! Layers built-in defaults, an optional TOML file and `PROTECTED_LOG__*` environment variables.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use tracing::info;

use super::ProtectedLogConfig;
use crate::error::ProtectedLogError;

pub const ENV_PREFIX: &str = "PROTECTED_LOG";

impl ProtectedLogConfig {
    /// Load and validate configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ProtectedLogError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading protected log configuration from: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ProtectedLogConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides.
    pub fn from_toml(contents: &str) -> Result<Self, ProtectedLogError> {
        let config: ProtectedLogConfig = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_toml_keeps_defaults() {
        let config = ProtectedLogConfig::from_toml(
            r#"
            node_id = "ca-node-1"
            token_ref_type = "CA-NAME"
            token_ref = "AdminCA1"
            sign_after_appends = 10

            [[ca_keys]]
            name = "AdminCA1"
            secret_key_path = "/etc/protected-log/AdminCA1.key"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, "ca-node-1");
        assert_eq!(config.sign_after_appends, 10);
        assert_eq!(config.search_window_secs, 300);
        assert_eq!(config.ca_keys.len(), 1);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "token_ref_type = \"CA-NAME\"").unwrap();
        assert!(ProtectedLogConfig::load(Some(file.path())).is_err());
    }
}
