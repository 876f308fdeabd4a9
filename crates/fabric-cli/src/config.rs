//! Fabric CLI Configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command-line overrides. The file mirrors [`FabricConfig`]:
//!
//! ```toml
//! protocol_version = "fabric/1"
//!
//! [hub]
//! bind_address = "0.0.0.0:7500"
//! key_directory = "keys"
//!
//! [leaf]
//! hub_address = "hub.internal:7500"
//! key_file = "lobby.private.json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use fabric_core::FabricConfig;
use tracing::info;

use crate::cli::{Cli, Commands};

/// Errors raised while assembling configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Load `path`, or the defaults when no file is given
pub fn load_file(path: Option<&Path>) -> Result<FabricConfig, ConfigError> {
    let Some(path) = path else {
        info!("Using default configuration");
        return Ok(FabricConfig::default());
    };
    info!("Loading configuration from {}", path.display());
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(text: &str) -> Result<FabricConfig, toml::de::Error> {
    toml::from_str(text)
}

// ----------------------------------------------------------------------------
// Command-line Overrides
// ----------------------------------------------------------------------------

/// Fold command-line flags over the file configuration
pub fn apply_overrides(config: &mut FabricConfig, cli: &Cli) {
    if let Some(version) = &cli.protocol_version {
        config.protocol_version = version.clone();
    }

    match &cli.command {
        Commands::Hub { bind, keys } => {
            if let Some(bind) = bind {
                config.hub.bind_address = bind.clone();
            }
            if let Some(keys) = keys {
                config.hub.key_directory = Some(keys.clone());
            }
        }
        Commands::Leaf { hub, key, no_p2p } => {
            if let Some(hub) = hub {
                config.leaf.hub_address = hub.clone();
            }
            if let Some(key) = key {
                config.leaf.key_file = Some(key.clone());
            }
            if *no_p2p {
                config.leaf.p2p_enabled = false;
            }
        }
        Commands::Keygen { .. } => {}
    }
}

/// Load, override and validate
pub fn resolve(cli: &Cli) -> Result<FabricConfig, ConfigError> {
    let mut config = load_file(cli.config.as_deref())?;
    apply_overrides(&mut config, cli);
    config
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
            protocol_version = "fabric/7"

            [leaf]
            hub_address = "10.1.1.1:7500"
            "#,
        )
        .unwrap();

        assert_eq!(config.protocol_version, "fabric/7");
        assert_eq!(config.leaf.hub_address, "10.1.1.1:7500");
        assert_eq!(config.hub, FabricConfig::default().hub);
    }

    #[test]
    fn test_unknown_value_type_is_rejected() {
        assert!(parse("[hub]\nauth_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = parse("[hub]\nbind_address = \"0.0.0.0:1\"").unwrap();
        let cli = Cli::parse_from([
            "fabric",
            "--protocol-version",
            "fabric/9",
            "hub",
            "--bind",
            "127.0.0.1:9000",
        ]);
        apply_overrides(&mut config, &cli);

        assert_eq!(config.hub.bind_address, "127.0.0.1:9000");
        assert_eq!(config.protocol_version, "fabric/9");
    }

    #[test]
    fn test_load_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.toml");
        fs::write(&path, "[leaf]\np2p_enabled = false\n").unwrap();

        let config = load_file(Some(&path)).unwrap();
        assert!(!config.leaf.p2p_enabled);
        assert!(matches!(
            load_file(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
