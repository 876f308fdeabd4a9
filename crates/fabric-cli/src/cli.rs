//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "fabric", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the protocol version string
    #[arg(long, global = true)]
    pub protocol_version: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub
    Hub {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,
        /// Directory of public key files to admit
        #[arg(short, long)]
        keys: Option<PathBuf>,
    },
    /// Run a leaf connected to a hub
    Leaf {
        /// Hub address to dial
        #[arg(long)]
        hub: Option<String>,
        /// Private key file for this leaf
        #[arg(short, long)]
        key: Option<PathBuf>,
        /// Disable direct leaf-to-leaf channels
        #[arg(long)]
        no_p2p: bool,
    },
    /// Generate a key pair for a leaf
    Keygen {
        /// Name the hub will admit the leaf under
        name: String,
        /// Directory to write the key files into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leaf_overrides() {
        let cli = Cli::parse_from([
            "fabric",
            "--verbose",
            "leaf",
            "--hub",
            "10.0.0.1:7500",
            "--no-p2p",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Leaf { hub, key, no_p2p } => {
                assert_eq!(hub.as_deref(), Some("10.0.0.1:7500"));
                assert!(key.is_none());
                assert!(no_p2p);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_keygen_defaults_to_current_dir() {
        let cli = Cli::parse_from(["fabric", "keygen", "lobby"]);
        match cli.command {
            Commands::Keygen { name, out } => {
                assert_eq!(name, "lobby");
                assert_eq!(out, PathBuf::from("."));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
