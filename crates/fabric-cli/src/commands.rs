//! Command handlers for the fabric CLI

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fabric_core::{
    ChatMessage, Command, EventDispatcher, FabricConfig, IdentityKey, KeyDirectory, KeyFile,
    MessageKind,
};
use fabric_runtime::{Hub, Leaf};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: FabricConfig) -> Result<()> {
        match cli.command {
            Commands::Hub { .. } => Self::handle_hub_command(config).await,
            Commands::Leaf { .. } => Self::handle_leaf_command(config).await,
            Commands::Keygen { name, out } => {
                let (private, public) = Self::handle_keygen_command(&name, &out)?;
                println!("Private key: {}", private.display());
                println!("Public key:  {}", public.display());
                Ok(())
            }
        }
    }

    /// Run the hub until interrupted
    async fn handle_hub_command(config: FabricConfig) -> Result<()> {
        let directory = config
            .hub
            .key_directory
            .clone()
            .context("the hub needs a key directory (--keys or hub.key_directory)")?;
        let keys = KeyDirectory::load(&directory)
            .with_context(|| format!("loading keys from {}", directory.display()))?;
        if keys.is_empty() {
            warn!("No keys in {}; every leaf will be refused", directory.display());
        }

        let hub = Hub::new(config, keys);
        log_inbound(hub.dispatcher());
        let addr = hub.start().await?;
        info!("Hub listening on {}", addr);

        tokio::signal::ctrl_c().await?;
        info!("Shutting down hub");
        hub.shutdown().await;
        Ok(())
    }

    /// Run a leaf until interrupted or refused
    async fn handle_leaf_command(config: FabricConfig) -> Result<()> {
        let key_file = config
            .leaf
            .key_file
            .clone()
            .context("the leaf needs a private key (--key or leaf.key_file)")?;
        let identity = KeyFile::load(&key_file)
            .and_then(KeyFile::into_identity)
            .with_context(|| format!("loading identity from {}", key_file.display()))?;
        let patience = config.leaf.connect_timeout();

        let leaf = Leaf::new(config, identity);
        log_inbound(leaf.dispatcher());
        leaf.start()?;

        loop {
            tokio::select! {
                ready = leaf.wait_ready(patience) => match ready {
                    Ok(()) => {
                        info!("Leaf ready as {}", leaf.name().unwrap_or_default());
                        break;
                    }
                    Err(e) if e.disconnect_reason().map_or(false, |r| r.is_fatal()) => {
                        leaf.close().await;
                        bail!("hub refused this leaf: {}", e);
                    }
                    Err(_) => info!("Still waiting for the hub..."),
                },
                _ = tokio::signal::ctrl_c() => {
                    leaf.close().await;
                    return Ok(());
                }
            }
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutting down leaf");
        leaf.close().await;
        Ok(())
    }

    /// Write `<name>.private.json` and `<name>.public.json` into `out`
    pub fn handle_keygen_command(name: &str, out: &Path) -> Result<(PathBuf, PathBuf)> {
        if name.is_empty() {
            bail!("a leaf name is required");
        }
        fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

        let identity = IdentityKey::generate();
        let private = out.join(format!("{}.private.json", name));
        let public = out.join(format!("{}.public.json", name));
        if private.exists() {
            bail!("{} already exists", private.display());
        }

        KeyFile::private(&identity, Some(name.to_string())).save(&private)?;
        KeyFile::public(&identity.public_identity(), name).save(&public)?;
        info!("Generated key {} for {}", identity.uuid(), name);
        Ok((private, public))
    }
}

/// Log chat and command envelopes that arrive at this node
fn log_inbound(dispatcher: &EventDispatcher) {
    dispatcher.register(MessageKind::ChatMessage, None, |sender, envelope| {
        let chat = envelope.decode::<ChatMessage>()?;
        info!("[chat] {}: {}", sender, chat.message);
        Ok(())
    });
    dispatcher.register(MessageKind::Command, None, |sender, envelope| {
        let command = envelope.decode::<Command>()?;
        info!("[command] {} runs /{}", sender, command.command);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_writes_matching_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) =
            CommandDispatcher::handle_keygen_command("lobby", dir.path()).unwrap();

        let identity = KeyFile::load(&private).unwrap().into_identity().unwrap();
        let directory = KeyDirectory::load(dir.path()).unwrap();
        let admitted = directory.lookup(&identity.uuid()).unwrap();
        assert_eq!(admitted.name, "lobby");
        assert_eq!(
            KeyFile::load(&public).unwrap().to_public().unwrap(),
            identity.public_identity()
        );
    }

    #[test]
    fn test_keygen_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        CommandDispatcher::handle_keygen_command("lobby", dir.path()).unwrap();
        assert!(CommandDispatcher::handle_keygen_command("lobby", dir.path()).is_err());
    }
}
