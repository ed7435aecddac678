// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Wirelift - CLI
// Deploys an ephemeral encrypted tunnel through a saved SSH target and
// keeps it up until Ctrl+C or a failed health check.

mod pools;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{Confirm, Input, Password};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use wirelift_common::{
    Error, Secret, SessionEvent, Settings, SshAuth, SshTarget, TargetSpec,
};
use wirelift_engine::{
    ChannelSink, CredentialGate, KeyringStore, SecretPrompt, SessionController, SshDeployer,
    SudoProbe, WgTunnel,
};

use pools::{FilePoolResolver, PoolRegistry};
use registry::TargetRegistry;

#[derive(Parser)]
#[command(name = "wirelift")]
#[command(about = "Ephemeral encrypted tunnels deployed over SSH", long_about = None)]
#[command(version)]
struct Cli {
    /// Alternate configuration file (default: ~/.config/wirelift/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage saved SSH targets
    Target {
        #[command(subcommand)]
        action: TargetCommands,
    },

    /// Show the named address pools
    Pools,

    /// Deploy a tunnel through a saved target and keep it up
    Connect {
        /// Saved target name
        target: String,

        /// Single address to route through the tunnel
        #[arg(short, long, conflicts_with = "pool")]
        address: Option<String>,

        /// Named address pool to route through the tunnel
        #[arg(short, long)]
        pool: Option<String>,
    },
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Save a new SSH target
    Add {
        /// Target name
        name: String,

        /// SSH host (hostname or IP)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// SSH port
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// SSH username
        #[arg(short, long)]
        user: Option<String>,

        /// Path to SSH private key (omit for password authentication)
        #[arg(short, long)]
        key_path: Option<PathBuf>,

        /// Overwrite an existing target of the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// List saved targets
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Remove a saved target
    Remove {
        /// Target name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wirelift=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Target { action } => match action {
            TargetCommands::Add {
                name,
                host,
                port,
                user,
                key_path,
                overwrite,
            } => add_target(name, host, port, user, key_path, overwrite)?,
            TargetCommands::List { json } => list_targets(json)?,
            TargetCommands::Remove { name } => remove_target(name)?,
        },
        Commands::Pools => list_pools()?,
        Commands::Connect {
            target,
            address,
            pool,
        } => {
            let spec = match (address, pool) {
                (Some(addr), None) => TargetSpec::Single(addr),
                (None, Some(name)) => TargetSpec::Pool(name),
                _ => anyhow::bail!("pass exactly one of --address or --pool"),
            };
            connect(target, spec, cli.config).await?;
        }
    }

    Ok(())
}

fn add_target(
    name: String,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    key_path: Option<PathBuf>,
    overwrite: bool,
) -> Result<()> {
    let registry = TargetRegistry::open()?;
    if registry.exists(&name) && !overwrite {
        anyhow::bail!(
            "a target named '{}' already exists (use --overwrite to replace it)",
            name.yellow()
        );
    }

    let host = match host {
        Some(h) => h,
        None => Input::new()
            .with_prompt("SSH host (hostname or IP)")
            .interact_text()?,
    };
    let port = match port {
        Some(p) => p,
        None => Input::<u16>::new()
            .with_prompt("SSH port")
            .default(22)
            .interact_text()?,
    };
    let username = match user {
        Some(u) => u,
        None => Input::new().with_prompt("SSH username").interact_text()?,
    };

    let auth = match key_path {
        Some(path) => {
            if !path.is_file() {
                anyhow::bail!("SSH key not found: {}", path.display());
            }
            SshAuth::Key {
                key_path: path,
                passphrase: None,
            }
        }
        None => {
            let key_input: String = Input::new()
                .with_prompt("Path to SSH private key (or press Enter for password authentication)")
                .allow_empty(true)
                .interact_text()?;
            if key_input.trim().is_empty() {
                let password = Password::new().with_prompt("SSH password").interact()?;
                SshAuth::Password { password }
            } else {
                let path = PathBuf::from(key_input.trim());
                if !path.is_file() {
                    anyhow::bail!("SSH key not found: {}", path.display());
                }
                SshAuth::Key {
                    key_path: path,
                    passphrase: None,
                }
            }
        }
    };

    let target = SshTarget {
        host,
        port,
        username,
        auth,
    };
    let path = registry.save(&name, &target, overwrite)?;

    println!();
    println!("{}", format!("✓ Target '{}' saved", name).green().bold());
    println!("  {}", path.display().to_string().dimmed());
    println!(
        "Connect with: {}",
        format!("wirelift connect {} --address <ip>", name).yellow()
    );
    Ok(())
}

fn list_targets(json: bool) -> Result<()> {
    let registry = TargetRegistry::open()?;
    let targets = registry.list()?;

    if json {
        let entries: Vec<_> = targets
            .iter()
            .map(|(name, t)| {
                serde_json::json!({
                    "name": name,
                    "host": t.host,
                    "port": t.port,
                    "username": t.username,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if targets.is_empty() {
        println!("{}", "No targets saved.".yellow());
        println!("Create one with: {}", "wirelift target add <name>".cyan());
        return Ok(());
    }
    println!();
    for (name, target) in &targets {
        let auth = match target.auth {
            SshAuth::Password { .. } => "password".to_string(),
            SshAuth::Key { ref key_path, .. } => key_path.display().to_string(),
        };
        println!(
            "  {}  {}  {}",
            name.green().bold(),
            format!("{}@{}", target.username, target.address()),
            auth.dimmed()
        );
    }
    println!();
    println!("{} target(s)", targets.len().to_string().cyan());
    Ok(())
}

fn remove_target(name: String) -> Result<()> {
    let registry = TargetRegistry::open()?;
    if !registry.exists(&name) {
        anyhow::bail!("target '{}' not found", name.yellow());
    }
    let confirm = Confirm::new()
        .with_prompt(format!("Remove target '{}'?", name.yellow()))
        .default(false)
        .interact()?;
    if !confirm {
        println!("{}", "Cancelled".dimmed());
        return Ok(());
    }
    let path = registry.remove(&name)?;
    println!("{}", format!("✓ Target '{}' removed", name).green());
    println!("  {}", path.display().to_string().dimmed());
    Ok(())
}

fn list_pools() -> Result<()> {
    let registry = PoolRegistry::open()?;
    let pools = registry.list()?;
    if pools.is_empty() {
        println!("{}", "No pools defined.".yellow());
        println!(
            "Add them to {} under a [pools] table.",
            "~/.config/wirelift/pools.toml".cyan()
        );
        return Ok(());
    }
    println!();
    for (name, members) in &pools {
        println!(
            "  {}  {}",
            name.green().bold(),
            members.join(", ").dimmed()
        );
    }
    println!();
    println!("{} pool(s)", pools.len().to_string().cyan());
    Ok(())
}

/// Asks for the privilege secret on the terminal; runs on the blocking
/// pool so the session tasks keep making progress behind the prompt.
struct TerminalPrompt;

#[async_trait::async_trait]
impl SecretPrompt for TerminalPrompt {
    async fn request_secret(&self, prompt: &str) -> wirelift_common::Result<Secret> {
        let prompt = prompt.to_string();
        let secret = tokio::task::spawn_blocking(move || {
            Password::new().with_prompt(&prompt).interact()
        })
        .await
        .map_err(|e| Error::Privilege(format!("prompt task failed: {}", e)))?
        .map_err(|e| Error::Privilege(format!("failed to read secret: {}", e)))?;
        Ok(Zeroizing::new(secret))
    }
}

async fn connect(
    target_name: String,
    spec: TargetSpec,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let settings = match config_path {
        Some(path) => Settings::load_from(&path),
        None => Settings::load(),
    }
    .context("failed to load configuration")?;
    let target = TargetRegistry::open()?.load(&target_name)?;

    // Interface name unique per concurrent invocation from this machine
    let interface = format!("wlift{}", std::process::id() % 10000);

    let deployer = Arc::new(SshDeployer::new(&settings));
    let tunnel = Arc::new(WgTunnel::new(interface)?);
    let gate = Arc::new(CredentialGate::new(
        Box::new(KeyringStore::new()),
        Box::new(SudoProbe),
    ));
    let resolver = Arc::new(FilePoolResolver::new(PoolRegistry::open()?));

    // Progress lines from the pipeline and the remote server stream
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            println!("{}", line.dimmed());
        }
    });

    let controller = SessionController::new(
        deployer,
        tunnel,
        gate,
        resolver,
        Arc::new(TerminalPrompt),
        Arc::new(ChannelSink(line_tx)),
        settings,
    );
    let mut events = controller.subscribe();

    println!(
        "{}",
        format!("Deploying tunnel via '{}'", target_name).green().bold()
    );
    controller.connect(&target, &spec).await?;
    println!(
        "{}",
        "✓ Tunnel connected. Press Ctrl+C to disconnect.".green().bold()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "Disconnecting...".yellow());
                controller.disconnect().await?;
                println!("{}", "✓ Tunnel disconnected".green().bold());
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected { reason, .. }) => {
                    println!("{}", format!("Session ended: {}", reason).yellow());
                    break;
                }
                Ok(SessionEvent::HealthCheckFailed { error, .. }) => {
                    eprintln!("{}", format!("Health check failed: {}", error).red());
                }
                Ok(SessionEvent::ServerExited { error, .. }) => {
                    eprintln!("{}", format!("Remote server exited: {}", error).red());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} session events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}
