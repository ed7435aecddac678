// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Local tunnel client
//
// Materializes the negotiated ClientConfig as a wg-quick interface.
// Bringing an interface up or down needs elevated privilege, so every
// state-changing command runs through `sudo -S` with the validated secret
// on stdin (or `sudo -n` when the platform allows passwordless elevation).
// The health check pings the server-side tunnel address and needs no
// privilege at all.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wirelift_common::{ClientConfig, Error, Result, Secret};

use crate::ssh::render_client_config;
use crate::traits::TunnelClient;

/// Sudo's exit status when the password is wrong or privilege is denied
const SUDO_DENIED: i32 = 1;

pub struct WgTunnel {
    /// Interface/config name for this session, e.g. `wlift3`
    interface: String,
    config_dir: PathBuf,
    connected: AtomicBool,
    /// Server-side tunnel address, recorded at connect for health checks
    gateway: Mutex<Option<String>>,
}

impl WgTunnel {
    pub fn new(interface: String) -> Result<Self> {
        let config_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .ok_or_else(|| Error::Config("could not determine runtime directory".to_string()))?
            .join("wirelift");
        Ok(Self::with_config_dir(interface, config_dir))
    }

    fn with_config_dir(interface: String, config_dir: PathBuf) -> Self {
        Self {
            interface,
            config_dir,
            connected: AtomicBool::new(false),
            gateway: Mutex::new(None),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    /// Run a privileged command, feeding the secret to sudo on stdin.
    /// An empty secret selects non-interactive mode for passwordless setups.
    async fn sudo(&self, secret: &Secret, args: &[&str]) -> Result<(i32, String)> {
        let mut cmd = Command::new("sudo");
        if secret.is_empty() {
            cmd.arg("-n");
        } else {
            cmd.args(["-S", "-k", "-p", ""]);
        }
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Privilege(format!("failed to spawn sudo: {}", e)))?;

        if !secret.is_empty() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(format!("{}\n", secret.as_str()).as_bytes())
                    .await
                    .map_err(|e| Error::Privilege(format!("failed to write secret: {}", e)))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Privilege(format!("sudo did not finish: {}", e)))?;
        let code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((code, combined))
    }
}

#[async_trait]
impl TunnelClient for WgTunnel {
    async fn connect(&self, config: &ClientConfig, secret: &Secret) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_path();
        tokio::fs::write(&path, render_client_config(config)).await?;
        // The rendered config carries the private key
        set_owner_only(&path).await?;

        let path_str = path.to_string_lossy().into_owned();
        let (code, output) = self.sudo(secret, &["wg-quick", "up", &path_str]).await?;
        if code == SUDO_DENIED && looks_like_auth_failure(&output) {
            return Err(Error::Privilege(
                "privilege secret rejected while bringing the interface up".to_string(),
            ));
        }
        if code != 0 {
            return Err(Error::Runtime(format!(
                "wg-quick up failed (exit {}): {}",
                code,
                output.trim()
            )));
        }

        *self.gateway.lock().await = Some(config.gateway.to_string());
        self.connected.store(true, Ordering::SeqCst);
        info!("Local tunnel interface {} is up", self.interface);
        Ok(())
    }

    async fn disconnect(&self, secret: &Secret) -> Result<()> {
        let path = self.config_path();
        if !path.exists() {
            // Nothing was ever brought up; teardown is still a success
            self.connected.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let path_str = path.to_string_lossy().into_owned();
        let (code, output) = self.sudo(secret, &["wg-quick", "down", &path_str]).await?;
        self.connected.store(false, Ordering::SeqCst);
        *self.gateway.lock().await = None;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove {}: {}", path.display(), e);
        }

        if code == SUDO_DENIED && looks_like_auth_failure(&output) {
            return Err(Error::Privilege(
                "privilege secret rejected while tearing the interface down".to_string(),
            ));
        }
        // Interface-already-down outcomes are success: teardown runs on
        // both orderly and failure paths and must tolerate redundancy.
        if code != 0 && !output.contains("is not a WireGuard interface") {
            warn!(
                "wg-quick down for {} reported exit {}: {}",
                self.interface,
                code,
                output.trim()
            );
        }
        Ok(())
    }

    async fn check_tunnel_health(&self) -> Result<()> {
        let gateway = self
            .gateway
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Runtime("tunnel is not connected".to_string()))?;
        let output = Command::new("ping")
            .args(["-c", "1", "-W", "2", &gateway])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run ping: {}", e)))?;
        if !output.success() {
            return Err(Error::Runtime(format!(
                "tunnel gateway {} is unreachable",
                gateway
            )));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn looks_like_auth_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("incorrect password")
        || lower.contains("sorry, try again")
        || lower.contains("a password is required")
}

#[cfg(unix)]
async fn set_owner_only(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    #[tokio::test]
    async fn disconnect_without_interface_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel =
            WgTunnel::with_config_dir("wlift0".to_string(), dir.path().join("wirelift"));
        let secret = Zeroizing::new(String::new());
        // Nothing was ever brought up; teardown runs on both orderly and
        // failure paths and must succeed every time regardless.
        assert!(tunnel.disconnect(&secret).await.is_ok());
        assert!(tunnel.disconnect(&secret).await.is_ok());
        assert!(!tunnel.is_connected().await);
    }

    #[test]
    fn auth_failure_detection() {
        assert!(looks_like_auth_failure("sudo: Sorry, try again.\n"));
        assert!(looks_like_auth_failure("sudo: a password is required\n"));
        assert!(!looks_like_auth_failure(
            "wg-quick: `wlift1' is not a WireGuard interface\n"
        ));
    }
}
