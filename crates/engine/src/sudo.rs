// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Credential gate for the privilege-escalation secret
//
// Single writer for the cached secret: only this module ever sets or
// clears it. A secret is cached and persisted only after the privileged
// subsystem accepted it in a validation probe, and it is purged the moment
// a later use is rejected.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use wirelift_common::{Error, Result, Secret};

use crate::traits::{PrivilegeProbe, SecretPrompt, SecretStore};

const MAX_PROMPT_ATTEMPTS: u32 = 3;

/// Probes the local sudo subsystem
pub struct SudoProbe;

#[async_trait]
impl PrivilegeProbe for SudoProbe {
    async fn passwordless(&self) -> bool {
        match Command::new("sudo")
            .args(["-n", "true"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("Passwordless probe failed to run: {}", e);
                false
            }
        }
    }

    async fn validate(&self, secret: &Secret) -> Result<bool> {
        // -k drops any cached sudo timestamp so the probe really exercises
        // the secret; -v validates without running a command.
        let mut child = Command::new("sudo")
            .args(["-S", "-k", "-p", "", "-v"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Privilege(format!("failed to spawn sudo: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", secret.as_str()).as_bytes())
                .await
                .map_err(|e| Error::Privilege(format!("failed to write secret: {}", e)))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Privilege(format!("sudo did not finish: {}", e)))?;
        Ok(status.success())
    }
}

/// Keyring-backed secret store
pub struct KeyringStore {
    service: String,
    user: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: "wirelift".to_string(),
            user: "privilege-secret".to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| Error::Config(format!("keyring unavailable: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringStore {
    fn get(&self) -> Option<String> {
        self.entry().ok()?.get_password().ok()
    }

    fn save(&self, secret: &str) -> Result<()> {
        self.entry()?
            .set_password(secret)
            .map_err(|e| Error::Config(format!("failed to store secret: {}", e)))
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Config(format!("failed to delete secret: {}", e))),
        }
    }
}

pub struct CredentialGate {
    store: Box<dyn SecretStore>,
    probe: Box<dyn PrivilegeProbe>,
    cached: RwLock<Option<Secret>>,
}

impl CredentialGate {
    pub fn new(store: Box<dyn SecretStore>, probe: Box<dyn PrivilegeProbe>) -> Self {
        Self {
            store,
            probe,
            cached: RwLock::new(None),
        }
    }

    /// Produce a validated privilege secret, in order of preference:
    /// passwordless elevation, the in-memory cache, the persisted store,
    /// and finally the operator prompt. Prompted secrets are validated
    /// before they are cached, and persisted only after validation.
    pub async fn obtain(&self, prompt: &dyn SecretPrompt) -> Result<Secret> {
        if self.probe.passwordless().await {
            debug!("Passwordless elevation is available");
            return Ok(Zeroizing::new(String::new()));
        }

        if let Some(secret) = self.cached.read().await.clone() {
            return Ok(secret);
        }

        if let Some(stored) = self.store.get() {
            let candidate = Zeroizing::new(stored);
            if self.probe.validate(&candidate).await? {
                *self.cached.write().await = Some(candidate.clone());
                return Ok(candidate);
            }
            // The persisted secret went stale; purge it before prompting
            warn!("Stored privilege secret was rejected, purging it");
            if let Err(e) = self.store.delete() {
                warn!("Failed to purge stale secret: {}", e);
            }
        }

        for attempt in 1..=MAX_PROMPT_ATTEMPTS {
            let candidate = prompt
                .request_secret("Local privilege password required to configure the tunnel interface")
                .await?;
            if self.probe.validate(&candidate).await? {
                *self.cached.write().await = Some(candidate.clone());
                if let Err(e) = self.store.save(&candidate) {
                    // Persisting is best-effort; the session can proceed
                    warn!("Failed to persist validated secret: {}", e);
                }
                info!("Privilege secret validated");
                return Ok(candidate);
            }
            warn!("Privilege secret rejected (attempt {}/{})", attempt, MAX_PROMPT_ATTEMPTS);
        }

        Err(Error::Privilege(format!(
            "secret rejected {} times",
            MAX_PROMPT_ATTEMPTS
        )))
    }

    /// A later use of the secret was rejected by the privileged subsystem:
    /// drop the cache and the persisted copy so it is never reused.
    pub async fn reject(&self) {
        *self.cached.write().await = None;
        if let Err(e) = self.store.delete() {
            warn!("Failed to delete rejected secret: {}", e);
        }
    }

    #[cfg(test)]
    pub async fn cached_secret(&self) -> Option<Secret> {
        self.cached.read().await.clone()
    }
}
