// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Collaborator seams for the session controller
//
// Every external system the pipeline coordinates sits behind one of these
// traits: the SSH transport, the privileged local interface, the secret
// store, the operator prompt, and the target pool resolver. The controller
// only ever sees the traits, which is also what makes the state machine
// testable without a remote host.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use wirelift_common::{ClientConfig, DeploymentConfig, Result, Secret, ServerConfig, SshTarget};

/// Append-only, ordering-preserving sink for operator-visible progress lines
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// Sink that forwards lines to an unbounded channel (UI or file writer side)
pub struct ChannelSink(pub tokio::sync::mpsc::UnboundedSender<String>);

impl LogSink for ChannelSink {
    fn append(&self, line: &str) {
        // Receiver gone means nobody is watching; nothing to do
        let _ = self.0.send(line.to_string());
    }
}

/// Owns the SSH session to the remote host and everything deployed over it
#[async_trait]
pub trait RemoteDeployer: Send + Sync {
    /// Open the SSH session and immediately verify it with a trivial
    /// remote command, so dead hosts fail here rather than mid-deployment.
    async fn connect(&self, target: &SshTarget) -> Result<()>;

    /// Reachability spot-check for one target address, run from the remote
    /// host's side of the network.
    async fn probe_address(&self, address: &str) -> Result<()>;

    /// Find a free listen port on the remote host within [low, high].
    /// Exhausting the window is a resource-exhaustion error.
    async fn allocate_port(&self, low: u16, high: u16) -> Result<u16>;

    /// Create the session-scoped remote directory and upload the
    /// tunnel-server artifact plus its serialized config.
    async fn deploy(&self, config: &DeploymentConfig, server: &ServerConfig) -> Result<()>;

    /// Launch the remote server and stream its output to the sink until
    /// the token is cancelled or the process exits on its own. An exit
    /// that was not asked for is an error, never silently swallowed.
    async fn run_server(
        &self,
        token: CancellationToken,
        config: &DeploymentConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<()>;

    /// Periodically refresh the remote heartbeat file until cancelled, so
    /// the server self-terminates if this controller disappears without an
    /// orderly shutdown.
    async fn run_heartbeat(&self, token: CancellationToken, config: &DeploymentConfig)
        -> Result<()>;

    /// Tell the running server to accept the client as a tunnel peer
    async fn register_peer(
        &self,
        config: &DeploymentConfig,
        client_public_key: &str,
        client_address: Ipv4Addr,
        port: u16,
    ) -> Result<()>;

    /// Lightweight round-trip probe used by the health monitor
    async fn check_ssh_health(&self) -> Result<()>;

    /// Close the SSH session. Session close plus heartbeat expiry is the
    /// mechanism by which the remote process terminates.
    async fn disconnect(&self) -> Result<()>;
}

/// Brings the local tunnel interface up and down; needs elevated privilege
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn connect(&self, config: &ClientConfig, secret: &Secret) -> Result<()>;

    /// Must be safe to call when the interface is already partially or
    /// fully down; teardown runs on both orderly and failure paths.
    async fn disconnect(&self, secret: &Secret) -> Result<()>;

    /// Round-trip across the tunnel itself, independent of SSH health
    async fn check_tunnel_health(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;
}

/// Persistent store for the validated privilege secret
pub trait SecretStore: Send + Sync {
    fn get(&self) -> Option<String>;
    fn save(&self, secret: &str) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// Probes the privileged local subsystem
#[async_trait]
pub trait PrivilegeProbe: Send + Sync {
    /// Whether elevation works with no secret at all. Probed, never assumed.
    async fn passwordless(&self) -> bool;

    /// Validate a candidate secret against the privileged subsystem
    async fn validate(&self, secret: &Secret) -> Result<bool>;
}

/// Out-of-band operator prompt; awaiting it suspends the pipeline at the
/// point of the request and resuming is just the future completing.
#[async_trait]
pub trait SecretPrompt: Send + Sync {
    async fn request_secret(&self, prompt: &str) -> Result<Secret>;
}

/// Resolves a named address pool to its ordered member list
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve_pool(&self, name: &str) -> Result<Vec<String>>;
}
