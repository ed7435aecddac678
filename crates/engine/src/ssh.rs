// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Remote deployer over russh
//
// Owns the SSH session to the host fronting the target network: connect
// and authenticate, probe for a free listen port, upload the tunnel-server
// artifact over SFTP, run and stream the server process, keep the remote
// heartbeat fresh, and register the client peer. Individual remote
// commands run under a bounded timeout; only the long-running server
// stream and the heartbeat loop are cancelled cooperatively through the
// session token.

use std::net::{Ipv4Addr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wirelift_common::{
    ClientConfig, DeploymentConfig, Error, PortLedger, Result, ServerConfig, SshAuth, SshTarget,
};

use crate::traits::{LogSink, RemoteDeployer};

/// Name of the uploaded tunnel-server binary inside the session directory
pub const SERVER_BINARY: &str = "wirelift-server";
/// Serialized ServerConfig uploaded next to the binary
pub const SERVER_CONFIG_FILE: &str = "server.json";
/// File the heartbeat loop touches; the server exits when it goes stale
pub const HEARTBEAT_FILE: &str = "heartbeat";

/// SSH client handler. The target comes from the operator's own registry
/// and sessions are ephemeral, so the server key is accepted and logged;
/// a known-hosts policy would slot in here.
struct DeployerHandler {
    host: String,
    port: u16,
}

impl client::Handler for DeployerHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        use russh::keys::HashAlg;
        info!(
            "Host key for {}:{} is {}",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

pub struct SshDeployer {
    connect_timeout: Duration,
    command_timeout: Duration,
    heartbeat_interval: Duration,
    /// Local path of the tunnel-server artifact
    server_artifact: std::path::PathBuf,
    session: RwLock<Option<Handle<DeployerHandler>>>,
    /// Ports this controller has handed out; never re-issued even after
    /// the remote side released them.
    ledger: Mutex<PortLedger>,
}

impl SshDeployer {
    pub fn new(settings: &wirelift_common::Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            heartbeat_interval: settings.heartbeat_interval(),
            server_artifact: settings.server_artifact.clone(),
            session: RwLock::new(None),
            ledger: Mutex::new(PortLedger::new()),
        }
    }

    /// Open a fresh exec channel on the current session
    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>> {
        let guard = self.session.read().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| Error::SshConnection("not connected".to_string()))?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| Error::SshConnection(format!("failed to open channel: {}", e)))
    }

    /// Run one remote command under the bounded command timeout and
    /// capture its combined output and exit status.
    async fn exec_capture(&self, command: &str) -> Result<(u32, String)> {
        let fut = self.exec_capture_inner(command);
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| {
                Error::SshConnection(format!(
                    "remote command timed out after {:?}: {}",
                    self.command_timeout, command
                ))
            })?
    }

    async fn exec_capture_inner(&self, command: &str) -> Result<(u32, String)> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::SshConnection(format!("exec failed: {}", e)))?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Eof | ChannelMsg::Close => {
                    if exit_status.is_some() {
                        break;
                    }
                }
                _ => {}
            }
        }

        capture_outcome(command, exit_status, output)
    }

    /// Run a command and require exit status zero
    async fn exec_ok(&self, command: &str) -> Result<String> {
        let (status, output) = self.exec_capture(command).await?;
        if status != 0 {
            return Err(Error::SshConnection(format!(
                "remote command failed (exit {}): {}: {}",
                status,
                command,
                output.trim()
            )));
        }
        Ok(output)
    }

    /// Open the SFTP subsystem on a fresh channel
    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Provisioning(format!("SFTP subsystem unavailable: {}", e)))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Provisioning(format!("failed to open SFTP session: {}", e)))
    }

    async fn upload(
        &self,
        sftp: &SftpSession,
        remote_path: &str,
        bytes: &[u8],
        permissions: u32,
    ) -> Result<()> {
        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| Error::Provisioning(format!("failed to create {}: {}", remote_path, e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Error::Provisioning(format!("failed to write {}: {}", remote_path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| Error::Provisioning(format!("failed to flush {}: {}", remote_path, e)))?;

        let attrs = FileAttributes {
            permissions: Some(permissions),
            ..Default::default()
        };
        sftp.set_metadata(remote_path, attrs).await.map_err(|e| {
            Error::Provisioning(format!("failed to chmod {}: {}", remote_path, e))
        })?;
        Ok(())
    }

    /// Whether the given TCP port is already bound on the remote host
    async fn port_in_use(&self, port: u16) -> Result<bool> {
        // A probe failure would hide collisions, so it fails the step.
        let output = self
            .exec_ok(&format!("ss -H -ltn sport = :{} | wc -l", port))
            .await?;
        let listeners: u32 = output.trim().parse().map_err(|_| {
            Error::SshConnection(format!(
                "unexpected port probe output for {}: {:?}",
                port,
                output.trim()
            ))
        })?;
        Ok(listeners > 0)
    }
}

#[async_trait]
impl RemoteDeployer for SshDeployer {
    async fn connect(&self, target: &SshTarget) -> Result<()> {
        let addr = target.address();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::SshConnection(format!("failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| Error::SshConnection(format!("no address found for {}", addr)))?;

        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            nodelay: true,
            ..Default::default()
        };

        let handler = DeployerHandler {
            host: target.host.clone(),
            port: target.port,
        };

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            Error::SshConnection(format!(
                "connection to {} timed out after {:?}",
                addr, self.connect_timeout
            ))
        })?
        .map_err(|e| Error::SshConnection(format!("failed to connect to {}: {}", addr, e)))?;

        debug!("SSH handshake completed");

        let auth_result = match &target.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| Error::Authentication(e.to_string()))?,
            SshAuth::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| {
                        Error::Authentication(format!(
                            "failed to load key {}: {}",
                            key_path.display(),
                            e
                        ))
                    })?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&target.username, key_with_hash)
                    .await
                    .map_err(|e| Error::Authentication(e.to_string()))?
            }
        };

        match auth_result {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(Error::Authentication(format!(
                    "server rejected credentials for {}@{}",
                    target.username, target.host
                )));
            }
        }

        info!("SSH authentication successful for {}@{}", target.username, target.host);
        *self.session.write().await = Some(handle);

        // Liveness probe before any stateful work begins
        self.exec_ok("true").await.map_err(|e| {
            Error::SshConnection(format!("liveness probe failed on {}: {}", addr, e))
        })?;
        Ok(())
    }

    async fn probe_address(&self, address: &str) -> Result<()> {
        let (status, output) = self
            .exec_capture(&format!("ping -c 1 -W 2 {}", address))
            .await?;
        if status != 0 {
            return Err(Error::Target(format!(
                "target {} is unreachable from the remote host: {}",
                address,
                output.trim()
            )));
        }
        Ok(())
    }

    async fn allocate_port(&self, low: u16, high: u16) -> Result<u16> {
        let candidates = {
            let ledger = self.ledger.lock().await;
            ledger.candidates(low, high)
        };

        for port in candidates {
            if self.port_in_use(port).await? {
                debug!("Port {} is already bound on the remote host", port);
                continue;
            }
            let mut ledger = self.ledger.lock().await;
            if ledger.claim(port) {
                info!("Allocated remote listen port {}", port);
                return Ok(port);
            }
        }

        Err(Error::PortRangeExhausted { low, high })
    }

    async fn deploy(&self, config: &DeploymentConfig, server: &ServerConfig) -> Result<()> {
        let dir = &config.remote_dir;
        let artifact = tokio::fs::read(&self.server_artifact).await.map_err(|e| {
            Error::Provisioning(format!(
                "failed to read server artifact {}: {}",
                self.server_artifact.display(),
                e
            ))
        })?;
        let server_json = serde_json::to_vec_pretty(server)?;

        let sftp = self.open_sftp().await?;
        sftp.create_dir(dir)
            .await
            .map_err(|e| Error::Provisioning(format!("failed to create {}: {}", dir, e)))?;
        let attrs = FileAttributes {
            permissions: Some(0o700),
            ..Default::default()
        };
        sftp.set_metadata(dir.as_str(), attrs)
            .await
            .map_err(|e| Error::Provisioning(format!("failed to chmod {}: {}", dir, e)))?;

        self.upload(&sftp, &format!("{}/{}", dir, SERVER_BINARY), &artifact, 0o755)
            .await?;
        self.upload(
            &sftp,
            &format!("{}/{}", dir, SERVER_CONFIG_FILE),
            &server_json,
            0o600,
        )
        .await?;

        // Seed the heartbeat so the server does not see a stale file at start
        self.exec_ok(&format!("touch {}/{}", dir, HEARTBEAT_FILE))
            .await?;

        info!("Deployed tunnel server into {}", dir);
        Ok(())
    }

    async fn run_server(
        &self,
        token: CancellationToken,
        config: &DeploymentConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<()> {
        let dir = &config.remote_dir;
        let mut channel = self.open_channel().await?;
        channel
            .exec(
                true,
                format!(
                    "cd '{dir}' && ./{bin} run --config {cfg} 2>&1",
                    dir = dir,
                    bin = SERVER_BINARY,
                    cfg = SERVER_CONFIG_FILE
                ),
            )
            .await
            .map_err(|e| Error::SshConnection(format!("failed to start server: {}", e)))?;

        let mut exit_status = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // Courtesy kill; session close and heartbeat expiry are
                    // what actually guarantee termination.
                    if let Err(e) = channel.signal(russh::Sig::KILL).await {
                        debug!("Failed to signal remote server: {}", e);
                    }
                    debug!("Server stream cancelled");
                    return Ok(());
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            for line in String::from_utf8_lossy(data).lines() {
                                sink.append(&format!("[server] {}", line));
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                            for line in String::from_utf8_lossy(data).lines() {
                                sink.append(&format!("[server] {}", line));
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                            exit_status = Some(code);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        // Teardown can close the session while the channel branch is
        // already ready; only a close nobody asked for is a failure.
        server_exit_outcome(token.is_cancelled(), exit_status)
    }

    async fn run_heartbeat(
        &self,
        token: CancellationToken,
        config: &DeploymentConfig,
    ) -> Result<()> {
        let path = format!("{}/{}", config.remote_dir, HEARTBEAT_FILE);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Heartbeat loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.exec_ok(&format!("touch {}", path)).await {
                        // The health monitor owns failure handling; the
                        // heartbeat just reports and keeps trying.
                        warn!("Heartbeat touch failed: {}", e);
                    }
                }
            }
        }
    }

    async fn register_peer(
        &self,
        config: &DeploymentConfig,
        client_public_key: &str,
        client_address: Ipv4Addr,
        port: u16,
    ) -> Result<()> {
        self.exec_ok(&format!(
            "cd '{dir}' && ./{bin} peer add --public-key '{key}' --address {addr}/32 --port {port}",
            dir = config.remote_dir,
            bin = SERVER_BINARY,
            key = client_public_key,
            addr = client_address,
            port = port
        ))
        .await
        .map_err(|e| Error::Provisioning(format!("peer registration failed: {}", e)))?;
        info!("Registered client peer {} ({})", client_address, client_public_key);
        Ok(())
    }

    async fn check_ssh_health(&self) -> Result<()> {
        self.exec_ok("true").await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        let handle = self.session.write().await.take();
        if let Some(handle) = handle {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| Error::SshConnection(format!("disconnect failed: {}", e)))?;
            info!("SSH session closed");
        }
        Ok(())
    }
}

/// Fold a finished command capture into the command result. A channel
/// that closed without ever reporting an exit status is a torn
/// connection, never a success.
fn capture_outcome(
    command: &str,
    exit_status: Option<u32>,
    output: Vec<u8>,
) -> Result<(u32, String)> {
    let status = exit_status.ok_or_else(|| {
        Error::SshConnection(format!(
            "channel closed before reporting an exit status: {}",
            command
        ))
    })?;
    Ok((status, String::from_utf8_lossy(&output).into_owned()))
}

/// Outcome of a closed server stream, given whether shutdown was requested
fn server_exit_outcome(cancelled: bool, exit_status: Option<u32>) -> Result<()> {
    if cancelled {
        return Ok(());
    }
    Err(Error::Runtime(format!(
        "remote tunnel server exited unexpectedly (status {:?})",
        exit_status
    )))
}

/// Render the wg-quick style client configuration handed to the local
/// tunnel engine. Lives here so the remote and local ends stay in one
/// place when the negotiated format changes.
pub fn render_client_config(config: &ClientConfig) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", config.private_key));
    out.push_str(&format!(
        "Address = {}/{}\n\n",
        config.address, config.subnet_prefix
    ));
    out.push_str("[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", config.server_public_key));
    out.push_str(&format!("Endpoint = {}\n", config.server_endpoint));
    let mut allowed: Vec<String> = vec![format!("{}/32", config.gateway)];
    allowed.extend(config.allowed_addresses.iter().map(|a| format!("{}/32", a)));
    out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
    out.push_str("PersistentKeepalive = 25\n");
    out
}
