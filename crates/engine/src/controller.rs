// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Session controller
//
// Owns the one tunnel session and drives its lifecycle: the deployment
// pipeline, the connected-phase supervision, and teardown. State
// transitions are serialized through the controller; a second target
// submission while a session is deploying or connected is rejected rather
// than queued. Every collaborator sits behind a trait, so the whole state
// machine runs against mocks in the tests below.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use wirelift_common::{
    ClientConfig, DeploymentConfig, Error, KeyPair, Result, Secret, ServerConfig, SessionEvent,
    SessionId, SessionState, Settings, SshTarget, TargetAddressSet, TargetSpec, TunnelNetwork,
};

use crate::health;
use crate::ssh::HEARTBEAT_FILE;
use crate::sudo::CredentialGate;
use crate::traits::{LogSink, RemoteDeployer, SecretPrompt, TargetResolver, TunnelClient};

/// How many times a privilege rejection during interface bring-up triggers
/// a re-prompt before the attempt is abandoned
const MAX_PRIVILEGE_RETRIES: u32 = 3;

/// Everything that must be released when the session ends, whatever the
/// reason. Taking it out of the controller is the exactly-once gate for
/// teardown: whoever gets the value runs the teardown, everyone else finds
/// it already gone.
struct ActiveSession {
    session: SessionId,
    token: CancellationToken,
    /// Validated privilege secret, kept for the teardown path
    secret: Secret,
}

#[derive(Clone)]
pub struct SessionController {
    deployer: Arc<dyn RemoteDeployer>,
    tunnel: Arc<dyn TunnelClient>,
    gate: Arc<CredentialGate>,
    resolver: Arc<dyn TargetResolver>,
    prompt: Arc<dyn SecretPrompt>,
    sink: Arc<dyn LogSink>,
    settings: Arc<Settings>,
    local_hostname: String,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Arc<Mutex<SessionState>>,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployer: Arc<dyn RemoteDeployer>,
        tunnel: Arc<dyn TunnelClient>,
        gate: Arc<CredentialGate>,
        resolver: Arc<dyn TargetResolver>,
        prompt: Arc<dyn SecretPrompt>,
        sink: Arc<dyn LogSink>,
        settings: Settings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        let local_hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            deployer,
            tunnel,
            gate,
            resolver,
            prompt,
            sink,
            settings: Arc::new(settings),
            local_hostname,
            event_tx,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Deploy a tunnel to `target` and route `spec` through it. On success
    /// the controller is Connected and supervised; on failure everything
    /// that was provisioned is released and the controller returns to Idle,
    /// ready for the next submission.
    pub async fn connect(&self, target: &SshTarget, spec: &TargetSpec) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.is_busy() {
                return Err(Error::Runtime(format!(
                    "a session is already {}; disconnect it first",
                    state
                )));
            }
            *state = SessionState::Deploying;
        }
        self.emit(SessionEvent::Deploying {
            timestamp: Utc::now(),
        });

        match self.deploy_session(target, spec).await {
            Ok(session) => {
                *self.state.lock().await = SessionState::Connected;
                self.emit(SessionEvent::Connected {
                    session,
                    timestamp: Utc::now(),
                });
                self.sink
                    .append(&format!("Session {} connected", session));
                info!("Session {} connected to {}", session, target.host);
                self.spawn_supervisor().await;
                Ok(())
            }
            Err(e) => {
                self.sink.append(&format!("Deployment failed: {}", e));
                self.emit(SessionEvent::Error {
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                *self.state.lock().await = SessionState::Failed;
                self.discard_failed_attempt().await;
                // Terminal per attempt; the controller itself stays usable
                *self.state.lock().await = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Orderly operator-requested teardown
    pub async fn disconnect(&self) -> Result<()> {
        if !self.state.lock().await.is_connected() {
            return Err(Error::Runtime("no connected session".to_string()));
        }
        self.teardown("disconnected by operator").await;
        // An operator disconnect leaves the controller ready for the next
        // target; a health-triggered one stays Disconnected until then.
        *self.state.lock().await = SessionState::Idle;
        Ok(())
    }

    async fn deploy_session(&self, target: &SshTarget, spec: &TargetSpec) -> Result<SessionId> {
        // Target validation comes first; an empty pool must fail before any
        // SSH, key, or port work happens.
        let (targets, from_pool) = match spec {
            TargetSpec::Single(address) => (TargetAddressSet::new(vec![address.clone()])?, false),
            TargetSpec::Pool(name) => {
                self.sink.append(&format!("Resolving pool '{}'", name));
                let members = self.resolver.resolve_pool(name).await?;
                if members.is_empty() {
                    return Err(Error::Target(format!(
                        "pool '{}' resolved to no members",
                        name
                    )));
                }
                self.sink
                    .append(&format!("Pool '{}' has {} member(s)", name, members.len()));
                (TargetAddressSet::new(members)?, true)
            }
        };

        self.sink.append(&format!(
            "Connecting to {}@{}",
            target.username,
            target.address()
        ));
        self.deployer.connect(target).await?;
        self.sink.append("SSH session established");

        if from_pool {
            // Spot-check one pool member from the remote side before
            // provisioning anything
            let sample = targets.sample();
            self.sink
                .append(&format!("Checking reachability of {}", sample));
            self.deployer.probe_address(sample).await?;
        }

        let port = self
            .deployer
            .allocate_port(self.settings.port_range_low, self.settings.port_range_high)
            .await?;
        let session = SessionId::from_port(port, self.settings.port_range_low);
        self.sink.append(&format!(
            "Claimed remote port {} (session {})",
            port, session
        ));

        let network = TunnelNetwork::for_session(session)?;
        self.sink.append(&format!(
            "Session network {} (server {}, client {})",
            network.cidr(),
            network.server_address,
            network.client_address
        ));

        let server_keys = KeyPair::generate();
        let client_keys = KeyPair::generate();
        self.sink
            .append(&format!("Server public key {}", server_keys.public_key()));
        self.sink
            .append(&format!("Client public key {}", client_keys.public_key()));

        let deployment = DeploymentConfig::for_session(
            &self.settings.remote_base_dir,
            &self.local_hostname,
            port,
        );
        let server_config = ServerConfig {
            private_key: server_keys.private_key().to_string(),
            listen_port: port,
            address: network.server_address,
            subnet_prefix: network.prefix,
            heartbeat_file: HEARTBEAT_FILE.to_string(),
            heartbeat_timeout_secs: self.settings.heartbeat_timeout_secs,
        };
        self.sink.append(&format!(
            "Deploying tunnel server into {}",
            deployment.remote_dir
        ));
        self.deployer.deploy(&deployment, &server_config).await?;

        // One token is the shutdown signal for every task this session
        // spawns: server stream, heartbeat, health monitor, supervisor.
        let token = CancellationToken::new();
        *self.active.lock().await = Some(ActiveSession {
            session,
            token: token.clone(),
            secret: Zeroizing::new(String::new()),
        });

        self.spawn_server_stream(token.clone(), deployment.clone());
        self.spawn_heartbeat(token.clone(), deployment.clone());
        self.sink.append("Remote tunnel server started");

        let settle = self.settings.settle_delay();
        if !settle.is_zero() {
            self.sink.append(&format!(
                "Waiting {}s for the server listener",
                settle.as_secs()
            ));
            tokio::time::sleep(settle).await;
        }

        self.deployer
            .register_peer(&deployment, client_keys.public_key(), network.client_address, port)
            .await?;
        self.sink.append("Client registered as tunnel peer");

        let client_config = ClientConfig {
            private_key: client_keys.private_key().to_string(),
            server_public_key: server_keys.public_key().to_string(),
            server_endpoint: format!("{}:{}", target.host, port),
            address: network.client_address,
            subnet_prefix: network.prefix,
            gateway: network.server_address,
            allowed_addresses: targets.addresses().to_vec(),
        };

        // Obtaining the secret may suspend here on the operator prompt; the
        // pipeline resumes from this exact point when the answer arrives.
        let mut secret = self.gate.obtain(self.prompt.as_ref()).await?;
        let mut retries = 0;
        loop {
            match self.tunnel.connect(&client_config, &secret).await {
                Ok(()) => break,
                Err(e) if e.is_privilege() && retries < MAX_PRIVILEGE_RETRIES => {
                    retries += 1;
                    self.sink
                        .append("Privilege secret was rejected, asking again");
                    self.gate.reject().await;
                    secret = self.gate.obtain(self.prompt.as_ref()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        self.sink.append("Local tunnel interface is up");

        if let Some(active) = self.active.lock().await.as_mut() {
            active.secret = secret;
        }
        Ok(session)
    }

    /// Stream the remote server's output for the session's lifetime. An
    /// exit that was not asked for surfaces as a ServerExited event; the
    /// health monitor notices the dead tunnel and tears the session down.
    fn spawn_server_stream(&self, token: CancellationToken, deployment: DeploymentConfig) {
        let deployer = self.deployer.clone();
        let sink = self.sink.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = deployer.run_server(token, &deployment, sink.clone()).await {
                sink.append(&format!("Remote server stopped: {}", e));
                if let Err(send_err) = event_tx.send(SessionEvent::ServerExited {
                    error: e.to_string(),
                    timestamp: Utc::now(),
                }) {
                    debug!("No listeners for server-exit event: {}", send_err);
                }
            }
        });
    }

    fn spawn_heartbeat(&self, token: CancellationToken, deployment: DeploymentConfig) {
        let deployer = self.deployer.clone();
        tokio::spawn(async move {
            if let Err(e) = deployer.run_heartbeat(token, &deployment).await {
                warn!("Heartbeat task ended with an error: {}", e);
            }
        });
    }

    /// Start the connected-phase supervision: the health monitor plus the
    /// task that reacts to its (at most one) failure report.
    async fn spawn_supervisor(&self) {
        let token = match self.active.lock().await.as_ref() {
            Some(active) => active.token.clone(),
            None => return,
        };
        let (failure_tx, mut failure_rx) = mpsc::channel(1);
        health::spawn(
            self.settings.health_interval(),
            token.clone(),
            self.deployer.clone(),
            self.tunnel.clone(),
            failure_tx,
        );
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                Some(reason) = failure_rx.recv() => {
                    controller.sink.append(&format!("Health check failed: {}", reason));
                    controller.emit(SessionEvent::HealthCheckFailed {
                        error: reason.clone(),
                        timestamp: Utc::now(),
                    });
                    controller.teardown(&reason).await;
                }
            }
        });
    }

    /// Release everything the session holds, in reverse order of
    /// acquisition, tolerating partial state. Runs at most once per
    /// session: the first caller takes the ActiveSession, later callers
    /// find it gone and return immediately.
    async fn teardown(&self, reason: &str) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        active.token.cancel();
        if let Err(e) = self.tunnel.disconnect(&active.secret).await {
            self.sink
                .append(&format!("Local teardown issue (ignored): {}", e));
        }
        // Closing the SSH session cuts the heartbeat; the remote server
        // exits on its own when the heartbeat file goes stale.
        if let Err(e) = self.deployer.disconnect().await {
            self.sink
                .append(&format!("Remote teardown issue (ignored): {}", e));
        }
        *self.state.lock().await = SessionState::Disconnected;
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.sink
            .append(&format!("Session {} disconnected: {}", active.session, reason));
        info!("Session {} disconnected: {}", active.session, reason);
    }

    /// Cleanup after a pipeline failure. Unlike teardown this emits no
    /// Disconnected event; the Error event already told the story.
    async fn discard_failed_attempt(&self) {
        let taken = self.active.lock().await.take();
        match taken {
            Some(active) => {
                active.token.cancel();
                if let Err(e) = self.tunnel.disconnect(&active.secret).await {
                    debug!("Local cleanup after failure: {}", e);
                }
                if let Err(e) = self.deployer.disconnect().await {
                    debug!("Remote cleanup after failure: {}", e);
                }
            }
            None => {
                // Failed before anything remote was provisioned; still
                // close the SSH session if one was opened
                if let Err(e) = self.deployer.disconnect().await {
                    debug!("SSH cleanup after failure: {}", e);
                }
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No listeners for session event: {}", e);
        }
    }

    #[cfg(test)]
    async fn has_active_session(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{PrivilegeProbe, SecretStore};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockDeployer {
        exhaust_ports: bool,
        fail_deploy: bool,
        ssh_healthy: AtomicBool,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl MockDeployer {
        fn healthy() -> Self {
            Self {
                ssh_healthy: AtomicBool::new(true),
                ..Default::default()
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn called(&self, call: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|c| *c == call)
        }
    }

    #[async_trait]
    impl RemoteDeployer for MockDeployer {
        async fn connect(&self, _target: &SshTarget) -> Result<()> {
            self.record("connect");
            Ok(())
        }
        async fn probe_address(&self, _address: &str) -> Result<()> {
            self.record("probe_address");
            Ok(())
        }
        async fn allocate_port(&self, low: u16, high: u16) -> Result<u16> {
            self.record("allocate_port");
            if self.exhaust_ports {
                return Err(Error::PortRangeExhausted { low, high });
            }
            Ok(low + 2)
        }
        async fn deploy(&self, _config: &DeploymentConfig, _server: &ServerConfig) -> Result<()> {
            self.record("deploy");
            if self.fail_deploy {
                return Err(Error::Provisioning("upload failed".to_string()));
            }
            Ok(())
        }
        async fn run_server(
            &self,
            token: CancellationToken,
            _config: &DeploymentConfig,
            _sink: Arc<dyn LogSink>,
        ) -> Result<()> {
            self.record("run_server");
            token.cancelled().await;
            Ok(())
        }
        async fn run_heartbeat(
            &self,
            token: CancellationToken,
            _config: &DeploymentConfig,
        ) -> Result<()> {
            self.record("run_heartbeat");
            token.cancelled().await;
            Ok(())
        }
        async fn register_peer(
            &self,
            _config: &DeploymentConfig,
            _client_public_key: &str,
            _client_address: Ipv4Addr,
            _port: u16,
        ) -> Result<()> {
            self.record("register_peer");
            Ok(())
        }
        async fn check_ssh_health(&self) -> Result<()> {
            if self.ssh_healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::SshConnection("session went away".to_string()))
            }
        }
        async fn disconnect(&self) -> Result<()> {
            self.record("disconnect");
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTunnel {
        privilege_failures: AtomicU32,
        connects: AtomicU32,
        disconnects: AtomicU32,
        up: AtomicBool,
    }

    #[async_trait]
    impl TunnelClient for MockTunnel {
        async fn connect(&self, _config: &ClientConfig, _secret: &Secret) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .privilege_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Privilege("sorry, try again".to_string()));
            }
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self, _secret: &Secret) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.up.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn check_tunnel_health(&self) -> Result<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Runtime("tunnel is down".to_string()))
            }
        }
        async fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    struct StaticResolver(Vec<String>);

    #[async_trait]
    impl TargetResolver for StaticResolver {
        async fn resolve_pool(&self, _name: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    /// Collects progress lines for assertions
    #[derive(Default)]
    struct VecSink(StdMutex<Vec<String>>);

    impl LogSink for VecSink {
        fn append(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    impl VecSink {
        fn contains(&self, needle: &str) -> bool {
            self.0.lock().unwrap().iter().any(|l| l.contains(needle))
        }
    }

    struct MemoryStore(StdMutex<Option<String>>);

    impl SecretStore for MemoryStore {
        fn get(&self) -> Option<String> {
            self.0.lock().unwrap().clone()
        }
        fn save(&self, secret: &str) -> Result<()> {
            *self.0.lock().unwrap() = Some(secret.to_string());
            Ok(())
        }
        fn delete(&self) -> Result<()> {
            *self.0.lock().unwrap() = None;
            Ok(())
        }
    }

    /// Accepts everything; `passwordless` decides whether a prompt happens
    struct OpenProbe {
        passwordless: bool,
    }

    #[async_trait]
    impl PrivilegeProbe for OpenProbe {
        async fn passwordless(&self) -> bool {
            self.passwordless
        }
        async fn validate(&self, _secret: &Secret) -> Result<bool> {
            Ok(true)
        }
    }

    struct CountingPrompt(AtomicU32);

    #[async_trait]
    impl SecretPrompt for CountingPrompt {
        async fn request_secret(&self, _prompt: &str) -> Result<Secret> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Zeroizing::new("hunter2".to_string()))
        }
    }

    struct Fixture {
        controller: SessionController,
        deployer: Arc<MockDeployer>,
        tunnel: Arc<MockTunnel>,
        sink: Arc<VecSink>,
        prompt: Arc<CountingPrompt>,
    }

    fn fixture(deployer: MockDeployer, tunnel: MockTunnel, passwordless: bool) -> Fixture {
        fixture_with_pool(deployer, tunnel, passwordless, vec![])
    }

    fn fixture_with_pool(
        deployer: MockDeployer,
        tunnel: MockTunnel,
        passwordless: bool,
        pool: Vec<String>,
    ) -> Fixture {
        let deployer = Arc::new(deployer);
        let tunnel = Arc::new(tunnel);
        let sink = Arc::new(VecSink::default());
        let prompt = Arc::new(CountingPrompt(AtomicU32::new(0)));
        let gate = Arc::new(CredentialGate::new(
            Box::new(MemoryStore(StdMutex::new(None))),
            Box::new(OpenProbe { passwordless }),
        ));
        let settings = Settings {
            settle_delay_secs: 0,
            health_interval_secs: 1,
            ..Settings::default()
        };
        let controller = SessionController::new(
            deployer.clone(),
            tunnel.clone(),
            gate,
            Arc::new(StaticResolver(pool)),
            prompt.clone(),
            sink.clone(),
            settings,
        );
        Fixture {
            controller,
            deployer,
            tunnel,
            sink,
            prompt,
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            host: "gateway.example.net".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: wirelift_common::SshAuth::Password {
                password: "pw".to_string(),
            },
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn single_address_connects_and_disconnects() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        let mut rx = f.controller.subscribe();

        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();
        assert_eq!(f.controller.state().await, SessionState::Connected);
        assert!(f.tunnel.is_connected().await);
        // Single-address submissions skip the pool spot-check
        assert!(!f.deployer.called("probe_address"));

        f.controller.disconnect().await.unwrap();
        assert_eq!(f.controller.state().await, SessionState::Idle);
        assert!(!f.tunnel.is_connected().await);
        assert!(f.deployer.called("disconnect"));
        assert!(!f.controller.has_active_session().await);

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::Deploying { .. }));
        assert!(matches!(events[1], SessionEvent::Connected { .. }));
        assert!(matches!(events[2], SessionEvent::Disconnected { .. }));
    }

    #[tokio::test]
    async fn pool_target_is_spot_checked() {
        let f = fixture_with_pool(
            MockDeployer::healthy(),
            MockTunnel::default(),
            true,
            vec!["10.1.2.3".to_string(), "10.1.2.4".to_string()],
        );
        f.controller
            .connect(&target(), &TargetSpec::Pool("lab".to_string()))
            .await
            .unwrap();
        assert!(f.deployer.called("probe_address"));
        f.controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn empty_pool_fails_before_any_remote_work() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        let err = f
            .controller
            .connect(&target(), &TargetSpec::Pool("empty".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Target(_)));
        assert_eq!(f.controller.state().await, SessionState::Idle);
        assert!(!f.deployer.called("connect"));
    }

    #[tokio::test]
    async fn port_exhaustion_aborts_before_provisioning() {
        let deployer = MockDeployer {
            exhaust_ports: true,
            ..MockDeployer::healthy()
        };
        let f = fixture(deployer, MockTunnel::default(), true);
        let err = f
            .controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortRangeExhausted { .. }));
        assert_eq!(f.controller.state().await, SessionState::Idle);
        assert!(!f.deployer.called("deploy"));
        // No keys were provisioned for the aborted attempt
        assert!(!f.sink.contains("public key"));
    }

    #[tokio::test]
    async fn failure_midway_cleans_up_and_returns_to_idle() {
        let deployer = MockDeployer {
            fail_deploy: true,
            ..MockDeployer::healthy()
        };
        let f = fixture(deployer, MockTunnel::default(), true);
        let mut rx = f.controller.subscribe();

        let err = f
            .controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert_eq!(f.controller.state().await, SessionState::Idle);
        assert!(!f.controller.has_active_session().await);
        // The SSH session opened for the attempt was closed again
        assert!(f.deployer.called("disconnect"));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn submission_while_connected_is_rejected() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();

        let err = f
            .controller
            .connect(&target(), &TargetSpec::Single("10.1.2.4".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        // The live session was not disturbed
        assert_eq!(f.controller.state().await, SessionState::Connected);
        f.controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_without_session_is_an_error() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        assert!(f.controller.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn privilege_rejection_reprompts_and_recovers() {
        let tunnel = MockTunnel {
            privilege_failures: AtomicU32::new(1),
            ..Default::default()
        };
        let f = fixture(MockDeployer::healthy(), tunnel, false);
        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();
        // One prompt for the initial secret, one after the rejection
        assert_eq!(f.prompt.0.load(Ordering::SeqCst), 2);
        assert_eq!(f.tunnel.connects.load(Ordering::SeqCst), 2);
        assert_eq!(f.controller.state().await, SessionState::Connected);
        f.controller.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn health_failure_tears_down_exactly_once() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        let mut rx = f.controller.subscribe();
        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();
        drain(&mut rx);

        f.deployer.ssh_healthy.store(false, Ordering::SeqCst);
        // Several monitor ticks pass; only the first failing one may act
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(f.controller.state().await, SessionState::Disconnected);
        assert!(!f.controller.has_active_session().await);
        assert_eq!(f.tunnel.disconnects.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        let failures = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::HealthCheckFailed { .. }))
            .count();
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(disconnects, 1);

        // A new submission is accepted after the automatic teardown
        f.deployer.ssh_healthy.store(true, Ordering::SeqCst);
        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();
        assert_eq!(f.controller.state().await, SessionState::Connected);
        f.controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn operator_disconnect_is_idempotent_at_the_tunnel_level() {
        let f = fixture(MockDeployer::healthy(), MockTunnel::default(), true);
        f.controller
            .connect(&target(), &TargetSpec::Single("10.1.2.3".to_string()))
            .await
            .unwrap();
        f.controller.disconnect().await.unwrap();
        // Second disconnect finds no session and reports that
        assert!(f.controller.disconnect().await.is_err());
        assert_eq!(f.tunnel.disconnects.load(Ordering::SeqCst), 1);
    }
}
