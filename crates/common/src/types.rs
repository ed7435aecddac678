// Common types for Wirelift

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Privilege-escalation secret. Zeroed on drop, never logged.
/// An empty secret is valid when the platform allows passwordless elevation.
pub type Secret = Zeroizing<String>;

/// Authentication material for an SSH target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum SshAuth {
    /// Password authentication
    Password { password: String },
    /// Private key file authentication
    Key {
        key_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// The remote machine that fronts the target network.
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(flatten)]
    pub auth: SshAuth,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the operator asked to reach through the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// One IP address
    Single(String),
    /// A named address pool, resolved via the target resolver
    Pool(String),
}

/// The resolved, non-empty set of addresses to route through the tunnel.
/// Immutable once the deployment pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddressSet {
    addresses: Vec<String>,
}

impl TargetAddressSet {
    /// Build the set, rejecting empty input. An empty resolved pool is a
    /// hard failure before any SSH or provisioning work happens.
    pub fn new(addresses: Vec<String>) -> crate::Result<Self> {
        if addresses.is_empty() {
            return Err(crate::Error::Target(
                "target address set is empty".to_string(),
            ));
        }
        if let Some(bad) = addresses
            .iter()
            .find(|a| a.trim().is_empty() || a.parse::<Ipv4Addr>().is_err())
        {
            return Err(crate::Error::Target(format!(
                "not a valid IPv4 address: {:?}",
                bad
            )));
        }
        Ok(Self { addresses })
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Sample address used for the pre-deployment reachability spot-check
    pub fn sample(&self) -> &str {
        &self.addresses[0]
    }
}

/// Small positive integer unique among concurrently active sessions.
/// Assigned when a remote listen port is successfully claimed; drives the
/// network and workdir derivation so sessions never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u16);

impl SessionId {
    pub fn new(id: u16) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    /// Derive the identity from the claimed port and the range floor.
    /// Port uniqueness on the remote host is what makes this unique.
    pub fn from_port(port: u16, low: u16) -> Self {
        Self(port - low + 1)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the session lives on the remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Session-scoped remote working directory. Derived from the local
    /// hostname plus the allocated port, so concurrent sessions from the
    /// same or different controllers never collide on one remote host.
    pub remote_dir: String,
}

impl DeploymentConfig {
    pub fn for_session(base_dir: &str, local_hostname: &str, port: u16) -> Self {
        Self {
            remote_dir: format!("{}/wirelift-{}-{}", base_dir, local_hostname, port),
        }
    }
}

/// Parameters handed to the remote tunnel engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub private_key: String,
    pub listen_port: u16,
    pub address: Ipv4Addr,
    pub subnet_prefix: u8,
    /// File the controller touches periodically; the server exits on its
    /// own when the file goes stale.
    pub heartbeat_file: String,
    pub heartbeat_timeout_secs: u64,
}

/// Parameters handed to the local tunnel engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub private_key: String,
    pub server_public_key: String,
    pub server_endpoint: String,
    pub address: Ipv4Addr,
    pub subnet_prefix: u8,
    /// Server-side tunnel address, used as the health-check peer
    pub gateway: Ipv4Addr,
    /// Target addresses routed through the tunnel
    pub allowed_addresses: Vec<String>,
}

/// State of the one session a controller owns.
/// Transitions are serialized; no concurrent deployments per controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,         // no session, accepts a new target
    Deploying,    // pipeline in flight
    Connected,    // both ends up, health monitor running
    Failed,       // deployment attempt failed (terminal per attempt)
    Disconnected, // torn down (terminal per attempt)
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// States in which a new target submission must be rejected
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Deploying | SessionState::Connected)
    }

    /// Terminal-per-attempt states reset to Idle on the next submission
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Deploying => "deploying",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Events broadcast by the session controller.
/// Delivery is best-effort: sends never block and are dropped (with a log
/// line) when nobody is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Deployment pipeline started
    Deploying { timestamp: DateTime<Utc> },

    /// Both tunnel ends are up
    Connected {
        session: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// Session torn down
    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A health check failed; automatic teardown was triggered
    HealthCheckFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The remote tunnel server exited without being asked to
    ServerExited {
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Deployment error
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_target_set_is_rejected() {
        assert!(TargetAddressSet::new(vec![]).is_err());
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!(TargetAddressSet::new(vec!["10.1.2.3".into(), "nonsense".into()]).is_err());
        assert!(TargetAddressSet::new(vec!["".into()]).is_err());
    }

    #[test]
    fn sample_is_first_member() {
        let set = TargetAddressSet::new(vec!["10.1.2.3".into(), "10.1.2.4".into()]).unwrap();
        assert_eq!(set.sample(), "10.1.2.3");
        assert_eq!(set.addresses().len(), 2);
    }

    #[test]
    fn session_id_from_port() {
        let id = SessionId::from_port(51821, 51821);
        assert_eq!(id.get(), 1);
        let id = SessionId::from_port(51920, 51821);
        assert_eq!(id.get(), 100);
    }

    #[test]
    fn session_id_rejects_zero() {
        assert!(SessionId::new(0).is_none());
        assert!(SessionId::new(1).is_some());
    }

    #[test]
    fn workdir_embeds_hostname_and_port() {
        let cfg = DeploymentConfig::for_session("/tmp", "laptop", 51823);
        assert_eq!(cfg.remote_dir, "/tmp/wirelift-laptop-51823");
    }

    #[test]
    fn busy_states() {
        assert!(SessionState::Deploying.is_busy());
        assert!(SessionState::Connected.is_busy());
        assert!(!SessionState::Idle.is_busy());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Disconnected.is_terminal());
    }
}
