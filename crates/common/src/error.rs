// Error types for Wirelift

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH connection error: {0}")]
    SshConnection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No free port in range {low}..={high} on the remote host")]
    PortRangeExhausted { low: u16, high: u16 },

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Privilege escalation failed: {0}")]
    Privilege(String),

    #[error("Runtime failure: {0}")]
    Runtime(String),

    #[error("Invalid target: {0}")]
    Target(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// True for errors the controller can recover from in place by
    /// re-prompting the operator instead of failing the attempt.
    pub fn is_privilege(&self) -> bool {
        matches!(self, Error::Privilege(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
