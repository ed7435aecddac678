// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Wirelift - Common Library
// Shared types, provisioning helpers, and configuration structures

pub mod error;
pub mod keys;
pub mod network;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use keys::KeyPair;
pub use network::{PortLedger, TunnelNetwork, MAX_SESSION_ID, PORT_RANGE_HIGH, PORT_RANGE_LOW};
pub use settings::Settings;
pub use types::{
    ClientConfig, DeploymentConfig, Secret, ServerConfig, SessionEvent, SessionId, SessionState,
    SshAuth, SshTarget, TargetAddressSet, TargetSpec,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
