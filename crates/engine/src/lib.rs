// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Wirelift - Session Engine
// Deployment pipeline, session supervision, and the collaborators it
// coordinates: SSH deployer, local tunnel client, credential gate.

pub mod controller;
mod health;
pub mod local;
pub mod ssh;
pub mod sudo;
pub mod traits;

pub use controller::SessionController;
pub use local::WgTunnel;
pub use ssh::SshDeployer;
pub use sudo::{CredentialGate, KeyringStore, SudoProbe};
pub use traits::{
    ChannelSink, LogSink, PrivilegeProbe, RemoteDeployer, SecretPrompt, SecretStore,
    TargetResolver, TunnelClient,
};
