// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Health monitor
//
// Fixed-interval supervision for a Connected session. Each tick runs two
// independent probes: SSH liveness (a live SSH session with a dead tunnel
// is a distinct failure mode from the reverse) and tunnel liveness. The
// first failing tick reports once and stops; repeated failing ticks can
// never produce a second teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::traits::{RemoteDeployer, TunnelClient};

pub(crate) fn spawn(
    interval: Duration,
    token: CancellationToken,
    deployer: Arc<dyn RemoteDeployer>,
    tunnel: Arc<dyn TunnelClient>,
    failure_tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of tokio's interval fires immediately; the session
        // was healthy a moment ago, so skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Health monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let failure = if let Err(e) = deployer.check_ssh_health().await {
                        Some(format!("SSH health check failed: {}", e))
                    } else if let Err(e) = tunnel.check_tunnel_health().await {
                        Some(format!("tunnel health check failed: {}", e))
                    } else {
                        None
                    };

                    if let Some(reason) = failure {
                        warn!("{}", reason);
                        // Capacity-1 channel; if a report is already in
                        // flight the session is going down anyway.
                        let _ = failure_tx.try_send(reason);
                        return;
                    }
                }
            }
        }
    })
}
