// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Network and port provisioning for tunnel sessions

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::SessionId;
use crate::{Error, Result};

/// Fixed window of remote listen ports reserved for wirelift sessions.
/// 100 ports, one per concurrently active session on the remote host.
pub const PORT_RANGE_LOW: u16 = 51821;
pub const PORT_RANGE_HIGH: u16 = 51920;

/// Largest session identity the port window can produce
pub const MAX_SESSION_ID: u16 = PORT_RANGE_HIGH - PORT_RANGE_LOW + 1;

/// Point-to-point tunnel network for one session.
///
/// Each session gets its own /30-equivalent block in which the server and
/// client addresses are the only two usable hosts. Blocks are derived
/// deterministically from the session identity so no two active sessions
/// can ever share an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelNetwork {
    pub subnet: Ipv4Addr,
    pub prefix: u8,
    pub server_address: Ipv4Addr,
    pub client_address: Ipv4Addr,
}

impl TunnelNetwork {
    /// Derive the session's network: `10.67.<id>.0/30`, server `.1`,
    /// client `.2`. Distinct ids land in distinct third octets, so the
    /// blocks are disjoint across the whole supported range.
    pub fn for_session(session: SessionId) -> Result<Self> {
        let id = session.get();
        if id > MAX_SESSION_ID {
            return Err(Error::Provisioning(format!(
                "session identity {} exceeds the supported range 1..={}",
                id, MAX_SESSION_ID
            )));
        }
        let octet = id as u8;
        Ok(Self {
            subnet: Ipv4Addr::new(10, 67, octet, 0),
            prefix: 30,
            server_address: Ipv4Addr::new(10, 67, octet, 1),
            client_address: Ipv4Addr::new(10, 67, octet, 2),
        })
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.subnet, self.prefix)
    }
}

/// Claimed-port bookkeeping for one controller lifetime.
///
/// The remote probe decides whether a port is free on the host; the ledger
/// guarantees this controller never re-issues a port it already handed out,
/// even after the earlier session released it out from under us.
#[derive(Debug, Default)]
pub struct PortLedger {
    claimed: HashSet<u16>,
}

impl PortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports still worth probing, in ascending order
    pub fn candidates(&self, low: u16, high: u16) -> Vec<u16> {
        (low..=high).filter(|p| !self.claimed.contains(p)).collect()
    }

    /// Record a successful claim. Returns false if the port was already
    /// claimed, which callers treat as a bug.
    pub fn claim(&mut self, port: u16) -> bool {
        self.claimed.insert(port)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u16) -> SessionId {
        SessionId::new(id).unwrap()
    }

    #[test]
    fn networks_are_disjoint_across_supported_range() {
        let mut seen = HashSet::new();
        for id in 1..=MAX_SESSION_ID {
            let net = TunnelNetwork::for_session(session(id)).unwrap();
            // No address of this block may appear in any other block
            assert!(seen.insert(net.subnet), "subnet collision at id {}", id);
            assert!(seen.insert(net.server_address));
            assert!(seen.insert(net.client_address));
        }
    }

    #[test]
    fn server_and_client_are_the_two_usable_hosts() {
        let net = TunnelNetwork::for_session(session(7)).unwrap();
        assert_eq!(net.subnet, Ipv4Addr::new(10, 67, 7, 0));
        assert_eq!(net.server_address, Ipv4Addr::new(10, 67, 7, 1));
        assert_eq!(net.client_address, Ipv4Addr::new(10, 67, 7, 2));
        assert_eq!(net.prefix, 30);
        assert_eq!(net.cidr(), "10.67.7.0/30");
    }

    #[test]
    fn out_of_range_session_is_rejected() {
        assert!(TunnelNetwork::for_session(session(MAX_SESSION_ID)).is_ok());
        assert!(TunnelNetwork::for_session(session(MAX_SESSION_ID + 1)).is_err());
    }

    #[test]
    fn ledger_never_offers_outside_range() {
        let ledger = PortLedger::new();
        for p in ledger.candidates(PORT_RANGE_LOW, PORT_RANGE_HIGH) {
            assert!((PORT_RANGE_LOW..=PORT_RANGE_HIGH).contains(&p));
        }
        assert_eq!(
            ledger.candidates(PORT_RANGE_LOW, PORT_RANGE_HIGH).len(),
            100
        );
    }

    #[test]
    fn ledger_never_reissues_a_claimed_port() {
        let mut ledger = PortLedger::new();
        assert!(ledger.claim(51821));
        assert!(!ledger.claim(51821));
        assert!(!ledger.candidates(PORT_RANGE_LOW, PORT_RANGE_HIGH).contains(&51821));
        assert_eq!(ledger.claimed_count(), 1);
    }
}
