// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ephemeral state sourced from the tunnel daemon, never persisted.

use serde::{Deserialize, Serialize};

/// One peer row from the daemon's live dump, keyed by public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePeer {
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Preshared key, when one is set.
    pub preshared_key: Option<String>,
    /// Remote endpoint (`host:port`), when the peer has connected.
    pub endpoint: Option<String>,
    /// Comma-separated allowed-IPs CIDR list.
    pub allowed_ips: String,
    /// Latest handshake as epoch seconds; 0 means never.
    pub latest_handshake: i64,
    /// Bytes received from this peer.
    pub transfer_rx: u64,
    /// Bytes transmitted to this peer.
    pub transfer_tx: u64,
    /// Persistent-keepalive interval in seconds, when enabled.
    pub persistent_keepalive: Option<u16>,
}

/// Health of the tunnel service unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Whether the service unit reports active.
    pub active: bool,
    /// When the unit last became active, as reported by the service manager.
    pub since: Option<String>,
}
