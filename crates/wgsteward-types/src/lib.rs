//! wgsteward-types: Shared record definitions for the wgsteward ecosystem.
//!
//! This crate contains the persisted data model (clients, profiles, settings,
//! usage snapshots, audit entries) shared between the core library, the
//! scheduler daemon, and the admin frontend.

#![warn(missing_docs)]

pub mod live;

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One VPN peer identity managed by the console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique identifier, immutable after creation.
    pub id: Uuid,
    /// Human-readable name (e.g. "Dad's laptop").
    pub name: String,
    /// Assigned tunnel IPv4 address, unique across all clients.
    pub ip_address: Ipv4Addr,
    /// Assigned tunnel IPv6 address, when IPv6 is enabled.
    pub ipv6_address: Option<Ipv6Addr>,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// WireGuard private key (base64); generated once, never rotated.
    pub private_key: String,
    /// WireGuard preshared key (base64); generated once, never rotated.
    pub preshared_key: String,
    /// The profile this client's configuration is rendered from.
    pub profile_id: Uuid,
    /// When this client was created.
    pub created_at: DateTime<Utc>,
    /// When this client expires; `None` means it never expires.
    pub expiry_date: Option<DateTime<Utc>>,
    /// Whether the peer should be present on the live interface.
    pub enabled: bool,
    /// Free-form operator notes.
    #[serde(default)]
    pub notes: String,
}

impl Client {
    /// The allowed-IPs list registered for this peer: its own `/32` plus the
    /// `/128` when an IPv6 address is assigned.
    pub fn peer_allowed_ips(&self) -> Vec<String> {
        let mut ips = vec![format!("{}/32", self.ip_address)];
        if let Some(v6) = self.ipv6_address {
            ips.push(format!("{v6}/128"));
        }
        ips
    }

    /// Whether this client's expiry date has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.is_some_and(|expiry| now > expiry)
    }
}

/// A named template of routing/DNS defaults applied when rendering a client
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name; not required to be unique.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Routed CIDRs for clients on this profile; empty falls back to the
    /// global default.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// DNS servers for clients on this profile; empty falls back to the
    /// global default.
    #[serde(default)]
    pub dns: Vec<String>,
    /// MTU override; `None` falls back to the global default.
    pub mtu: Option<u32>,
    /// Persistent-keepalive override in seconds; `None` falls back to the
    /// global default.
    pub persistent_keepalive: Option<u16>,
    /// When this profile was created.
    pub created_at: DateTime<Utc>,
}

/// Process-wide administrative settings singleton.
///
/// Every field carries a serde default so a missing or partial settings
/// document deserializes to the same values as the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Hash of the admin password; verified by the auth layer, stored here.
    #[serde(default)]
    pub admin_password_hash: String,
    /// TOTP secret for admin two-factor auth; verified by the auth layer.
    #[serde(default)]
    pub admin_2fa_secret: String,
    /// Address-allocation cursor: the next IPv4 host offset to issue.
    /// Only ever increases; deleted clients' offsets are never reissued.
    #[serde(default = "default_client_ip_cursor")]
    pub last_client_ip: u32,
    /// Whether initial setup has completed.
    #[serde(default)]
    pub initialized: bool,
}

fn default_client_ip_cursor() -> u32 {
    // .1 is the server; clients start at .2.
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            admin_password_hash: String::new(),
            admin_2fa_secret: String::new(),
            last_client_ip: default_client_ip_cursor(),
            initialized: false,
        }
    }
}

/// Aggregate transfer statistics recorded once per calendar date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Calendar date (local time) this snapshot covers.
    pub date: NaiveDate,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Total bytes received across all matched peers.
    pub total_rx: u64,
    /// Total bytes transmitted across all matched peers.
    pub total_tx: u64,
    /// Per-client breakdown; only clients matched to a live peer appear.
    pub clients: Vec<ClientUsage>,
}

/// One client's transfer totals within a usage snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUsage {
    /// Client identifier.
    pub id: Uuid,
    /// Client name at snapshot time.
    pub name: String,
    /// Bytes received.
    pub transfer_rx: u64,
    /// Bytes transmitted.
    pub transfer_tx: u64,
    /// Bytes received plus transmitted.
    pub transfer_total: u64,
}

/// One entry in the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Action tag, e.g. `CLIENT_AUTO_DISABLED`.
    pub action: String,
    /// Acting user, or `system` for scheduled jobs.
    pub user: String,
    /// Structured action context.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// The audit document for one calendar date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDay {
    /// Calendar date this document covers.
    pub date: NaiveDate,
    /// Entries in append order.
    #[serde(default)]
    pub entries: Vec<AuditEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client() -> Client {
        Client {
            id: Uuid::new_v4(),
            name: "dads-laptop".to_string(),
            ip_address: "10.0.0.2".parse().unwrap(),
            ipv6_address: Some("fd00::2".parse().unwrap()),
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
            preshared_key: "psk".to_string(),
            profile_id: Uuid::new_v4(),
            created_at: Utc::now(),
            expiry_date: None,
            enabled: true,
            notes: String::new(),
        }
    }

    #[test]
    fn client_serializes() {
        let json = serde_json::to_string(&sample_client()).unwrap();
        assert!(json.contains("dads-laptop"));
        assert!(json.contains("10.0.0.2"));
    }

    #[test]
    fn settings_defaults_from_empty_document() {
        let parsed: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, Settings::default());
        assert_eq!(parsed.last_client_ip, 2);
        assert!(!parsed.initialized);
    }

    #[test]
    fn settings_partial_document_keeps_defaults() {
        let parsed: Settings =
            serde_json::from_str(r#"{"last_client_ip": 17}"#).unwrap();
        assert_eq!(parsed.last_client_ip, 17);
        assert!(parsed.admin_password_hash.is_empty());
    }

    #[test]
    fn peer_allowed_ips_includes_v6_when_present() {
        let mut client = sample_client();
        client.ip_address = "10.0.0.5".parse().unwrap();
        client.ipv6_address = Some("fd00::5".parse().unwrap());
        assert_eq!(client.peer_allowed_ips(), vec!["10.0.0.5/32", "fd00::5/128"]);

        client.ipv6_address = None;
        assert_eq!(client.peer_allowed_ips(), vec!["10.0.0.5/32"]);
    }

    #[test]
    fn expiry_check_uses_supplied_clock() {
        let mut client = sample_client();
        assert!(!client.is_expired(Utc::now()));

        client.expiry_date = Some("2024-01-01T00:00:00Z".parse().unwrap());
        assert!(client.is_expired("2025-01-05T00:00:00Z".parse().unwrap()));
        assert!(!client.is_expired("2023-12-31T00:00:00Z".parse().unwrap()));
    }
}
