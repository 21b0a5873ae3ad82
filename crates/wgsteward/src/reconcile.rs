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

//! Scheduled reconciliation: expiry sweeps, daily usage snapshots, and the
//! record-vs-live divergence check. Failures are isolated per client and per
//! run; a scheduled job never halts the process.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use wgsteward_types::live::LivePeer;
use wgsteward_types::{Client, ClientUsage, UsageSnapshot};

use crate::lifecycle::{ClientManager, LifecycleError};
use crate::wg::Tunnel;

/// Disable every enabled client whose expiry has passed.
///
/// One client's failure is logged and does not abort the sweep. Returns the
/// number of clients disabled; a second run with no clock change is a no-op.
#[tracing::instrument(skip_all)]
pub async fn expiry_sweep<T: Tunnel>(mgr: &ClientManager<T>, now: DateTime<Utc>) -> usize {
    let clients = match mgr.store().clients().await {
        Ok(clients) => clients,
        Err(e) => {
            error!(error = %e, "failed to list clients for expiry sweep");
            return 0;
        }
    };

    let mut disabled = 0;
    for client in clients.iter().filter(|c| c.enabled && c.is_expired(now)) {
        match mgr.disable(client.id).await {
            Ok(_) => {
                info!(client = %client.name, "disabled expired client");
                if let Err(e) = mgr
                    .store()
                    .log_audit(
                        "CLIENT_AUTO_DISABLED",
                        "system",
                        json!({
                            "client_id": client.id,
                            "name": client.name,
                            "reason": "expired",
                        }),
                    )
                    .await
                {
                    error!(client = %client.name, error = %e, "failed to record audit entry");
                }
                disabled += 1;
            }
            Err(e) => {
                error!(client = %client.name, error = %e, "failed to disable expired client");
            }
        }
    }

    if disabled > 0 {
        info!(disabled, "expiry sweep complete");
    } else {
        debug!("no expired clients");
    }
    disabled
}

/// Record the usage snapshot for `date` from one stats fetch.
///
/// Clients are joined to live peers by public key; unmatched clients are
/// omitted from the breakdown and contribute zero to the totals. Re-running
/// for the same date overwrites the earlier snapshot.
#[tracing::instrument(skip(mgr))]
pub async fn record_daily_usage<T: Tunnel>(
    mgr: &ClientManager<T>,
    date: NaiveDate,
) -> Result<UsageSnapshot, LifecycleError> {
    let peers = mgr.tunnel().interface_stats().await;
    let clients = mgr.store().clients().await?;

    let by_key: HashMap<&str, &LivePeer> =
        peers.iter().map(|p| (p.public_key.as_str(), p)).collect();

    let mut snapshot = UsageSnapshot {
        date,
        timestamp: Utc::now(),
        total_rx: 0,
        total_tx: 0,
        clients: Vec::new(),
    };

    for client in &clients {
        let Some(peer) = by_key.get(client.public_key.as_str()) else {
            continue;
        };
        snapshot.total_rx += peer.transfer_rx;
        snapshot.total_tx += peer.transfer_tx;
        snapshot.clients.push(ClientUsage {
            id: client.id,
            name: client.name.clone(),
            transfer_rx: peer.transfer_rx,
            transfer_tx: peer.transfer_tx,
            transfer_total: peer.transfer_rx + peer.transfer_tx,
        });
    }

    mgr.store().save_usage_snapshot(&snapshot).await?;
    mgr.store()
        .log_audit(
            "USAGE_RECORDED",
            "system",
            json!({
                "date": date.to_string(),
                "total_clients": snapshot.clients.len(),
            }),
        )
        .await?;

    info!(clients = snapshot.clients.len(), "recorded daily usage");
    Ok(snapshot)
}

/// One disagreement between the record store and the live peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// Record says enabled but the daemon has no such peer.
    MissingPeer { client_id: Uuid, public_key: String },
    /// Record says disabled but the daemon still serves the peer.
    StalePeer { client_id: Uuid, public_key: String },
    /// The daemon serves a peer no record matches.
    UnknownPeer { public_key: String },
}

/// Diff the record store against the live peer set.
///
/// The two are only eventually consistent; this is the explicit observation
/// of both facts rather than an assertion that they agree.
pub fn divergences(clients: &[Client], peers: &[LivePeer]) -> Vec<Divergence> {
    let live: HashSet<&str> = peers.iter().map(|p| p.public_key.as_str()).collect();
    let known: HashSet<&str> = clients.iter().map(|c| c.public_key.as_str()).collect();

    let mut out = Vec::new();
    for client in clients {
        let present = live.contains(client.public_key.as_str());
        if client.enabled && !present {
            out.push(Divergence::MissingPeer {
                client_id: client.id,
                public_key: client.public_key.clone(),
            });
        } else if !client.enabled && present {
            out.push(Divergence::StalePeer {
                client_id: client.id,
                public_key: client.public_key.clone(),
            });
        }
    }
    for peer in peers {
        if !known.contains(peer.public_key.as_str()) {
            out.push(Divergence::UnknownPeer {
                public_key: peer.public_key.clone(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str, public_key: &str, enabled: bool) -> Client {
        Client {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip_address: "10.0.0.2".parse().unwrap(),
            ipv6_address: None,
            public_key: public_key.to_string(),
            private_key: "priv".to_string(),
            preshared_key: "psk".to_string(),
            profile_id: Uuid::new_v4(),
            created_at: Utc::now(),
            expiry_date: None,
            enabled,
            notes: String::new(),
        }
    }

    fn live(public_key: &str) -> LivePeer {
        LivePeer {
            public_key: public_key.to_string(),
            preshared_key: None,
            endpoint: None,
            allowed_ips: "10.0.0.2/32".to_string(),
            latest_handshake: 0,
            transfer_rx: 0,
            transfer_tx: 0,
            persistent_keepalive: None,
        }
    }

    #[test]
    fn agreement_yields_no_divergence() {
        let clients = vec![client("a", "pk-a", true), client("b", "pk-b", false)];
        let peers = vec![live("pk-a")];
        assert!(divergences(&clients, &peers).is_empty());
    }

    #[test]
    fn enabled_client_missing_from_live_set() {
        let clients = vec![client("a", "pk-a", true)];
        let found = divergences(&clients, &[]);
        assert_eq!(found.len(), 1);
        assert!(matches!(&found[0], Divergence::MissingPeer { public_key, .. } if public_key == "pk-a"));
    }

    #[test]
    fn disabled_client_still_served() {
        let clients = vec![client("a", "pk-a", false)];
        let peers = vec![live("pk-a")];
        let found = divergences(&clients, &peers);
        assert_eq!(found.len(), 1);
        assert!(matches!(&found[0], Divergence::StalePeer { .. }));
    }

    #[test]
    fn unmatched_live_peer_reported() {
        let peers = vec![live("pk-ghost")];
        let found = divergences(&[], &peers);
        assert_eq!(found.len(), 1);
        assert!(matches!(&found[0], Divergence::UnknownPeer { public_key } if public_key == "pk-ghost"));
    }
}
