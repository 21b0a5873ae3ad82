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

//! Client lifecycle orchestration.
//!
//! Per-client state machine: Provisioning -> Active <-> Disabled -> Deleted.
//! The record store holds desired state; the live peer set follows it. No
//! transaction spans both, so each operation orders its daemon mutation and
//! record write to keep the user-visible window of divergence small.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use wgsteward_types::{Client, Profile};

use crate::alloc::{self, AllocError};
use crate::config::Config;
use crate::store::{Store, StoreError};
use crate::wg::{self, Tunnel, WgError};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("no profiles available; create a profile first")]
    NoProfileAvailable,

    #[error("profile is referenced by {count} client(s)")]
    ProfileInUse { count: usize },

    #[error(transparent)]
    Wg(#[from] WgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

type Result<T> = std::result::Result<T, LifecycleError>;

/// Request to provision a new client.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    /// Explicit profile; the first available profile when absent.
    pub profile_id: Option<Uuid>,
    /// Days until expiry; `None` or non-positive means never.
    pub expiry_days: Option<i64>,
    pub notes: String,
}

/// The expiry a client ends up with after extending by `days`.
///
/// Extends from the current expiry when it is still in the future, otherwise
/// from `now`; a client without an expiry starts counting from `now`.
pub fn next_expiry(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    days: i64,
) -> DateTime<Utc> {
    let base = match current {
        Some(expiry) if expiry > now => expiry,
        _ => now,
    };
    base + Duration::days(days)
}

pub struct ClientManager<T: Tunnel> {
    store: Store,
    tunnel: T,
    config: Config,
    alloc_lock: Mutex<()>,
}

impl<T: Tunnel> ClientManager<T> {
    pub fn new(store: Store, tunnel: T, config: Config) -> Self {
        Self {
            store,
            tunnel,
            config,
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn require_client(&self, id: Uuid) -> Result<Client> {
        self.store.client(id).await?.ok_or(LifecycleError::Store(
            StoreError::NotFound {
                kind: "client",
                id: id.to_string(),
            },
        ))
    }

    /// The explicit profile when it exists, else the first available one.
    async fn select_profile(&self, profile_id: Option<Uuid>) -> Result<Profile> {
        if let Some(id) = profile_id {
            if let Some(profile) = self.store.profile(id).await? {
                return Ok(profile);
            }
        }
        self.store
            .profiles()
            .await?
            .into_iter()
            .next()
            .ok_or(LifecycleError::NoProfileAvailable)
    }

    /// Provision a new client: keys, addresses, record, live peer.
    ///
    /// If peer registration fails the record is rolled back, but the address
    /// cursor stays advanced — an offset is never reissued once handed out,
    /// so a half-registered peer lingering in the daemon can't collide with
    /// a later client.
    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create(&self, req: NewClient) -> Result<Client> {
        let profile = self.select_profile(req.profile_id).await?;
        let keypair = self.tunnel.generate_keypair().await?;
        let preshared_key = self.tunnel.generate_preshared_key().await?;
        let now = Utc::now();

        // Cursor read and advance stay under one lock so concurrent creates
        // cannot allocate the same offset.
        let client = {
            let _guard = self.alloc_lock.lock().await;
            let settings = self.store.settings().await?;
            let cursor = settings.last_client_ip;

            let ip_address = alloc::next_ipv4(self.config.subnet, cursor)?;
            let ipv6_address = match (self.config.ipv6_enabled, self.config.ipv6_subnet) {
                (true, Some(subnet)) => Some(alloc::next_ipv6(subnet, cursor)?),
                _ => None,
            };

            let client = Client {
                id: Uuid::new_v4(),
                name: req.name,
                ip_address,
                ipv6_address,
                public_key: keypair.public_key,
                private_key: keypair.private_key,
                preshared_key,
                profile_id: profile.id,
                created_at: now,
                expiry_date: req
                    .expiry_days
                    .filter(|days| *days > 0)
                    .map(|days| now + Duration::days(days)),
                enabled: true,
                notes: req.notes,
            };
            self.store.save_client(&client).await?;
            self.store
                .update_settings(|s| s.last_client_ip = cursor + 1)
                .await?;
            client
        };

        if let Err(e) = self
            .tunnel
            .add_peer(
                &client.public_key,
                &client.preshared_key,
                &client.peer_allowed_ips(),
            )
            .await
        {
            warn!(client = %client.name, error = %e, "peer registration failed, rolling back record");
            if let Err(rollback) = self.store.delete_client(client.id).await {
                warn!(client = %client.name, error = %rollback, "rollback delete failed");
            }
            return Err(e.into());
        }

        info!(client = %client.name, ip = %client.ip_address, "client created");
        Ok(client)
    }

    /// Re-register the peer with its original key material and mark the
    /// record enabled. A registration failure leaves the record untouched.
    #[tracing::instrument(skip(self))]
    pub async fn enable(&self, id: Uuid) -> Result<Client> {
        let mut client = self.require_client(id).await?;
        if client.enabled {
            return Ok(client);
        }

        self.tunnel
            .add_peer(
                &client.public_key,
                &client.preshared_key,
                &client.peer_allowed_ips(),
            )
            .await?;

        client.enabled = true;
        self.store.save_client(&client).await?;
        info!(client = %client.name, "client enabled");
        Ok(client)
    }

    /// Remove the live peer and mark the record disabled.
    ///
    /// The record is marked disabled even when peer removal fails: desired
    /// state is authoritative over live-daemon truth, and the divergence
    /// surfaces through [`crate::reconcile::divergences`].
    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, id: Uuid) -> Result<Client> {
        let mut client = self.require_client(id).await?;

        if let Err(e) = self.tunnel.remove_peer(&client.public_key).await {
            warn!(client = %client.name, error = %e, "peer removal failed while disabling");
        }

        if client.enabled {
            client.enabled = false;
            self.store.save_client(&client).await?;
            info!(client = %client.name, "client disabled");
        }
        Ok(client)
    }

    /// Push the expiry `days` further out; enabled state is untouched.
    #[tracing::instrument(skip(self))]
    pub async fn extend(&self, id: Uuid, days: i64) -> Result<Client> {
        let mut client = self.require_client(id).await?;
        let expiry = next_expiry(client.expiry_date, Utc::now(), days);
        client.expiry_date = Some(expiry);
        self.store.save_client(&client).await?;
        info!(client = %client.name, expiry = %expiry, "expiry extended");
        Ok(client)
    }

    /// Remove the peer (best-effort) and delete the record. Never fails on
    /// daemon unavailability: storage consistency wins on deletion.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let client = self.require_client(id).await?;

        if let Err(e) = self.tunnel.remove_peer(&client.public_key).await {
            warn!(client = %client.name, error = %e, "peer removal failed, deleting record anyway");
        }

        self.store.delete_client(id).await?;
        info!(client = %client.name, "client deleted");
        Ok(())
    }

    /// Delete a profile, refusing while any client still references it.
    #[tracing::instrument(skip(self))]
    pub async fn delete_profile(&self, id: Uuid) -> Result<()> {
        let profile = self.store.profile(id).await?.ok_or(LifecycleError::Store(
            StoreError::NotFound {
                kind: "profile",
                id: id.to_string(),
            },
        ))?;

        let count = self
            .store
            .clients()
            .await?
            .iter()
            .filter(|c| c.profile_id == id)
            .count();
        if count > 0 {
            return Err(LifecycleError::ProfileInUse { count });
        }

        self.store.delete_profile(id).await?;
        info!(profile = %profile.name, "profile deleted");
        Ok(())
    }

    /// Render the configuration document for a client. A missing profile
    /// record falls back to the global defaults.
    pub async fn client_config(&self, id: Uuid) -> Result<String> {
        let client = self.require_client(id).await?;
        let profile = self.store.profile(client.profile_id).await?;
        Ok(wg::client_config(&self.config, &client, profile.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn extend_from_future_expiry() {
        let expiry = next_expiry(
            Some(at("2025-01-10T00:00:00Z")),
            at("2025-01-05T00:00:00Z"),
            30,
        );
        assert_eq!(expiry, at("2025-02-09T00:00:00Z"));
    }

    #[test]
    fn extend_from_now_when_already_expired() {
        let expiry = next_expiry(
            Some(at("2024-01-01T00:00:00Z")),
            at("2025-01-05T00:00:00Z"),
            30,
        );
        assert_eq!(expiry, at("2025-02-04T00:00:00Z"));
    }

    #[test]
    fn extend_without_prior_expiry_counts_from_now() {
        let expiry = next_expiry(None, at("2025-01-05T12:30:00Z"), 7);
        assert_eq!(expiry, at("2025-01-12T12:30:00Z"));
    }
}
