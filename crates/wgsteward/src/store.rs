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

//! File-backed record store.
//!
//! One JSON document per record, addressed by id (clients, profiles) or by
//! calendar date (usage snapshots, audit days), plus the settings singleton:
//!
//! ```text
//! <data_dir>/clients/<uuid>.json      <data_dir>/usage/<YYYY-MM-DD>.json
//! <data_dir>/profiles/<uuid>.json     <data_dir>/audit/<YYYY-MM-DD>.json
//! <data_dir>/settings.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use uuid::Uuid;

use wgsteward_types::{AuditDay, AuditEntry, Client, Profile, Settings, UsageSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

type Result<T> = std::result::Result<T, StoreError>;

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp sibling and rename, so a concurrent reader never
/// observes a half-written record.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = read_json(&path).await? {
            records.push(record);
        }
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    settings_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            settings_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create the record directories if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        for dir in ["clients", "profiles", "usage", "audit"] {
            tokio::fs::create_dir_all(self.data_dir.join(dir)).await?;
        }
        Ok(())
    }

    fn client_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("clients").join(format!("{id}.json"))
    }

    fn profile_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("profiles").join(format!("{id}.json"))
    }

    fn usage_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join("usage").join(format!("{date}.json"))
    }

    fn audit_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join("audit").join(format!("{date}.json"))
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    // -- Clients -------------------------------------------------------------

    pub async fn client(&self, id: Uuid) -> Result<Option<Client>> {
        read_json(&self.client_path(id)).await
    }

    /// All clients, newest first.
    pub async fn clients(&self) -> Result<Vec<Client>> {
        let mut clients: Vec<Client> = read_all(&self.data_dir.join("clients")).await?;
        clients.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clients)
    }

    #[tracing::instrument(skip(self, client), fields(id = %client.id))]
    pub async fn save_client(&self, client: &Client) -> Result<()> {
        write_json(&self.client_path(client.id), client).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_client(&self, id: Uuid) -> Result<()> {
        remove_if_exists(&self.client_path(id)).await
    }

    // -- Profiles ------------------------------------------------------------

    pub async fn profile(&self, id: Uuid) -> Result<Option<Profile>> {
        read_json(&self.profile_path(id)).await
    }

    /// All profiles, by name.
    pub async fn profiles(&self) -> Result<Vec<Profile>> {
        let mut profiles: Vec<Profile> = read_all(&self.data_dir.join("profiles")).await?;
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    #[tracing::instrument(skip(self, profile), fields(id = %profile.id))]
    pub async fn save_profile(&self, profile: &Profile) -> Result<()> {
        write_json(&self.profile_path(profile.id), profile).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_profile(&self, id: Uuid) -> Result<()> {
        remove_if_exists(&self.profile_path(id)).await
    }

    // -- Usage snapshots -----------------------------------------------------

    pub async fn usage_snapshot(&self, date: NaiveDate) -> Result<Option<UsageSnapshot>> {
        read_json(&self.usage_path(date)).await
    }

    /// Overwrites any existing snapshot for the same date.
    #[tracing::instrument(skip(self, snapshot), fields(date = %snapshot.date))]
    pub async fn save_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<()> {
        write_json(&self.usage_path(snapshot.date), snapshot).await
    }

    /// Snapshots within `[start, end]`, oldest first.
    pub async fn usage_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<UsageSnapshot>> {
        let mut snapshots: Vec<UsageSnapshot> = read_all(&self.data_dir.join("usage")).await?;
        snapshots.retain(|s| s.date >= start && s.date <= end);
        snapshots.sort_by_key(|s| s.date);
        Ok(snapshots)
    }

    // -- Audit trail ---------------------------------------------------------

    /// Append an entry to today's audit document.
    #[tracing::instrument(skip(self, details))]
    pub async fn log_audit(
        &self,
        action: &str,
        user: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let date = Local::now().date_naive();
        let path = self.audit_path(date);
        let mut day: AuditDay = read_json(&path).await?.unwrap_or(AuditDay {
            date,
            entries: Vec::new(),
        });
        day.entries.push(AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            user: user.to_string(),
            details,
        });
        write_json(&path, &day).await
    }

    /// Audit documents within `[start, end]`, newest first.
    pub async fn audit_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<AuditDay>> {
        let mut days: Vec<AuditDay> = read_all(&self.data_dir.join("audit")).await?;
        days.retain(|d| d.date >= start && d.date <= end);
        days.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(days)
    }

    // -- Settings ------------------------------------------------------------

    /// The settings singleton; a missing document yields the defaults.
    pub async fn settings(&self) -> Result<Settings> {
        Ok(read_json(&self.settings_path()).await?.unwrap_or_default())
    }

    #[tracing::instrument(skip_all)]
    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        write_json(&self.settings_path(), settings).await
    }

    /// Read-modify-write the settings singleton under the store's lock.
    pub async fn update_settings<F>(&self, update: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.settings_lock.lock().await;
        let mut settings = self.settings().await?;
        update(&mut settings);
        self.save_settings(&settings).await?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        (dir, store)
    }

    fn sample_client(name: &str, created_at: DateTime<Utc>) -> Client {
        Client {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip_address: "10.0.0.2".parse().unwrap(),
            ipv6_address: None,
            public_key: format!("{name}-pub"),
            private_key: format!("{name}-priv"),
            preshared_key: format!("{name}-psk"),
            profile_id: Uuid::new_v4(),
            created_at,
            expiry_date: None,
            enabled: true,
            notes: String::new(),
        }
    }

    fn sample_profile(name: &str) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            dns: vec!["1.1.1.1".to_string()],
            mtu: None,
            persistent_keepalive: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn client_round_trip() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        let client = sample_client("alice", Utc::now());
        store.save_client(&client).await.unwrap();

        let loaded = store.client(client.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.public_key, client.public_key);

        store.delete_client(client.id).await.unwrap();
        assert!(store.client(client.id).await.unwrap().is_none());
        // deleting again is a no-op
        store.delete_client(client.id).await.unwrap();
    }

    #[tokio::test]
    async fn clients_listed_newest_first() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        let now = Utc::now();
        let old = sample_client("old", now - Duration::hours(2));
        let mid = sample_client("mid", now - Duration::hours(1));
        let new = sample_client("new", now);
        for c in [&mid, &old, &new] {
            store.save_client(c).await.unwrap();
        }

        let names: Vec<String> = store
            .clients()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn profiles_listed_by_name() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        for name in ["zeta", "alpha", "mid"] {
            store.save_profile(&sample_profile(name)).await.unwrap();
        }

        let names: Vec<String> = store
            .profiles()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn settings_default_then_persist() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        let settings = store.settings().await.unwrap();
        assert_eq!(settings, Settings::default());

        let updated = store
            .update_settings(|s| {
                s.last_client_ip = 7;
                s.initialized = true;
            })
            .await
            .unwrap();
        assert_eq!(updated.last_client_ip, 7);

        let reloaded = store.settings().await.unwrap();
        assert_eq!(reloaded.last_client_ip, 7);
        assert!(reloaded.initialized);
    }

    #[tokio::test]
    async fn usage_snapshot_overwrites_per_date() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let mut snapshot = UsageSnapshot {
            date,
            timestamp: Utc::now(),
            total_rx: 10,
            total_tx: 20,
            clients: Vec::new(),
        };
        store.save_usage_snapshot(&snapshot).await.unwrap();

        snapshot.total_rx = 99;
        store.save_usage_snapshot(&snapshot).await.unwrap();

        let loaded = store.usage_snapshot(date).await.unwrap().unwrap();
        assert_eq!(loaded.total_rx, 99);
    }

    #[tokio::test]
    async fn usage_range_filters_and_sorts() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        for day in [1, 5, 9] {
            let snapshot = UsageSnapshot {
                date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
                timestamp: Utc::now(),
                total_rx: u64::from(day),
                total_tx: 0,
                clients: Vec::new(),
            };
            store.save_usage_snapshot(&snapshot).await.unwrap();
        }

        let range = store
            .usage_range(
                NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
            )
            .await
            .unwrap();
        let days: Vec<u32> = range.iter().map(|s| s.total_rx as u32).collect();
        assert_eq!(days, vec![5, 9]);
    }

    #[tokio::test]
    async fn audit_appends_to_daily_document() {
        let (_dir, store) = temp_store();
        store.init().await.unwrap();

        store
            .log_audit("CLIENT_ADDED", "admin", serde_json::json!({"name": "alice"}))
            .await
            .unwrap();
        store
            .log_audit("CLIENT_DELETED", "admin", serde_json::json!({"name": "alice"}))
            .await
            .unwrap();

        let today = Local::now().date_naive();
        let days = store.audit_range(today, today).await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].entries.len(), 2);
        assert_eq!(days[0].entries[0].action, "CLIENT_ADDED");
        assert_eq!(days[0].entries[1].user, "admin");
    }
}
