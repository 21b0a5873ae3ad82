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

use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use wgsteward_types::live::{LivePeer, ServiceStatus};
use wgsteward_types::{Client, Profile};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum WgError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("peer command failed: {0}")]
    PeerCommand(String),

    #[error("interface reload failed: {0}")]
    InterfaceReload(String),

    #[error("failed to invoke {command}: {source}")]
    Exec {
        command: &'static str,
        source: std::io::Error,
    },
}

/// A freshly generated WireGuard keypair, base64-encoded.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

/// Control surface of the tunnel daemon.
///
/// The lifecycle manager and reconciler are generic over this trait so the
/// process-exec implementation never leaks into them; tests run against
/// [`MemoryTunnel`].
pub trait Tunnel: Send + Sync {
    fn generate_keypair(&self) -> impl Future<Output = Result<Keypair, WgError>> + Send;
    fn generate_preshared_key(&self) -> impl Future<Output = Result<String, WgError>> + Send;
    fn add_peer(
        &self,
        public_key: &str,
        preshared_key: &str,
        allowed_ips: &[String],
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn remove_peer(&self, public_key: &str) -> impl Future<Output = Result<(), WgError>> + Send;
    /// Live peer table; best-effort, an empty list on any failure.
    fn interface_stats(&self) -> impl Future<Output = Vec<LivePeer>> + Send;
    fn interface_up(&self) -> impl Future<Output = bool> + Send;
    fn service_status(&self) -> impl Future<Output = ServiceStatus> + Send;
    fn reload(&self) -> impl Future<Output = Result<(), WgError>> + Send;
}

// -- Dump parsing -----------------------------------------------------------

fn none_if(value: &str, sentinel: &str) -> Option<String> {
    if value == sentinel {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse `wg show <iface> dump` output into live peer entries.
///
/// The first line describes the interface itself and is skipped; peer rows
/// are tab-separated with `(none)`/`off` sentinels. Malformed rows are
/// dropped rather than failing the whole dump.
pub fn parse_dump(output: &str) -> Vec<LivePeer> {
    let mut peers = Vec::new();
    for line in output.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 8 {
            warn!(line, "skipping malformed dump row");
            continue;
        }
        peers.push(LivePeer {
            public_key: cols[0].to_string(),
            preshared_key: none_if(cols[1], "(none)"),
            endpoint: none_if(cols[2], "(none)"),
            allowed_ips: cols[3].to_string(),
            latest_handshake: cols[4].parse().unwrap_or(0),
            transfer_rx: cols[5].parse().unwrap_or(0),
            transfer_tx: cols[6].parse().unwrap_or(0),
            persistent_keepalive: match cols[7] {
                "off" => None,
                value => value.parse().ok(),
            },
        });
    }
    peers
}

// -- Client configuration rendering -----------------------------------------

/// Render the tunnel configuration document handed to a client.
///
/// Pure: profile overrides resolve against the global defaults in `cfg`, and
/// nothing is touched on the live interface.
pub fn client_config(cfg: &Config, client: &Client, profile: Option<&Profile>) -> String {
    let mut addresses = vec![format!("{}/32", client.ip_address)];
    if cfg.ipv6_enabled {
        if let Some(v6) = client.ipv6_address {
            addresses.push(format!("{v6}/128"));
        }
    }

    let dns = match profile {
        Some(p) if !p.dns.is_empty() => p.dns.join(", "),
        _ => cfg.dns.join(", "),
    };
    let allowed_ips = match profile {
        Some(p) if !p.allowed_ips.is_empty() => p.allowed_ips.join(", "),
        _ => cfg.allowed_ips.join(", "),
    };
    let mtu = profile.and_then(|p| p.mtu).unwrap_or(cfg.mtu);
    let keepalive = profile
        .and_then(|p| p.persistent_keepalive)
        .unwrap_or(cfg.persistent_keepalive);

    let mut doc = String::new();
    writeln!(doc, "[Interface]").unwrap();
    writeln!(doc, "PrivateKey = {}", client.private_key).unwrap();
    writeln!(doc, "Address = {}", addresses.join(", ")).unwrap();
    writeln!(doc, "DNS = {dns}").unwrap();
    writeln!(doc, "MTU = {mtu}").unwrap();
    writeln!(doc).unwrap();
    writeln!(doc, "[Peer]").unwrap();
    writeln!(doc, "PublicKey = {}", cfg.server_public_key).unwrap();
    writeln!(doc, "PresharedKey = {}", client.preshared_key).unwrap();
    writeln!(doc, "Endpoint = {}:{}", cfg.server_public_ip, cfg.listen_port).unwrap();
    writeln!(doc, "AllowedIPs = {allowed_ips}").unwrap();
    writeln!(doc, "PersistentKeepalive = {keepalive}").unwrap();
    doc
}

// -- Subprocess plumbing ----------------------------------------------------

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

async fn run(mut cmd: Command, name: &'static str) -> Result<std::process::Output, WgError> {
    cmd.stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| WgError::Exec { command: name, source })
}

async fn run_with_stdin(
    mut cmd: Command,
    input: &str,
    name: &'static str,
) -> Result<std::process::Output, WgError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|source| WgError::Exec { command: name, source })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|source| WgError::Exec { command: name, source })?;
    }
    child
        .wait_with_output()
        .await
        .map_err(|source| WgError::Exec { command: name, source })
}

// -- Process-exec implementation --------------------------------------------

/// Drives the real daemon through the `wg` / `wg-quick` / `systemctl`
/// command surface. The process needs CAP_NET_ADMIN on the interface.
pub struct WgCli {
    interface: String,
    config_path: PathBuf,
    service_unit: String,
}

impl WgCli {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            config_path: PathBuf::from(format!("/etc/wireguard/{interface}.conf")),
            service_unit: format!("wg-quick@{interface}"),
        }
    }

    /// Write the live interface configuration back to its config file so it
    /// survives a restart. Failure is logged and tolerated: the daemon's
    /// in-memory state is already correct.
    async fn persist_config(&self) {
        let mut cmd = Command::new("wg");
        cmd.args(["showconf", &self.interface]);
        match run(cmd, "wg showconf").await {
            Ok(out) if out.status.success() => {
                if let Err(e) = tokio::fs::write(&self.config_path, &out.stdout).await {
                    warn!(
                        path = %self.config_path.display(),
                        error = %e,
                        "failed to persist interface config"
                    );
                }
            }
            Ok(out) => {
                warn!(stderr = %stderr_of(&out), "wg showconf failed, interface config not persisted");
            }
            Err(e) => warn!(error = %e, "wg showconf failed, interface config not persisted"),
        }
    }
}

impl Tunnel for WgCli {
    async fn generate_keypair(&self) -> Result<Keypair, WgError> {
        let mut genkey = Command::new("wg");
        genkey.arg("genkey");
        let out = run(genkey, "wg genkey").await?;
        if !out.status.success() {
            return Err(WgError::KeyGeneration(stderr_of(&out)));
        }
        let private_key = stdout_of(&out);

        let mut pubkey = Command::new("wg");
        pubkey.arg("pubkey");
        let out = run_with_stdin(pubkey, &private_key, "wg pubkey").await?;
        if !out.status.success() {
            return Err(WgError::KeyGeneration(stderr_of(&out)));
        }

        Ok(Keypair {
            private_key,
            public_key: stdout_of(&out),
        })
    }

    async fn generate_preshared_key(&self) -> Result<String, WgError> {
        let mut genpsk = Command::new("wg");
        genpsk.arg("genpsk");
        let out = run(genpsk, "wg genpsk").await?;
        if !out.status.success() {
            return Err(WgError::KeyGeneration(stderr_of(&out)));
        }
        Ok(stdout_of(&out))
    }

    async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: &str,
        allowed_ips: &[String],
    ) -> Result<(), WgError> {
        let mut cmd = Command::new("wg");
        cmd.args([
            "set",
            &self.interface,
            "peer",
            public_key,
            "preshared-key",
            "/dev/stdin",
            "allowed-ips",
            &allowed_ips.join(","),
        ]);
        let out = run_with_stdin(cmd, &format!("{preshared_key}\n"), "wg set").await?;
        if !out.status.success() {
            return Err(WgError::PeerCommand(stderr_of(&out)));
        }
        debug!(interface = %self.interface, "peer added");
        self.persist_config().await;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
        let mut cmd = Command::new("wg");
        cmd.args(["set", &self.interface, "peer", public_key, "remove"]);
        let out = run(cmd, "wg set").await?;
        if !out.status.success() {
            let diagnostic = stderr_of(&out);
            // removing an absent peer is not a failure
            if diagnostic.contains("No such peer") {
                debug!(interface = %self.interface, "peer already absent");
                return Ok(());
            }
            return Err(WgError::PeerCommand(diagnostic));
        }
        debug!(interface = %self.interface, "peer removed");
        self.persist_config().await;
        Ok(())
    }

    async fn interface_stats(&self) -> Vec<LivePeer> {
        let mut cmd = Command::new("wg");
        cmd.args(["show", &self.interface, "dump"]);
        match run(cmd, "wg show dump").await {
            Ok(out) if out.status.success() => {
                parse_dump(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(stderr = %stderr_of(&out), "stats dump failed");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "stats dump failed");
                Vec::new()
            }
        }
    }

    async fn interface_up(&self) -> bool {
        let mut cmd = Command::new("wg");
        cmd.args(["show", &self.interface]);
        matches!(run(cmd, "wg show").await, Ok(out) if out.status.success())
    }

    async fn service_status(&self) -> ServiceStatus {
        let mut active_cmd = Command::new("systemctl");
        active_cmd.args(["is-active", &self.service_unit]);
        let active = matches!(
            run(active_cmd, "systemctl is-active").await,
            Ok(out) if out.status.success() && stdout_of(&out) == "active"
        );

        let mut since_cmd = Command::new("systemctl");
        since_cmd.args([
            "show",
            &self.service_unit,
            "--property=ActiveEnterTimestamp",
            "--value",
        ]);
        let since = match run(since_cmd, "systemctl show").await {
            Ok(out) if out.status.success() => {
                let value = stdout_of(&out);
                if value.is_empty() { None } else { Some(value) }
            }
            _ => None,
        };

        ServiceStatus { active, since }
    }

    async fn reload(&self) -> Result<(), WgError> {
        let mut down = Command::new("wg-quick");
        down.args(["down", &self.interface]);
        match run(down, "wg-quick down").await {
            Ok(out) if !out.status.success() => {
                // tolerated: the interface may already be down
                debug!(stderr = %stderr_of(&out), "wg-quick down failed");
            }
            Err(e) => debug!(error = %e, "wg-quick down failed"),
            _ => {}
        }

        let mut up = Command::new("wg-quick");
        up.args(["up", &self.interface]);
        let out = run(up, "wg-quick up").await?;
        if !out.status.success() {
            return Err(WgError::InterfaceReload(stderr_of(&out)));
        }
        Ok(())
    }
}

// -- In-memory implementation -----------------------------------------------

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// A registered peer as seen by [`MemoryTunnel`].
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    pub preshared_key: String,
    pub allowed_ips: Vec<String>,
}

/// In-memory tunnel for tests and dry runs. Generates real x25519 key
/// material and tracks the peer table, but never touches an interface.
#[derive(Default)]
pub struct MemoryTunnel {
    peers: Mutex<HashMap<String, MemoryPeer>>,
    stats: Mutex<Vec<LivePeer>>,
    reject_adds: AtomicBool,
    reject_removes: AtomicBool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `add_peer` calls fail, as a downed interface would.
    pub fn reject_adds(&self, reject: bool) {
        self.reject_adds.store(reject, Ordering::SeqCst);
    }

    /// Make subsequent `remove_peer` calls fail, leaving the peer in place.
    pub fn reject_removes(&self, reject: bool) {
        self.reject_removes.store(reject, Ordering::SeqCst);
    }

    /// Seed the live peer table returned by `interface_stats`.
    pub fn set_stats(&self, peers: Vec<LivePeer>) {
        *self.stats.lock().unwrap() = peers;
    }

    pub fn peer(&self, public_key: &str) -> Option<MemoryPeer> {
        self.peers.lock().unwrap().get(public_key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

impl Tunnel for MemoryTunnel {
    async fn generate_keypair(&self) -> Result<Keypair, WgError> {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&secret);
        Ok(Keypair {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        })
    }

    async fn generate_preshared_key(&self) -> Result<String, WgError> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Ok(BASE64.encode(bytes))
    }

    async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: &str,
        allowed_ips: &[String],
    ) -> Result<(), WgError> {
        if self.reject_adds.load(Ordering::SeqCst) {
            return Err(WgError::PeerCommand("interface is down".to_string()));
        }
        self.peers.lock().unwrap().insert(
            public_key.to_string(),
            MemoryPeer {
                preshared_key: preshared_key.to_string(),
                allowed_ips: allowed_ips.to_vec(),
            },
        );
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
        if self.reject_removes.load(Ordering::SeqCst) {
            return Err(WgError::PeerCommand("interface is down".to_string()));
        }
        self.peers.lock().unwrap().remove(public_key);
        Ok(())
    }

    async fn interface_stats(&self) -> Vec<LivePeer> {
        self.stats.lock().unwrap().clone()
    }

    async fn interface_up(&self) -> bool {
        !self.reject_adds.load(Ordering::SeqCst)
    }

    async fn service_status(&self) -> ServiceStatus {
        ServiceStatus {
            active: !self.reject_adds.load(Ordering::SeqCst),
            since: None,
        }
    }

    async fn reload(&self) -> Result<(), WgError> {
        Ok(())
    }
}

// -- Tests -------------------------------------------------------------------
