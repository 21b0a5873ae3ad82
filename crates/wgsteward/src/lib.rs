//! Core library for the wgsteward VPN administration console.
//!
//! Orchestrates client lifecycle (keys, addresses, expiry) against a live
//! WireGuard interface and a file-backed record store. Web handlers and the
//! scheduler binary are thin callers into [`lifecycle::ClientManager`] and
//! [`reconcile`].

pub mod alloc;
pub mod config;
pub mod lifecycle;
pub mod reconcile;
pub mod store;
pub mod wg;
