//! Machine-identity mTLS client core for services behind a Teleport access proxy.
//!
//! An external Machine-ID agent keeps a short-lived X.509 identity fresh on disk
//! (or inside a cluster secret). This crate turns that identity into pooled,
//! mutually-authenticated HTTP clients and keeps them current across rotations
//! without dropping traffic:
//!
//! - [`creds`] parses the PEM triple (certificate chain, key, CA bundle) into a
//!   validated TLS configuration and surfaces the leaf validity window.
//! - [`watch`] detects identity file changes, with a polling fallback and a
//!   debounce so a multi-file rotation triggers a single reload.
//! - [`provider`] owns one identity: cached client, reload protocol, status,
//!   and reload subscriptions.
//! - [`registry`] canonicalizes caller configuration into shared providers and
//!   tears everything down on shutdown.

pub mod client;
pub mod config;
pub mod creds;
pub mod provider;
pub mod registry;
pub mod secrets;
mod serdes;
#[cfg(test)]
pub(crate) mod testutil;
pub mod watch;

pub use client::{Body, HttpClient, Transport};
pub use config::ClientIdentityConfig;
pub use provider::{CertStatus, ClientProvider};
pub use registry::{Registry, RegistryConfig};
pub use secrets::{MemorySecretStore, SecretStore};
