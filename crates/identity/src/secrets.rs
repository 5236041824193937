//! The cluster-secret seam: how secret-backed identities reach the registry.
//!
//! Implementations fetch secrets from wherever the host keeps them (a
//! Kubernetes API server, a vault). Secret material is returned in memory and
//! is never staged on disk by this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait SecretStore: Send + Sync {
	/// Fetch the named secret, returning its fields as a name -> bytes map.
	/// Cancellation follows the caller's future; the store is never written
	/// back to.
	async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<HashMap<String, Bytes>>;
}

/// `HashMap`-backed store for tests and embedders without cluster access.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
	secrets: parking_lot::RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemorySecretStore {
	pub fn new() -> MemorySecretStore {
		MemorySecretStore::default()
	}

	pub fn insert(&self, namespace: &str, name: &str, data: HashMap<String, Bytes>) {
		self.secrets
			.write()
			.insert(format!("{namespace}/{name}"), data);
	}
}

#[async_trait]
impl SecretStore for MemorySecretStore {
	async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<HashMap<String, Bytes>> {
		self.secrets
			.read()
			.get(&format!("{namespace}/{name}"))
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("secret {namespace}/{name} not found"))
	}
}
