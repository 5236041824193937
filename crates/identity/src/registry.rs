//! Process-wide cache of identity providers, keyed by canonicalized caller
//! configuration.
//!
//! Input validation happens here, before any provider exists: traversal in
//! identity paths, malformed secret names, and routing labels that could smuggle
//! bytes into the outbound `Host` header are all rejected synchronously.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::{HttpClient, Transport};
use crate::config::ClientIdentityConfig;
use crate::provider::{CertStatus, ClientProvider, IdentitySource};
use crate::secrets::SecretStore;
use crate::serdes::serde_dur;
use crate::{provider, watch};

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid config: {0}")]
	InvalidConfig(String),
	#[error("invalid identity directory: {0}")]
	InvalidIdentityDir(String),
	#[error("namespace {0:?} is not allowed")]
	NamespaceNotAllowed(String),
	#[error("secret {namespace}/{name} unavailable: {source}")]
	SecretUnavailable {
		namespace: String,
		name: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("secret is missing required key {0:?}")]
	SecretMissingField(String),
	#[error("no provider registered for {0:?}")]
	ProviderNotFound(String),
	#[error(transparent)]
	Provider(#[from] provider::Error),
	#[error("shutdown failed for {}", shutdown_summary(.0))]
	Shutdown(Vec<(String, provider::Error)>),
}

fn shutdown_summary(errors: &[(String, provider::Error)]) -> String {
	errors
		.iter()
		.map(|(key, err)| format!("{key}: {err}"))
		.collect::<Vec<_>>()
		.join("; ")
}

/// RFC 1123 subdomain, the grammar cluster secrets are named by.
static SECRET_NAME_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]*$").expect("regex must be valid"));
/// Application routing labels end up verbatim in the `Host` header; anything
/// outside this grammar is treated as an injection attempt.
static APP_NAME_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").expect("regex must be valid"));

const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryConfig {
	/// Namespace substituted when a secret reference omits one. Subject to the
	/// allow-list like any caller-supplied namespace.
	#[serde(default = "default_namespace")]
	pub default_namespace: String,

	/// When set, secret references outside these namespaces are rejected.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub allowed_namespaces: Option<Vec<String>>,

	/// Polling-fallback period for file watchers; callers may override
	/// per-identity.
	#[serde(default = "default_watch_interval", with = "serde_dur")]
	pub watch_interval: Duration,

	/// Quiescence period between a detected file change and the reload. Must
	/// exceed the agent's rotation write window; zero is rejected.
	#[serde(default = "default_debounce", with = "serde_dur")]
	pub debounce: Duration,
}

fn default_namespace() -> String {
	"default".to_string()
}

fn default_watch_interval() -> Duration {
	watch::DEFAULT_WATCH_INTERVAL
}

fn default_debounce() -> Duration {
	watch::DEFAULT_DEBOUNCE
}

impl Default for RegistryConfig {
	fn default() -> RegistryConfig {
		RegistryConfig {
			default_namespace: default_namespace(),
			allowed_namespaces: None,
			watch_interval: default_watch_interval(),
			debounce: default_debounce(),
		}
	}
}

/// Keyed cache of [`ClientProvider`]s for the lifetime of the host
/// application. Two callers whose configurations canonicalize to the same key
/// share one provider. All operations are safe for concurrent use.
pub struct Registry {
	config: RegistryConfig,
	secrets: Option<Arc<dyn SecretStore>>,
	dir_providers: RwLock<HashMap<PathBuf, ClientProvider>>,
	secret_providers: RwLock<HashMap<String, ClientProvider>>,
}

impl Registry {
	/// A registry without cluster access; secret-backed identities will fail
	/// with `SecretUnavailable`.
	pub fn new(config: RegistryConfig) -> Result<Registry, Error> {
		Self::build(config, None)
	}

	pub fn with_secret_store(
		config: RegistryConfig,
		secrets: Arc<dyn SecretStore>,
	) -> Result<Registry, Error> {
		Self::build(config, Some(secrets))
	}

	fn build(
		config: RegistryConfig,
		secrets: Option<Arc<dyn SecretStore>>,
	) -> Result<Registry, Error> {
		if config.debounce.is_zero() {
			return Err(Error::InvalidConfig(
				"debounce must be greater than zero".to_string(),
			));
		}
		if config.watch_interval.is_zero() {
			return Err(Error::InvalidConfig(
				"watchInterval must be greater than zero".to_string(),
			));
		}
		if config.default_namespace.is_empty() {
			return Err(Error::InvalidConfig(
				"defaultNamespace must not be empty".to_string(),
			));
		}
		Ok(Registry {
			config,
			secrets,
			dir_providers: RwLock::new(HashMap::new()),
			secret_providers: RwLock::new(HashMap::new()),
		})
	}

	/// The general form: a client for whatever identity `config` references,
	/// optionally wrapped for application routing.
	pub async fn http_client_for_config(
		&self,
		config: &ClientIdentityConfig,
	) -> Result<HttpClient, Error> {
		// Routing labels are validated before any provider is constructed or
		// cached; a rejected label must leave no trace.
		let app_name = match config.app_name.as_deref().filter(|s| !s.is_empty()) {
			Some(app) => {
				validate_app_name(app)?;
				Some(app.to_string())
			},
			None => None,
		};

		let provider = self.provider_for_config(config).await?;
		let client = provider.http_client()?;
		match app_name {
			Some(app) => {
				let host = HeaderValue::from_str(&app)
					.map_err(|_| Error::InvalidConfig(format!("invalid appName {app:?}")))?;
				Ok(client.with_host_override(host))
			},
			None => Ok(client),
		}
	}

	pub async fn http_client_for_identity(&self, dir: &str) -> Result<HttpClient, Error> {
		self.http_client_for_config(&ClientIdentityConfig::for_directory(dir))
			.await
	}

	pub async fn http_transport_for_identity(&self, dir: &str) -> Result<Transport, Error> {
		let provider = self
			.provider_for_config(&ClientIdentityConfig::for_directory(dir))
			.await?;
		Ok(provider.http_transport()?)
	}

	/// The shared provider behind a registry key, for hosts that want reload
	/// subscriptions or expiry checks.
	pub fn provider(&self, key: &str) -> Result<ClientProvider, Error> {
		self.find_provider(key)
	}

	pub fn provider_status(&self, key: &str) -> Result<CertStatus, Error> {
		Ok(self.find_provider(key)?.status())
	}

	/// Registry keys of every cached provider, sorted.
	pub fn list_providers(&self) -> Vec<String> {
		let mut keys: Vec<String> = self
			.dir_providers
			.read()
			.keys()
			.map(|dir| dir.display().to_string())
			.chain(self.secret_providers.read().keys().cloned())
			.collect();
		keys.sort();
		keys
	}

	pub fn reload_provider(&self, key: &str) -> Result<(), Error> {
		Ok(self.find_provider(key)?.reload()?)
	}

	/// Close and forget the provider behind `key`. Removing an unknown key is
	/// not an error.
	pub fn remove_provider(&self, key: &str) -> Result<(), Error> {
		let removed = if key.starts_with('/') {
			let canonical = canonical_dir(key)?;
			self.dir_providers.write().remove(&canonical)
		} else {
			self.secret_providers.write().remove(key)
		};
		if let Some(provider) = removed {
			info!(%key, "removed identity provider");
			provider.close()?;
		}
		Ok(())
	}

	/// Close every provider and empty both maps. Never short-circuits: all
	/// providers are closed regardless of individual failures, whose errors
	/// are joined into the result.
	pub fn close(&self) -> Result<(), Error> {
		let mut errors = Vec::new();
		let dirs = std::mem::take(&mut *self.dir_providers.write());
		for (key, provider) in dirs {
			if let Err(e) = provider.close() {
				errors.push((key.display().to_string(), e));
			}
		}
		let secrets = std::mem::take(&mut *self.secret_providers.write());
		for (key, provider) in secrets {
			if let Err(e) = provider.close() {
				errors.push((key, e));
			}
		}
		if errors.is_empty() {
			Ok(())
		} else {
			Err(Error::Shutdown(errors))
		}
	}

	async fn provider_for_config(
		&self,
		config: &ClientIdentityConfig,
	) -> Result<ClientProvider, Error> {
		validate_file_name(&config.cert_file, "certFile")?;
		validate_file_name(&config.key_file, "keyFile")?;
		validate_file_name(&config.ca_file, "caFile")?;

		match (&config.identity_dir, &config.identity_secret_name) {
			(Some(_), Some(_)) => Err(Error::InvalidConfig(
				"identityDir and identitySecretName are mutually exclusive".to_string(),
			)),
			(None, None) => Err(Error::InvalidConfig(
				"one of identityDir or identitySecretName is required".to_string(),
			)),
			(Some(dir), None) => self.provider_for_dir(dir, config),
			(None, Some(name)) => self.provider_for_secret(name, config).await,
		}
	}

	fn provider_for_dir(
		&self,
		dir: &str,
		config: &ClientIdentityConfig,
	) -> Result<ClientProvider, Error> {
		let key = canonical_dir(dir)?;
		{
			let providers = self.dir_providers.read();
			if let Some(existing) = providers.get(&key) {
				return Ok(existing.clone());
			}
		}
		let mut providers = self.dir_providers.write();
		// Another writer may have raced ahead while we upgraded.
		if let Some(existing) = providers.get(&key) {
			return Ok(existing.clone());
		}
		let source = IdentitySource::Directory {
			dir: key.clone(),
			cert_file: config.cert_file.clone(),
			key_file: config.key_file.clone(),
			ca_file: config.ca_file.clone(),
		};
		let provider = ClientProvider::new(
			source,
			config.watch_interval.unwrap_or(self.config.watch_interval),
			self.config.debounce,
		);
		// Filesystem identities always watch for the agent's rewrites.
		provider.start_watching()?;
		providers.insert(key.clone(), provider.clone());
		info!(dir = %key.display(), "created identity provider");
		Ok(provider)
	}

	async fn provider_for_secret(
		&self,
		name: &str,
		config: &ClientIdentityConfig,
	) -> Result<ClientProvider, Error> {
		validate_secret_name(name)?;
		let namespace = self.resolve_namespace(config.identity_secret_namespace.as_deref())?;
		let key = format!("{namespace}/{name}");
		{
			let providers = self.secret_providers.read();
			if let Some(existing) = providers.get(&key) {
				return Ok(existing.clone());
			}
		}

		// Fetch outside any lock: the store call suspends and honors the
		// caller's cancellation.
		let Some(store) = &self.secrets else {
			return Err(Error::SecretUnavailable {
				namespace,
				name: name.to_string(),
				source: anyhow::anyhow!("no secret store configured"),
			});
		};
		let data = store
			.get(&namespace, name)
			.await
			.map_err(|source| Error::SecretUnavailable {
				namespace: namespace.clone(),
				name: name.to_string(),
				source,
			})?;
		let field = |file: &str| -> Result<Bytes, Error> {
			data.get(file)
				.cloned()
				.ok_or_else(|| Error::SecretMissingField(file.to_string()))
		};
		let cert = field(&config.cert_file)?;
		let key_pem = field(&config.key_file)?;
		let ca = field(&config.ca_file)?;

		let mut providers = self.secret_providers.write();
		if let Some(existing) = providers.get(&key) {
			// A racer fetched and inserted first; use theirs.
			return Ok(existing.clone());
		}
		let provider = ClientProvider::from_memory(cert, key_pem, ca)?;
		providers.insert(key.clone(), provider.clone());
		info!(%key, "created identity provider from cluster secret");
		Ok(provider)
	}

	fn resolve_namespace(&self, requested: Option<&str>) -> Result<String, Error> {
		// An omitted namespace takes the configured default, which is then
		// validated like any other: a default outside the allow-list must not
		// slip through.
		let namespace = match requested.filter(|ns| !ns.is_empty()) {
			Some(ns) => ns,
			None => self.config.default_namespace.as_str(),
		};
		if let Some(allowed) = &self.config.allowed_namespaces
			&& !allowed.iter().any(|ns| ns == namespace)
		{
			return Err(Error::NamespaceNotAllowed(namespace.to_string()));
		}
		Ok(namespace.to_string())
	}

	fn find_provider(&self, key: &str) -> Result<ClientProvider, Error> {
		let found = if key.starts_with('/') {
			canonical_dir(key)
				.ok()
				.and_then(|canonical| self.dir_providers.read().get(&canonical).cloned())
		} else {
			self.secret_providers.read().get(key).cloned()
		};
		found.ok_or_else(|| Error::ProviderNotFound(key.to_string()))
	}
}

impl std::fmt::Debug for Registry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registry")
			.field("config", &self.config)
			.field("providers", &self.list_providers())
			.finish_non_exhaustive()
	}
}

/// Canonicalize an identity directory reference: non-empty, absolute, free of
/// traversal segments, lexically cleaned. Nothing here touches the filesystem.
fn canonical_dir(dir: &str) -> Result<PathBuf, Error> {
	if dir.is_empty() {
		return Err(Error::InvalidIdentityDir("path is empty".to_string()));
	}
	let path = Path::new(dir);
	if !path.is_absolute() {
		return Err(Error::InvalidIdentityDir(format!(
			"{dir:?} is not absolute"
		)));
	}
	let mut clean = PathBuf::new();
	for component in path.components() {
		match component {
			Component::ParentDir => {
				return Err(Error::InvalidIdentityDir(format!(
					"{dir:?} contains a traversal segment"
				)));
			},
			Component::CurDir => {},
			other => clean.push(other),
		}
	}
	Ok(clean)
}

fn validate_secret_name(name: &str) -> Result<(), Error> {
	if name.len() > MAX_NAME_LEN || !SECRET_NAME_RE.is_match(name) {
		return Err(Error::InvalidConfig(format!(
			"invalid identitySecretName {name:?}"
		)));
	}
	Ok(())
}

fn validate_app_name(app: &str) -> Result<(), Error> {
	if app.len() > MAX_NAME_LEN || !APP_NAME_RE.is_match(app) {
		return Err(Error::InvalidConfig(format!("invalid appName {app:?}")));
	}
	Ok(())
}

/// The three identity file names must be bare names; a separator would let a
/// caller escape the identity directory.
fn validate_file_name(name: &str, field: &str) -> Result<(), Error> {
	let bare = !name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.contains('\\');
	if !bare {
		return Err(Error::InvalidConfig(format!("invalid {field} {name:?}")));
	}
	Ok(())
}
