//! One identity, one provider: cached mTLS clients, reload-on-rotation, and
//! status for whoever is operating the host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustls::ClientConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::HttpClient;
use crate::creds::CredentialSet;
use crate::watch::{ChangeCallback, FileWatcher};
use crate::{client, creds, watch};

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;

/// Sentinel shown in [`CertStatus`] paths for identities that never touch disk.
pub const MEMORY_SENTINEL: &str = "<memory>";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("credentials not loaded")]
	NotLoaded,
	#[error("credentials: {0}")]
	Creds(#[from] creds::Error),
	#[error("reload failed: {0}")]
	Reload(#[source] creds::Error),
	#[error(transparent)]
	Watch(#[from] watch::Error),
}

/// Where a provider's credentials come from. Filesystem identities are watched
/// for rotation; in-memory identities are refreshed by the caller reissuing
/// the configuration.
#[derive(Debug, Clone)]
pub enum IdentitySource {
	Directory {
		dir: PathBuf,
		cert_file: String,
		key_file: String,
		ca_file: String,
	},
	Memory {
		cert: Bytes,
		key: Bytes,
		ca: Bytes,
	},
}

/// Point-in-time view of a provider's credentials, for status surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertStatus {
	pub loaded: bool,
	pub cert_path: String,
	pub key_path: String,
	pub ca_path: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_loaded: Option<SystemTime>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<SystemTime>,
}

type ReloadCallback = Arc<dyn Fn(Result<Arc<ClientConfig>, Error>) + Send + Sync>;

/// Owns one credential set and the HTTP client built on it.
///
/// Cheap to clone; clones share state. All operations are safe for concurrent
/// use: readers take shared access, reloads and cache invalidation take
/// exclusive access, and the cached client is populated under double-checked
/// locking.
#[derive(Clone)]
pub struct ClientProvider {
	inner: Arc<Inner>,
}

struct Inner {
	source: IdentitySource,
	watch_interval: Duration,
	debounce: Duration,
	state: RwLock<State>,
	subscribers: RwLock<Vec<ReloadCallback>>,
	watcher: Mutex<Option<FileWatcher>>,
}

#[derive(Default)]
struct State {
	creds: Option<CredentialSet>,
	client: Option<HttpClient>,
	last_loaded: Option<SystemTime>,
	last_error: Option<Error>,
}

impl ClientProvider {
	/// A provider over `source`. Construction succeeds even if the identity is
	/// not on disk yet; the first client request performs a lazy load.
	pub fn new(source: IdentitySource, watch_interval: Duration, debounce: Duration) -> ClientProvider {
		ClientProvider {
			inner: Arc::new(Inner {
				source,
				watch_interval,
				debounce,
				state: RwLock::new(State::default()),
				subscribers: RwLock::new(Vec::new()),
				watcher: Mutex::new(None),
			}),
		}
	}

	/// A provider over in-memory PEM blobs, validated eagerly so the caller
	/// learns about bad secret material immediately.
	pub fn from_memory(cert: Bytes, key: Bytes, ca: Bytes) -> Result<ClientProvider, Error> {
		let provider = ClientProvider::new(
			IdentitySource::Memory { cert, key, ca },
			watch::DEFAULT_WATCH_INTERVAL,
			watch::DEFAULT_DEBOUNCE,
		);
		provider.ensure_loaded()?;
		Ok(provider)
	}

	/// The cached HTTP client, building one (and lazily loading credentials)
	/// if absent.
	pub fn http_client(&self) -> Result<HttpClient, Error> {
		{
			let state = self.inner.state.read();
			if let Some(client) = &state.client {
				return Ok(client.clone());
			}
		}
		let mut state = self.inner.state.write();
		// Another caller may have built the client while we upgraded.
		if let Some(client) = &state.client {
			return Ok(client.clone());
		}
		if state.creds.is_none() {
			self.inner.load_locked(&mut state)?;
		}
		let Some(creds) = &state.creds else {
			return Err(Error::NotLoaded);
		};
		let client = HttpClient::new(creds.tls_shared());
		state.client = Some(client.clone());
		Ok(client)
	}

	/// The pooled transport below the cached client.
	pub fn http_transport(&self) -> Result<client::Transport, Error> {
		Ok(self.http_client()?.transport())
	}

	/// A defensive clone of the current TLS configuration. The provider's own
	/// copy is never handed out; swapping fields on the returned value cannot
	/// break the reload invariant.
	pub fn tls_config(&self) -> Result<Arc<ClientConfig>, Error> {
		let state = self.inner.state.read();
		state
			.creds
			.as_ref()
			.map(CredentialSet::tls_clone)
			.ok_or(Error::NotLoaded)
	}

	pub fn status(&self) -> CertStatus {
		let (cert_path, key_path, ca_path) = self.inner.source_paths();
		let state = self.inner.state.read();
		CertStatus {
			loaded: state.creds.is_some(),
			cert_path,
			key_path,
			ca_path,
			last_loaded: state.last_loaded,
			last_error: state.last_error.as_ref().map(|e| e.to_string()),
			expires_at: state.creds.as_ref().map(|c| c.not_after),
		}
	}

	pub fn is_loaded(&self) -> bool {
		self.inner.state.read().creds.is_some()
	}

	/// Whether the leaf certificate expires within `threshold`. An unloaded or
	/// already-expired identity counts as expiring.
	pub fn is_expiring_soon(&self, threshold: Duration) -> bool {
		let state = self.inner.state.read();
		match &state.creds {
			Some(creds) => match creds.not_after.duration_since(SystemTime::now()) {
				Ok(remaining) => remaining < threshold,
				Err(_) => true,
			},
			None => true,
		}
	}

	/// Load credentials now if none are loaded. Unlike [`reload`], this does
	/// not notify subscribers; it is the lazy first load.
	///
	/// [`reload`]: ClientProvider::reload
	pub fn ensure_loaded(&self) -> Result<(), Error> {
		let mut state = self.inner.state.write();
		if state.creds.is_some() {
			return Ok(());
		}
		self.inner.load_locked(&mut state)
	}

	/// Force a reload from the original source. On success the cached client
	/// is invalidated and the next client request builds against the new TLS
	/// configuration; on failure the previous credentials keep serving.
	/// Subscribers are notified either way, after the outcome is committed.
	pub fn reload(&self) -> Result<(), Error> {
		self.inner.reload()
	}

	/// Subscribe to post-reload notifications. The callback receives the new
	/// TLS configuration, or the reload error. Subscribers are invoked in
	/// registration order, outside the provider's locks.
	pub fn on_reload(
		&self,
		callback: impl Fn(Result<Arc<ClientConfig>, Error>) + Send + Sync + 'static,
	) {
		self.inner.subscribers.write().push(Arc::new(callback));
	}

	/// Begin watching the identity directory, reloading on change. No-op for
	/// in-memory identities. Idempotent.
	pub fn start_watching(&self) -> Result<(), Error> {
		let IdentitySource::Directory {
			dir,
			cert_file,
			key_file,
			ca_file,
		} = &self.inner.source
		else {
			return Ok(());
		};
		let mut watcher = self.inner.watcher.lock();
		if watcher.is_none() {
			let weak = Arc::downgrade(&self.inner);
			let callback: ChangeCallback = Arc::new(move || {
				if let Some(inner) = weak.upgrade() {
					// Failures are recorded in status and delivered to
					// subscribers; the watcher keeps running.
					let _ = inner.reload();
				}
			});
			*watcher = Some(FileWatcher::new(
				dir.clone(),
				vec![cert_file.into(), key_file.into(), ca_file.into()],
				self.inner.watch_interval,
				self.inner.debounce,
				callback,
			));
		}
		if let Some(watcher) = watcher.as_ref() {
			watcher.start()?;
		}
		Ok(())
	}

	/// Stop watching. No-op if not watching. Idempotent.
	pub fn stop_watching(&self) {
		if let Some(watcher) = self.inner.watcher.lock().as_ref() {
			watcher.stop();
		}
	}

	pub fn is_watching(&self) -> bool {
		self.inner
			.watcher
			.lock()
			.as_ref()
			.map(FileWatcher::is_running)
			.unwrap_or(false)
	}

	/// Release the provider's resources. Safe to call repeatedly.
	pub fn close(&self) -> Result<(), Error> {
		self.stop_watching();
		Ok(())
	}
}

impl std::fmt::Debug for ClientProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientProvider")
			.field("source", &self.inner.source_label())
			.field("loaded", &self.is_loaded())
			.finish_non_exhaustive()
	}
}

impl Inner {
	/// Load credentials under an already-held write lock, recording the
	/// outcome in status either way.
	fn load_locked(&self, state: &mut State) -> Result<(), Error> {
		match load_source(&self.source) {
			Ok(creds) => {
				state.creds = Some(creds);
				state.last_loaded = Some(SystemTime::now());
				state.last_error = None;
				info!(source = %self.source_label(), "loaded identity credentials");
				Ok(())
			},
			Err(e) => {
				let e = Error::from(e);
				state.last_error = Some(e.clone());
				Err(e)
			},
		}
	}

	fn reload(&self) -> Result<(), Error> {
		let outcome: Result<Arc<ClientConfig>, Error> = {
			let mut state = self.state.write();
			match load_source(&self.source) {
				Ok(creds) => {
					let tls = creds.tls_clone();
					state.creds = Some(creds);
					// Invalidate the cached client; the next request
					// materializes one against the new configuration.
					state.client = None;
					state.last_loaded = Some(SystemTime::now());
					state.last_error = None;
					Ok(tls)
				},
				Err(e) => {
					let e = Error::Reload(e);
					state.last_error = Some(e.clone());
					// The previous credentials and cached client keep serving.
					Err(e)
				},
			}
		};
		match &outcome {
			Ok(_) => info!(source = %self.source_label(), "reloaded identity credentials"),
			Err(e) => warn!(
				source = %self.source_label(),
				"identity reload failed, previous credentials remain in use: {e}"
			),
		}

		// Snapshot outside the state lock; subscribers run user code.
		let subscribers = self.subscribers.read().clone();
		for subscriber in subscribers {
			subscriber(outcome.clone());
		}
		outcome.map(|_| ())
	}

	fn source_paths(&self) -> (String, String, String) {
		match &self.source {
			IdentitySource::Directory {
				dir,
				cert_file,
				key_file,
				ca_file,
			} => (
				dir.join(cert_file).display().to_string(),
				dir.join(key_file).display().to_string(),
				dir.join(ca_file).display().to_string(),
			),
			IdentitySource::Memory { .. } => (
				MEMORY_SENTINEL.to_string(),
				MEMORY_SENTINEL.to_string(),
				MEMORY_SENTINEL.to_string(),
			),
		}
	}

	fn source_label(&self) -> String {
		match &self.source {
			IdentitySource::Directory { dir, .. } => dir.display().to_string(),
			IdentitySource::Memory { .. } => MEMORY_SENTINEL.to_string(),
		}
	}
}

fn load_source(source: &IdentitySource) -> Result<CredentialSet, creds::Error> {
	match source {
		IdentitySource::Directory {
			dir,
			cert_file,
			key_file,
			ca_file,
		} => CredentialSet::from_files(
			&dir.join(cert_file),
			&dir.join(key_file),
			&dir.join(ca_file),
		),
		IdentitySource::Memory { cert, key, ca } => CredentialSet::from_pem(cert, key, ca),
	}
}
