//! Caller-facing configuration for requesting an identity-backed client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serdes::serde_dur_option;

pub const DEFAULT_CERT_FILE: &str = "tlscert";
pub const DEFAULT_KEY_FILE: &str = "key";
pub const DEFAULT_CA_FILE: &str = "teleport-application-ca.pem";

/// Selects the identity source (a directory the Machine-ID agent writes, or a
/// cluster secret) and optional application routing for the returned client.
///
/// `identityDir` and `identitySecretName` are mutually exclusive; exactly one
/// must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientIdentityConfig {
	/// Absolute path to the identity directory.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity_dir: Option<String>,

	/// Name of the cluster secret holding the identity.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity_secret_name: Option<String>,

	/// Namespace of the identity secret; the registry default applies when
	/// empty.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity_secret_namespace: Option<String>,

	/// Application routing label: when set, every outbound request's `Host`
	/// header is rewritten to this value.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_name: Option<String>,

	#[serde(default = "default_cert_file")]
	pub cert_file: String,
	#[serde(default = "default_key_file")]
	pub key_file: String,
	#[serde(default = "default_ca_file")]
	pub ca_file: String,

	/// Polling-fallback period for the file watcher; ignored for secret-backed
	/// identities.
	#[serde(
		default,
		with = "serde_dur_option",
		skip_serializing_if = "Option::is_none"
	)]
	pub watch_interval: Option<Duration>,
}

fn default_cert_file() -> String {
	DEFAULT_CERT_FILE.to_string()
}

fn default_key_file() -> String {
	DEFAULT_KEY_FILE.to_string()
}

fn default_ca_file() -> String {
	DEFAULT_CA_FILE.to_string()
}

impl Default for ClientIdentityConfig {
	fn default() -> ClientIdentityConfig {
		ClientIdentityConfig {
			identity_dir: None,
			identity_secret_name: None,
			identity_secret_namespace: None,
			app_name: None,
			cert_file: default_cert_file(),
			key_file: default_key_file(),
			ca_file: default_ca_file(),
			watch_interval: None,
		}
	}
}

impl ClientIdentityConfig {
	pub fn for_directory(dir: impl Into<String>) -> ClientIdentityConfig {
		ClientIdentityConfig {
			identity_dir: Some(dir.into()),
			..Default::default()
		}
	}

	pub fn for_secret(name: impl Into<String>) -> ClientIdentityConfig {
		ClientIdentityConfig {
			identity_secret_name: Some(name.into()),
			..Default::default()
		}
	}

	pub fn with_app_name(mut self, app_name: impl Into<String>) -> ClientIdentityConfig {
		self.app_name = Some(app_name.into());
		self
	}
}
