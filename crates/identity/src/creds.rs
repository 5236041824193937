//! Credential loading: PEM triple -> validated mTLS client configuration.
//!
//! All-or-nothing: either the certificate chain, private key, and CA bundle all
//! parse and agree with each other, or nothing is produced. Nothing here
//! retries; callers decide what a failure means.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::client::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::{InconsistentKeys, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::warn;
use x509_parser::certificate::X509Certificate;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("empty {0} input")]
	EmptyInput(&'static str),
	#[error("private key does not match the client certificate")]
	KeyPairMismatch,
	#[error("CA bundle contains no usable certificates")]
	CaBundleInvalid,
	#[error("read {path}: {err}")]
	Io {
		path: PathBuf,
		#[source]
		err: Arc<std::io::Error>,
	},
	#[error("certificate: {0}")]
	CertificateParse(String),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
}

/// Minimum protocol version is TLS 1.2; the access proxy negotiates 1.3 where
/// it can.
static SUPPORTED_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS13, &rustls::version::TLS12];

pub(crate) fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// One parsed identity: the TLS client configuration built from it plus the
/// leaf certificate's validity window.
#[derive(Debug, Clone)]
pub struct CredentialSet {
	tls: Arc<ClientConfig>,
	pub not_before: SystemTime,
	pub not_after: SystemTime,
}

impl CredentialSet {
	/// Load and validate the identity from three files on disk.
	pub fn from_files(
		cert_path: &Path,
		key_path: &Path,
		ca_path: &Path,
	) -> Result<CredentialSet, Error> {
		let cert = read_file(cert_path)?;
		let key = read_file(key_path)?;
		let ca = read_file(ca_path)?;
		Self::from_pem(&cert, &key, &ca)
	}

	/// Parse and validate the identity from in-memory PEM blobs. Key material
	/// stays in process memory; nothing is staged on disk.
	pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<CredentialSet, Error> {
		if cert_pem.is_empty() {
			return Err(Error::EmptyInput("certificate"));
		}
		if key_pem.is_empty() {
			return Err(Error::EmptyInput("private key"));
		}
		if ca_pem.is_empty() {
			return Err(Error::EmptyInput("CA bundle"));
		}

		let chain = parse_cert_chain(cert_pem)?;
		let key = parse_key(key_pem)?;
		let provider = provider();
		verify_key_pair(&provider, &chain, &key)?;

		// The leaf is first in the chain; its validity window drives rotation
		// status reporting.
		let (not_before, not_after) = leaf_validity(&chain[0])?;

		let mut roots = RootCertStore::empty();
		let ca_certs = parse_cert_multi(ca_pem)?;
		let (added, invalid) = roots.add_parsable_certificates(ca_certs);
		if invalid > 0 {
			warn!("found {invalid} invalid CA certificates in bundle");
		}
		if added == 0 {
			return Err(Error::CaBundleInvalid);
		}

		let tls = ClientConfig::builder_with_provider(provider)
			.with_protocol_versions(SUPPORTED_TLS_VERSIONS)
			.expect("client config must be valid")
			.with_root_certificates(roots)
			.with_client_auth_cert(chain, key)?;

		Ok(CredentialSet {
			tls: Arc::new(tls),
			not_before,
			not_after,
		})
	}

	/// The shared TLS configuration. Internal: callers outside the crate go
	/// through the provider, which hands out defensive clones.
	pub(crate) fn tls_shared(&self) -> Arc<ClientConfig> {
		self.tls.clone()
	}

	/// A defensive clone of the TLS configuration, safe to hand to callers.
	pub fn tls_clone(&self) -> Arc<ClientConfig> {
		Arc::new(self.tls.as_ref().clone())
	}
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
	std::fs::read(path).map_err(|err| Error::Io {
		path: path.to_path_buf(),
		err: Arc::new(err),
	})
}

fn parse_cert_chain(mut pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut pem));
	let chain = rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| Error::CertificateParse(e.to_string()))?;
	if chain.is_empty() {
		return Err(Error::CertificateParse(
			"no client certificate found".to_string(),
		));
	}
	Ok(chain)
}

fn parse_cert_multi(mut pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut pem));
	// Unparsable bundles yield zero certificates; the caller decides whether
	// that is fatal.
	Ok(rustls_pemfile::certs(&mut reader).flatten().collect())
}

fn parse_key(mut pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut pem));
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| Error::CertificateParse(e.to_string()))?
		.ok_or_else(|| Error::CertificateParse("no private key found".to_string()))
}

/// Reject a key that does not belong to the leaf certificate. Rotation races
/// can briefly leave a fresh certificate next to a stale key; pairing them
/// would produce a client the proxy rejects on every handshake.
fn verify_key_pair(
	provider: &Arc<CryptoProvider>,
	chain: &[CertificateDer<'static>],
	key: &PrivateKeyDer<'static>,
) -> Result<(), Error> {
	let signer = provider.key_provider.load_private_key(key.clone_key())?;
	let certified = rustls::sign::CertifiedKey::new(chain.to_vec(), signer);
	match certified.keys_match() {
		Ok(()) => Ok(()),
		// Unknown means the key type cannot expose its public half; the
		// handshake will surface a genuine mismatch.
		Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(()),
		Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
			Err(Error::KeyPairMismatch)
		},
		Err(e) => Err(Error::Rustls(e)),
	}
}

fn leaf_validity(der: &CertificateDer<'static>) -> Result<(SystemTime, SystemTime), Error> {
	let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
		.map_err(|e| Error::CertificateParse(e.to_string()))?;
	Ok(validity(&cert))
}

fn validity(cert: &X509Certificate) -> (SystemTime, SystemTime) {
	let to_time = |ts: i64| UNIX_EPOCH + Duration::from_secs(ts.try_into().unwrap_or_default());
	(
		to_time(cert.validity.not_before.timestamp()),
		to_time(cert.validity.not_after.timestamp()),
	)
}
