//! Shared unit-test helpers: a throwaway CA minting short-lived identities.

use std::path::Path;
use std::time::SystemTime;

use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};

use crate::config::{DEFAULT_CA_FILE, DEFAULT_CERT_FILE, DEFAULT_KEY_FILE};

pub struct TestCa {
	ca_key: KeyPair,
	ca_cert: Certificate,
}

pub struct TestIdentity {
	pub cert_pem: String,
	pub key_pem: String,
	ca_pem: String,
	pub not_after: time::OffsetDateTime,
}

impl TestCa {
	pub fn new() -> TestCa {
		let ca_key = KeyPair::generate().expect("generate CA key");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "teleport-identity test CA");
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		let ca_cert = params.self_signed(&ca_key).expect("self-sign CA");
		TestCa { ca_key, ca_cert }
	}

	/// Issue a leaf valid from one hour ago until `validity` from now, with a
	/// `localhost` SAN so the same identity works for in-process TLS servers.
	pub fn issue(&self, name: &str, validity: time::Duration) -> TestIdentity {
		let key = KeyPair::generate().expect("generate leaf key");
		let mut params =
			CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, name);
		params.distinguished_name = dn;
		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::hours(1);
		params.not_after = now + validity;
		let cert = params
			.signed_by(&key, &self.ca_cert, &self.ca_key)
			.expect("sign leaf");
		TestIdentity {
			cert_pem: cert.pem(),
			key_pem: key.serialize_pem(),
			ca_pem: self.ca_cert.pem(),
			not_after: now + validity,
		}
	}
}

impl TestIdentity {
	pub fn ca_pem(&self) -> &[u8] {
		self.ca_pem.as_bytes()
	}

	pub fn not_after_system_time(&self) -> SystemTime {
		SystemTime::from(self.not_after)
	}

	/// Write the triple under the default file names.
	pub fn write_to(&self, dir: &Path) {
		std::fs::write(dir.join(DEFAULT_CERT_FILE), &self.cert_pem).expect("write cert");
		std::fs::write(dir.join(DEFAULT_KEY_FILE), &self.key_pem).expect("write key");
		std::fs::write(dir.join(DEFAULT_CA_FILE), &self.ca_pem).expect("write ca");
	}
}
