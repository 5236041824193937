// Shared test fixtures: a throwaway CA and an in-process mTLS echo server
// standing in for the access proxy. The server requires a client certificate
// signed by the CA and answers every request with the Host header it saw.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::HOST;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
	SanType,
};
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use tokio::net::TcpListener;

pub struct TestCa {
	ca_key: KeyPair,
	ca_cert: Certificate,
}

pub struct TestIdentity {
	pub cert_pem: String,
	pub key_pem: String,
	pub ca_pem: String,
	pub not_after: time::OffsetDateTime,
}

impl TestCa {
	pub fn new() -> TestCa {
		let ca_key = KeyPair::generate().expect("generate CA key");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "integration test CA");
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		let ca_cert = params.self_signed(&ca_key).expect("self-sign CA");
		TestCa { ca_key, ca_cert }
	}

	pub fn issue(&self, name: &str, validity: time::Duration) -> TestIdentity {
		let key = KeyPair::generate().expect("generate leaf key");
		let mut params =
			CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
		params
			.subject_alt_names
			.push(SanType::IpAddress(Ipv4Addr::LOCALHOST.into()));
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
	pub fn not_after_system_time(&self) -> SystemTime {
		SystemTime::from(self.not_after)
	}

	/// Write the triple under the default identity file names.
	pub fn write_to(&self, dir: &Path) {
		std::fs::write(dir.join("tlscert"), &self.cert_pem).expect("write cert");
		std::fs::write(dir.join("key"), &self.key_pem).expect("write key");
		std::fs::write(dir.join("teleport-application-ca.pem"), &self.ca_pem).expect("write ca");
	}

	/// The same triple shaped as a cluster secret's data map.
	pub fn secret_data(&self) -> HashMap<String, Bytes> {
		HashMap::from([
			("tlscert".to_string(), Bytes::from(self.cert_pem.clone())),
			("key".to_string(), Bytes::from(self.key_pem.clone())),
			(
				"teleport-application-ca.pem".to_string(),
				Bytes::from(self.ca_pem.clone()),
			),
		])
	}
}

/// Start an mTLS HTTP/1.1 server that echoes the request's Host header and
/// return its address. Connections without a client certificate signed by
/// `ca` fail the handshake.
pub async fn spawn_echo_server(ca: &TestCa) -> SocketAddr {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let server_id = ca.issue("echo-server", time::Duration::hours(1));
	let certs = rustls_pemfile::certs(&mut server_id.cert_pem.as_bytes())
		.collect::<Result<Vec<_>, _>>()
		.expect("parse server cert");
	let key = rustls_pemfile::private_key(&mut server_id.key_pem.as_bytes())
		.expect("parse server key")
		.expect("server key present");

	let mut roots = RootCertStore::empty();
	let ca_ders = rustls_pemfile::certs(&mut server_id.ca_pem.as_bytes())
		.collect::<Result<Vec<_>, _>>()
		.expect("parse CA");
	for der in ca_ders {
		roots.add(der).expect("add CA root");
	}
	let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
		.build()
		.expect("build client verifier");
	let config = rustls::ServerConfig::builder()
		.with_client_cert_verifier(verifier)
		.with_single_cert(certs, key)
		.expect("build server config");
	let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

	let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
		.await
		.expect("bind echo server");
	let addr = listener.local_addr().expect("local addr");

	tokio::spawn(async move {
		loop {
			let Ok((tcp, _)) = listener.accept().await else {
				break;
			};
			let acceptor = acceptor.clone();
			tokio::spawn(async move {
				let Ok(tls) = acceptor.accept(tcp).await else {
					return;
				};
				let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
					let host = req
						.headers()
						.get(HOST)
						.and_then(|h| h.to_str().ok())
						.unwrap_or_default()
						.to_string();
					Ok::<_, std::convert::Infallible>(Response::new(Full::<Bytes>::from(host)))
				});
				let _ = http1::Builder::new()
					.serve_connection(TokioIo::new(tls), service)
					.await;
			});
		}
	});
	addr
}
