//! Outbound mTLS HTTP plumbing: the pooled transport and the thin client
//! wrapper that adds the request timeout and optional application routing.
//!
//! The transport is the TLS boundary; DNS resolution and the connection pool
//! live below it. Everything above is per-request policy.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::ClientConfig;

pub type Body = http_body_util::Full<Bytes>;
pub type Transport = legacy::Client<HttpsConnector<HttpConnector>, Body>;

/// Per-request deadline applied by [`HttpClient`].
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle connections are dropped after this long in the pool.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	#[error("transport: {0}")]
	Transport(#[from] legacy::Error),
	#[error(transparent)]
	Http(#[from] http::Error),
}

/// A mutually-authenticated HTTP client.
///
/// Cheap to clone; clones share the transport (and therefore its connection
/// pool). Two values compare equal when they share the same underlying state,
/// which is how "the cached client" is distinguished from "a client rebuilt
/// after rotation".
#[derive(Clone)]
pub struct HttpClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	transport: Transport,
	timeout: Duration,
	host_override: Option<HeaderValue>,
}

impl HttpClient {
	pub(crate) fn new(tls: Arc<ClientConfig>) -> HttpClient {
		HttpClient {
			inner: Arc::new(ClientInner {
				transport: build_transport(tls),
				timeout: REQUEST_TIMEOUT,
				host_override: None,
			}),
		}
	}

	/// A client sharing this one's transport whose outbound requests carry
	/// `host` as the `Host` header, selecting a virtual application behind the
	/// access proxy. The request timeout is preserved.
	pub fn with_host_override(&self, host: HeaderValue) -> HttpClient {
		HttpClient {
			inner: Arc::new(ClientInner {
				transport: self.inner.transport.clone(),
				timeout: self.inner.timeout,
				host_override: Some(host),
			}),
		}
	}

	/// The pooled transport below this client.
	pub fn transport(&self) -> Transport {
		self.inner.transport.clone()
	}

	pub fn host_override(&self) -> Option<&HeaderValue> {
		self.inner.host_override.as_ref()
	}

	/// Dispatch a request over the mutually-authenticated transport, applying
	/// the routing override and the request timeout.
	pub async fn request(&self, mut req: Request<Body>) -> Result<Response<Incoming>, Error> {
		if let Some(host) = &self.inner.host_override {
			req.headers_mut().insert(HOST, host.clone());
		}
		match tokio::time::timeout(self.inner.timeout, self.inner.transport.request(req)).await {
			Ok(result) => Ok(result?),
			Err(_) => Err(Error::Timeout(self.inner.timeout)),
		}
	}

	pub async fn get(&self, uri: Uri) -> Result<Response<Incoming>, Error> {
		let req = Request::get(uri).body(Body::default())?;
		self.request(req).await
	}
}

impl PartialEq for HttpClient {
	fn eq(&self, other: &HttpClient) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for HttpClient {}

impl std::fmt::Debug for HttpClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpClient")
			.field("timeout", &self.inner.timeout)
			.field("host_override", &self.inner.host_override)
			.finish_non_exhaustive()
	}
}

fn build_transport(tls: Arc<ClientConfig>) -> Transport {
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_tls_config(tls.as_ref().clone())
		.https_only()
		.enable_all_versions()
		.build();
	legacy::Client::builder(TokioExecutor::new())
		.pool_timer(TokioTimer::new())
		.pool_idle_timeout(POOL_IDLE_TIMEOUT)
		.pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
		.build(https)
}
