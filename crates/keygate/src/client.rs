//! Pooled HTTPS client shared by the proxy upstream leg and sink plugins.

use std::time::Duration;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::http::{Body, Request, Response};

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub connect_timeout: Duration,
	pub pool_idle_timeout: Duration,
	pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(10),
			pool_idle_timeout: Duration::from_secs(90),
			max_idle_per_host: 32,
		}
	}
}

/// The process-wide upstream connection pool.
#[derive(Clone)]
pub struct Client {
	inner: legacy::Client<HttpsConnector<HttpConnector>, Body>,
}

impl Client {
	pub fn new(cfg: &ClientConfig) -> anyhow::Result<Self> {
		let mut http = HttpConnector::new();
		http.set_connect_timeout(Some(cfg.connect_timeout));
		http.enforce_http(false);
		let https = HttpsConnectorBuilder::new()
			.with_native_roots()?
			.https_or_http()
			.enable_http1()
			.wrap_connector(http);
		let inner = legacy::Client::builder(TokioExecutor::new())
			.pool_idle_timeout(cfg.pool_idle_timeout)
			.pool_max_idle_per_host(cfg.max_idle_per_host)
			.build(https);
		Ok(Self { inner })
	}

	pub async fn request(&self, req: Request) -> Result<Response, legacy::Error> {
		let resp = self.inner.request(req).await?;
		Ok(resp.map(Body::new))
	}
}
