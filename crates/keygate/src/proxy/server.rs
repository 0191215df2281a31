//! Proxy listener: accept loop, per-connection serving, graceful drain.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::httpproxy::HTTPProxy;
use crate::signal::ShutdownWatcher;

pub struct ProxyServer {
	proxy: HTTPProxy,
	listener: TcpListener,
	/// Bound on how long in-flight requests may run after shutdown.
	drain_deadline: Duration,
}

impl ProxyServer {
	pub async fn bind(
		addr: SocketAddr,
		proxy: HTTPProxy,
		drain_deadline: Duration,
	) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		info!(address = %listener.local_addr()?, "proxy listening");
		Ok(Self {
			proxy,
			listener,
			drain_deadline,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Accept until shutdown, then stop taking connections and drain the
	/// in-flight ones within the deadline.
	pub async fn run(self, mut shutdown: ShutdownWatcher) -> anyhow::Result<()> {
		let graceful = GracefulShutdown::new();
		loop {
			tokio::select! {
				_ = shutdown.wait() => break,
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(a) => a,
						Err(e) => {
							warn!(error = %e, "accept failed");
							continue;
						},
					};
					let proxy = self.proxy.clone();
					let service = service_fn(move |req| {
						let proxy = proxy.clone();
						async move { Ok::<_, Infallible>(proxy.handle(req, peer.ip()).await) }
					});
					let io = TokioIo::new(stream);
					let conn = auto::Builder::new(TokioExecutor::new())
						.serve_connection_with_upgrades(io, service)
						.into_owned();
					let conn = graceful.watch(conn);
					tokio::spawn(async move {
						if let Err(e) = conn.await {
							debug!(peer = %peer, error = %e, "connection closed with error");
						}
					});
				},
			}
		}
		drop(self.listener);
		info!("proxy draining in-flight requests");
		if tokio::time::timeout(self.drain_deadline, graceful.shutdown())
			.await
			.is_err()
		{
			warn!("drain deadline exceeded; aborting remaining connections");
		}
		Ok(())
	}
}
