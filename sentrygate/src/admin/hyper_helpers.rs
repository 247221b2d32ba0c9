//! Generic draining HTTP/1.1 server, adapted from the teacher's
//! `management/hyper_helpers.rs::Server<S>`. Binds one `TcpListener`, serves every accepted
//! connection through a caller-supplied handler, and ties connection lifetime to the shared
//! `DrainWatcher` so the admin surface shuts down alongside the rest of the process.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, StatusCode};
use core::drain::DrainWatcher;
use tokio::net::TcpListener;
use tracing::info;

pub type Response = http::Response<Full<Bytes>>;

pub fn empty_response(code: StatusCode) -> Response {
	http::Response::builder()
		.status(code)
		.body(Full::new(Bytes::new()))
		.expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response {
	http::Response::builder()
		.status(code)
		.header(http::header::CONTENT_TYPE, content_type)
		.body(Full::new(body.into()))
		.expect("builder with known status code should not fail")
}

/// A generic HTTP/1.1-plaintext-only admin server with draining support, per spec §A.5.
pub struct Server<S> {
	name: String,
	bind: TcpListener,
	drain_rx: DrainWatcher,
	state: S,
}

impl<S> Server<S> {
	pub async fn bind(name: &str, addr: SocketAddr, drain_rx: DrainWatcher, s: S) -> anyhow::Result<Self> {
		let bind = TcpListener::bind(addr).await?;
		Ok(Server { name: name.to_string(), bind, drain_rx, state: s })
	}

	pub fn address(&self) -> SocketAddr {
		self.bind.local_addr().expect("local address must be ready")
	}

	pub fn spawn<F, R>(self, f: F)
	where
		S: Send + Sync + 'static,
		F: Fn(Arc<S>, Request<hyper::body::Incoming>) -> R + Send + Sync + 'static,
		R: Future<Output = Response> + Send + 'static,
	{
		let address = self.address();
		let drain = self.drain_rx;
		let state = Arc::new(self.state);
		let f = Arc::new(f);
		info!(%address, component = self.name, "admin listener established");
		let bind = self.bind;
		let name = self.name;
		tokio::spawn(async move {
			loop {
				let accept = tokio::select! {
					biased;
					_ = drain.clone().wait_for_drain() => break,
					accept = bind.accept() => accept,
				};
				let Ok((socket, _)) = accept else { continue };
				let _ = socket.set_nodelay(true);
				let state = state.clone();
				let f = f.clone();
				tokio::spawn(async move {
					let service = hyper::service::service_fn(move |req| {
						let state = state.clone();
						let f = f.clone();
						async move { Ok::<_, std::convert::Infallible>(f(state, req).await) }
					});
					if let Err(e) = hyper::server::conn::http1::Builder::new()
						.timer(hyper_util::rt::TokioTimer::new())
						.serve_connection(hyper_util::rt::TokioIo::new(socket), service)
						.await
					{
						tracing::debug!(error = %e, "admin connection closed");
					}
				});
			}
			info!(%address, component = name, "admin listener drained");
		});
	}
}
