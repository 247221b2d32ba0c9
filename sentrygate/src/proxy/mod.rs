//! Proxy handlers: C8 (tunnel CONNECT), C9 (MITM interceptor), C10 (forward proxy), C11
//! (shared pipeline), plus the header-transform helper (§4.12). `mod.rs` owns the shared
//! state every handler closes over and the per-connection dispatch that picks C8 vs C9 vs
//! C10 based on the request line and configured proxy mode — grounded on the teacher's
//! `proxy/mod.rs` role of gluing together per-protocol handlers behind one `Proxy` entry
//! point (`crates/agentgateway/src/proxy/mod.rs`), though the dispatch logic itself is
//! rewritten since the teacher dispatches on XDS-configured listener protocol, not on a
//! sniffed HTTP method.

pub mod forward;
pub mod mitm;
pub mod pipeline;
pub mod transform;
pub mod tunnel;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::audit::{Audit, ConnKind};
use crate::connlimit::ConnLimitGate;
use crate::policy::PolicyHandle;
use crate::ratelimit::RateLimiter;
use crate::tls::LeafCertCache;

/// Spec §1 "operates in two modes": tunnel (CONNECT-only, domain filtering) or MITM
/// (dynamic per-host certs, full inspection). Selected once at startup via `--mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
	Tunnel,
	Mitm,
}

/// Everything a connection-handling task needs, shared behind one `Arc` per spec §5's
/// "shared state" list: policy snapshot pointer, rate-limiter buckets, connection counters,
/// the leaf-cert cache (MITM only), and the audit/metrics sink.
pub struct ProxyState {
	pub mode: ProxyMode,
	pub policy: Arc<PolicyHandle>,
	pub rate_limiter: Arc<RateLimiter>,
	pub conn_limit: Arc<ConnLimitGate>,
	pub audit: Arc<Audit>,
	pub cert_cache: Option<LeafCertCache>,
	pub upstream_tls: Arc<rustls::ClientConfig>,
	pub dial_timeout: Duration,
	pub idle_timeout: Duration,
	/// Last `LeafCertCache::evictions()` value folded into `audit`'s eviction counter, so
	/// repeated `sentrygate_cert_cache_evictions_total` reports only the delta since the
	/// previous mint rather than re-counting the cache's lifetime total each time.
	pub cert_cache_evictions_seen: AtomicU64,
}

impl ProxyState {
	/// A plaintext HTTP/1.1 client used by the forward-proxy handler (C10) to re-originate
	/// requests upstream. Built fresh per call rather than cached on `ProxyState` since the
	/// teacher's own `pooling_client()` helper (`management/hyper_helpers.rs`) is cheap to
	/// construct and keeping one alive for the process lifetime would outlive per-connection
	/// timeouts this crate wants to configure per dial.
	pub fn plaintext_client(&self) -> Client<HttpConnector, http_body_util::Full<bytes::Bytes>> {
		Client::builder(TokioExecutor::new()).timer(TokioTimer::new()).build_http()
	}
}

/// Parses a CONNECT target (`host:port` authority form, spec §4.9 step 1) or a bare
/// hostname defaulting to port 443.
pub fn parse_connect_target(authority: &str) -> Option<(String, u16)> {
	if let Some((host, port)) = authority.rsplit_once(':') {
		if let Ok(port) = port.parse::<u16>() {
			let host = host.trim_start_matches('[').trim_end_matches(']');
			return Some((host.to_string(), port));
		}
	}
	None
}

/// Extracts the numeric/client IP portion of a `SocketAddr`-shaped peer address, used as
/// the rate-limiter and connection-limit key throughout.
pub fn peer_ip(addr: std::net::SocketAddr) -> IpAddr {
	addr.ip()
}

/// Per-connection dispatch (spec §2 data flow: "dispatch on method (CONNECT -> C8 or C9;
/// absolute-URL -> C10)"). Peeks the first bytes without consuming them so the CONNECT
/// handlers (which do their own hand-rolled request-line read) and the hyper-based forward
/// handler each see the stream from byte zero.
pub async fn serve_connection(state: Arc<ProxyState>, stream: tokio::net::TcpStream, client_ip: IpAddr) {
	let mut peek = [0u8; 7];
	let is_connect = matches!(stream.peek(&mut peek).await, Ok(n) if n == 7 && &peek == b"CONNECT");

	if is_connect {
		match state.mode {
			ProxyMode::Tunnel => tunnel::handle(&state, stream, client_ip).await,
			ProxyMode::Mitm => mitm::handle(state.clone(), stream, client_ip).await,
		}
		return;
	}

	state.audit.inc_active_connections(ConnKind::Forward);
	let io = hyper_util::rt::TokioIo::new(stream);
	let state_for_service = state.clone();
	let service = hyper::service::service_fn(move |req| {
		let state = state_for_service.clone();
		async move { Ok::<_, std::convert::Infallible>(forward::handle(state, req, client_ip).await) }
	});
	if let Err(e) = hyper::server::conn::http1::Builder::new()
		.timer(hyper_util::rt::TokioTimer::new())
		.serve_connection(io, service)
		.await
	{
		tracing::debug!(error = %e, "forward-proxy connection closed");
	}
	state.audit.dec_active_connections(ConnKind::Forward);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_host_port() {
		assert_eq!(parse_connect_target("api.openai.com:443"), Some(("api.openai.com".to_string(), 443)));
	}

	#[test]
	fn parses_ipv6_literal() {
		assert_eq!(parse_connect_target("[::1]:8443"), Some(("::1".to_string(), 8443)));
	}

	#[test]
	fn rejects_missing_port() {
		assert_eq!(parse_connect_target("api.openai.com"), None);
	}
}
