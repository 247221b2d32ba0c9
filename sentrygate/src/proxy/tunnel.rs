//! C8 — tunnel CONNECT handler (spec §4.9). CONNECT is handled with a small hand-rolled
//! request-line/header reader rather than `hyper::server::conn::http1`: the spec requires
//! the literal status line `HTTP/1.1 200 Connection Established\r\n\r\n`, and `http`'s
//! `Response` type has no way to override a status code's canonical reason phrase, so the
//! teacher's usual hyper-based request handling (used in `forward.rs`, where the standard
//! reason phrases for 403/429/502 already match the spec text) doesn't fit here. This
//! mirrors how real forward proxies (and the teacher's `tcpproxy.rs`, at the dial+splice
//! level) treat CONNECT as a raw-bytes protocol rather than a framed HTTP exchange.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::ProxyState;
use crate::audit::{ConnKind, Direction};
use crate::error::PipelineError;
use crate::policy::RequestInfo;

/// A parsed CONNECT request line plus the (discarded) header block.
pub struct ConnectRequest {
	pub host: String,
	pub port: u16,
}

/// Reads `CONNECT host:port HTTP/1.x\r\n`, then drains headers up to the blank line.
/// Returns `None` on any malformed input (spec §7 `ProtocolError`: 400, close).
pub async fn read_connect_request<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Option<ConnectRequest> {
	let mut line = String::new();
	reader.read_line(&mut line).await.ok()?;
	let mut parts = line.trim_end().split(' ');
	if parts.next()? != "CONNECT" {
		return None;
	}
	let authority = parts.next()?;
	let (host, port) = super::parse_connect_target(authority)?;

	loop {
		let mut header_line = String::new();
		let n = reader.read_line(&mut header_line).await.ok()?;
		if n == 0 || header_line.trim_end() == "" {
			break;
		}
	}
	Some(ConnectRequest { host, port })
}

pub async fn write_status_line<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, status_line: &str) -> std::io::Result<()> {
	writer.write_all(status_line.as_bytes()).await?;
	writer.write_all(b"\r\n\r\n").await?;
	writer.flush().await
}

/// Spec §4.9 steps 3-4 (and reused by C9 steps 1-4): domain-only admission plus the
/// CONNECT-level rate-limit consume. C6's gate check happens once per accepted connection
/// in the accept loop, not here.
pub async fn admit(state: &ProxyState, host: &str, port: u16, client_ip: IpAddr) -> Result<Option<String>, PipelineError> {
	let req = RequestInfo { host: host.to_string(), port, path: None, method: None, source_ip: Some(client_ip), is_grpc: false };
	let outcome = super::pipeline::evaluate(&state.policy, &state.rate_limiter, &state.audit, &req)?;
	Ok(outcome.decision.matched_rule_id)
}

pub async fn dial_upstream(state: &ProxyState, host: &str, port: u16) -> Result<TcpStream, PipelineError> {
	tokio::time::timeout(state.dial_timeout, TcpStream::connect((host, port)))
		.await
		.map_err(|_| PipelineError::Timeout)?
		.map_err(PipelineError::UpstreamConnect)
}

/// Spec §4.9 step 7: two independent byte pumps, idle timeout resetting on data in either
/// direction. `tokio::io::copy_bidirectional` has no activity hook to reset a timer against
/// — wrapping it in one flat `timeout` would sever a long-lived, continuously-busy tunnel at
/// the deadline regardless of traffic — so the pump is hand-rolled: each loop iteration races
/// a read from either side against a fresh `idle_timeout` sleep, and only a successful read
/// re-arms it.
pub async fn splice<A, B>(state: &ProxyState, client: A, upstream: B)
where
	A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let (mut client_r, mut client_w) = tokio::io::split(client);
	let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

	let mut client_open = true;
	let mut upstream_open = true;
	let mut to_upstream = 0u64;
	let mut to_client = 0u64;
	let mut client_buf = [0u8; 8192];
	let mut upstream_buf = [0u8; 8192];

	while client_open || upstream_open {
		let idle = tokio::time::sleep(state.idle_timeout);
		tokio::select! {
			biased;
			res = client_r.read(&mut client_buf), if client_open => match res {
				Ok(0) => {
					client_open = false;
					let _ = upstream_w.shutdown().await;
				},
				Ok(n) => {
					if upstream_w.write_all(&client_buf[..n]).await.is_err() {
						break;
					}
					to_upstream += n as u64;
				},
				Err(e) => {
					tracing::debug!(error = %e, "tunnel read from client failed");
					break;
				},
			},
			res = upstream_r.read(&mut upstream_buf), if upstream_open => match res {
				Ok(0) => {
					upstream_open = false;
					let _ = client_w.shutdown().await;
				},
				Ok(n) => {
					if client_w.write_all(&upstream_buf[..n]).await.is_err() {
						break;
					}
					to_client += n as u64;
				},
				Err(e) => {
					tracing::debug!(error = %e, "tunnel read from upstream failed");
					break;
				},
			},
			_ = idle => {
				tracing::debug!("tunnel idle timeout elapsed, closing");
				break;
			},
		}
	}

	state.audit.record_bytes(Direction::Upstream, to_upstream);
	state.audit.record_bytes(Direction::Downstream, to_client);
}

/// Full C8 handler for one accepted, already connection-limited TCP stream known to start
/// with a CONNECT line, in tunnel (non-MITM) proxy mode.
pub async fn handle(state: &ProxyState, stream: TcpStream, client_ip: IpAddr) {
	state.audit.inc_active_connections(ConnKind::Tunnel);
	let result = handle_inner(state, stream, client_ip).await;
	if let Err(e) = result {
		state.audit.record_error(e.kind());
	}
	state.audit.dec_active_connections(ConnKind::Tunnel);
}

async fn handle_inner(state: &ProxyState, stream: TcpStream, client_ip: IpAddr) -> Result<(), PipelineError> {
	let mut reader = BufReader::new(stream);
	let Some(req) = read_connect_request(&mut reader).await else {
		let mut stream = reader.into_inner();
		let _ = write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
		return Err(PipelineError::ProtocolError("malformed CONNECT request".to_string()));
	};

	match admit(state, &req.host, req.port, client_ip).await {
		Ok(_rule_id) => {},
		Err(PipelineError::RateLimited { retry_after, .. }) => {
			let mut stream = reader.into_inner();
			let line = format!("HTTP/1.1 429 Too Many Requests\r\nRetry-After: {}", retry_after.as_secs().max(1));
			let _ = write_status_line(&mut stream, &line).await;
			return Err(PipelineError::RateLimited { rule_id: None, retry_after });
		},
		Err(e) => {
			let mut stream = reader.into_inner();
			let _ = write_status_line(&mut stream, "HTTP/1.1 403 Forbidden").await;
			return Err(e);
		},
	}

	let upstream = match dial_upstream(state, &req.host, req.port).await {
		Ok(up) => up,
		Err(e) => {
			let mut stream = reader.into_inner();
			let _ = write_status_line(&mut stream, "HTTP/1.1 502 Bad Gateway").await;
			return Err(e);
		},
	};

	let mut client = reader.into_inner();
	write_status_line(&mut client, "HTTP/1.1 200 Connection Established")
		.await
		.map_err(PipelineError::UpstreamConnect)?;

	splice(state, client, upstream).await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use tokio::io::BufReader;

	use super::*;

	#[tokio::test]
	async fn parses_connect_line() {
		let input = b"CONNECT api.openai.com:443 HTTP/1.1\r\nHost: api.openai.com:443\r\nUser-Agent: test\r\n\r\n".to_vec();
		let mut reader = BufReader::new(Cursor::new(input));
		let req = read_connect_request(&mut reader).await.unwrap();
		assert_eq!(req.host, "api.openai.com");
		assert_eq!(req.port, 443);
	}

	#[tokio::test]
	async fn rejects_non_connect_method() {
		let input = b"GET / HTTP/1.1\r\n\r\n".to_vec();
		let mut reader = BufReader::new(Cursor::new(input));
		assert!(read_connect_request(&mut reader).await.is_none());
	}

	#[tokio::test]
	async fn rejects_missing_port() {
		let input = b"CONNECT api.openai.com HTTP/1.1\r\n\r\n".to_vec();
		let mut reader = BufReader::new(Cursor::new(input));
		assert!(read_connect_request(&mut reader).await.is_none());
	}
}
