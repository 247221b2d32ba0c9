//! C9 — MITM interceptor (spec §4.10). Reuses C8's CONNECT parsing/admission/dial (via
//! `tunnel::{read_connect_request, admit, dial_upstream}`), then diverges after the `200
//! Connection Established` write: terminates client TLS with a minted leaf (C7), and runs
//! the full C11 pipeline per inner HTTP/1.1 request over an upstream TLS connection that
//! persists for the lifetime of the CONNECT tunnel (spec: "the same TLS session may carry
//! multiple ... requests; each gets its own pipeline evaluation"). HTTP/2 is out of scope
//! per spec §9 Open Question 1 — upstream and downstream both negotiate `http/1.1` only.
//! Grounded on `management/hyper_helpers.rs`'s `http1_server()`/`serve_connection` shape for
//! the server side, and on `transport/tls.rs::accept` for the `tokio_rustls` acceptor call.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{ProxyState, pipeline, transform};
use crate::audit::{ConnKind, Direction};
use crate::error::PipelineError;
use crate::proxy::transform::TransformContext;

type UpstreamSender = hyper::client::conn::http1::SendRequest<Full<Bytes>>;

/// Full C9 handler for one accepted, already connection-limited TCP stream known to start
/// with a CONNECT line, in MITM proxy mode.
pub async fn handle(state: Arc<ProxyState>, stream: TcpStream, client_ip: IpAddr) {
	state.audit.inc_active_connections(ConnKind::Mitm);
	if let Err(e) = handle_inner(&state, stream, client_ip).await {
		state.audit.record_error(e.kind());
	}
	state.audit.dec_active_connections(ConnKind::Mitm);
}

async fn handle_inner(state: &Arc<ProxyState>, stream: TcpStream, client_ip: IpAddr) -> Result<(), PipelineError> {
	let mut reader = tokio::io::BufReader::new(stream);
	let Some(req) = super::tunnel::read_connect_request(&mut reader).await else {
		let mut stream = reader.into_inner();
		let _ = super::tunnel::write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
		return Err(PipelineError::ProtocolError("malformed CONNECT request".to_string()));
	};

	if let Err(e) = super::tunnel::admit(state, &req.host, req.port, client_ip).await {
		let mut stream = reader.into_inner();
		let line = match &e {
			PipelineError::RateLimited { retry_after, .. } => {
				format!("HTTP/1.1 429 Too Many Requests\r\nRetry-After: {}", retry_after.as_secs().max(1))
			},
			_ => "HTTP/1.1 403 Forbidden".to_string(),
		};
		let _ = super::tunnel::write_status_line(&mut stream, &line).await;
		return Err(e);
	}

	let Some(cert_cache) = &state.cert_cache else {
		return Err(PipelineError::Config("MITM mode requires a cert cache".to_string()));
	};
	let leaf = cert_cache.get_or_mint(&req.host).await.map_err(|e| PipelineError::CertificateError(e.to_string()))?;
	state.audit.set_cert_cache_size(cert_cache.len() as i64);
	let evictions = cert_cache.evictions();
	let previously_seen = state.cert_cache_evictions_seen.swap(evictions, std::sync::atomic::Ordering::Relaxed);
	for _ in 0..evictions.saturating_sub(previously_seen) {
		state.audit.inc_cert_cache_evictions();
	}

	let upstream_tcp = match super::tunnel::dial_upstream(state, &req.host, req.port).await {
		Ok(up) => up,
		Err(e) => {
			let mut stream = reader.into_inner();
			let _ = super::tunnel::write_status_line(&mut stream, "HTTP/1.1 502 Bad Gateway").await;
			return Err(e);
		},
	};

	let mut client = reader.into_inner();
	super::tunnel::write_status_line(&mut client, "HTTP/1.1 200 Connection Established")
		.await
		.map_err(PipelineError::UpstreamConnect)?;

	let client_tls = crate::tls::accept(client, leaf.server_config.clone()).await.map_err(|e| PipelineError::CertificateError(e.to_string()))?;

	let server_name = ServerName::try_from(req.host.clone()).map_err(|_| PipelineError::ProtocolError(format!("invalid SNI host {}", req.host)))?;
	let upstream_tls = tokio_rustls::TlsConnector::from(state.upstream_tls.clone())
		.connect(server_name, upstream_tcp)
		.await
		.map_err(PipelineError::UpstreamConnect)?;

	let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream_tls))
		.await
		.map_err(|e| PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
	tokio::spawn(async move {
		// `.with_upgrades()` keeps the raw IO reachable via `hyper::upgrade::on` for the
		// WebSocket path (spec §4.10 step 9); a no-op for ordinary keep-alive requests.
		if let Err(e) = conn.with_upgrades().await {
			tracing::debug!(error = %e, "mitm upstream connection closed");
		}
	});
	let sender = Arc::new(Mutex::new(sender));

	let host: Arc<str> = Arc::from(req.host.as_str());
	let port = req.port;
	let state_for_service = state.clone();
	let host_for_service = host.clone();
	let sender_for_service = sender.clone();

	let service = hyper::service::service_fn(move |request: Request<Incoming>| {
		let state = state_for_service.clone();
		let host = host_for_service.clone();
		let sender = sender_for_service.clone();
		async move { Ok::<_, std::convert::Infallible>(handle_request(state, host, port, client_ip, sender, request).await) }
	});

	hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.serve_connection(TokioIo::new(client_tls), service)
		.with_upgrades()
		.await
		.map_err(|e| PipelineError::ProtocolError(e.to_string()))?;

	Ok(())
}

/// Spec §4.10 step 9 "WebSocket upgrades": `Connection: ... upgrade` plus an `Upgrade`
/// header. Grounded on the teacher's `proxy/gateway.rs::get_upgrade_type`.
fn get_upgrade_type(headers: &HeaderMap) -> bool {
	let asks_to_upgrade = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);
	asks_to_upgrade && headers.contains_key(http::header::UPGRADE)
}

/// Spec §4.10 steps 8-9: runs C11 for one inner HTTP request, applies header transforms,
/// and re-originates it on the shared upstream connection.
async fn handle_request(
	state: Arc<ProxyState>,
	host: Arc<str>,
	port: u16,
	client_ip: IpAddr,
	upstream: Arc<Mutex<UpstreamSender>>,
	request: Request<Incoming>,
) -> Response<Full<Bytes>> {
	let method = request.method().to_string();
	let path = request.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
	let request_id = format!("{:016x}", rand::rng().random::<u64>());
	let is_grpc = pipeline::is_grpc_content_type(request.headers());

	let outcome = match pipeline::evaluate_request(
		&state.policy,
		&state.rate_limiter,
		&state.audit,
		&host,
		port,
		&path,
		&method,
		Some(client_ip),
		is_grpc,
	) {
		Ok(outcome) => outcome,
		Err(e) => return error_response(&e),
	};

	let rule = outcome.decision.matched_rule_id.as_deref().and_then(|id| outcome.snapshot.rule(id));
	let ctx = TransformContext {
		client_ip: Some(client_ip),
		rule_id: outcome.decision.matched_rule_id.as_deref(),
		timestamp_ms: crate::audit::now_ms(),
		host: &host,
		path: Some(&path),
		method: Some(&method),
		request_id: &request_id,
	};

	let wants_upgrade = get_upgrade_type(request.headers());
	let (mut parts, body) = request.into_parts();
	if let Some(transform) = rule.and_then(|r| r.request_headers.as_ref()) {
		transform::apply(transform, &mut parts.headers, &ctx);
	}

	if wants_upgrade {
		return handle_upgrade(upstream, parts, body).await;
	}

	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(_) => return error_response(&PipelineError::ProtocolError("failed to read request body".to_string())),
	};
	let upstream_req = Request::from_parts(parts, Full::new(body_bytes));

	let response = {
		let mut sender = upstream.lock().await;
		if sender.ready().await.is_err() {
			return error_response(&PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upstream closed")));
		}
		sender.send_request(upstream_req).await
	};

	let response = match response {
		Ok(r) => r,
		Err(e) => return error_response(&PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::Other, e))),
	};

	let (mut parts, body) = response.into_parts();
	if let Some(transform) = rule.and_then(|r| r.response_headers.as_ref()) {
		transform::apply(transform, &mut parts.headers, &ctx);
	}
	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(_) => Bytes::new(),
	};
	state.audit.record_bytes(Direction::Downstream, body_bytes.len() as u64);
	Response::from_parts(parts, Full::new(body_bytes))
}

/// Spec §4.10 step 9: "For WebSocket upgrades, drop into the raw-splice mode after the
/// upgrade response." Grounded on the teacher's `proxy/gateway.rs::call` upgrade branch
/// (`hyper::upgrade::on` on both legs, `copy_bidirectional` once both are upgraded),
/// adapted to this module's shared `Arc<Mutex<SendRequest>>` upstream sender and
/// `Full<Bytes>` body type.
async fn handle_upgrade(upstream: Arc<Mutex<UpstreamSender>>, parts: http::request::Parts, body: Incoming) -> Response<Full<Bytes>> {
	let upstream_req = Request::from_parts(parts.clone(), Full::new(Bytes::new()));
	let mut downstream_request = Request::from_parts(parts, body);

	let response = {
		let mut sender = upstream.lock().await;
		if sender.ready().await.is_err() {
			return error_response(&PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upstream closed")));
		}
		sender.send_request(upstream_req).await
	};
	let response = match response {
		Ok(r) => r,
		Err(e) => return error_response(&PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::Other, e))),
	};

	if response.status() != StatusCode::SWITCHING_PROTOCOLS {
		let (parts, body) = response.into_parts();
		let body_bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
		return Response::from_parts(parts, Full::new(body_bytes));
	}

	let (response_parts, response_body) = response.into_parts();
	let upstream_response_for_upgrade = Response::from_parts(response_parts.clone(), response_body);
	let downstream_response = Response::from_parts(response_parts, Full::new(Bytes::new()));

	let mut upstream_upgraded = match hyper::upgrade::on(upstream_response_for_upgrade).await {
		Ok(u) => TokioIo::new(u),
		Err(e) => return error_response(&PipelineError::ProtocolError(format!("upstream upgrade failed: {e}"))),
	};

	tokio::spawn(async move {
		let mut downstream_upgraded = match hyper::upgrade::on(&mut downstream_request).await {
			Ok(u) => TokioIo::new(u),
			Err(e) => {
				tracing::warn!(error = %e, "failed to upgrade downstream connection");
				return;
			},
		};
		if let Err(e) = tokio::io::copy_bidirectional(&mut downstream_upgraded, &mut upstream_upgraded).await {
			tracing::debug!(error = %e, "websocket splice ended");
		}
	});

	downstream_response
}

fn error_response(e: &PipelineError) -> Response<Full<Bytes>> {
	let mut builder = Response::builder().status(e.status_code());
	if let Some(retry_after) = e.retry_after() {
		builder = builder.header(http::header::RETRY_AFTER, retry_after.as_secs().max(1).to_string());
	}
	builder.body(Full::new(Bytes::from(e.to_string()))).unwrap_or_else(|_| {
		Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Full::new(Bytes::new())).expect("static response must build")
	})
}
