//! C10 — forward proxy handler (spec §4.11). Handles plaintext, non-CONNECT requests whose
//! `request-URI` is absolute (the classic forward-proxy form, e.g. `GET http://host/path
//! HTTP/1.1`). Grounded on `management/hyper_helpers.rs`'s `pooling_client()` for the
//! outbound client shape; unlike the admin surface this re-originates arbitrary upstream
//! requests rather than serving fixed local routes.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use super::{ProxyState, pipeline, transform};
use crate::audit::Direction;
use crate::error::PipelineError;
use crate::proxy::transform::TransformContext;

/// RFC 7230 §6.1 connection-specific headers a proxy must strip before re-origination,
/// plus `Proxy-Connection` (a de-facto convention some clients still send).
const HOP_BY_HOP: &[&str] =
	&["connection", "proxy-connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding", "upgrade"];

fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(*name);
	}
}

/// Spec §4.11: "Build `RequestInfo` directly from the line and `Host` header, run C11, and
/// on admission re-originate the request upstream." Returns a plain response in all cases —
/// the pipeline's denial/rate-limit/upstream errors are rendered here rather than
/// propagated, since a forward-proxy request always gets an HTTP response (unlike CONNECT,
/// which can just close the TCP connection).
pub async fn handle(state: Arc<ProxyState>, req: Request<Incoming>, client_ip: IpAddr) -> Response<Full<Bytes>> {
	let method = req.method().to_string();
	let Some((host, port)) = target_of(req.uri()) else {
		return error_response(&PipelineError::ProtocolError("forward proxy request URI is not absolute".to_string()));
	};
	let path = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
	let request_id = format!("{:016x}", {
		use rand::Rng;
		rand::rng().random::<u64>()
	});

	let is_grpc = pipeline::is_grpc_content_type(req.headers());
	let outcome = match pipeline::evaluate_request(&state.policy, &state.rate_limiter, &state.audit, &host, port, &path, &method, Some(client_ip), is_grpc) {
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

	let (mut parts, body) = req.into_parts();
	let Ok(origin_uri) = origin_form(&parts.uri) else {
		return error_response(&PipelineError::ProtocolError("could not rewrite request URI to origin form".to_string()));
	};
	parts.uri = origin_uri;
	strip_hop_by_hop(&mut parts.headers);
	if let Some(transform) = rule.and_then(|r| r.request_headers.as_ref()) {
		transform::apply(transform, &mut parts.headers, &ctx);
	}
	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(_) => return error_response(&PipelineError::ProtocolError("failed to read request body".to_string())),
	};
	let upstream_req = Request::from_parts(parts, Full::new(body_bytes));

	let client = state.plaintext_client();
	let response = match client.request(upstream_req).await {
		Ok(r) => r,
		Err(e) => return error_response(&PipelineError::UpstreamConnect(std::io::Error::new(std::io::ErrorKind::Other, e))),
	};

	let (mut parts, body) = response.into_parts();
	strip_hop_by_hop(&mut parts.headers);
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

/// Extracts `(host, port)` from an absolute-form request URI (spec §4.11's precondition).
fn target_of(uri: &Uri) -> Option<(String, u16)> {
	let authority = uri.authority()?;
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
	Some((host, port))
}

/// Rewrites an absolute-form URI (`http://host/path?q`) to origin-form (`/path?q`) for
/// re-origination, per RFC 7230 §5.3.1.
fn origin_form(uri: &Uri) -> Result<Uri, http::uri::InvalidUri> {
	let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	path_and_query.parse()
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

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_host_and_default_port() {
		let uri: Uri = "http://api.openai.com/v1/models".parse().unwrap();
		assert_eq!(target_of(&uri), Some(("api.openai.com".to_string(), 80)));
	}

	#[test]
	fn extracts_explicit_port() {
		let uri: Uri = "http://api.openai.com:8080/v1/models".parse().unwrap();
		assert_eq!(target_of(&uri), Some(("api.openai.com".to_string(), 8080)));
	}

	#[test]
	fn rewrites_to_origin_form() {
		let uri: Uri = "http://api.openai.com/v1/models?x=1".parse().unwrap();
		let rewritten = origin_form(&uri).unwrap();
		assert_eq!(rewritten.to_string(), "/v1/models?x=1");
	}

	#[test]
	fn relative_uri_has_no_target() {
		let uri: Uri = "/v1/models".parse().unwrap();
		assert_eq!(target_of(&uri), None);
	}
}
