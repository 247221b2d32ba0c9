//! C11 — request pipeline (spec §4.12). The canonical ordering shared by the CONNECT
//! admission check (C8/C9 steps 1-4: domain-only, no path/method available yet) and the
//! full per-HTTP-request evaluation inside the MITM (C9 step 8-9) and forward (C10)
//! handlers. One snapshot load per call, per spec §5 "Policy decisions on a single request
//! use one snapshot (loaded once at the start of the pipeline)".

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{Audit, DecisionRecord, now_ms};
use crate::error::PipelineError;
use crate::policy::{Decision, MissKind, PolicyHandle, RequestInfo, Snapshot};
use crate::ratelimit::{ConsumeResult, RateLimiter};

/// What survives pipeline evaluation for the caller to act on: the snapshot (kept alive so
/// the matched `Rule`'s header transforms can still be borrowed from it), the decision, and
/// the rate-limit result.
pub struct PipelineOutcome {
	pub snapshot: Arc<Snapshot>,
	pub decision: Decision,
	pub rate_limit: ConsumeResult,
}

/// Runs `load snapshot -> match -> rate-limit -> audit` (spec §4.12's first three pipeline
/// stages). Header transforms and forwarding are the caller's responsibility — they differ
/// enough between C9 (TLS re-origination, body streaming) and C10 (plaintext
/// re-origination) that folding them into one function would blur rather than share code.
pub fn evaluate(
	policy: &PolicyHandle,
	rate_limiter: &RateLimiter,
	audit: &Audit,
	req: &RequestInfo,
) -> Result<PipelineOutcome, PipelineError> {
	let snapshot: Arc<Snapshot> = policy.load().clone();
	let decision = snapshot.match_request(req);
	audit.record_request(decision.allowed, decision.matched_rule_id.as_deref());

	if !decision.allowed {
		let err = deny_error(&decision, req);
		audit.record_error(err.kind());
		audit.audit(&decision_record(req, &decision, None));
		return Err(err);
	}

	let Some(ip) = req.source_ip else {
		// No resolvable source IP (unusual, but not a protocol violation): rate-limiting is
		// keyed on client IP, so without one there is nothing meaningful to consume against.
		let rate_limit = ConsumeResult { allowed: true, remaining: f64::INFINITY, reset_ms: 0, limit: u32::MAX };
		audit.audit(&decision_record(req, &decision, Some(&rate_limit)));
		return Ok(PipelineOutcome { snapshot, decision, rate_limit });
	};

	let cfg = decision
		.matched_rule_id
		.as_deref()
		.and_then(|id| snapshot.rule(id))
		.and_then(|r| r.rate_limit.as_ref())
		.or(snapshot.default_rate_limit.as_ref());
	let rl = rate_limiter.consume(ip, decision.matched_rule_id.as_deref(), cfg);
	if !rl.allowed {
		audit.record_rate_limit_hit(decision.matched_rule_id.as_deref());
		let err = PipelineError::RateLimited { rule_id: decision.matched_rule_id.clone(), retry_after: Duration::from_millis(rl.reset_ms) };
		audit.record_error(err.kind());
		audit.audit(&decision_record(req, &decision, Some(&rl)));
		return Err(err);
	}

	audit.audit(&decision_record(req, &decision, Some(&rl)));
	Ok(PipelineOutcome { snapshot, decision, rate_limit: rl })
}

/// Spec §7: `DomainDenied` when no rule matched at all, `PathDenied`/`MethodDenied` when a
/// rule's domain (and IP constraint) matched but a narrower check rejected the request
/// (§8 S3). `matched_rule_id` stays `None` either way — only the audit/metrics `kind` label
/// and HTTP disposition differ.
fn deny_error(decision: &Decision, req: &RequestInfo) -> PipelineError {
	match &decision.miss {
		Some((rule_id, MissKind::Path)) => {
			PipelineError::PathDenied { rule_id: rule_id.clone(), path: req.path.clone().unwrap_or_default() }
		},
		Some((rule_id, MissKind::Method)) => {
			PipelineError::MethodDenied { rule_id: rule_id.clone(), method: req.method.clone().unwrap_or_default() }
		},
		None => PipelineError::DomainDenied,
	}
}

/// Spec §3 "Decision record" / §4.12 "emit audit(decision, rl) to sink": built once per
/// pipeline run and handed to the audit sink regardless of outcome.
fn decision_record(req: &RequestInfo, decision: &Decision, rate_limit: Option<&ConsumeResult>) -> DecisionRecord {
	DecisionRecord {
		allowed: decision.allowed,
		matched_rule_id: decision.matched_rule_id.clone(),
		reason: decision.reason.clone(),
		host: req.host.clone(),
		source_ip: req.source_ip,
		rate_limit_remaining: rate_limit.map(|rl| rl.remaining),
		retry_after_ms: rate_limit.filter(|rl| !rl.allowed).map(|rl| rl.reset_ms),
		timestamp_ms: now_ms(),
	}
}

/// The path/method-aware variant used once a full HTTP request line is available (spec
/// §4.10 step 8, §4.11). `path`/`method` narrow the match beyond the CONNECT-level
/// domain-only check.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_request(
	policy: &PolicyHandle,
	rate_limiter: &RateLimiter,
	audit: &Audit,
	host: &str,
	port: u16,
	path: &str,
	method: &str,
	source_ip: Option<IpAddr>,
	is_grpc: bool,
) -> Result<PipelineOutcome, PipelineError> {
	let req = RequestInfo {
		host: host.to_string(),
		port,
		path: Some(path.to_string()),
		method: Some(method.to_string()),
		source_ip,
		is_grpc,
	};
	evaluate(policy, rate_limiter, audit, &req)
}

/// Spec §4.4/§4.10 step 8: a request is gRPC when its `content-type` is `application/grpc`
/// or one of its `+proto`/`+json` variants, not merely because its path happens to look like
/// `/package.Service/Method` — plain JSON/REST calls can share that shape.
pub fn is_grpc_content_type(headers: &http::HeaderMap) -> bool {
	headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.starts_with("application/grpc"))
}

#[cfg(test)]
mod tests {
	use std::net::{IpAddr, Ipv4Addr};

	use super::*;
	use crate::policy::{DefaultAction, Mode, RawConfig, RawRule, Snapshot};

	fn state() -> (PolicyHandle, RateLimiter, Audit) {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![RawRule {
				id: "openai".to_string(),
				domain: "api.openai.com".to_string(),
				paths: vec![],
				methods: vec![],
				client_ips: vec![],
				exclude_client_ips: vec![],
				rate_limit: None,
				request_headers: None,
				response_headers: None,
				grpc: None,
				enabled: true,
			}],
		};
		let snapshot = Snapshot::compile(&raw).unwrap();
		let mut registry = prometheus_client::registry::Registry::default();
		(PolicyHandle::new(snapshot), RateLimiter::new(), Audit::new(&mut registry))
	}

	fn ip() -> IpAddr {
		IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
	}

	#[test]
	fn admits_matching_domain() {
		let (policy, rl, audit) = state();
		let req = RequestInfo { host: "api.openai.com".to_string(), port: 443, path: None, method: None, source_ip: Some(ip()), is_grpc: false };
		let outcome = evaluate(&policy, &rl, &audit, &req).unwrap();
		assert_eq!(outcome.decision.matched_rule_id.as_deref(), Some("openai"));
	}

	#[test]
	fn denies_unmatched_domain() {
		let (policy, rl, audit) = state();
		let req = RequestInfo { host: "evil.com".to_string(), port: 443, path: None, method: None, source_ip: Some(ip()), is_grpc: false };
		assert!(matches!(evaluate(&policy, &rl, &audit, &req), Err(PipelineError::DomainDenied)));
	}

	#[test]
	fn path_denial_reports_path_denied_not_domain_denied() {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![RawRule {
				id: "openai".to_string(),
				domain: "api.openai.com".to_string(),
				paths: vec!["/v1/models".to_string()],
				methods: vec![],
				client_ips: vec![],
				exclude_client_ips: vec![],
				rate_limit: None,
				request_headers: None,
				response_headers: None,
				grpc: None,
				enabled: true,
			}],
		};
		let snapshot = Snapshot::compile(&raw).unwrap();
		let mut registry = prometheus_client::registry::Registry::default();
		let (policy, rl, audit) = (PolicyHandle::new(snapshot), RateLimiter::new(), Audit::new(&mut registry));
		let err = evaluate_request(&policy, &rl, &audit, "api.openai.com", 443, "/v1/admin", "GET", Some(ip()), false).unwrap_err();
		assert!(matches!(err, PipelineError::PathDenied { ref rule_id, ref path } if rule_id == "openai" && path == "/v1/admin"));
	}

	#[test]
	fn detects_grpc_content_type() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, "application/grpc+proto".parse().unwrap());
		assert!(is_grpc_content_type(&headers));

		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
		assert!(!is_grpc_content_type(&headers));
	}
}
