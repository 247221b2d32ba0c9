//! C4 — policy snapshot. The compiled, immutable product of a rule list, plus the raw
//! (JSON) rule schema it's compiled from (spec §3, §4.4, §6).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::matcher::{DomainPattern, GrpcPolicy, IpMatcher, PathMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	Strict,
	Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
	Allow,
	Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitAlgorithm {
	#[default]
	TokenBucket,
	/// Parsed but rejected at validation time — spec §9 Open Question 2: "document the
	/// sliding-window option as reserved".
	SlidingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawRateLimit {
	pub requests_per_minute: u32,
	#[serde(default)]
	pub burst_allowance: u32,
	#[serde(default)]
	pub algorithm: RateLimitAlgorithm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawHeaderTransform {
	/// Old header name -> new header name, case-insensitive lookup.
	#[serde(default)]
	pub rename: HashMap<String, String>,
	#[serde(default)]
	pub remove: Vec<String>,
	/// Header name -> value template with `${...}` substitutions.
	#[serde(default)]
	pub set: HashMap<String, String>,
}

impl RawHeaderTransform {
	pub fn is_empty(&self) -> bool {
		self.rename.is_empty() && self.remove.is_empty() && self.set.is_empty()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawGrpcPolicy {
	#[serde(default)]
	pub allow_reflection: bool,
	#[serde(default = "default_true")]
	pub allow_health_check: bool,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub services: Vec<String>,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawRule {
	pub id: String,
	pub domain: String,
	#[serde(default)]
	pub paths: Vec<String>,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub client_ips: Vec<String>,
	#[serde(default)]
	pub exclude_client_ips: Vec<String>,
	#[serde(default)]
	pub rate_limit: Option<RawRateLimit>,
	#[serde(default)]
	pub request_headers: Option<RawHeaderTransform>,
	#[serde(default)]
	pub response_headers: Option<RawHeaderTransform>,
	#[serde(default)]
	pub grpc: Option<RawGrpcPolicy>,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawConfig {
	pub mode: Mode,
	pub default_action: DefaultAction,
	/// Rate limit applied to traffic admitted only by `default_action: "allow"` (no rule
	/// matched). Spec §4.6: "a default limiter exists per snapshot for unconfigured rules".
	#[serde(default)]
	pub default_rate_limit: Option<RawRateLimit>,
	#[serde(default)]
	pub rules: Vec<RawRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid rule id {0:?}: must be 1-64 ASCII characters matching [A-Za-z0-9_-]+")]
	InvalidRuleId(String),
	#[error("duplicate rule id {0:?}")]
	DuplicateRuleId(String),
	#[error("rule {rule_id:?}: invalid domain pattern: {source}")]
	Domain { rule_id: String, #[source] source: DomainPatternError },
	#[error("rule {rule_id:?}: invalid path glob: {source}")]
	Path { rule_id: String, #[source] source: GlobError },
	#[error("rule {rule_id:?}: invalid client IP pattern: {source}")]
	Ip { rule_id: String, #[source] source: IpPatternError },
	#[error("rule {rule_id:?}: rate limiter algorithm \"sliding-window\" is reserved and not yet implemented")]
	SlidingWindowReserved { rule_id: String },
	#[error("parse error: {0}")]
	Parse(#[from] serde_path_to_error::Error<serde_json::Error>),
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),
}

use crate::matcher::{DomainPatternError, GlobError, IpPatternError};

/// A compiled rule: the JSON `RawRule` plus its precompiled matchers, per spec §4.4.
pub struct Rule {
	pub id: String,
	pub domain: DomainPattern,
	pub paths: PathMatcher,
	pub methods: Option<HashSet<String>>,
	pub ips: IpMatcher,
	pub has_ip_constraint: bool,
	pub rate_limit: Option<RawRateLimit>,
	pub request_headers: Option<RawHeaderTransform>,
	pub response_headers: Option<RawHeaderTransform>,
	pub grpc: Option<GrpcPolicy>,
}

/// Which per-rule check produced a miss, for a rule whose domain (and source-IP, if
/// constrained) otherwise matched — spec §7's `PathDenied`/`MethodDenied` kinds are only
/// meaningful when a rule existed for the domain but a narrower check rejected the request
/// (§8 S3: "a rule existed for the domain but path/method failed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
	Path,
	Method,
}

/// The outcome of evaluating a request against a snapshot (spec §3 "Decision record").
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
	pub allowed: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub matched_rule_id: Option<String>,
	pub reason: String,
	/// Set when some rule's domain (and IP constraint, if any) matched but a later check in
	/// the per-rule sequence rejected it — distinguishes §7 `PathDenied`/`MethodDenied` from
	/// a plain `DomainDenied` even though `matched_rule_id` stays `None` in both cases.
	#[serde(skip)]
	pub miss: Option<(String, MissKind)>,
}

/// A request as seen by the pipeline (spec §4.4 `req`).
#[derive(Debug, Clone)]
pub struct RequestInfo {
	pub host: String,
	pub port: u16,
	pub path: Option<String>,
	pub method: Option<String>,
	pub source_ip: Option<IpAddr>,
	/// Spec §4.10 step 8: "gRPC iff `content-type: application/grpc*`". The gRPC sub-matcher
	/// (§4.5) only applies when this is `true` — a rule with `grpc` configured does not deny
	/// an ordinary HTTP request just because its path happens to look like `/a/b`.
	pub is_grpc: bool,
}

/// C4 — the immutable compiled rule set. Built by the reloader, published by atomic
/// pointer swap, read by every connection's pipeline.
pub struct Snapshot {
	pub default_allow: bool,
	pub default_rate_limit: Option<RawRateLimit>,
	pub rules: Vec<Rule>,
}

impl Snapshot {
	pub fn compile(raw: &RawConfig) -> Result<Snapshot, ConfigError> {
		let mut seen = HashSet::new();
		let mut rules = Vec::with_capacity(raw.rules.len());
		for r in raw.rules.iter().filter(|r| r.enabled) {
			validate_id(&r.id)?;
			if !seen.insert(r.id.clone()) {
				return Err(ConfigError::DuplicateRuleId(r.id.clone()));
			}
			if let Some(rl) = &r.rate_limit {
				if rl.algorithm == RateLimitAlgorithm::SlidingWindow {
					return Err(ConfigError::SlidingWindowReserved { rule_id: r.id.clone() });
				}
			}
			let domain = DomainPattern::compile(&r.domain).map_err(|source| ConfigError::Domain { rule_id: r.id.clone(), source })?;
			let paths = PathMatcher::compile(&r.paths).map_err(|source| ConfigError::Path { rule_id: r.id.clone(), source })?;
			let ips = IpMatcher::compile(&r.client_ips, &r.exclude_client_ips)
				.map_err(|source| ConfigError::Ip { rule_id: r.id.clone(), source })?;
			let methods = if r.methods.is_empty() {
				None
			} else {
				Some(r.methods.iter().map(|m| m.to_ascii_uppercase()).collect())
			};
			let grpc = r.grpc.as_ref().map(|g| GrpcPolicy {
				allow_reflection: g.allow_reflection,
				allow_health_check: g.allow_health_check,
				methods: g.methods.clone(),
				services: g.services.clone(),
			});
			rules.push(Rule {
				id: r.id.clone(),
				domain,
				paths,
				methods,
				has_ip_constraint: !r.client_ips.is_empty() || !r.exclude_client_ips.is_empty(),
				ips,
				rate_limit: r.rate_limit.clone(),
				request_headers: r.request_headers.clone(),
				response_headers: r.response_headers.clone(),
				grpc,
			});
		}
		if let Some(rl) = &raw.default_rate_limit {
			if rl.algorithm == RateLimitAlgorithm::SlidingWindow {
				return Err(ConfigError::SlidingWindowReserved { rule_id: "<default>".to_string() });
			}
		}
		Ok(Snapshot {
			default_allow: raw.default_action == DefaultAction::Allow,
			default_rate_limit: raw.default_rate_limit.clone(),
			rules,
		})
	}

	/// C4's `match(req) -> Decision`. First match wins; evaluation order per rule is
	/// source-IP exclude/allow, domain, path, method, gRPC — short-circuiting on miss.
	pub fn match_request(&self, req: &RequestInfo) -> Decision {
		let mut miss: Option<(String, MissKind)> = None;
		for rule in &self.rules {
			if rule.has_ip_constraint {
				let Some(ip) = req.source_ip else { continue };
				if !rule.ips.matches(ip) {
					continue;
				}
			}
			if !rule.domain.matches(&req.host) {
				continue;
			}
			if !rule.paths.is_empty() {
				let Some(path) = &req.path else { continue };
				if !rule.paths.matches(path) {
					if miss.is_none() {
						miss = Some((rule.id.clone(), MissKind::Path));
					}
					continue;
				}
			}
			if let Some(methods) = &rule.methods {
				let Some(method) = &req.method else { continue };
				if !methods.contains(&method.to_ascii_uppercase()) {
					if miss.is_none() {
						miss = Some((rule.id.clone(), MissKind::Method));
					}
					continue;
				}
			}
			// gRPC sub-policy only constrains actual gRPC requests (spec §4.5, §4.10 step 8);
			// a non-gRPC request matching a rule with `grpc` configured is unaffected by it.
			if req.is_grpc {
				if let (Some(grpc_policy), Some(path)) = (&rule.grpc, &req.path) {
					let Some(grpc_req) = crate::matcher::grpc::parse_path(path) else { continue };
					if !grpc_policy.admits(grpc_req) {
						continue;
					}
				}
			}
			return Decision { allowed: true, matched_rule_id: Some(rule.id.clone()), reason: "matched".to_string(), miss: None };
		}
		Decision { allowed: self.default_allow, matched_rule_id: None, reason: "default".to_string(), miss }
	}

	pub fn rule(&self, id: &str) -> Option<&Rule> {
		self.rules.iter().find(|r| r.id == id)
	}
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
	let valid = !id.is_empty()
		&& id.len() <= 64
		&& id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
	if valid { Ok(()) } else { Err(ConfigError::InvalidRuleId(id.to_string())) }
}

/// Holds the live snapshot pointer (spec §4.4, §4.13 "single atomic pointer"). Readers
/// call `load()` once per pipeline run and use the returned `Arc` for the rest of that
/// request, per the §5 ordering guarantee.
#[derive(Default)]
pub struct PolicyHandle(ArcSwap<Snapshot>);

impl PolicyHandle {
	pub fn new(initial: Snapshot) -> PolicyHandle {
		PolicyHandle(ArcSwap::from_pointee(initial))
	}

	pub fn load(&self) -> arc_swap::Guard<std::sync::Arc<Snapshot>> {
		self.0.load()
	}

	pub fn store(&self, snapshot: Snapshot) {
		self.0.store(std::sync::Arc::new(snapshot));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(id: &str, domain: &str) -> RawRule {
		RawRule {
			id: id.to_string(),
			domain: domain.to_string(),
			paths: vec![],
			methods: vec![],
			client_ips: vec![],
			exclude_client_ips: vec![],
			rate_limit: None,
			request_headers: None,
			response_headers: None,
			grpc: None,
			enabled: true,
		}
	}

	fn req(host: &str) -> RequestInfo {
		RequestInfo { host: host.to_string(), port: 443, path: None, method: None, source_ip: None, is_grpc: false }
	}

	#[test]
	fn first_match_wins_s4() {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![rule("a", "*.example.com"), rule("b", "**.example.com")],
		};
		let snap = Snapshot::compile(&raw).unwrap();
		let d = snap.match_request(&req("x.y.example.com"));
		assert_eq!(d.matched_rule_id.as_deref(), Some("b"));
		let d = snap.match_request(&req("x.example.com"));
		assert_eq!(d.matched_rule_id.as_deref(), Some("a"));
	}

	#[test]
	fn default_deny_s2() {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![rule("openai", "api.openai.com")],
		};
		let snap = Snapshot::compile(&raw).unwrap();
		assert!(snap.match_request(&req("api.openai.com")).allowed);
		let d = snap.match_request(&req("evil.com"));
		assert!(!d.allowed);
		assert!(d.matched_rule_id.is_none());
	}

	#[test]
	fn rejects_duplicate_ids() {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![rule("a", "x.com"), rule("a", "y.com")],
		};
		assert!(matches!(Snapshot::compile(&raw), Err(ConfigError::DuplicateRuleId(_))));
	}

	#[test]
	fn rejects_invalid_id() {
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![rule("bad id!", "x.com")],
		};
		assert!(matches!(Snapshot::compile(&raw), Err(ConfigError::InvalidRuleId(_))));
	}

	#[test]
	fn disabled_rules_are_skipped() {
		let mut r = rule("a", "x.com");
		r.enabled = false;
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![r],
		};
		let snap = Snapshot::compile(&raw).unwrap();
		assert!(!snap.match_request(&req("x.com")).allowed);
	}

	#[test]
	fn path_and_method_denial_s3() {
		let mut r = rule("openai", "api.openai.com");
		r.paths = vec!["/v1/models".to_string()];
		r.methods = vec!["GET".to_string()];
		let raw = RawConfig {
			mode: Mode::Strict,
			default_action: DefaultAction::Deny,
			default_rate_limit: None,
			rules: vec![r],
		};
		let snap = Snapshot::compile(&raw).unwrap();
		let mut req = req("api.openai.com");
		req.path = Some("/v1/admin".to_string());
		req.method = Some("POST".to_string());
		let d = snap.match_request(&req);
		assert!(!d.allowed);
		assert!(d.matched_rule_id.is_none());
		assert_eq!(d.miss, Some(("openai".to_string(), MissKind::Path)));
	}

	#[test]
	fn grpc_policy_does_not_gate_non_grpc_requests() {
		let mut r = rule("svc", "grpc.example.com");
		r.grpc = Some(RawGrpcPolicy { allow_reflection: false, allow_health_check: true, methods: vec!["pkg.Greeter/SayHello".to_string()], services: vec![] });
		let raw =
			RawConfig { mode: Mode::Strict, default_action: DefaultAction::Deny, default_rate_limit: None, rules: vec![r] };
		let snap = Snapshot::compile(&raw).unwrap();
		// Same two-segment shape as a gRPC path, but not marked as a gRPC request: the
		// configured `grpc.methods` allowlist must not apply to it.
		let mut req = req("grpc.example.com");
		req.path = Some("/other.Service/Other".to_string());
		req.is_grpc = false;
		let d = snap.match_request(&req);
		assert!(d.allowed);
		assert_eq!(d.matched_rule_id.as_deref(), Some("svc"));
	}

	#[test]
	fn grpc_policy_gates_actual_grpc_requests() {
		let mut r = rule("svc", "grpc.example.com");
		r.grpc = Some(RawGrpcPolicy { allow_reflection: false, allow_health_check: true, methods: vec!["pkg.Greeter/SayHello".to_string()], services: vec![] });
		let raw =
			RawConfig { mode: Mode::Strict, default_action: DefaultAction::Deny, default_rate_limit: None, rules: vec![r] };
		let snap = Snapshot::compile(&raw).unwrap();
		let mut req = req("grpc.example.com");
		req.path = Some("/other.Service/Other".to_string());
		req.is_grpc = true;
		let d = snap.match_request(&req);
		assert!(!d.allowed);
	}
}
