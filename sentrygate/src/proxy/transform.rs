//! §4.12 header transform: `rename` → `remove` → `set`, in that order, with
//! `${clientIp}`/`${ruleId}`/`${timestamp}`/`${host}`/`${path}`/`${method}`/`${requestId}`
//! substitutions in `set` values. Grounded on `http/transformation.rs`'s shape (a
//! transform object applied to a `HeaderMap`), but the substitution language itself is a
//! small hand-rolled `${...}` pass rather than a full `minijinja::Environment` — the
//! spec's transform vocabulary is seven fixed tokens, not a templating language, so
//! pulling in `minijinja` for it would be dead weight (recorded in DESIGN.md as a
//! dropped dependency).

use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::policy::RawHeaderTransform;

/// The substitution variables available to `set` values (spec §4.12).
pub struct TransformContext<'a> {
	pub client_ip: Option<IpAddr>,
	pub rule_id: Option<&'a str>,
	pub timestamp_ms: u64,
	pub host: &'a str,
	pub path: Option<&'a str>,
	pub method: Option<&'a str>,
	pub request_id: &'a str,
}

/// Applies `rename`, then `remove`, then `set`, per spec §4.12. Unknown/malformed header
/// names or values are skipped rather than panicking — a misconfigured transform must not
/// crash the hot path.
pub fn apply(transform: &RawHeaderTransform, headers: &mut HeaderMap, ctx: &TransformContext<'_>) {
	for (from, to) in &transform.rename {
		rename_header(headers, from, to);
	}
	for name in &transform.remove {
		if let Ok(name) = name.parse::<HeaderName>() {
			headers.remove(name);
		}
	}
	for (name, template) in &transform.set {
		let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(&substitute(template, ctx))) else {
			continue;
		};
		headers.insert(name, value);
	}
}

/// Case-insensitive rename that preserves the value (spec: "adding during `rename`
/// preserves value"). If `from` isn't present, this is a no-op.
fn rename_header(headers: &mut HeaderMap, from: &str, to: &str) {
	let Ok(from_name) = from.parse::<HeaderName>() else { return };
	let Ok(to_name) = to.parse::<HeaderName>() else { return };
	let values: Vec<HeaderValue> = headers.get_all(&from_name).iter().cloned().collect();
	if values.is_empty() {
		return;
	}
	headers.remove(&from_name);
	for v in values {
		headers.append(&to_name, v);
	}
}

fn substitute(template: &str, ctx: &TransformContext<'_>) -> String {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		let Some(end) = after.find('}') else {
			out.push_str(&rest[start..]);
			return out;
		};
		let token = &after[..end];
		out.push_str(&resolve(token, ctx));
		rest = &after[end + 1..];
	}
	out.push_str(rest);
	out
}

fn resolve(token: &str, ctx: &TransformContext<'_>) -> String {
	match token {
		"clientIp" => ctx.client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
		"ruleId" => ctx.rule_id.unwrap_or_default().to_string(),
		"timestamp" => ctx.timestamp_ms.to_string(),
		"host" => ctx.host.to_string(),
		"path" => ctx.path.unwrap_or_default().to_string(),
		"method" => ctx.method.unwrap_or_default().to_string(),
		"requestId" => ctx.request_id.to_string(),
		other => format!("${{{other}}}"),
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn ctx() -> TransformContext<'static> {
		TransformContext {
			client_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
			rule_id: Some("openai"),
			timestamp_ms: 1_700_000_000_000,
			host: "api.openai.com",
			path: Some("/v1/models"),
			method: Some("GET"),
			request_id: "req-1",
		}
	}

	#[test]
	fn substitutes_all_tokens() {
		let t = "ip=${clientIp} rule=${ruleId} ts=${timestamp} host=${host} path=${path} m=${method} id=${requestId}";
		let out = substitute(t, &ctx());
		assert_eq!(out, "ip=10.0.0.1 rule=openai ts=1700000000000 host=api.openai.com path=/v1/models m=GET id=req-1");
	}

	#[test]
	fn unknown_token_left_verbatim() {
		assert_eq!(substitute("x=${bogus}", &ctx()), "x=${bogus}");
	}

	#[test]
	fn rename_preserves_value_and_set_overwrites() {
		let mut headers = HeaderMap::new();
		headers.insert("x-old", HeaderValue::from_static("v1"));
		let mut transform = RawHeaderTransform::default();
		transform.rename.insert("x-old".to_string(), "x-new".to_string());
		transform.set.insert("x-rule".to_string(), "${ruleId}".to_string());
		apply(&transform, &mut headers, &ctx());
		assert_eq!(headers.get("x-new").unwrap(), "v1");
		assert!(headers.get("x-old").is_none());
		assert_eq!(headers.get("x-rule").unwrap(), "openai");
	}

	#[test]
	fn remove_drops_header() {
		let mut headers = HeaderMap::new();
		headers.insert("x-drop", HeaderValue::from_static("v"));
		let mut transform = RawHeaderTransform::default();
		transform.remove.push("x-drop".to_string());
		apply(&transform, &mut headers, &ctx());
		assert!(headers.get("x-drop").is_none());
	}

	#[test]
	fn set_overwrites_existing() {
		let mut headers = HeaderMap::new();
		headers.insert("x-host", HeaderValue::from_static("stale"));
		let mut transform = RawHeaderTransform::default();
		transform.set.insert("x-host".to_string(), "${host}".to_string());
		apply(&transform, &mut headers, &ctx());
		assert_eq!(headers.get("x-host").unwrap(), "api.openai.com");
	}
}
