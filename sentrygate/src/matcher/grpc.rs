//! §4.5 — gRPC sub-matcher. gRPC paths have the form `/package.Service/Method`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrpcRequest<'a> {
	pub full_service: &'a str,
	pub method: &'a str,
}

/// Parses an HTTP path as a gRPC call path. Returns `None` if it isn't one.
pub fn parse_path(path: &str) -> Option<GrpcRequest<'_>> {
	let rest = path.strip_prefix('/')?;
	let (service, method) = rest.split_once('/')?;
	if service.is_empty() || method.is_empty() {
		return None;
	}
	Some(GrpcRequest { full_service: service, method })
}

const REFLECTION_SERVICES: &[&str] =
	&["grpc.reflection.v1alpha.ServerReflection", "grpc.reflection.v1.ServerReflection"];
const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

#[derive(Debug, Clone, Default)]
pub struct GrpcPolicy {
	pub allow_reflection: bool,
	pub allow_health_check: bool,
	/// `pkg.Service/Method`, `pkg.Service/*`, `pkg.*/Method`, or `**`.
	pub methods: Vec<String>,
	/// `pkg.Service`, `pkg.*`, or `**`.
	pub services: Vec<String>,
}

impl GrpcPolicy {
	pub fn new() -> GrpcPolicy {
		GrpcPolicy { allow_reflection: false, allow_health_check: true, methods: Vec::new(), services: Vec::new() }
	}

	pub fn admits(&self, req: GrpcRequest<'_>) -> bool {
		if REFLECTION_SERVICES.contains(&req.full_service) {
			return self.allow_reflection;
		}
		if req.full_service == HEALTH_SERVICE {
			return self.allow_health_check;
		}
		if !self.methods.is_empty() {
			return self.methods.iter().any(|p| method_pattern_matches(p, req));
		}
		if !self.services.is_empty() {
			return self.services.iter().any(|p| service_pattern_matches(p, req.full_service));
		}
		// Neither configured: grpc sub-policy present but empty denies everything non-builtin.
		false
	}
}

fn method_pattern_matches(pattern: &str, req: GrpcRequest<'_>) -> bool {
	if pattern == "**" {
		return true;
	}
	let Some((svc, method)) = pattern.split_once('/') else {
		return false;
	};
	service_segment_matches(svc, req.full_service) && (method == "*" || method == req.method)
}

fn service_pattern_matches(pattern: &str, full_service: &str) -> bool {
	if pattern == "**" {
		return true;
	}
	service_segment_matches(pattern, full_service)
}

/// `pkg.Service` exact, or `pkg.*` matching any service within `pkg`.
fn service_segment_matches(pattern: &str, full_service: &str) -> bool {
	if let Some(pkg) = pattern.strip_suffix(".*") {
		full_service
			.rsplit_once('.')
			.map(|(p, _)| p == pkg)
			.unwrap_or(false)
	} else {
		pattern == full_service
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_path() {
		let r = parse_path("/pkg.Greeter/SayHello").unwrap();
		assert_eq!(r.full_service, "pkg.Greeter");
		assert_eq!(r.method, "SayHello");
	}

	#[test]
	fn non_grpc_path_is_none() {
		assert!(parse_path("/v1/models").is_none());
		assert!(parse_path("/onlyservice").is_none());
	}

	#[test]
	fn reflection_gated_by_allow_reflection() {
		let mut p = GrpcPolicy::new();
		let req = GrpcRequest { full_service: "grpc.reflection.v1.ServerReflection", method: "ServerReflectionInfo" };
		assert!(!p.admits(req));
		p.allow_reflection = true;
		assert!(p.admits(req));
	}

	#[test]
	fn health_default_allowed() {
		let p = GrpcPolicy::new();
		let req = GrpcRequest { full_service: "grpc.health.v1.Health", method: "Check" };
		assert!(p.admits(req));
	}

	#[test]
	fn health_can_be_denied() {
		let mut p = GrpcPolicy::new();
		p.allow_health_check = false;
		let req = GrpcRequest { full_service: "grpc.health.v1.Health", method: "Check" };
		assert!(!p.admits(req));
	}

	#[test]
	fn methods_list_does_not_fall_through_to_services() {
		let mut p = GrpcPolicy::new();
		p.methods = vec!["pkg.Greeter/SayHello".to_string()];
		p.services = vec!["pkg.Other".to_string()];
		let denied = GrpcRequest { full_service: "pkg.Other", method: "AnyMethod" };
		assert!(!p.admits(denied));
		let allowed = GrpcRequest { full_service: "pkg.Greeter", method: "SayHello" };
		assert!(p.admits(allowed));
	}

	#[test]
	fn service_wildcard() {
		let mut p = GrpcPolicy::new();
		p.services = vec!["pkg.*".to_string()];
		assert!(p.admits(GrpcRequest { full_service: "pkg.Greeter", method: "SayHello" }));
		assert!(!p.admits(GrpcRequest { full_service: "other.Greeter", method: "SayHello" }));
	}
}
