//! C2 — IP/CIDR matcher. Parses each configured pattern once into an `IpNet`; a query
//! compares only patterns of the matching address family.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

#[derive(Debug, thiserror::Error)]
#[error("invalid IP/CIDR pattern {0:?}: {1}")]
pub struct IpPatternError(String, String);

/// A compiled list of allow / exclude CIDR patterns, per spec §4.2. Exclusion takes
/// precedence over inclusion.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
	allow: Vec<IpNet>,
	exclude: Vec<IpNet>,
}

impl IpMatcher {
	pub fn compile(allow: &[String], exclude: &[String]) -> Result<IpMatcher, IpPatternError> {
		Ok(IpMatcher { allow: compile_list(allow)?, exclude: compile_list(exclude)? })
	}

	/// `true` iff (a) no exclude pattern matches, and (b) either `allow` is empty or some
	/// allow pattern matches.
	pub fn matches(&self, ip: IpAddr) -> bool {
		let ip = normalize(ip);
		if self.exclude.iter().any(|p| contains(p, ip)) {
			return false;
		}
		self.allow.is_empty() || self.allow.iter().any(|p| contains(p, ip))
	}
}

fn contains(net: &IpNet, ip: IpAddr) -> bool {
	net.contains(&ip)
}

/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are normalized to plain IPv4 so they
/// compare against `a.b.c.d/n` patterns as the spec's "v4-mapped form" note implies.
fn normalize(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
		other => other,
	}
}

fn compile_list(patterns: &[String]) -> Result<Vec<IpNet>, IpPatternError> {
	patterns
		.iter()
		.map(|p| parse_one(p))
		.collect()
}

fn parse_one(pattern: &str) -> Result<IpNet, IpPatternError> {
	if let Ok(net) = IpNet::from_str(pattern) {
		return Ok(normalize_net(net));
	}
	// Bare address, no prefix: treat as a /32 or /128.
	if let Ok(addr) = IpAddr::from_str(pattern) {
		return Ok(IpNet::from(normalize(addr)));
	}
	Err(IpPatternError(pattern.to_string(), "not a valid IPv4/IPv6 address or CIDR".to_string()))
}

fn normalize_net(net: IpNet) -> IpNet {
	match net {
		IpNet::V6(v6) => match v6.addr().to_ipv4_mapped() {
			Some(v4) => IpNet::new(IpAddr::V4(v4), v6.prefix_len().saturating_sub(96)).unwrap_or(IpNet::V6(v6)),
			None => IpNet::V6(v6),
		},
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	#[test]
	fn matches_v4_cidr() {
		let m = IpMatcher::compile(&["10.0.0.0/8".to_string()], &[]).unwrap();
		assert!(m.matches(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
		assert!(!m.matches(IpAddr::V4(Ipv4Addr::new(11, 1, 2, 3))));
	}

	#[test]
	fn exact_v4_literal_is_slash_32() {
		let m = IpMatcher::compile(&["192.168.1.5".to_string()], &[]).unwrap();
		assert!(m.matches(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))));
		assert!(!m.matches(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 6))));
	}

	#[test]
	fn exclude_takes_precedence() {
		let m = IpMatcher::compile(&["10.0.0.0/8".to_string()], &["10.0.0.5".to_string()]).unwrap();
		assert!(m.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6))));
		assert!(!m.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
	}

	#[test]
	fn empty_allow_list_allows_everything_not_excluded() {
		let m = IpMatcher::compile(&[], &["10.0.0.5".to_string()]).unwrap();
		assert!(m.matches(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
		assert!(!m.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
	}

	#[test]
	fn v6_cidr() {
		let m = IpMatcher::compile(&["2001:db8::/32".to_string()], &[]).unwrap();
		assert!(m.matches("2001:db8::1".parse().unwrap()));
		assert!(!m.matches("2001:db9::1".parse().unwrap()));
	}

	#[test]
	fn rejects_garbage() {
		assert!(IpMatcher::compile(&["not-an-ip".to_string()], &[]).is_err());
	}
}
