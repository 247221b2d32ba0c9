//! C1 — domain matcher. One compiled matcher per rule's `domain` pattern.
//!
//! Pattern semantics (spec §4.1):
//! * `host.example.com` — exact equality.
//! * `*.example.com` — exactly one additional left label.
//! * `**.example.com` — one or more additional left labels.
//! * Wildcards only ever appear as the leftmost label.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
	Exact(Vec<String>),
	SingleWildcard(Vec<String>),
	MultiWildcard(Vec<String>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainPatternError {
	#[error("empty domain pattern")]
	Empty,
	#[error("wildcard may only appear as the leftmost label: {0}")]
	MisplacedWildcard(String),
}

impl DomainPattern {
	pub fn compile(pattern: &str) -> Result<DomainPattern, DomainPatternError> {
		let normalized = normalize(pattern);
		if normalized.is_empty() {
			return Err(DomainPatternError::Empty);
		}
		let labels: Vec<&str> = normalized.split('.').collect();
		if labels.iter().skip(1).any(|l| *l == "*" || *l == "**") {
			return Err(DomainPatternError::MisplacedWildcard(pattern.to_string()));
		}
		match labels[0] {
			"**" => Ok(DomainPattern::MultiWildcard(owned(&labels[1..]))),
			"*" => Ok(DomainPattern::SingleWildcard(owned(&labels[1..]))),
			_ => Ok(DomainPattern::Exact(owned(&labels))),
		}
	}

	/// Matches a runtime hostname (caller must have applied IDNA already, per spec §4.1).
	pub fn matches(&self, host: &str) -> bool {
		let host_labels: Vec<&str> = normalize(host).split('.').map(|s| s).collect();
		match self {
			DomainPattern::Exact(suffix) => labels_eq(suffix, &host_labels),
			DomainPattern::SingleWildcard(suffix) => {
				host_labels.len() == suffix.len() + 1 && labels_eq(suffix, &host_labels[1..])
			},
			DomainPattern::MultiWildcard(suffix) => {
				host_labels.len() > suffix.len() && labels_eq(suffix, &host_labels[host_labels.len() - suffix.len()..])
			},
		}
	}
}

fn labels_eq(pattern: &[String], host: &[&str]) -> bool {
	pattern.len() == host.len() && pattern.iter().zip(host.iter()).all(|(p, h)| p.eq_ignore_ascii_case(h))
}

fn owned(labels: &[&str]) -> Vec<String> {
	labels.iter().map(|s| s.to_string()).collect()
}

fn normalize(host: &str) -> String {
	let h = host.strip_suffix('.').unwrap_or(host);
	h.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_match() {
		let p = DomainPattern::compile("api.openai.com").unwrap();
		assert!(p.matches("api.openai.com"));
		assert!(p.matches("API.OpenAI.COM"));
		assert!(p.matches("api.openai.com."));
		assert!(!p.matches("sub.api.openai.com"));
		assert!(!p.matches("openai.com"));
	}

	#[test]
	fn single_wildcard_one_label_only() {
		let p = DomainPattern::compile("*.example.com").unwrap();
		assert!(p.matches("a.example.com"));
		assert!(!p.matches("a.b.example.com"));
		assert!(!p.matches("example.com"));
	}

	#[test]
	fn multi_wildcard_one_or_more_labels() {
		let p = DomainPattern::compile("**.example.com").unwrap();
		assert!(p.matches("a.example.com"));
		assert!(p.matches("a.b.example.com"));
		assert!(!p.matches("example.com"));
	}

	#[test]
	fn wildcard_depth_precedence_is_caller_responsibility() {
		// S4: rules [{a, "*.example.com"}, {b, "**.example.com"}], first match wins.
		// x.y.example.com only matches b; x.example.com matches both but a is listed first.
		let a = DomainPattern::compile("*.example.com").unwrap();
		let b = DomainPattern::compile("**.example.com").unwrap();
		assert!(!a.matches("x.y.example.com"));
		assert!(b.matches("x.y.example.com"));
		assert!(a.matches("x.example.com"));
		assert!(b.matches("x.example.com"));
	}

	#[test]
	fn rejects_misplaced_wildcard() {
		assert_eq!(
			DomainPattern::compile("foo.*.com").unwrap_err(),
			DomainPatternError::MisplacedWildcard("foo.*.com".to_string())
		);
	}

	#[test]
	fn rejects_empty() {
		assert_eq!(DomainPattern::compile("").unwrap_err(), DomainPatternError::Empty);
	}
}
