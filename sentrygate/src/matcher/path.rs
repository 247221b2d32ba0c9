//! C3 — path/glob matcher. Each glob is compiled to a `Regex` once per rule, per spec
//! §4.3: `*` matches one path segment, `**` matches any number of segments (including
//! zero), `?` matches a single character.

use regex::Regex;

#[derive(Debug, thiserror::Error)]
#[error("invalid path glob {0:?}: {1}")]
pub struct GlobError(String, regex::Error);

#[derive(Debug, Clone)]
pub struct PathGlob {
	source: String,
	re: Regex,
}

impl PathGlob {
	pub fn compile(glob: &str) -> Result<PathGlob, GlobError> {
		let pattern = format!("(?i)^{}$", glob_to_regex(glob));
		let re = Regex::new(&pattern).map_err(|e| GlobError(glob.to_string(), e))?;
		Ok(PathGlob { source: glob.to_string(), re })
	}

	pub fn matches(&self, path: &str) -> bool {
		self.re.is_match(path)
	}

	pub fn source(&self) -> &str {
		&self.source
	}
}

/// A rule's compiled ordered list of path globs; matches if any compiles and matches.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
	globs: Vec<PathGlob>,
}

impl PathMatcher {
	pub fn compile(patterns: &[String]) -> Result<PathMatcher, GlobError> {
		Ok(PathMatcher { globs: patterns.iter().map(|p| PathGlob::compile(p)).collect::<Result<_, _>>()? })
	}

	pub fn is_empty(&self) -> bool {
		self.globs.is_empty()
	}

	pub fn matches(&self, path: &str) -> bool {
		self.globs.iter().any(|g| g.matches(path))
	}
}

fn glob_to_regex(glob: &str) -> String {
	let mut out = String::with_capacity(glob.len() * 2);
	let mut chars = glob.chars().peekable();
	while let Some(c) = chars.next() {
		match c {
			'*' => {
				if chars.peek() == Some(&'*') {
					chars.next();
					out.push_str(".*");
				} else {
					out.push_str("[^/]*");
				}
			},
			'?' => out.push('.'),
			c => out.push_str(&regex::escape(&c.to_string())),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_star_is_one_segment() {
		let g = PathGlob::compile("/v1/*").unwrap();
		assert!(g.matches("/v1/models"));
		assert!(!g.matches("/v1/models/foo"));
	}

	#[test]
	fn double_star_is_any_segments_including_zero() {
		let g = PathGlob::compile("/v1/**").unwrap();
		assert!(g.matches("/v1/"));
		assert!(g.matches("/v1/models/foo/bar"));
	}

	#[test]
	fn question_mark_is_single_char() {
		let g = PathGlob::compile("/v?/models").unwrap();
		assert!(g.matches("/v1/models"));
		assert!(!g.matches("/v12/models"));
	}

	#[test]
	fn case_insensitive() {
		let g = PathGlob::compile("/V1/Models").unwrap();
		assert!(g.matches("/v1/models"));
	}

	#[test]
	fn literal_dots_are_escaped() {
		let g = PathGlob::compile("/v1.0/models").unwrap();
		assert!(g.matches("/v1.0/models"));
		assert!(!g.matches("/v1X0/models"));
	}

	#[test]
	fn matcher_any_of_ordered_globs() {
		let m = PathMatcher::compile(&["/a/*".to_string(), "/b/**".to_string()]).unwrap();
		assert!(m.matches("/a/x"));
		assert!(m.matches("/b/x/y"));
		assert!(!m.matches("/c/x"));
	}
}
