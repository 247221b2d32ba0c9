use std::time::Duration;

use thiserror::Error;

/// The §7 error taxonomy. Each variant carries enough context to compute both an HTTP
/// disposition (`status_code`/`retry_after`) and an audit/metrics label (`kind`).
#[derive(Error, Debug)]
pub enum PipelineError {
	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("no rule matched and default action is deny")]
	DomainDenied,

	#[error("rule {rule_id} matched domain but path {path} was not allowed")]
	PathDenied { rule_id: String, path: String },

	#[error("rule {rule_id} matched domain but method {method} was not allowed")]
	MethodDenied { rule_id: String, method: String },

	#[error("rate limit exceeded for rule {rule_id:?}")]
	RateLimited { rule_id: Option<String>, retry_after: Duration },

	#[error("failed to connect upstream: {0}")]
	UpstreamConnect(#[source] std::io::Error),

	#[error("certificate error: {0}")]
	CertificateError(String),

	#[error("connection limit reached")]
	ConnectionLimit,

	#[error("operation timed out")]
	Timeout,

	#[error("malformed request: {0}")]
	ProtocolError(String),
}

impl PipelineError {
	/// The §7 "Kind" label, stable across refactors — used for the `sentrygate_errors_total`
	/// metric and audit records.
	pub fn kind(&self) -> &'static str {
		match self {
			PipelineError::Config(_) => "ConfigError",
			PipelineError::DomainDenied => "DomainDenied",
			PipelineError::PathDenied { .. } => "PathDenied",
			PipelineError::MethodDenied { .. } => "MethodDenied",
			PipelineError::RateLimited { .. } => "RateLimited",
			PipelineError::UpstreamConnect(_) => "UpstreamConnect",
			PipelineError::CertificateError(_) => "CertificateError",
			PipelineError::ConnectionLimit => "ConnectionLimit",
			PipelineError::Timeout => "Timeout",
			PipelineError::ProtocolError(_) => "ProtocolError",
		}
	}

	/// The §7 "Disposition" column, as an HTTP status. `ConnectionLimit` has no single
	/// disposition (TCP close for the tunnel path, 503 for HTTP) — callers on the tunnel
	/// path should check for that variant explicitly before calling this.
	pub fn status_code(&self) -> http::StatusCode {
		use http::StatusCode;
		match self {
			PipelineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
			PipelineError::DomainDenied
			| PipelineError::PathDenied { .. }
			| PipelineError::MethodDenied { .. } => StatusCode::FORBIDDEN,
			PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			PipelineError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
			PipelineError::CertificateError(_) => StatusCode::BAD_GATEWAY,
			PipelineError::ConnectionLimit => StatusCode::SERVICE_UNAVAILABLE,
			PipelineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			PipelineError::ProtocolError(_) => StatusCode::BAD_REQUEST,
		}
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			PipelineError::RateLimited { retry_after, .. } => Some(*retry_after),
			_ => None,
		}
	}
}
