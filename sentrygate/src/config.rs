//! CLI parsing and allowlist file I/O (SPEC_FULL §A.1, §A.2). Grounded on the teacher's
//! root `src/main.rs` (`clap::Parser`, `#[arg(...)]` fields) for the CLI shape, and on the
//! workspace's `serde_path_to_error` dependency for JSON schema errors that point at the
//! exact offending field — useful for an allowlist file operators hand-edit.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::policy::{ConfigError, RawConfig, Snapshot};

/// Spec §6 "CLI", plus the ambient flags SPEC_FULL §A.1 adds (`--log-format`, CA paths,
/// timeouts) that the distilled wire contract doesn't name but a runnable binary needs.
#[derive(Debug, Clone, Parser)]
#[command(name = "sentrygate", about = "Egress HTTP(S) allowlist proxy")]
pub struct Args {
	/// Path to the JSON allowlist file (spec §6).
	#[arg(long, default_value = "./config/allowlist.json")]
	pub config: PathBuf,

	/// Listener port (spec §6).
	#[arg(long, default_value_t = 8080)]
	pub port: u16,

	/// Listener bind address (spec §6).
	#[arg(long, default_value = "127.0.0.1")]
	pub host: IpAddr,

	/// Proxy mode: tunnel (CONNECT-only) or mitm (full inspection). Spec §6.
	#[arg(long, value_enum, default_value_t = CliProxyMode::Tunnel)]
	pub mode: CliProxyMode,

	/// Admin listener port on 127.0.0.1; omit to disable the admin surface (spec §6).
	#[arg(long)]
	pub admin_port: Option<u16>,

	/// Enable the config file watcher / hot-reloader (spec C12, §6).
	#[arg(long)]
	pub watch: bool,

	/// Log output format; ambient, not part of the wire contract (SPEC_FULL §A.1).
	#[arg(long, value_enum, default_value_t = CliLogFormat::Plain)]
	pub log_format: CliLogFormat,

	/// Path to the CA certificate PEM (spec §6 "Persisted state").
	#[arg(long, default_value = "./config/ca-cert.pem")]
	pub ca_cert: PathBuf,

	/// Path to the CA private key PEM (spec §6 "Persisted state").
	#[arg(long, default_value = "./config/ca-key.pem")]
	pub ca_key: PathBuf,

	/// Upstream dial timeout in milliseconds (spec §5 resource ceiling, default 30s).
	#[arg(long, default_value_t = 30_000)]
	pub dial_timeout_ms: u64,

	/// Per-connection idle timeout in milliseconds (spec §5, default 300s).
	#[arg(long, default_value_t = 300_000)]
	pub idle_timeout_ms: u64,

	/// Leaf-certificate cache capacity (spec §5, default 1,024).
	#[arg(long, default_value_t = 1024)]
	pub cert_cache_capacity: usize,

	/// Max concurrent connections per source IP (spec §5, default 100).
	#[arg(long, default_value_t = 100)]
	pub max_conns_per_ip: usize,

	/// Max total concurrent connections (spec §5, default 10,000).
	#[arg(long, default_value_t = 10_000)]
	pub max_total_conns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliProxyMode {
	Tunnel,
	Mitm,
}

impl From<CliProxyMode> for crate::proxy::ProxyMode {
	fn from(m: CliProxyMode) -> crate::proxy::ProxyMode {
		match m {
			CliProxyMode::Tunnel => crate::proxy::ProxyMode::Tunnel,
			CliProxyMode::Mitm => crate::proxy::ProxyMode::Mitm,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogFormat {
	Plain,
	Json,
}

impl From<CliLogFormat> for core::telemetry::LogFormat {
	fn from(f: CliLogFormat) -> core::telemetry::LogFormat {
		match f {
			CliLogFormat::Plain => core::telemetry::LogFormat::Plain,
			CliLogFormat::Json => core::telemetry::LogFormat::Json,
		}
	}
}

/// Reads and schema-validates the allowlist file (spec §6 "Unknown fields are rejected;
/// duplicate ids are rejected"). `serde_path_to_error` gives field-path-accurate messages;
/// duplicate-id/domain/path/IP validation happens in `Snapshot::compile`.
pub fn load_raw_config(path: &Path) -> Result<RawConfig, ConfigError> {
	let text = std::fs::read_to_string(path)?;
	let de = &mut serde_json::Deserializer::from_str(&text);
	serde_path_to_error::deserialize(de).map_err(ConfigError::from)
}

/// Loads and compiles the allowlist file into a `Snapshot` in one step, used both for the
/// initial startup load and every subsequent reload (`reload.rs`).
pub fn load_and_compile(path: &Path) -> Result<Snapshot, ConfigError> {
	let raw = load_raw_config(path)?;
	Snapshot::compile(&raw)
}
