//! C13 — audit + metrics sink (spec §4.12, §6 "Sink interface"). The pipeline calls these
//! methods on the hot path; none of them may block beyond a short critical section, per
//! spec §5 ("the sink may drop under backpressure but never blocks the hot path"). Grounded
//! on `management/metrics_server.rs`'s `prometheus_client::registry::Registry` usage for
//! the metric shapes, and on the teacher's many small `RequestLog`-style structs for the
//! audit record shape — here collapsed to one struct since this system has one request
//! type, not agentgateway's route/listener/bind hierarchy.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum ConnKind {
	Tunnel,
	Mitm,
	Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum Direction {
	Upstream,
	Downstream,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct RequestLabels {
	decision: &'static str,
	rule: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct RuleLabel {
	rule: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ConnLabels {
	kind: ConnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
struct DirectionLabels {
	direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ErrorLabels {
	kind: String,
}

/// Spec §3 "Decision record", serialized to the audit log (JSON lines, spec §6 "Persisted
/// state") when file destination is enabled and always emitted as a `tracing` event.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
	pub allowed: bool,
	pub matched_rule_id: Option<String>,
	pub reason: String,
	pub host: String,
	pub source_ip: Option<IpAddr>,
	pub rate_limit_remaining: Option<f64>,
	pub retry_after_ms: Option<u64>,
	pub timestamp_ms: u64,
}

/// The concrete metrics taxonomy (SPEC_FULL §A.6). One instance is owned by the process
/// and shared (via `Arc`) across every connection task and the admin `/metrics` route.
pub struct Audit {
	requests_total: Family<RequestLabels, Counter>,
	rate_limited_total: Family<RuleLabel, Counter>,
	active_connections: Family<ConnLabels, Gauge>,
	bytes_total: Family<DirectionLabels, Counter>,
	errors_total: Family<ErrorLabels, Counter>,
	cert_cache_size: Gauge,
	cert_cache_evictions_total: Counter,
	/// Mirrors the subset of the above counters `GET /stats` reports as a plain JSON
	/// snapshot, since summing `Family` maps on every admin request would be wasteful.
	stats: StatsCounters,
}

impl Audit {
	pub fn new(registry: &mut Registry) -> Audit {
		let requests_total = Family::<RequestLabels, Counter>::default();
		let rate_limited_total = Family::<RuleLabel, Counter>::default();
		let active_connections = Family::<ConnLabels, Gauge>::default();
		let bytes_total = Family::<DirectionLabels, Counter>::default();
		let errors_total = Family::<ErrorLabels, Counter>::default();
		let cert_cache_size = Gauge::default();
		let cert_cache_evictions_total = Counter::default();

		registry.register("sentrygate_requests_total", "Total proxied requests by decision and matched rule", requests_total.clone());
		registry.register("sentrygate_rate_limited_total", "Requests denied by the rate limiter", rate_limited_total.clone());
		registry.register("sentrygate_active_connections", "Currently open connections by handler kind", active_connections.clone());
		registry.register("sentrygate_bytes_total", "Bytes relayed by direction", bytes_total.clone());
		registry.register("sentrygate_errors_total", "Pipeline errors by taxonomy kind", errors_total.clone());
		registry.register("sentrygate_cert_cache_size", "Entries currently held in the leaf cert cache", cert_cache_size.clone());
		registry.register(
			"sentrygate_cert_cache_evictions_total",
			"Leaf certs evicted from the cache (LRU or expiry)",
			cert_cache_evictions_total.clone(),
		);

		Audit {
			requests_total,
			rate_limited_total,
			active_connections,
			bytes_total,
			errors_total,
			cert_cache_size,
			cert_cache_evictions_total,
			stats: StatsCounters::new(),
		}
	}

	/// Spec §6 `audit(record)`. Emitted as a structured `tracing` event; a JSON-lines file
	/// sink can subscribe to this via a `tracing-appender` layer if configured (not wired up
	/// by default — §1 treats log backends as out of scope beyond the interface).
	pub fn audit(&self, record: &DecisionRecord) {
		info!(
			allowed = record.allowed,
			matched_rule_id = record.matched_rule_id.as_deref(),
			reason = %record.reason,
			host = %record.host,
			source_ip = record.source_ip.map(|ip| ip.to_string()),
			"decision"
		);
	}

	pub fn record_request(&self, allowed: bool, rule_id: Option<&str>) {
		let decision = if allowed { "allowed" } else { "denied" };
		self
			.requests_total
			.get_or_create(&RequestLabels { decision, rule: rule_id.unwrap_or("<default>").to_string() })
			.inc();
		self.stats.record_request(allowed);
	}

	pub fn record_rate_limit_hit(&self, rule_id: Option<&str>) {
		self.rate_limited_total.get_or_create(&RuleLabel { rule: rule_id.unwrap_or("<default>").to_string() }).inc();
		self.stats.record_rate_limit_hit();
	}

	pub fn record_bytes(&self, direction: Direction, n: u64) {
		self.bytes_total.get_or_create(&DirectionLabels { direction }).inc_by(n);
	}

	pub fn record_error(&self, kind: &str) {
		self.errors_total.get_or_create(&ErrorLabels { kind: kind.to_string() }).inc();
	}

	pub fn inc_active_connections(&self, kind: ConnKind) {
		self.active_connections.get_or_create(&ConnLabels { kind }).inc();
		self.stats.set_active_connections(self.total_active_connections());
	}

	pub fn dec_active_connections(&self, kind: ConnKind) {
		self.active_connections.get_or_create(&ConnLabels { kind }).dec();
		self.stats.set_active_connections(self.total_active_connections());
	}

	fn total_active_connections(&self) -> u64 {
		[ConnKind::Tunnel, ConnKind::Mitm, ConnKind::Forward]
			.iter()
			.map(|kind| self.active_connections.get_or_create(&ConnLabels { kind: *kind }).get().max(0) as u64)
			.sum()
	}

	pub fn set_cert_cache_size(&self, size: i64) {
		self.cert_cache_size.set(size);
		self.stats.set_cert_cache_size(size.max(0) as u64);
	}

	pub fn inc_cert_cache_evictions(&self) {
		self.cert_cache_evictions_total.inc();
	}

	/// Snapshot for `GET /stats` (spec §6).
	pub fn stats(&self) -> StatsSnapshot {
		self.stats.snapshot()
	}
}

pub fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// `/stats` JSON snapshot (spec §6). Deliberately narrower than the full Prometheus
/// exposition — just the counters an operator would script against.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
	pub requests_allowed: u64,
	pub requests_denied: u64,
	pub rate_limited: u64,
	pub active_connections: u64,
	pub cert_cache_size: u64,
}

/// Tracks the handful of raw counters `/stats` reports, separately from the Prometheus
/// registry (whose `Family` maps aren't cheap to sum on every admin request). A short
/// mutex is acceptable here: `/stats` is an operator-facing admin route, not the hot path.
#[derive(Default)]
pub struct StatsCounters(Mutex<StatsSnapshot>);

impl StatsCounters {
	pub fn new() -> StatsCounters {
		StatsCounters::default()
	}

	pub fn record_request(&self, allowed: bool) {
		let mut s = self.0.lock().unwrap();
		if allowed {
			s.requests_allowed += 1;
		} else {
			s.requests_denied += 1;
		}
	}

	pub fn record_rate_limit_hit(&self) {
		self.0.lock().unwrap().rate_limited += 1;
	}

	pub fn set_active_connections(&self, n: u64) {
		self.0.lock().unwrap().active_connections = n;
	}

	pub fn set_cert_cache_size(&self, n: u64) {
		self.0.lock().unwrap().cert_cache_size = n;
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		self.0.lock().unwrap().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_panicking() {
		let mut registry = Registry::default();
		let audit = Audit::new(&mut registry);
		audit.record_request(true, Some("openai"));
		audit.record_rate_limit_hit(Some("openai"));
		audit.record_bytes(Direction::Upstream, 1024);
		audit.record_error("DomainDenied");
		audit.inc_active_connections(ConnKind::Tunnel);
		audit.dec_active_connections(ConnKind::Tunnel);
		audit.set_cert_cache_size(3);
		audit.inc_cert_cache_evictions();

		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
		assert!(buf.contains("sentrygate_requests_total"));
		assert!(buf.contains("sentrygate_cert_cache_size"));
	}

	#[test]
	fn stats_counters_snapshot() {
		let counters = StatsCounters::new();
		counters.record_request(true);
		counters.record_request(false);
		counters.record_rate_limit_hit();
		counters.set_active_connections(2);
		counters.set_cert_cache_size(5);
		let snap = counters.snapshot();
		assert_eq!(snap.requests_allowed, 1);
		assert_eq!(snap.requests_denied, 1);
		assert_eq!(snap.rate_limited, 1);
		assert_eq!(snap.active_connections, 2);
		assert_eq!(snap.cert_cache_size, 5);
	}
}
