//! C5 — rate limiter. Token bucket per `(ruleId, clientIp)`, continuous lazy refill
//! (spec §4.6). Forked in spirit from `localratelimit.rs`'s atomic-CAS bucket, but this
//! system needs fractional continuous refill rather than discrete interval refill, so the
//! bucket state (tokens, last refill instant) lives behind one short mutex per bucket
//! instead of a pair of atomics — simpler, and still "CAS or short mutex" per spec §4.6.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::policy::RawRateLimit;

/// The result of a `consume`/`peek` call (spec §4.6 `consume(...) -> {allowed, remaining,
/// resetMs, limit}`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeResult {
	pub allowed: bool,
	pub remaining: f64,
	pub reset_ms: u64,
	pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Params {
	capacity: f64,
	rate_per_sec: f64,
	limit: u32,
}

impl Params {
	fn from_config(cfg: &RawRateLimit) -> Params {
		Params {
			capacity: (cfg.requests_per_minute + cfg.burst_allowance) as f64,
			rate_per_sec: cfg.requests_per_minute as f64 / 60.0,
			limit: cfg.requests_per_minute,
		}
	}
}

struct BucketState {
	tokens: f64,
	last_refill: Instant,
}

struct Bucket {
	params: Params,
	state: Mutex<BucketState>,
}

impl Bucket {
	fn new(params: Params) -> Bucket {
		Bucket { params, state: Mutex::new(BucketState { tokens: params.capacity, last_refill: Instant::now() }) }
	}

	fn refill_locked(&self, state: &mut BucketState, now: Instant) {
		let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
		if elapsed <= 0.0 {
			return;
		}
		state.tokens = (state.tokens + elapsed * self.params.rate_per_sec).min(self.params.capacity);
		state.last_refill = now;
	}

	fn consume(&self, n: f64) -> ConsumeResult {
		let now = Instant::now();
		let mut state = self.state.lock().unwrap();
		self.refill_locked(&mut state, now);
		if state.tokens >= n {
			state.tokens -= n;
			ConsumeResult { allowed: true, remaining: state.tokens, reset_ms: 0, limit: self.params.limit }
		} else {
			let deficit = n - state.tokens;
			let reset_ms = if self.params.rate_per_sec > 0.0 {
				(deficit / self.params.rate_per_sec * 1000.0).ceil() as u64
			} else {
				u64::MAX
			};
			ConsumeResult { allowed: false, remaining: state.tokens, reset_ms, limit: self.params.limit }
		}
	}

	fn peek(&self) -> ConsumeResult {
		let now = Instant::now();
		let mut state = self.state.lock().unwrap();
		self.refill_locked(&mut state, now);
		ConsumeResult { allowed: state.tokens >= 1.0, remaining: state.tokens, reset_ms: 0, limit: self.params.limit }
	}

	fn reset(&self) {
		let mut state = self.state.lock().unwrap();
		state.tokens = self.params.capacity;
		state.last_refill = Instant::now();
	}

	fn idle_for(&self) -> Duration {
		self.state.lock().unwrap().last_refill.elapsed()
	}
}

/// A key identifying one bucket: the matched rule id (`None` for the snapshot-wide
/// default limiter) plus the client IP.
type BucketKey = (Option<String>, IpAddr);

/// Owns every `(ruleId, clientIp)` bucket live for one policy snapshot's lifetime. Map
/// resize is guarded by a short mutex (spec §5); per-bucket token math happens under that
/// bucket's own mutex, so concurrent `consume` calls for different keys don't contend.
#[derive(Default)]
pub struct RateLimiter {
	buckets: Mutex<HashMap<BucketKey, Arc<Bucket>>>,
}

impl RateLimiter {
	pub fn new() -> RateLimiter {
		RateLimiter { buckets: Mutex::new(HashMap::new()) }
	}

	fn bucket_for(&self, key: BucketKey, cfg: &RawRateLimit) -> Arc<Bucket> {
		let params = Params::from_config(cfg);
		let mut buckets = self.buckets.lock().unwrap();
		buckets
			.entry(key)
			.and_modify(|b| {
				// Rule config changed shape under reload (same id, different limit):
				// rebuild rather than silently keep stale capacity/rate.
				if b.params.limit != params.limit || (b.params.capacity - params.capacity).abs() > f64::EPSILON {
					*b = Arc::new(Bucket::new(params));
				}
			})
			.or_insert_with(|| Arc::new(Bucket::new(params)))
			.clone()
	}

	/// Spec §4.6 `consume(key, ruleId?)`. `cfg` is the matched rule's `rateLimit`, or the
	/// snapshot's `defaultRateLimit` for unmatched/unconfigured requests. `None` means
	/// unlimited: always admits.
	pub fn consume(&self, ip: IpAddr, rule_id: Option<&str>, cfg: Option<&RawRateLimit>) -> ConsumeResult {
		let Some(cfg) = cfg else {
			return ConsumeResult { allowed: true, remaining: f64::INFINITY, reset_ms: 0, limit: u32::MAX };
		};
		let bucket = self.bucket_for((rule_id.map(str::to_string), ip), cfg);
		bucket.consume(1.0)
	}

	pub fn peek(&self, ip: IpAddr, rule_id: Option<&str>, cfg: Option<&RawRateLimit>) -> ConsumeResult {
		let Some(cfg) = cfg else {
			return ConsumeResult { allowed: true, remaining: f64::INFINITY, reset_ms: 0, limit: u32::MAX };
		};
		let bucket = self.bucket_for((rule_id.map(str::to_string), ip), cfg);
		bucket.peek()
	}

	pub fn reset(&self, ip: IpAddr, rule_id: Option<&str>) {
		let key = (rule_id.map(str::to_string), ip);
		if let Some(bucket) = self.buckets.lock().unwrap().get(&key) {
			bucket.reset();
		}
	}

	/// Drops buckets idle longer than `max_idle`. Not spec-mandated by name, but §3's
	/// lifecycle note ("may be reaped after idleness") needs a concrete hook; the reloader
	/// calls this opportunistically on each debounced reload.
	pub fn reap_idle(&self, max_idle: Duration) {
		self.buckets.lock().unwrap().retain(|_, b| b.idle_for() < max_idle);
	}

	pub fn len(&self) -> usize {
		self.buckets.lock().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use std::net::{IpAddr, Ipv4Addr};
	use std::thread::sleep;

	use super::*;

	fn ip() -> IpAddr {
		IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
	}

	fn cfg(rpm: u32, burst: u32) -> RawRateLimit {
		RawRateLimit { requests_per_minute: rpm, burst_allowance: burst, algorithm: Default::default() }
	}

	#[test]
	fn admits_up_to_limit_then_denies_s5() {
		let rl = RateLimiter::new();
		let c = cfg(2, 0);
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		let third = rl.consume(ip(), Some("r"), Some(&c));
		assert!(!third.allowed);
		assert!(third.reset_ms >= 1000);
	}

	#[test]
	fn burst_allows_extra_admissions() {
		let rl = RateLimiter::new();
		let c = cfg(1, 2);
		// capacity 3: three should succeed immediately even at rpm=1.
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		assert!(!rl.consume(ip(), Some("r"), Some(&c)).allowed);
	}

	#[test]
	fn refills_over_time() {
		let rl = RateLimiter::new();
		let c = cfg(600, 0); // 10 tokens/sec
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		// drain to zero
		loop {
			if !rl.consume(ip(), Some("r"), Some(&c)).allowed {
				break;
			}
		}
		sleep(Duration::from_millis(150));
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
	}

	#[test]
	fn unconfigured_is_unlimited() {
		let rl = RateLimiter::new();
		for _ in 0..50 {
			assert!(rl.consume(ip(), Some("r"), None).allowed);
		}
	}

	#[test]
	fn distinct_ips_have_independent_buckets() {
		let rl = RateLimiter::new();
		let c = cfg(1, 0);
		let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
		let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
		assert!(rl.consume(a, Some("r"), Some(&c)).allowed);
		assert!(!rl.consume(a, Some("r"), Some(&c)).allowed);
		assert!(rl.consume(b, Some("r"), Some(&c)).allowed);
	}

	#[test]
	fn reset_restores_capacity() {
		let rl = RateLimiter::new();
		let c = cfg(1, 0);
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
		assert!(!rl.consume(ip(), Some("r"), Some(&c)).allowed);
		rl.reset(ip(), Some("r"));
		assert!(rl.consume(ip(), Some("r"), Some(&c)).allowed);
	}

	#[test]
	fn reap_idle_drops_stale_buckets() {
		let rl = RateLimiter::new();
		let c = cfg(10, 0);
		rl.consume(ip(), Some("r"), Some(&c));
		assert_eq!(rl.len(), 1);
		rl.reap_idle(Duration::from_millis(0));
		assert_eq!(rl.len(), 0);
	}
}
