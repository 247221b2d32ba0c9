//! C6 — connection-limit gate. Caps concurrent connections per source IP and globally
//! (spec §4.7). Pattern grounded on the counters-under-short-mutex style used throughout
//! the teacher (e.g. `client/dns.rs`'s guarded circular buffer): atomic totals, a
//! `Mutex<HashMap<IpAddr, usize>>` for the per-IP breakdown.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
	PerIpLimit,
	TotalLimit,
}

/// The gate. `max_per_ip` / `max_total` are the §5 resource ceilings
/// (`maxConcurrentConnectionsPerIp` default 100, `maxTotalConnections` default 10,000).
pub struct ConnLimitGate {
	max_per_ip: usize,
	max_total: usize,
	total: AtomicUsize,
	per_ip: Mutex<HashMap<IpAddr, usize>>,
}

impl ConnLimitGate {
	pub fn new(max_per_ip: usize, max_total: usize) -> ConnLimitGate {
		ConnLimitGate { max_per_ip, max_total, total: AtomicUsize::new(0), per_ip: Mutex::new(HashMap::new()) }
	}

	/// `canAccept(ip) -> {allowed, reason?}`. Does not itself reserve a slot — pair with
	/// [`ConnLimitGate::track`] once the caller has decided to proceed.
	pub fn can_accept(&self, ip: IpAddr) -> Result<(), DenyReason> {
		if self.total.load(Ordering::Acquire) >= self.max_total {
			return Err(DenyReason::TotalLimit);
		}
		let per_ip = self.per_ip.lock().unwrap();
		if per_ip.get(&ip).copied().unwrap_or(0) >= self.max_per_ip {
			return Err(DenyReason::PerIpLimit);
		}
		Ok(())
	}

	/// Increments counters and returns a guard whose `Drop` releases them exactly once,
	/// idempotently, regardless of whether the caller explicitly drops it, lets it go out
	/// of scope on an early return, or the connection errors.
	pub fn track(self: &Arc<Self>, ip: IpAddr) -> ConnGuard {
		self.total.fetch_add(1, Ordering::AcqRel);
		*self.per_ip.lock().unwrap().entry(ip).or_insert(0) += 1;
		ConnGuard { gate: self.clone(), ip, released: false }
	}

	pub fn total(&self) -> usize {
		self.total.load(Ordering::Acquire)
	}

	pub fn per_ip_count(&self, ip: IpAddr) -> usize {
		self.per_ip.lock().unwrap().get(&ip).copied().unwrap_or(0)
	}

	/// Spec §3 invariant: "the global connection count equals the sum of per-IP counts at
	/// all times" — exposed for tests, not used on the hot path.
	pub fn invariant_holds(&self) -> bool {
		let sum: usize = self.per_ip.lock().unwrap().values().sum();
		sum == self.total.load(Ordering::Acquire)
	}

	fn release(&self, ip: IpAddr) {
		self.total.fetch_sub(1, Ordering::AcqRel);
		let mut per_ip = self.per_ip.lock().unwrap();
		if let Some(count) = per_ip.get_mut(&ip) {
			*count -= 1;
			if *count == 0 {
				per_ip.remove(&ip);
			}
		}
	}
}

/// Released on `close`, `error`, or explicit `cleanup` — here, on `Drop`, which covers all
/// three since every exit path (including panics unwound via `?`) drops the guard exactly
/// once.
#[must_use = "dropping this immediately releases the connection slot"]
pub struct ConnGuard {
	gate: Arc<ConnLimitGate>,
	ip: IpAddr,
	released: bool,
}

impl ConnGuard {
	/// Explicit early release; idempotent with the `Drop` impl.
	pub fn cleanup(mut self) {
		self.release();
	}

	fn release(&mut self) {
		if !self.released {
			self.released = true;
			self.gate.release(self.ip);
		}
	}
}

impl Drop for ConnGuard {
	fn drop(&mut self) {
		self.release();
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn ip(n: u8) -> IpAddr {
		IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
	}

	#[test]
	fn denies_over_per_ip_limit() {
		let gate = Arc::new(ConnLimitGate::new(2, 100));
		let _g1 = gate.track(ip(1));
		let _g2 = gate.track(ip(1));
		assert_eq!(gate.can_accept(ip(1)), Err(DenyReason::PerIpLimit));
		assert_eq!(gate.can_accept(ip(2)), Ok(()));
	}

	#[test]
	fn denies_over_total_limit() {
		let gate = Arc::new(ConnLimitGate::new(100, 1));
		let _g1 = gate.track(ip(1));
		assert_eq!(gate.can_accept(ip(2)), Err(DenyReason::TotalLimit));
	}

	#[test]
	fn release_is_idempotent_and_drop_safe() {
		let gate = Arc::new(ConnLimitGate::new(1, 1));
		{
			let guard = gate.track(ip(1));
			assert_eq!(gate.total(), 1);
			guard.cleanup();
			assert_eq!(gate.total(), 0);
		}
		assert_eq!(gate.total(), 0);
		assert!(gate.invariant_holds());
	}

	#[test]
	fn invariant_sum_equals_total() {
		let gate = Arc::new(ConnLimitGate::new(100, 100));
		let guards: Vec<_> = (0..5).map(|i| gate.track(ip(i))).collect();
		assert!(gate.invariant_holds());
		drop(guards);
		assert!(gate.invariant_holds());
		assert_eq!(gate.total(), 0);
	}
}
