//! C7 — leaf cert cache: LRU + TTL + single-flight mint dedup (spec §4.8 steps 1 & 3).
//! The single-flight pattern is the spec §9 design note: "a map from hostname to an
//! in-progress future/promise; misses join the existing future or create a new one." The
//! teacher doesn't have a direct counterpart (its XDS client's subscribe-dedup is
//! referenced only in passing), so this is implemented directly against `tokio::sync`
//! primitives — a `tokio::sync::OnceCell` per in-flight hostname gives exactly
//! get-or-init-once semantics without hand-rolling a watch-channel broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::OnceCell;

use super::ca::{CaError, CertAuthority, Leaf};

/// Clock skew tolerance subtracted from `notAfter` before a cached leaf is considered
/// still fresh (spec §4.8 step 1: "now < notAfter - skew").
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

struct Entry {
	leaf: Arc<Leaf>,
	last_used: AtomicU64,
}

/// LRU cache of minted leaves, default capacity 1,024 (spec §5). Lookups race against
/// concurrent mints for the same hostname via `inflight`.
pub struct LeafCertCache {
	ca: CertAuthority,
	capacity: usize,
	clock: AtomicU64,
	evictions: AtomicU64,
	entries: Mutex<HashMap<String, Entry>>,
	inflight: Mutex<HashMap<String, Arc<OnceCell<Arc<Leaf>>>>>,
}

impl LeafCertCache {
	pub fn new(ca: CertAuthority, capacity: usize) -> LeafCertCache {
		LeafCertCache {
			ca,
			capacity,
			clock: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
			entries: Mutex::new(HashMap::new()),
			inflight: Mutex::new(HashMap::new()),
		}
	}

	/// `get_or_mint(hostname) -> Leaf`. Spec §4.8: hit within TTL returns immediately;
	/// otherwise mints once per hostname, with concurrent misses sharing the single
	/// in-flight mint.
	pub async fn get_or_mint(&self, hostname: &str) -> Result<Arc<Leaf>, CaError> {
		if let Some(leaf) = self.hit(hostname) {
			return Ok(leaf);
		}

		let cell = {
			let mut inflight = self.inflight.lock().unwrap();
			inflight.entry(hostname.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
		};

		let result = cell
			.get_or_try_init(|| async {
				let leaf = Arc::new(self.ca.mint_leaf(hostname)?);
				self.insert(hostname, leaf.clone());
				Ok::<_, CaError>(leaf)
			})
			.await
			.map(|leaf| leaf.clone());

		// Whether we succeeded or failed, this hostname's single-flight slot is done;
		// let the next miss (e.g. after eviction, or to retry a failed mint) start fresh.
		// Spec §7 CertificateError: "do not cache negative result".
		self.inflight.lock().unwrap().remove(hostname);

		result
	}

	fn hit(&self, hostname: &str) -> Option<Arc<Leaf>> {
		let entries = self.entries.lock().unwrap();
		let entry = entries.get(hostname)?;
		if OffsetDateTime::now_utc() >= entry.leaf.not_after - EXPIRY_SKEW {
			return None;
		}
		entry.last_used.store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
		Some(entry.leaf.clone())
	}

	fn insert(&self, hostname: &str, leaf: Arc<Leaf>) {
		let mut entries = self.entries.lock().unwrap();
		if entries.len() >= self.capacity && !entries.contains_key(hostname) {
			if let Some(lru_key) = entries.iter().min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed)).map(|(k, _)| k.clone()) {
				entries.remove(&lru_key);
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}
		entries.insert(
			hostname.to_string(),
			Entry { leaf, last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)) },
		);
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Total entries evicted for capacity over the cache's lifetime, for the
	/// `sentrygate_cert_cache_evictions_total` metric (spec §3 metrics list).
	pub fn evictions(&self) -> u64 {
		self.evictions.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc as StdArc;

	use super::*;

	fn ca() -> CertAuthority {
		let dir = std::env::temp_dir().join(format!("sentrygate-cache-test-{}-{}", std::process::id(), line!()));
		std::fs::create_dir_all(&dir).unwrap();
		CertAuthority::load_or_generate(&dir.join("ca-cert.pem"), &dir.join("ca-key.pem")).unwrap()
	}

	#[tokio::test]
	async fn mints_once_and_caches() {
		let cache = LeafCertCache::new(ca(), 1024);
		let a = cache.get_or_mint("api.openai.com").await.unwrap();
		let b = cache.get_or_mint("api.openai.com").await.unwrap();
		assert!(StdArc::ptr_eq(&a, &b));
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn distinct_hosts_get_distinct_leaves() {
		let cache = LeafCertCache::new(ca(), 1024);
		let a = cache.get_or_mint("a.com").await.unwrap();
		let b = cache.get_or_mint("b.com").await.unwrap();
		assert_eq!(a.hostname, "a.com");
		assert_eq!(b.hostname, "b.com");
		assert_eq!(cache.len(), 2);
	}

	#[tokio::test]
	async fn evicts_lru_past_capacity() {
		let cache = LeafCertCache::new(ca(), 2);
		cache.get_or_mint("a.com").await.unwrap();
		cache.get_or_mint("b.com").await.unwrap();
		cache.get_or_mint("a.com").await.unwrap(); // touch a, making b the LRU
		cache.get_or_mint("c.com").await.unwrap(); // evicts b
		assert_eq!(cache.len(), 2);
		let entries = cache.entries.lock().unwrap();
		assert!(entries.contains_key("a.com"));
		assert!(entries.contains_key("c.com"));
		assert!(!entries.contains_key("b.com"));
		drop(entries);
		assert_eq!(cache.evictions(), 1);
	}

	#[tokio::test]
	async fn concurrent_misses_single_flight() {
		let cache = StdArc::new(LeafCertCache::new(ca(), 1024));
		let mut handles = vec![];
		for _ in 0..8 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move { cache.get_or_mint("shared.com").await.unwrap() }));
		}
		let mut leaves = vec![];
		for h in handles {
			leaves.push(h.await.unwrap());
		}
		let first = &leaves[0];
		assert!(leaves.iter().all(|l| StdArc::ptr_eq(l, first)));
	}
}
