//! C12 — config watcher / reloader (spec §4.13). Watches the allowlist file's parent
//! directory with `notify`'s recommended (inotify/FSEvents/ReadDirectoryChanges) backend and
//! hand-rolls the debounce rather than reaching for `notify-debouncer-full`: the spec's
//! wording ("on any event, restart a timer; on expiry, read + parse + validate" and
//! `forceReload` "cancels" the pending timer) maps directly onto a single `tokio::select!`
//! loop holding an optional deadline, which also gives `force_reload` real cancel-the-timer
//! semantics a wrapped debouncer crate wouldn't expose. No corpus example uses a file-watch
//! crate at all (grep across the pack turned up nothing beyond unrelated `tokio::sync::Notify`
//! uses and an unrelated `sd_notify` systemd binding) — this module is written directly
//! against `notify`'s documented API, noted in DESIGN.md as lacking direct grounding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};

use crate::audit::Audit;
use crate::config;
use crate::policy::PolicyHandle;
use crate::ratelimit::RateLimiter;

const DEBOUNCE: Duration = Duration::from_millis(300);
/// Spec §3 lifecycle note ("may be reaped after idleness"): buckets untouched for longer
/// than this are dropped on each debounced reload cycle, piggybacking on a timer that
/// already exists rather than running a separate one.
const BUCKET_IDLE_REAP: Duration = Duration::from_secs(600);

/// Handle kept alive for the lifetime of the watch; dropping it stops the background task
/// (the `notify::Watcher` it owns is torn down when the task's local drops).
pub struct Reloader {
	force_tx: mpsc::UnboundedSender<()>,
	_watcher: RecommendedWatcher,
}

impl Reloader {
	/// Starts watching `path`'s parent directory and spawns the debounce/reload task. Editors
	/// commonly replace a file via rename-into-place, which only a directory watch observes
	/// reliably (a direct file watch can silently stop firing after the inode changes).
	pub fn spawn(path: PathBuf, policy: Arc<PolicyHandle>, audit: Arc<Audit>, rate_limiter: Arc<RateLimiter>) -> notify::Result<Reloader> {
		let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
		let (force_tx, force_rx) = mpsc::unbounded_channel::<()>();

		let watch_target = path.clone();
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			if let Ok(event) = res {
				if event.paths.iter().any(|p| p == &watch_target) {
					let _ = event_tx.send(());
				}
			}
		})?;
		let watch_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
		watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

		tokio::spawn(run(path, policy, audit, rate_limiter, event_rx, force_rx));

		Ok(Reloader { force_tx, _watcher: watcher })
	}

	/// Spec §4.13: "A `forceReload()` bypasses the debounce." Cancels any pending debounce
	/// timer and reloads immediately.
	pub fn force_reload(&self) {
		let _ = self.force_tx.send(());
	}
}

async fn run(path: PathBuf, policy: Arc<PolicyHandle>, audit: Arc<Audit>, rate_limiter: Arc<RateLimiter>, mut event_rx: mpsc::UnboundedReceiver<()>, mut force_rx: mpsc::UnboundedReceiver<()>) {
	let mut last_mtime = mtime(&path);
	let mut deadline: Option<Instant> = None;

	loop {
		let sleep_until_deadline = async {
			match deadline {
				Some(d) => sleep_until(d).await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			biased;
			msg = force_rx.recv() => {
				let Some(()) = msg else { break };
				deadline = None;
				reload_once(&path, &policy, &audit, &mut last_mtime).await;
				rate_limiter.reap_idle(BUCKET_IDLE_REAP);
			}
			msg = event_rx.recv() => {
				let Some(()) = msg else { break };
				// Spec §4.13: "on any event, restart a timer" — each event pushes the deadline
				// out another 300ms rather than racing the first event's timer.
				deadline = Some(Instant::now() + DEBOUNCE);
			}
			_ = sleep_until_deadline => {
				deadline = None;
				reload_once(&path, &policy, &audit, &mut last_mtime).await;
				rate_limiter.reap_idle(BUCKET_IDLE_REAP);
			}
		}
	}
}

/// Spec §4.13: "An mtime comparison suppresses spurious re-reads." On a valid reload the new
/// snapshot is published by atomic swap; on an invalid one the previous snapshot is kept and
/// the failure goes to the audit sink (spec §7 `ConfigError` table: "on reload: log and keep
/// previous snapshot").
async fn reload_once(path: &Path, policy: &Arc<PolicyHandle>, audit: &Arc<Audit>, last_mtime: &mut Option<SystemTime>) {
	let current = mtime(path);
	if current == *last_mtime {
		return;
	}
	*last_mtime = current;

	match config::load_and_compile(path) {
		Ok(snapshot) => {
			policy.store(snapshot);
			tracing::info!(path = %path.display(), "policy reloaded");
		},
		Err(e) => {
			audit.record_error("ConfigError");
			tracing::warn!(path = %path.display(), error = %e, "config reload failed, keeping previous snapshot");
		},
	}
}

fn mtime(path: &Path) -> Option<SystemTime> {
	std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;
	use crate::policy::Snapshot;

	fn write_config(path: &Path, body: &str) {
		let mut f = std::fs::File::create(path).unwrap();
		f.write_all(body.as_bytes()).unwrap();
	}

	const VALID: &str = r#"{"mode":"strict","defaultAction":"deny","rules":[]}"#;
	const INVALID: &str = r#"{"mode":"strict","defaultAction":"deny","rules":[{"id":"bad id","domain":"*.com"}]}"#;

	#[tokio::test]
	async fn reload_once_swaps_snapshot_on_valid_change() {
		let dir = std::env::temp_dir().join(format!("sentrygate-reload-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("allowlist.json");
		write_config(&path, VALID);

		let snapshot = Snapshot::compile(&config::load_raw_config(&path).unwrap()).unwrap();
		let policy = Arc::new(PolicyHandle::new(snapshot));
		let mut registry = prometheus_client::registry::Registry::default();
		let audit = Arc::new(Audit::new(&mut registry));

		let mut last_mtime = mtime(&path);
		// No change yet: reload_once should be a no-op (same mtime).
		reload_once(&path, &policy, &audit, &mut last_mtime).await;
		assert_eq!(policy.load().rules.len(), 0);

		std::thread::sleep(std::time::Duration::from_millis(10));
		write_config(&path, r#"{"mode":"strict","defaultAction":"deny","rules":[{"id":"a","domain":"a.com"}]}"#);
		reload_once(&path, &policy, &audit, &mut last_mtime).await;
		assert_eq!(policy.load().rules.len(), 1);

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn reload_once_keeps_previous_snapshot_on_invalid_change() {
		let dir = std::env::temp_dir().join(format!("sentrygate-reload-test-invalid-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("allowlist.json");
		write_config(&path, VALID);

		let snapshot = Snapshot::compile(&config::load_raw_config(&path).unwrap()).unwrap();
		let policy = Arc::new(PolicyHandle::new(snapshot));
		let mut registry = prometheus_client::registry::Registry::default();
		let audit = Arc::new(Audit::new(&mut registry));
		let mut last_mtime = mtime(&path);

		std::thread::sleep(std::time::Duration::from_millis(10));
		write_config(&path, INVALID);
		reload_once(&path, &policy, &audit, &mut last_mtime).await;
		// Still the original, empty-rules snapshot: the invalid write was rejected.
		assert_eq!(policy.load().rules.len(), 0);

		let _ = std::fs::remove_dir_all(&dir);
	}
}
