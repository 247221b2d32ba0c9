use std::time::Duration;

pub use internal::{
	DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Upgrader as DrainUpgrader,
	Watch as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new pair for draining.
/// * `DrainTrigger` starts a drain and waits for it to complete.
/// * `DrainWatcher` is held by anything that wants to participate in the drain. It can be
///   cloned; a drain will not complete until all outstanding watchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = internal::channel();
	(tx, rx)
}

/// Runs a future with graceful shutdown/draining support. The constructed future receives
/// a `DrainWatcher` (holding it marks the task as active and blocks shutdown) and a
/// `force_shutdown` watch that fires once the graceful deadline has elapsed.
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F)
where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(component, "drain started, waiting {:?} for connections to complete", deadline);
			if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!(component, "drain duration expired with pending connections, forcefully shutting down");
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);

		let signal = Signal { drained_rx, signal_tx };
		let watch = Watch { drained_tx, signal_rx };
		(signal, watch)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command. All instances must be dropped for `Signal::start_drain_and_wait`
	/// to complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[derive(Clone)]
	pub struct Weak {
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	pub struct Upgrader {
		drained_tx: Option<mpsc::Sender<Never>>,
	}

	impl Upgrader {
		pub fn disable(&mut self) {
			self.drained_tx = None;
		}

		pub fn upgrade(&self, other: Weak) -> Watch {
			let drained_tx = self.drained_tx.clone().unwrap_or_else(|| {
				let (tx, _) = mpsc::channel(1);
				tx
			});
			Watch { drained_tx, signal_rx: other.signal_rx }
		}
	}

	impl Watch {
		pub fn into_weak(self) -> (Upgrader, Weak) {
			let Self { drained_tx, signal_rx } = self;
			(Upgrader { drained_tx: Some(drained_tx) }, Weak { signal_rx })
		}
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the runtime"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		/// Waits for all `Watch` instances to be dropped.
		pub async fn closed(&mut self) {
			self.signal_tx.closed().await;
		}

		pub fn count(&self) -> usize {
			self.signal_tx.receiver_count()
		}

		/// Signals all watchers to begin draining and waits for all handles to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Returns a `ReleaseShutdown` handle after a drain has been signaled. The handle must
		/// be dropped once the caller's shutdown action has completed.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted it is_some"))
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for ReleaseShutdown {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("ReleaseShutdown").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use crate::drain;
	use crate::drain::DrainMode::Graceful;

	#[tokio::test]
	async fn test_drain_blocks_until_watchers_drop() {
		let (trigger, watcher) = drain::new();
		let completed = Arc::new(AtomicUsize::new(0));
		let (dummy_tx, _) = tokio::sync::broadcast::channel::<()>(1);

		for i in 1..=3 {
			let mut rx = dummy_tx.subscribe();
			let completed = completed.clone();
			let watcher = watcher.clone();
			tokio::spawn(async move {
				tokio::time::sleep(std::time::Duration::from_millis(i * 5)).await;
				let _ = rx.recv().await;
				let blocker = watcher.wait_for_drain().await;
				completed.fetch_add(1, Ordering::SeqCst);
				drop(blocker);
			});
		}
		drop(watcher);

		assert_eq!(completed.load(Ordering::SeqCst), 0);
		let _ = dummy_tx.send(());

		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => panic!("timeout"),
			_ = trigger.start_drain_and_wait(Graceful) => {
				assert_eq!(completed.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn test_weak() {
		let (trigger, watcher) = drain::new();
		let (mut upgrader, weak) = watcher.into_weak();
		let weak2 = weak.clone();
		let (_, mut weak2_rx) = tokio::sync::broadcast::channel::<()>(1);
		tokio::task::spawn(async move {
			weak2_rx.recv().await.unwrap();
			weak2
		});
		let strong = upgrader.upgrade(weak);
		let (strong_tx, mut strong_rx) = tokio::sync::broadcast::channel::<()>(1);
		tokio::task::spawn(async move {
			strong_rx.recv().await.unwrap();
			strong
		});

		let wait = trigger.start_drain_and_wait(Graceful);
		tokio::pin!(wait);
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {},
			_ = &mut wait => panic!("drain should not have completed"),
		}
		strong_tx.send(()).unwrap();
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {},
			_ = &mut wait => panic!("drain should not have completed"),
		}
		upgrader.disable();
		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(10)) => panic!("timeout"),
			_ = &mut wait => {}
		}
	}
}
