//! Process entry point. Grounded on the teacher's root `src/main.rs` / `agentgateway-app`
//! binary shape (`clap::Parser` args, `telemetry::setup_logging`, `core::signal::Shutdown`
//! + `core::drain` pair, `readiness::Ready`, admin server spawned alongside the data-plane
//! accept loop) but collapsed onto one `#[tokio::main]` runtime rather than the teacher's
//! separate data-plane thread pool — this proxy has no XDS control plane to keep off the
//! hot-path runtime, so the split isn't warranted here (recorded simplification).

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use core::drain;
use core::readiness::Ready;
use core::signal::Shutdown;
use prometheus_client::registry::Registry;
use sentrygate::admin;
use sentrygate::audit::Audit;
use sentrygate::config::{self, Args};
use sentrygate::connlimit::ConnLimitGate;
use sentrygate::policy::PolicyHandle;
use sentrygate::proxy::{self, ProxyMode, ProxyState};
use sentrygate::ratelimit::RateLimiter;
use sentrygate::reload::Reloader;
use sentrygate::tls::{CertAuthority, LeafCertCache};
use tracing::{error, info, warn};

fn main() -> ExitCode {
	let args = Args::parse();
	let _log_flush = core::telemetry::setup_logging(args.log_format.into());

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start tokio runtime: {e}");
			return ExitCode::from(1);
		},
	};

	match runtime.block_on(run(args)) {
		Ok(()) => ExitCode::from(0),
		Err(e) => {
			error!(error = %e, "fatal startup error");
			ExitCode::from(1)
		},
	}
}

async fn run(args: Args) -> anyhow::Result<()> {
	info!(config = %args.config.display(), port = args.port, mode = ?args.mode, "starting sentrygate");

	let mode: ProxyMode = args.mode.into();
	let snapshot = config::load_and_compile(&args.config)?;
	let policy = Arc::new(PolicyHandle::new(snapshot));

	let mut registry = Registry::default();
	let audit = Arc::new(Audit::new(&mut registry));

	let conn_limit = Arc::new(ConnLimitGate::new(args.max_conns_per_ip, args.max_total_conns));
	let rate_limiter = Arc::new(RateLimiter::new());
	let upstream_tls = sentrygate::tls::client_config()?;

	let cert_cache = if mode == ProxyMode::Mitm {
		let ca = CertAuthority::load_or_generate(&args.ca_cert, &args.ca_key)?;
		Some(LeafCertCache::new(ca, args.cert_cache_capacity))
	} else {
		None
	};

	let state = Arc::new(ProxyState {
		mode,
		policy: policy.clone(),
		rate_limiter: rate_limiter.clone(),
		conn_limit: conn_limit.clone(),
		audit: audit.clone(),
		cert_cache,
		upstream_tls,
		dial_timeout: std::time::Duration::from_millis(args.dial_timeout_ms),
		idle_timeout: std::time::Duration::from_millis(args.idle_timeout_ms),
		cert_cache_evictions_seen: std::sync::atomic::AtomicU64::new(0),
	});

	let shutdown = Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = Ready::new();

	let _reloader = if args.watch {
		let task = ready.register_task("config watcher");
		let reloader = Reloader::spawn(args.config.clone(), policy.clone(), audit.clone(), rate_limiter.clone())?;
		drop(task);
		Some(reloader)
	} else {
		None
	};

	if let Some(admin_port) = args.admin_port {
		let admin_addr = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), admin_port);
		let bound = admin::serve(admin_addr, drain_rx.clone(), registry, audit.clone(), ready.clone()).await?;
		info!(address = %bound, "admin listener bound");
	}

	let bind_addr = SocketAddr::new(args.host, args.port);
	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;
	info!(address = %listener.local_addr().unwrap_or(bind_addr), "proxy listener bound");

	let proxy_task = ready.register_task("proxy accept loop");
	let accept_drain = drain_rx.clone();
	tokio::spawn(accept_loop(state, listener, conn_limit, accept_drain, proxy_task));

	shutdown.wait().await;
	info!("shutdown signal received, draining connections");
	drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
	info!("shutdown complete");
	Ok(())
}

/// Spec §2 data flow: TCP accept -> C6 gate -> dispatch. Runs until the drain watcher
/// signals; in-flight connections are handed their own `ConnGuard`/task and are not
/// forcibly severed by the accept loop exiting (spec §5 "graceful... wait for in-flight
/// tasks... up to a bounded drain window").
async fn accept_loop(
	state: Arc<ProxyState>,
	listener: tokio::net::TcpListener,
	conn_limit: Arc<ConnLimitGate>,
	drain_rx: drain::DrainWatcher,
	ready_task: core::readiness::BlockReady,
) {
	drop(ready_task);
	loop {
		let accept = tokio::select! {
			biased;
			_ = drain_rx.clone().wait_for_drain() => break,
			accept = listener.accept() => accept,
		};
		let (stream, peer) = match accept {
			Ok(pair) => pair,
			Err(e) => {
				warn!(error = %e, "accept error, continuing");
				continue;
			},
		};
		let client_ip = proxy::peer_ip(peer);

		if let Err(reason) = conn_limit.can_accept(client_ip) {
			tracing::debug!(ip = %client_ip, ?reason, "connection-limit gate denied accept");
			drop(stream);
			continue;
		}
		let _ = stream.set_nodelay(true);
		let guard = conn_limit.track(client_ip);
		let state = state.clone();
		let drain_rx = drain_rx.clone();
		tokio::spawn(async move {
			let _guard = guard;
			let _drain = drain_rx;
			proxy::serve_connection(state, stream, client_ip).await;
		});
	}
	info!("proxy accept loop drained");
}
