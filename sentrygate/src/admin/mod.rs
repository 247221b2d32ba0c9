//! Admin HTTP surface (SPEC_FULL §A.5): `GET /healthz`, `GET /metrics`, `GET /stats`.
//! Narrower than the teacher's `management/admin.rs` (no `/debug/pprof`,
//! `/quitquitquit`, `/config_dump`) since those are XDS-control-plane and profiling
//! concerns this proxy doesn't have; the route-dispatch shape and the `/metrics` handler
//! are grounded on `management/metrics_server.rs::handle_metrics`.

pub mod hyper_helpers;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use core::drain::DrainWatcher;
use core::readiness::Ready;
use core::telemetry::APPLICATION_START_TIME;
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;

use self::hyper_helpers::Response;
use crate::audit::Audit;

struct AdminState {
	registry: Mutex<Registry>,
	audit: Arc<Audit>,
	ready: Ready,
}

/// Binds and spawns the admin listener. Runs for the lifetime of the `drain` watcher.
pub async fn serve(addr: SocketAddr, drain: DrainWatcher, registry: Registry, audit: Arc<Audit>, ready: Ready) -> anyhow::Result<SocketAddr> {
	let state = AdminState { registry: Mutex::new(registry), audit, ready };
	let server = hyper_helpers::Server::bind("admin", addr, drain, state).await?;
	let bound = server.address();
	server.spawn(|state, req| async move { route(state, req).await });
	Ok(bound)
}

async fn route(state: Arc<AdminState>, req: Request<Incoming>) -> Response {
	match (req.method(), req.uri().path()) {
		(&http::Method::GET, "/healthz") => healthz(&state),
		(&http::Method::GET, "/metrics") => metrics(&state),
		(&http::Method::GET, "/stats") => stats(&state),
		_ => hyper_helpers::empty_response(StatusCode::NOT_FOUND),
	}
}

#[derive(Serialize)]
struct HealthBody {
	status: &'static str,
	ready: bool,
	uptime: u64,
}

fn healthz(state: &AdminState) -> Response {
	let body = HealthBody { status: "ok", ready: state.ready.pending().is_empty(), uptime: APPLICATION_START_TIME.elapsed().as_secs() };
	let json = serde_json::to_vec(&body).unwrap_or_default();
	hyper_helpers::plaintext_response(StatusCode::OK, "application/json", json)
}

fn metrics(state: &AdminState) -> Response {
	let mut buf = String::new();
	let registry = state.registry.lock().unwrap_or_else(|e| e.into_inner());
	if let Err(e) = encode(&mut buf, &registry) {
		return hyper_helpers::plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string());
	}
	hyper_helpers::plaintext_response(StatusCode::OK, "text/plain; version=0.0.4", buf)
}

fn stats(state: &AdminState) -> Response {
	let snapshot = state.audit.stats();
	let json = serde_json::to_vec(&snapshot).unwrap_or_default();
	hyper_helpers::plaintext_response(StatusCode::OK, "application/json", json)
}
