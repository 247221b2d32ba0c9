//! C7 — MITM TLS: CA bootstrap, per-host leaf minting, and the `rustls` accept/connect
//! glue the MITM interceptor (C9) needs. Grounded on the teacher's
//! `transport/tls.rs::{provider, accept}`, adapted from `tokio_rustls` + `aws_lc_rs` to
//! this workspace's declared `rustls` feature set (`ring`, confirmed in the workspace
//! `Cargo.toml`).

pub mod ca;
pub mod cache;

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;

pub use ca::{CertAuthority, CaError};
pub use cache::LeafCertCache;

/// The crypto provider used for both the MITM client-facing acceptor and the
/// upstream-facing connector. `ring` per the workspace's `rustls` feature selection.
pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("tls handshake error: {0}")]
	Handshake(#[source] std::io::Error),
	#[error(transparent)]
	Ca(#[from] CaError),
}

/// Accepts a client TLS connection using a per-connection `ServerConfig` built from a
/// freshly minted leaf (spec §4.10 step 6). One `ServerConfig` per accept rather than a
/// shared one keyed by SNI resolver, since the leaf cache (§4.8) already handles reuse
/// and this keeps the rustls-facing code a plain `TlsAcceptor::accept`.
pub async fn accept<IO>(io: IO, cfg: Arc<ServerConfig>) -> Result<tokio_rustls::server::TlsStream<IO>, TlsError>
where
	IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	tokio_rustls::TlsAcceptor::from(cfg)
		.accept(io)
		.await
		.map_err(TlsError::Handshake)
}

/// Builds the upstream-facing `rustls::ClientConfig`, trusting the system root store
/// (spec §6 "on upstream side use the system trust store").
pub fn client_config() -> Result<Arc<rustls::ClientConfig>, CaError> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	let cfg = rustls::ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.map_err(|e| CaError::Tls(e.to_string()))?
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(Arc::new(cfg))
}
