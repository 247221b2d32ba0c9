//! C7 — CA bootstrap and per-host leaf minting (spec §4.8). Grounded on
//! `other_examples/.../mitm.rs`'s `generate_ca`/`load_or_create_ca`/
//! `issue_host_certificate_pem` shape, ported from that file's `rcgen_rama` fork to this
//! workspace's real `rcgen = "0.13"` dependency, and wired into `rustls::ServerConfig`
//! instead of a `rama` `TlsAcceptorData`. CSR/SAN field conventions cross-checked against
//! `control/caclient.rs::csr::generate`, which uses the same `rcgen` API family
//! (`CertificateParams`, `SanType`, `KeyPair::generate_for`).

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
	KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

const CA_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 30;
const LEAF_BACKDATE_MINUTES: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
	#[error("failed to read CA material at {path}: {source}")]
	Io { path: PathBuf, #[source] source: std::io::Error },
	#[error("only one of ca-cert/ca-key exists on disk; refusing to guess which is stale")]
	PartialCaMaterial,
	#[error("failed to generate or sign certificate: {0}")]
	Rcgen(String),
	#[error("tls configuration error: {0}")]
	Tls(String),
}

impl From<rcgen::Error> for CaError {
	fn from(e: rcgen::Error) -> CaError {
		CaError::Rcgen(e.to_string())
	}
}

/// A minted leaf certificate (spec §3 "Leaf-cert entry") plus the `rustls::ServerConfig`
/// built from it, ready to hand to `tokio_rustls::TlsAcceptor`.
pub struct Leaf {
	pub hostname: String,
	pub not_after: OffsetDateTime,
	pub server_config: Arc<ServerConfig>,
}

/// The local root CA: an in-memory signing keypair plus the PEM material persisted to
/// disk under operator-specified paths (spec §6 "Persisted state").
pub struct CertAuthority {
	issuer: Issuer<'static, KeyPair>,
}

impl CertAuthority {
	/// Loads CA material from `cert_path`/`key_path` if both exist, else generates a new
	/// CA and persists it. Spec §4.8 step 0 ("On start, load or generate a self-signed
	/// CA").
	pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<CertAuthority, CaError> {
		let cert_exists = cert_path.exists();
		let key_exists = key_path.exists();
		if cert_exists != key_exists {
			return Err(CaError::PartialCaMaterial);
		}
		if cert_exists && key_exists {
			let cert_pem = std::fs::read_to_string(cert_path).map_err(|source| CaError::Io { path: cert_path.to_path_buf(), source })?;
			let key_pem = std::fs::read_to_string(key_path).map_err(|source| CaError::Io { path: key_path.to_path_buf(), source })?;
			let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Rcgen(e.to_string()))?;
			let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).map_err(|e| CaError::Rcgen(e.to_string()))?;
			return Ok(CertAuthority { issuer });
		}
		let (cert_pem, key_pem, key) = generate_ca()?;
		persist(cert_path, &cert_pem)?;
		persist(key_path, &key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).map_err(|e| CaError::Rcgen(e.to_string()))?;
		Ok(CertAuthority { issuer })
	}

	/// Mints a fresh leaf for `hostname` (spec §4.8 step 2). The SAN set contains exactly
	/// this hostname (invariant in spec §3) — `IP:` if it parses as a literal address,
	/// `DNS:` otherwise.
	pub fn mint_leaf(&self, hostname: &str) -> Result<Leaf, CaError> {
		let now = OffsetDateTime::now_utc();
		let not_before = now - TimeDuration::minutes(LEAF_BACKDATE_MINUTES);
		let not_after = now + TimeDuration::days(LEAF_VALIDITY_DAYS);

		let mut params = if let Ok(ip) = hostname.parse::<IpAddr>() {
			let mut p = CertificateParams::new(Vec::<String>::new())?;
			p.subject_alt_names = vec![SanType::IpAddress(ip)];
			p
		} else {
			CertificateParams::new(vec![hostname.to_string()])?
		};
		params.not_before = not_before;
		params.not_after = not_after;
		params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, hostname);
		params.distinguished_name = dn;

		let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let cert = params.signed_by(&key_pair, &self.issuer)?;

		let cert_der = CertificateDer::from(cert.der().to_vec());
		let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
		let server_config = build_server_config(cert_der, key_der)?;

		Ok(Leaf { hostname: hostname.to_string(), not_after, server_config: Arc::new(server_config) })
	}
}

fn build_server_config(cert_der: CertificateDer<'static>, key_der: PrivatePkcs8KeyDer<'static>) -> Result<ServerConfig, CaError> {
	let cfg = ServerConfig::builder_with_provider(super::provider())
		.with_safe_default_protocol_versions()
		.map_err(|e| CaError::Tls(e.to_string()))?
		.with_no_client_auth()
		.with_single_cert(vec![cert_der], key_der.into())
		.map_err(|e| CaError::Tls(e.to_string()))?;
	Ok(cfg)
}

fn generate_ca() -> Result<(String, String, KeyPair), CaError> {
	let mut params = CertificateParams::default();
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
	params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(CA_VALIDITY_DAYS);
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "sentrygate MITM CA");
	params.distinguished_name = dn;

	let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
	let cert = params.self_signed(&key_pair)?;
	Ok((cert.pem(), key_pair.serialize_pem(), key_pair))
}

fn random_serial() -> [u8; 16] {
	let mut bytes = [0u8; 16];
	rand::rng().fill_bytes(&mut bytes);
	bytes
}

fn persist(path: &Path, contents: &str) -> Result<(), CaError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(|source| CaError::Io { path: parent.to_path_buf(), source })?;
	}
	std::fs::write(path, contents).map_err(|source| CaError::Io { path: path.to_path_buf(), source })?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generate_and_mint_roundtrip() {
		let (cert_pem, key_pem, key) = generate_ca().unwrap();
		assert!(cert_pem.contains("BEGIN CERTIFICATE"));
		assert!(key_pem.contains("BEGIN PRIVATE KEY") || key_pem.contains("BEGIN EC PRIVATE KEY"));
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).unwrap();
		let ca = CertAuthority { issuer };
		let leaf = ca.mint_leaf("api.openai.com").unwrap();
		assert_eq!(leaf.hostname, "api.openai.com");
		assert!(leaf.not_after > OffsetDateTime::now_utc());
	}

	#[test]
	fn mints_ip_literal_san() {
		let (cert_pem, _key_pem, key) = generate_ca().unwrap();
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).unwrap();
		let ca = CertAuthority { issuer };
		let leaf = ca.mint_leaf("127.0.0.1").unwrap();
		assert_eq!(leaf.hostname, "127.0.0.1");
	}

	#[test]
	fn load_or_generate_persists_and_reloads() {
		let dir = std::env::temp_dir().join(format!("sentrygate-ca-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let cert_path = dir.join("ca-cert.pem");
		let key_path = dir.join("ca-key.pem");
		let _ = std::fs::remove_file(&cert_path);
		let _ = std::fs::remove_file(&key_path);

		let ca1 = CertAuthority::load_or_generate(&cert_path, &key_path).unwrap();
		assert!(cert_path.exists());
		assert!(key_path.exists());
		let _leaf1 = ca1.mint_leaf("example.com").unwrap();

		let ca2 = CertAuthority::load_or_generate(&cert_path, &key_path).unwrap();
		let _leaf2 = ca2.mint_leaf("example.com").unwrap();

		let _ = std::fs::remove_dir_all(&dir);
	}
}
