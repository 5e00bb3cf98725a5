use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::rustls::server::{
	AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient,
};
use tokio_rustls::rustls::{
	self, Certificate, ClientConfig, PrivateKey, RootCertStore, server::ServerConfig,
};

/// Errors produced while loading or inspecting TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
	#[error("failed to open {path}: {source}")]
	Open {
		path: String,
		source: std::io::Error,
	},

	#[error("failed to parse PEM in {0}")]
	Pem(String),

	#[error("no certificates found in {0}")]
	NoCerts(String),

	#[error("no private key found in {0}")]
	NoKey(String),

	#[error("failed to parse x509 certificate: {0}")]
	X509(String),

	#[error("certificate has no Common Name")]
	NoCommonName,

	#[error("peer presented no certificate")]
	MissingPeerCert,

	#[error("certificate is outside its validity window")]
	CertExpired,

	#[error("invalid TLS configuration: {0}")]
	Config(String),
}

/// Load PEM-encoded certificates from `path` and return them as `rustls::Certificate`.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
	let f = File::open(path).map_err(|e| TlsError::Open {
		path: path.display().to_string(),
		source: e,
	})?;
	let mut reader = BufReader::new(f);
	let raw = rustls_pemfile::certs(&mut reader)
		.map_err(|_| TlsError::Pem(path.display().to_string()))?;
	if raw.is_empty() {
		return Err(TlsError::NoCerts(path.display().to_string()));
	}
	Ok(raw.into_iter().map(Certificate).collect())
}

/// Load a private key (PKCS#8 preferred, RSA fallback) from `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsError> {
	// Try PKCS#8 first
	let f = File::open(path).map_err(|e| TlsError::Open {
		path: path.display().to_string(),
		source: e,
	})?;
	let mut reader = BufReader::new(&f);
	let pks = rustls_pemfile::pkcs8_private_keys(&mut reader)
		.map_err(|_| TlsError::Pem(path.display().to_string()))?;
	if let Some(k) = pks.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	// PKCS#8 not found; try RSA
	let f = File::open(path).map_err(|e| TlsError::Open {
		path: path.display().to_string(),
		source: e,
	})?;
	let mut reader = BufReader::new(f);
	let rs = rustls_pemfile::rsa_private_keys(&mut reader)
		.map_err(|_| TlsError::Pem(path.display().to_string()))?;
	if let Some(k) = rs.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	Err(TlsError::NoKey(path.display().to_string()))
}

/// Parse the DER-encoded certificate bytes and return the x509 parser's `X509Certificate`.
pub fn parse_first_cert_x509<'a>(
	cert: &'a Certificate,
) -> Result<x509_parser::certificate::X509Certificate<'a>, TlsError> {
	let res = x509_parser::parse_x509_certificate(&cert.0)
		.map_err(|e| TlsError::X509(format!("{:?}", e)))?;
	Ok(res.1)
}

/// Return the first Common Name (CN) from the subject, if present.
pub fn first_common_name(cert: &Certificate) -> Result<Option<String>, TlsError> {
	let parsed = parse_first_cert_x509(cert)?;

	for cn in parsed.subject().iter_common_name() {
		if let Ok(s) = cn.as_str() {
			return Ok(Some(s.to_string()));
		}
	}

	Ok(None)
}

/// Compute the canonical fingerprint of a certificate:
/// `"sha256:" + hex(SHA256(DER))` over the leaf bytes.
pub fn fingerprint(cert: &Certificate) -> String {
	let digest = Sha256::digest(&cert.0);
	format!("sha256:{}", hex::encode(digest))
}

/// Return `(not_before, not_after)` of the certificate as Unix seconds.
pub fn validity_window(cert: &Certificate) -> Result<(i64, i64), TlsError> {
	let parsed = parse_first_cert_x509(cert)?;
	let validity = parsed.validity();
	Ok((
		validity.not_before.timestamp(),
		validity.not_after.timestamp(),
	))
}

/// Fail with `CertExpired` unless `now` falls inside the certificate's
/// `[NotBefore, NotAfter]` window.
pub fn validate_expiry(cert: &Certificate) -> Result<(), TlsError> {
	let (not_before, not_after) = validity_window(cert)?;
	let now = chrono::Utc::now().timestamp();
	if now < not_before || now > not_after {
		return Err(TlsError::CertExpired);
	}
	Ok(())
}

/// Identity of a TLS peer, derived from its verified leaf certificate at
/// handshake time. The client id is the leaf's Common Name; the fingerprint
/// is stable across reconnects of the same certificate.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
	pub client_id: String,
	pub fingerprint: String,
	pub not_before: i64,
	pub not_after: i64,
}

/// Derive a `PeerIdentity` from the first certificate a peer presented.
pub fn peer_identity(certs: &[Certificate]) -> Result<PeerIdentity, TlsError> {
	let leaf = certs.first().ok_or(TlsError::MissingPeerCert)?;
	let client_id = first_common_name(leaf)?.ok_or(TlsError::NoCommonName)?;
	let (not_before, not_after) = validity_window(leaf)?;
	Ok(PeerIdentity {
		client_id,
		fingerprint: fingerprint(leaf),
		not_before,
		not_after,
	})
}

/// A loaded keypair plus an optional CA bundle, shared by both planes.
///
/// The CA bundle plays a double role: the server side uses it to require and
/// verify client certificates, and the client side uses it as the trust root
/// for the controller's own certificate.
pub struct TlsIdentity {
	certs: Vec<Certificate>,
	key: PrivateKey,
	ca: Option<Vec<Certificate>>,
}

impl TlsIdentity {
	/// Load certificate, key, and optional CA bundle from PEM files.
	pub fn load(
		cert_path: &Path,
		key_path: &Path,
		ca_path: Option<&Path>,
	) -> Result<Self, TlsError> {
		let certs = load_certs(cert_path)?;
		let key = load_private_key(key_path)?;
		let ca = match ca_path {
			Some(p) => Some(load_certs(p)?),
			None => None,
		};
		Ok(Self { certs, key, ca })
	}

	pub fn has_ca(&self) -> bool {
		self.ca.is_some()
	}

	/// Fingerprint of the leaf certificate.
	pub fn fingerprint(&self) -> String {
		fingerprint(&self.certs[0])
	}

	/// `NotAfter` of the leaf certificate as Unix seconds.
	pub fn not_after(&self) -> Result<i64, TlsError> {
		Ok(validity_window(&self.certs[0])?.1)
	}

	/// Fail with `CertExpired` unless the leaf is currently valid.
	pub fn validate_expiry(&self) -> Result<(), TlsError> {
		validate_expiry(&self.certs[0])
	}

	fn ca_root_store(&self) -> Result<RootCertStore, TlsError> {
		let ca = self
			.ca
			.as_ref()
			.ok_or_else(|| TlsError::Config("no CA bundle configured".to_string()))?;
		let mut roots = RootCertStore::empty();
		for cert in ca {
			roots
				.add(cert)
				.map_err(|e| TlsError::Config(format!("bad CA certificate: {:?}", e)))?;
		}
		Ok(roots)
	}

	/// Build the control-plane server config. When a CA bundle is
	/// configured, presented client certificates are verified against it,
	/// but a certificate-less connection is still accepted so the bare
	/// health probe works; per-route identity checks happen above TLS.
	pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
		let builder = ServerConfig::builder()
			.with_safe_default_cipher_suites()
			.with_safe_default_kx_groups()
			.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
			.map_err(|e| TlsError::Config(format!("protocol versions: {:?}", e)))?;

		let cfg = match &self.ca {
			Some(_) => {
				let roots = self.ca_root_store()?;
				builder
					.with_client_cert_verifier(
						AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed(),
					)
					.with_single_cert(self.certs.clone(), self.key.clone())
			}
			None => builder
				.with_no_client_auth()
				.with_single_cert(self.certs.clone(), self.key.clone()),
		}
		.map_err(|e| TlsError::Config(format!("server config: {}", e)))?;

		Ok(Arc::new(cfg))
	}

	/// Build a server config that requires and verifies client
	/// certificates. Used by the data-plane relay, which refuses to run
	/// without mutual authentication.
	pub fn server_config_mutual(&self) -> Result<Arc<ServerConfig>, TlsError> {
		let roots = self.ca_root_store().map_err(|_| {
			TlsError::Config("mutual TLS requires a CA bundle".to_string())
		})?;
		let cfg = ServerConfig::builder()
			.with_safe_default_cipher_suites()
			.with_safe_default_kx_groups()
			.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
			.map_err(|e| TlsError::Config(format!("protocol versions: {:?}", e)))?
			.with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
			.with_single_cert(self.certs.clone(), self.key.clone())
			.map_err(|e| TlsError::Config(format!("server config: {}", e)))?;
		Ok(Arc::new(cfg))
	}

	/// Build a client config presenting this identity, trusting the CA
	/// bundle. Used by the data-plane client SDK and the AH agent.
	pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
		let roots = self.ca_root_store()?;
		let cfg = ClientConfig::builder()
			.with_safe_default_cipher_suites()
			.with_safe_default_kx_groups()
			.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
			.map_err(|e| TlsError::Config(format!("protocol versions: {:?}", e)))?
			.with_root_certificates(roots)
			.with_client_auth_cert(self.certs.clone(), self.key.clone())
			.map_err(|e| TlsError::Config(format!("client config: {}", e)))?;
		Ok(Arc::new(cfg))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_certs_missing_path_returns_err() {
		let p = Path::new("/this/path/does/not/exist/cert.pem");
		assert!(load_certs(p).is_err());
	}

	#[test]
	fn load_key_missing_path_returns_err() {
		let p = Path::new("/this/path/does/not/exist/key.pem");
		assert!(load_private_key(p).is_err());
	}

	#[test]
	fn fingerprint_is_prefixed_hex() {
		let cert = Certificate(vec![0u8; 16]);
		let fp = fingerprint(&cert);
		assert!(fp.starts_with("sha256:"));
		// 32 bytes of digest, two hex chars each
		assert_eq!(fp.len(), "sha256:".len() + 64);
	}

	#[test]
	fn fingerprint_is_stable() {
		let cert = Certificate(b"identical bytes".to_vec());
		assert_eq!(fingerprint(&cert), fingerprint(&cert));
	}

	#[test]
	fn peer_identity_requires_a_certificate() {
		let err = peer_identity(&[]).unwrap_err();
		assert!(matches!(err, TlsError::MissingPeerCert));
	}
}
