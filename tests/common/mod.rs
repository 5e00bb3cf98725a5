/// Common test utilities: a throwaway CA, role-named leaf certificates, and
/// a controller started on ephemeral ports with in-memory repositories.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use vanopticon_bifrost::config::Settings;
use vanopticon_bifrost::observability::MetricsRegistry;
use vanopticon_bifrost::policy::Policy;
use vanopticon_bifrost::registry::{ServiceConfig, ServiceProtocol, ServiceStatus};
use vanopticon_bifrost::tls_utils::TlsIdentity;
use vanopticon_bifrost::{ControllerHandle, start_controller};

/// A test CA plus the tempdir all PEM material is written into.
pub struct TestCa {
	ca: Certificate,
	pub dir: tempfile::TempDir,
	pub ca_path: PathBuf,
}

impl TestCa {
	pub fn new() -> Self {
		let mut params = CertificateParams::new(Vec::<String>::new());
		params
			.distinguished_name
			.push(DnType::CommonName, "bifrost-test-ca");
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		let ca = Certificate::from_params(params).expect("generate CA");

		let dir = tempfile::tempdir().expect("tempdir");
		let ca_path = dir.path().join("ca.pem");
		std::fs::write(&ca_path, ca.serialize_pem().expect("CA PEM")).expect("write CA");

		Self { ca, dir, ca_path }
	}

	/// Issue a CA-signed leaf for `cn`, valid for localhost connections.
	/// Returns the written (cert, key) paths.
	pub fn issue(&self, cn: &str) -> (PathBuf, PathBuf) {
		let mut params =
			CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]);
		params.distinguished_name.push(DnType::CommonName, cn);
		let cert = Certificate::from_params(params).expect("generate leaf");

		let cert_pem = cert
			.serialize_pem_with_signer(&self.ca)
			.expect("sign leaf");
		let key_pem = cert.serialize_private_key_pem();

		let cert_path = self.dir.path().join(format!("{}.pem", cn));
		let key_path = self.dir.path().join(format!("{}.key", cn));
		std::fs::write(&cert_path, cert_pem).expect("write cert");
		std::fs::write(&key_path, key_pem).expect("write key");
		(cert_path, key_path)
	}

	/// Load a leaf as a `TlsIdentity` trusting this CA.
	pub fn identity(&self, cert: &Path, key: &Path) -> TlsIdentity {
		TlsIdentity::load(cert, key, Some(self.ca_path.as_path())).expect("load identity")
	}
}

/// Start a controller on ephemeral ports with in-memory repositories.
pub async fn start_test_controller(ca: &TestCa) -> ControllerHandle {
	start_test_controller_with(ca, |_| {}).await
}

/// `start_test_controller` with a settings customizer, for tests that need
/// short timeouts or tight limits.
pub async fn start_test_controller_with(
	ca: &TestCa,
	customize: impl FnOnce(&mut Settings),
) -> ControllerHandle {
	let (cert, key) = ca.issue("bifrost-controller");
	let mut settings = Settings::default();
	settings.host = "127.0.0.1".to_string();
	settings.port = 0;
	settings.relay_port = 0;
	settings.tls_cert = Some(cert.display().to_string());
	settings.tls_key = Some(key.display().to_string());
	settings.tls_ca = Some(ca.ca_path.display().to_string());
	settings.audit_log_path = ca
		.dir
		.path()
		.join("audit.jsonl")
		.display()
		.to_string();
	customize(&mut settings);

	start_controller(settings, Arc::new(MetricsRegistry::new()))
		.await
		.expect("controller starts")
}

/// An HTTPS client presenting `cn`'s certificate, trusting the test CA, and
/// resolving `localhost` to the controller.
pub fn https_client(ca: &TestCa, cert: &Path, key: &Path, addr: std::net::SocketAddr) -> reqwest::Client {
	let mut identity_pem = std::fs::read(cert).expect("read cert");
	identity_pem.extend_from_slice(&std::fs::read(key).expect("read key"));
	let ca_pem = std::fs::read(&ca.ca_path).expect("read CA");

	reqwest::Client::builder()
		.use_rustls_tls()
		.identity(reqwest::Identity::from_pem(&identity_pem).expect("identity"))
		.add_root_certificate(reqwest::Certificate::from_pem(&ca_pem).expect("CA cert"))
		.resolve("localhost", addr)
		.build()
		.expect("client")
}

/// A permissive policy for `client_id` on `service_id`.
pub fn allow_policy(client_id: &str, service_id: &str) -> Policy {
	Policy {
		policy_id: format!("allow-{}-{}", client_id, service_id),
		client_id: client_id.to_string(),
		service_id: service_id.to_string(),
		bandwidth_limit: None,
		concurrency_limit: None,
		expiry_time: None,
		conditions: Vec::new(),
		created_at: Utc::now(),
		updated_at: Utc::now(),
	}
}

/// A service config pointing at a local target.
pub fn demo_service(service_id: &str, target_port: u16) -> ServiceConfig {
	ServiceConfig {
		service_id: service_id.to_string(),
		service_name: format!("{} service", service_id),
		target_host: "127.0.0.1".to_string(),
		target_port,
		protocol: ServiceProtocol::Tcp,
		status: ServiceStatus::Active,
		created_at: Utc::now(),
		updated_at: Utc::now(),
		metadata: HashMap::new(),
	}
}
