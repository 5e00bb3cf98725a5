use std::net::SocketAddr;
use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::notify::SseNotifier;
use crate::observability::MetricsRegistry;
use crate::persist::CertificateStore;
use crate::policy::PolicyEngine;
use crate::registry::{ServiceCatalog, TunnelRegistry};
use crate::session::SessionStore;
use crate::tls_utils::PeerIdentity;

/// Application state passed to handlers via Axum's `State` extractor.
///
/// Every field is a shared handle; handlers stay thin and delegate to these
/// components.
#[derive(Clone)]
pub struct AppState {
	pub sessions: Arc<SessionStore>,
	pub policy: Arc<PolicyEngine>,
	pub registry: Arc<TunnelRegistry>,
	pub catalog: Arc<ServiceCatalog>,
	pub notifier: Arc<SseNotifier>,
	pub audit: Arc<AuditLogger>,
	pub certificates: Arc<dyn CertificateStore>,
	pub metrics: Arc<MetricsRegistry>,
	/// Data-plane address advertised in tunnel-created events so AH agents
	/// know where to dial their relay half.
	pub controller_addr: String,
}

/// Per-connection metadata injected as a request extension by the TLS
/// accept loop: the socket peer address plus, when the connection was
/// mutually authenticated, the verified client identity.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
	pub peer_addr: SocketAddr,
	pub identity: Option<PeerIdentity>,
}
