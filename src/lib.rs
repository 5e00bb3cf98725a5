pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod notify;
pub mod observability;
pub mod persist;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod session;
pub mod state;
pub mod tls_utils;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Extension;
use axum::http::header::HeaderName;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::Settings;
use crate::notify::SseNotifier;
use crate::observability::MetricsRegistry;
use crate::persist::{
	CertificateStore, MemoryCertificateStore, MemoryServiceStore, ServiceStore,
};
use crate::policy::{
	DefaultEvaluator, MemoryPolicyStore, NoGeoResolver, PolicyEngine, PolicyStore,
};
use crate::registry::{ServiceCatalog, TunnelRegistry};
use crate::relay::{RelayConfig, RelayServer};
use crate::session::SessionStore;
use crate::state::{AppState, ConnectionMeta};
use crate::tls_utils::TlsIdentity;

/// Grace given to in-flight control-plane connections at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Attempts and backoff for the initial database connection; a container
/// database may come up after the controller does.
const DB_CONNECT_RETRIES: u32 = 10;
const DB_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// A running controller: both planes bound, background sweeps started.
pub struct ControllerHandle {
	pub state: AppState,
	pub http_addr: SocketAddr,
	pub relay_addr: SocketAddr,
	shutdown_tx: watch::Sender<bool>,
}

impl ControllerHandle {
	/// Subscribe to the controller's shutdown signal.
	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown_tx.subscribe()
	}

	/// Stop both planes: cancel sweeps and accept loops, end SSE streams,
	/// and give in-flight work the drain grace.
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
		self.state.notifier.close_all();
		// Accept loops own their own drain; give them time to finish.
		tokio::time::sleep(Duration::from_millis(300)).await;
	}
}

/// Build every component from settings and start both planes.
///
/// Certificate problems are fatal here, before any listener binds: a
/// controller with an expired identity must not come up.
pub async fn start_controller(
	settings: Settings,
	metrics: Arc<MetricsRegistry>,
) -> Result<ControllerHandle> {
	let cert_path = settings
		.tls_cert
		.as_deref()
		.context("tls_cert is required")?;
	let key_path = settings.tls_key.as_deref().context("tls_key is required")?;
	let identity = TlsIdentity::load(
		Path::new(cert_path),
		Path::new(key_path),
		settings.tls_ca.as_deref().map(Path::new),
	)
	.context("loading TLS identity")?;
	identity
		.validate_expiry()
		.context("controller certificate is not currently valid")?;
	if !identity.has_ca() {
		warn!("no CA bundle configured; client certificates cannot be verified");
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let (policy_store, service_store, certificate_store) =
		build_stores(settings.database_url.as_deref()).await?;

	let notifier = SseNotifier::new(
		Duration::from_secs(settings.sse_heartbeat_secs),
		metrics.clone(),
	);
	let sessions = SessionStore::new(
		Duration::from_secs(settings.session_ttl_secs),
		metrics.clone(),
	);
	Arc::clone(&sessions).start_cleanup(
		Duration::from_secs(settings.session_sweep_secs),
		shutdown_rx.clone(),
	);

	let registry = TunnelRegistry::new(
		Duration::from_secs(settings.tunnel_ttl_secs),
		metrics.clone(),
	);
	Arc::clone(&registry).start_cleanup(Duration::from_secs(60), shutdown_rx.clone());

	let catalog = ServiceCatalog::new(service_store, notifier.clone());
	let policy = Arc::new(PolicyEngine::new(
		policy_store,
		Arc::new(DefaultEvaluator::new(Arc::new(NoGeoResolver), metrics.clone())),
		metrics.clone(),
	));
	let audit = AuditLogger::new(settings.audit_log_path.clone(), metrics.clone());

	// Data plane first: its bound address feeds the controller_addr that
	// tunnel-created events advertise (relevant when relay_port is 0).
	let relay_cfg = RelayConfig {
		listen_addr: format!("{}:{}", settings.host, settings.relay_port)
			.parse()
			.context("invalid relay listen address")?,
		pairing_timeout: Duration::from_secs(settings.pairing_timeout_secs),
		read_timeout: Duration::from_secs(settings.relay_read_timeout_secs),
		write_timeout: Duration::from_secs(settings.relay_write_timeout_secs),
		max_connections: settings.relay_max_connections,
		sweep_interval: Duration::from_secs(60),
	};
	let relay = RelayServer::new(
		&identity,
		relay_cfg,
		registry.clone(),
		metrics.clone(),
		audit.clone(),
	)?;
	let relay_addr = relay.start(shutdown_rx.clone()).await?;

	let controller_addr = settings
		.relay_public_addr
		.clone()
		.unwrap_or_else(|| relay_addr.to_string());

	let state = AppState {
		sessions,
		policy,
		registry,
		catalog,
		notifier,
		audit,
		certificates: certificate_store,
		metrics: metrics.clone(),
		controller_addr,
	};

	// Control plane
	let http_addr = serve_control_plane(&settings, &identity, state.clone(), shutdown_rx).await?;

	info!(
		control_plane = %http_addr,
		data_plane = %relay_addr,
		"bifrost controller started"
	);

	Ok(ControllerHandle {
		state,
		http_addr,
		relay_addr,
		shutdown_tx,
	})
}

async fn build_stores(
	database_url: Option<&str>,
) -> Result<(
	Arc<dyn PolicyStore>,
	Arc<dyn ServiceStore>,
	Arc<dyn CertificateStore>,
)> {
	let Some(url) = database_url else {
		debug!("no database configured; using in-memory repositories");
		return Ok((
			Arc::new(MemoryPolicyStore::new()),
			Arc::new(MemoryServiceStore::new()),
			Arc::new(MemoryCertificateStore::new()),
		));
	};

	let mut last_err = None;
	for attempt in 1..=DB_CONNECT_RETRIES {
		match sqlx::PgPool::connect(url).await {
			Ok(pool) => {
				persist::sql::ensure_schema(&pool)
					.await
					.context("preparing database schema")?;
				info!("connected to policy database");
				return Ok((
					Arc::new(persist::sql::PgPolicyStore::new(pool.clone())),
					Arc::new(persist::sql::PgServiceStore::new(pool.clone())),
					Arc::new(persist::sql::PgCertificateStore::new(pool)),
				));
			}
			Err(e) => {
				warn!(attempt, error = %e, "database connect failed");
				last_err = Some(e);
				if attempt < DB_CONNECT_RETRIES {
					tokio::time::sleep(DB_CONNECT_BACKOFF).await;
				}
			}
		}
	}
	Err(anyhow::anyhow!(
		"database unreachable after {} attempts: {}",
		DB_CONNECT_RETRIES,
		last_err.map(|e| e.to_string()).unwrap_or_default()
	))
}

/// Translate a caught handler panic into the API error envelope.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> hyper::Response<Full<Bytes>> {
	let detail = if let Some(s) = err.downcast_ref::<String>() {
		s.clone()
	} else if let Some(s) = err.downcast_ref::<&str>() {
		s.to_string()
	} else {
		"unknown panic".to_string()
	};
	error!(panic = %detail, "handler panicked");

	let body = serde_json::json!({
		"type": "error",
		"status": "error",
		"code": "INTERNAL_ERROR",
		"message": "internal server error",
		"timestamp": chrono::Utc::now().to_rfc3339(),
	});
	hyper::Response::builder()
		.status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::from(body.to_string()))
		.expect("static response")
}

/// Bind the control-plane listener and spawn its accept loop.
///
/// Every accepted connection performs the TLS handshake, derives the peer
/// identity from the verified client certificate, and serves the router
/// behind a defensive tower stack.
async fn serve_control_plane(
	settings: &Settings,
	identity: &TlsIdentity,
	state: AppState,
	mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
	let server_cfg = identity
		.server_config()
		.context("building control-plane TLS config")?;
	let acceptor = TlsAcceptor::from(server_cfg);

	let bind_addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
		.parse()
		.context("invalid control-plane listen address")?;
	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("failed to bind {}", bind_addr))?;
	let local_addr = listener.local_addr()?;

	let app = api::router(state.clone());

	tokio::spawn(async move {
		let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);

		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				accepted = listener.accept() => {
					let (tcp_stream, peer_addr) = match accepted {
						Ok(t) => t,
						Err(e) => {
							error!(error = %e, "control-plane accept error");
							tokio::time::sleep(Duration::from_millis(100)).await;
							continue;
						}
					};

					let acceptor = acceptor.clone();
					let app = app.clone();
					let guard = guard_tx.clone();
					tokio::spawn(async move {
						let _guard = guard;
						let _ = tcp_stream.set_nodelay(true);

						let tls_stream = match acceptor.accept(tcp_stream).await {
							Ok(s) => s,
							Err(e) => {
								debug!(peer = %peer_addr, error = %e, "control-plane TLS handshake failed");
								return;
							}
						};

						// Derive the request identity from the verified peer
						// certificate, when one was presented.
						let identity = {
							let (_, session) = tls_stream.get_ref();
							let certs = session.peer_certificates().unwrap_or_default();
							tls_utils::peer_identity(certs).ok()
						};
						let meta = ConnectionMeta {
							peer_addr,
							identity,
						};

						// Mark commonly-sensitive headers so logging and
						// middleware don't accidentally expose secrets.
						let sensitive: Arc<[HeaderName]> = Arc::from(
							vec![HeaderName::from_static("authorization")].into_boxed_slice(),
						);

						let svc = ServiceBuilder::new()
							// A panicking handler must not crash the process.
							.layer(CatchPanicLayer::custom(panic_response))
							.layer(RequestBodyLimitLayer::new(1024 * 1024))
							.layer(RequestBodyTimeoutLayer::new(Duration::from_secs(15)))
							.layer(SetSensitiveRequestHeadersLayer::from_shared(sensitive))
							.layer(Extension(meta))
							.service(app);

						let hyper_svc = TowerToHyperService::new(svc);
						let io = TokioIo::new(tls_stream);
						let builder = AutoBuilder::new(TokioExecutor::new());
						if let Err(err) = builder.serve_connection(io, hyper_svc).await {
							debug!(peer = %peer_addr, error = %err, "connection error");
						}
					});
				}
			}
		}

		drop(listener);
		drop(guard_tx);
		if timeout(SHUTDOWN_GRACE, guard_rx.recv()).await.is_err() {
			warn!("control-plane connections did not drain within the shutdown grace");
		}
		info!("control plane stopped");
	});

	Ok(local_addr)
}

/// Start the controller from configuration and serve until interrupted.
pub async fn run() -> Result<()> {
	let obs = observability::init_observability()?;

	let settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			warn!(error = %e, "failed to load config; using defaults");
			Settings::default()
		}
	};

	let handle = start_controller(settings, obs.metrics.clone()).await?;

	tokio::signal::ctrl_c()
		.await
		.context("waiting for shutdown signal")?;
	info!("shutdown signal received");
	handle.shutdown().await;
	tokio::time::sleep(SHUTDOWN_GRACE).await;
	Ok(())
}
