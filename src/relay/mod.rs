//! Data-plane tunnel relay.
//!
//! Accepts mutually-authenticated TCP connections that each open with a
//! 36-byte tunnel id, pairs the IH and AH halves of a tunnel, and splices
//! bytes in both directions until either peer closes. Both legs terminate
//! TLS in-process, so the relay pumps through 32 KiB user-space buffers;
//! TCP backpressure still propagates end to end because each direction is a
//! straight read-write loop with no intermediate buffering.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::audit::AuditLogger;
use crate::observability::MetricsRegistry;
use crate::registry::{TunnelRegistry, TunnelStats};
use crate::tls_utils::{self, TlsIdentity};

/// Width of the tunnel-id header: a UUID in text form, NUL right-padded by
/// producers whose id is shorter.
pub const TUNNEL_ID_LEN: usize = 36;

/// Relay copy buffer. 32 KiB per direction.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// TCP keep-alive period on accepted connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// How often a pending half checks whether its peer claimed it.
const PAIRING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shard count for the pairing locks.
const PAIR_LOCK_SHARDS: usize = 16;

/// Grace given to in-flight handlers at shutdown before the relay stops
/// waiting for them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
	pub listen_addr: SocketAddr,
	pub pairing_timeout: Duration,
	pub read_timeout: Duration,
	pub write_timeout: Duration,
	pub max_connections: usize,
	pub sweep_interval: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			listen_addr: "127.0.0.1:9443".parse().unwrap(),
			pairing_timeout: Duration::from_secs(30),
			read_timeout: Duration::from_secs(300),
			write_timeout: Duration::from_secs(300),
			max_connections: 1024,
			sweep_interval: Duration::from_secs(60),
		}
	}
}

/// Which side of a tunnel a data-plane connection claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Ih,
	Ah,
}

impl Role {
	/// Derive the role from the peer certificate's Common Name prefix.
	/// Anything that is neither `ih*` nor `ah*` is rejected.
	pub fn from_common_name(cn: &str) -> Option<Role> {
		let lower = cn.to_ascii_lowercase();
		if lower.starts_with("ih") {
			Some(Role::Ih)
		} else if lower.starts_with("ah") {
			Some(Role::Ah)
		} else {
			None
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Role::Ih => "ih",
			Role::Ah => "ah",
		}
	}
}

#[derive(Debug, Error)]
pub enum RelayError {
	#[error("tls handshake failed: {0}")]
	Handshake(String),

	#[error("peer certificate does not identify a role: {0}")]
	UnknownRole(String),

	#[error("protocol violation: {0}")]
	Protocol(String),

	#[error("tunnel {0} is not open for pairing")]
	TunnelUnavailable(String),

	#[error("pairing timed out")]
	PairingTimeout,

	#[error("read failed: {0}")]
	Read(std::io::Error),

	#[error("read timed out")]
	ReadTimeout,

	#[error("write failed: {0}")]
	Write(std::io::Error),

	#[error("write timed out")]
	WriteTimeout,
}

impl RelayError {
	/// Label recorded on the relay-error metric.
	pub fn reason(&self) -> &'static str {
		match self {
			RelayError::Handshake(_) => "handshake",
			RelayError::UnknownRole(_) => "unknown_role",
			RelayError::Protocol(_) => "protocol",
			RelayError::TunnelUnavailable(_) => "tunnel_unavailable",
			RelayError::PairingTimeout => "pairing_timeout",
			RelayError::Read(_) => "read_error",
			RelayError::ReadTimeout => "read_timeout",
			RelayError::Write(_) => "write_error",
			RelayError::WriteTimeout => "write_timeout",
		}
	}
}

/// The first-arrived half of a tunnel, parked until its peer shows up or the
/// pairing timeout fires.
struct PendingHalf {
	conn: TlsStream<TcpStream>,
	peer_addr: SocketAddr,
	received_at: Instant,
}

/// Per-direction transfer counters, shared with the pump tasks so totals
/// survive an aborted pump.
#[derive(Default)]
struct DirectionCounters {
	bytes: AtomicU64,
	packets: AtomicU64,
}

/// The mTLS listener that pairs IH and AH connections by tunnel id and
/// relays opaque bytes between them.
pub struct RelayServer {
	cfg: RelayConfig,
	acceptor: TlsAcceptor,
	registry: Arc<TunnelRegistry>,
	metrics: Arc<MetricsRegistry>,
	audit: Arc<AuditLogger>,
	pending_ih: DashMap<String, PendingHalf>,
	pending_ah: DashMap<String, PendingHalf>,
	// Pairing spans two maps; a sharded mutex keyed by hash(tunnel id)
	// makes test-opposite-then-insert-self a single critical section.
	pair_locks: Vec<std::sync::Mutex<()>>,
	handling: AtomicUsize,
}

impl RelayServer {
	/// Build the relay. The data plane refuses to run without a CA bundle:
	/// client authentication is forced on regardless of how the identity
	/// was configured.
	pub fn new(
		identity: &TlsIdentity,
		cfg: RelayConfig,
		registry: Arc<TunnelRegistry>,
		metrics: Arc<MetricsRegistry>,
		audit: Arc<AuditLogger>,
	) -> Result<Arc<Self>> {
		if !identity.has_ca() {
			warn!("relay requires verified client certificates; refusing to start without a CA bundle");
		}
		let server_cfg = identity
			.server_config_mutual()
			.context("building relay TLS config")?;
		Ok(Arc::new(Self {
			cfg,
			acceptor: TlsAcceptor::from(server_cfg),
			registry,
			metrics,
			audit,
			pending_ih: DashMap::new(),
			pending_ah: DashMap::new(),
			pair_locks: (0..PAIR_LOCK_SHARDS)
				.map(|_| std::sync::Mutex::new(()))
				.collect(),
			handling: AtomicUsize::new(0),
		}))
	}

	/// Bind the listener and spawn the accept and sweep loops. Returns the
	/// bound address (useful when configured with port 0).
	pub async fn start(
		self: Arc<Self>,
		shutdown: watch::Receiver<bool>,
	) -> Result<SocketAddr> {
		let listener = TcpListener::bind(self.cfg.listen_addr)
			.await
			.with_context(|| format!("binding relay listener on {}", self.cfg.listen_addr))?;
		let local_addr = listener.local_addr()?;
		info!(addr = %local_addr, "tunnel relay listening");

		let server = Arc::clone(&self);
		let accept_shutdown = shutdown.clone();
		tokio::spawn(async move {
			server.accept_loop(listener, accept_shutdown).await;
		});

		let server = Arc::clone(&self);
		let mut sweep_shutdown = shutdown;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(server.cfg.sweep_interval);
			loop {
				tokio::select! {
					_ = tick.tick() => server.sweep_pending().await,
					_ = sweep_shutdown.changed() => return,
				}
			}
		});

		Ok(local_addr)
	}

	async fn accept_loop(
		self: Arc<Self>,
		listener: TcpListener,
		mut shutdown: watch::Receiver<bool>,
	) {
		// Handlers hold a clone of this sender; after shutdown the accept
		// task waits for the receiver to drain before declaring the relay
		// stopped.
		let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);

		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				accepted = listener.accept() => {
					let (stream, peer_addr) = match accepted {
						Ok(t) => t,
						Err(e) => {
							error!(error = %e, "relay accept error");
							tokio::time::sleep(Duration::from_millis(100)).await;
							continue;
						}
					};

					if self.handling.load(Ordering::SeqCst) >= self.cfg.max_connections {
						self.metrics.relay_connections_rejected_total.inc();
						warn!(peer = %peer_addr, "relay connection limit reached; closing");
						drop(stream);
						continue;
					}

					self.handling.fetch_add(1, Ordering::SeqCst);
					let server = Arc::clone(&self);
					let handler_shutdown = shutdown.clone();
					let guard = guard_tx.clone();
					tokio::spawn(async move {
						let _guard = guard;
						if let Err(e) = server
							.handle_connection(stream, peer_addr, handler_shutdown)
							.await
						{
							debug!(peer = %peer_addr, error = %e, "relay connection ended with error");
							server
								.metrics
								.tunnel_relay_errors_total
								.with_label_values(&[e.reason()])
								.inc();
						}
						server.handling.fetch_sub(1, Ordering::SeqCst);
					});
				}
			}
		}

		// Shutdown: stop accepting, flush parked halves, then wait for
		// in-flight handlers with a bounded grace.
		drop(listener);
		self.close_pending();
		drop(guard_tx);
		if timeout(SHUTDOWN_GRACE, guard_rx.recv()).await.is_err() {
			warn!("relay handlers did not drain within the shutdown grace");
		}
		info!("tunnel relay stopped");
	}

	fn close_pending(&self) {
		let stale: Vec<String> = self.pending_ih.iter().map(|e| e.key().clone()).collect();
		for id in stale {
			if let Some((_, half)) = self.pending_ih.remove(&id) {
				drop(half);
			}
		}
		let stale: Vec<String> = self.pending_ah.iter().map(|e| e.key().clone()).collect();
		for id in stale {
			if let Some((_, half)) = self.pending_ah.remove(&id) {
				drop(half);
			}
		}
	}

	/// Remove pending halves that outlived the pairing timeout. The poll
	/// loop in the handler usually gets there first; this sweep is the
	/// backstop for handlers that died without cleaning up.
	async fn sweep_pending(&self) {
		for (map, role) in [(&self.pending_ih, Role::Ih), (&self.pending_ah, Role::Ah)] {
			let stale: Vec<String> = map
				.iter()
				.filter(|e| e.value().received_at.elapsed() > self.cfg.pairing_timeout)
				.map(|e| e.key().clone())
				.collect();
			for id in stale {
				if let Some((_, half)) = map.remove(&id) {
					warn!(tunnel_id = %id, role = role.as_str(), "sweeping stale pending half");
					self.metrics
						.tunnel_relay_errors_total
						.with_label_values(&["pairing_timeout"])
						.inc();
					self.registry.record_error(&id, "pairing_timeout").await;
					drop(half);
				}
			}
		}
	}

	fn pair_lock(&self, tunnel_id: &str) -> &std::sync::Mutex<()> {
		let mut hasher = DefaultHasher::new();
		tunnel_id.hash(&mut hasher);
		&self.pair_locks[(hasher.finish() as usize) % PAIR_LOCK_SHARDS]
	}

	async fn handle_connection(
		&self,
		stream: TcpStream,
		peer_addr: SocketAddr,
		shutdown: watch::Receiver<bool>,
	) -> Result<(), RelayError> {
		let _ = stream.set_nodelay(true);
		let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
		let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

		let conn = self
			.acceptor
			.accept(stream)
			.await
			.map_err(|e| RelayError::Handshake(e.to_string()))?;

		let identity = {
			let (_, session) = conn.get_ref();
			let certs = session.peer_certificates().unwrap_or_default();
			tls_utils::peer_identity(certs)
				.map_err(|e| RelayError::Handshake(e.to_string()))?
		};

		let Some(role) = Role::from_common_name(&identity.client_id) else {
			self.audit.log_security(AuditEntry {
				client_id: Some(identity.client_id.clone()),
				action: "relay_role_check".to_string(),
				result: "rejected".to_string(),
				severity: "warning".to_string(),
				source_ip: Some(peer_addr.ip().to_string()),
				..Default::default()
			});
			return Err(RelayError::UnknownRole(identity.client_id));
		};

		let (tunnel_id, conn) = self.read_tunnel_id(conn).await?;

		// The tunnel must have been brokered by the control plane and still
		// be open. Anything else is a protocol ambiguity, which fails
		// closed.
		match self.registry.get(&tunnel_id).await {
			Some(t) if !t.status.is_terminal() => {}
			_ => return Err(RelayError::TunnelUnavailable(tunnel_id)),
		}

		debug!(tunnel_id = %tunnel_id, role = role.as_str(), peer = %peer_addr, "relay half arrived");
		self.pair_or_park(tunnel_id, role, conn, peer_addr, shutdown).await
	}

	/// Read the fixed-width tunnel-id header. A connection that closes or
	/// stalls before 36 bytes never pairs.
	async fn read_tunnel_id(
		&self,
		mut conn: TlsStream<TcpStream>,
	) -> Result<(String, TlsStream<TcpStream>), RelayError> {
		let mut header = [0u8; TUNNEL_ID_LEN];
		match timeout(self.cfg.pairing_timeout, conn.read_exact(&mut header)).await {
			Err(_) => return Err(RelayError::Protocol("tunnel-id header timed out".to_string())),
			Ok(Err(e)) => {
				return Err(RelayError::Protocol(format!(
					"short tunnel-id header: {}",
					e
				)));
			}
			Ok(Ok(_)) => {}
		}

		let end = header
			.iter()
			.position(|&b| b == 0)
			.unwrap_or(TUNNEL_ID_LEN);
		let id = std::str::from_utf8(&header[..end])
			.map_err(|_| RelayError::Protocol("tunnel id is not UTF-8".to_string()))?;
		let id = Uuid::parse_str(id)
			.map_err(|_| RelayError::Protocol(format!("tunnel id is not a UUID: {:?}", id)))?;
		Ok((id.to_string(), conn))
	}

	async fn pair_or_park(
		&self,
		tunnel_id: String,
		role: Role,
		conn: TlsStream<TcpStream>,
		peer_addr: SocketAddr,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<(), RelayError> {
		let (own, opposite) = match role {
			Role::Ih => (&self.pending_ih, &self.pending_ah),
			Role::Ah => (&self.pending_ah, &self.pending_ih),
		};

		enum Arrival {
			Claimed {
				mine: PendingHalf,
				other: PendingHalf,
			},
			Parked,
			Duplicate,
		}

		let half = PendingHalf {
			conn,
			peer_addr,
			received_at: Instant::now(),
		};

		// Single critical section across both maps: either claim the
		// waiting peer or park ourselves. Without this, two simultaneous
		// arrivals can each miss the other and park forever, or pair twice.
		// The guard never lives across an await.
		let arrival = {
			let _guard = self.pair_lock(&tunnel_id).lock().unwrap();
			match opposite.remove(&tunnel_id) {
				Some((_, other)) => Arrival::Claimed { mine: half, other },
				// A half of this role is already parked: duplicate arrival
				// for an id that will pair without us.
				None if own.contains_key(&tunnel_id) => Arrival::Duplicate,
				None => {
					own.insert(tunnel_id.clone(), half);
					Arrival::Parked
				}
			}
		};

		let (mine, other) = match arrival {
			Arrival::Claimed { mine, other } => (mine, other),
			Arrival::Parked => {
				return self.wait_for_claim(&tunnel_id, role, &mut shutdown).await;
			}
			Arrival::Duplicate => {
				debug!(tunnel_id = %tunnel_id, role = role.as_str(), "duplicate relay half; closing");
				return Err(RelayError::Protocol("duplicate tunnel half".to_string()));
			}
		};
		let conn = mine.conn;

		let waited = other.received_at.elapsed();
		self.metrics
			.tunnel_pairing_duration_seconds
			.observe(waited.as_secs_f64());

		// Orient the pair: `conn` belongs to this arrival, `other` to the
		// parked peer of the opposite role.
		let (ih_conn, ih_addr, ah_conn, ah_addr) = match role {
			Role::Ih => (conn, peer_addr, other.conn, other.peer_addr),
			Role::Ah => (other.conn, other.peer_addr, conn, peer_addr),
		};

		match self
			.registry
			.mark_active(&tunnel_id, ih_addr.to_string(), ah_addr.to_string())
			.await
		{
			Ok(_) => {}
			Err(e) => {
				warn!(tunnel_id = %tunnel_id, error = %e, "pairing refused by registry");
				return Err(RelayError::TunnelUnavailable(tunnel_id));
			}
		}

		self.metrics.active_tunnels.inc();
		self.metrics
			.tunnel_total
			.with_label_values(&["active"])
			.inc();
		info!(
			tunnel_id = %tunnel_id,
			ih = %ih_addr,
			ah = %ah_addr,
			paired_after_ms = waited.as_millis() as u64,
			"tunnel paired; relaying"
		);
		self.audit.log_connection(AuditEntry {
			tunnel_id: Some(tunnel_id.clone()),
			action: "tunnel_paired".to_string(),
			result: "success".to_string(),
			details: serde_json::json!({
				"ih_endpoint": ih_addr.to_string(),
				"ah_endpoint": ah_addr.to_string(),
			}),
			..Default::default()
		});

		self.relay(&tunnel_id, ih_conn, ah_conn, shutdown).await;
		Ok(())
	}

	/// Park-side poll loop: wait until the opposite peer claims our half or
	/// the pairing timeout fires. Claiming removes the map entry, so entry
	/// presence is the handoff signal.
	async fn wait_for_claim(
		&self,
		tunnel_id: &str,
		role: Role,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<(), RelayError> {
		let own = match role {
			Role::Ih => &self.pending_ih,
			Role::Ah => &self.pending_ah,
		};
		let deadline = Instant::now() + self.cfg.pairing_timeout;
		loop {
			tokio::select! {
				_ = tokio::time::sleep(PAIRING_POLL_INTERVAL) => {}
				_ = shutdown.changed() => {
					// Shutdown drains the maps; dropping the half closes it.
					own.remove(tunnel_id);
					return Ok(());
				}
			}

			if !own.contains_key(tunnel_id) {
				// Claimed; the peer's handler owns the relay now.
				return Ok(());
			}

			if Instant::now() >= deadline {
				match own.remove(tunnel_id) {
					Some((_, half)) => {
						self.registry.record_error(tunnel_id, "pairing_timeout").await;
						drop(half);
						return Err(RelayError::PairingTimeout);
					}
					// Claimed between the check and the removal.
					None => return Ok(()),
				}
			}
		}
	}

	/// Splice the paired connections until either direction finishes, then
	/// close both and finalize stats.
	async fn relay(
		&self,
		tunnel_id: &str,
		ih_conn: TlsStream<TcpStream>,
		ah_conn: TlsStream<TcpStream>,
		mut shutdown: watch::Receiver<bool>,
	) {
		let (ih_read, ih_write) = tokio::io::split(ih_conn);
		let (ah_read, ah_write) = tokio::io::split(ah_conn);

		let ih_to_ah = Arc::new(DirectionCounters::default());
		let ah_to_ih = Arc::new(DirectionCounters::default());

		let mut forward: JoinHandle<Result<(), RelayError>> = tokio::spawn(pump(
			ih_read,
			ah_write,
			Arc::clone(&ih_to_ah),
			self.cfg.read_timeout,
			self.cfg.write_timeout,
		));
		let mut backward: JoinHandle<Result<(), RelayError>> = tokio::spawn(pump(
			ah_read,
			ih_write,
			Arc::clone(&ah_to_ih),
			self.cfg.read_timeout,
			self.cfg.write_timeout,
		));

		// The relay completes when either copier returns; the other is
		// torn down, which closes both connections.
		let first = tokio::select! {
			r = &mut forward => { backward.abort(); r }
			r = &mut backward => { forward.abort(); r }
			_ = shutdown.changed() => {
				forward.abort();
				backward.abort();
				Ok(Ok(()))
			}
		};

		let error = match first {
			Ok(Ok(())) => None,
			Ok(Err(e)) => Some(e),
			Err(join_err) => {
				error!(tunnel_id = %tunnel_id, error = %join_err, "relay pump panicked");
				Some(RelayError::Protocol("relay pump panicked".to_string()))
			}
		};

		let stats = TunnelStats {
			bytes_ih_to_ah: ih_to_ah.bytes.load(Ordering::Relaxed),
			bytes_ah_to_ih: ah_to_ih.bytes.load(Ordering::Relaxed),
			packets_ih_to_ah: ih_to_ah.packets.load(Ordering::Relaxed),
			packets_ah_to_ih: ah_to_ih.packets.load(Ordering::Relaxed),
			..Default::default()
		};
		let transferred = stats.bytes_ih_to_ah + stats.bytes_ah_to_ih;

		self.metrics
			.tunnel_bytes_transferred_total
			.inc_by(transferred);
		self.metrics.active_tunnels.dec();

		let reason = error.as_ref().map(|e| e.reason().to_string());
		if let Some(reason) = &reason {
			self.metrics
				.tunnel_relay_errors_total
				.with_label_values(&[reason.as_str()])
				.inc();
		}
		let status_label = if reason.is_some() { "error" } else { "closed" };
		self.metrics
			.tunnel_total
			.with_label_values(&[status_label])
			.inc();

		if let Err(e) = self.registry.finish(tunnel_id, stats, reason.clone()).await {
			warn!(tunnel_id = %tunnel_id, error = %e, "failed to finalize tunnel");
		}

		info!(
			tunnel_id = %tunnel_id,
			bytes = transferred,
			reason = reason.as_deref().unwrap_or("eof"),
			"relay finished"
		);
		self.audit.log_connection(AuditEntry {
			tunnel_id: Some(tunnel_id.to_string()),
			action: "tunnel_closed".to_string(),
			result: if reason.is_some() { "error" } else { "success" }.to_string(),
			details: serde_json::json!({ "bytes_transferred": transferred }),
			..Default::default()
		});
	}

	/// Number of pending halves, for diagnostics and tests.
	pub fn pending_counts(&self) -> (usize, usize) {
		(self.pending_ih.len(), self.pending_ah.len())
	}
}

/// One relay direction: read up to 32 KiB, write it through, repeat until
/// EOF or error. Every read and write carries a deadline.
async fn pump<R, W>(
	mut reader: R,
	mut writer: W,
	counters: Arc<DirectionCounters>,
	read_timeout: Duration,
	write_timeout: Duration,
) -> Result<(), RelayError>
where
	R: tokio::io::AsyncRead + Unpin,
	W: tokio::io::AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; COPY_BUF_SIZE];
	loop {
		let n = match timeout(read_timeout, reader.read(&mut buf)).await {
			Err(_) => return Err(RelayError::ReadTimeout),
			Ok(Err(e)) => return Err(RelayError::Read(e)),
			Ok(Ok(n)) => n,
		};
		if n == 0 {
			// EOF: propagate the close to the other side.
			let _ = writer.shutdown().await;
			return Ok(());
		}
		match timeout(write_timeout, writer.write_all(&buf[..n])).await {
			Err(_) => return Err(RelayError::WriteTimeout),
			Ok(Err(e)) => return Err(RelayError::Write(e)),
			Ok(Ok(())) => {}
		}
		counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
		counters.packets.fetch_add(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_from_common_name_prefixes() {
		assert_eq!(Role::from_common_name("ih-test-01"), Some(Role::Ih));
		assert_eq!(Role::from_common_name("IH-UPPER"), Some(Role::Ih));
		assert_eq!(Role::from_common_name("ah-agent-7"), Some(Role::Ah));
		assert_eq!(Role::from_common_name("controller"), None);
		assert_eq!(Role::from_common_name(""), None);
	}

	#[test]
	fn relay_error_reasons_are_stable() {
		assert_eq!(RelayError::PairingTimeout.reason(), "pairing_timeout");
		assert_eq!(RelayError::ReadTimeout.reason(), "read_timeout");
		assert_eq!(
			RelayError::Protocol("x".to_string()).reason(),
			"protocol"
		);
	}

	#[tokio::test]
	async fn pump_copies_until_eof_and_counts() {
		let (mut source, upstream) = tokio::io::duplex(1024);
		let (mut sink, downstream) = tokio::io::duplex(1024);
		let (upstream_read, _upstream_write) = tokio::io::split(upstream);
		let (_downstream_read, downstream_write) = tokio::io::split(downstream);

		let counters = Arc::new(DirectionCounters::default());
		let handle = tokio::spawn(pump(
			upstream_read,
			downstream_write,
			Arc::clone(&counters),
			Duration::from_secs(5),
			Duration::from_secs(5),
		));

		source.write_all(b"PING").await.unwrap();
		source.shutdown().await.unwrap();

		let mut out = vec![0u8; 4];
		sink.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"PING");

		handle.await.unwrap().unwrap();
		assert_eq!(counters.bytes.load(Ordering::Relaxed), 4);
		assert_eq!(counters.packets.load(Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn pump_times_out_on_silent_reader() {
		let (_source, upstream) = tokio::io::duplex(1024);
		let (upstream_read, _upstream_write) = tokio::io::split(upstream);
		let (_sink, downstream) = tokio::io::duplex(1024);
		let (_downstream_read, downstream_write) = tokio::io::split(downstream);

		let counters = Arc::new(DirectionCounters::default());
		let err = pump(
			upstream_read,
			downstream_write,
			counters,
			Duration::from_millis(50),
			Duration::from_millis(50),
		)
		.await
		.unwrap_err();
		assert!(matches!(err, RelayError::ReadTimeout));
	}
}
