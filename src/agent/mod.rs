//! Data-plane client SDK and the AH-side agent.
//!
//! `RelayClient` is the shared IH/AH primitive: dial the controller relay
//! over mTLS, announce the tunnel id in a fixed 36-byte header, and hand
//! back a plain duplex byte stream. `AhAgent` layers the accepting-host
//! workflow on top: consume the service catalog and the SSE event stream,
//! and on `tunnel.created` for a hosted service bridge the target service
//! to the relay.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, watch};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{ClientConfig, ServerName};
use tracing::{debug, error, info, warn};

use crate::notify::{TunnelEvent, TunnelEventType};
use crate::registry::{ServiceConfig, ServiceStatus};
use crate::relay::TUNNEL_ID_LEN;
use crate::tls_utils::TlsIdentity;

/// Deadline for establishing the TCP+TLS connection to the relay.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for writing the tunnel-id header.
const HEADER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff for the AH agent's event stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Pad a tunnel id to the fixed header width with trailing NULs.
fn encode_tunnel_id(tunnel_id: &str) -> Result<[u8; TUNNEL_ID_LEN]> {
	let bytes = tunnel_id.as_bytes();
	if bytes.is_empty() || bytes.len() > TUNNEL_ID_LEN {
		anyhow::bail!(
			"tunnel id must be 1..={} bytes, got {}",
			TUNNEL_ID_LEN,
			bytes.len()
		);
	}
	let mut header = [0u8; TUNNEL_ID_LEN];
	header[..bytes.len()].copy_from_slice(bytes);
	Ok(header)
}

/// mTLS dialer for the controller's data plane, used by both IH and AH.
pub struct RelayClient {
	connector: TlsConnector,
	relay_addr: String,
	server_name: String,
}

impl RelayClient {
	/// Build a client from an identity whose CA bundle is the trust root
	/// for the controller certificate.
	pub fn new(identity: &TlsIdentity, relay_addr: String, server_name: String) -> Result<Self> {
		let config = identity
			.client_config()
			.context("building relay client TLS config")?;
		Ok(Self::with_config(config, relay_addr, server_name))
	}

	pub fn with_config(
		config: Arc<ClientConfig>,
		relay_addr: String,
		server_name: String,
	) -> Self {
		Self {
			connector: TlsConnector::from(config),
			relay_addr,
			server_name,
		}
	}

	/// Dial the relay and announce the tunnel id. After this returns, the
	/// connection is an opaque duplex byte stream owned by the caller.
	pub async fn connect(
		&self,
		tunnel_id: &str,
	) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
		let header = encode_tunnel_id(tunnel_id)?;

		let mut stream = timeout(CONNECT_TIMEOUT, async {
			let tcp = TcpStream::connect(&self.relay_addr)
				.await
				.context("failed to connect to relay")?;
			let _ = tcp.set_nodelay(true);
			let server_name = ServerName::try_from(self.server_name.as_str())
				.context("invalid relay server name")?;
			self.connector
				.connect(server_name, tcp)
				.await
				.context("relay TLS handshake failed")
		})
		.await
		.context("relay connect timed out")??;

		timeout(HEADER_WRITE_TIMEOUT, stream.write_all(&header))
			.await
			.context("tunnel-id header write timed out")?
			.context("failed to write tunnel-id header")?;

		debug!(tunnel_id = %tunnel_id, relay = %self.relay_addr, "relay half connected");
		Ok(stream)
	}

	/// `connect` with a fixed-delay retry loop.
	pub async fn connect_with_retry(
		&self,
		tunnel_id: &str,
		attempts: u32,
		delay: Duration,
	) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
		let mut last_err = None;
		for attempt in 1..=attempts.max(1) {
			match self.connect(tunnel_id).await {
				Ok(stream) => return Ok(stream),
				Err(e) => {
					warn!(
						tunnel_id = %tunnel_id,
						attempt,
						attempts,
						error = %e,
						"relay connect attempt failed"
					);
					last_err = Some(e);
					if attempt < attempts {
						sleep(delay).await;
					}
				}
			}
		}
		Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no connect attempts made")))
	}
}

/// One parsed SSE record: the event name and its data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
	pub event: String,
	pub data: String,
}

/// Incremental SSE parser over a byte stream. Records are separated by a
/// blank line; `: ...` comment lines (heartbeats) are dropped.
pub struct SseParser {
	buffer: Vec<u8>,
}

impl SseParser {
	pub fn new() -> Self {
		Self { buffer: Vec::new() }
	}

	/// Feed a chunk, returning every record completed by it.
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
		self.buffer.extend_from_slice(chunk);
		let mut records = Vec::new();
		while let Some(pos) = find_block_end(&self.buffer) {
			let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
			if let Some(record) = parse_block(&block) {
				records.push(record);
			}
		}
		records
	}
}

impl Default for SseParser {
	fn default() -> Self {
		Self::new()
	}
}

fn find_block_end(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<SseRecord> {
	let text = std::str::from_utf8(block).ok()?;
	let mut event = String::new();
	let mut data = String::new();
	for line in text.lines() {
		if let Some(rest) = line.strip_prefix("event:") {
			event = rest.trim().to_string();
		} else if let Some(rest) = line.strip_prefix("data:") {
			if !data.is_empty() {
				data.push('\n');
			}
			data.push_str(rest.trim_start());
		}
		// comment lines (": ping") fall through
	}
	if event.is_empty() && data.is_empty() {
		return None;
	}
	Some(SseRecord { event, data })
}

#[derive(Debug, Clone)]
pub struct AhAgentConfig {
	pub agent_id: String,
	/// Control-plane base URL, e.g. `https://controller.example:8443`.
	pub controller_base_url: String,
	/// SNI / certificate name the relay presents.
	pub relay_server_name: String,
}

/// Accepting-host agent: fronts target services for the controller.
pub struct AhAgent {
	cfg: AhAgentConfig,
	client_config: Arc<ClientConfig>,
	http: reqwest::Client,
	services: RwLock<HashMap<String, ServiceConfig>>,
}

impl AhAgent {
	/// Build the agent. The same PEM material drives both the raw mTLS
	/// relay dialer and the HTTPS client for catalog and event traffic.
	pub fn new(
		identity: &TlsIdentity,
		cert_path: &Path,
		key_path: &Path,
		ca_path: &Path,
		cfg: AhAgentConfig,
	) -> Result<Arc<Self>> {
		let client_config = identity
			.client_config()
			.context("building agent TLS config")?;

		let mut identity_pem = std::fs::read(cert_path).context("reading agent certificate")?;
		identity_pem.extend_from_slice(&std::fs::read(key_path).context("reading agent key")?);
		let ca_pem = std::fs::read(ca_path).context("reading CA bundle")?;

		let http = reqwest::Client::builder()
			.use_rustls_tls()
			.identity(reqwest::Identity::from_pem(&identity_pem).context("agent identity PEM")?)
			.add_root_certificate(
				reqwest::Certificate::from_pem(&ca_pem).context("CA certificate PEM")?,
			)
			.connect_timeout(CONNECT_TIMEOUT)
			.build()
			.context("building agent HTTP client")?;

		Ok(Arc::new(Self {
			cfg,
			client_config,
			http,
			services: RwLock::new(HashMap::new()),
		}))
	}

	/// Fetch the active service catalog and replace the local view.
	pub async fn fetch_services(&self) -> Result<Vec<ServiceConfig>> {
		let url = format!("{}/api/v1/services", self.cfg.controller_base_url);
		let services: Vec<ServiceConfig> = self
			.http
			.get(&url)
			.send()
			.await
			.context("fetching service catalog")?
			.error_for_status()
			.context("service catalog request rejected")?
			.json()
			.await
			.context("parsing service catalog")?;

		let mut map = self.services.write().await;
		map.clear();
		for service in &services {
			map.insert(service.service_id.clone(), service.clone());
		}
		info!(count = services.len(), "service catalog loaded");
		Ok(services)
	}

	pub async fn hosted_service(&self, service_id: &str) -> Option<ServiceConfig> {
		self.services.read().await.get(service_id).cloned()
	}

	/// Run the agent until shutdown: keep a live SSE subscription,
	/// reconnecting with a fixed backoff on failure.
	pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		loop {
			if *shutdown.borrow() {
				return;
			}
			if let Err(e) = self.fetch_services().await {
				error!(error = %e, "failed to load service catalog; retrying");
				tokio::select! {
					_ = sleep(RECONNECT_BACKOFF) => continue,
					_ = shutdown.changed() => return,
				}
			}
			match self.consume_events(&mut shutdown).await {
				Ok(()) => return,
				Err(e) => {
					warn!(error = %e, "event stream ended; reconnecting");
					tokio::select! {
						_ = sleep(RECONNECT_BACKOFF) => {}
						_ = shutdown.changed() => return,
					}
				}
			}
		}
	}

	async fn consume_events(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
		let url = format!(
			"{}/v1/agent/tunnels/stream?agent_id={}&agent_type=ah",
			self.cfg.controller_base_url, self.cfg.agent_id
		);
		let response = self
			.http
			.get(&url)
			.send()
			.await
			.context("subscribing to event stream")?
			.error_for_status()
			.context("event stream rejected")?;

		let mut parser = SseParser::new();
		let mut stream = response.bytes_stream();
		loop {
			let chunk = tokio::select! {
				chunk = stream.next() => chunk,
				_ = shutdown.changed() => return Ok(()),
			};
			let chunk = match chunk {
				Some(Ok(c)) => c,
				Some(Err(e)) => anyhow::bail!("event stream read failed: {}", e),
				None => anyhow::bail!("event stream closed by controller"),
			};
			for record in parser.feed(&chunk) {
				self.handle_record(record).await;
			}
		}
	}

	async fn handle_record(&self, record: SseRecord) {
		match record.event.as_str() {
			"connected" => debug!(agent_id = %self.cfg.agent_id, "event stream connected"),
			"tunnel" => match serde_json::from_str::<TunnelEvent>(&record.data) {
				Ok(event) => self.handle_tunnel_event(event).await,
				Err(e) => warn!(error = %e, "unparseable tunnel event"),
			},
			"service_created" | "service_updated" | "service_deleted" => {
				match serde_json::from_str::<ServiceConfig>(&record.data) {
					Ok(service) => {
						let mut map = self.services.write().await;
						if service.status == ServiceStatus::Active {
							map.insert(service.service_id.clone(), service);
						} else {
							map.remove(&service.service_id);
						}
					}
					Err(e) => warn!(error = %e, "unparseable service event"),
				}
			}
			other => debug!(event = %other, "ignoring event"),
		}
	}

	async fn handle_tunnel_event(&self, event: TunnelEvent) {
		if event.event_type != TunnelEventType::Created {
			return;
		}
		let Some(service) = self.hosted_service(&event.tunnel.service_id).await else {
			debug!(
				service_id = %event.tunnel.service_id,
				"tunnel for a service this agent does not host"
			);
			return;
		};
		let Some(relay_addr) = event.details["controller_addr"].as_str() else {
			warn!(tunnel_id = %event.tunnel.id, "tunnel event carries no controller address");
			return;
		};

		let relay = RelayClient::with_config(
			Arc::clone(&self.client_config),
			relay_addr.to_string(),
			self.cfg.relay_server_name.clone(),
		);
		let tunnel_id = event.tunnel.id.clone();
		tokio::spawn(async move {
			if let Err(e) = bridge_tunnel(relay, &tunnel_id, &service).await {
				error!(tunnel_id = %tunnel_id, error = %e, "tunnel bridge failed");
			}
		});
	}
}

/// Dial the target service and the relay, then pump bytes both ways until
/// either side closes.
async fn bridge_tunnel(
	relay: RelayClient,
	tunnel_id: &str,
	service: &ServiceConfig,
) -> Result<()> {
	let target_addr = format!("{}:{}", service.target_host, service.target_port);
	let mut target = timeout(CONNECT_TIMEOUT, TcpStream::connect(&target_addr))
		.await
		.context("target connect timed out")?
		.with_context(|| format!("failed to connect to target {}", target_addr))?;
	let _ = target.set_nodelay(true);

	let mut relay_conn = relay.connect(tunnel_id).await?;

	info!(tunnel_id = %tunnel_id, target = %target_addr, "bridging tunnel");
	let result = tokio::io::copy_bidirectional(&mut relay_conn, &mut target).await;
	match result {
		Ok((from_relay, to_relay)) => {
			info!(
				tunnel_id = %tunnel_id,
				bytes_from_relay = from_relay,
				bytes_to_relay = to_relay,
				"tunnel bridge closed"
			);
			Ok(())
		}
		Err(e) => Err(e).context("tunnel bridge copy failed"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tunnel_id_header_is_nul_padded() {
		let header = encode_tunnel_id("00000000-0000-0000-0000-000000000001").unwrap();
		assert_eq!(header.len(), TUNNEL_ID_LEN);
		assert_eq!(&header[..36], b"00000000-0000-0000-0000-000000000001");

		let short = encode_tunnel_id("abc").unwrap();
		assert_eq!(&short[..3], b"abc");
		assert!(short[3..].iter().all(|&b| b == 0));
	}

	#[test]
	fn tunnel_id_header_rejects_oversize() {
		let too_long = "x".repeat(TUNNEL_ID_LEN + 1);
		assert!(encode_tunnel_id(&too_long).is_err());
		assert!(encode_tunnel_id("").is_err());
	}

	#[test]
	fn sse_parser_handles_split_chunks() {
		let mut parser = SseParser::new();
		assert!(parser.feed(b"event: tunnel\ndata: {\"a\":").is_empty());
		let records = parser.feed(b"1}\n\nevent: connected\ndata: {}\n\n");
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].event, "tunnel");
		assert_eq!(records[0].data, "{\"a\":1}");
		assert_eq!(records[1].event, "connected");
	}

	#[test]
	fn sse_parser_drops_heartbeat_comments() {
		let mut parser = SseParser::new();
		let records = parser.feed(b": ping\n\nevent: tunnel\ndata: {}\n\n");
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].event, "tunnel");
	}

	#[test]
	fn sse_parser_joins_multiline_data() {
		let mut parser = SseParser::new();
		let records = parser.feed(b"event: tunnel\ndata: line1\ndata: line2\n\n");
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].data, "line1\nline2");
	}
}
