use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::notify::{ServiceEventType, SseNotifier};
use crate::observability::MetricsRegistry;
use crate::persist::{ServiceStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
	Tcp,
	Udp,
}

impl Default for ServiceProtocol {
	fn default() -> Self {
		Self::Tcp
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
	Active,
	Inactive,
	Deleted,
}

/// The authoritative binding of a `service_id` to its target coordinates.
/// Target host and port never cross the IH-side wire; IH requests carry only
/// the service id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
	pub service_id: String,
	pub service_name: String,
	pub target_host: String,
	pub target_port: u16,
	#[serde(default)]
	pub protocol: ServiceProtocol,
	pub status: ServiceStatus,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
	Pending,
	Active,
	Closed,
	Error,
}

impl TunnelStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Closed | Self::Error)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Active => "active",
			Self::Closed => "closed",
			Self::Error => "error",
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStats {
	pub bytes_ih_to_ah: u64,
	pub bytes_ah_to_ih: u64,
	pub packets_ih_to_ah: u64,
	pub packets_ah_to_ih: u64,
	pub error_count: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
}

/// A brokered byte stream between one IH and one AH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
	pub id: String,
	pub client_id: String,
	pub service_id: String,
	pub protocol: ServiceProtocol,
	pub status: TunnelStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ih_endpoint: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ah_endpoint: Option<String>,
	pub created_at: DateTime<Utc>,
	pub last_active: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub stats: TunnelStats,
}

#[derive(Debug, Clone)]
pub struct TunnelRequest {
	pub client_id: String,
	pub service_id: String,
	pub protocol: ServiceProtocol,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelFilter {
	pub client_id: Option<String>,
	pub service_id: Option<String>,
	pub status: Option<TunnelStatus>,
	pub limit: Option<usize>,
	pub offset: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("tunnel not found")]
	NotFound,

	#[error("tunnel expired")]
	Expired,

	#[error("tunnel is already {0}")]
	Terminal(&'static str),
}

/// In-memory map of live tunnels. Lookups are O(1) under a reader-writer
/// lock; the data-plane relay and the control plane share one instance.
pub struct TunnelRegistry {
	tunnels: RwLock<HashMap<String, Tunnel>>,
	default_ttl: chrono::Duration,
	metrics: Arc<MetricsRegistry>,
}

impl TunnelRegistry {
	pub fn new(default_ttl: Duration, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
		Arc::new(Self {
			tunnels: RwLock::new(HashMap::new()),
			default_ttl: chrono::Duration::from_std(default_ttl)
				.unwrap_or_else(|_| chrono::Duration::hours(1)),
			metrics,
		})
	}

	/// Allocate a new pending tunnel with a fresh UUID.
	pub async fn create(&self, request: TunnelRequest) -> Tunnel {
		let now = Utc::now();
		let mut tunnels = self.tunnels.write().await;
		// Uuid::new_v4 collisions are not a practical concern, but the id
		// uniqueness invariant is cheap to uphold explicitly.
		let id = loop {
			let candidate = Uuid::new_v4().to_string();
			if !tunnels.contains_key(&candidate) {
				break candidate;
			}
		};
		let tunnel = Tunnel {
			id: id.clone(),
			client_id: request.client_id,
			service_id: request.service_id,
			protocol: request.protocol,
			status: TunnelStatus::Pending,
			ih_endpoint: None,
			ah_endpoint: None,
			created_at: now,
			last_active: now,
			expires_at: now + self.default_ttl,
			stats: TunnelStats::default(),
		};
		tunnels.insert(id, tunnel.clone());
		drop(tunnels);

		self.metrics
			.tunnel_total
			.with_label_values(&["pending"])
			.inc();
		debug!(tunnel_id = %tunnel.id, client_id = %tunnel.client_id, "tunnel created");
		tunnel
	}

	pub async fn get(&self, id: &str) -> Option<Tunnel> {
		self.tunnels.read().await.get(id).cloned()
	}

	pub async fn stats(&self, id: &str) -> Option<TunnelStats> {
		self.tunnels.read().await.get(id).map(|t| t.stats.clone())
	}

	/// Replace a tunnel record wholesale.
	pub async fn update(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
		let mut tunnels = self.tunnels.write().await;
		if !tunnels.contains_key(&tunnel.id) {
			return Err(RegistryError::NotFound);
		}
		tunnels.insert(tunnel.id.clone(), tunnel);
		Ok(())
	}

	pub async fn delete(&self, id: &str) -> Result<Tunnel, RegistryError> {
		self.tunnels
			.write()
			.await
			.remove(id)
			.ok_or(RegistryError::NotFound)
	}

	pub async fn list(&self, filter: &TunnelFilter) -> Vec<Tunnel> {
		let tunnels = self.tunnels.read().await;
		let mut out: Vec<Tunnel> = tunnels
			.values()
			.filter(|t| {
				if let Some(client_id) = &filter.client_id {
					if &t.client_id != client_id {
						return false;
					}
				}
				if let Some(service_id) = &filter.service_id {
					if &t.service_id != service_id {
						return false;
					}
				}
				if let Some(status) = filter.status {
					if t.status != status {
						return false;
					}
				}
				true
			})
			.cloned()
			.collect();
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		let limit = filter.limit.unwrap_or(usize::MAX);
		out.into_iter().skip(filter.offset).take(limit).collect()
	}

	/// Count a client's non-terminal tunnels for a service. Used to enforce
	/// policy concurrency constraints at tunnel-create.
	pub async fn count_live(&self, client_id: &str, service_id: &str) -> usize {
		self.tunnels
			.read()
			.await
			.values()
			.filter(|t| {
				t.client_id == client_id
					&& t.service_id == service_id
					&& !t.status.is_terminal()
			})
			.count()
	}

	/// Transition a pending tunnel to active once both halves have paired
	/// at the relay.
	pub async fn mark_active(
		&self,
		id: &str,
		ih_endpoint: String,
		ah_endpoint: String,
	) -> Result<Tunnel, RegistryError> {
		let mut tunnels = self.tunnels.write().await;
		let tunnel = tunnels.get_mut(id).ok_or(RegistryError::NotFound)?;
		if tunnel.status.is_terminal() {
			return Err(RegistryError::Terminal(tunnel.status.as_str()));
		}
		let now = Utc::now();
		if now > tunnel.expires_at {
			return Err(RegistryError::Expired);
		}
		tunnel.status = TunnelStatus::Active;
		tunnel.ih_endpoint = Some(ih_endpoint);
		tunnel.ah_endpoint = Some(ah_endpoint);
		tunnel.last_active = now;
		Ok(tunnel.clone())
	}

	/// Finalize a tunnel after its relay completed, folding in transfer
	/// stats. `error` selects the terminal status.
	pub async fn finish(
		&self,
		id: &str,
		stats: TunnelStats,
		error: Option<String>,
	) -> Result<Tunnel, RegistryError> {
		let mut tunnels = self.tunnels.write().await;
		let tunnel = tunnels.get_mut(id).ok_or(RegistryError::NotFound)?;
		tunnel.stats.bytes_ih_to_ah += stats.bytes_ih_to_ah;
		tunnel.stats.bytes_ah_to_ih += stats.bytes_ah_to_ih;
		tunnel.stats.packets_ih_to_ah += stats.packets_ih_to_ah;
		tunnel.stats.packets_ah_to_ih += stats.packets_ah_to_ih;
		tunnel.last_active = Utc::now();
		match error {
			Some(reason) => {
				tunnel.status = TunnelStatus::Error;
				tunnel.stats.error_count += 1;
				tunnel.stats.last_error = Some(reason);
			}
			None => {
				tunnel.status = TunnelStatus::Closed;
			}
		}
		Ok(tunnel.clone())
	}

	/// Record a failure against a tunnel, transitioning it to `error`
	/// unless it already reached a terminal state.
	pub async fn record_error(&self, id: &str, reason: &str) {
		let mut tunnels = self.tunnels.write().await;
		if let Some(tunnel) = tunnels.get_mut(id) {
			tunnel.stats.error_count += 1;
			tunnel.stats.last_error = Some(reason.to_string());
			if !tunnel.status.is_terminal() {
				tunnel.status = TunnelStatus::Error;
			}
			tunnel.last_active = Utc::now();
		}
	}

	/// Spawn a sweep that fails pending tunnels whose TTL lapsed before
	/// either data-plane half arrived.
	pub fn start_cleanup(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
		let registry = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = tick.tick() => {
						let expired = registry.expire_stale().await;
						if expired > 0 {
							info!(expired, "tunnel sweep expired stale pending tunnels");
						}
					}
					_ = shutdown.changed() => return,
				}
			}
		});
	}

	async fn expire_stale(&self) -> usize {
		let mut tunnels = self.tunnels.write().await;
		let now = Utc::now();
		let mut expired = 0;
		for tunnel in tunnels.values_mut() {
			if tunnel.status == TunnelStatus::Pending && now > tunnel.expires_at {
				tunnel.status = TunnelStatus::Error;
				tunnel.stats.error_count += 1;
				tunnel.stats.last_error = Some("expired".to_string());
				expired += 1;
			}
		}
		expired
	}
}

/// Service catalog over the `ServiceStore` repository. Every mutation fires
/// the corresponding service event to SSE subscribers so AH agents converge
/// on catalog changes without polling.
pub struct ServiceCatalog {
	store: Arc<dyn ServiceStore>,
	notifier: Arc<SseNotifier>,
}

impl ServiceCatalog {
	pub fn new(store: Arc<dyn ServiceStore>, notifier: Arc<SseNotifier>) -> Arc<Self> {
		Arc::new(Self { store, notifier })
	}

	pub async fn create_service(
		&self,
		mut service: ServiceConfig,
	) -> Result<ServiceConfig, StoreError> {
		let now = Utc::now();
		service.created_at = now;
		service.updated_at = now;
		self.store.upsert(service.clone()).await?;
		self.notifier
			.notify_service(ServiceEventType::ServiceCreated, service.clone());
		Ok(service)
	}

	pub async fn update_service(
		&self,
		mut service: ServiceConfig,
	) -> Result<ServiceConfig, StoreError> {
		let existing = self
			.store
			.get(&service.service_id)
			.await?
			.ok_or_else(|| StoreError::Backend("unknown service".to_string()))?;
		service.created_at = existing.created_at;
		service.updated_at = Utc::now();
		self.store.upsert(service.clone()).await?;
		self.notifier
			.notify_service(ServiceEventType::ServiceUpdated, service.clone());
		Ok(service)
	}

	/// Soft-delete: the service stays addressable for diagnostics but is
	/// excluded from the active catalog and from tunnel creation.
	pub async fn delete_service(&self, service_id: &str) -> Result<bool, StoreError> {
		let Some(mut service) = self.store.get(service_id).await? else {
			return Ok(false);
		};
		service.status = ServiceStatus::Deleted;
		service.updated_at = Utc::now();
		self.store.upsert(service.clone()).await?;
		self.notifier
			.notify_service(ServiceEventType::ServiceDeleted, service);
		Ok(true)
	}

	pub async fn get_service(&self, service_id: &str) -> Result<Option<ServiceConfig>, StoreError> {
		self.store.get(service_id).await
	}

	pub async fn list_services(&self, active_only: bool) -> Result<Vec<ServiceConfig>, StoreError> {
		let all = self.store.list().await?;
		if active_only {
			Ok(all
				.into_iter()
				.filter(|s| s.status == ServiceStatus::Active)
				.collect())
		} else {
			Ok(all)
		}
	}
}
