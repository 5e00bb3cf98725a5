use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::observability::MetricsRegistry;

/// Device posture reported by a client at handshake and consulted by policy
/// conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub os: String,
	#[serde(default)]
	pub os_version: String,
	#[serde(default)]
	pub compliance: bool,
}

/// A live control-plane session, keyed by an opaque token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
	pub token: String,
	pub client_id: String,
	pub cert_fingerprint: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device_info: Option<DeviceInfo>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub last_access_at: DateTime<Utc>,
}

impl Session {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now > self.expires_at
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
	#[error("invalid session request: {0}")]
	BadRequest(String),

	#[error("session not found")]
	NotFound,

	#[error("session expired")]
	Expired,
}

/// Summary counters reported by `SessionStore::stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStats {
	pub total: usize,
	pub active: usize,
	pub expired: usize,
	pub clients: usize,
}

struct SessionMaps {
	sessions: HashMap<String, Session>,
	by_client: HashMap<String, HashSet<String>>,
}

impl SessionMaps {
	/// Remove a token from both maps, keeping the per-client index in sync.
	fn remove(&mut self, token: &str) -> Option<Session> {
		let session = self.sessions.remove(token)?;
		if let Some(tokens) = self.by_client.get_mut(&session.client_id) {
			tokens.remove(token);
			if tokens.is_empty() {
				self.by_client.remove(&session.client_id);
			}
		}
		Some(session)
	}
}

/// In-memory session store with TTL, refresh, revocation, and a background
/// expiry sweep. One lock guards both maps so the token map and the
/// per-client index can never diverge.
pub struct SessionStore {
	ttl: Duration,
	inner: RwLock<SessionMaps>,
	metrics: Arc<MetricsRegistry>,
}

impl SessionStore {
	pub fn new(ttl: Duration, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
		Arc::new(Self {
			ttl,
			inner: RwLock::new(SessionMaps {
				sessions: HashMap::new(),
				by_client: HashMap::new(),
			}),
			metrics,
		})
	}

	/// Mint a new session for a verified client. The token is 32 random
	/// bytes, hex-encoded, and never derived from client input.
	pub async fn create(
		&self,
		client_id: &str,
		cert_fingerprint: &str,
		device_info: Option<DeviceInfo>,
		metadata: HashMap<String, String>,
	) -> Result<Session, SessionError> {
		if client_id.is_empty() {
			return Err(SessionError::BadRequest("client_id is empty".to_string()));
		}

		let mut token_bytes = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut token_bytes);
		let token = hex::encode(token_bytes);

		let now = Utc::now();
		let session = Session {
			token: token.clone(),
			client_id: client_id.to_string(),
			cert_fingerprint: cert_fingerprint.to_string(),
			device_info,
			metadata,
			created_at: now,
			expires_at: now + self.ttl,
			last_access_at: now,
		};

		let mut maps = self.inner.write().await;
		maps.sessions.insert(token.clone(), session.clone());
		maps.by_client
			.entry(client_id.to_string())
			.or_default()
			.insert(token);
		drop(maps);

		self.metrics.sessions_created_total.inc();
		self.metrics.active_sessions.inc();
		debug!(client_id = %client_id, "session created");
		Ok(session)
	}

	/// Validate a token, touching `last_access_at`. Expired sessions are
	/// removed eagerly rather than waiting for the sweep.
	pub async fn validate(&self, token: &str) -> Result<Session, SessionError> {
		let mut maps = self.inner.write().await;
		let now = Utc::now();

		match maps.sessions.get_mut(token) {
			None => return Err(SessionError::NotFound),
			Some(session) if !session.is_expired(now) => {
				session.last_access_at = now;
				return Ok(session.clone());
			}
			Some(_) => {}
		}

		maps.remove(token);
		self.metrics.active_sessions.dec();
		self.metrics.sessions_expired_total.inc();
		Err(SessionError::Expired)
	}

	/// Extend a live session: `expires_at = now + TTL`, touch `last_access_at`.
	pub async fn refresh(&self, token: &str) -> Result<Session, SessionError> {
		let mut maps = self.inner.write().await;
		let now = Utc::now();

		match maps.sessions.get_mut(token) {
			None => return Err(SessionError::NotFound),
			Some(session) if !session.is_expired(now) => {
				session.expires_at = now + self.ttl;
				session.last_access_at = now;
				return Ok(session.clone());
			}
			Some(_) => {}
		}

		maps.remove(token);
		self.metrics.active_sessions.dec();
		self.metrics.sessions_expired_total.inc();
		Err(SessionError::Expired)
	}

	/// Remove a session from both maps.
	pub async fn revoke(&self, token: &str) -> Result<(), SessionError> {
		let mut maps = self.inner.write().await;
		match maps.remove(token) {
			Some(session) => {
				self.metrics.sessions_revoked_total.inc();
				self.metrics.active_sessions.dec();
				debug!(client_id = %session.client_id, "session revoked");
				Ok(())
			}
			None => Err(SessionError::NotFound),
		}
	}

	/// All non-expired sessions for a client.
	pub async fn by_client(&self, client_id: &str) -> Vec<Session> {
		let maps = self.inner.read().await;
		let now = Utc::now();
		let Some(tokens) = maps.by_client.get(client_id) else {
			return Vec::new();
		};
		tokens
			.iter()
			.filter_map(|t| maps.sessions.get(t))
			.filter(|s| !s.is_expired(now))
			.cloned()
			.collect()
	}

	/// All non-expired sessions.
	pub async fn active(&self) -> Vec<Session> {
		let maps = self.inner.read().await;
		let now = Utc::now();
		maps.sessions
			.values()
			.filter(|s| !s.is_expired(now))
			.cloned()
			.collect()
	}

	pub async fn stats(&self) -> SessionStats {
		let maps = self.inner.read().await;
		let now = Utc::now();
		let expired = maps
			.sessions
			.values()
			.filter(|s| s.is_expired(now))
			.count();
		SessionStats {
			total: maps.sessions.len(),
			active: maps.sessions.len() - expired,
			expired,
			clients: maps.by_client.len(),
		}
	}

	/// Spawn the background expiry sweep. Runs until the shutdown signal
	/// flips.
	pub fn start_cleanup(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
		let store = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = tick.tick() => {
						let removed = store.sweep().await;
						if removed > 0 {
							info!(removed, "session sweep removed expired sessions");
						}
					}
					_ = shutdown.changed() => {
						debug!("session sweep stopping");
						return;
					}
				}
			}
		});
	}

	async fn sweep(&self) -> usize {
		let mut maps = self.inner.write().await;
		let now = Utc::now();
		let stale: Vec<String> = maps
			.sessions
			.values()
			.filter(|s| s.is_expired(now))
			.map(|s| s.token.clone())
			.collect();
		for token in &stale {
			maps.remove(token);
			self.metrics.active_sessions.dec();
			self.metrics.sessions_expired_total.inc();
		}
		stale.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store_with_ttl(ttl: Duration) -> Arc<SessionStore> {
		SessionStore::new(ttl, Arc::new(MetricsRegistry::new()))
	}

	#[tokio::test]
	async fn create_mints_opaque_64_hex_token() {
		let store = store_with_ttl(Duration::from_secs(60));
		let s = store
			.create("ih-test-01", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		assert_eq!(s.token.len(), 64);
		assert!(s.token.chars().all(|c| c.is_ascii_hexdigit()));
		assert!(s.created_at <= s.last_access_at);
		assert!(s.last_access_at <= s.expires_at);
	}

	#[tokio::test]
	async fn create_rejects_empty_client_id() {
		let store = store_with_ttl(Duration::from_secs(60));
		let err = store
			.create("", "sha256:ab", None, HashMap::new())
			.await
			.unwrap_err();
		assert!(matches!(err, SessionError::BadRequest(_)));
	}

	#[tokio::test]
	async fn validate_touches_last_access() {
		let store = store_with_ttl(Duration::from_secs(60));
		let s = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(5)).await;
		let v = store.validate(&s.token).await.unwrap();
		assert!(v.last_access_at >= s.last_access_at);
		assert!(v.last_access_at <= v.expires_at);
	}

	#[tokio::test]
	async fn validate_unknown_token_is_not_found() {
		let store = store_with_ttl(Duration::from_secs(60));
		assert_eq!(
			store.validate("deadbeef").await.unwrap_err(),
			SessionError::NotFound
		);
	}

	#[tokio::test]
	async fn expired_session_fails_validation() {
		let store = store_with_ttl(Duration::from_millis(10));
		let s = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(
			store.validate(&s.token).await.unwrap_err(),
			SessionError::Expired
		);
		// eager removal: second call is NotFound
		assert_eq!(
			store.validate(&s.token).await.unwrap_err(),
			SessionError::NotFound
		);
	}

	#[tokio::test]
	async fn refresh_extends_expiry_monotonically() {
		let store = store_with_ttl(Duration::from_secs(60));
		let s = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		let r1 = store.refresh(&s.token).await.unwrap();
		let r2 = store.refresh(&s.token).await.unwrap();
		assert!(r1.expires_at >= s.expires_at);
		assert!(r2.expires_at >= r1.expires_at);
	}

	#[tokio::test]
	async fn revoke_is_observable_and_idempotence_fails() {
		let store = store_with_ttl(Duration::from_secs(60));
		let s = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		store.revoke(&s.token).await.unwrap();
		assert_eq!(
			store.validate(&s.token).await.unwrap_err(),
			SessionError::NotFound
		);
		assert_eq!(
			store.revoke(&s.token).await.unwrap_err(),
			SessionError::NotFound
		);
	}

	#[tokio::test]
	async fn by_client_tracks_index() {
		let store = store_with_ttl(Duration::from_secs(60));
		let a1 = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		let _a2 = store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		let _b = store
			.create("ih-b", "sha256:cd", None, HashMap::new())
			.await
			.unwrap();

		assert_eq!(store.by_client("ih-a").await.len(), 2);
		assert_eq!(store.by_client("ih-b").await.len(), 1);
		assert!(store.by_client("ih-c").await.is_empty());

		store.revoke(&a1.token).await.unwrap();
		assert_eq!(store.by_client("ih-a").await.len(), 1);
	}

	#[tokio::test]
	async fn sweep_removes_expired_sessions() {
		let store = store_with_ttl(Duration::from_millis(10));
		for _ in 0..3 {
			store
				.create("ih-a", "sha256:ab", None, HashMap::new())
				.await
				.unwrap();
		}
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(store.sweep().await, 3);
		let stats = store.stats().await;
		assert_eq!(stats.total, 0);
		assert_eq!(stats.clients, 0);
	}

	#[tokio::test]
	async fn stats_counts_active_and_expired() {
		let store = store_with_ttl(Duration::from_secs(60));
		store
			.create("ih-a", "sha256:ab", None, HashMap::new())
			.await
			.unwrap();
		let stats = store.stats().await;
		assert_eq!(
			stats,
			SessionStats {
				total: 1,
				active: 1,
				expired: 0,
				clients: 1
			}
		);
	}
}
