//! Repository interfaces for durable state.
//!
//! Sessions, tunnels, and SSE subscribers live in memory; policies, service
//! configs, and certificate records go through the capabilities below. The
//! in-memory implementations are the default backend and the test vehicle;
//! `sql` provides Postgres-backed equivalents.

pub mod sql;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::registry::ServiceConfig;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("storage backend error: {0}")]
	Backend(String),

	#[error("failed to (de)serialize stored value: {0}")]
	Serialization(String),
}

/// A client certificate seen at handshake, registered by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateRecord {
	/// `"sha256:" + hex(SHA256(DER))`; unique.
	pub fingerprint: String,
	pub client_id: String,
	pub subject: String,
	pub not_before: i64,
	pub not_after: i64,
	pub registered_at: DateTime<Utc>,
	pub last_seen_at: DateTime<Utc>,
}

/// Storage capability for the service catalog.
#[async_trait]
pub trait ServiceStore: Send + Sync {
	async fn upsert(&self, service: ServiceConfig) -> Result<(), StoreError>;
	async fn get(&self, service_id: &str) -> Result<Option<ServiceConfig>, StoreError>;
	async fn list(&self) -> Result<Vec<ServiceConfig>, StoreError>;
	async fn remove(&self, service_id: &str) -> Result<bool, StoreError>;
}

/// Storage capability for certificate records, keyed by fingerprint.
#[async_trait]
pub trait CertificateStore: Send + Sync {
	/// Insert the record, or touch `last_seen_at` and `client_id` when the
	/// fingerprint is already known.
	async fn register(&self, record: CertificateRecord) -> Result<(), StoreError>;
	async fn by_fingerprint(&self, fingerprint: &str)
	-> Result<Option<CertificateRecord>, StoreError>;
	async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError>;
}

/// In-memory service store.
#[derive(Default)]
pub struct MemoryServiceStore {
	services: RwLock<HashMap<String, ServiceConfig>>,
}

impl MemoryServiceStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ServiceStore for MemoryServiceStore {
	async fn upsert(&self, service: ServiceConfig) -> Result<(), StoreError> {
		self.services
			.write()
			.await
			.insert(service.service_id.clone(), service);
		Ok(())
	}

	async fn get(&self, service_id: &str) -> Result<Option<ServiceConfig>, StoreError> {
		Ok(self.services.read().await.get(service_id).cloned())
	}

	async fn list(&self) -> Result<Vec<ServiceConfig>, StoreError> {
		let mut out: Vec<ServiceConfig> = self.services.read().await.values().cloned().collect();
		out.sort_by(|a, b| a.service_id.cmp(&b.service_id));
		Ok(out)
	}

	async fn remove(&self, service_id: &str) -> Result<bool, StoreError> {
		Ok(self.services.write().await.remove(service_id).is_some())
	}
}

/// In-memory certificate store with a unique fingerprint index.
#[derive(Default)]
pub struct MemoryCertificateStore {
	records: RwLock<HashMap<String, CertificateRecord>>,
}

impl MemoryCertificateStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
	async fn register(&self, record: CertificateRecord) -> Result<(), StoreError> {
		let mut records = self.records.write().await;
		match records.get_mut(&record.fingerprint) {
			Some(existing) => {
				existing.last_seen_at = record.last_seen_at;
				existing.client_id = record.client_id;
			}
			None => {
				records.insert(record.fingerprint.clone(), record);
			}
		}
		Ok(())
	}

	async fn by_fingerprint(
		&self,
		fingerprint: &str,
	) -> Result<Option<CertificateRecord>, StoreError> {
		Ok(self.records.read().await.get(fingerprint).cloned())
	}

	async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
		Ok(self.records.read().await.values().cloned().collect())
	}
}
