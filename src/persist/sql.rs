//! Postgres-backed repositories.
//!
//! Documents are stored as JSON text beside the columns the queries filter
//! on; schema migrations are owned by the deployment, but `ensure_schema`
//! creates the tables when they are absent so a fresh database works out of
//! the box.
//!
//! Expected tables:
//! - `bifrost_policies(policy_id TEXT PRIMARY KEY, client_id TEXT NOT NULL,
//!   service_id TEXT NOT NULL, expiry_unix BIGINT, doc TEXT NOT NULL)`
//! - `bifrost_services(service_id TEXT PRIMARY KEY, doc TEXT NOT NULL)`
//! - `bifrost_certificates(fingerprint TEXT PRIMARY KEY, doc TEXT NOT NULL)`

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use super::{CertificateRecord, CertificateStore, ServiceStore, StoreError};
use crate::policy::{Policy, PolicyFilter, PolicyStore};
use crate::registry::ServiceConfig;

fn backend(e: sqlx::Error) -> StoreError {
	StoreError::Backend(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(doc: &str) -> Result<T, StoreError> {
	serde_json::from_str(doc).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
	serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Create the Bifrost tables when they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS bifrost_policies (
			policy_id TEXT PRIMARY KEY,
			client_id TEXT NOT NULL,
			service_id TEXT NOT NULL,
			expiry_unix BIGINT,
			doc TEXT NOT NULL
		)",
	)
	.execute(pool)
	.await
	.map_err(backend)?;
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS bifrost_services (
			service_id TEXT PRIMARY KEY,
			doc TEXT NOT NULL
		)",
	)
	.execute(pool)
	.await
	.map_err(backend)?;
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS bifrost_certificates (
			fingerprint TEXT PRIMARY KEY,
			doc TEXT NOT NULL
		)",
	)
	.execute(pool)
	.await
	.map_err(backend)?;
	Ok(())
}

pub struct PgPolicyStore {
	pool: PgPool,
}

impl PgPolicyStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
	async fn save(&self, policy: Policy) -> Result<(), StoreError> {
		let doc = encode(&policy)?;
		sqlx::query(
			"INSERT INTO bifrost_policies (policy_id, client_id, service_id, expiry_unix, doc)
			 VALUES ($1, $2, $3, $4, $5)
			 ON CONFLICT (policy_id) DO UPDATE
			 SET client_id = $2, service_id = $3, expiry_unix = $4, doc = $5",
		)
		.bind(&policy.policy_id)
		.bind(&policy.client_id)
		.bind(&policy.service_id)
		.bind(policy.expiry_time.map(|t| t.timestamp()))
		.bind(doc)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn get(&self, policy_id: &str) -> Result<Option<Policy>, StoreError> {
		let row = sqlx::query("SELECT doc FROM bifrost_policies WHERE policy_id = $1")
			.bind(policy_id)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		match row {
			Some(row) => {
				let doc: String = row.try_get("doc").map_err(backend)?;
				Ok(Some(decode(&doc)?))
			}
			None => Ok(None),
		}
	}

	async fn delete(&self, policy_id: &str) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM bifrost_policies WHERE policy_id = $1")
			.bind(policy_id)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(result.rows_affected() > 0)
	}

	async fn query(&self, filter: &PolicyFilter) -> Result<Vec<Policy>, StoreError> {
		let rows = match (&filter.client_id, &filter.service_id) {
			(Some(client_id), Some(service_id)) => {
				sqlx::query(
					"SELECT doc FROM bifrost_policies
					 WHERE client_id = $1 AND service_id = $2",
				)
				.bind(client_id)
				.bind(service_id)
				.fetch_all(&self.pool)
				.await
			}
			(Some(client_id), None) => {
				sqlx::query("SELECT doc FROM bifrost_policies WHERE client_id = $1")
					.bind(client_id)
					.fetch_all(&self.pool)
					.await
			}
			(None, Some(service_id)) => {
				sqlx::query("SELECT doc FROM bifrost_policies WHERE service_id = $1")
					.bind(service_id)
					.fetch_all(&self.pool)
					.await
			}
			(None, None) => {
				sqlx::query("SELECT doc FROM bifrost_policies")
					.fetch_all(&self.pool)
					.await
			}
		}
		.map_err(backend)?;

		let now = Utc::now();
		let mut policies = Vec::with_capacity(rows.len());
		for row in rows {
			let doc: String = row.try_get("doc").map_err(backend)?;
			let policy: Policy = decode(&doc)?;
			if filter.active {
				if let Some(expiry) = policy.expiry_time {
					if expiry <= now {
						continue;
					}
				}
			}
			policies.push(policy);
		}
		policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(policies)
	}
}

pub struct PgServiceStore {
	pool: PgPool,
}

impl PgServiceStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl ServiceStore for PgServiceStore {
	async fn upsert(&self, service: ServiceConfig) -> Result<(), StoreError> {
		let doc = encode(&service)?;
		sqlx::query(
			"INSERT INTO bifrost_services (service_id, doc) VALUES ($1, $2)
			 ON CONFLICT (service_id) DO UPDATE SET doc = $2",
		)
		.bind(&service.service_id)
		.bind(doc)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn get(&self, service_id: &str) -> Result<Option<ServiceConfig>, StoreError> {
		let row = sqlx::query("SELECT doc FROM bifrost_services WHERE service_id = $1")
			.bind(service_id)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		match row {
			Some(row) => {
				let doc: String = row.try_get("doc").map_err(backend)?;
				Ok(Some(decode(&doc)?))
			}
			None => Ok(None),
		}
	}

	async fn list(&self) -> Result<Vec<ServiceConfig>, StoreError> {
		let rows = sqlx::query("SELECT doc FROM bifrost_services ORDER BY service_id")
			.fetch_all(&self.pool)
			.await
			.map_err(backend)?;
		let mut services = Vec::with_capacity(rows.len());
		for row in rows {
			let doc: String = row.try_get("doc").map_err(backend)?;
			services.push(decode(&doc)?);
		}
		Ok(services)
	}

	async fn remove(&self, service_id: &str) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM bifrost_services WHERE service_id = $1")
			.bind(service_id)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(result.rows_affected() > 0)
	}
}

pub struct PgCertificateStore {
	pool: PgPool,
}

impl PgCertificateStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl CertificateStore for PgCertificateStore {
	async fn register(&self, record: CertificateRecord) -> Result<(), StoreError> {
		// Preserve the original registration time on re-registration; only
		// client id and last-seen follow the newest handshake.
		let existing = self.by_fingerprint(&record.fingerprint).await?;
		let merged = match existing {
			Some(mut found) => {
				found.client_id = record.client_id;
				found.last_seen_at = record.last_seen_at;
				found
			}
			None => record,
		};
		let doc = encode(&merged)?;
		sqlx::query(
			"INSERT INTO bifrost_certificates (fingerprint, doc) VALUES ($1, $2)
			 ON CONFLICT (fingerprint) DO UPDATE SET doc = $2",
		)
		.bind(&merged.fingerprint)
		.bind(doc)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn by_fingerprint(
		&self,
		fingerprint: &str,
	) -> Result<Option<CertificateRecord>, StoreError> {
		let row = sqlx::query("SELECT doc FROM bifrost_certificates WHERE fingerprint = $1")
			.bind(fingerprint)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		match row {
			Some(row) => {
				let doc: String = row.try_get("doc").map_err(backend)?;
				Ok(Some(decode(&doc)?))
			}
			None => Ok(None),
		}
	}

	async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
		let rows = sqlx::query("SELECT doc FROM bifrost_certificates")
			.fetch_all(&self.pool)
			.await
			.map_err(backend)?;
		let mut records = Vec::with_capacity(rows.len());
		for row in rows {
			let doc: String = row.try_get("doc").map_err(backend)?;
			records.push(decode(&doc)?);
		}
		Ok(records)
	}
}
