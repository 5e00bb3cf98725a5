use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::observability::MetricsRegistry;

/// Capacity of the channel feeding the background writer. The writer only
/// does sequential appends, so this bound is generous; if it still fills,
/// records keep landing in the in-memory index and only the file write is
/// skipped.
const WRITER_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
	Access,
	Connection,
	Security,
}

impl AuditKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Access => "access",
			Self::Connection => "connection",
			Self::Security => "security",
		}
	}
}

/// One audit record, persisted as a single JSON document per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
	pub id: String,
	pub event_type: AuditKind,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tunnel_id: Option<String>,
	pub action: String,
	pub result: String,
	pub severity: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_ip: Option<String>,
	#[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
	pub details: serde_json::Value,
}

/// Builder-style input for one record; the logger fills id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
	pub client_id: Option<String>,
	pub service_id: Option<String>,
	pub tunnel_id: Option<String>,
	pub action: String,
	pub result: String,
	pub severity: String,
	pub source_ip: Option<String>,
	pub details: serde_json::Value,
}

/// Query over the in-memory index.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
	pub event_type: Option<AuditKind>,
	pub client_id: Option<String>,
	pub service_id: Option<String>,
	pub action: Option<String>,
	pub result: Option<String>,
	pub severity: Option<String>,
	pub from: Option<DateTime<Utc>>,
	pub to: Option<DateTime<Utc>>,
	pub limit: Option<usize>,
	pub offset: usize,
}

/// Append-only audit logger: JSONL file fed by a background writer plus an
/// in-memory index for queries. Logging never blocks the caller.
pub struct AuditLogger {
	tx: mpsc::Sender<AuditRecord>,
	index: RwLock<Vec<AuditRecord>>,
	metrics: Arc<MetricsRegistry>,
}

impl AuditLogger {
	/// Create the logger and spawn its writer task. Must be called inside a
	/// tokio runtime.
	pub fn new(path: impl Into<PathBuf>, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
		let path = path.into();
		let (tx, mut rx) = mpsc::channel::<AuditRecord>(WRITER_QUEUE_CAPACITY);

		tokio::spawn(async move {
			let file = tokio::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(&path)
				.await;
			let mut file = match file {
				Ok(f) => f,
				Err(e) => {
					error!(path = %path.display(), error = %e, "failed to open audit log; records will be index-only");
					// Drain the channel so senders never observe it as full.
					while rx.recv().await.is_some() {}
					return;
				}
			};
			while let Some(record) = rx.recv().await {
				let mut line = match serde_json::to_vec(&record) {
					Ok(v) => v,
					Err(e) => {
						error!(error = %e, "failed to serialize audit record");
						continue;
					}
				};
				line.push(b'\n');
				if let Err(e) = file.write_all(&line).await {
					error!(error = %e, "failed to append audit record");
				}
			}
			let _ = file.flush().await;
		});

		Arc::new(Self {
			tx,
			index: RwLock::new(Vec::new()),
			metrics,
		})
	}

	pub fn log_access(&self, entry: AuditEntry) {
		self.log(AuditKind::Access, entry);
	}

	pub fn log_connection(&self, entry: AuditEntry) {
		self.log(AuditKind::Connection, entry);
	}

	pub fn log_security(&self, entry: AuditEntry) {
		self.log(AuditKind::Security, entry);
	}

	fn log(&self, kind: AuditKind, entry: AuditEntry) {
		let record = AuditRecord {
			id: Uuid::new_v4().to_string(),
			event_type: kind,
			timestamp: Utc::now(),
			client_id: entry.client_id,
			service_id: entry.service_id,
			tunnel_id: entry.tunnel_id,
			action: entry.action,
			result: entry.result,
			severity: if entry.severity.is_empty() {
				"info".to_string()
			} else {
				entry.severity
			},
			source_ip: entry.source_ip,
			details: entry.details,
		};

		self.metrics
			.audit_records_total
			.with_label_values(&[kind.as_str()])
			.inc();

		if let Ok(mut index) = self.index.write() {
			index.push(record.clone());
		}
		if self.tx.try_send(record).is_err() {
			warn!("audit writer queue full; record kept in index only");
		}
	}

	/// Query the in-memory index, newest records last, with limit/offset.
	pub fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
		let index = match self.index.read() {
			Ok(i) => i,
			Err(_) => return Vec::new(),
		};
		let limit = query.limit.unwrap_or(usize::MAX);
		index
			.iter()
			.filter(|r| {
				if let Some(kind) = query.event_type {
					if r.event_type != kind {
						return false;
					}
				}
				if let Some(client_id) = &query.client_id {
					if r.client_id.as_deref() != Some(client_id.as_str()) {
						return false;
					}
				}
				if let Some(service_id) = &query.service_id {
					if r.service_id.as_deref() != Some(service_id.as_str()) {
						return false;
					}
				}
				if let Some(action) = &query.action {
					if &r.action != action {
						return false;
					}
				}
				if let Some(result) = &query.result {
					if &r.result != result {
						return false;
					}
				}
				if let Some(severity) = &query.severity {
					if &r.severity != severity {
						return false;
					}
				}
				if let Some(from) = query.from {
					if r.timestamp < from {
						return false;
					}
				}
				if let Some(to) = query.to {
					if r.timestamp > to {
						return false;
					}
				}
				true
			})
			.skip(query.offset)
			.take(limit)
			.cloned()
			.collect()
	}
}
