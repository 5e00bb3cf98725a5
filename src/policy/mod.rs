//! Per-(client, service) access policy and its evaluator.
//!
//! A policy matches a request when client and service ids match, the policy
//! has not expired, and every condition holds against the request context.
//! Evaluation is fail-closed: a condition that cannot be evaluated (unknown
//! type or operator, malformed value) fails its policy, and a request with no
//! matching policy is denied.

pub mod store;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::observability::MetricsRegistry;
use crate::session::DeviceInfo;
pub use store::{MemoryPolicyStore, PolicyStore};

/// A single policy condition. Type and operator are kept as strings on the
/// wire so unknown values flow into the fail-closed evaluation path instead
/// of being rejected at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
	#[serde(rename = "type")]
	pub ctype: String,
	pub operator: String,
	pub value: serde_json::Value,
}

/// A persisted access rule for one (client, service) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
	pub policy_id: String,
	pub client_id: String,
	pub service_id: String,
	/// Advisory bandwidth ceiling in bytes per second.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bandwidth_limit: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub concurrency_limit: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expiry_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub conditions: Vec<Condition>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Filter for `PolicyStore::query`. `active` restricts results to policies
/// whose `expiry_time` is unset or in the future.
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
	pub client_id: Option<String>,
	pub service_id: Option<String>,
	pub active: bool,
}

/// Context a tunnel request is evaluated against.
#[derive(Debug, Clone)]
pub struct AccessRequest {
	pub client_id: String,
	pub service_id: String,
	pub device_info: Option<DeviceInfo>,
	pub source_ip: Option<IpAddr>,
	pub timestamp: DateTime<Utc>,
}

/// Constraints carried from a matched policy into the tunnel-create
/// response for downstream enforcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bandwidth_limit: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub concurrency_limit: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
}

/// The outcome of evaluating access for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessDecision {
	pub allowed: bool,
	pub reason: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub matched_policy: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub constraints: Option<Constraints>,
}

impl AccessDecision {
	fn deny(reason: &str) -> Self {
		Self {
			allowed: false,
			reason: reason.to_string(),
			matched_policy: None,
			constraints: None,
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
	#[error("unknown condition type: {0}")]
	UnknownType(String),

	#[error("unknown operator {operator} for condition type {ctype}")]
	UnknownOperator { ctype: String, operator: String },

	#[error("malformed condition value: {0}")]
	BadValue(String),
}

/// Maps a source address to a country code. The lookup backend (GeoIP
/// database, external service) is an external collaborator; the default
/// resolver knows nothing and therefore fails `geo_location` conditions
/// closed.
#[async_trait]
pub trait GeoResolver: Send + Sync {
	async fn country(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver used when no geo backend is configured.
pub struct NoGeoResolver;

#[async_trait]
impl GeoResolver for NoGeoResolver {
	async fn country(&self, _ip: IpAddr) -> Option<String> {
		None
	}
}

/// Pluggable evaluation strategy over a set of candidate policies.
#[async_trait]
pub trait AccessEvaluator: Send + Sync {
	async fn evaluate(&self, policies: &[Policy], request: &AccessRequest) -> AccessDecision;
}

/// The default first-match AND evaluator described by the access model.
pub struct DefaultEvaluator {
	geo: Arc<dyn GeoResolver>,
	metrics: Arc<MetricsRegistry>,
}

impl DefaultEvaluator {
	pub fn new(geo: Arc<dyn GeoResolver>, metrics: Arc<MetricsRegistry>) -> Self {
		Self { geo, metrics }
	}

	async fn eval_condition(
		&self,
		cond: &Condition,
		request: &AccessRequest,
	) -> Result<bool, EvalError> {
		match cond.ctype.as_str() {
			"device_os" => self.eval_device_os(cond, request.device_info.as_ref()),
			"device_compliance" => self.eval_device_compliance(cond, request.device_info.as_ref()),
			"time_range" => eval_time_range(cond, request.timestamp),
			"geo_location" => self.eval_geo(cond, request.source_ip).await,
			other => Err(EvalError::UnknownType(other.to_string())),
		}
	}

	fn eval_device_os(
		&self,
		cond: &Condition,
		device: Option<&DeviceInfo>,
	) -> Result<bool, EvalError> {
		// Missing device info fails the condition, never the evaluation.
		let Some(device) = device else {
			return Ok(false);
		};
		match cond.operator.as_str() {
			"eq" => {
				let want = value_as_str(&cond.value)?;
				Ok(device.os.eq_ignore_ascii_case(want))
			}
			"ne" => {
				let want = value_as_str(&cond.value)?;
				Ok(!device.os.eq_ignore_ascii_case(want))
			}
			"in" => {
				let list = value_as_str_list(&cond.value)?;
				Ok(list.iter().any(|v| device.os.eq_ignore_ascii_case(v)))
			}
			op => Err(EvalError::UnknownOperator {
				ctype: cond.ctype.clone(),
				operator: op.to_string(),
			}),
		}
	}

	fn eval_device_compliance(
		&self,
		cond: &Condition,
		device: Option<&DeviceInfo>,
	) -> Result<bool, EvalError> {
		let Some(device) = device else {
			return Ok(false);
		};
		match cond.operator.as_str() {
			"eq" => {
				let want = cond
					.value
					.as_bool()
					.ok_or_else(|| EvalError::BadValue(cond.value.to_string()))?;
				Ok(device.compliance == want)
			}
			op => Err(EvalError::UnknownOperator {
				ctype: cond.ctype.clone(),
				operator: op.to_string(),
			}),
		}
	}

	async fn eval_geo(
		&self,
		cond: &Condition,
		source_ip: Option<IpAddr>,
	) -> Result<bool, EvalError> {
		match cond.operator.as_str() {
			"in" => {
				let list = value_as_str_list(&cond.value)?;
				let Some(ip) = source_ip else {
					return Ok(false);
				};
				let Some(country) = self.geo.country(ip).await else {
					return Ok(false);
				};
				Ok(list.iter().any(|v| country.eq_ignore_ascii_case(v)))
			}
			"not_in" => {
				let list = value_as_str_list(&cond.value)?;
				let Some(ip) = source_ip else {
					return Ok(false);
				};
				let Some(country) = self.geo.country(ip).await else {
					return Ok(false);
				};
				Ok(!list.iter().any(|v| country.eq_ignore_ascii_case(v)))
			}
			op => Err(EvalError::UnknownOperator {
				ctype: cond.ctype.clone(),
				operator: op.to_string(),
			}),
		}
	}
}

fn value_as_str(value: &serde_json::Value) -> Result<&str, EvalError> {
	value
		.as_str()
		.ok_or_else(|| EvalError::BadValue(value.to_string()))
}

fn value_as_str_list(value: &serde_json::Value) -> Result<Vec<&str>, EvalError> {
	let arr = value
		.as_array()
		.ok_or_else(|| EvalError::BadValue(value.to_string()))?;
	arr.iter()
		.map(|v| v.as_str().ok_or_else(|| EvalError::BadValue(v.to_string())))
		.collect()
}

/// Parse a time bound as RFC3339 text or Unix seconds.
fn parse_time_bound(value: &serde_json::Value) -> Result<DateTime<Utc>, EvalError> {
	if let Some(s) = value.as_str() {
		return DateTime::parse_from_rfc3339(s)
			.map(|t| t.with_timezone(&Utc))
			.map_err(|e| EvalError::BadValue(format!("{}: {}", s, e)));
	}
	if let Some(n) = value.as_i64() {
		return Utc
			.timestamp_opt(n, 0)
			.single()
			.ok_or_else(|| EvalError::BadValue(format!("timestamp out of range: {}", n)));
	}
	Err(EvalError::BadValue(value.to_string()))
}

fn eval_time_range(cond: &Condition, at: DateTime<Utc>) -> Result<bool, EvalError> {
	match cond.operator.as_str() {
		"between" => {
			let arr = cond
				.value
				.as_array()
				.ok_or_else(|| EvalError::BadValue(cond.value.to_string()))?;
			if arr.len() != 2 {
				return Err(EvalError::BadValue(format!(
					"time_range expects [start, end], got {} elements",
					arr.len()
				)));
			}
			let start = parse_time_bound(&arr[0])?;
			let end = parse_time_bound(&arr[1])?;
			Ok(start < at && at < end)
		}
		op => Err(EvalError::UnknownOperator {
			ctype: cond.ctype.clone(),
			operator: op.to_string(),
		}),
	}
}

#[async_trait]
impl AccessEvaluator for DefaultEvaluator {
	async fn evaluate(&self, policies: &[Policy], request: &AccessRequest) -> AccessDecision {
		let now = request.timestamp;
		'policies: for policy in policies {
			if policy.service_id != request.service_id {
				continue;
			}
			if let Some(expiry) = policy.expiry_time {
				if expiry <= now {
					continue;
				}
			}
			for cond in &policy.conditions {
				match self.eval_condition(cond, request).await {
					Ok(true) => {}
					Ok(false) => continue 'policies,
					Err(e) => {
						// A condition we cannot evaluate fails its policy,
						// not the whole request.
						self.metrics.policy_eval_errors_total.inc();
						warn!(
							policy_id = %policy.policy_id,
							error = %e,
							"condition evaluation failed; skipping policy"
						);
						continue 'policies;
					}
				}
			}
			return AccessDecision {
				allowed: true,
				reason: format!("matched policy {}", policy.policy_id),
				matched_policy: Some(policy.policy_id.clone()),
				constraints: Some(Constraints {
					bandwidth_limit: policy.bandwidth_limit,
					concurrency_limit: policy.concurrency_limit,
					expires_at: policy.expiry_time,
				}),
			};
		}
		AccessDecision::deny("no matching policy")
	}
}

/// Policy engine: a store plus an evaluation strategy.
pub struct PolicyEngine {
	store: Arc<dyn PolicyStore>,
	evaluator: Arc<dyn AccessEvaluator>,
	metrics: Arc<MetricsRegistry>,
}

impl PolicyEngine {
	pub fn new(
		store: Arc<dyn PolicyStore>,
		evaluator: Arc<dyn AccessEvaluator>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			store,
			evaluator,
			metrics,
		}
	}

	pub fn store(&self) -> &Arc<dyn PolicyStore> {
		&self.store
	}

	/// Evaluate access for a tunnel request. Store failures deny (fail
	/// closed).
	pub async fn evaluate_access(&self, request: &AccessRequest) -> AccessDecision {
		let filter = PolicyFilter {
			client_id: Some(request.client_id.clone()),
			service_id: None,
			active: true,
		};
		let decision = match self.store.query(&filter).await {
			Ok(policies) if policies.is_empty() => {
				AccessDecision::deny("no policy found for client")
			}
			Ok(policies) => self.evaluator.evaluate(&policies, request).await,
			Err(e) => {
				warn!(error = %e, "policy query failed; denying");
				AccessDecision::deny("policy store unavailable")
			}
		};
		let label = if decision.allowed { "allow" } else { "deny" };
		self.metrics
			.policy_evaluations_total
			.with_label_values(&[label])
			.inc();
		decision
	}
}
