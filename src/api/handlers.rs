use std::collections::HashMap;

use axum::Extension;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::ApiError;
use crate::audit::AuditEntry;
use crate::notify::{TunnelEvent, TunnelEventType};
use crate::persist::{CertificateRecord, CertificateStore};
use crate::policy::{AccessRequest, PolicyStore};
use crate::registry::{
	ServiceProtocol, ServiceStatus, Tunnel, TunnelFilter, TunnelRequest, TunnelStatus,
};
use crate::session::{DeviceInfo, Session};
use crate::state::{AppState, ConnectionMeta};
use crate::tls_utils::PeerIdentity;

/// Liveness probe. The only route that works without a client certificate.
pub async fn health() -> &'static str {
	"OK"
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<AppState>) -> String {
	state.metrics.encode()
}

fn require_identity(meta: &ConnectionMeta) -> Result<&PeerIdentity, ApiError> {
	meta.identity
		.as_ref()
		.ok_or_else(|| ApiError::invalid_cert("client certificate required"))
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
	let value = headers
		.get(header::AUTHORIZATION)
		.ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
	let value = value
		.to_str()
		.map_err(|_| ApiError::unauthorized("malformed Authorization header"))?;
	value
		.strip_prefix("Bearer ")
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.ok_or_else(|| ApiError::unauthorized("expected Bearer token"))
}

async fn session_from_bearer(
	state: &AppState,
	headers: &HeaderMap,
) -> Result<Session, ApiError> {
	let token = bearer_token(headers)?;
	Ok(state.sessions.validate(token).await?)
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeRequest {
	#[serde(default)]
	pub device_info: Option<DeviceInfo>,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HandshakeResponse {
	pub status: &'static str,
	pub session_token: String,
	pub expires_at: DateTime<Utc>,
}

/// Authenticate a mutually-authenticated client and mint a session.
///
/// The certificate was already verified against the CA at the TLS layer;
/// here it is checked for validity-window drift, auto-registered by
/// fingerprint, and exchanged for an opaque session token.
pub async fn handshake(
	State(state): State<AppState>,
	Extension(meta): Extension<ConnectionMeta>,
	body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
	let identity = require_identity(&meta)?.clone();

	let now = Utc::now().timestamp();
	if now < identity.not_before || now > identity.not_after {
		state.audit.log_security(AuditEntry {
			client_id: Some(identity.client_id.clone()),
			action: "handshake".to_string(),
			result: "invalid_cert".to_string(),
			severity: "warning".to_string(),
			source_ip: Some(meta.peer_addr.ip().to_string()),
			..Default::default()
		});
		return Err(ApiError::invalid_cert(
			"client certificate is outside its validity window",
		));
	}

	// An absent or empty body is a plain handshake without device posture.
	let request: HandshakeRequest = if body.is_empty() {
		HandshakeRequest::default()
	} else {
		serde_json::from_slice(&body)
			.map_err(|e| ApiError::bad_request(format!("invalid handshake body: {}", e)))?
	};

	let record = CertificateRecord {
		fingerprint: identity.fingerprint.clone(),
		client_id: identity.client_id.clone(),
		subject: format!("CN={}", identity.client_id),
		not_before: identity.not_before,
		not_after: identity.not_after,
		registered_at: Utc::now(),
		last_seen_at: Utc::now(),
	};
	state.certificates.register(record).await?;

	let session = state
		.sessions
		.create(
			&identity.client_id,
			&identity.fingerprint,
			request.device_info,
			request.metadata,
		)
		.await?;

	state.audit.log_access(AuditEntry {
		client_id: Some(identity.client_id.clone()),
		action: "handshake".to_string(),
		result: "success".to_string(),
		source_ip: Some(meta.peer_addr.ip().to_string()),
		..Default::default()
	});
	info!(client_id = %identity.client_id, "handshake complete");

	Ok(Json(HandshakeResponse {
		status: "success",
		session_token: session.token,
		expires_at: session.expires_at,
	}))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
	pub status: &'static str,
	pub session_token: String,
	pub expires_at: DateTime<Utc>,
}

/// Extend the bearer session's TTL.
pub async fn refresh_session(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let token = bearer_token(&headers)?;
	let session = state.sessions.refresh(token).await?;
	Ok(Json(RefreshResponse {
		status: "success",
		session_token: session.token,
		expires_at: session.expires_at,
	}))
}

/// Revoke a session. The bearer session must belong to the same client as
/// the token being revoked.
pub async fn revoke_session(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let caller = session_from_bearer(&state, &headers).await?;
	match state.sessions.validate(&token).await {
		Ok(target) if target.client_id != caller.client_id => {
			return Err(ApiError::unauthorized("session does not belong to caller"));
		}
		_ => {}
	}
	state.sessions.revoke(&token).await?;
	state.audit.log_access(AuditEntry {
		client_id: Some(caller.client_id),
		action: "session_revoke".to_string(),
		result: "success".to_string(),
		..Default::default()
	});
	Ok(Json(serde_json::json!({ "status": "success" })))
}

/// Policies applying to the bearer session's client.
pub async fn list_policies(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let session = session_from_bearer(&state, &headers).await?;
	let policies = state
		.policy
		.store()
		.query(&crate::policy::PolicyFilter {
			client_id: Some(session.client_id),
			service_id: None,
			active: true,
		})
		.await?;
	Ok(Json(policies))
}

/// The active service catalog.
pub async fn list_services(
	State(state): State<AppState>,
	Extension(meta): Extension<ConnectionMeta>,
) -> Result<impl IntoResponse, ApiError> {
	require_identity(&meta)?;
	let services = state.catalog.list_services(true).await?;
	Ok(Json(services))
}

/// A single service, hidden once deleted.
pub async fn get_service(
	State(state): State<AppState>,
	Extension(meta): Extension<ConnectionMeta>,
	Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	require_identity(&meta)?;
	match state.catalog.get_service(&service_id).await? {
		Some(service) if service.status != ServiceStatus::Deleted => Ok(Json(service)),
		_ => Err(ApiError::not_found(format!(
			"service {} not found",
			service_id
		))),
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct TunnelListQuery {
	pub service_id: Option<String>,
	pub status: Option<TunnelStatus>,
	pub limit: Option<usize>,
	#[serde(default)]
	pub offset: usize,
}

/// Tunnels belonging to the bearer session's client.
pub async fn list_tunnels(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<TunnelListQuery>,
) -> Result<impl IntoResponse, ApiError> {
	let session = session_from_bearer(&state, &headers).await?;
	let tunnels = state
		.registry
		.list(&TunnelFilter {
			client_id: Some(session.client_id),
			service_id: query.service_id,
			status: query.status,
			limit: query.limit,
			offset: query.offset,
		})
		.await;
	Ok(Json(tunnels))
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
	#[serde(default)]
	pub session_token: Option<String>,
	pub service_id: String,
	#[serde(default)]
	pub protocol: Option<ServiceProtocol>,
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelResponse {
	pub tunnel_id: String,
	pub controller_addr: String,
	pub expires_at: DateTime<Utc>,
}

/// Broker a new tunnel: session, policy, registry, then fan-out.
///
/// The response tells the IH which data-plane address to dial; the
/// `tunnel.created` event tells AH agents the same, together with the
/// target service they must front.
pub async fn create_tunnel(
	State(state): State<AppState>,
	Extension(meta): Extension<ConnectionMeta>,
	headers: HeaderMap,
	Json(request): Json<CreateTunnelRequest>,
) -> Result<impl IntoResponse, ApiError> {
	// The session may arrive as a bearer header or in the body; both name
	// the same session for a well-behaved client.
	let session = match bearer_token(&headers) {
		Ok(token) => state.sessions.validate(token).await?,
		Err(header_err) => match &request.session_token {
			Some(token) => state.sessions.validate(token).await?,
			None => return Err(header_err),
		},
	};

	if request.service_id.is_empty() {
		return Err(ApiError::bad_request("service_id is required"));
	}

	let service = match state.catalog.get_service(&request.service_id).await? {
		Some(service) if service.status == ServiceStatus::Active => service,
		_ => {
			return Err(ApiError::not_found(format!(
				"service {} not found",
				request.service_id
			)));
		}
	};

	let access_request = AccessRequest {
		client_id: session.client_id.clone(),
		service_id: service.service_id.clone(),
		device_info: session.device_info.clone(),
		source_ip: Some(meta.peer_addr.ip()),
		timestamp: Utc::now(),
	};
	let decision = state.policy.evaluate_access(&access_request).await;
	if !decision.allowed {
		state.audit.log_security(AuditEntry {
			client_id: Some(session.client_id.clone()),
			service_id: Some(service.service_id.clone()),
			action: "tunnel_create".to_string(),
			result: "policy_denied".to_string(),
			severity: "warning".to_string(),
			source_ip: Some(meta.peer_addr.ip().to_string()),
			details: serde_json::json!({ "reason": decision.reason }),
			..Default::default()
		});
		return Err(ApiError::policy_denied(decision.reason));
	}

	if let Some(limit) = decision
		.constraints
		.as_ref()
		.and_then(|c| c.concurrency_limit)
	{
		let live = state
			.registry
			.count_live(&session.client_id, &service.service_id)
			.await;
		if live >= limit as usize {
			warn!(
				client_id = %session.client_id,
				service_id = %service.service_id,
				live,
				limit,
				"tunnel concurrency limit reached"
			);
			return Err(ApiError::concurrency_limit(format!(
				"client has {} live tunnels for service (limit {})",
				live, limit
			)));
		}
	}

	let tunnel = state
		.registry
		.create(TunnelRequest {
			client_id: session.client_id.clone(),
			service_id: service.service_id.clone(),
			protocol: request.protocol.unwrap_or(service.protocol),
		})
		.await;

	state.notifier.notify(TunnelEvent::new(
		TunnelEventType::Created,
		tunnel.clone(),
		serde_json::json!({
			"controller_addr": state.controller_addr,
			"matched_policy": decision.matched_policy,
			"constraints": decision.constraints,
		}),
	));

	state.audit.log_connection(AuditEntry {
		client_id: Some(session.client_id.clone()),
		service_id: Some(service.service_id.clone()),
		tunnel_id: Some(tunnel.id.clone()),
		action: "tunnel_create".to_string(),
		result: "success".to_string(),
		source_ip: Some(meta.peer_addr.ip().to_string()),
		..Default::default()
	});
	info!(tunnel_id = %tunnel.id, client_id = %session.client_id, "tunnel brokered");

	Ok((
		StatusCode::CREATED,
		Json(CreateTunnelResponse {
			tunnel_id: tunnel.id,
			controller_addr: state.controller_addr.clone(),
			expires_at: tunnel.expires_at,
		}),
	))
}

/// Delete a tunnel owned by the bearer session's client.
pub async fn delete_tunnel(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(tunnel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let session = session_from_bearer(&state, &headers).await?;
	let owned = matches!(
		state.registry.get(&tunnel_id).await,
		Some(Tunnel { ref client_id, .. }) if client_id == &session.client_id
	);
	if !owned {
		return Err(ApiError::not_found(format!(
			"tunnel {} not found",
			tunnel_id
		)));
	}
	let tunnel = state.registry.delete(&tunnel_id).await?;
	state.notifier.notify(TunnelEvent::new(
		TunnelEventType::Deleted,
		tunnel,
		serde_json::Value::Null,
	));
	state.audit.log_connection(AuditEntry {
		client_id: Some(session.client_id),
		tunnel_id: Some(tunnel_id),
		action: "tunnel_delete".to_string(),
		result: "success".to_string(),
		..Default::default()
	});
	Ok(Json(serde_json::json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
	pub agent_id: String,
	#[serde(default)]
	pub agent_type: String,
}

/// SSE subscription for AH agents: tunnel and service-catalog events.
pub async fn subscribe_events(
	State(state): State<AppState>,
	Extension(meta): Extension<ConnectionMeta>,
	Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, ApiError> {
	require_identity(&meta)?;
	if query.agent_id.is_empty() {
		return Err(ApiError::bad_request("agent_id is required"));
	}

	let subscription = state.notifier.clone().subscribe(&query.agent_id, &query.agent_type);
	info!(agent_id = %query.agent_id, "sse subscriber connected");

	let stream = subscription.into_stream();
	let sse = Sse::new(stream).keep_alive(
		KeepAlive::new()
			.interval(state.notifier.heartbeat())
			.text("ping"),
	);

	Ok((
		[
			(header::CACHE_CONTROL, "no-cache"),
			(header::CONNECTION, "keep-alive"),
			(header::HeaderName::from_static("x-accel-buffering"), "no"),
		],
		sse,
	))
}
