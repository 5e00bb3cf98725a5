pub mod error;
pub mod handlers;

use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::state::AppState;

/// Per-request deadline on the API routes. The SSE subscription and the
/// health/metrics probes are deliberately outside it: a subscriber lives
/// until it disconnects or the server stops.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the control-plane router: the flat v1 routeset plus health and
/// metrics. TLS, client-certificate extraction, and panic catching live in
/// the per-connection stack that serves this router.
pub fn router(state: AppState) -> Router {
	let timed = Router::new()
		.route("/api/v1/handshake", post(handlers::handshake))
		.route("/api/v1/sessions/refresh", post(handlers::refresh_session))
		.route("/api/v1/sessions/{token}", delete(handlers::revoke_session))
		.route("/api/v1/policies", get(handlers::list_policies))
		.route("/api/v1/services", get(handlers::list_services))
		.route("/api/v1/services/{id}", get(handlers::get_service))
		.route(
			"/api/v1/tunnels",
			get(handlers::list_tunnels).post(handlers::create_tunnel),
		)
		.route("/api/v1/tunnels/{id}", delete(handlers::delete_tunnel))
		.layer(TimeoutLayer::new(REQUEST_TIMEOUT));

	Router::new()
		.route("/health", get(handlers::health))
		.route("/metrics", get(handlers::metrics))
		.route("/v1/agent/tunnels/stream", get(handlers::subscribe_events))
		.merge(timed)
		.layer(middleware::from_fn_with_state(
			state.clone(),
			request_log,
		))
		.with_state(state)
}

/// Record method, path, status, and duration for every request.
async fn request_log(State(state): State<AppState>, request: Request, next: Next) -> Response {
	let method = request.method().clone();
	// Use the route template, not the concrete path, to keep metric
	// cardinality bounded.
	let path = request
		.extensions()
		.get::<MatchedPath>()
		.map(|p| p.as_str().to_string())
		.unwrap_or_else(|| request.uri().path().to_string());
	let start = Instant::now();

	let response = next.run(request).await;

	let status = response.status().as_u16();
	state
		.metrics
		.http_requests_total
		.with_label_values(&[method.as_str(), &path, &status.to_string()])
		.inc();
	info!(
		method = %method,
		path = %path,
		status,
		duration_ms = start.elapsed().as_millis() as u64,
		"request"
	);
	response
}
