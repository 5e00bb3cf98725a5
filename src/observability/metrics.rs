use prometheus::{
	Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Central registry for all Prometheus metrics.
///
/// Every series is owned by an instance rather than a process-wide static so
/// multiple controllers can coexist in one test binary.
pub struct MetricsRegistry {
	registry: Registry,

	// Control-plane metrics
	pub http_requests_total: IntCounterVec,

	// Session metrics
	pub sessions_created_total: IntCounter,
	pub sessions_revoked_total: IntCounter,
	pub sessions_expired_total: IntCounter,
	pub active_sessions: IntGauge,

	// Policy metrics
	pub policy_evaluations_total: IntCounterVec,
	pub policy_eval_errors_total: IntCounter,

	// Tunnel / relay metrics
	pub tunnel_total: IntCounterVec,
	pub tunnel_bytes_transferred_total: IntCounter,
	pub tunnel_pairing_duration_seconds: Histogram,
	pub tunnel_relay_errors_total: IntCounterVec,
	pub active_tunnels: IntGauge,
	pub relay_connections_rejected_total: IntCounter,

	// SSE notifier metrics
	pub sse_subscribers: IntGauge,
	pub sse_events_sent_total: IntCounter,
	pub sse_events_dropped_total: IntCounter,

	// Audit metrics
	pub audit_records_total: IntCounterVec,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let http_requests_total = IntCounterVec::new(
			Opts::new(
				"http_requests_total",
				"Control-plane requests by method, path, and status",
			)
			.namespace("bifrost"),
			&["method", "path", "status"],
		)
		.unwrap();

		let sessions_created_total = IntCounter::with_opts(
			Opts::new("sessions_created_total", "Sessions minted at handshake")
				.namespace("bifrost"),
		)
		.unwrap();

		let sessions_revoked_total = IntCounter::with_opts(
			Opts::new("sessions_revoked_total", "Sessions explicitly revoked")
				.namespace("bifrost"),
		)
		.unwrap();

		let sessions_expired_total = IntCounter::with_opts(
			Opts::new(
				"sessions_expired_total",
				"Sessions removed by the expiry sweep",
			)
			.namespace("bifrost"),
		)
		.unwrap();

		let active_sessions = IntGauge::with_opts(
			Opts::new("active_sessions", "Sessions currently alive").namespace("bifrost"),
		)
		.unwrap();

		let policy_evaluations_total = IntCounterVec::new(
			Opts::new(
				"policy_evaluations_total",
				"Access evaluations by decision",
			)
			.namespace("bifrost"),
			&["decision"],
		)
		.unwrap();

		let policy_eval_errors_total = IntCounter::with_opts(
			Opts::new(
				"policy_eval_errors_total",
				"Conditions that failed to evaluate (failed closed)",
			)
			.namespace("bifrost"),
		)
		.unwrap();

		let tunnel_total = IntCounterVec::new(
			Opts::new("tunnel_total", "Tunnel lifecycle transitions by status")
				.namespace("bifrost"),
			&["status"],
		)
		.unwrap();

		let tunnel_bytes_transferred_total = IntCounter::with_opts(
			Opts::new(
				"tunnel_bytes_transferred_total",
				"Bytes relayed across all tunnels, both directions",
			)
			.namespace("bifrost"),
		)
		.unwrap();

		let tunnel_pairing_duration_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"tunnel_pairing_duration_seconds",
				"Time between the first and second half of a tunnel arriving",
			)
			.namespace("bifrost")
			.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
		)
		.unwrap();

		let tunnel_relay_errors_total = IntCounterVec::new(
			Opts::new("tunnel_relay_errors_total", "Relay failures by reason")
				.namespace("bifrost"),
			&["reason"],
		)
		.unwrap();

		let active_tunnels = IntGauge::with_opts(
			Opts::new("active_tunnels", "Tunnels currently relaying").namespace("bifrost"),
		)
		.unwrap();

		let relay_connections_rejected_total = IntCounter::with_opts(
			Opts::new(
				"relay_connections_rejected_total",
				"Data-plane connections closed at accept (connection limit)",
			)
			.namespace("bifrost"),
		)
		.unwrap();

		let sse_subscribers = IntGauge::with_opts(
			Opts::new("sse_subscribers", "Connected SSE subscribers").namespace("bifrost"),
		)
		.unwrap();

		let sse_events_sent_total = IntCounter::with_opts(
			Opts::new("sse_events_sent_total", "Events enqueued to subscribers")
				.namespace("bifrost"),
		)
		.unwrap();

		let sse_events_dropped_total = IntCounter::with_opts(
			Opts::new(
				"sse_events_dropped_total",
				"Events dropped because a subscriber queue was full",
			)
			.namespace("bifrost"),
		)
		.unwrap();

		let audit_records_total = IntCounterVec::new(
			Opts::new("audit_records_total", "Audit records by event type").namespace("bifrost"),
			&["event_type"],
		)
		.unwrap();

		// Register all metrics
		registry
			.register(Box::new(http_requests_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sessions_created_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sessions_revoked_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sessions_expired_total.clone()))
			.unwrap();
		registry.register(Box::new(active_sessions.clone())).unwrap();
		registry
			.register(Box::new(policy_evaluations_total.clone()))
			.unwrap();
		registry
			.register(Box::new(policy_eval_errors_total.clone()))
			.unwrap();
		registry.register(Box::new(tunnel_total.clone())).unwrap();
		registry
			.register(Box::new(tunnel_bytes_transferred_total.clone()))
			.unwrap();
		registry
			.register(Box::new(tunnel_pairing_duration_seconds.clone()))
			.unwrap();
		registry
			.register(Box::new(tunnel_relay_errors_total.clone()))
			.unwrap();
		registry.register(Box::new(active_tunnels.clone())).unwrap();
		registry
			.register(Box::new(relay_connections_rejected_total.clone()))
			.unwrap();
		registry.register(Box::new(sse_subscribers.clone())).unwrap();
		registry
			.register(Box::new(sse_events_sent_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sse_events_dropped_total.clone()))
			.unwrap();
		registry
			.register(Box::new(audit_records_total.clone()))
			.unwrap();

		Self {
			registry,
			http_requests_total,
			sessions_created_total,
			sessions_revoked_total,
			sessions_expired_total,
			active_sessions,
			policy_evaluations_total,
			policy_eval_errors_total,
			tunnel_total,
			tunnel_bytes_transferred_total,
			tunnel_pairing_duration_seconds,
			tunnel_relay_errors_total,
			active_tunnels,
			relay_connections_rejected_total,
			sse_subscribers,
			sse_events_sent_total,
			sse_events_dropped_total,
			audit_records_total,
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}
