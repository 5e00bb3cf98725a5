pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::MetricsRegistry;

use std::sync::Arc;

/// Global observability state
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

impl ObservabilityState {
	pub fn new() -> Self {
		Self {
			metrics: Arc::new(MetricsRegistry::new()),
		}
	}
}

impl Default for ObservabilityState {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize all observability components
pub fn init_observability() -> anyhow::Result<ObservabilityState> {
	// Initialize structured JSON logging
	init_logging()?;

	tracing::info!(
		component = "observability",
		"Observability initialized: structured logging and metrics enabled"
	);

	Ok(ObservabilityState::new())
}

#[cfg(test)]
mod tests {
	#[test]
	fn observability_state_creation() {
		let state = super::ObservabilityState::new();
		assert!(!state.metrics.encode().is_empty());
	}
}
