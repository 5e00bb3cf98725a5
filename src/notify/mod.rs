use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::observability::MetricsRegistry;
use crate::registry::{ServiceConfig, Tunnel};

/// Queue depth per subscriber and per event family. Full queues drop new
/// events; a slow reader never blocks the publisher.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelEventType {
	Created,
	Updated,
	Deleted,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEvent {
	#[serde(rename = "type")]
	pub event_type: TunnelEventType,
	pub tunnel: Tunnel,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
	pub details: serde_json::Value,
}

impl TunnelEvent {
	pub fn new(event_type: TunnelEventType, tunnel: Tunnel, details: serde_json::Value) -> Self {
		Self {
			event_type,
			tunnel,
			timestamp: Utc::now(),
			details,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventType {
	ServiceCreated,
	ServiceUpdated,
	ServiceDeleted,
}

impl ServiceEventType {
	/// SSE event name on the wire.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ServiceCreated => "service_created",
			Self::ServiceUpdated => "service_updated",
			Self::ServiceDeleted => "service_deleted",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
	#[serde(rename = "type")]
	pub event_type: ServiceEventType,
	pub service: ServiceConfig,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
	pub details: serde_json::Value,
}

struct Subscriber {
	agent_id: String,
	#[allow(dead_code)]
	agent_type: String,
	tunnel_tx: mpsc::Sender<TunnelEvent>,
	service_tx: mpsc::Sender<ServiceEvent>,
}

/// Removes the subscriber when the SSE stream is dropped, whether by client
/// disconnect or server shutdown.
struct SubscriberGuard {
	notifier: Arc<SseNotifier>,
	id: String,
}

impl Drop for SubscriberGuard {
	fn drop(&mut self) {
		self.notifier.remove(&self.id);
	}
}

/// One live SSE subscription: two bounded receivers plus the removal guard.
pub struct Subscription {
	pub id: String,
	pub agent_id: String,
	tunnel_rx: mpsc::Receiver<TunnelEvent>,
	service_rx: mpsc::Receiver<ServiceEvent>,
	guard: SubscriberGuard,
}

impl Subscription {
	/// Turn the subscription into the SSE event stream: an initial
	/// `connected` record followed by tunnel and service events in the
	/// order their queue sends succeeded.
	pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
		let Subscription {
			agent_id,
			tunnel_rx,
			service_rx,
			guard,
			..
		} = self;

		let connected_payload = serde_json::json!({
			"agent_id": agent_id,
			"timestamp": Utc::now().timestamp(),
		});
		let connected = stream::once(async move {
			Ok(Event::default()
				.event("connected")
				.data(connected_payload.to_string()))
		});

		let tunnels = ReceiverStream::new(tunnel_rx).map(|ev| {
			Ok(Event::default()
				.event("tunnel")
				.json_data(&ev)
				.unwrap_or_else(|_| Event::default().comment("serialization failure")))
		});
		let services = ReceiverStream::new(service_rx).map(|ev| {
			Ok(Event::default()
				.event(ev.event_type.as_str())
				.json_data(&ev.service)
				.unwrap_or_else(|_| Event::default().comment("serialization failure")))
		});

		// The guard rides along inside the closure so dropping the stream
		// unregisters the subscriber.
		connected
			.chain(stream::select(tunnels, services))
			.map(move |item| {
				let _ = &guard;
				item
			})
	}
}

/// Fan-out of tunnel and service events to SSE subscribers.
///
/// Delivery is at-most-once and lossy under congestion: each subscriber owns
/// two bounded queues and a full queue drops the new event. Per subscriber,
/// delivered events preserve the publisher's enqueue order; across
/// subscribers there is no ordering relationship.
pub struct SseNotifier {
	subscribers: DashMap<String, Subscriber>,
	heartbeat: Duration,
	metrics: Arc<MetricsRegistry>,
}

impl SseNotifier {
	pub fn new(heartbeat: Duration, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
		Arc::new(Self {
			subscribers: DashMap::new(),
			heartbeat,
			metrics,
		})
	}

	pub fn heartbeat(&self) -> Duration {
		self.heartbeat
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.len()
	}

	/// Register a subscriber and hand back its receivers.
	pub fn subscribe(self: Arc<Self>, agent_id: &str, agent_type: &str) -> Subscription {
		let id = Uuid::new_v4().to_string();
		let (tunnel_tx, tunnel_rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
		let (service_tx, service_rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
		self.subscribers.insert(
			id.clone(),
			Subscriber {
				agent_id: agent_id.to_string(),
				agent_type: agent_type.to_string(),
				tunnel_tx,
				service_tx,
			},
		);
		self.metrics.sse_subscribers.inc();
		debug!(agent_id = %agent_id, agent_type = %agent_type, "sse subscriber registered");
		Subscription {
			id: id.clone(),
			agent_id: agent_id.to_string(),
			tunnel_rx,
			service_rx,
			guard: SubscriberGuard {
				notifier: self,
				id,
			},
		}
	}

	fn remove(&self, id: &str) {
		if self.subscribers.remove(id).is_some() {
			self.metrics.sse_subscribers.dec();
			debug!(subscriber = %id, "sse subscriber removed");
		}
	}

	/// Broadcast a tunnel event to every subscriber. Never blocks: full
	/// queues drop the event for that subscriber only.
	pub fn notify(&self, event: TunnelEvent) {
		let mut closed: Vec<String> = Vec::new();
		for entry in self.subscribers.iter() {
			match entry.value().tunnel_tx.try_send(event.clone()) {
				Ok(()) => self.metrics.sse_events_sent_total.inc(),
				Err(mpsc::error::TrySendError::Full(_)) => {
					self.metrics.sse_events_dropped_total.inc();
					warn!(
						agent_id = %entry.value().agent_id,
						event_type = ?event.event_type,
						"subscriber queue full; dropping tunnel event"
					);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
			}
		}
		for id in closed {
			self.remove(&id);
		}
	}

	/// Targeted variant of `notify`: only subscribers registered under
	/// `agent_id` receive the event.
	pub fn notify_one(&self, agent_id: &str, event: TunnelEvent) {
		let mut closed: Vec<String> = Vec::new();
		for entry in self.subscribers.iter() {
			if entry.value().agent_id != agent_id {
				continue;
			}
			match entry.value().tunnel_tx.try_send(event.clone()) {
				Ok(()) => self.metrics.sse_events_sent_total.inc(),
				Err(mpsc::error::TrySendError::Full(_)) => {
					self.metrics.sse_events_dropped_total.inc();
					warn!(agent_id = %agent_id, "subscriber queue full; dropping tunnel event");
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
			}
		}
		for id in closed {
			self.remove(&id);
		}
	}

	/// Broadcast a service-catalog event to every subscriber.
	pub fn notify_service(&self, event_type: ServiceEventType, service: ServiceConfig) {
		let event = ServiceEvent {
			event_type,
			service,
			timestamp: Utc::now(),
			details: serde_json::Value::Null,
		};
		let mut closed: Vec<String> = Vec::new();
		for entry in self.subscribers.iter() {
			match entry.value().service_tx.try_send(event.clone()) {
				Ok(()) => self.metrics.sse_events_sent_total.inc(),
				Err(mpsc::error::TrySendError::Full(_)) => {
					self.metrics.sse_events_dropped_total.inc();
					warn!(
						agent_id = %entry.value().agent_id,
						"subscriber queue full; dropping service event"
					);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
			}
		}
		for id in closed {
			self.remove(&id);
		}
	}

	/// Drop every subscriber. Their streams end once the queued events
	/// drain, which terminates the SSE responses.
	pub fn close_all(&self) {
		let ids: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
		for id in ids {
			self.remove(&id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{ServiceProtocol, TunnelStats, TunnelStatus};

	fn tunnel() -> Tunnel {
		Tunnel {
			id: "00000000-0000-0000-0000-000000000001".to_string(),
			client_id: "ih-a".to_string(),
			service_id: "svc".to_string(),
			protocol: ServiceProtocol::Tcp,
			status: TunnelStatus::Pending,
			ih_endpoint: None,
			ah_endpoint: None,
			created_at: Utc::now(),
			last_active: Utc::now(),
			expires_at: Utc::now(),
			stats: TunnelStats::default(),
		}
	}

	fn notifier() -> Arc<SseNotifier> {
		SseNotifier::new(Duration::from_secs(30), Arc::new(MetricsRegistry::new()))
	}

	#[tokio::test]
	async fn subscriber_receives_events_in_order() {
		let n = notifier();
		let mut sub = n.clone().subscribe("ah-1", "ah");
		for i in 0..3 {
			n.notify(TunnelEvent::new(
				TunnelEventType::Created,
				tunnel(),
				serde_json::json!({ "seq": i }),
			));
		}
		for i in 0..3 {
			let ev = sub.tunnel_rx.recv().await.unwrap();
			assert_eq!(ev.details["seq"], i);
		}
	}

	#[tokio::test]
	async fn full_queue_drops_new_events_keeps_queued() {
		let n = notifier();
		let mut sub = n.clone().subscribe("ah-1", "ah");
		// Never read: the queue fills at SUBSCRIBER_QUEUE_DEPTH.
		for i in 0..50 {
			n.notify(TunnelEvent::new(
				TunnelEventType::Created,
				tunnel(),
				serde_json::json!({ "seq": i }),
			));
		}
		let mut received = Vec::new();
		while let Ok(ev) = sub.tunnel_rx.try_recv() {
			received.push(ev.details["seq"].as_i64().unwrap());
		}
		assert_eq!(received.len(), SUBSCRIBER_QUEUE_DEPTH);
		// the earliest events survive; drops only affect new ones
		assert_eq!(received, (0..SUBSCRIBER_QUEUE_DEPTH as i64).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn notify_one_targets_a_single_agent() {
		let n = notifier();
		let mut a = n.clone().subscribe("ah-a", "ah");
		let mut b = n.clone().subscribe("ah-b", "ah");
		n.notify_one(
			"ah-a",
			TunnelEvent::new(TunnelEventType::Created, tunnel(), serde_json::Value::Null),
		);
		assert!(a.tunnel_rx.try_recv().is_ok());
		assert!(b.tunnel_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn dropping_subscription_unregisters() {
		let n = notifier();
		let sub = n.clone().subscribe("ah-a", "ah");
		assert_eq!(n.subscriber_count(), 1);
		drop(sub);
		assert_eq!(n.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn stream_starts_with_connected_event() {
		let n = notifier();
		let sub = n.clone().subscribe("ah-a", "ah");
		n.close_all();
		let stream = sub.into_stream();
		let events: Vec<_> = stream.collect().await;
		// connected only; queues were closed before anything was published
		assert_eq!(events.len(), 1);
	}

	#[tokio::test]
	async fn close_all_ends_streams() {
		let n = notifier();
		let sub = n.clone().subscribe("ah-a", "ah");
		n.notify(TunnelEvent::new(
			TunnelEventType::Created,
			tunnel(),
			serde_json::Value::Null,
		));
		n.close_all();
		let events: Vec<_> = sub.into_stream().collect().await;
		// connected + the single queued event, then termination
		assert_eq!(events.len(), 2);
	}
}
