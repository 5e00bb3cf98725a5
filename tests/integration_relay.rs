//! Data-plane end-to-end tests: pairing, relaying, timeouts, limits, and
//! shutdown drain, all over real mTLS sockets.

mod common;

use std::time::Duration;

use common::{TestCa, start_test_controller, start_test_controller_with};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use vanopticon_bifrost::ControllerHandle;
use vanopticon_bifrost::agent::RelayClient;
use vanopticon_bifrost::registry::{ServiceProtocol, TunnelRequest, TunnelStatus};

async fn seed_tunnel(handle: &ControllerHandle, client_id: &str) -> String {
	handle
		.state
		.registry
		.create(TunnelRequest {
			client_id: client_id.to_string(),
			service_id: "demo".to_string(),
			protocol: ServiceProtocol::Tcp,
		})
		.await
		.id
}

fn relay_client(ca: &TestCa, cn: &str, handle: &ControllerHandle) -> RelayClient {
	let (cert, key) = ca.issue(cn);
	let identity = ca.identity(&cert, &key);
	RelayClient::new(
		&identity,
		handle.relay_addr.to_string(),
		"localhost".to_string(),
	)
	.expect("relay client")
}

async fn wait_for_status(
	handle: &ControllerHandle,
	tunnel_id: &str,
	want: TunnelStatus,
) -> bool {
	for _ in 0..50 {
		if let Some(t) = handle.state.registry.get(tunnel_id).await {
			if t.status == want {
				return true;
			}
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	false
}

#[tokio::test]
async fn pairing_happy_path_relays_both_directions() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let tunnel_id = seed_tunnel(&handle, "ih-x").await;

	let ih = relay_client(&ca, "ih-x", &handle);
	let ah = relay_client(&ca, "ah-y", &handle);

	let mut ih_conn = ih.connect(&tunnel_id).await.unwrap();
	ih_conn.write_all(b"PING").await.unwrap();

	let mut ah_conn = ah.connect(&tunnel_id).await.unwrap();

	let mut buf = [0u8; 4];
	timeout(Duration::from_secs(5), ah_conn.read_exact(&mut buf))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(&buf, b"PING");

	ah_conn.write_all(b"PONG").await.unwrap();
	timeout(Duration::from_secs(5), ih_conn.read_exact(&mut buf))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(&buf, b"PONG");

	assert!(wait_for_status(&handle, &tunnel_id, TunnelStatus::Active).await);

	let _ = ih_conn.shutdown().await;
	let _ = ah_conn.shutdown().await;
	drop(ih_conn);
	drop(ah_conn);

	assert!(wait_for_status(&handle, &tunnel_id, TunnelStatus::Closed).await);

	let tunnel = handle.state.registry.get(&tunnel_id).await.unwrap();
	assert_eq!(tunnel.stats.bytes_ih_to_ah, 4);
	assert_eq!(tunnel.stats.bytes_ah_to_ih, 4);
	assert!(tunnel.ih_endpoint.is_some());
	assert!(tunnel.ah_endpoint.is_some());
	assert_eq!(handle.state.metrics.tunnel_bytes_transferred_total.get(), 8);
	assert_eq!(handle.state.metrics.active_tunnels.get(), 0);

	handle.shutdown().await;
}

#[tokio::test]
async fn lone_half_times_out_and_is_closed() {
	let ca = TestCa::new();
	let handle = start_test_controller_with(&ca, |s| {
		s.pairing_timeout_secs = 1;
	})
	.await;
	let tunnel_id = seed_tunnel(&handle, "ih-x").await;

	let ih = relay_client(&ca, "ih-x", &handle);
	let mut ih_conn = ih.connect(&tunnel_id).await.unwrap();

	// The relay closes the lone half once the pairing timeout fires.
	let mut buf = [0u8; 1];
	let read = timeout(Duration::from_secs(5), ih_conn.read(&mut buf))
		.await
		.expect("relay should close the half before the test deadline");
	assert!(matches!(read, Ok(0) | Err(_)));

	assert!(wait_for_status(&handle, &tunnel_id, TunnelStatus::Error).await);
	let tunnel = handle.state.registry.get(&tunnel_id).await.unwrap();
	assert_eq!(tunnel.stats.last_error.as_deref(), Some("pairing_timeout"));

	assert_eq!(
		handle
			.state
			.metrics
			.tunnel_relay_errors_total
			.with_label_values(&["pairing_timeout"])
			.get(),
		1
	);
	// the tunnel never went active
	assert_eq!(
		handle
			.state
			.metrics
			.tunnel_total
			.with_label_values(&["active"])
			.get(),
		0
	);

	handle.shutdown().await;
}

#[tokio::test]
async fn short_tunnel_id_closes_without_pairing() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	seed_tunnel(&handle, "ih-x").await;

	// Hand-roll the dial so we can send fewer than 36 header bytes.
	let (cert, key) = ca.issue("ih-short");
	let identity = ca.identity(&cert, &key);
	let config = identity.client_config().unwrap();
	let connector = tokio_rustls::TlsConnector::from(config);
	let tcp = tokio::net::TcpStream::connect(handle.relay_addr).await.unwrap();
	let server_name = tokio_rustls::rustls::ServerName::try_from("localhost").unwrap();
	let mut conn = connector.connect(server_name, tcp).await.unwrap();

	conn.write_all(b"too-short").await.unwrap();
	let _ = conn.shutdown().await;

	let mut buf = [0u8; 1];
	let read = timeout(Duration::from_secs(5), conn.read(&mut buf))
		.await
		.expect("relay should close the connection promptly");
	assert!(matches!(read, Ok(0) | Err(_)));

	// nothing paired, nothing went active
	assert_eq!(handle.state.metrics.active_tunnels.get(), 0);

	handle.shutdown().await;
}

#[tokio::test]
async fn non_role_certificate_is_rejected() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let tunnel_id = seed_tunnel(&handle, "ih-x").await;

	let intruder = relay_client(&ca, "controller-not-a-role", &handle);
	match intruder.connect(&tunnel_id).await {
		// The relay may close before or after the header write lands.
		Err(_) => {}
		Ok(mut conn) => {
			let mut buf = [0u8; 1];
			let read = timeout(Duration::from_secs(5), conn.read(&mut buf))
				.await
				.expect("relay should close unknown roles");
			assert!(matches!(read, Ok(0) | Err(_)));
		}
	}

	assert_eq!(handle.state.metrics.active_tunnels.get(), 0);
	handle.shutdown().await;
}

#[tokio::test]
async fn connection_limit_closes_excess_accepts() {
	let ca = TestCa::new();
	let handle = start_test_controller_with(&ca, |s| {
		s.relay_max_connections = 1;
		s.pairing_timeout_secs = 3;
	})
	.await;
	let tunnel_id = seed_tunnel(&handle, "ih-x").await;

	let first = relay_client(&ca, "ih-x", &handle);
	let _first_conn = first.connect(&tunnel_id).await.unwrap();
	// Give the first handler time to occupy the slot.
	tokio::time::sleep(Duration::from_millis(200)).await;

	let second = relay_client(&ca, "ah-y", &handle);
	match second.connect(&tunnel_id).await {
		Err(_) => {}
		Ok(mut conn) => {
			let mut buf = [0u8; 1];
			let read = timeout(Duration::from_secs(5), conn.read(&mut buf))
				.await
				.expect("over-limit connection should be closed");
			assert!(matches!(read, Ok(0) | Err(_)));
		}
	}

	handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_active_tunnels() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;

	let ih = relay_client(&ca, "ih-x", &handle);
	let ah = relay_client(&ca, "ah-y", &handle);

	let mut tunnel_ids = Vec::new();
	let mut conns = Vec::new();
	for _ in 0..3 {
		let tunnel_id = seed_tunnel(&handle, "ih-x").await;
		let mut ih_conn = ih.connect(&tunnel_id).await.unwrap();
		let mut ah_conn = ah.connect(&tunnel_id).await.unwrap();

		// Move one byte each way so the tunnel is demonstrably live.
		ih_conn.write_all(b"a").await.unwrap();
		let mut buf = [0u8; 1];
		timeout(Duration::from_secs(5), ah_conn.read_exact(&mut buf))
			.await
			.unwrap()
			.unwrap();
		ah_conn.write_all(b"b").await.unwrap();
		timeout(Duration::from_secs(5), ih_conn.read_exact(&mut buf))
			.await
			.unwrap()
			.unwrap();

		tunnel_ids.push(tunnel_id);
		conns.push((ih_conn, ah_conn));
	}

	for id in &tunnel_ids {
		assert!(wait_for_status(&handle, id, TunnelStatus::Active).await);
	}
	assert_eq!(handle.state.metrics.active_tunnels.get(), 3);

	handle.shutdown().await;
	tokio::time::sleep(Duration::from_secs(1)).await;

	for id in &tunnel_ids {
		let tunnel = handle.state.registry.get(id).await.unwrap();
		assert_eq!(tunnel.status, TunnelStatus::Closed);
		// stats were finalized: one byte each way survived the drain
		assert_eq!(tunnel.stats.bytes_ih_to_ah, 1);
		assert_eq!(tunnel.stats.bytes_ah_to_ih, 1);
	}
	assert_eq!(handle.state.metrics.active_tunnels.get(), 0);

	// the listener is gone
	let late = relay_client(&ca, "ih-x", &handle);
	assert!(late.connect(&tunnel_ids[0]).await.is_err());
}
