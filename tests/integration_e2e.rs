//! Whole-system test: IH handshake and tunnel brokering over the control
//! plane, AH agent consuming events and bridging to a target service, and
//! opaque bytes flowing IH → relay → AH → target and back.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestCa, allow_policy, demo_service, https_client, start_test_controller};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use vanopticon_bifrost::agent::{AhAgent, AhAgentConfig, RelayClient};
use vanopticon_bifrost::policy::PolicyStore;

/// A TCP echo service standing in for the protected target.
async fn spawn_echo_server() -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let (mut read, mut write) = stream.split();
				let _ = tokio::io::copy(&mut read, &mut write).await;
			});
		}
	});
	addr
}

#[tokio::test]
async fn ih_reaches_target_through_brokered_tunnel() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	let echo_addr = spawn_echo_server().await;
	handle
		.state
		.catalog
		.create_service(demo_service("echo", echo_addr.port()))
		.await
		.unwrap();
	handle
		.state
		.policy
		.store()
		.save(allow_policy("ih-test-01", "echo"))
		.await
		.unwrap();

	// AH agent: subscribes to events and fronts the echo service.
	let (ah_cert, ah_key) = ca.issue("ah-agent-1");
	let ah_identity = ca.identity(&ah_cert, &ah_key);
	let agent = AhAgent::new(
		&ah_identity,
		&ah_cert,
		&ah_key,
		&ca.ca_path,
		AhAgentConfig {
			agent_id: "ah-agent-1".to_string(),
			controller_base_url: base.clone(),
			relay_server_name: "localhost".to_string(),
		},
	)
	.unwrap();

	let (agent_shutdown_tx, agent_shutdown_rx) = watch::channel(false);
	tokio::spawn(Arc::clone(&agent).run(agent_shutdown_rx));

	// The agent must be subscribed before the tunnel event fires.
	for _ in 0..100 {
		if handle.state.notifier.subscriber_count() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	assert_eq!(handle.state.notifier.subscriber_count(), 1);

	// IH: handshake, then broker a tunnel to the echo service.
	let (ih_cert, ih_key) = ca.issue("ih-test-01");
	let client = https_client(&ca, &ih_cert, &ih_key, handle.http_addr);

	let body: serde_json::Value = client
		.post(format!("{}/api/v1/handshake", base))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	let token = body["session_token"].as_str().unwrap().to_string();

	let resp = client
		.post(format!("{}/api/v1/tunnels", base))
		.bearer_auth(&token)
		.json(&json!({ "service_id": "echo", "protocol": "tcp" }))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 201);
	let body: serde_json::Value = resp.json().await.unwrap();
	let tunnel_id = body["tunnel_id"].as_str().unwrap().to_string();

	// IH data plane: dial the relay and talk to the target through it.
	let ih_identity = ca.identity(&ih_cert, &ih_key);
	let relay = RelayClient::new(
		&ih_identity,
		handle.relay_addr.to_string(),
		"localhost".to_string(),
	)
	.unwrap();
	let mut conn = relay
		.connect_with_retry(&tunnel_id, 5, Duration::from_millis(200))
		.await
		.unwrap();

	let payload = b"hello through the bridge";
	conn.write_all(payload).await.unwrap();

	let mut echoed = vec![0u8; payload.len()];
	timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
		.await
		.expect("echo within deadline")
		.unwrap();
	assert_eq!(&echoed, payload);

	let _ = conn.shutdown().await;
	drop(conn);
	let _ = agent_shutdown_tx.send(true);
	handle.shutdown().await;
}
