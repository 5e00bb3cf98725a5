//! Control-plane end-to-end tests: mTLS handshake, session lifecycle, and
//! tunnel brokering over real HTTPS.

mod common;

use common::{TestCa, allow_policy, demo_service, https_client, start_test_controller};
use serde_json::json;
use vanopticon_bifrost::policy::{Condition, PolicyStore};

#[tokio::test]
async fn handshake_then_tunnel_create() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	handle
		.state
		.policy
		.store()
		.save(allow_policy("ih-test-01", "demo"))
		.await
		.unwrap();
	handle
		.state
		.catalog
		.create_service(demo_service("demo", 9999))
		.await
		.unwrap();

	let (cert, key) = ca.issue("ih-test-01");
	let client = https_client(&ca, &cert, &key, handle.http_addr);

	// Handshake: the verified certificate is exchanged for a session token.
	let resp = client
		.post(format!("{}/api/v1/handshake", base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let body: serde_json::Value = resp.json().await.unwrap();
	let token = body["session_token"].as_str().unwrap().to_string();
	assert_eq!(token.len(), 64);
	assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
	assert!(body["expires_at"].as_str().is_some());

	// Tunnel create: policy allows, service exists.
	let resp = client
		.post(format!("{}/api/v1/tunnels", base))
		.bearer_auth(&token)
		.json(&json!({
			"session_token": token,
			"service_id": "demo",
			"protocol": "tcp",
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 201);
	let body: serde_json::Value = resp.json().await.unwrap();
	let tunnel_id = body["tunnel_id"].as_str().unwrap();
	assert_eq!(tunnel_id.len(), 36);
	assert!(uuid::Uuid::parse_str(tunnel_id).is_ok());
	assert_eq!(
		body["controller_addr"].as_str().unwrap(),
		handle.relay_addr.to_string()
	);

	// The tunnel is visible, pending, and owned by the caller.
	let resp = client
		.get(format!("{}/api/v1/tunnels", base))
		.bearer_auth(&token)
		.send()
		.await
		.unwrap();
	let tunnels: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(tunnels.as_array().unwrap().len(), 1);
	assert_eq!(tunnels[0]["status"], "pending");

	handle.shutdown().await;
}

#[tokio::test]
async fn policy_deny_returns_403() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	// The only policy demands a Linux device; the handshake reports none.
	let mut policy = allow_policy("ih-test-01", "demo");
	policy.conditions.push(Condition {
		ctype: "device_os".to_string(),
		operator: "eq".to_string(),
		value: json!("Linux"),
	});
	handle.state.policy.store().save(policy).await.unwrap();
	handle
		.state
		.catalog
		.create_service(demo_service("demo", 9999))
		.await
		.unwrap();

	let (cert, key) = ca.issue("ih-test-01");
	let client = https_client(&ca, &cert, &key, handle.http_addr);

	let resp = client
		.post(format!("{}/api/v1/handshake", base))
		.send()
		.await
		.unwrap();
	let body: serde_json::Value = resp.json().await.unwrap();
	let token = body["session_token"].as_str().unwrap().to_string();

	let resp = client
		.post(format!("{}/api/v1/tunnels", base))
		.bearer_auth(&token)
		.json(&json!({ "service_id": "demo", "protocol": "tcp" }))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 403);
	let body: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(body["code"], "POLICY_DENIED");
	assert_eq!(body["type"], "error");

	handle.shutdown().await;
}

#[tokio::test]
async fn session_refresh_and_revoke_roundtrip() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	let (cert, key) = ca.issue("ih-roundtrip");
	let client = https_client(&ca, &cert, &key, handle.http_addr);

	let resp = client
		.post(format!("{}/api/v1/handshake", base))
		.send()
		.await
		.unwrap();
	let body: serde_json::Value = resp.json().await.unwrap();
	let token = body["session_token"].as_str().unwrap().to_string();
	let first_expiry = chrono::DateTime::parse_from_rfc3339(body["expires_at"].as_str().unwrap())
		.unwrap();

	// Refresh extends the expiry monotonically.
	let resp = client
		.post(format!("{}/api/v1/sessions/refresh", base))
		.bearer_auth(&token)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let body: serde_json::Value = resp.json().await.unwrap();
	let refreshed = chrono::DateTime::parse_from_rfc3339(body["expires_at"].as_str().unwrap())
		.unwrap();
	assert!(refreshed >= first_expiry);

	// Revoke, then the token is dead.
	let resp = client
		.delete(format!("{}/api/v1/sessions/{}", base, token))
		.bearer_auth(&token)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	let resp = client
		.post(format!("{}/api/v1/sessions/refresh", base))
		.bearer_auth(&token)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);

	handle.shutdown().await;
}

#[tokio::test]
async fn health_needs_no_certificate() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	let ca_pem = std::fs::read(&ca.ca_path).unwrap();
	let client = reqwest::Client::builder()
		.use_rustls_tls()
		.add_root_certificate(reqwest::Certificate::from_pem(&ca_pem).unwrap())
		.resolve("localhost", handle.http_addr)
		.build()
		.unwrap();

	let resp = client.get(format!("{}/health", base)).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "OK");

	// but the service catalog requires a client certificate
	let resp = client
		.get(format!("{}/api/v1/services", base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);

	handle.shutdown().await;
}

#[tokio::test]
async fn service_catalog_is_filtered_and_addressable() {
	let ca = TestCa::new();
	let handle = start_test_controller(&ca).await;
	let base = format!("https://localhost:{}", handle.http_addr.port());

	handle
		.state
		.catalog
		.create_service(demo_service("demo", 9999))
		.await
		.unwrap();
	handle
		.state
		.catalog
		.create_service(demo_service("retired", 9998))
		.await
		.unwrap();
	handle.state.catalog.delete_service("retired").await.unwrap();

	let (cert, key) = ca.issue("ah-agent-1");
	let client = https_client(&ca, &cert, &key, handle.http_addr);

	let resp = client
		.get(format!("{}/api/v1/services", base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let services: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(services.as_array().unwrap().len(), 1);
	assert_eq!(services[0]["service_id"], "demo");
	// target coordinates are the catalog's to know
	assert_eq!(services[0]["target_port"], 9999);

	let resp = client
		.get(format!("{}/api/v1/services/retired", base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 404);

	handle.shutdown().await;
}
