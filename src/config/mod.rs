use anyhow::Result;
use serde::Deserialize;

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): `config` file (optional) and environment
/// variables prefixed with `BFR_` (e.g. `BFR_PORT`). One `Settings` instance
/// covers both planes: the control-plane HTTPS server and the data-plane
/// tunnel relay.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Settings {
	/// Bind address for both listeners.
	pub host: String,
	/// Control-plane HTTPS port.
	pub port: u16,
	/// Data-plane relay port.
	pub relay_port: u16,
	/// Address AH agents should dial for their relay half. Defaults to
	/// `host:relay_port` when unset; set it when the controller sits behind
	/// NAT or a load balancer.
	pub relay_public_addr: Option<String>,
	pub tls_cert: Option<String>,
	pub tls_key: Option<String>,
	/// CA bundle used to verify peer certificates on both planes.
	pub tls_ca: Option<String>,
	pub session_ttl_secs: u64,
	pub session_sweep_secs: u64,
	pub tunnel_ttl_secs: u64,
	pub pairing_timeout_secs: u64,
	pub relay_read_timeout_secs: u64,
	pub relay_write_timeout_secs: u64,
	pub relay_max_connections: usize,
	pub sse_heartbeat_secs: u64,
	pub audit_log_path: String,
	pub database_url: Option<String>,
	pub log_level: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 8443,
			relay_port: 9443,
			relay_public_addr: None,
			tls_cert: None,
			tls_key: None,
			tls_ca: None,
			session_ttl_secs: 3600,
			session_sweep_secs: 60,
			tunnel_ttl_secs: 3600,
			pairing_timeout_secs: 30,
			relay_read_timeout_secs: 300,
			relay_write_timeout_secs: 300,
			relay_max_connections: 1024,
			sse_heartbeat_secs: 30,
			audit_log_path: "bifrost-audit.jsonl".to_string(),
			database_url: None,
			log_level: Some("info".to_string()),
		}
	}
}

impl Settings {
	/// The data-plane address advertised to AH agents in `tunnel.created`
	/// events.
	pub fn controller_relay_addr(&self) -> String {
		self.relay_public_addr
			.clone()
			.unwrap_or_else(|| format!("{}:{}", self.host, self.relay_port))
	}
}

/// Partial settings used to overlay environment/file values on top of defaults.
#[derive(Debug, Deserialize)]
struct PartialSettings {
	host: Option<String>,
	port: Option<u16>,
	relay_port: Option<u16>,
	relay_public_addr: Option<String>,
	tls_cert: Option<String>,
	tls_key: Option<String>,
	tls_ca: Option<String>,
	session_ttl_secs: Option<u64>,
	session_sweep_secs: Option<u64>,
	tunnel_ttl_secs: Option<u64>,
	pairing_timeout_secs: Option<u64>,
	relay_read_timeout_secs: Option<u64>,
	relay_write_timeout_secs: Option<u64>,
	relay_max_connections: Option<usize>,
	sse_heartbeat_secs: Option<u64>,
	audit_log_path: Option<String>,
	database_url: Option<String>,
	log_level: Option<String>,
}

/// Load settings from config file (optional) and environment variables.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		// Use a double-underscore separator so single-underscore env names like
		// `BFR_DATABASE_URL` map to `database_url` instead of nested `database.url`.
		.add_source(config::Environment::with_prefix("BFR").separator("__"));

	let cfg = builder.build()?;

	let partial: PartialSettings = cfg.try_deserialize()?;

	let mut s = Settings::default();
	if let Some(host) = partial.host {
		s.host = host;
	}
	if let Some(port) = partial.port {
		s.port = port;
	}
	if let Some(port) = partial.relay_port {
		s.relay_port = port;
	}
	if let Some(addr) = partial.relay_public_addr {
		s.relay_public_addr = Some(addr);
	}
	if let Some(cert) = partial.tls_cert {
		s.tls_cert = Some(cert);
	}
	if let Some(key) = partial.tls_key {
		s.tls_key = Some(key);
	}
	if let Some(ca) = partial.tls_ca {
		s.tls_ca = Some(ca);
	}
	if let Some(v) = partial.session_ttl_secs {
		s.session_ttl_secs = v;
	}
	if let Some(v) = partial.session_sweep_secs {
		s.session_sweep_secs = v;
	}
	if let Some(v) = partial.tunnel_ttl_secs {
		s.tunnel_ttl_secs = v;
	}
	if let Some(v) = partial.pairing_timeout_secs {
		s.pairing_timeout_secs = v;
	}
	if let Some(v) = partial.relay_read_timeout_secs {
		s.relay_read_timeout_secs = v;
	}
	if let Some(v) = partial.relay_write_timeout_secs {
		s.relay_write_timeout_secs = v;
	}
	if let Some(v) = partial.relay_max_connections {
		s.relay_max_connections = v;
	}
	if let Some(v) = partial.sse_heartbeat_secs {
		s.sse_heartbeat_secs = v;
	}
	if let Some(p) = partial.audit_log_path {
		s.audit_log_path = p;
	}
	if let Some(db) = partial.database_url {
		s.database_url = Some(db);
	}
	if let Some(level) = partial.log_level {
		s.log_level = Some(level);
	}

	// Explicitly prefer direct environment variables when present. Some
	// environments (CI, test harnesses) may set env vars in ways that the
	// `config` crate doesn't map as expected; read them directly to ensure
	// explicit overrides take effect.
	if let Ok(h) = std::env::var("BFR_HOST") {
		if !h.is_empty() {
			s.host = h;
		}
	}
	if let Ok(p) = std::env::var("BFR_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.port = pn;
		}
	}
	if let Ok(p) = std::env::var("BFR_RELAY_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.relay_port = pn;
		}
	}
	if let Ok(c) = std::env::var("BFR_TLS_CERT") {
		if !c.is_empty() {
			s.tls_cert = Some(c);
		}
	}
	if let Ok(k) = std::env::var("BFR_TLS_KEY") {
		if !k.is_empty() {
			s.tls_key = Some(k);
		}
	}
	if let Ok(ca) = std::env::var("BFR_TLS_CA") {
		if !ca.is_empty() {
			s.tls_ca = Some(ca);
		}
	}
	if let Ok(db) = std::env::var("BFR_DATABASE_URL") {
		if !db.is_empty() {
			s.database_url = Some(db);
		}
	}
	if let Ok(l) = std::env::var("BFR_LOG_LEVEL") {
		if !l.is_empty() {
			s.log_level = Some(l);
		}
	}

	Ok(s)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_cover_both_planes() {
		let s = Settings::default();
		assert_eq!(s.port, 8443);
		assert_eq!(s.relay_port, 9443);
		assert_eq!(s.pairing_timeout_secs, 30);
		assert_eq!(s.relay_read_timeout_secs, 300);
		assert_eq!(s.sse_heartbeat_secs, 30);
	}

	#[test]
	fn relay_addr_defaults_to_host_and_port() {
		let s = Settings::default();
		assert_eq!(s.controller_relay_addr(), "127.0.0.1:9443");

		let mut s = Settings::default();
		s.relay_public_addr = Some("vpn.example.com:9443".to_string());
		assert_eq!(s.controller_relay_addr(), "vpn.example.com:9443");
	}

	#[test]
	fn test_load_env_overlay() {
		// Save original values so we can restore them
		let orig_host = std::env::var_os("BFR_HOST");
		let orig_port = std::env::var_os("BFR_PORT");

		unsafe { std::env::set_var("BFR_HOST", "0.0.0.0") };
		unsafe { std::env::set_var("BFR_PORT", "10443") };

		let s = load().expect("load should succeed with env");
		assert_eq!(s.host, "0.0.0.0");
		assert_eq!(s.port, 10443u16);

		// restore originals
		match orig_host {
			Some(v) => unsafe { std::env::set_var("BFR_HOST", v) },
			None => unsafe { std::env::remove_var("BFR_HOST") },
		}
		match orig_port {
			Some(v) => unsafe { std::env::set_var("BFR_PORT", v) },
			None => unsafe { std::env::remove_var("BFR_PORT") },
		}
	}
}
