#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use swapchat_domain::SecretString;
use swapchat_protocol::DEFAULT_MAX_FRAME_SIZE;
use tracing::{info, warn};

use crate::server::chat::ChatConfig;
use crate::server::core::DeliveryConfig;
use crate::server::session::DEFAULT_TOKEN_TTL;

/// Default config path: `~/.swapchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".swapchat").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_overrides_from(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub delivery: DeliverySettings,
	pub chat: ChatSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for session tokens. Required to serve.
	pub auth_hmac_secret: Option<SecretString>,
	pub handshake_timeout: Duration,
	pub write_timeout: Duration,
	pub max_frame_bytes: usize,
	/// Lifetime of tokens minted with `--issue-token`.
	pub token_ttl: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			handshake_timeout: Duration::from_secs(10),
			write_timeout: Duration::from_secs(5),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			token_ttl: DEFAULT_TOKEN_TTL,
		}
	}
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
	pub lanes: usize,
	pub lane_queue_capacity: usize,
	pub connection_queue_capacity: usize,
	/// 0 disables the slow-consumer cutoff.
	pub max_consecutive_drops: u32,
	pub debug_log_events: bool,
}

impl Default for DeliverySettings {
	fn default() -> Self {
		let d = DeliveryConfig::default();
		Self {
			lanes: d.lanes,
			lane_queue_capacity: d.lane_queue_capacity,
			connection_queue_capacity: d.connection_queue_capacity,
			max_consecutive_drops: d.max_consecutive_drops,
			debug_log_events: d.debug_log_events,
		}
	}
}

impl DeliverySettings {
	pub fn to_delivery_config(&self) -> DeliveryConfig {
		DeliveryConfig {
			connection_queue_capacity: self.connection_queue_capacity,
			lanes: self.lanes,
			lane_queue_capacity: self.lane_queue_capacity,
			max_consecutive_drops: self.max_consecutive_drops,
			debug_log_events: self.debug_log_events,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub max_message_chars: usize,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			max_message_chars: ChatConfig::default().max_message_chars,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the database store instead of the in-memory one.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	delivery: FileDeliverySettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	handshake_timeout_ms: Option<u64>,
	write_timeout_ms: Option<u64>,
	max_frame_bytes: Option<usize>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDeliverySettings {
	lanes: Option<usize>,
	lane_queue_capacity: Option<usize>,
	connection_queue_capacity: Option<usize>,
	max_consecutive_drops: Option<u32>,
	debug_log_events: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	max_message_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let delivery_defaults = DeliverySettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
				handshake_timeout: file
					.server
					.handshake_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.handshake_timeout),
				write_timeout: file
					.server
					.write_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.write_timeout),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(server_defaults.max_frame_bytes),
				token_ttl: file
					.server
					.token_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.token_ttl),
			},
			delivery: DeliverySettings {
				lanes: file.delivery.lanes.filter(|v| *v > 0).unwrap_or(delivery_defaults.lanes),
				lane_queue_capacity: file
					.delivery
					.lane_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(delivery_defaults.lane_queue_capacity),
				connection_queue_capacity: file
					.delivery
					.connection_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(delivery_defaults.connection_queue_capacity),
				max_consecutive_drops: file
					.delivery
					.max_consecutive_drops
					.unwrap_or(delivery_defaults.max_consecutive_drops),
				debug_log_events: file.delivery.debug_log_events.unwrap_or(false),
			},
			chat: ChatSettings {
				max_message_chars: file
					.chat
					.max_message_chars
					.filter(|v| *v > 0)
					.unwrap_or(ChatSettings::default().max_message_chars),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `SWAPCHAT_*` overrides read through `lookup`.
fn apply_overrides_from(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("SWAPCHAT_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_HANDSHAKE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.handshake_timeout = Duration::from_millis(ms);
		info!(ms, "server config: handshake_timeout overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_WRITE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.write_timeout = Duration::from_millis(ms);
		info!(ms, "server config: write_timeout overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.token_ttl = Duration::from_secs(secs);
		info!(secs, "server config: token_ttl overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_DELIVERY_LANES")
		&& let Ok(lanes) = v.parse::<usize>()
		&& lanes > 0
	{
		cfg.delivery.lanes = lanes;
		info!(lanes, "delivery config: lanes overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_CONNECTION_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.delivery.connection_queue_capacity = capacity;
		info!(capacity, "delivery config: connection_queue_capacity overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_MAX_CONSECUTIVE_DROPS")
		&& let Ok(drops) = v.parse::<u32>()
	{
		cfg.delivery.max_consecutive_drops = drops;
		info!(drops, "delivery config: max_consecutive_drops overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_DEBUG_LOG_EVENTS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.delivery.debug_log_events = enabled;
		info!(enabled, "delivery config: debug_log_events overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.parse::<usize>()
		&& chars > 0
	{
		cfg.chat.max_message_chars = chars;
		info!(chars, "chat config: max_message_chars overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("SWAPCHAT_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence enabled without database_url; falling back to in-memory store");
		cfg.persistence.enabled = false;
	}
}
