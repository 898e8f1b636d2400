#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use swapchat_domain::Principal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use crate::quic::config::QuicServerConfig;
use crate::server::chat::{ChatConfig, ChatService};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::core::ChatCore;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::session::HmacSessionResolver;
use crate::server::store::{ConversationStore, InMemoryConversationStore};
use crate::server::store_sql::PersistentConversationStore;

const DEFAULT_BIND: &str = "quic://127.0.0.1:18204";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: swapchat_server [--bind quic://host:port] [--config path]\n\
\x20      swapchat_server --issue-token <principal> [--ttl-secs n]\n\
\n\
Options:\n\
\t--bind          Bind endpoint (default: {DEFAULT_BIND})\n\
\t--config        Config file (default: ~/.swapchat/config.toml)\n\
\t--issue-token   Print a session token for <principal> and exit\n\
\t--ttl-secs      Token lifetime for --issue-token (default: server.token_ttl_secs)\n\
\t--help          Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	issue_token_for: Option<String>,
	ttl: Option<Duration>,
}

fn parse_bind(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let rest = endpoint
		.trim()
		.strip_prefix("quic://")
		.ok_or_else(|| anyhow!("bind endpoint must start with quic:// (got {endpoint:?})"))?;

	rest.to_socket_addrs()
		.with_context(|| format!("resolve bind address {rest:?}"))?
		.next()
		.ok_or_else(|| anyhow!("bind address {rest:?} resolved to nothing"))
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config_path = None;
	let mut issue_token_for = None;
	let mut ttl = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				config_path = Some(PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit())));
			}
			"--issue-token" => {
				issue_token_for = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			"--ttl-secs" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let secs = v.trim().parse::<u64>().unwrap_or_else(|_| {
					eprintln!("--ttl-secs expects a number of seconds");
					usage_and_exit();
				});
				ttl = Some(Duration::from_secs(secs));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = parse_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e:#}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		issue_token_for,
		ttl,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,swapchat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("swapchat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;

	let secret = server_cfg
		.server
		.auth_hmac_secret
		.clone()
		.ok_or_else(|| anyhow!("server.auth_hmac_secret (or SWAPCHAT_AUTH_HMAC_SECRET) is required"))?;
	let resolver = HmacSessionResolver::new(secret);

	if let Some(raw) = args.issue_token_for {
		let principal = Principal::new(raw).context("invalid principal")?;
		println!("{}", resolver.issue(&principal, args.ttl.unwrap_or(server_cfg.server.token_ttl)));
		return Ok(());
	}

	init_tracing();
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn ConversationStore> = if server_cfg.persistence.enabled
		&& let Some(database_url) = server_cfg.persistence.database_url.as_deref()
	{
		Arc::new(PersistentConversationStore::connect(database_url).await?)
	} else {
		info!("using in-memory conversation store");
		Arc::new(InMemoryConversationStore::new())
	};

	let core = ChatCore::new(store, Arc::new(resolver), &server_cfg.delivery.to_delivery_config());
	let chat = ChatService::new(
		core.clone(),
		ChatConfig {
			max_message_chars: server_cfg.chat.max_message_chars,
		},
	);

	let health_state = HealthState::new(core.registry().clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::new(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"swapchat_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		handshake_timeout: server_cfg.server.handshake_timeout,
		write_timeout: server_cfg.server.write_timeout,
		server_instance_id: Uuid::new_v4().to_string(),
	};

	health_state.mark_ready();

	while let Some(incoming) = endpoint.accept().await {
		metrics::counter!("swapchat_connections_total").increment(1);

		let chat = chat.clone();
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					let remote = connection.remote_address();
					if let Err(e) = handle_connection(connection, chat, conn_settings).await {
						warn!(%remote, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
