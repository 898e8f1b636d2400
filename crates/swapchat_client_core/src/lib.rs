#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::{Endpoint, TransportConfig, VarInt};
use swapchat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, encode_frame};
use swapchat_protocol::pb;
use swapchat_protocol::pb::envelope::Msg;
use tracing::{debug, info};

/// Local dev endpoint, matching the server's default bind.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18204";

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal), also used as TLS SNI.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,

	/// Session token presented in the handshake.
	pub token: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let invalid = |why: &str| ClientCoreError::Protocol(format!("invalid endpoint {endpoint:?} (expected quic://host:port): {why}"));

		let rest = endpoint.trim().strip_prefix("quic://").ok_or_else(|| invalid("missing quic:// scheme"))?;
		let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(invalid("empty host"));
		}
		let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
		Ok((host.to_string(), port))
	}

	/// Convenience: create a config from `quic://host:port` and a session token.
	pub fn from_quic_endpoint(endpoint: &str, token: impl Into<String>) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			token: token.into(),
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18204,
			server_addr: None,
			client_name: format!("swapchat-client-core/{}", env!("CARGO_PKG_VERSION")),
			token: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered a request with an error envelope.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	#[error("io error: {0}")]
	Io(String),

	#[error("error: {0}")]
	Other(String),
}

impl ClientCoreError {
	/// Server error code, when the failure came from an error envelope.
	pub fn server_code(&self) -> Option<&str> {
		match self {
			ClientCoreError::Server { code, .. } => Some(code),
			_ => None,
		}
	}
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Control half of a session: request/response over the bidirectional stream.
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	frames: FrameBuffer,
	max_frame_bytes: usize,
	next_request_id: u64,
	events_taken: bool,
}

/// Events half of a session. The server opens the stream after a successful handshake.
pub struct SessionEvents {
	conn: quinn::Connection,
	events_recv: Option<quinn::RecvStream>,
	frames: FrameBuffer,
}

impl SessionControl {
	/// Connect and perform the handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::HandshakeOk), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let mut control = Self {
			conn,
			control_send,
			control_recv,
			frames: FrameBuffer::new(cfg.max_frame_bytes),
			max_frame_bytes: cfg.max_frame_bytes,
			next_request_id: 0,
			events_taken: false,
		};

		let handshake = Msg::Handshake(pb::Handshake {
			token: cfg.token,
			client_name: cfg.client_name,
		});
		let reply = tokio::time::timeout(connect_timeout, control.request(handshake))
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for HandshakeOk after {connect_timeout:?}")))??;

		let ok = match reply {
			Msg::HandshakeOk(ok) => ok,
			other => return Err(unexpected("HandshakeOk", &other)),
		};

		debug!(
			principal = %ok.principal,
			server_instance_id = %ok.server_instance_id,
			max_frame_bytes = ok.max_frame_bytes,
			"handshake accepted"
		);

		if ok.max_frame_bytes > 0 {
			control.max_frame_bytes = (ok.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		}

		Ok((control, ok))
	}

	/// Find or create the conversation between us and `peers`.
	pub async fn open_conversation(
		&mut self,
		peers: impl IntoIterator<Item = String>,
	) -> Result<pb::ConversationInfo, ClientCoreError> {
		let peers = peers.into_iter().collect();
		match self.request(Msg::OpenConversation(pb::OpenConversation { peers })).await? {
			Msg::ConversationOpened(c) => Ok(c),
			other => Err(unexpected("ConversationOpened", &other)),
		}
	}

	pub async fn send_message(
		&mut self,
		conversation_id: &str,
		content: impl Into<String>,
	) -> Result<pb::ChatMessage, ClientCoreError> {
		let req = pb::SendMessage {
			conversation_id: conversation_id.to_string(),
			content: content.into(),
		};
		match self.request(Msg::SendMessage(req)).await? {
			Msg::MessageSent(m) => Ok(m),
			other => Err(unexpected("MessageSent", &other)),
		}
	}

	pub async fn fetch_history(&mut self, conversation_id: &str) -> Result<pb::History, ClientCoreError> {
		let req = pb::FetchHistory {
			conversation_id: conversation_id.to_string(),
		};
		match self.request(Msg::FetchHistory(req)).await? {
			Msg::History(h) => Ok(h),
			other => Err(unexpected("History", &other)),
		}
	}

	pub async fn list_conversations(&mut self) -> Result<Vec<pb::ConversationInfo>, ClientCoreError> {
		match self.request(Msg::ListConversations(pb::ListConversations {})).await? {
			Msg::Conversations(c) => Ok(c.conversations),
			other => Err(unexpected("Conversations", &other)),
		}
	}

	pub async fn typing(&mut self, conversation_id: &str, active: bool) -> Result<(), ClientCoreError> {
		let req = pb::Typing {
			conversation_id: conversation_id.to_string(),
			active,
		};
		match self.request(Msg::Typing(req)).await? {
			Msg::Ack(_) => Ok(()),
			other => Err(unexpected("Ack", &other)),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		match self.request(Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			Msg::Pong(p) => Ok(p),
			other => Err(unexpected("Pong", &other)),
		}
	}

	/// Take the events half. Only one `SessionEvents` exists per session.
	pub fn events(&mut self) -> Result<SessionEvents, ClientCoreError> {
		if self.events_taken {
			return Err(ClientCoreError::Protocol(
				"events stream already taken; reuse the existing SessionEvents".to_string(),
			));
		}
		self.events_taken = true;
		Ok(SessionEvents {
			conn: self.conn.clone(),
			events_recv: None,
			frames: FrameBuffer::new(self.max_frame_bytes),
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn request(&mut self, msg: Msg) -> Result<Msg, ClientCoreError> {
		self.next_request_id += 1;
		let request_id = self.next_request_id.to_string();

		let env = swapchat_protocol::envelope(request_id.clone(), msg);
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;

		let resp = read_one_envelope(&mut self.control_recv, &mut self.frames).await?;
		if !resp.request_id.is_empty() && resp.request_id != request_id {
			return Err(ClientCoreError::Protocol(format!(
				"reply for request {} while waiting for {request_id}",
				resp.request_id
			)));
		}

		match resp.msg {
			Some(Msg::Error(e)) => Err(ClientCoreError::Server {
				code: e.code,
				message: e.message,
			}),
			Some(msg) => Ok(msg),
			None => Err(ClientCoreError::Protocol("empty reply envelope".to_string())),
		}
	}
}

impl SessionEvents {
	/// Next pushed event, or `None` once the server closes the events stream.
	pub async fn next_event(&mut self) -> Result<Option<pb::EventEnvelope>, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(ev) = self.frames.next_frame::<pb::EventEnvelope>()? {
				debug!(
					conversation_id = %ev.conversation_id,
					event_kind = event_kind(&ev),
					"events stream decoded"
				);
				return Ok(Some(ev));
			}

			if self.events_recv.is_none() {
				let recv = match self.conn.accept_uni().await {
					Ok(recv) => recv,
					Err(quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed) => {
						return Ok(None);
					}
					Err(e) => return Err(ClientCoreError::Io(format!("accept_uni(events) failed: {e}"))),
				};
				debug!("events stream accepted");
				self.events_recv = Some(recv);
			}

			let Some(recv) = self.events_recv.as_mut() else {
				return Ok(None);
			};

			match recv.read(&mut tmp).await {
				Ok(Some(n)) => self.frames.extend(&tmp[..n]),
				Ok(None) => {
					info!("events stream closed");
					return Ok(None);
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			}
		}
	}

	/// Run until EOF or error, handing every event to `on_event`.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::EventEnvelope),
	{
		while let Some(ev) = self.next_event().await? {
			on_event(ev);
		}
		Ok(())
	}
}

pub fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	match ev.event.as_ref() {
		Some(pb::event_envelope::Event::MessageReceived(_)) => "message_received",
		Some(pb::event_envelope::Event::Typing(_)) => "typing",
		None => "empty",
	}
}

fn unexpected(expected: &str, got: &Msg) -> ClientCoreError {
	ClientCoreError::Protocol(format!("expected {expected}, got {got:?}"))
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_one_envelope(recv: &mut quinn::RecvStream, frames: &mut FrameBuffer) -> Result<pb::Envelope, ClientCoreError> {
	let mut tmp = [0u8; 8192];

	loop {
		if let Some(env) = frames.next_frame::<pb::Envelope>()? {
			return Ok(env);
		}

		match recv.read(&mut tmp).await {
			Ok(Some(n)) => frames.extend(&tmp[..n]),
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![swapchat_protocol::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	// Control stream is client-opened; events arrive on a server-opened uni stream.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(0));
	transport.max_concurrent_uni_streams(VarInt::from_u32(4));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
