#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use swapchat_domain::{ChatError, Conversation, ConversationId, Message, Principal, SecretString};
use swapchat_protocol::pb::envelope::Msg;
use swapchat_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, encode_frame, envelope, error_envelope, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::chat::ChatService;
use crate::server::core::ChatCore;
use crate::server::events::{DeliveryEvent, DeliveryPayload};
use crate::server::lifecycle::{Connection, Credential};
use crate::util::time::unix_ms_now;

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// How long a client has to present its handshake after opening the control stream.
	pub handshake_timeout: Duration,
	/// A single event write slower than this marks the connection as dead.
	pub write_timeout: Duration,
	pub server_instance_id: String,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			handshake_timeout: Duration::from_secs(10),
			write_timeout: Duration::from_secs(5),
			server_instance_id: String::new(),
		}
	}
}

pub fn message_to_pb(m: &Message) -> pb::ChatMessage {
	pb::ChatMessage {
		id: m.id.to_string(),
		conversation_id: m.conversation_id.to_string(),
		sender: m.sender.to_string(),
		content: m.content.clone(),
		seq: m.seq,
		created_at_unix_ms: m.created_at_unix_ms,
	}
}

pub fn conversation_to_pb(c: &Conversation) -> pb::ConversationInfo {
	pb::ConversationInfo {
		id: c.id.to_string(),
		participants: c.participants.iter().map(|p| p.to_string()).collect(),
		latest_message_id: c.latest_message.map(|m| m.to_string()).unwrap_or_default(),
		updated_at_unix_ms: c.updated_at_unix_ms,
	}
}

pub fn event_to_pb(event: &DeliveryEvent) -> pb::EventEnvelope {
	let payload = match &event.payload {
		DeliveryPayload::Message(m) => pb::event_envelope::Event::MessageReceived(message_to_pb(m)),
		DeliveryPayload::Typing { sender, active } => pb::event_envelope::Event::Typing(pb::TypingEvent {
			sender: sender.to_string(),
			active: *active,
		}),
	};

	pb::EventEnvelope {
		conversation_id: event.conversation_id.to_string(),
		server_time_unix_ms: unix_ms_now(),
		event: Some(payload),
	}
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId, ChatError> {
	raw.trim()
		.parse()
		.map_err(|e| ChatError::InvalidRequest(format!("invalid conversation id {raw:?}: {e}")))
}

pub async fn handle_connection(
	connection: quinn::Connection,
	chat: ChatService,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("swapchat_quic_connections").decrement(1.0);
		}
	}

	metrics::gauge!("swapchat_quic_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let remote = connection.remote_address();
	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let max_frame_bytes = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut frames = FrameBuffer::new(max_frame_bytes);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("swapchat_control_bytes_in_total").increment(n as u64);
			frames.extend(&tmp[..n]);

			loop {
				match frames.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("swapchat_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let core = chat.core().clone();
	let (conn, events_rx) = core.on_connection_opened();

	let handshake = match tokio::time::timeout(settings.handshake_timeout, wait_for_handshake(&mut ctrl_rx)).await {
		Ok(Ok(h)) => h,
		Ok(Err(e)) => {
			debug!(conn_id = %conn.id(), %remote, error = %e, "no handshake");
			reject(&mut control_send, String::new(), "PROTOCOL", e.to_string()).await;
			core.on_connection_closed(&conn).await;
			reader_task.abort();
			return Ok(());
		}
		Err(_) => {
			warn!(conn_id = %conn.id(), %remote, "handshake timed out");
			reject(&mut control_send, String::new(), "PROTOCOL", "handshake timed out".to_string()).await;
			core.on_connection_closed(&conn).await;
			reader_task.abort();
			return Ok(());
		}
	};
	let (request_id, hello) = handshake;

	let credential = Credential::Token(SecretString::new(hello.token));
	let principal = match core.on_handshake(&conn, credential).await {
		Ok(p) => p,
		Err(e) => {
			reject(&mut control_send, request_id, e.code(), e.to_string()).await;
			core.on_connection_closed(&conn).await;
			reader_task.abort();
			return Ok(());
		}
	};

	info!(
		conn_id = %conn.id(),
		%remote,
		%principal,
		client_name = %hello.client_name,
		"session established"
	);

	let ok = envelope(
		request_id,
		Msg::HandshakeOk(pb::HandshakeOk {
			principal: principal.to_string(),
			server_instance_id: settings.server_instance_id.clone(),
			max_frame_bytes: settings.max_frame_bytes as u32,
		}),
	);
	if let Err(e) = send_envelope(&mut control_send, ok, settings.max_frame_bytes).await {
		core.on_connection_closed(&conn).await;
		reader_task.abort();
		return Err(e.context("send HandshakeOk"));
	}

	let events_send = match connection.open_uni().await {
		Ok(s) => s,
		Err(e) => {
			core.on_connection_closed(&conn).await;
			reader_task.abort();
			return Err(anyhow!(e).context("open events stream"));
		}
	};

	let writer_task = tokio::spawn(run_event_writer(
		Arc::clone(&conn),
		core.clone(),
		connection.clone(),
		events_rx,
		events_send,
		settings.clone(),
	));

	let loop_result: anyhow::Result<()> = async {
		loop {
			let env = tokio::select! {
				_ = conn.closed() => break,
				env = ctrl_rx.recv() => match env {
					Some(env) => env,
					None => break,
				},
			};

			let request_id = env.request_id;
			let Some(msg) = env.msg else {
				let err = ChatError::InvalidRequest("empty envelope".to_string());
				send_envelope(
					&mut control_send,
					error_envelope(request_id, err.code(), err.to_string()),
					settings.max_frame_bytes,
				)
				.await?;
				continue;
			};

			let reply = match msg {
				Msg::Handshake(h) => core
					.on_handshake(&conn, Credential::Token(SecretString::new(h.token)))
					.await
					.map(|_| Msg::Ack(pb::Ack {})),
				other => handle_request(&chat, &principal, other).await,
			};

			let out = match reply {
				Ok(msg) => envelope(request_id, msg),
				Err(e) => {
					debug!(conn_id = %conn.id(), %principal, code = e.code(), error = %e, "request failed");
					metrics::counter!("swapchat_request_errors_total", "code" => e.code()).increment(1);
					error_envelope(request_id, e.code(), e.to_string())
				}
			};
			send_envelope(&mut control_send, out, settings.max_frame_bytes).await?;
		}
		Ok(())
	}
	.await;

	core.on_connection_closed(&conn).await;
	writer_task.abort();
	reader_task.abort();

	match reader_task.await {
		Ok(Err(e)) => {
			debug!(conn_id = %conn.id(), error = %e, "control reader ended with error");
			if e.downcast_ref::<FramingError>().is_some() {
				connection.close(1u32.into(), b"protocol error");
			}
		}
		Ok(Ok(())) | Err(_) => {}
	}

	loop_result
}

async fn handle_request(chat: &ChatService, principal: &Principal, msg: Msg) -> Result<Msg, ChatError> {
	match msg {
		Msg::OpenConversation(req) => {
			let peers = req
				.peers
				.iter()
				.map(|p| {
					Principal::new(p.as_str()).map_err(|e| ChatError::InvalidRequest(format!("invalid peer {p:?}: {e}")))
				})
				.collect::<Result<Vec<_>, _>>()?;
			let conversation = chat.open_conversation(principal, &peers).await?;
			Ok(Msg::ConversationOpened(conversation_to_pb(&conversation)))
		}
		Msg::SendMessage(req) => {
			let conversation_id = parse_conversation_id(&req.conversation_id)?;
			let message = chat.send_message(principal, conversation_id, &req.content).await?;
			Ok(Msg::MessageSent(message_to_pb(&message)))
		}
		Msg::FetchHistory(req) => {
			let conversation_id = parse_conversation_id(&req.conversation_id)?;
			let messages = chat.history(principal, conversation_id).await?;
			Ok(Msg::History(pb::History {
				conversation_id: conversation_id.to_string(),
				messages: messages.iter().map(message_to_pb).collect(),
			}))
		}
		Msg::ListConversations(_) => {
			let conversations = chat.conversations(principal).await?;
			Ok(Msg::Conversations(pb::Conversations {
				conversations: conversations.iter().map(conversation_to_pb).collect(),
			}))
		}
		Msg::Typing(req) => {
			let conversation_id = parse_conversation_id(&req.conversation_id)?;
			chat.typing(principal, conversation_id, req.active).await?;
			Ok(Msg::Ack(pb::Ack {}))
		}
		Msg::Ping(p) => Ok(Msg::Pong(pb::Pong {
			client_time_unix_ms: p.client_time_unix_ms,
			server_time_unix_ms: unix_ms_now(),
		})),
		Msg::Handshake(_)
		| Msg::HandshakeOk(_)
		| Msg::Error(_)
		| Msg::ConversationOpened(_)
		| Msg::MessageSent(_)
		| Msg::History(_)
		| Msg::Conversations(_)
		| Msg::Ack(_)
		| Msg::Pong(_) => Err(ChatError::InvalidRequest("unexpected message on control stream".to_string())),
	}
}

/// Drain the connection's outbox onto its events stream.
async fn run_event_writer(
	conn: Arc<Connection>,
	core: ChatCore,
	quic: quinn::Connection,
	mut events_rx: mpsc::Receiver<Arc<DeliveryEvent>>,
	mut events_send: quinn::SendStream,
	settings: ConnectionSettings,
) {
	loop {
		let event = tokio::select! {
			_ = conn.closed() => {
				debug!(conn_id = %conn.id(), "connection torn down by the core; closing transport");
				quic.close(3u32.into(), b"connection closed");
				break;
			}
			event = events_rx.recv() => match event {
				Some(event) => event,
				None => break,
			},
		};

		let frame = match encode_frame(&event_to_pb(&event), settings.max_frame_bytes) {
			Ok(f) => f,
			Err(e) => {
				warn!(conn_id = %conn.id(), conversation = %event.conversation_id, error = %e, "event does not fit in a frame; skipped");
				continue;
			}
		};

		match tokio::time::timeout(settings.write_timeout, events_send.write_all(&frame)).await {
			Ok(Ok(())) => {
				metrics::counter!("swapchat_events_out_total").increment(1);
			}
			Ok(Err(e)) => {
				debug!(conn_id = %conn.id(), error = %e, "events stream write failed");
				break;
			}
			Err(_) => {
				warn!(conn_id = %conn.id(), timeout = ?settings.write_timeout, "events stream write timed out");
				quic.close(2u32.into(), b"slow consumer");
				break;
			}
		}
	}

	core.on_connection_closed(&conn).await;
}

async fn wait_for_handshake(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<(String, pb::Handshake)> {
	let env = ctrl_rx
		.recv()
		.await
		.ok_or_else(|| anyhow!("connection closed before handshake"))?;

	match env.msg {
		Some(Msg::Handshake(h)) => Ok((env.request_id, h)),
		_ => Err(anyhow!("first frame must be a handshake")),
	}
}

/// Report a handshake failure, then finish the control stream so the frame is flushed before the connection drops.
async fn reject(send: &mut quinn::SendStream, request_id: String, code: &str, message: String) {
	let env = error_envelope(request_id, code, message);
	if send_envelope(send, env, DEFAULT_MAX_FRAME_SIZE).await.is_ok() {
		let _ = send.finish();
		let _ = tokio::time::timeout(Duration::from_secs(1), send.stopped()).await;
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_bytes).map_err(|e| anyhow!(e))?;
	metrics::counter!("swapchat_envelopes_out_total").increment(1);
	metrics::counter!("swapchat_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
