#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use swapchat_client_core::{ClientConfig, ClientCoreError, SessionControl, SessionEvents};
use swapchat_domain::SecretString;
use swapchat_protocol::pb;
use swapchat_protocol::pb::event_envelope::Event;

use crate::quic::config::QuicServerConfig;
use crate::server::chat::{ChatConfig, ChatService};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::core::{ChatCore, DeliveryConfig};
use crate::server::session::{HmacSessionResolver, issue_token};
use crate::server::store::InMemoryConversationStore;
use crate::server::test_support::p;

const SECRET: &str = "quic-test-secret";

struct TestServer {
	addr: SocketAddr,
	resolver: HmacSessionResolver,
	chat: ChatService,
	_endpoint: quinn::Endpoint,
}

async fn start_server() -> TestServer {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let bind: SocketAddr = "127.0.0.1:0".parse().expect("bind addr");
	let (endpoint, _cert) = QuicServerConfig::new(bind).bind_dev_endpoint().expect("bind dev endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	let resolver = HmacSessionResolver::new(SecretString::new(SECRET));
	let core = ChatCore::new(
		Arc::new(InMemoryConversationStore::new()),
		Arc::new(resolver.clone()),
		&DeliveryConfig::default(),
	);
	let chat = ChatService::new(core, ChatConfig::default());

	let accept_endpoint = endpoint.clone();
	let accept_chat = chat.clone();
	tokio::spawn(async move {
		while let Some(incoming) = accept_endpoint.accept().await {
			let chat = accept_chat.clone();
			tokio::spawn(async move {
				if let Ok(conn) = incoming.await {
					let _ = handle_connection(conn, chat, ConnectionSettings::default()).await;
				}
			});
		}
	});

	TestServer {
		addr,
		resolver,
		chat,
		_endpoint: endpoint,
	}
}

impl TestServer {
	fn token(&self, name: &str) -> String {
		self.resolver.issue(&p(name), Duration::from_secs(300))
	}

	async fn connect_with(&self, token: String) -> Result<(SessionControl, pb::HandshakeOk), ClientCoreError> {
		let cfg = ClientConfig {
			server_host: "localhost".to_string(),
			server_port: self.addr.port(),
			server_addr: Some(self.addr),
			token,
			connect_timeout: Duration::from_secs(5),
			..ClientConfig::default()
		};
		SessionControl::connect(cfg).await
	}

	async fn connect(&self, name: &str) -> SessionControl {
		let (control, ok) = self.connect_with(self.token(name)).await.expect("connect");
		assert_eq!(ok.principal, name);
		control
	}
}

async fn next_event(events: &mut SessionEvents) -> pb::EventEnvelope {
	tokio::time::timeout(Duration::from_secs(5), events.next_event())
		.await
		.expect("event within timeout")
		.expect("events stream healthy")
		.expect("events stream open")
}

#[tokio::test]
async fn message_from_bob_is_pushed_to_alice() {
	let server = start_server().await;

	let mut alice = server.connect("alice").await;
	let mut alice_events = alice.events().expect("events");
	let mut bob = server.connect("bob").await;

	let conv = bob.open_conversation(["alice".to_string()]).await.expect("open");
	let mut participants = conv.participants.clone();
	participants.sort();
	assert_eq!(participants, vec!["alice".to_string(), "bob".to_string()]);

	let sent = bob.send_message(&conv.id, "hi alice").await.expect("send");
	assert_eq!(sent.seq, 1);

	let ev = next_event(&mut alice_events).await;
	assert_eq!(ev.conversation_id, conv.id);
	match ev.event {
		Some(Event::MessageReceived(m)) => {
			assert_eq!(m.id, sent.id);
			assert_eq!(m.sender, "bob");
			assert_eq!(m.content, "hi alice");
		}
		other => panic!("expected MessageReceived, got {other:?}"),
	}

	let history = alice.fetch_history(&conv.id).await.expect("history");
	assert_eq!(history.messages.len(), 1);

	let listed = alice.list_conversations().await.expect("list");
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].latest_message_id, sent.id);
}

#[tokio::test]
async fn typing_reaches_the_peer() {
	let server = start_server().await;

	let mut alice = server.connect("alice").await;
	let mut alice_events = alice.events().expect("events");
	let mut bob = server.connect("bob").await;

	let conv = bob.open_conversation(["alice".to_string()]).await.expect("open");
	bob.typing(&conv.id, true).await.expect("typing");

	let ev = next_event(&mut alice_events).await;
	match ev.event {
		Some(Event::Typing(t)) => {
			assert_eq!(t.sender, "bob");
			assert!(t.active);
		}
		other => panic!("expected Typing, got {other:?}"),
	}

	let pong = alice.ping(42).await.expect("ping");
	assert_eq!(pong.client_time_unix_ms, 42);
}

#[tokio::test]
async fn expired_token_is_rejected_with_authentication() {
	let server = start_server().await;

	let stale = issue_token(&p("alice"), Duration::from_secs(1), &SecretString::new(SECRET), 0);
	let err = match server.connect_with(stale).await {
		Ok(_) => panic!("expired token must not sign in"),
		Err(e) => e,
	};
	assert_eq!(err.server_code(), Some("AUTHENTICATION"));
	assert!(!server.chat.core().registry().is_online(&p("alice")).await);
}

#[tokio::test]
async fn outsiders_cannot_post_into_a_conversation() {
	let server = start_server().await;

	let mut bob = server.connect("bob").await;
	let conv = bob.open_conversation(["alice".to_string()]).await.expect("open");

	let mut mallory = server.connect("mallory").await;
	let err = mallory.send_message(&conv.id, "let me in").await.unwrap_err();
	assert_eq!(err.server_code(), Some("NOT_PARTICIPANT"));

	let err = mallory.send_message("not-a-uuid", "x").await.unwrap_err();
	assert_eq!(err.server_code(), Some("INVALID_REQUEST"));

	// The control stream survives request errors.
	mallory.ping(1).await.expect("ping after errors");
}

#[tokio::test]
async fn closing_the_connection_clears_presence() {
	let server = start_server().await;
	let registry = server.chat.core().registry().clone();

	let alice = server.connect("alice").await;
	assert!(registry.is_online(&p("alice")).await);

	alice.close(0, "bye");

	let cleared = tokio::time::timeout(Duration::from_secs(5), async {
		while registry.is_online(&p("alice")).await {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await;
	assert!(cleared.is_ok(), "alice should go offline after closing");
}

#[tokio::test]
async fn server_side_teardown_closes_the_transport() {
	let server = start_server().await;
	let core = server.chat.core().clone();

	let mut alice = server.connect("alice").await;
	let mut alice_events = alice.events().expect("events");

	let conns = core.registry().connections_for(&p("alice")).await;
	assert_eq!(conns.len(), 1);
	core.on_connection_closed(&conns[0]).await;

	let ended = tokio::time::timeout(Duration::from_secs(5), alice_events.next_event())
		.await
		.expect("events stream ends after teardown");
	assert!(matches!(ended, Ok(None) | Err(_)), "no event expected, got {ended:?}");
	assert!(alice.ping(7).await.is_err());
	assert!(!core.registry().is_online(&p("alice")).await);
}
