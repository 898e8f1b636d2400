#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use swapchat_domain::{ChatError, Conversation, ConversationId, Message, MessageId, Principal, SecretString};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::events::DeliveryEvent;
use crate::server::lifecycle::{Connection, ConnectionManager, Credential};
use crate::server::presence::PresenceRegistry;
use crate::server::session::SessionResolver;

/// `tok-<name>` resolves to `<name>`; `expired` and anything else fail.
#[derive(Debug, Default)]
pub struct TokenTableResolver {
	pub delay: Option<Duration>,
}

#[async_trait::async_trait]
impl SessionResolver for TokenTableResolver {
	async fn resolve(&self, credential: &SecretString) -> Result<Principal, ChatError> {
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}

		match credential.expose().strip_prefix("tok-") {
			Some(name) => Principal::new(name).map_err(|e| ChatError::Authentication(e.to_string())),
			None if credential.expose() == "expired" => Err(ChatError::Authentication("token expired".to_string())),
			None => Err(ChatError::Authentication("unknown token".to_string())),
		}
	}
}

pub fn p(name: &str) -> Principal {
	Principal::new(name).expect("valid principal")
}

pub fn token(name: &str) -> Credential {
	Credential::Token(SecretString::new(format!("tok-{name}")))
}

pub fn manager(queue_capacity: usize) -> ConnectionManager {
	ConnectionManager::new(
		PresenceRegistry::new(),
		Arc::new(TokenTableResolver::default()),
		queue_capacity,
	)
}

/// Open and bind a connection for `name`.
pub async fn bound(
	manager: &ConnectionManager,
	name: &str,
) -> (Arc<Connection>, mpsc::Receiver<Arc<DeliveryEvent>>) {
	let (conn, rx) = manager.open();
	manager.handshake(&conn, token(name)).await.expect("handshake");
	(conn, rx)
}

pub fn conversation(names: &[&str]) -> Conversation {
	let participants: BTreeSet<Principal> = names.iter().map(|n| p(n)).collect();
	Conversation {
		id: ConversationId::new_v4(),
		participants,
		latest_message: None,
		created_at_unix_ms: 0,
		updated_at_unix_ms: 0,
	}
}

pub fn message(conversation: &Conversation, sender: &str, content: &str, seq: u64) -> Message {
	Message {
		id: MessageId::new_v4(),
		conversation_id: conversation.id,
		sender: p(sender),
		content: content.to_string(),
		seq,
		created_at_unix_ms: seq as i64,
	}
}

pub async fn recv_soon(rx: &mut mpsc::Receiver<Arc<DeliveryEvent>>) -> Arc<DeliveryEvent> {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected a delivery within timeout")
		.expect("outbox open")
}

pub async fn assert_quiet(rx: &mut mpsc::Receiver<Arc<DeliveryEvent>>) {
	if let Ok(Some(event)) = timeout(Duration::from_millis(50), rx.recv()).await {
		panic!("unexpected delivery: {event:?}");
	}
}
