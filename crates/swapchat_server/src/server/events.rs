#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use swapchat_domain::{ChatError, Conversation, ConversationId, Message, Principal};
use tokio::sync::mpsc;

use crate::server::lifecycle::{Connection, Credential};

/// Who receives a delivery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
	/// Conversation participants except the event origin.
	Others(BTreeSet<Principal>),
	/// Every conversation participant, origin included.
	Everyone(BTreeSet<Principal>),
	/// Explicit recipient list.
	Principals(Vec<Principal>),
}

/// What is pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPayload {
	Message(Arc<Message>),
	Typing { sender: Principal, active: bool },
}

/// Ephemeral envelope routed to live connections; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
	pub conversation_id: ConversationId,
	pub origin: Option<Principal>,
	pub audience: Audience,
	pub payload: DeliveryPayload,
}

impl DeliveryEvent {
	/// A persisted message for everyone in `conversation` but its sender.
	pub fn message(conversation: &Conversation, message: Message) -> Self {
		Self {
			conversation_id: conversation.id,
			origin: Some(message.sender.clone()),
			audience: Audience::Others(conversation.participants.clone()),
			payload: DeliveryPayload::Message(Arc::new(message)),
		}
	}

	pub fn typing(conversation: &Conversation, sender: Principal, active: bool) -> Self {
		Self {
			conversation_id: conversation.id,
			origin: Some(sender.clone()),
			audience: Audience::Others(conversation.participants.clone()),
			payload: DeliveryPayload::Typing { sender, active },
		}
	}

	/// Resolved, de-duplicated recipients.
	pub fn recipients(&self) -> BTreeSet<Principal> {
		match &self.audience {
			Audience::Others(participants) => participants
				.iter()
				.filter(|p| self.origin.as_ref() != Some(*p))
				.cloned()
				.collect(),
			Audience::Everyone(participants) => participants.clone(),
			Audience::Principals(list) => list.iter().cloned().collect(),
		}
	}

	pub fn kind(&self) -> &'static str {
		match self.payload {
			DeliveryPayload::Message(_) => "message",
			DeliveryPayload::Typing { .. } => "typing",
		}
	}
}

/// Inputs to the core, independent of the transport that produced them.
#[derive(Debug)]
pub enum CoreEvent {
	ConnectionOpened,
	Handshake {
		connection: Arc<Connection>,
		credential: Credential,
	},
	ConnectionClosed {
		connection: Arc<Connection>,
	},
	MessagePersisted {
		message: Message,
	},
}

/// Outcome of handling a `CoreEvent`.
#[derive(Debug)]
pub enum CoreReply {
	Opened {
		connection: Arc<Connection>,
		events: mpsc::Receiver<Arc<DeliveryEvent>>,
	},
	Bound(Result<Principal, ChatError>),
	Closed,
	Accepted,
}
