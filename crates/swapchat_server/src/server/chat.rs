#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use swapchat_domain::{ChatError, Conversation, ConversationId, Message, Principal};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::server::core::ChatCore;
use crate::server::lanes::lane_index;

const WRITE_STRIPES: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatConfig {
	/// Upper bound on message length, in characters, after trimming.
	pub max_message_chars: usize,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self { max_message_chars: 4000 }
	}
}

/// Request handlers for a bound principal.
///
/// Writes to one conversation are serialized from append through enqueue, so the
/// delivery order of a conversation matches its `seq` order.
#[derive(Clone)]
pub struct ChatService {
	core: ChatCore,
	write_stripes: Arc<[Mutex<()>]>,
	cfg: ChatConfig,
}

impl ChatService {
	pub fn new(core: ChatCore, cfg: ChatConfig) -> Self {
		Self {
			core,
			write_stripes: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
			cfg,
		}
	}

	pub fn core(&self) -> &ChatCore {
		&self.core
	}

	/// Find or create the conversation between `principal` and `peers`.
	pub async fn open_conversation(&self, principal: &Principal, peers: &[Principal]) -> Result<Conversation, ChatError> {
		let mut participants: BTreeSet<Principal> = peers.iter().cloned().collect();
		participants.insert(principal.clone());

		let conversation = self.core.store().find_or_create_conversation(&participants).await?;
		debug!(%principal, conversation = %conversation.id, "conversation opened");
		Ok(conversation)
	}

	/// Persist, then queue delivery. Nothing is routed unless the append succeeded.
	pub async fn send_message(
		&self,
		principal: &Principal,
		conversation_id: ConversationId,
		content: &str,
	) -> Result<Message, ChatError> {
		let content = content.trim();
		if content.is_empty() {
			return Err(ChatError::InvalidRequest("message content is empty".to_string()));
		}
		let chars = content.chars().count();
		if chars > self.cfg.max_message_chars {
			return Err(ChatError::InvalidRequest(format!(
				"message is {chars} characters; limit is {}",
				self.cfg.max_message_chars
			)));
		}

		let stripe = &self.write_stripes[lane_index(&conversation_id, self.write_stripes.len())];
		let _guard = stripe.lock().await;

		let message = self
			.core
			.store()
			.append_message(conversation_id, principal, content)
			.await?;
		self.core.on_message_persisted(message.clone()).await;

		metrics::counter!("swapchat_messages_persisted_total").increment(1);
		info!(%principal, conversation = %conversation_id, seq = message.seq, "message persisted");
		Ok(message)
	}

	/// Full history, for participants only.
	pub async fn history(&self, principal: &Principal, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError> {
		let conversation = self
			.core
			.store()
			.conversation(conversation_id)
			.await?
			.ok_or(ChatError::ConversationNotFound(conversation_id))?;

		if !conversation.is_participant(principal) {
			return Err(ChatError::NotParticipant {
				principal: principal.clone(),
				conversation: conversation_id,
			});
		}

		self.core.store().list_messages(conversation_id).await
	}

	pub async fn conversations(&self, principal: &Principal) -> Result<Vec<Conversation>, ChatError> {
		self.core.store().conversations_for(principal).await
	}

	pub async fn typing(&self, principal: &Principal, conversation_id: ConversationId, active: bool) -> Result<(), ChatError> {
		self.core.signal_typing(principal, conversation_id, active).await
	}
}
