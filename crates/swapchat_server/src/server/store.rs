#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use swapchat_domain::{
	ChatError, Conversation, ConversationId, MIN_PARTICIPANTS, Message, MessageId, Principal, participant_key,
};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Durable record of conversations and their ordered messages.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
	/// Existing conversation for exactly this participant set, or a new one.
	async fn find_or_create_conversation(&self, participants: &BTreeSet<Principal>) -> Result<Conversation, ChatError>;

	async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, ChatError>;

	/// Persist a message; `sender` must be a participant.
	async fn append_message(
		&self,
		conversation_id: ConversationId,
		sender: &Principal,
		content: &str,
	) -> Result<Message, ChatError>;

	/// Messages ascending by `seq`.
	async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError>;

	/// Conversations of `principal`, most recently active first.
	async fn conversations_for(&self, principal: &Principal) -> Result<Vec<Conversation>, ChatError>;
}

pub(crate) fn check_participant_count(participants: &BTreeSet<Principal>) -> Result<(), ChatError> {
	if participants.len() < MIN_PARTICIPANTS {
		return Err(ChatError::InvalidRequest(format!(
			"a conversation needs at least {MIN_PARTICIPANTS} distinct participants"
		)));
	}
	Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
	inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
	conversations: HashMap<ConversationId, Conversation>,
	by_participants: HashMap<String, ConversationId>,
	messages: HashMap<ConversationId, Vec<Message>>,
}

impl InMemoryConversationStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
	async fn find_or_create_conversation(&self, participants: &BTreeSet<Principal>) -> Result<Conversation, ChatError> {
		check_participant_count(participants)?;

		let key = participant_key(participants);
		let mut state = self.inner.lock().await;

		if let Some(existing) = state
			.by_participants
			.get(&key)
			.and_then(|id| state.conversations.get(id))
		{
			return Ok(existing.clone());
		}

		let now = unix_ms_now();
		let conversation = Conversation {
			id: ConversationId::new_v4(),
			participants: participants.clone(),
			latest_message: None,
			created_at_unix_ms: now,
			updated_at_unix_ms: now,
		};

		state.by_participants.insert(key, conversation.id);
		state.conversations.insert(conversation.id, conversation.clone());
		Ok(conversation)
	}

	async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, ChatError> {
		Ok(self.inner.lock().await.conversations.get(&id).cloned())
	}

	async fn append_message(
		&self,
		conversation_id: ConversationId,
		sender: &Principal,
		content: &str,
	) -> Result<Message, ChatError> {
		let mut state = self.inner.lock().await;
		let MemoryState {
			conversations, messages, ..
		} = &mut *state;

		let conversation = conversations
			.get_mut(&conversation_id)
			.ok_or(ChatError::ConversationNotFound(conversation_id))?;

		if !conversation.is_participant(sender) {
			return Err(ChatError::NotParticipant {
				principal: sender.clone(),
				conversation: conversation_id,
			});
		}

		let log = messages.entry(conversation_id).or_default();
		let (seq, floor_ms) = log
			.last()
			.map(|m| (m.seq + 1, m.created_at_unix_ms))
			.unwrap_or((1, i64::MIN));

		let message = Message {
			id: MessageId::new_v4(),
			conversation_id,
			sender: sender.clone(),
			content: content.to_string(),
			seq,
			created_at_unix_ms: unix_ms_now().max(floor_ms),
		};
		log.push(message.clone());

		conversation.latest_message = Some(message.id);
		conversation.updated_at_unix_ms = message.created_at_unix_ms;

		Ok(message)
	}

	async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError> {
		let state = self.inner.lock().await;
		if !state.conversations.contains_key(&conversation_id) {
			return Err(ChatError::ConversationNotFound(conversation_id));
		}
		Ok(state.messages.get(&conversation_id).cloned().unwrap_or_default())
	}

	async fn conversations_for(&self, principal: &Principal) -> Result<Vec<Conversation>, ChatError> {
		let state = self.inner.lock().await;
		let mut out: Vec<Conversation> = state
			.conversations
			.values()
			.filter(|c| c.is_participant(principal))
			.cloned()
			.collect();
		out.sort_by(|a, b| b.updated_at_unix_ms.cmp(&a.updated_at_unix_ms));
		Ok(out)
	}
}
