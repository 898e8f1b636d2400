#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authenticated identity of a user for the duration of a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
	/// Create a non-empty `Principal`. Surrounding whitespace is not part of the identity;
	/// control characters are rejected.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_control) {
			return Err(ParseIdError::InvalidFormat(format!("control character in principal {trimmed:?}")));
		}
		if trimmed.len() != id.len() {
			return Ok(Self(trimmed.to_string()));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Principal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Principal {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Principal::new(s.to_string())
	}
}

/// Store-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub uuid::Uuid);

impl ConversationId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(format!("conversation id: {e}")))
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim())
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(format!("message id: {e}")))
	}
}

/// A persisted set of participants exchanging messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
	pub id: ConversationId,
	pub participants: BTreeSet<Principal>,
	pub latest_message: Option<MessageId>,
	pub created_at_unix_ms: i64,
	pub updated_at_unix_ms: i64,
}

impl Conversation {
	pub fn is_participant(&self, principal: &Principal) -> bool {
		self.participants.contains(principal)
	}

	/// Participants other than `principal`.
	pub fn others<'a>(&'a self, principal: &'a Principal) -> impl Iterator<Item = &'a Principal> + 'a {
		self.participants.iter().filter(move |p| *p != principal)
	}
}

/// Minimum number of participants in a conversation.
pub const MIN_PARTICIPANTS: usize = 2;

/// Stable key identifying a participant set, used for lookup-before-create.
///
/// Each participant is written as `<byte len>:<name>` in set order, so distinct sets
/// never share a key whatever characters the names contain.
pub fn participant_key(participants: &BTreeSet<Principal>) -> String {
	let mut key = String::new();
	for p in participants {
		key.push_str(&p.as_str().len().to_string());
		key.push(':');
		key.push_str(p.as_str());
	}
	key
}

/// An immutable message owned by the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender: Principal,
	pub content: String,
	/// Per-conversation sequence number, starting at 1.
	pub seq: u64,
	pub created_at_unix_ms: i64,
}

/// Errors surfaced by the chat core and its collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("{principal} is not a participant of conversation {conversation}")]
	NotParticipant {
		principal: Principal,
		conversation: ConversationId,
	},

	#[error("conversation not found: {0}")]
	ConversationNotFound(ConversationId),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("storage error: {0}")]
	Storage(String),
}

impl ChatError {
	/// Stable wire code.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::Authentication(_) => "AUTHENTICATION",
			ChatError::InvalidState(_) => "INVALID_STATE",
			ChatError::NotParticipant { .. } => "NOT_PARTICIPANT",
			ChatError::ConversationNotFound(_) => "NOT_FOUND",
			ChatError::InvalidRequest(_) => "INVALID_REQUEST",
			ChatError::Storage(_) => "STORAGE",
		}
	}

	pub fn storage(err: impl fmt::Display) -> Self {
		ChatError::Storage(err.to_string())
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> Principal {
		Principal::new(s).expect("valid principal")
	}

	#[test]
	fn principal_rejects_blank_and_trims() {
		assert_eq!(Principal::new("   "), Err(ParseIdError::Empty));
		assert_eq!(p(" alice ").as_str(), "alice");
	}

	#[test]
	fn participant_key_ignores_insertion_order() {
		let a: BTreeSet<_> = [p("bob"), p("alice")].into_iter().collect();
		let b: BTreeSet<_> = [p("alice"), p("bob")].into_iter().collect();
		assert_eq!(participant_key(&a), participant_key(&b));
	}

	#[test]
	fn principal_rejects_control_characters() {
		assert!(matches!(Principal::new("a\u{1f}b"), Err(ParseIdError::InvalidFormat(_))));
		assert!(matches!(Principal::new("line\nbreak"), Err(ParseIdError::InvalidFormat(_))));
		assert!("a\u{0}".parse::<Principal>().is_err());
	}

	#[test]
	fn participant_key_separates_sets_whose_names_concatenate_alike() {
		let joined: BTreeSet<_> = [p("a:b"), p("m")].into_iter().collect();
		let split: BTreeSet<_> = [p("a"), p("b"), p("m")].into_iter().collect();
		let prefixed: BTreeSet<_> = [p("1:a"), p("m")].into_iter().collect();
		let plain: BTreeSet<_> = [p("a"), p("m")].into_iter().collect();

		assert_ne!(participant_key(&joined), participant_key(&split));
		assert_ne!(participant_key(&prefixed), participant_key(&plain));
		assert_eq!(participant_key(&plain), "1:a1:m");
	}

	#[test]
	fn others_excludes_the_given_principal() {
		let conv = Conversation {
			id: ConversationId::new_v4(),
			participants: [p("alice"), p("bob")].into_iter().collect(),
			latest_message: None,
			created_at_unix_ms: 0,
			updated_at_unix_ms: 0,
		};

		let alice = p("alice");
		let others: Vec<_> = conv.others(&alice).cloned().collect();
		assert_eq!(others, vec![p("bob")]);
	}

	#[test]
	fn conversation_id_parses_uuid_strings() {
		let id = ConversationId::new_v4();
		assert_eq!(id.to_string().parse::<ConversationId>(), Ok(id));
		assert!("not-a-uuid".parse::<ConversationId>().is_err());
	}

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
	}

	#[test]
	fn message_serializes_with_transparent_ids() {
		let msg = Message {
			id: MessageId::new_v4(),
			conversation_id: ConversationId::new_v4(),
			sender: p("alice"),
			content: "hi".to_string(),
			seq: 1,
			created_at_unix_ms: 10,
		};
		let json = serde_json::to_value(&msg).expect("serialize");
		assert_eq!(json["sender"], "alice");
		assert_eq!(json["conversation_id"], msg.conversation_id.to_string());
	}
}
