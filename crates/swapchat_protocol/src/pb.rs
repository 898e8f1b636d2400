#![forbid(unsafe_code)]

//! Wire messages (`swapchat.v1`).
//!
//! Hand-maintained prost definitions; field tags are part of the wire contract and
//! must never be reused.

/// Top-level message on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed by the server on the reply to a request.
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Handshake(super::Handshake),
		#[prost(message, tag = "11")]
		HandshakeOk(super::HandshakeOk),
		#[prost(message, tag = "12")]
		Error(super::Error),
		#[prost(message, tag = "13")]
		OpenConversation(super::OpenConversation),
		#[prost(message, tag = "14")]
		ConversationOpened(super::ConversationInfo),
		#[prost(message, tag = "15")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "16")]
		MessageSent(super::ChatMessage),
		#[prost(message, tag = "17")]
		FetchHistory(super::FetchHistory),
		#[prost(message, tag = "18")]
		History(super::History),
		#[prost(message, tag = "19")]
		ListConversations(super::ListConversations),
		#[prost(message, tag = "20")]
		Conversations(super::Conversations),
		#[prost(message, tag = "21")]
		Typing(super::Typing),
		#[prost(message, tag = "22")]
		Ack(super::Ack),
		#[prost(message, tag = "23")]
		Ping(super::Ping),
		#[prost(message, tag = "24")]
		Pong(super::Pong),
	}
}

/// First frame a client sends; binds the connection to a principal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
	#[prost(string, tag = "1")]
	pub token: String,
	#[prost(string, tag = "2")]
	pub client_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeOk {
	#[prost(string, tag = "1")]
	pub principal: String,
	#[prost(string, tag = "2")]
	pub server_instance_id: String,
	#[prost(uint32, tag = "3")]
	pub max_frame_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
}

/// Find or create the conversation between the caller and `peers`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenConversation {
	#[prost(string, repeated, tag = "1")]
	pub peers: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationInfo {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, repeated, tag = "2")]
	pub participants: Vec<String>,
	#[prost(string, tag = "3")]
	pub latest_message_id: String,
	#[prost(int64, tag = "4")]
	pub updated_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub conversation_id: String,
	#[prost(string, tag = "2")]
	pub content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub conversation_id: String,
	#[prost(string, tag = "3")]
	pub sender: String,
	#[prost(string, tag = "4")]
	pub content: String,
	#[prost(uint64, tag = "5")]
	pub seq: u64,
	#[prost(int64, tag = "6")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchHistory {
	#[prost(string, tag = "1")]
	pub conversation_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(string, tag = "1")]
	pub conversation_id: String,
	#[prost(message, repeated, tag = "2")]
	pub messages: Vec<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListConversations {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Conversations {
	#[prost(message, repeated, tag = "1")]
	pub conversations: Vec<ConversationInfo>,
}

/// Typing indicator, sent by clients on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Typing {
	#[prost(string, tag = "1")]
	pub conversation_id: String,
	#[prost(bool, tag = "2")]
	pub active: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// Frame on the server-initiated events stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub conversation_id: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event_envelope::Event", tags = "10, 11")]
	pub event: Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		MessageReceived(super::ChatMessage),
		#[prost(message, tag = "11")]
		Typing(super::TypingEvent),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypingEvent {
	#[prost(string, tag = "1")]
	pub sender: String,
	#[prost(bool, tag = "2")]
	pub active: bool,
}
