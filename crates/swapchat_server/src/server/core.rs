#![forbid(unsafe_code)]

use std::sync::Arc;

use swapchat_domain::{ChatError, ConversationId, Message, Principal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::events::{CoreEvent, CoreReply, DeliveryEvent};
use crate::server::lanes::{DeliveryLanes, LanesConfig, spawn_delivery_lanes};
use crate::server::lifecycle::{Connection, ConnectionManager, Credential};
use crate::server::presence::PresenceRegistry;
use crate::server::router::{DeliveryRouter, RouterConfig};
use crate::server::session::SessionResolver;
use crate::server::store::ConversationStore;

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
	/// Per-connection outbound queue depth.
	pub connection_queue_capacity: usize,
	pub lanes: usize,
	pub lane_queue_capacity: usize,
	pub max_consecutive_drops: u32,
	pub debug_log_events: bool,
}

impl Default for DeliveryConfig {
	fn default() -> Self {
		let lanes = LanesConfig::default();
		let router = RouterConfig::default();
		Self {
			connection_queue_capacity: 256,
			lanes: lanes.lanes,
			lane_queue_capacity: lanes.lane_queue_capacity,
			max_consecutive_drops: router.max_consecutive_drops,
			debug_log_events: router.debug_log_events,
		}
	}
}

/// Entry point of the delivery core: lifecycle events in, routed deliveries out.
#[derive(Clone)]
pub struct ChatCore {
	registry: PresenceRegistry,
	lifecycle: ConnectionManager,
	router: DeliveryRouter,
	lanes: DeliveryLanes,
	store: Arc<dyn ConversationStore>,
}

impl ChatCore {
	/// Must be called inside a tokio runtime; spawns the delivery lanes.
	pub fn new(store: Arc<dyn ConversationStore>, resolver: Arc<dyn SessionResolver>, cfg: &DeliveryConfig) -> Self {
		let registry = PresenceRegistry::new();
		let lifecycle = ConnectionManager::new(registry.clone(), resolver, cfg.connection_queue_capacity);
		let router = DeliveryRouter::new(
			registry.clone(),
			lifecycle.clone(),
			RouterConfig {
				max_consecutive_drops: cfg.max_consecutive_drops,
				debug_log_events: cfg.debug_log_events,
			},
		);
		let lanes = spawn_delivery_lanes(
			router.clone(),
			&LanesConfig {
				lanes: cfg.lanes,
				lane_queue_capacity: cfg.lane_queue_capacity,
			},
		);

		Self {
			registry,
			lifecycle,
			router,
			lanes,
			store,
		}
	}

	pub fn on_connection_opened(&self) -> (Arc<Connection>, mpsc::Receiver<Arc<DeliveryEvent>>) {
		self.lifecycle.open()
	}

	pub async fn on_handshake(&self, conn: &Arc<Connection>, credential: Credential) -> Result<Principal, ChatError> {
		self.lifecycle.handshake(conn, credential).await
	}

	pub async fn on_connection_closed(&self, conn: &Connection) {
		self.lifecycle.teardown(conn).await;
	}

	/// Deliver a message that is already durable.
	///
	/// Returns once the message has been pushed to every connection that was live at
	/// routing time; calls made in persistence order are routed in that order.
	pub async fn on_message_persisted(&self, message: Message) {
		let conversation = match self.store.conversation(message.conversation_id).await {
			Ok(Some(c)) => c,
			Ok(None) => {
				warn!(conversation = %message.conversation_id, message = %message.id, "persisted message for unknown conversation; not routed");
				return;
			}
			Err(e) => {
				warn!(conversation = %message.conversation_id, error = %e, "conversation lookup failed; message not routed");
				return;
			}
		};

		debug!(conversation = %conversation.id, seq = message.seq, "queueing message delivery");
		let _ = self.lanes.enqueue(DeliveryEvent::message(&conversation, message)).await;
	}

	/// Ephemeral typing indicator to the other participants.
	pub async fn signal_typing(
		&self,
		sender: &Principal,
		conversation_id: ConversationId,
		active: bool,
	) -> Result<(), ChatError> {
		let conversation = self
			.store
			.conversation(conversation_id)
			.await?
			.ok_or(ChatError::ConversationNotFound(conversation_id))?;

		if !conversation.is_participant(sender) {
			return Err(ChatError::NotParticipant {
				principal: sender.clone(),
				conversation: conversation_id,
			});
		}

		let _ = self
			.lanes
			.enqueue(DeliveryEvent::typing(&conversation, sender.clone(), active))
			.await;
		Ok(())
	}

	/// Transport-agnostic dispatch over `CoreEvent`.
	pub async fn handle(&self, event: CoreEvent) -> CoreReply {
		match event {
			CoreEvent::ConnectionOpened => {
				let (connection, events) = self.on_connection_opened();
				CoreReply::Opened { connection, events }
			}
			CoreEvent::Handshake { connection, credential } => {
				CoreReply::Bound(self.on_handshake(&connection, credential).await)
			}
			CoreEvent::ConnectionClosed { connection } => {
				self.on_connection_closed(&connection).await;
				CoreReply::Closed
			}
			CoreEvent::MessagePersisted { message } => {
				self.on_message_persisted(message).await;
				CoreReply::Accepted
			}
		}
	}

	pub fn registry(&self) -> &PresenceRegistry {
		&self.registry
	}

	pub fn router(&self) -> &DeliveryRouter {
		&self.router
	}

	pub fn store(&self) -> &Arc<dyn ConversationStore> {
		&self.store
	}
}
