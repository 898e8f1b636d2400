#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use swapchat_domain::{ChatError, Principal, SecretString};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::events::DeliveryEvent;
use crate::server::presence::PresenceRegistry;
use crate::server::session::SessionResolver;

/// Server-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Binding state of a connection. `Closed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
	Unbound,
	Bound(Principal),
	Closed,
}

/// What a handshake presents.
#[derive(Debug, Clone)]
pub enum Credential {
	/// Raw token, resolved through the `SessionResolver`.
	Token(SecretString),
	/// Principal already resolved by the caller.
	Principal(Principal),
}

/// Result of a single non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
	Delivered,
	/// Outbound queue full; the event is dropped for this connection.
	Dropped,
	/// Outbound queue closed, or too many consecutive drops.
	Dead,
}

/// A live transport connection as seen by the delivery core.
///
/// The transport owns the receiving half of `outbox` and drains it onto the wire. It
/// must also watch [`Connection::closed`]: teardown can come from the core (dead or
/// slow consumer) and the transport is expected to hang up when it does.
#[derive(Debug)]
pub struct Connection {
	id: ConnId,
	outbox: mpsc::Sender<Arc<DeliveryEvent>>,
	state: Mutex<ConnState>,
	consecutive_drops: AtomicU32,
	closed: watch::Sender<bool>,
}

impl Drop for Connection {
	fn drop(&mut self) {
		if *self.state.get_mut() != ConnState::Closed {
			metrics::gauge!("swapchat_active_connections").decrement(1.0);
		}
	}
}

impl Connection {
	pub fn id(&self) -> ConnId {
		self.id
	}

	pub async fn state(&self) -> ConnState {
		self.state.lock().await.clone()
	}

	pub async fn principal(&self) -> Option<Principal> {
		match &*self.state.lock().await {
			ConnState::Bound(p) => Some(p.clone()),
			_ => None,
		}
	}

	/// Resolves once the connection has been torn down.
	pub async fn closed(&self) {
		let mut rx = self.closed.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	/// Enqueue without waiting. `max_consecutive_drops == 0` disables the slow-consumer cutoff.
	pub(crate) fn push(&self, event: Arc<DeliveryEvent>, max_consecutive_drops: u32) -> PushOutcome {
		match self.outbox.try_send(event) {
			Ok(()) => {
				self.consecutive_drops.store(0, Ordering::Relaxed);
				PushOutcome::Delivered
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed).saturating_add(1);
				if max_consecutive_drops > 0 && drops >= max_consecutive_drops {
					PushOutcome::Dead
				} else {
					PushOutcome::Dropped
				}
			}
			Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Dead,
		}
	}
}

/// Handshake and teardown for transport connections.
#[derive(Clone)]
pub struct ConnectionManager {
	registry: PresenceRegistry,
	resolver: Arc<dyn SessionResolver>,
	next_id: Arc<AtomicU64>,
	queue_capacity: usize,
}

impl fmt::Debug for ConnectionManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionManager")
			.field("queue_capacity", &self.queue_capacity)
			.finish_non_exhaustive()
	}
}

impl ConnectionManager {
	pub fn new(registry: PresenceRegistry, resolver: Arc<dyn SessionResolver>, queue_capacity: usize) -> Self {
		Self {
			registry,
			resolver,
			next_id: Arc::new(AtomicU64::new(1)),
			queue_capacity: queue_capacity.max(1),
		}
	}

	/// New `Unbound` connection plus the receiver the transport drains.
	pub fn open(&self) -> (Arc<Connection>, mpsc::Receiver<Arc<DeliveryEvent>>) {
		let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = mpsc::channel(self.queue_capacity);

		let conn = Arc::new(Connection {
			id,
			outbox: tx,
			state: Mutex::new(ConnState::Unbound),
			consecutive_drops: AtomicU32::new(0),
			closed: watch::Sender::new(false),
		});

		metrics::gauge!("swapchat_active_connections").increment(1.0);
		debug!(conn_id = %id, "connection opened");
		(conn, rx)
	}

	/// `Unbound -> Bound`. One handshake per connection lifetime.
	///
	/// The state lock is held across resolution and registration so a concurrent
	/// `teardown` either happens-before (handshake sees `Closed`) or waits.
	pub async fn handshake(&self, conn: &Arc<Connection>, credential: Credential) -> Result<Principal, ChatError> {
		let mut state = conn.state.lock().await;

		match &*state {
			ConnState::Unbound => {}
			ConnState::Bound(p) => {
				return Err(ChatError::InvalidState(format!(
					"connection {} already bound to {p}",
					conn.id
				)));
			}
			ConnState::Closed => {
				return Err(ChatError::InvalidState(format!("connection {} is closed", conn.id)));
			}
		}

		let principal = match credential {
			Credential::Principal(p) => p,
			Credential::Token(token) => match self.resolver.resolve(&token).await {
				Ok(p) => p,
				Err(e) => {
					metrics::counter!("swapchat_handshake_failures_total").increment(1);
					warn!(conn_id = %conn.id, error = %e, "handshake rejected");
					return Err(e);
				}
			},
		};

		*state = ConnState::Bound(principal.clone());
		self.registry.register(principal.clone(), Arc::clone(conn)).await;

		info!(conn_id = %conn.id, %principal, "handshake complete");
		Ok(principal)
	}

	/// `-> Closed`, unregister and signal [`Connection::closed`]. Idempotent.
	pub async fn teardown(&self, conn: &Connection) {
		let mut state = conn.state.lock().await;
		let prev = std::mem::replace(&mut *state, ConnState::Closed);

		match prev {
			ConnState::Closed => return,
			ConnState::Bound(principal) => {
				self.registry.unregister(conn).await;
				info!(conn_id = %conn.id, %principal, "connection closed");
			}
			ConnState::Unbound => {
				debug!(conn_id = %conn.id, "connection closed before handshake");
			}
		}

		conn.closed.send_replace(true);
		metrics::gauge!("swapchat_active_connections").decrement(1.0);
	}

	pub fn registry(&self) -> &PresenceRegistry {
		&self.registry
	}
}
