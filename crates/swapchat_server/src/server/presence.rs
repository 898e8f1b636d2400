#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use swapchat_domain::Principal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::server::lifecycle::{ConnId, Connection};

/// Principal -> live connections.
///
/// A connection is indexed under at most one principal; empty entries are removed.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<RwLock<Inner>>,
}

/// Point-in-time registry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStats {
	pub principals: usize,
	pub connections: usize,
}

#[derive(Debug, Default)]
struct Inner {
	entries: HashMap<Principal, HashMap<ConnId, Arc<Connection>>>,

	/// Reverse index so `unregister` never scans `entries`.
	owner_by_conn: HashMap<ConnId, Principal>,
}

impl Inner {
	fn remove_conn(&mut self, conn_id: ConnId) -> Option<Principal> {
		let principal = self.owner_by_conn.remove(&conn_id)?;

		if let Some(entry) = self.entries.get_mut(&principal) {
			entry.remove(&conn_id);
			if entry.is_empty() {
				self.entries.remove(&principal);
			}
		}

		Some(principal)
	}

	fn stats(&self) -> PresenceStats {
		PresenceStats {
			principals: self.entries.len(),
			connections: self.owner_by_conn.len(),
		}
	}
}

fn publish_gauges(stats: PresenceStats) {
	metrics::gauge!("swapchat_online_principals").set(stats.principals as f64);
	metrics::gauge!("swapchat_registered_connections").set(stats.connections as f64);
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add `conn` to the entry for `principal`. Registering twice is a no-op.
	pub async fn register(&self, principal: Principal, conn: Arc<Connection>) {
		let conn_id = conn.id();
		let mut inner = self.inner.write().await;

		if inner.owner_by_conn.get(&conn_id) != Some(&principal) {
			inner.remove_conn(conn_id);
			inner.owner_by_conn.insert(conn_id, principal.clone());
		}

		let entry = inner.entries.entry(principal.clone()).or_default();
		entry.insert(conn_id, conn);
		let devices = entry.len();

		let stats = inner.stats();
		drop(inner);

		publish_gauges(stats);
		debug!(%principal, conn_id = %conn_id, devices, "presence: registered");
	}

	/// Remove `conn` from whichever entry holds it. Returns the principal it was bound to.
	pub async fn unregister(&self, conn: &Connection) -> Option<Principal> {
		let conn_id = conn.id();
		let mut inner = self.inner.write().await;
		let removed = inner.remove_conn(conn_id);
		let stats = inner.stats();
		drop(inner);

		if let Some(principal) = &removed {
			publish_gauges(stats);
			debug!(%principal, conn_id = %conn_id, "presence: unregistered");
		}

		removed
	}

	/// Snapshot of the live connections for `principal` (possibly empty).
	pub async fn connections_for(&self, principal: &Principal) -> Vec<Arc<Connection>> {
		let inner = self.inner.read().await;
		inner
			.entries
			.get(principal)
			.map(|entry| entry.values().cloned().collect())
			.unwrap_or_default()
	}

	pub async fn is_online(&self, principal: &Principal) -> bool {
		self.inner.read().await.entries.contains_key(principal)
	}

	/// Principal currently owning `conn_id`, if registered.
	pub async fn owner_of(&self, conn_id: ConnId) -> Option<Principal> {
		self.inner.read().await.owner_by_conn.get(&conn_id).cloned()
	}

	pub async fn stats(&self) -> PresenceStats {
		self.inner.read().await.stats()
	}
}
