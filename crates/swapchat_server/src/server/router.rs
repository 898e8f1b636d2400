#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, warn};

use crate::server::events::DeliveryEvent;
use crate::server::lifecycle::{ConnectionManager, PushOutcome};
use crate::server::presence::PresenceRegistry;

/// Settings for the delivery router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Consecutive full-queue drops after which a connection is treated as dead (0 = never).
	pub max_consecutive_drops: u32,

	pub debug_log_events: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			max_consecutive_drops: 64,
			debug_log_events: false,
		}
	}
}

/// Per-call fan-out summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
	pub recipients: usize,
	/// Recipients with no live connection.
	pub offline: usize,
	pub delivered: usize,
	pub dropped: usize,
	pub dead: usize,
}

/// Fans a delivery event out to every live connection of its recipients.
#[derive(Debug, Clone)]
pub struct DeliveryRouter {
	registry: PresenceRegistry,
	lifecycle: ConnectionManager,
	cfg: RouterConfig,
}

impl DeliveryRouter {
	pub fn new(registry: PresenceRegistry, lifecycle: ConnectionManager, cfg: RouterConfig) -> Self {
		Self {
			registry,
			lifecycle,
			cfg,
		}
	}

	/// Best-effort, at-most-once push. Never fails; failures stay per connection.
	///
	/// Connection sets are snapshotted and the registry lock is released before any push.
	pub async fn route(&self, event: DeliveryEvent) -> RouteReport {
		let event = Arc::new(event);
		let recipients = event.recipients();

		let mut report = RouteReport {
			recipients: recipients.len(),
			..RouteReport::default()
		};
		let mut dead = Vec::new();

		for principal in &recipients {
			let conns = self.registry.connections_for(principal).await;
			if conns.is_empty() {
				report.offline += 1;
				continue;
			}

			for conn in conns {
				match conn.push(Arc::clone(&event), self.cfg.max_consecutive_drops) {
					PushOutcome::Delivered => report.delivered += 1,
					PushOutcome::Dropped => {
						report.dropped += 1;
						warn!(
							%principal,
							conn_id = %conn.id(),
							conversation = %event.conversation_id,
							"delivery dropped (connection queue full)"
						);
					}
					PushOutcome::Dead => {
						report.dead += 1;
						dead.push(conn);
					}
				}
			}
		}

		for conn in dead {
			warn!(conn_id = %conn.id(), "tearing down dead connection");
			self.lifecycle.teardown(&conn).await;
		}

		metrics::counter!("swapchat_deliveries_total", "kind" => event.kind()).increment(report.delivered as u64);
		if report.dropped > 0 {
			metrics::counter!("swapchat_delivery_drops_total").increment(report.dropped as u64);
		}
		if report.dead > 0 {
			metrics::counter!("swapchat_dead_connections_total").increment(report.dead as u64);
		}

		if self.cfg.debug_log_events {
			debug!(
				conversation = %event.conversation_id,
				kind = event.kind(),
				recipients = report.recipients,
				offline = report.offline,
				delivered = report.delivered,
				"routed delivery event"
			);
		}

		report
	}
}
