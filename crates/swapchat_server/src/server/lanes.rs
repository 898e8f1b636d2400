#![forbid(unsafe_code)]

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use swapchat_domain::ConversationId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::events::DeliveryEvent;
use crate::server::router::{DeliveryRouter, RouteReport};

/// Settings for the delivery lanes.
#[derive(Debug, Clone)]
pub struct LanesConfig {
	pub lanes: usize,
	pub lane_queue_capacity: usize,
}

impl Default for LanesConfig {
	fn default() -> Self {
		Self {
			lanes: 8,
			lane_queue_capacity: 1024,
		}
	}
}

/// Stable lane index for a conversation.
pub fn lane_index(conversation_id: &ConversationId, lanes: usize) -> usize {
	let mut hasher = DefaultHasher::new();
	conversation_id.hash(&mut hasher);
	(hasher.finish() % lanes.max(1) as u64) as usize
}

type LaneItem = (DeliveryEvent, oneshot::Sender<RouteReport>);

/// FIFO worker lanes in front of the router.
///
/// Every event of a conversation goes to the same lane, so a per-conversation input
/// order is the routing order; distinct conversations are routed in parallel.
#[derive(Debug, Clone)]
pub struct DeliveryLanes {
	senders: Arc<[mpsc::Sender<LaneItem>]>,
}

impl DeliveryLanes {
	pub fn lane_count(&self) -> usize {
		self.senders.len()
	}

	/// Route `event` on its conversation lane and wait until the lane has pushed it.
	///
	/// Returns `None` if the lane is gone. Once this returns, every recipient connection
	/// that was live at routing time holds the event; connections bound later never see it.
	pub async fn enqueue(&self, event: DeliveryEvent) -> Option<RouteReport> {
		let idx = lane_index(&event.conversation_id, self.senders.len());
		let (done_tx, done_rx) = oneshot::channel();
		if let Err(e) = self.senders[idx].send((event, done_tx)).await {
			warn!(lane = idx, conversation = %(e.0).0.conversation_id, "delivery lane closed; event dropped");
			return None;
		}
		match done_rx.await {
			Ok(report) => Some(report),
			Err(_) => {
				warn!(lane = idx, "delivery lane stopped before routing");
				None
			}
		}
	}
}

/// Spawn `cfg.lanes` routing tasks.
pub fn spawn_delivery_lanes(router: DeliveryRouter, cfg: &LanesConfig) -> DeliveryLanes {
	let lanes = cfg.lanes.max(1);
	let mut senders = Vec::with_capacity(lanes);

	for idx in 0..lanes {
		let (tx, rx) = mpsc::channel(cfg.lane_queue_capacity.max(1));
		senders.push(tx);
		tokio::spawn(run_lane(idx, router.clone(), rx));
	}

	info!(lanes, "delivery lanes started");
	DeliveryLanes {
		senders: senders.into(),
	}
}

async fn run_lane(idx: usize, router: DeliveryRouter, mut rx: mpsc::Receiver<LaneItem>) {
	while let Some((event, done)) = rx.recv().await {
		let report = router.route(event).await;
		if report.offline > 0 {
			debug!(lane = idx, offline = report.offline, "recipients offline; history fetch will catch up");
		}
		let _ = done.send(report);
	}
	debug!(lane = idx, "delivery lane exiting");
}
