#![forbid(unsafe_code)]

use crate::server::presence::PresenceStats;
use crate::server::test_support::{manager, p};

#[tokio::test]
async fn registered_connection_is_visible_until_unregistered() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (conn, _rx) = mgr.open();

	registry.register(p("alice"), conn.clone()).await;
	let conns = registry.connections_for(&p("alice")).await;
	assert_eq!(conns.len(), 1);
	assert_eq!(conns[0].id(), conn.id());
	assert!(registry.is_online(&p("alice")).await);

	assert_eq!(registry.unregister(&conn).await, Some(p("alice")));
	assert!(registry.connections_for(&p("alice")).await.is_empty());
	assert!(!registry.is_online(&p("alice")).await);
	assert_eq!(registry.stats().await, PresenceStats::default());
}

#[tokio::test]
async fn registering_twice_does_not_duplicate() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (conn, _rx) = mgr.open();

	registry.register(p("alice"), conn.clone()).await;
	registry.register(p("alice"), conn.clone()).await;

	assert_eq!(registry.connections_for(&p("alice")).await.len(), 1);
	assert_eq!(
		registry.stats().await,
		PresenceStats {
			principals: 1,
			connections: 1
		}
	);
}

#[tokio::test]
async fn principal_keeps_remaining_devices_after_one_leaves() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (tab1, _rx1) = mgr.open();
	let (tab2, _rx2) = mgr.open();

	registry.register(p("alice"), tab1.clone()).await;
	registry.register(p("alice"), tab2.clone()).await;
	assert_eq!(registry.connections_for(&p("alice")).await.len(), 2);

	registry.unregister(&tab1).await;
	let left = registry.connections_for(&p("alice")).await;
	assert_eq!(left.len(), 1);
	assert_eq!(left[0].id(), tab2.id());
}

#[tokio::test]
async fn connection_is_indexed_under_one_principal_only() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (conn, _rx) = mgr.open();

	registry.register(p("alice"), conn.clone()).await;
	registry.register(p("bob"), conn.clone()).await;

	assert!(registry.connections_for(&p("alice")).await.is_empty());
	assert_eq!(registry.connections_for(&p("bob")).await.len(), 1);
	assert_eq!(registry.owner_of(conn.id()).await, Some(p("bob")));
}

#[tokio::test]
async fn unregistering_unknown_connection_is_a_no_op() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (known, _rx1) = mgr.open();
	let (stranger, _rx2) = mgr.open();

	registry.register(p("alice"), known).await;
	assert_eq!(registry.unregister(&stranger).await, None);
	assert_eq!(registry.connections_for(&p("alice")).await.len(), 1);
}

#[tokio::test]
async fn snapshot_is_unaffected_by_later_changes() {
	let mgr = manager(8);
	let registry = mgr.registry().clone();
	let (conn, _rx) = mgr.open();
	registry.register(p("alice"), conn.clone()).await;

	let snapshot = registry.connections_for(&p("alice")).await;
	registry.unregister(&conn).await;

	assert_eq!(snapshot.len(), 1);
	assert!(registry.connections_for(&p("alice")).await.is_empty());
}
