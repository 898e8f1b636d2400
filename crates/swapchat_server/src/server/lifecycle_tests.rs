#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use swapchat_domain::{ChatError, SecretString};

use crate::server::lifecycle::{ConnState, ConnectionManager, Credential};
use crate::server::presence::PresenceRegistry;
use crate::server::test_support::{TokenTableResolver, manager, p, token};

#[tokio::test]
async fn handshake_binds_and_registers() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();
	assert_eq!(conn.state().await, ConnState::Unbound);

	let principal = mgr.handshake(&conn, token("alice")).await.expect("handshake");

	assert_eq!(principal, p("alice"));
	assert_eq!(conn.state().await, ConnState::Bound(p("alice")));
	assert_eq!(conn.principal().await, Some(p("alice")));
	assert_eq!(mgr.registry().owner_of(conn.id()).await, Some(p("alice")));
}

#[tokio::test]
async fn second_handshake_is_invalid_state() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();
	mgr.handshake(&conn, token("alice")).await.expect("first");

	let err = mgr.handshake(&conn, token("bob")).await.unwrap_err();
	assert_eq!(err.code(), "INVALID_STATE");
	assert_eq!(conn.principal().await, Some(p("alice")));
	assert!(mgr.registry().connections_for(&p("bob")).await.is_empty());
}

#[tokio::test]
async fn expired_credential_leaves_connection_unbound() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();

	let err = mgr
		.handshake(&conn, Credential::Token(SecretString::new("expired")))
		.await
		.unwrap_err();

	assert_eq!(err, ChatError::Authentication("token expired".to_string()));
	assert_eq!(conn.state().await, ConnState::Unbound);
	assert_eq!(mgr.registry().stats().await.connections, 0);

	// The client may retry with a fresh token on the same connection.
	mgr.handshake(&conn, token("alice")).await.expect("retry");
	assert_eq!(conn.principal().await, Some(p("alice")));
}

#[tokio::test]
async fn pre_resolved_principal_skips_the_resolver() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();

	let principal = mgr
		.handshake(&conn, Credential::Principal(p("carol")))
		.await
		.expect("handshake");
	assert_eq!(principal, p("carol"));
}

#[tokio::test]
async fn teardown_is_idempotent() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();
	mgr.handshake(&conn, token("alice")).await.expect("handshake");

	mgr.teardown(&conn).await;
	mgr.teardown(&conn).await;

	assert_eq!(conn.state().await, ConnState::Closed);
	assert!(!mgr.registry().is_online(&p("alice")).await);
}

#[tokio::test]
async fn closed_connection_cannot_be_bound() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();
	mgr.teardown(&conn).await;

	let err = mgr.handshake(&conn, token("alice")).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidState(_)));
	assert!(!mgr.registry().is_online(&p("alice")).await);
}

#[tokio::test]
async fn teardown_racing_a_handshake_never_leaves_a_registration() {
	let mgr = ConnectionManager::new(
		PresenceRegistry::new(),
		Arc::new(TokenTableResolver {
			delay: Some(Duration::from_millis(30)),
		}),
		8,
	);
	let (conn, _rx) = mgr.open();

	let handshake = {
		let mgr = mgr.clone();
		let conn = conn.clone();
		tokio::spawn(async move { mgr.handshake(&conn, token("alice")).await })
	};

	tokio::time::sleep(Duration::from_millis(5)).await;
	mgr.teardown(&conn).await;
	let _ = handshake.await.expect("join");

	assert_eq!(conn.state().await, ConnState::Closed);
	assert!(mgr.registry().connections_for(&p("alice")).await.is_empty());
}

#[tokio::test]
async fn connection_ids_are_unique() {
	let mgr = manager(8);
	let (a, _ra) = mgr.open();
	let (b, _rb) = mgr.open();
	assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn teardown_wakes_transport_waiting_on_closed() {
	let mgr = manager(8);
	let (conn, _rx) = mgr.open();
	mgr.handshake(&conn, token("alice")).await.expect("handshake");
	assert!(!conn.is_closed());

	let waiter = {
		let conn = conn.clone();
		tokio::spawn(async move { conn.closed().await })
	};
	tokio::time::sleep(Duration::from_millis(5)).await;
	mgr.teardown(&conn).await;

	tokio::time::timeout(Duration::from_millis(200), waiter)
		.await
		.expect("closed resolves after teardown")
		.expect("join");
	assert!(conn.is_closed());

	// Already torn down: resolves immediately.
	tokio::time::timeout(Duration::from_millis(50), conn.closed())
		.await
		.expect("closed stays resolved");
}

fn active_connections(rendered: &str) -> f64 {
	rendered
		.lines()
		.find_map(|line| line.strip_prefix("swapchat_active_connections "))
		.and_then(|v| v.trim().parse().ok())
		.unwrap_or(0.0)
}

#[test]
fn active_connection_gauge_survives_drop_without_teardown() {
	let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
	let handle = recorder.handle();

	metrics::with_local_recorder(&recorder, || {
		let mgr = manager(8);
		let (kept, _kept_rx) = mgr.open();
		let (abandoned, abandoned_rx) = mgr.open();
		assert_eq!(active_connections(&handle.render()), 2.0);

		drop(abandoned_rx);
		drop(abandoned);
		assert_eq!(active_connections(&handle.render()), 1.0);

		drop(kept);
		assert_eq!(active_connections(&handle.render()), 0.0);
	});
}
