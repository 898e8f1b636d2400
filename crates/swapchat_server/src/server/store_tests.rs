#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use swapchat_domain::{ChatError, ConversationId};

use crate::server::store::{ConversationStore, InMemoryConversationStore};
use crate::server::store_sql::PersistentConversationStore;
use crate::server::test_support::p;

fn set(names: &[&str]) -> BTreeSet<swapchat_domain::Principal> {
	names.iter().map(|n| p(n)).collect()
}

async fn sqlite() -> PersistentConversationStore {
	PersistentConversationStore::connect("sqlite::memory:")
		.await
		.expect("connect sqlite")
}

async fn find_or_create_is_keyed_by_participant_set(store: &dyn ConversationStore) {
	let a = store
		.find_or_create_conversation(&set(&["alice", "bob"]))
		.await
		.expect("create");
	let b = store
		.find_or_create_conversation(&set(&["bob", "alice"]))
		.await
		.expect("find");
	assert_eq!(a.id, b.id);
	assert_eq!(a.participants, set(&["alice", "bob"]));
	assert!(a.latest_message.is_none());

	let err = store.find_or_create_conversation(&set(&["alice"])).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidRequest(_)));
}

async fn lookalike_participant_sets_stay_distinct(store: &dyn ConversationStore) {
	let joined = store
		.find_or_create_conversation(&set(&["a:b", "m"]))
		.await
		.expect("create joined");
	let split = store
		.find_or_create_conversation(&set(&["a", "b", "m"]))
		.await
		.expect("create split");
	let prefixed = store
		.find_or_create_conversation(&set(&["1:a", "m"]))
		.await
		.expect("create prefixed");
	let plain = store
		.find_or_create_conversation(&set(&["a", "m"]))
		.await
		.expect("create plain");

	assert_ne!(joined.id, split.id);
	assert_ne!(prefixed.id, plain.id);
	assert_eq!(split.participants, set(&["a", "b", "m"]));
	assert_eq!(plain.participants, set(&["a", "m"]));

	let again = store
		.find_or_create_conversation(&set(&["m", "a:b"]))
		.await
		.expect("find joined");
	assert_eq!(again.id, joined.id);
}

async fn appends_are_sequenced_and_tracked(store: &dyn ConversationStore) {
	let conv = store
		.find_or_create_conversation(&set(&["alice", "bob"]))
		.await
		.expect("create");

	let m1 = store.append_message(conv.id, &p("alice"), "one").await.expect("m1");
	let m2 = store.append_message(conv.id, &p("bob"), "two").await.expect("m2");
	assert_eq!((m1.seq, m2.seq), (1, 2));
	assert!(m2.created_at_unix_ms >= m1.created_at_unix_ms);

	let listed = store.list_messages(conv.id).await.expect("list");
	assert_eq!(
		listed.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
		vec!["one", "two"]
	);
	assert_eq!(listed[1], m2);

	let reloaded = store.conversation(conv.id).await.expect("load").expect("exists");
	assert_eq!(reloaded.latest_message, Some(m2.id));
	assert_eq!(reloaded.updated_at_unix_ms, m2.created_at_unix_ms);
}

async fn append_checks_conversation_and_sender(store: &dyn ConversationStore) {
	let missing = ConversationId::new_v4();
	let err = store.append_message(missing, &p("alice"), "x").await.unwrap_err();
	assert_eq!(err, ChatError::ConversationNotFound(missing));

	let conv = store
		.find_or_create_conversation(&set(&["alice", "bob"]))
		.await
		.expect("create");
	let err = store.append_message(conv.id, &p("mallory"), "x").await.unwrap_err();
	assert_eq!(err.code(), "NOT_PARTICIPANT");
	assert!(store.list_messages(conv.id).await.expect("list").is_empty());

	let err = store.list_messages(missing).await.unwrap_err();
	assert_eq!(err.code(), "NOT_FOUND");
}

async fn conversations_for_orders_by_activity(store: &dyn ConversationStore) {
	let older = store
		.find_or_create_conversation(&set(&["alice", "bob"]))
		.await
		.expect("create");
	tokio::time::sleep(Duration::from_millis(5)).await;
	let newer = store
		.find_or_create_conversation(&set(&["alice", "carol"]))
		.await
		.expect("create");

	let ids: Vec<_> = store
		.conversations_for(&p("alice"))
		.await
		.expect("list")
		.into_iter()
		.map(|c| c.id)
		.collect();
	assert_eq!(ids, vec![newer.id, older.id]);

	tokio::time::sleep(Duration::from_millis(5)).await;
	store.append_message(older.id, &p("bob"), "bump").await.expect("append");

	let ids: Vec<_> = store
		.conversations_for(&p("alice"))
		.await
		.expect("list")
		.into_iter()
		.map(|c| c.id)
		.collect();
	assert_eq!(ids, vec![older.id, newer.id]);

	assert!(store.conversations_for(&p("dave")).await.expect("list").is_empty());
}

#[tokio::test]
async fn memory_find_or_create() {
	find_or_create_is_keyed_by_participant_set(&InMemoryConversationStore::new()).await;
}

#[tokio::test]
async fn memory_lookalike_sets() {
	lookalike_participant_sets_stay_distinct(&InMemoryConversationStore::new()).await;
}

#[tokio::test]
async fn memory_appends() {
	appends_are_sequenced_and_tracked(&InMemoryConversationStore::new()).await;
}

#[tokio::test]
async fn memory_append_checks() {
	append_checks_conversation_and_sender(&InMemoryConversationStore::new()).await;
}

#[tokio::test]
async fn memory_conversations_for() {
	conversations_for_orders_by_activity(&InMemoryConversationStore::new()).await;
}

#[tokio::test]
async fn sqlite_find_or_create() {
	find_or_create_is_keyed_by_participant_set(&sqlite().await).await;
}

#[tokio::test]
async fn sqlite_lookalike_sets() {
	lookalike_participant_sets_stay_distinct(&sqlite().await).await;
}

#[tokio::test]
async fn sqlite_appends() {
	appends_are_sequenced_and_tracked(&sqlite().await).await;
}

#[tokio::test]
async fn sqlite_append_checks() {
	append_checks_conversation_and_sender(&sqlite().await).await;
}

#[tokio::test]
async fn sqlite_conversations_for() {
	conversations_for_orders_by_activity(&sqlite().await).await;
}

#[tokio::test]
async fn unsupported_database_url_is_rejected() {
	let err = PersistentConversationStore::connect("mysql://localhost/chat")
		.await
		.err()
		.expect("mysql is not supported");
	assert!(err.to_string().contains("unsupported database_url"));
}
