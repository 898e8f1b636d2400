#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{Context, anyhow};
use swapchat_domain::{
	ChatError, Conversation, ConversationId, Message, MessageId, Principal, participant_key,
};
use tracing::info;

use crate::server::store::{ConversationStore, check_participant_count};
use crate::util::time::unix_ms_now;

/// (id, latest_message_id, created_at_ms, updated_at_ms)
type ConversationRow = (String, Option<String>, i64, i64);

/// (id, conversation_id, seq, sender, content, created_at_ms)
type MessageRow = (String, String, i64, String, String, i64);

/// Conversation store backed by sqlite or postgres.
#[derive(Clone)]
pub struct PersistentConversationStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

fn db(what: &'static str) -> impl Fn(sqlx::Error) -> ChatError {
	move |e| ChatError::Storage(format!("{what}: {e}"))
}

fn parse_conversation(row: ConversationRow, participants: Vec<(String,)>) -> Result<Conversation, ChatError> {
	let (id, latest, created_at_unix_ms, updated_at_unix_ms) = row;

	let participants = participants
		.into_iter()
		.map(|(p,)| Principal::new(p))
		.collect::<Result<BTreeSet<_>, _>>()
		.map_err(ChatError::storage)?;

	Ok(Conversation {
		id: id.parse().map_err(ChatError::storage)?,
		participants,
		latest_message: latest
			.map(|m| m.parse::<MessageId>())
			.transpose()
			.map_err(ChatError::storage)?,
		created_at_unix_ms,
		updated_at_unix_ms,
	})
}

fn parse_message(row: MessageRow) -> Result<Message, ChatError> {
	let (id, conversation_id, seq, sender, content, created_at_unix_ms) = row;
	Ok(Message {
		id: id.parse().map_err(ChatError::storage)?,
		conversation_id: conversation_id.parse().map_err(ChatError::storage)?,
		sender: Principal::new(sender).map_err(ChatError::storage)?,
		content,
		seq: seq as u64,
		created_at_unix_ms,
	})
}

/// Next message in a conversation whose log currently ends at (`max_seq`, `max_created`).
fn next_message(
	conversation_id: ConversationId,
	sender: &Principal,
	content: &str,
	max_seq: Option<i64>,
	max_created: Option<i64>,
) -> Message {
	Message {
		id: MessageId::new_v4(),
		conversation_id,
		sender: sender.clone(),
		content: content.to_string(),
		seq: max_seq.map(|s| s as u64 + 1).unwrap_or(1),
		created_at_unix_ms: unix_ms_now().max(max_created.unwrap_or(i64::MIN)),
	}
}

impl PersistentConversationStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			PersistentBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			PersistentBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"));
		};

		info!(
			backend = match backend {
				PersistentBackend::Sqlite(_) => "sqlite",
				PersistentBackend::Postgres(_) => "postgres",
			},
			"conversation store connected"
		);
		Ok(Self { backend })
	}

	async fn conversation_id_by_key(&self, key: &str) -> Result<Option<ConversationId>, ChatError> {
		let row: Option<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as("SELECT id FROM conversations WHERE participant_key = ?")
				.bind(key)
				.fetch_optional(pool)
				.await
				.map_err(db("select conversation by key (sqlite)"))?,
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id FROM conversations WHERE participant_key = $1")
					.bind(key)
					.fetch_optional(pool)
					.await
					.map_err(db("select conversation by key (postgres)"))?
			}
		};

		row.map(|(id,)| id.parse().map_err(ChatError::storage)).transpose()
	}

	async fn require_conversation(&self, id: ConversationId) -> Result<(), ChatError> {
		let id_str = id.to_string();
		let found = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as::<_, (i64,)>("SELECT 1 FROM conversations WHERE id = ?")
				.bind(&id_str)
				.fetch_optional(pool)
				.await
				.map_err(db("select conversation (sqlite)"))?
				.is_some(),
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as::<_, (i32,)>("SELECT 1 FROM conversations WHERE id = $1")
					.bind(&id_str)
					.fetch_optional(pool)
					.await
					.map_err(db("select conversation (postgres)"))?
					.is_some()
			}
		};

		if found { Ok(()) } else { Err(ChatError::ConversationNotFound(id)) }
	}
}

#[async_trait::async_trait]
impl ConversationStore for PersistentConversationStore {
	async fn find_or_create_conversation(&self, participants: &BTreeSet<Principal>) -> Result<Conversation, ChatError> {
		check_participant_count(participants)?;

		let key = participant_key(participants);
		if let Some(id) = self.conversation_id_by_key(&key).await?
			&& let Some(existing) = self.conversation(id).await?
		{
			return Ok(existing);
		}

		let id = ConversationId::new_v4().to_string();
		let now = unix_ms_now();

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(db("begin sqlite tx"))?;
				let inserted = sqlx::query(
					"INSERT INTO conversations (id, participant_key, latest_message_id, created_at_ms, updated_at_ms) \
					VALUES (?, ?, NULL, ?, ?) ON CONFLICT(participant_key) DO NOTHING",
				)
				.bind(&id)
				.bind(&key)
				.bind(now)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(db("insert conversation (sqlite)"))?
				.rows_affected();

				if inserted == 1 {
					for p in participants {
						sqlx::query("INSERT INTO conversation_participants (conversation_id, principal) VALUES (?, ?)")
							.bind(&id)
							.bind(p.as_str())
							.execute(&mut *tx)
							.await
							.map_err(db("insert participant (sqlite)"))?;
					}
				}
				tx.commit().await.map_err(db("commit sqlite tx"))?;
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(db("begin postgres tx"))?;
				let inserted = sqlx::query(
					"INSERT INTO conversations (id, participant_key, latest_message_id, created_at_ms, updated_at_ms) \
					VALUES ($1, $2, NULL, $3, $4) ON CONFLICT (participant_key) DO NOTHING",
				)
				.bind(&id)
				.bind(&key)
				.bind(now)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(db("insert conversation (postgres)"))?
				.rows_affected();

				if inserted == 1 {
					for p in participants {
						sqlx::query("INSERT INTO conversation_participants (conversation_id, principal) VALUES ($1, $2)")
							.bind(&id)
							.bind(p.as_str())
							.execute(&mut *tx)
							.await
							.map_err(db("insert participant (postgres)"))?;
					}
				}
				tx.commit().await.map_err(db("commit postgres tx"))?;
			}
		}

		// A concurrent creator may have won the insert; either way the key now resolves.
		let id = self
			.conversation_id_by_key(&key)
			.await?
			.ok_or_else(|| ChatError::Storage("conversation missing after insert".to_string()))?;
		self.conversation(id)
			.await?
			.ok_or_else(|| ChatError::Storage("conversation missing after insert".to_string()))
	}

	async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, ChatError> {
		let id_str = id.to_string();

		let (row, participants): (Option<ConversationRow>, Vec<(String,)>) = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let row = sqlx::query_as(
					"SELECT id, latest_message_id, created_at_ms, updated_at_ms FROM conversations WHERE id = ?",
				)
				.bind(&id_str)
				.fetch_optional(pool)
				.await
				.map_err(db("select conversation (sqlite)"))?;

				let participants = sqlx::query_as(
					"SELECT principal FROM conversation_participants WHERE conversation_id = ? ORDER BY principal",
				)
				.bind(&id_str)
				.fetch_all(pool)
				.await
				.map_err(db("select participants (sqlite)"))?;

				(row, participants)
			}
			PersistentBackend::Postgres(pool) => {
				let row = sqlx::query_as(
					"SELECT id, latest_message_id, created_at_ms, updated_at_ms FROM conversations WHERE id = $1",
				)
				.bind(&id_str)
				.fetch_optional(pool)
				.await
				.map_err(db("select conversation (postgres)"))?;

				let participants = sqlx::query_as(
					"SELECT principal FROM conversation_participants WHERE conversation_id = $1 ORDER BY principal",
				)
				.bind(&id_str)
				.fetch_all(pool)
				.await
				.map_err(db("select participants (postgres)"))?;

				(row, participants)
			}
		};

		row.map(|row| parse_conversation(row, participants)).transpose()
	}

	async fn append_message(
		&self,
		conversation_id: ConversationId,
		sender: &Principal,
		content: &str,
	) -> Result<Message, ChatError> {
		let id_str = conversation_id.to_string();
		let not_participant = || ChatError::NotParticipant {
			principal: sender.clone(),
			conversation: conversation_id,
		};

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(db("begin sqlite tx"))?;

				let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id = ?")
					.bind(&id_str)
					.fetch_optional(&mut *tx)
					.await
					.map_err(db("select conversation (sqlite)"))?;
				if found.is_none() {
					return Err(ChatError::ConversationNotFound(conversation_id));
				}

				let member: Option<(i64,)> =
					sqlx::query_as("SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND principal = ?")
						.bind(&id_str)
						.bind(sender.as_str())
						.fetch_optional(&mut *tx)
						.await
						.map_err(db("select participant (sqlite)"))?;
				if member.is_none() {
					return Err(not_participant());
				}

				let (max_seq, max_created): (Option<i64>, Option<i64>) =
					sqlx::query_as("SELECT MAX(seq), MAX(created_at_ms) FROM messages WHERE conversation_id = ?")
						.bind(&id_str)
						.fetch_one(&mut *tx)
						.await
						.map_err(db("select message tail (sqlite)"))?;

				let message = next_message(conversation_id, sender, content, max_seq, max_created);

				sqlx::query(
					"INSERT INTO messages (id, conversation_id, seq, sender, content, created_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(&id_str)
				.bind(message.seq as i64)
				.bind(sender.as_str())
				.bind(content)
				.bind(message.created_at_unix_ms)
				.execute(&mut *tx)
				.await
				.map_err(db("insert message (sqlite)"))?;

				sqlx::query("UPDATE conversations SET latest_message_id = ?, updated_at_ms = ? WHERE id = ?")
					.bind(message.id.to_string())
					.bind(message.created_at_unix_ms)
					.bind(&id_str)
					.execute(&mut *tx)
					.await
					.map_err(db("update conversation (sqlite)"))?;

				tx.commit().await.map_err(db("commit sqlite tx"))?;
				Ok(message)
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(db("begin postgres tx"))?;

				let found: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id = $1 FOR UPDATE")
					.bind(&id_str)
					.fetch_optional(&mut *tx)
					.await
					.map_err(db("select conversation (postgres)"))?;
				if found.is_none() {
					return Err(ChatError::ConversationNotFound(conversation_id));
				}

				let member: Option<(i32,)> = sqlx::query_as(
					"SELECT 1 FROM conversation_participants WHERE conversation_id = $1 AND principal = $2",
				)
				.bind(&id_str)
				.bind(sender.as_str())
				.fetch_optional(&mut *tx)
				.await
				.map_err(db("select participant (postgres)"))?;
				if member.is_none() {
					return Err(not_participant());
				}

				let (max_seq, max_created): (Option<i64>, Option<i64>) =
					sqlx::query_as("SELECT MAX(seq), MAX(created_at_ms) FROM messages WHERE conversation_id = $1")
						.bind(&id_str)
						.fetch_one(&mut *tx)
						.await
						.map_err(db("select message tail (postgres)"))?;

				let message = next_message(conversation_id, sender, content, max_seq, max_created);

				sqlx::query(
					"INSERT INTO messages (id, conversation_id, seq, sender, content, created_at_ms) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(message.id.to_string())
				.bind(&id_str)
				.bind(message.seq as i64)
				.bind(sender.as_str())
				.bind(content)
				.bind(message.created_at_unix_ms)
				.execute(&mut *tx)
				.await
				.map_err(db("insert message (postgres)"))?;

				sqlx::query("UPDATE conversations SET latest_message_id = $1, updated_at_ms = $2 WHERE id = $3")
					.bind(message.id.to_string())
					.bind(message.created_at_unix_ms)
					.bind(&id_str)
					.execute(&mut *tx)
					.await
					.map_err(db("update conversation (postgres)"))?;

				tx.commit().await.map_err(db("commit postgres tx"))?;
				Ok(message)
			}
		}
	}

	async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError> {
		self.require_conversation(conversation_id).await?;
		let id_str = conversation_id.to_string();

		let rows: Vec<MessageRow> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, conversation_id, seq, sender, content, created_at_ms FROM messages \
				WHERE conversation_id = ? ORDER BY seq ASC",
			)
			.bind(&id_str)
			.fetch_all(pool)
			.await
			.map_err(db("select messages (sqlite)"))?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, conversation_id, seq, sender, content, created_at_ms FROM messages \
				WHERE conversation_id = $1 ORDER BY seq ASC",
			)
			.bind(&id_str)
			.fetch_all(pool)
			.await
			.map_err(db("select messages (postgres)"))?,
		};

		rows.into_iter().map(parse_message).collect()
	}

	async fn conversations_for(&self, principal: &Principal) -> Result<Vec<Conversation>, ChatError> {
		let ids: Vec<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT c.id FROM conversations c \
				JOIN conversation_participants p ON p.conversation_id = c.id \
				WHERE p.principal = ? ORDER BY c.updated_at_ms DESC",
			)
			.bind(principal.as_str())
			.fetch_all(pool)
			.await
			.map_err(db("select conversations (sqlite)"))?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT c.id FROM conversations c \
				JOIN conversation_participants p ON p.conversation_id = c.id \
				WHERE p.principal = $1 ORDER BY c.updated_at_ms DESC",
			)
			.bind(principal.as_str())
			.fetch_all(pool)
			.await
			.map_err(db("select conversations (postgres)"))?,
		};

		let mut out = Vec::with_capacity(ids.len());
		for (id,) in ids {
			let id: ConversationId = id.parse().map_err(ChatError::storage)?;
			if let Some(conversation) = self.conversation(id).await? {
				out.push(conversation);
			}
		}
		Ok(out)
	}
}
