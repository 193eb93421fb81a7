use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{ChannelId, ChannelSeq, MessageId, ServerId, UserId};

pub const DEFAULT_CHANNEL_NAME: &str = "general";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub password_hash: String,
    pub password_salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredServer {
    pub server_id: ServerId,
    pub name: String,
    pub owner_id: UserId,
    pub invite_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChannel {
    pub channel_id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub position: i64,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub seq: ChannelSeq,
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameUpdate {
    Updated,
    Taken,
    UnknownUser,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens a separate database, so
        // the in-memory pool is pinned to one long-lived connection.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns `None` when the username is already registered.
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "INSERT INTO users (username, password_hash, password_salt) VALUES (?, ?, ?)
             ON CONFLICT(username) DO NOTHING
             RETURNING id",
        )
        .bind(username)
        .bind(password_hash)
        .bind(password_salt)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, password_salt FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, password_salt FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn update_username(&self, user_id: UserId, username: &str) -> Result<UsernameUpdate> {
        let result = sqlx::query("UPDATE users SET username = ? WHERE id = ?")
            .bind(username)
            .bind(user_id.0)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(UsernameUpdate::UnknownUser),
            Ok(_) => Ok(UsernameUpdate::Updated),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(UsernameUpdate::Taken)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Creates the server, makes the owner its first member and adds the
    /// default text channel, all in one transaction.
    pub async fn create_server(&self, name: &str, owner_id: UserId) -> Result<StoredServer> {
        let invite_code = Uuid::new_v4().simple().to_string();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO servers (name, owner_user_id, invite_code) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(owner_id.0)
        .bind(&invite_code)
        .fetch_one(&mut *tx)
        .await?;
        let server_id = ServerId(row.get::<i64, _>(0));

        sqlx::query("INSERT INTO memberships (server_id, user_id) VALUES (?, ?)")
            .bind(server_id.0)
            .bind(owner_id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO channels (server_id, name, position) VALUES (?, ?, 0)")
            .bind(server_id.0)
            .bind(DEFAULT_CHANNEL_NAME)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(StoredServer {
            server_id,
            name: name.to_string(),
            owner_id,
            invite_code,
        })
    }

    pub async fn server_by_id(&self, server_id: ServerId) -> Result<Option<StoredServer>> {
        let row = sqlx::query(
            "SELECT id, name, owner_user_id, invite_code FROM servers WHERE id = ?",
        )
        .bind(server_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(server_from_row))
    }

    pub async fn server_by_invite(&self, invite_code: &str) -> Result<Option<StoredServer>> {
        let row = sqlx::query(
            "SELECT id, name, owner_user_id, invite_code FROM servers WHERE invite_code = ?",
        )
        .bind(invite_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(server_from_row))
    }

    pub async fn list_servers_for_user(&self, user_id: UserId) -> Result<Vec<StoredServer>> {
        let rows = sqlx::query(
            "SELECT s.id, s.name, s.owner_user_id, s.invite_code
             FROM servers s
             INNER JOIN memberships m ON m.server_id = s.id
             WHERE m.user_id = ?
             ORDER BY s.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(server_from_row).collect())
    }

    pub async fn list_all_servers(&self) -> Result<Vec<StoredServer>> {
        let rows = sqlx::query(
            "SELECT id, name, owner_user_id, invite_code FROM servers ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(server_from_row).collect())
    }

    /// Deletes the server together with its memberships, channels and messages.
    pub async fn delete_server(&self, server_id: ServerId) -> Result<bool> {
        let done = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(server_id.0)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Returns `true` when a new membership row was written; joining twice is
    /// a no-op.
    pub async fn add_membership(&self, server_id: ServerId, user_id: UserId) -> Result<bool> {
        let done = sqlx::query(
            "INSERT INTO memberships (server_id, user_id) VALUES (?, ?)
             ON CONFLICT(server_id, user_id) DO NOTHING",
        )
        .bind(server_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn is_member(&self, server_id: ServerId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM memberships WHERE server_id = ? AND user_id = ?")
            .bind(server_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn member_ids(&self, server_id: ServerId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM memberships WHERE server_id = ? ORDER BY user_id ASC",
        )
        .bind(server_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn create_channel(&self, server_id: ServerId, name: &str) -> Result<StoredChannel> {
        let row = sqlx::query(
            "INSERT INTO channels (server_id, name, position)
             VALUES (?, ?, (SELECT COALESCE(MAX(position), -1) + 1 FROM channels WHERE server_id = ?))
             RETURNING id, position",
        )
        .bind(server_id.0)
        .bind(name)
        .bind(server_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredChannel {
            channel_id: ChannelId(row.get::<i64, _>(0)),
            server_id,
            name: name.to_string(),
            position: row.get::<i64, _>(1),
        })
    }

    pub async fn list_channels_for_server(&self, server_id: ServerId) -> Result<Vec<StoredChannel>> {
        let rows = sqlx::query(
            "SELECT id, server_id, name, position FROM channels
             WHERE server_id = ?
             ORDER BY position ASC, id ASC",
        )
        .bind(server_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(channel_from_row).collect())
    }

    pub async fn channel_by_id(&self, channel_id: ChannelId) -> Result<Option<StoredChannel>> {
        let row = sqlx::query("SELECT id, server_id, name, position FROM channels WHERE id = ?")
            .bind(channel_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(channel_from_row))
    }

    /// Appends a message to the channel log. The channel sequence number is
    /// assigned inside the insert statement, so it is contiguous per channel.
    pub async fn insert_message(
        &self,
        channel_id: ChannelId,
        sender_id: UserId,
        content: &str,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let row = sqlx::query(
            "INSERT INTO messages (channel_id, seq, sender_user_id, content, created_at)
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE channel_id = ?), ?, ?, ?)
             RETURNING id, seq",
        )
        .bind(channel_id.0)
        .bind(channel_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to append message to channel {}", channel_id.0))?;

        let sender_username = self
            .user_by_id(sender_id)
            .await?
            .map(|user| user.username)
            .unwrap_or_default();

        Ok(StoredMessage {
            message_id: MessageId(row.get::<i64, _>(0)),
            channel_id,
            seq: row.get::<i64, _>(1),
            sender_id,
            sender_username,
            content: content.to_string(),
            created_at,
        })
    }

    /// Newest-first page of the channel log. `before` is an exclusive upper
    /// bound on `seq` for paging further back.
    pub async fn list_channel_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<ChannelSeq>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(before_seq) = before {
            sqlx::query(
                "SELECT m.id, m.channel_id, m.seq, m.sender_user_id, u.username, m.content, m.created_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_user_id
                 WHERE m.channel_id = ? AND m.seq < ?
                 ORDER BY m.seq DESC
                 LIMIT ?",
            )
            .bind(channel_id.0)
            .bind(before_seq)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT m.id, m.channel_id, m.seq, m.sender_user_id, u.username, m.content, m.created_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_user_id
                 WHERE m.channel_id = ?
                 ORDER BY m.seq DESC
                 LIMIT ?",
            )
            .bind(channel_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                channel_id: ChannelId(r.get::<i64, _>(1)),
                seq: r.get::<i64, _>(2),
                sender_id: UserId(r.get::<i64, _>(3)),
                sender_username: r.get::<String, _>(4),
                content: r.get::<String, _>(5),
                created_at: r.get::<DateTime<Utc>, _>(6),
            })
            .collect())
    }
}

fn user_from_row(r: SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        password_hash: r.get::<String, _>(2),
        password_salt: r.get::<String, _>(3),
    }
}

fn server_from_row(r: SqliteRow) -> StoredServer {
    StoredServer {
        server_id: ServerId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        owner_id: UserId(r.get::<i64, _>(2)),
        invite_code: r.get::<String, _>(3),
    }
}

fn channel_from_row(r: SqliteRow) -> StoredChannel {
    StoredChannel {
        channel_id: ChannelId(r.get::<i64, _>(0)),
        server_id: ServerId(r.get::<i64, _>(1)),
        name: r.get::<String, _>(2),
        position: r.get::<i64, _>(3),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
