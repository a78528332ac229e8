use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, SessionToken, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub user_name: String,
    pub email: String,
    pub pass_hash: String,
    pub profile_pic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub user_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "u.id, u.user_name, u.email, u.pass_hash, u.profile_pic";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
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

    /// Inserts a user. `None` means the email is already registered.
    pub async fn create_user(
        &self,
        user_name: &str,
        email: &str,
        pass_hash: &str,
    ) -> Result<Option<UserId>> {
        let inserted = sqlx::query(
            "INSERT INTO users (user_name, email, pass_hash, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_name)
        .bind(email)
        .bind(pass_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;
        match inserted {
            Ok(rec) => Ok(Some(UserId(rec.get::<i64, _>(0)))),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to insert user '{email}'")),
        }
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users u WHERE u.email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?"))
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn list_users(&self) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users u ORDER BY u.id ASC"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn update_password_hash(&self, user_id: UserId, pass_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET pass_hash = ? WHERE id = ?")
            .bind(pass_hash)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_profile_pic(&self, user_id: UserId, profile_pic: &str) -> Result<()> {
        sqlx::query("UPDATE users SET profile_pic = ? WHERE id = ?")
            .bind(profile_pic)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_session(&self, token: &SessionToken, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT INTO sessions (token, user_id, login_time) VALUES (?, ?, ?)")
            .bind(token.as_str())
            .bind(user_id.0)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    /// Resolves a session token to the user that owns it.
    pub async fn user_for_session(&self, token: &SessionToken) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS}
             FROM sessions s
             INNER JOIN users u ON u.id = s.user_id
             WHERE s.token = ?"
        ))
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn delete_session(&self, token: &SessionToken) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn delete_sessions_for_user(&self, user_id: UserId) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn insert_message(&self, sender_id: UserId, body: &str) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (sender_user_id, body, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(body)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        let user_name: String = sqlx::query_scalar("SELECT user_name FROM users WHERE id = ?")
            .bind(sender_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            user_name,
            body: body.to_string(),
            created_at,
        })
    }

    /// Messages in chronological order. With a limit, the most recent `limit` are returned.
    pub async fn list_messages(&self, limit: Option<u32>) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(limit) = limit {
            sqlx::query(
                "SELECT m.id, m.sender_user_id, u.user_name, m.body, m.created_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_user_id
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT m.id, m.sender_user_id, u.user_name, m.body, m.created_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_user_id
                 ORDER BY m.created_at DESC, m.id DESC",
            )
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                sender_id: UserId(r.get::<i64, _>(1)),
                user_name: r.get::<String, _>(2),
                body: r.get::<String, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }
}

fn user_from_row(r: &sqlx::sqlite::SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        user_name: r.get::<String, _>(1),
        email: r.get::<String, _>(2),
        pass_hash: r.get::<String, _>(3),
        profile_pic: r.get::<Option<String>, _>(4),
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
