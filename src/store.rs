//! SQL access for users, sessions and bookmark rows.
//!
//! Ids and `created_at` are assigned by the database defaults, never by the
//! caller. Every bookmark query is scoped by owner.

use anyhow::Result;
use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::auth;
use crate::model::{Bookmark, NewBookmark, Provider, UpdateBookmark, User};

const BOOKMARK_COLUMNS: &str = "id, title, url, user_id, created_at";
const USER_COLUMNS: &str = "id, provider, subject, created_at";

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow::anyhow!("invalid timestamp {value}: {e}"))?
        .with_timezone(&Utc))
}

pub struct BookmarkStore<'a> {
    conn: &'a Connection,
}

impl<'a> BookmarkStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------------
    // Users & sessions
    // ------------------------------------------------------------------------

    pub async fn find_or_create_user(&self, provider: Provider, subject: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO users (provider, subject) VALUES (?, ?)",
                libsql::params![provider.as_str(), subject],
            )
            .await?;

        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE provider = ? AND subject = ?");
        let mut rows = self
            .conn
            .query(&query, libsql::params![provider.as_str(), subject])
            .await?;

        if let Some(row) = rows.next().await? {
            self.row_to_user(&row)
        } else {
            anyhow::bail!("Failed to find or create user {}:{}", provider.as_str(), subject)
        }
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let mut rows = self.conn.query(&query, libsql::params![id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(self.row_to_user(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Opens a session and returns its bearer token. Only the token hash is
    /// stored.
    pub async fn create_session(&self, user_id: &str) -> Result<String> {
        let mut rows = self.conn.query("SELECT lower(hex(randomblob(32)))", ()).await?;
        let token: String = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => anyhow::bail!("Failed to generate session token"),
        };

        self.conn
            .execute(
                "INSERT INTO sessions (token_hash, user_id) VALUES (?, ?)",
                libsql::params![auth::hash_token(&token), user_id],
            )
            .await?;

        Ok(token)
    }

    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let query = r#"
            SELECT users.id, users.provider, users.subject, users.created_at
            FROM sessions
            JOIN users ON users.id = sessions.user_id
            WHERE sessions.token_hash = ?
        "#;
        let mut rows = self
            .conn
            .query(query, libsql::params![auth::hash_token(token)])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(self.row_to_user(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn delete_session(&self, token: &str) -> Result<bool> {
        let result = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE token_hash = ?",
                libsql::params![auth::hash_token(token)],
            )
            .await?;
        Ok(result > 0)
    }

    /// Records a pending OAuth sign-in and returns its `state` value.
    pub async fn create_oauth_state(&self, provider: Provider) -> Result<String> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO oauth_states (provider) VALUES (?) RETURNING state",
                libsql::params![provider.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => anyhow::bail!("Failed to create oauth state"),
        }
    }

    /// Consumes a pending sign-in. Each state is accepted once, and only
    /// within `max_age_minutes` of being issued.
    pub async fn take_oauth_state(&self, state: &str, max_age_minutes: u32) -> Result<Option<Provider>> {
        let cutoff = format!("-{max_age_minutes} minutes");
        let mut rows = self
            .conn
            .query(
                r#"
                DELETE FROM oauth_states
                WHERE state = ? AND created_at > strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?)
                RETURNING provider
                "#,
                libsql::params![state, cutoff],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let provider: String = row.get(0)?;
        Provider::from_str(&provider)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("Invalid provider: {}", provider))
    }

    fn row_to_user(&self, row: &libsql::Row) -> Result<User> {
        let provider_str: String = row.get(1)?;
        let provider = Provider::from_str(&provider_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid provider: {}", provider_str))?;
        let created_at: String = row.get(3)?;

        Ok(User {
            id: row.get(0)?,
            provider,
            subject: row.get(2)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    // ------------------------------------------------------------------------
    // Bookmarks
    // ------------------------------------------------------------------------

    pub async fn list_bookmarks(&self, owner: &str) -> Result<Vec<Bookmark>> {
        let query = format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        );
        let mut rows = self.conn.query(&query, libsql::params![owner]).await?;
        let mut bookmarks = Vec::new();

        while let Some(row) = rows.next().await? {
            bookmarks.push(self.row_to_bookmark(&row)?);
        }

        Ok(bookmarks)
    }

    pub async fn get_bookmark(&self, id: &str, owner: &str) -> Result<Option<Bookmark>> {
        let query = format!("SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE id = ? AND user_id = ?");
        let mut rows = self.conn.query(&query, libsql::params![id, owner]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(self.row_to_bookmark(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn create_bookmark(&self, owner: &str, input: NewBookmark) -> Result<Bookmark> {
        let query = format!(
            "INSERT INTO bookmarks (title, url, user_id) VALUES (?, ?, ?) RETURNING {BOOKMARK_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(&query, libsql::params![input.title, input.url, owner])
            .await?;

        if let Some(row) = rows.next().await? {
            self.row_to_bookmark(&row)
        } else {
            anyhow::bail!("Failed to create bookmark")
        }
    }

    pub async fn update_bookmark(
        &self,
        id: &str,
        owner: &str,
        input: UpdateBookmark,
    ) -> Result<Option<Bookmark>> {
        let query = format!(
            "UPDATE bookmarks SET title = ?, url = ? WHERE id = ? AND user_id = ? RETURNING {BOOKMARK_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(&query, libsql::params![input.title, input.url, id, owner])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(self.row_to_bookmark(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn delete_bookmark(&self, id: &str, owner: &str) -> Result<bool> {
        let result = self
            .conn
            .execute(
                "DELETE FROM bookmarks WHERE id = ? AND user_id = ?",
                libsql::params![id, owner],
            )
            .await?;
        Ok(result > 0)
    }

    fn row_to_bookmark(&self, row: &libsql::Row) -> Result<Bookmark> {
        let created_at: String = row.get(4)?;

        Ok(Bookmark {
            id: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
            user_id: row.get(3)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}
