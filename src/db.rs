use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, Row};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub conversation_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub client_message_id: String,
    pub seq: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by_token_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEventRecord {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub conversation_id: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub event_type: String,
    pub conversation_id: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

// Timestamps persist as unix milliseconds; the Any driver has no
// datetime support across both engines.
pub fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or_else(Utc::now)
}

fn opt_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(i64_to_datetime)
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let outbox_id_column = match kind {
        DbKind::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        DbKind::Postgres => "BIGSERIAL PRIMARY KEY",
    };

    let outbox_table = format!(
        r#"CREATE TABLE IF NOT EXISTS realtime_outbox_events (
            id {outbox_id_column},
            event_id TEXT NOT NULL UNIQUE,
            event_type TEXT NOT NULL,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            published_at INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT
        )"#
    );

    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS refresh_tokens (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token_hash TEXT NOT NULL UNIQUE,
            issued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            revoked_at INTEGER,
            replaced_by_token_id TEXT
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id)"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL DEFAULT 'direct',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_message_preview TEXT,
            last_message_at INTEGER
        )"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_members (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            joined_at INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            PRIMARY KEY (conversation_id, user_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id)"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_counters (
            conversation_id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
            next_seq INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            client_message_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (sender_id, client_message_id),
            UNIQUE (conversation_id, seq)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation_created ON messages(conversation_id, created_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    let sql = rewrite_sql(&outbox_table, kind);
    sqlx::query(sql.as_ref()).execute(pool).await?;

    let outbox_index = rewrite_sql(
        r#"CREATE INDEX IF NOT EXISTS idx_outbox_pending ON realtime_outbox_events(published_at, next_attempt_at)"#,
        kind,
    );
    sqlx::query(outbox_index.as_ref()).execute(pool).await?;

    Ok(())
}

fn user_from_row(row: &AnyRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        password_hash: row.try_get("password_hash")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

fn conversation_from_row(row: &AnyRow) -> Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        kind: row.try_get("type")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
        last_message_preview: row.try_get("last_message_preview")?,
        last_message_at: opt_datetime(row.try_get("last_message_at")?),
    })
}

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        client_message_id: row.try_get("client_message_id")?,
        seq: row.try_get("seq")?,
        content: row.try_get("content")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
    })
}

fn refresh_token_from_row(row: &AnyRow) -> Result<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        issued_at: i64_to_datetime(row.try_get("issued_at")?),
        expires_at: i64_to_datetime(row.try_get("expires_at")?),
        revoked_at: opt_datetime(row.try_get("revoked_at")?),
        replaced_by_token_id: row.try_get("replaced_by_token_id")?,
    })
}

fn outbox_from_row(row: &AnyRow) -> Result<OutboxEventRecord> {
    Ok(OutboxEventRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        conversation_id: row.try_get("conversation_id")?,
        payload_json: row.try_get("payload_json")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        published_at: opt_datetime(row.try_get("published_at")?),
        attempts: row.try_get::<i64, _>("attempts")? as i32,
        next_attempt_at: i64_to_datetime(row.try_get("next_attempt_at")?),
        last_error: row.try_get("last_error")?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

// --- users ---

pub async fn insert_user(conn: &mut AnyConnection, kind: DbKind, record: &UserRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO users (id, username, display_name, password_hash, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.username)
        .bind(&record.display_name)
        .bind(&record.password_hash)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_user(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<UserRecord>> {
    let sql = rewrite_sql(
        "SELECT id, username, display_name, password_hash, created_at, updated_at FROM users WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.map(|row| user_from_row(&row)).transpose()
}

pub async fn get_user_by_username(
    pool: &AnyPool,
    kind: DbKind,
    username: &str,
) -> Result<Option<UserRecord>> {
    let sql = rewrite_sql(
        "SELECT id, username, display_name, password_hash, created_at, updated_at FROM users WHERE username = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(username)
        .fetch_optional(pool)
        .await?;
    row.map(|row| user_from_row(&row)).transpose()
}

pub async fn search_users(
    pool: &AnyPool,
    kind: DbKind,
    requester_id: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<UserRecord>> {
    let pattern = format!("%{}%", query.to_lowercase());
    let sql = rewrite_sql(
        r#"SELECT id, username, display_name, password_hash, created_at, updated_at
           FROM users
           WHERE id != ? AND (LOWER(username) LIKE ? OR LOWER(display_name) LIKE ?)
           ORDER BY username ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(requester_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(user_from_row).collect()
}

/// Fetch users by id. When `scoped_to` is set, restricts to users sharing at
/// least one conversation with that requester (plus the requester).
pub async fn fetch_users_by_ids(
    pool: &AnyPool,
    kind: DbKind,
    ids: &[String],
    scoped_to: Option<&str>,
) -> Result<Vec<UserRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = format!(
        r#"SELECT id, username, display_name, password_hash, created_at, updated_at
           FROM users WHERE id IN ({})"#,
        placeholders(ids.len())
    );
    if scoped_to.is_some() {
        sql.push_str(
            r#" AND (id = ? OR id IN (
                SELECT DISTINCT user_id FROM conversation_members
                WHERE conversation_id IN (
                    SELECT conversation_id FROM conversation_members WHERE user_id = ?
                )
            ))"#,
        );
    }
    sql.push_str(" ORDER BY username ASC, id ASC");

    let rewritten = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(rewritten.as_ref());
    for id in ids {
        query = query.bind(id);
    }
    if let Some(requester_id) = scoped_to {
        query = query.bind(requester_id).bind(requester_id);
    }
    let rows = query.fetch_all(pool).await?;
    rows.iter().map(user_from_row).collect()
}

// --- refresh tokens ---

pub async fn insert_refresh_token(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &RefreshTokenRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by_token_id)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.token_hash)
        .bind(datetime_to_i64(record.issued_at))
        .bind(datetime_to_i64(record.expires_at))
        .bind(record.revoked_at.map(datetime_to_i64))
        .bind(record.replaced_by_token_id.as_deref())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn find_refresh_token_by_hash(
    pool: &AnyPool,
    kind: DbKind,
    token_hash: &str,
) -> Result<Option<RefreshTokenRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by_token_id
           FROM refresh_tokens WHERE token_hash = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(token_hash)
        .fetch_optional(pool)
        .await?;
    row.map(|row| refresh_token_from_row(&row)).transpose()
}

pub async fn mark_refresh_token_revoked(
    conn: &mut AnyConnection,
    kind: DbKind,
    id: &str,
    revoked_at: DateTime<Utc>,
    replaced_by_token_id: Option<&str>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE refresh_tokens SET revoked_at = ?, replaced_by_token_id = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(revoked_at))
        .bind(replaced_by_token_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- conversations ---

pub async fn insert_conversation(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &ConversationRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations (id, type, created_at, updated_at, last_message_preview, last_message_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.kind)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .bind(record.last_message_preview.as_deref())
        .bind(record.last_message_at.map(datetime_to_i64))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn insert_conversation_member(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &MemberRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_members (conversation_id, user_id, joined_at, role)
           VALUES (?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.conversation_id)
        .bind(&record.user_id)
        .bind(datetime_to_i64(record.joined_at))
        .bind(&record.role)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_conversation(
    conn: &mut AnyConnection,
    kind: DbKind,
    id: &str,
) -> Result<Option<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, type, created_at, updated_at, last_message_preview, last_message_at
           FROM conversations WHERE id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| conversation_from_row(&row)).transpose()
}

pub async fn find_direct_conversation(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
    other_user_id: &str,
) -> Result<Option<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, type, created_at, updated_at, last_message_preview, last_message_at
           FROM conversations
           WHERE type = 'direct' AND id IN (
               SELECT conversation_id FROM conversation_members
               WHERE user_id IN (?, ?)
               GROUP BY conversation_id
               HAVING COUNT(*) = 2 AND COUNT(DISTINCT user_id) = 2
           )"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(user_id)
        .bind(other_user_id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| conversation_from_row(&row)).transpose()
}

pub async fn list_user_conversations(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
) -> Result<Vec<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT c.id, c.type, c.created_at, c.updated_at, c.last_message_preview, c.last_message_at
           FROM conversations c
           JOIN conversation_members m ON m.conversation_id = c.id
           WHERE m.user_id = ?
           ORDER BY COALESCE(c.last_message_at, c.updated_at) DESC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(conversation_from_row).collect()
}

pub async fn conversation_member_ids(
    pool: &AnyPool,
    kind: DbKind,
    conversation_ids: &[String],
) -> Result<HashMap<String, Vec<String>>> {
    let mut result: HashMap<String, Vec<String>> = conversation_ids
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();
    if conversation_ids.is_empty() {
        return Ok(result);
    }

    let sql = format!(
        r#"SELECT conversation_id, user_id FROM conversation_members
           WHERE conversation_id IN ({})
           ORDER BY conversation_id ASC, user_id ASC"#,
        placeholders(conversation_ids.len())
    );
    let rewritten = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(rewritten.as_ref());
    for id in conversation_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    for row in rows {
        let conversation_id: String = row.try_get("conversation_id")?;
        let user_id: String = row.try_get("user_id")?;
        result.entry(conversation_id).or_default().push(user_id);
    }
    Ok(result)
}

pub async fn membership_exists(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
    conversation_id: &str,
) -> Result<bool> {
    let sql = rewrite_sql(
        "SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Which of `conversation_ids` the user actually belongs to.
pub async fn membership_subset(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
    conversation_ids: &[String],
) -> Result<HashSet<String>> {
    if conversation_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT conversation_id FROM conversation_members WHERE user_id = ? AND conversation_id IN ({})",
        placeholders(conversation_ids.len())
    );
    let rewritten = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(rewritten.as_ref()).bind(user_id);
    for id in conversation_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    let mut out = HashSet::new();
    for row in rows {
        out.insert(row.try_get::<String, _>("conversation_id")?);
    }
    Ok(out)
}

// --- conversation counters ---

pub async fn insert_conversation_counter(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation_id: &str,
    next_seq: i64,
) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO conversation_counters (conversation_id, next_seq) VALUES (?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(next_seq)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_counter_for_update(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation_id: &str,
) -> Result<Option<i64>> {
    // Row-level lock on engines that support it; sqlite serializes the
    // whole write transaction anyway.
    let base = "SELECT next_seq FROM conversation_counters WHERE conversation_id = ?";
    let sql = match kind {
        DbKind::Postgres => Cow::Owned(format!("{base} FOR UPDATE")),
        DbKind::Sqlite => Cow::Borrowed(base),
    };
    let rewritten = rewrite_sql(sql.as_ref(), kind);
    let row = sqlx::query(rewritten.as_ref())
        .bind(conversation_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| Ok(row.try_get::<i64, _>("next_seq")?)).transpose()
}

/// Compare-and-set advance. Returns false when another writer moved the
/// counter first (possible only without row locking).
pub async fn advance_counter(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation_id: &str,
    current: i64,
) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE conversation_counters SET next_seq = ? WHERE conversation_id = ? AND next_seq = ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(current + 1)
        .bind(conversation_id)
        .bind(current)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

// --- messages ---

pub async fn find_message_by_client_id(
    pool: &AnyPool,
    kind: DbKind,
    sender_id: &str,
    client_message_id: &str,
) -> Result<Option<MessageRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, conversation_id, sender_id, client_message_id, seq, content, created_at
           FROM messages WHERE sender_id = ? AND client_message_id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(sender_id)
        .bind(client_message_id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| message_from_row(&row)).transpose()
}

pub async fn insert_message(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &MessageRecord,
) -> Result<(), sqlx::Error> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (id, conversation_id, sender_id, client_message_id, seq, content, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.sender_id)
        .bind(&record.client_message_id)
        .bind(record.seq)
        .bind(&record.content)
        .bind(datetime_to_i64(record.created_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn touch_conversation_after_message(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation_id: &str,
    now: DateTime<Utc>,
    preview: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE conversations
           SET updated_at = ?, last_message_at = ?, last_message_preview = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .bind(preview)
        .bind(conversation_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    after_seq: i64,
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, conversation_id, sender_id, client_message_id, seq, content, created_at
           FROM messages
           WHERE conversation_id = ? AND seq > ?
           ORDER BY seq ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn list_recent_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_ids: &[String],
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    if conversation_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        r#"SELECT id, conversation_id, sender_id, client_message_id, seq, content, created_at
           FROM messages
           WHERE conversation_id IN ({})
           ORDER BY created_at DESC
           LIMIT ?"#,
        placeholders(conversation_ids.len())
    );
    let rewritten = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(rewritten.as_ref());
    for id in conversation_ids {
        query = query.bind(id);
    }
    let rows = query.bind(limit).fetch_all(pool).await?;
    rows.iter().map(message_from_row).collect()
}

// --- realtime outbox ---

pub async fn insert_outbox_event(
    conn: &mut AnyConnection,
    kind: DbKind,
    event: &NewOutboxEvent,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO realtime_outbox_events
           (event_id, event_type, conversation_id, payload_json, created_at, published_at, attempts, next_attempt_at, last_error)
           VALUES (?, ?, ?, ?, ?, NULL, 0, ?, NULL)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.conversation_id)
        .bind(&event.payload_json)
        .bind(datetime_to_i64(event.created_at))
        .bind(datetime_to_i64(event.next_attempt_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn fetch_due_outbox_events(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboxEventRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, event_id, event_type, conversation_id, payload_json, created_at, published_at, attempts, next_attempt_at, last_error
           FROM realtime_outbox_events
           WHERE published_at IS NULL AND next_attempt_at <= ?
           ORDER BY id ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(outbox_from_row).collect()
}

pub async fn mark_outbox_published(
    conn: &mut AnyConnection,
    kind: DbKind,
    id: i64,
    published_at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE realtime_outbox_events SET published_at = ?, last_error = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(published_at))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_outbox_failed(
    conn: &mut AnyConnection,
    kind: DbKind,
    id: i64,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE realtime_outbox_events SET attempts = ?, next_attempt_at = ?, last_error = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(attempts as i64)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(last_error)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_outbox_events(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
) -> Result<Vec<OutboxEventRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, event_id, event_type, conversation_id, payload_json, created_at, published_at, attempts, next_attempt_at, last_error
           FROM realtime_outbox_events
           WHERE conversation_id = ?
           ORDER BY id ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(outbox_from_row).collect()
}

/// Reschedule a single event; used by tests and operational tooling to force
/// a due retry.
pub async fn set_outbox_next_attempt(
    pool: &AnyPool,
    kind: DbKind,
    id: i64,
    next_attempt_at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE realtime_outbox_events SET next_attempt_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(next_attempt_at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
