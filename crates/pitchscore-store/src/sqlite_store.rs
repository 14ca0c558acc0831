//! SQLite-backed conversation store

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pitchscore_schema::{Conversation, Message, RatingRecord, Role, StoredRating};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::{ConversationStore, IncompleteRatingQuery};

pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    /// Open or create the database at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open store: {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a conversation, replacing any existing one with the same id
    /// together with its messages and stored rating.
    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM conversations WHERE id = ?1", [&conversation.id])?;
        tx.execute(
            "INSERT INTO conversations (id, created_at) VALUES (?1, ?2)",
            params![conversation.id, Utc::now().to_rfc3339()],
        )?;

        for (seq, message) in conversation.messages.iter().enumerate() {
            tx.execute(
                r#"INSERT INTO messages (conversation_id, seq, role, content, at)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![
                    conversation.id,
                    seq as i64,
                    message.role.as_str(),
                    message.content,
                    message.at.map(|at| at.to_rfc3339()),
                ],
            )?;
        }

        if let Some(rating) = &conversation.rating {
            write_rating(&tx, &conversation.id, rating)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub async fn get_rating(&self, id: &str) -> Result<Option<StoredRating>> {
        let conn = self.conn.lock().await;
        read_rating(&conn, id)
    }

    pub async fn count_conversations(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().await;

        let exists = conn
            .query_row("SELECT 1 FROM conversations WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            r#"SELECT role, content, at FROM messages
               WHERE conversation_id = ?1
               ORDER BY seq ASC"#,
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, at) = row?;
            let role: Role = role.parse().map_err(|e: String| anyhow!(e))?;
            messages.push(Message {
                role,
                content,
                at: at.as_deref().and_then(parse_timestamp),
            });
        }

        Ok(Some(Conversation {
            id: id.to_string(),
            messages,
            rating: read_rating(&conn, id)?,
        }))
    }

    async fn put_rating(&self, id: &str, record: &RatingRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        let exists = conn
            .query_row("SELECT 1 FROM conversations WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(anyhow!("conversation not found: {id}"));
        }
        write_rating(&conn, id, &record.to_stored())?;
        tracing::debug!(conversation_id = %id, total = record.total_score, "rating replaced");
        Ok(())
    }

    async fn list_incomplete_ratings(&self, query: &IncompleteRatingQuery) -> Result<Vec<String>> {
        if query.page_size == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(INCOMPLETE_RATINGS_SQL)?;
        let mut ids = Vec::new();
        let mut cursor = query.after.clone();

        // SQL narrows the scan; the record predicate has the final word, so a
        // batch can shrink and the scan continues after its last row.
        loop {
            let limit = query.page_size - ids.len();
            let mut fetched = 0;
            let mut last = None;
            {
                let mut rows = stmt.query(params![
                    cursor,
                    query.include_unrated,
                    query.policy.require_feedback,
                    limit as i64,
                ])?;
                while let Some(row) = rows.next()? {
                    fetched += 1;
                    let id: String = row.get(0)?;
                    let has_rating: bool = row.get(1)?;
                    if !has_rating || !row_to_rating(row, 2)?.is_complete(query.policy) {
                        ids.push(id.clone());
                    }
                    last = Some(id);
                }
            }

            if fetched < limit || ids.len() >= query.page_size {
                break;
            }
            cursor = last;
        }
        Ok(ids)
    }
}

/// Candidates for re-evaluation in id order. Mirrors the stored-record
/// completeness check; feedback holding anything but printable ASCII is
/// returned as a candidate and settled by that check.
const INCOMPLETE_RATINGS_SQL: &str = r#"
    SELECT c.id, r.conversation_id IS NOT NULL,
           r.opening, r.discovery, r.presentation, r.objection_handling, r.closing,
           r.total_score, r.max_possible_score, r.feedback, r.model, r.rated_at
    FROM conversations c
    LEFT JOIN ratings r ON r.conversation_id = c.id
    WHERE (?1 IS NULL OR c.id > ?1)
      AND CASE WHEN r.conversation_id IS NULL THEN ?2
          ELSE (r.opening IS NULL OR r.opening NOT BETWEEN 0 AND 10
             OR r.discovery IS NULL OR r.discovery NOT BETWEEN 0 AND 10
             OR r.presentation IS NULL OR r.presentation NOT BETWEEN 0 AND 10
             OR r.objection_handling IS NULL OR r.objection_handling NOT BETWEEN 0 AND 10
             OR r.closing IS NULL OR r.closing NOT BETWEEN 0 AND 10
             OR r.total_score IS NULL
             OR r.total_score <> r.opening + r.discovery + r.presentation
                                 + r.objection_handling + r.closing
             OR (?3 AND (r.feedback IS NULL
                 OR TRIM(r.feedback, ' ' || char(9, 10, 11, 12, 13)) = ''
                 OR r.feedback GLOB '*[^ -~]*')))
          END
    ORDER BY c.id ASC
    LIMIT ?4
"#;

// ─────────────────────────────────────────────────────────────────────────────
// Ratings
// ─────────────────────────────────────────────────────────────────────────────

/// One statement, so the replace is atomic from any reader's point of view.
fn write_rating(conn: &Connection, id: &str, rating: &StoredRating) -> Result<()> {
    conn.execute(
        r#"INSERT OR REPLACE INTO ratings
           (conversation_id, opening, discovery, presentation, objection_handling, closing,
            total_score, max_possible_score, feedback, model, rated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        params![
            id,
            rating.opening,
            rating.discovery,
            rating.presentation,
            rating.objection_handling,
            rating.closing,
            rating.total_score,
            rating.max_possible_score,
            rating.feedback,
            rating.model,
            rating.rated_at.map(|at| at.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn read_rating(conn: &Connection, id: &str) -> Result<Option<StoredRating>> {
    let mut stmt = conn.prepare(
        r#"SELECT opening, discovery, presentation, objection_handling, closing,
                  total_score, max_possible_score, feedback, model, rated_at
           FROM ratings WHERE conversation_id = ?1"#,
    )?;
    let rating = stmt
        .query_row([id], |row| row_to_rating(row, 0))
        .optional()?;
    Ok(rating)
}

fn row_to_rating(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<StoredRating> {
    Ok(StoredRating {
        opening: row.get(offset)?,
        discovery: row.get(offset + 1)?,
        presentation: row.get(offset + 2)?,
        objection_handling: row.get(offset + 3)?,
        closing: row.get(offset + 4)?,
        total_score: row.get(offset + 5)?,
        max_possible_score: row.get(offset + 6)?,
        feedback: row.get(offset + 7)?,
        model: row.get(offset + 8)?,
        rated_at: row
            .get::<_, Option<String>>(offset + 9)?
            .as_deref()
            .and_then(parse_timestamp),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __pitchscore_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __pitchscore_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                at TEXT,
                PRIMARY KEY (conversation_id, seq)
            );
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS ratings (
                conversation_id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
                opening INTEGER,
                discovery INTEGER,
                presentation INTEGER,
                objection_handling INTEGER,
                closing INTEGER,
                total_score INTEGER,
                max_possible_score INTEGER,
                feedback TEXT,
                model TEXT,
                rated_at TEXT
            );
            "#,
        ),
    ];

    for (version, sql) in migrations {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO __pitchscore_schema_version(version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}
