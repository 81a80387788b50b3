use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use keel_core::{SessionSnapshot, runtime_dir};
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS session_snapshots (
            session_id TEXT PRIMARY KEY,
            saved_at TEXT NOT NULL,
            history TEXT NOT NULL,
            metrics TEXT NOT NULL
         );",
    ),
    (
        2,
        "ALTER TABLE session_snapshots ADD COLUMN pending_patch TEXT;
         CREATE INDEX IF NOT EXISTS idx_session_snapshots_saved_at
            ON session_snapshots(saved_at);",
    ),
];

/// Session snapshots in `<workspace>/.keel/store.sqlite`, one row per session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        Self::open(root.join("store.sqlite"))
    }

    pub fn open(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn db(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))
    }

    /// Inserts or replaces the snapshot for its session.
    pub fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_snapshots (session_id, saved_at, history, metrics, pending_patch)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.session_id.to_string(),
                format_time(snapshot.saved_at),
                serde_json::to_string(&snapshot.history)?,
                serde_json::to_string(&snapshot.metrics)?,
                snapshot.pending_patch,
            ],
        )?;
        Ok(())
    }

    pub fn load_snapshot(&self, session_id: Uuid) -> Result<Option<SessionSnapshot>> {
        let conn = self.db()?;
        conn.query_row(
            "SELECT session_id, saved_at, history, metrics, pending_patch
             FROM session_snapshots WHERE session_id = ?1",
            [session_id.to_string()],
            read_row,
        )
        .optional()?
        .map(decode_row)
        .transpose()
    }

    /// Most recently saved snapshot across all sessions.
    pub fn load_latest(&self) -> Result<Option<SessionSnapshot>> {
        let conn = self.db()?;
        conn.query_row(
            "SELECT session_id, saved_at, history, metrics, pending_patch
             FROM session_snapshots ORDER BY saved_at DESC LIMIT 1",
            [],
            read_row,
        )
        .optional()?
        .map(decode_row)
        .transpose()
    }

    pub fn list_sessions(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, saved_at FROM session_snapshots ORDER BY saved_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, saved_at) = row?;
            out.push((Uuid::parse_str(&id)?, parse_time(&saved_at)?));
        }
        Ok(out)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;
        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)
                    .with_context(|| format!("migration {version} failed"))?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

type RawRow = (String, String, String, String, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row((id, saved_at, history, metrics, pending_patch): RawRow) -> Result<SessionSnapshot> {
    Ok(SessionSnapshot {
        session_id: Uuid::parse_str(&id)?,
        saved_at: parse_time(&saved_at)?,
        history: serde_json::from_str(&history).context("corrupt history column")?,
        metrics: serde_json::from_str(&metrics).context("corrupt metrics column")?,
        pending_patch,
    })
}

/// Fixed-width so `ORDER BY saved_at` sorts chronologically.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
