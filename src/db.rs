use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use crate::credentials;

pub const DB_FILE: &str = "srms.sqlite3";
pub const ADMIN_USERNAME: &str = "ADMIN";
pub const ADMIN_DEFAULT_PASSWORD: &str = "ADMIN@1234";
pub const TOKEN_SECRET_KEY: &str = "auth.token_secret";
pub const TOKEN_SECRET_ENV: &str = "SRMSD_TOKEN_SECRET";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            username TEXT PRIMARY KEY,
            password TEXT NOT NULL,
            role TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            roll TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            dob TEXT,
            gender TEXT,
            dept_code TEXT NOT NULL,
            dept_name TEXT NOT NULL,
            year TEXT NOT NULL,
            current_semester INTEGER NOT NULL,
            password TEXT NOT NULL,
            reset_state TEXT NOT NULL DEFAULT 'none',
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            student_roll TEXT PRIMARY KEY,
            total_days INTEGER NOT NULL DEFAULT 0,
            days_present INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_roll) REFERENCES students(roll)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_roll TEXT NOT NULL,
            semester TEXT NOT NULL,
            int1 INTEGER,
            int2 INTEGER,
            model INTEGER,
            sem_final INTEGER,
            assignment INTEGER,
            mini_project INTEGER,
            rmk_next_gen INTEGER,
            updated_at TEXT,
            FOREIGN KEY(student_roll) REFERENCES students(roll),
            UNIQUE(student_roll, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_roll)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            semester TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            uploaded_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS digital_content(
            id TEXT PRIMARY KEY,
            semester TEXT NOT NULL,
            title TEXT NOT NULL,
            file_path TEXT,
            url TEXT,
            uploaded_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_digital_content_semester ON digital_content(semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Databases restored from older bundles may predate the reset_state
    // column or still carry its boolean-string values.
    ensure_students_reset_state(&conn)?;
    migrate_reset_states(&conn)?;

    seed_admin_user(&conn)?;
    ensure_token_secret(&conn)?;

    Ok(conn)
}

fn ensure_students_reset_state(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "reset_state")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN reset_state TEXT NOT NULL DEFAULT 'none'",
        [],
    )?;
    Ok(())
}

fn migrate_reset_states(conn: &Connection) -> anyhow::Result<()> {
    // Older records stored the flag as 'false'/'true'.
    conn.execute(
        "UPDATE students SET reset_state = 'requested' WHERE reset_state = 'true'",
        [],
    )?;
    conn.execute(
        "UPDATE students SET reset_state = 'none'
         WHERE reset_state NOT IN ('none', 'requested', 'approved')",
        [],
    )?;
    Ok(())
}

fn seed_admin_user(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users(username, password, role, created_at)
         VALUES(?, ?, 'staff', strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            ADMIN_USERNAME,
            credentials::hash_password(ADMIN_DEFAULT_PASSWORD),
        ),
    )?;
    Ok(())
}

fn ensure_token_secret(conn: &Connection) -> anyhow::Result<()> {
    if settings_get_json(conn, TOKEN_SECRET_KEY)?.is_some() {
        return Ok(());
    }
    settings_set_json(
        conn,
        TOKEN_SECRET_KEY,
        &serde_json::Value::String(Uuid::new_v4().to_string()),
    )
}

/// Signing secret for issued tokens: the environment override when set,
/// otherwise the per-workspace value minted at first open.
pub fn token_secret(conn: &Connection) -> anyhow::Result<String> {
    if let Ok(v) = std::env::var(TOKEN_SECRET_ENV) {
        if !v.trim().is_empty() {
            return Ok(v);
        }
    }
    match settings_get_json(conn, TOKEN_SECRET_KEY)? {
        Some(serde_json::Value::String(s)) => Ok(s),
        _ => Err(anyhow!("token secret missing from settings")),
    }
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
