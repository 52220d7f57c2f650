//! SQLite store for provider credentials obtained outside this tool.

use crate::models::ProviderKind;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    token_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Save raw credential JSON for a provider, replacing any previous value.
pub fn save_credential_raw(conn: &Connection, provider: ProviderKind, token_json: &str) -> Result<()> {
    serde_json::from_str::<serde_json::Value>(token_json).context("token JSON does not parse")?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO credentials (provider, token_json, updated_at) VALUES (?1, ?2, ?3) ON CONFLICT(provider) DO UPDATE SET token_json = excluded.token_json, updated_at = excluded.updated_at",
        params![provider.as_str(), token_json, now],
    )?;
    Ok(())
}

pub fn load_credential(conn: &Connection, provider: ProviderKind) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT token_json FROM credentials WHERE provider = ?1 LIMIT 1")?;
    let row = stmt
        .query_row(params![provider.as_str()], |r| r.get::<_, String>(0))
        .optional()?;
    Ok(row)
}

/// The `access_token` field of the stored credential JSON.
pub fn access_token_for(conn: &Connection, provider: ProviderKind) -> Result<Option<String>> {
    let raw = match load_credential(conn, provider)? {
        Some(r) => r,
        None => return Ok(None),
    };
    let v: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("stored {} credential is not JSON", provider))?;
    Ok(v.get("access_token").and_then(|t| t.as_str()).map(|s| s.to_string()))
}
