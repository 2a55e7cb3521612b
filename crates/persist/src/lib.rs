//! Keel persistence: an append-only SQLite ledger of installer-set events.
//!
//! The ledger is an audit trail, never a source of truth; reconciliation
//! keeps working if recording fails.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEvent {
    Created,
    Ready,
    Superseded,
    RolledBack,
    Deleted,
}

impl LedgerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Ready => "Ready",
            Self::Superseded => "Superseded",
            Self::RolledBack => "RolledBack",
            Self::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for LedgerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Created" => Self::Created,
            "Ready" => Self::Ready,
            "Superseded" => Self::Superseded,
            "RolledBack" => Self::RolledBack,
            "Deleted" => Self::Deleted,
            other => return Err(anyhow!("unknown ledger event {other:?}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning component as `namespace/name`
    pub component: String,
    pub installer_set: String,
    pub hash: String,
    pub event: LedgerEvent,
    /// Seconds since the epoch
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Manifest snapshot, compressed when the `zstd` feature is on
    #[serde(default, skip_serializing)]
    pub snapshot: Option<Vec<u8>>,
}

impl LedgerEntry {
    pub fn new(component: &str, installer_set: &str, hash: &str, event: LedgerEvent) -> Self {
        Self {
            component: component.to_string(),
            installer_set: installer_set.to_string(),
            hash: hash.to_string(),
            event,
            ts: now_ts(),
            detail: None,
            snapshot: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_snapshot(mut self, text: &str) -> Self {
        self.snapshot = Some(maybe_compress(text));
        self
    }

    pub fn snapshot_text(&self) -> Option<String> {
        self.snapshot.as_deref().map(maybe_decompress)
    }
}

pub trait Ledger: Send + Sync {
    fn record(&self, entry: LedgerEntry) -> Result<()>;

    /// Newest first.
    fn history(&self, component: &str, limit: Option<usize>) -> Result<Vec<LedgerEntry>>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLedger;

impl Ledger for NullLedger {
    fn record(&self, _entry: LedgerEntry) -> Result<()> {
        Ok(())
    }

    fn history(&self, _component: &str, _limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        Ok(Vec::new())
    }
}

fn keep_per_component() -> i64 {
    std::env::var("KEEL_LEDGER_KEEP")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(200)
}

/// SQLite-backed ledger. Synchronous; writes are small and infrequent.
pub struct SqliteLedger {
    db: Mutex<rusqlite::Connection>,
    keep: i64,
}

impl SqliteLedger {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        info!(path, "opened ledger");
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.execute(
            "CREATE TABLE IF NOT EXISTS installer_set_events (
                component     TEXT NOT NULL,
                installer_set TEXT NOT NULL,
                hash          TEXT NOT NULL,
                event         TEXT NOT NULL,
                ts            INTEGER NOT NULL,
                detail        TEXT,
                snapshot      BLOB
            )",
            [],
        )
        .context("creating installer_set_events table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_component_ts ON installer_set_events(component, ts DESC)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self {
            db: Mutex::new(db),
            keep: keep_per_component(),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("ledger connection poisoned"))
    }
}

impl Ledger for SqliteLedger {
    fn record(&self, entry: LedgerEntry) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO installer_set_events(component, installer_set, hash, event, ts, detail, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &entry.component,
                &entry.installer_set,
                &entry.hash,
                entry.event.as_str(),
                entry.ts,
                &entry.detail,
                &entry.snapshot,
            ),
        )?;
        // Rotate: keep the newest `keep` rows per component
        let rotated = tx.execute(
            "DELETE FROM installer_set_events
             WHERE component = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM installer_set_events WHERE component = ?1
                   ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&entry.component, self.keep),
        )?;
        tx.commit()?;
        if rotated > 0 {
            debug!(component = %entry.component, rotated, "rotated ledger rows");
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn history(&self, component: &str, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        let started = std::time::Instant::now();
        let cap = limit.map(|n| n as i64).unwrap_or(self.keep);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT installer_set, hash, event, ts, detail, snapshot FROM installer_set_events
             WHERE component = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((component, cap))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event: String = row.get(2)?;
            out.push(LedgerEntry {
                component: component.to_string(),
                installer_set: row.get(0)?,
                hash: row.get(1)?,
                event: event.parse()?,
                ts: row.get(3)?,
                detail: row.get(4)?,
                snapshot: row.get(5)?,
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("ledger.db");
        return p.to_string_lossy().to_string();
    }
    "keel-ledger.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    #[allow(unreachable_code)]
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
