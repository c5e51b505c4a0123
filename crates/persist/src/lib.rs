//! Keel persistence: SQLite resource store.
//!
//! One connection behind a mutex; every read and write goes through
//! [`SqliteStore::transactional`], which commits iff the closure returns `Ok`.
//! A panic inside the closure rolls back and surfaces as
//! [`StoreError::Panicked`].

#![forbid(unsafe_code)]

mod schema;
mod tx;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Instant;

use metrics::{counter, histogram};
use rusqlite::types::ValueRef;
use rusqlite::{ffi, Connection, ErrorCode};
use tracing::{debug, info, warn, Span};

use keel_core::{Describe, StoreError};

pub use tx::Tx;

/// SQLite-backed resource store. Synchronous; callers keep transactions short
/// and never hold one across a remote call.
pub struct SqliteStore {
    db: Mutex<Connection>,
    path: String,
    span: Span,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = Connection::open(path).map_err(|e| StoreError::Query(format!("opening sqlite db at {}: {}", path, e)))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db, path.to_string())
    }

    /// Private database that disappears with the store. Used by tests and `KEEL_STORE=memory`.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(db, ":memory:".to_string())
    }

    fn init(mut db: Connection, path: String) -> Result<Self, StoreError> {
        let started = Instant::now();
        db.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        let version = schema::migrate(&mut db)?;
        let span = tracing::info_span!("store", component = "resource_store", path = %path);
        span.in_scope(|| info!(schema = version, "persist: store ready"));
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db), path, span })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs `f` inside one transaction. Commits iff `f` returns `Ok`.
    ///
    /// Begin, commit and rollback failures are reported as distinct
    /// [`StoreError`] variants. When the rollback after an `Err` itself fails,
    /// the rollback error wins and the original error is logged.
    pub fn transactional<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError> + std::fmt::Display,
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
    {
        let _enter = self.span.enter();
        let started = Instant::now();
        let mut db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = db.transaction().map_err(|e| StoreError::Begin(e.to_string()))?;

        let outcome = catch_unwind(AssertUnwindSafe(|| f(&Tx::new(&tx))));
        let result = match outcome {
            Ok(Ok(value)) => {
                tx.commit().map_err(|e| StoreError::Commit(e.to_string()))?;
                counter!("persist_tx_total", 1, "outcome" => "commit");
                Ok(value)
            }
            Ok(Err(err)) => {
                debug!(error = %err, "persist: rolling back");
                if let Err(rb) = tx.rollback() {
                    warn!(error = %err, rollback = %rb, "persist: rollback failed");
                    return Err(StoreError::Rollback(rb.to_string()).into());
                }
                counter!("persist_tx_total", 1, "outcome" => "rollback");
                Err(err)
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(panic = %msg, "persist: transaction body panicked, rolling back");
                if let Err(rb) = tx.rollback() {
                    return Err(StoreError::Rollback(format!("{} (after panic: {})", rb, msg)).into());
                }
                counter!("persist_tx_total", 1, "outcome" => "panic");
                Err(StoreError::Panicked(msg).into())
            }
        };
        histogram!("persist_tx_ms", started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Canonical dump of every table, ordered by key. Two stores with equal
    /// fingerprints hold the same rows byte for byte.
    pub fn fingerprint(&self) -> Result<String, StoreError> {
        const TABLES: &[(&str, &str)] = &[
            ("namespaces", "id"),
            ("volumes", "id"),
            ("namespace_volumes", "namespace_id, volume_id"),
            ("accesses", "id"),
            ("deployments", "id"),
            ("versions", "id"),
            ("domains", "id"),
            ("ingresses", "id"),
            ("owner_ceilings", "owner, kind"),
        ];
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        let mut out = String::new();
        for (table, key) in TABLES {
            let mut stmt = db
                .prepare(&format!("SELECT * FROM {} ORDER BY {}", table, key))
                .map_err(sql_err)?;
            let cols: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([]).map_err(sql_err)?;
            while let Some(row) = rows.next().map_err(sql_err)? {
                out.push_str(table);
                for (i, col) in cols.iter().enumerate() {
                    let v = row.get_ref(i).map_err(sql_err)?;
                    out.push('|');
                    out.push_str(col);
                    out.push('=');
                    match v {
                        ValueRef::Null => out.push_str("NULL"),
                        ValueRef::Integer(n) => out.push_str(&n.to_string()),
                        ValueRef::Real(f) => out.push_str(&f.to_string()),
                        ValueRef::Text(t) => out.push_str(&String::from_utf8_lossy(t)),
                        ValueRef::Blob(b) => out.push_str(&format!("{:?}", b)),
                    }
                }
                out.push('\n');
            }
        }
        Ok(out)
    }
}

impl Describe for SqliteStore {
    fn describe(&self) -> String {
        format!("sqlite store at {} (schema v{})", self.path, schema::latest())
    }
}

/// Maps driver errors. Only unique and primary-key violations become
/// `Conflict`; foreign-key and check failures stay `Query`.
pub(crate) fn sql_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, msg)
            if f.code == ErrorCode::ConstraintViolation
                && matches!(f.extended_code, ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY) =>
        {
            StoreError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => StoreError::Query(e.to_string()),
    }
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// `~/.keel/keel.db`, creating the directory; `keel.db` without a home.
pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}
