//! Embedded single-writer driver backed by SQLite (one B-tree table).

use std::sync::Mutex;

use ballast_core::{BallastError, BallastResult};
use metrics::histogram;
use rusqlite::Connection;

use crate::kv::{KvStore, Txn};

/// File-backed driver. Synchronous: the control plane's write path is
/// serialized anyway, so a mutexed connection is enough.
pub struct SqliteKv {
    db: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open_default() -> BallastResult<SqliteKv> {
        let path = std::env::var("BALLAST_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> BallastResult<SqliteKv> {
        let started = std::time::Instant::now();
        let db = Connection::open(path)
            .map_err(|e| BallastError::StoreUnavailable(format!("opening db at {}: {}", path, e)))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let timeout_secs: u64 = std::env::var("BALLAST_STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        db.busy_timeout(std::time::Duration::from_secs(timeout_secs))
            .map_err(map_err)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                k TEXT PRIMARY KEY,
                v BLOB NOT NULL
            )",
            [],
        )
        .map_err(map_err)?;
        histogram!("store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(SqliteKv { db: Mutex::new(db) })
    }
}

fn map_err(e: rusqlite::Error) -> BallastError {
    use rusqlite::ErrorCode;
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return BallastError::ConflictRetry;
        }
    }
    BallastError::StoreUnavailable(e.to_string())
}

fn get_on(conn: &Connection, key: &str) -> BallastResult<Option<Vec<u8>>> {
    use rusqlite::OptionalExtension;
    conn.query_row("SELECT v FROM kv WHERE k = ?1", [key], |row| row.get::<_, Vec<u8>>(0))
        .optional()
        .map_err(map_err)
}

fn range_on(conn: &Connection, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    match prefix_upper_bound(prefix) {
        Some(upper) => {
            let mut stmt = conn
                .prepare("SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k")
                .map_err(map_err)?;
            let mut rows = stmt.query((prefix, upper.as_str())).map_err(map_err)?;
            while let Some(row) = rows.next().map_err(map_err)? {
                out.push((row.get(0).map_err(map_err)?, row.get(1).map_err(map_err)?));
            }
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT k, v FROM kv WHERE k >= ?1 ORDER BY k").map_err(map_err)?;
            let mut rows = stmt.query([prefix]).map_err(map_err)?;
            while let Some(row) = rows.next().map_err(map_err)? {
                out.push((row.get(0).map_err(map_err)?, row.get(1).map_err(map_err)?));
            }
        }
    }
    Ok(out)
}

/// Smallest string strictly greater than every string with this prefix, or
/// None when no such bound exists (prefix empty or all 0xff).
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last().copied() {
        if last < 0xff {
            *bytes.last_mut().unwrap() = last + 1;
            return String::from_utf8(bytes).ok();
        }
        bytes.pop();
    }
    None
}

struct SqliteTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl Txn for SqliteTxn<'_> {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>> {
        get_on(self.tx, key)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> BallastResult<()> {
        self.tx
            .execute(
                "INSERT INTO kv (k, v) VALUES (?1, ?2)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                (key, value),
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> BallastResult<()> {
        self.tx.execute("DELETE FROM kv WHERE k = ?1", [key]).map_err(map_err)?;
        Ok(())
    }

    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
        range_on(self.tx, prefix)
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>> {
        get_on(&self.db.lock().unwrap(), key)
    }

    fn put(&self, key: &str, value: &[u8]) -> BallastResult<()> {
        self.db
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO kv (k, v) VALUES (?1, ?2)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                (key, value),
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> BallastResult<()> {
        self.db.lock().unwrap().execute("DELETE FROM kv WHERE k = ?1", [key]).map_err(map_err)?;
        Ok(())
    }

    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
        range_on(&self.db.lock().unwrap(), prefix)
    }

    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn Txn) -> BallastResult<()>,
    ) -> BallastResult<()> {
        let started = std::time::Instant::now();
        let mut db = self
            .db
            .lock()
            .map_err(|_| BallastError::StoreUnavailable("sqlite store poisoned".into()))?;
        let tx = db.transaction().map_err(map_err)?;
        {
            let mut handle = SqliteTxn { tx: &tx };
            f(&mut handle)?;
        }
        tx.commit().map_err(map_err)?;
        histogram!("store_txn_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".ballast");
        let _ = std::fs::create_dir_all(&p);
        p.push("ballast.db");
        return p.to_string_lossy().to_string();
    }
    "ballast.db".to_string()
}
