//! Connection plumbing.
//!
//! Each operation opens its own connection on a blocking thread and runs
//! a closure against it. The host is the single writer; WAL mode plus a
//! busy timeout covers the reader/writer overlap that remains.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// A cloneable handle on one database file.
#[derive(Clone)]
pub struct Db {
    path: Arc<PathBuf>,
}

impl Db {
    /// Open the database, apply pragmas, and run `schema` idempotently.
    pub(crate) async fn open(path: PathBuf, schema: &'static str) -> Result<Self> {
        let db = Self {
            path: Arc::new(path),
        };
        db.call(move |conn| {
            conn.execute_batch(schema)?;
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Run `f` against a fresh connection on a blocking thread.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Join(e.to_string()))?;
            }
            let mut conn = Connection::open(path.as_path())?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}
