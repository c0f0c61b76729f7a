//! Bounded connection pool for the embedded cache database.
//!
//! libSQL connections over one embedded database are cheap, but unbounded
//! creation under 100+ concurrent readers exhausts file handles and starves
//! the writer. The pool caps open connections with a semaphore and recycles
//! a small idle set; every fresh connection gets the WAL, busy-timeout and
//! foreign-key pragmas before it is handed out.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use turso::{params, Builder, Connection};

use crate::db::{CacheError, Result};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneously open connections.
    pub max_open: usize,

    /// Connections kept around between uses.
    pub max_idle: usize,

    /// Per-connection `busy_timeout` pragma, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 25,
            max_idle: 5,
            busy_timeout_ms: 5000,
        }
    }
}

impl From<&skein_core::PoolSettings> for PoolConfig {
    fn from(settings: &skein_core::PoolSettings) -> Self {
        Self {
            max_open: settings.max_open,
            max_idle: settings.max_idle,
            busy_timeout_ms: settings.busy_timeout_ms,
        }
    }
}

/// Semaphore-bounded pool of connections to one embedded database file.
pub(crate) struct Pool {
    db: turso::Database,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

impl Pool {
    /// Open the database file and set up the pool. No connection is created
    /// until the first [`Pool::get`].
    pub(crate) async fn open(path: &str, config: PoolConfig) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;

        Ok(Self {
            db,
            idle: Arc::new(Mutex::new(Vec::new())),
            permits: Arc::new(Semaphore::new(config.max_open.max(1))),
            config,
        })
    }

    /// Borrow a connection, waiting if `max_open` are already out.
    pub(crate) async fn get(&self) -> Result<PooledConn> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Other("connection pool is closed".to_string()))?;

        let recycled = self.idle.lock().await.pop();

        let conn = match recycled {
            Some(conn) => conn,
            None => {
                let conn = self.db.connect()?;
                configure(&conn, self.config.busy_timeout_ms).await?;
                conn
            }
        };

        Ok(PooledConn {
            conn: Some(conn),
            idle: self.idle.clone(),
            max_idle: self.config.max_idle,
            _permit: permit,
        })
    }
}

/// Apply the per-connection pragmas.
///
/// PRAGMA statements may return rows, so they go through `query`.
async fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
    let _ = conn
        .query(&format!("PRAGMA busy_timeout={}", busy_timeout_ms), params![])
        .await?;
    let _ = conn.query("PRAGMA foreign_keys=ON", params![]).await?;
    Ok(())
}

/// A borrowed connection. Dropping it returns the connection to the idle set
/// (up to `max_idle`) and frees its permit.
pub(crate) struct PooledConn {
    conn: Option<Connection>,
    idle: Arc<Mutex<Vec<Connection>>>,
    max_idle: usize,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // try_lock keeps Drop non-blocking; a contended lock just means
            // this connection is closed instead of recycled.
            if let Ok(mut idle) = self.idle.try_lock() {
                if idle.len() < self.max_idle {
                    idle.push(conn);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_pool(config: PoolConfig) -> (Pool, TempDir) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pool.db");
        let pool = Pool::open(&path.to_string_lossy(), config).await.unwrap();
        (pool, temp)
    }

    #[tokio::test]
    async fn test_get_and_recycle() {
        let (pool, _temp) = open_pool(PoolConfig::default()).await;

        {
            let conn = pool.get().await.unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", params![])
                .await
                .unwrap();
        }

        // The recycled connection sees the table created above.
        let conn = pool.get().await.unwrap();
        conn.execute("INSERT INTO t (x) VALUES (1)", params![])
            .await
            .unwrap();
        assert_eq!(pool.idle.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_max_open_bounds_concurrency() {
        let config = PoolConfig {
            max_open: 2,
            max_idle: 2,
            busy_timeout_ms: 5000,
        };
        let (pool, _temp) = open_pool(config).await;

        let a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();

        // Third borrow must wait until one is returned.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), pool.get())
                .await
                .is_err()
        );

        drop(a);
        let _c = tokio::time::timeout(std::time::Duration::from_millis(500), pool.get())
            .await
            .expect("freed permit should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_cap() {
        let config = PoolConfig {
            max_open: 4,
            max_idle: 1,
            busy_timeout_ms: 5000,
        };
        let (pool, _temp) = open_pool(config).await;

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.idle.lock().await.len(), 1);
    }
}
