//! Shared connection pool
//!
//! Meters that sit on the same physical link (same [`ConnectionKey`]) share
//! one transport. The pool tracks how many meters use each link, creates the
//! transport for the first one and closes it when the last one detaches.
//!
//! Each shared transport sits behind a `tokio::sync::Mutex`; a poll engine holds
//! that lock for a whole cycle, so engines on one bus never interleave
//! requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::ConnectionKey;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::ModbusTransport;

/// Transport shared between all engines on one link.
pub type SharedConnection<T> = Arc<Mutex<T>>;

struct PoolEntry<T> {
    connection: SharedConnection<T>,
    users: usize,
}

/// Reference-counted registry of shared links.
pub struct ConnectionPool<T> {
    entries: Mutex<HashMap<ConnectionKey, PoolEntry<T>>>,
}

impl<T> Default for ConnectionPool<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: ModbusTransport> ConnectionPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the link for `key`, creating it with `open` if nobody uses it yet.
    ///
    /// `open` runs at most once per key while the link is alive.
    pub async fn attach<F>(&self, key: &ConnectionKey, open: F) -> ModbusResult<SharedConnection<T>>
    where
        F: FnOnce() -> ModbusResult<T>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            entry.users += 1;
            debug!("Pool: {} attached (users={})", key, entry.users);
            return Ok(Arc::clone(&entry.connection));
        }

        let connection = Arc::new(Mutex::new(open()?));
        entries.insert(
            key.clone(),
            PoolEntry {
                connection: Arc::clone(&connection),
                users: 1,
            },
        );
        info!("Pool: created link {}", key);
        Ok(connection)
    }

    /// Leave the link for `key`. Returns `true` when this was the last user
    /// and the link has been closed.
    pub async fn detach(&self, key: &ConnectionKey) -> ModbusResult<bool> {
        let connection = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| ModbusError::configuration(format!("Unknown connection {key}")))?;

            entry.users -= 1;
            if entry.users > 0 {
                debug!("Pool: {} detached (users={})", key, entry.users);
                return Ok(false);
            }

            match entries.remove(key) {
                Some(entry) => entry.connection,
                None => return Ok(false),
            }
        };

        // Waits for an in-flight cycle to release the link.
        let mut transport = connection.lock().await;
        transport.close().await?;
        info!("Pool: closed link {}", key);
        Ok(true)
    }

    /// Number of meters attached to `key`.
    pub async fn users(&self, key: &ConnectionKey) -> usize {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.users)
            .unwrap_or(0)
    }

    /// Number of live links.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
