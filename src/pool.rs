//! Fixed-capacity connection pool.
//!
//! The pool is an array of slots, each holding at most one idle connection.
//! Acquire scans for a filled slot and takes the first one; on a miss it
//! opens a fresh connection. Release scans for an empty slot; if every slot
//! is taken the connection is dropped on the spot. There is no queueing and
//! no fairness: under contention callers simply dial new connections, and
//! surplus connections are shed instead of waited for.
//!
//! Slot access is a per-slot `try_lock`, never a blocking lock, so neither
//! path can stall behind another caller.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::{PgConfig, PgConnection};
use crate::error::PgResult;

#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PgConfig,
    slots: Box<[Mutex<Option<PgConnection>>]>,
}

impl PgPool {
    /// Create a pool that retains at most `capacity` idle connections. The
    /// pool starts empty; connections are opened on demand.
    pub fn new(config: PgConfig, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            inner: Arc::new(PoolInner { config, slots }),
        }
    }

    /// Take an idle connection, or open a new one if none is available.
    pub async fn acquire(&self) -> PgResult<PgConnection> {
        for slot in self.inner.slots.iter() {
            if let Some(mut guard) = slot.try_lock() {
                if let Some(conn) = guard.take() {
                    trace!("reusing pooled connection");
                    return Ok(conn);
                }
            }
        }

        debug!("no idle connection, opening a new one");
        PgConnection::open(&self.inner.config).await
    }

    /// Return a connection to the pool. If every slot is occupied the
    /// connection is dropped without a Terminate exchange; shedding must not
    /// suspend the caller.
    pub fn release(&self, conn: PgConnection) {
        for slot in self.inner.slots.iter() {
            if let Some(mut guard) = slot.try_lock() {
                if guard.is_none() {
                    *guard = Some(conn);
                    return;
                }
            }
        }

        trace!("pool full, discarding connection");
    }

    /// Close every idle connection with a best-effort Terminate. Connections
    /// currently checked out are untouched; they close when dropped or
    /// released into the emptied slots.
    pub async fn close(&self) {
        for slot in self.inner.slots.iter() {
            let conn = slot.lock().take();
            if let Some(conn) = conn {
                conn.close().await;
            }
        }
    }

    /// Number of idle connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_empty() {
        let pool = PgPool::new(PgConfig::new("localhost", 5432, "db", "u", "p"), 4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.idle_count(), 0);
    }
}
