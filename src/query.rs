//! Parameterless prepared queries with request coalescing.
//!
//! A [`Query`] represents one SQL statement fetched many times concurrently.
//! While a fetch is on the wire, other callers of the same query do not dial
//! their own round trips: they attach to the in-flight one and decode from
//! its response snapshot. Under a burst of K concurrent fetches this
//! collapses the wire traffic to somewhere between one round trip and K.
//!
//! The in-flight slot is published after the initial check, not atomically
//! with it, so two callers racing through the gap can both become leaders.
//! Each leader drives a correct, independent round trip; the cost of the
//! race is redundant wire work, never a wrong result. Closing the gap would
//! put a lock across the whole fetch and serialize the fast path.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::completion::Completion;
use crate::connection::PgConnection;
use crate::error::{PgError, PgResult};
use crate::pool::PgPool;
use crate::protocol::{backend, MessageReader};
use crate::row::{RowReader, Shaper};

/// Hands out [`Query`] values bound to a pool, assigning each a statement id
/// that is unique for the factory's lifetime. Ids are never reused, which is
/// what makes a per-connection id bitset a sound prepared-statement cache
/// (see [`PgConnection::ensure_prepared`]).
pub struct QueryFactory {
    pool: PgPool,
    next_id: AtomicU32,
}

impl QueryFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            next_id: AtomicU32::new(1),
        }
    }

    /// Define a query. `shaper` maps each result row to a `T`.
    pub fn query<T, F>(&self, sql: &str, shaper: F) -> Query<T>
    where
        F: Fn(&mut RowReader<'_, '_>) -> PgResult<T> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, sql, "query defined");

        Query {
            inner: Arc::new(QueryInner {
                pool: self.pool.clone(),
                id,
                sql: sql.to_string(),
                shaper: Box::new(shaper),
                inflight: Mutex::new(None),
            }),
        }
    }
}

/// A reusable, coalescing fetch of one prepared statement. Clones share the
/// statement and its in-flight state.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueryInner<T> {
    pool: PgPool,
    id: u32,
    sql: String,
    shaper: Box<Shaper<T>>,
    inflight: Mutex<Option<Arc<Inflight>>>,
}

/// Shared state of one round trip: the outcome cell, the connection parked
/// for reuse, and a count of everyone who will decode from the outcome. The
/// last decoder to finish returns the parked connection to the pool.
struct Inflight {
    fetch: Completion<Result<Bytes, Arc<PgError>>>,
    connection: Mutex<Option<PgConnection>>,
    awaiters: AtomicUsize,
}

impl<T: 'static> Query<T> {
    /// Fetch every row of the statement.
    ///
    /// If another fetch of this query is already on the wire, this call waits
    /// for that fetch's response instead of issuing its own; otherwise it
    /// acquires a connection and leads a round trip that concurrent callers
    /// may attach to.
    pub async fn fetch_all(&self) -> PgResult<Vec<T>> {
        // Attach under the slot lock so the awaiter count can only grow while
        // the fetch is still published.
        let joined = {
            let guard = self.inner.inflight.lock();
            guard.as_ref().map(|inflight| {
                inflight.awaiters.fetch_add(1, Ordering::Relaxed);
                Arc::clone(inflight)
            })
        };

        match joined {
            Some(inflight) => {
                trace!(id = self.inner.id, "joined in-flight fetch");
                let outcome = inflight.fetch.wait().await;
                self.decode_and_release(&inflight, outcome)
            }
            None => self.lead().await,
        }
    }

    async fn lead(&self) -> PgResult<Vec<T>> {
        let inflight = Arc::new(Inflight {
            fetch: Completion::new(),
            connection: Mutex::new(None),
            awaiters: AtomicUsize::new(1),
        });

        // Publish. A racing leader may already have published; overwriting is
        // the accepted outcome of the race, and its joiners are unaffected
        // because they hold their own Arc.
        *self.inner.inflight.lock() = Some(Arc::clone(&inflight));

        let result = match self.inner.pool.acquire().await {
            Ok(mut conn) => match self.exchange(&mut conn).await {
                Ok(bytes) => {
                    inflight.connection.lock().replace(conn);
                    Ok(bytes)
                }
                Err(e) => {
                    if e.connection_reusable() {
                        inflight.connection.lock().replace(conn);
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        // Unpublish before completing, so a caller arriving later starts a
        // fresh fetch instead of attaching to a finished one. Only clear the
        // slot if it still holds this fetch.
        {
            let mut guard = self.inner.inflight.lock();
            if guard
                .as_ref()
                .map_or(false, |current| Arc::ptr_eq(current, &inflight))
            {
                *guard = None;
            }
        }

        let outcome = match result {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(Arc::new(e)),
        };
        inflight.fetch.complete(outcome.clone());

        self.decode_and_release(&inflight, outcome)
    }

    /// Wire-level statement id, exposed for assertions.
    #[cfg(test)]
    pub(crate) fn statement_id(&self) -> u32 {
        self.inner.id
    }

    /// Drive one prepare-if-needed + execute round trip on `conn`.
    async fn exchange(&self, conn: &mut PgConnection) -> PgResult<Bytes> {
        conn.ensure_prepared(self.inner.id, &self.inner.sql).await?;
        conn.execute(self.inner.id).await
    }

    /// Decode this caller's rows from the shared outcome, then drop out of
    /// the awaiter count. Whoever drops it to zero returns the parked
    /// connection.
    fn decode_and_release(
        &self,
        inflight: &Inflight,
        outcome: Result<Bytes, Arc<PgError>>,
    ) -> PgResult<Vec<T>> {
        let rows = match outcome {
            Ok(bytes) => decode_rows(&bytes, &self.inner.shaper),
            Err(e) => Err(PgError::Shared(e)),
        };

        // A decode failure on an otherwise clean exchange means the socket
        // still holds unread response bytes; the parked connection must not
        // go back to the pool.
        if let Err(e) = &rows {
            if !e.connection_reusable() {
                drop(inflight.connection.lock().take());
            }
        }

        if inflight.awaiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(conn) = inflight.connection.lock().take() {
                self.inner.pool.release(conn);
            }
        }

        rows
    }
}

/// Walk the messages of an execute response and shape each DataRow.
///
/// BindComplete is acknowledged and skipped; any message this client does not
/// model (NoticeResponse, ParameterStatus, ...) is skipped by its declared
/// length. The walk ends at CommandComplete; a response that lacks one was
/// truncated and is reported as a protocol error.
fn decode_rows<T>(bytes: &[u8], shaper: &Shaper<T>) -> PgResult<Vec<T>> {
    let mut reader = MessageReader::new(bytes);
    let mut rows = Vec::new();

    while reader.remaining() > 0 {
        let (tag, body_len) = reader.read_message_header()?;

        match tag {
            backend::BIND_COMPLETE => {}
            backend::DATA_ROW => {
                let _column_count = reader.read_i16()?;
                let mut row = RowReader::new(&mut reader);
                rows.push(shaper(&mut row)?);
            }
            backend::COMMAND_COMPLETE => return Ok(rows),
            backend::ERROR_RESPONSE => {
                return Err(PgError::Server(reader.read_error_message()?))
            }
            _ => reader.skip(body_len)?,
        }
    }

    Err(PgError::Protocol(
        "response ended without CommandComplete".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PgConfig;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn data_row(columns: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(columns.len() as i16).to_be_bytes());
        for column in columns {
            body.extend_from_slice(&(column.len() as i32).to_be_bytes());
            body.extend_from_slice(column);
        }
        frame(b'D', &body)
    }

    fn pair_shaper(row: &mut RowReader<'_, '_>) -> PgResult<(i32, String)> {
        Ok((row.read_i32()?, row.read_str()?.to_owned()))
    }

    #[test]
    fn decodes_rows_until_command_complete() {
        let mut response = frame(b'2', &[]);
        response.extend(data_row(&[&1i32.to_be_bytes(), b"first"]));
        response.extend(data_row(&[&2i32.to_be_bytes(), b"second"]));
        response.extend(frame(b'C', b"SELECT 2\0"));
        response.extend(frame(b'Z', b"I"));

        let rows = decode_rows(&response, &pair_shaper).unwrap();
        assert_eq!(
            rows,
            vec![(1, "first".to_string()), (2, "second".to_string())]
        );
    }

    #[test]
    fn skips_unmodeled_messages_by_length() {
        // A ParameterStatus slipped in before BindComplete.
        let mut response = frame(b'S', b"TimeZone\0UTC\0");
        response.extend(frame(b'2', &[]));
        response.extend(data_row(&[&7i32.to_be_bytes(), b"only"]));
        response.extend(frame(b'C', b"SELECT 1\0"));

        let rows = decode_rows(&response, &pair_shaper).unwrap();
        assert_eq!(rows, vec![(7, "only".to_string())]);
    }

    #[test]
    fn empty_result_set_is_ok() {
        let mut response = frame(b'2', &[]);
        response.extend(frame(b'C', b"SELECT 0\0"));

        let rows = decode_rows(&response, &pair_shaper).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn error_response_surfaces_server_message() {
        let mut response = frame(b'2', &[]);
        response.extend(frame(b'E', b"Mrelation \"missing\" does not exist\0\0"));

        let err = decode_rows(&response, &pair_shaper).unwrap_err();
        match err {
            PgError::Server(msg) => assert_eq!(msg, "relation \"missing\" does not exist"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn factory_assigns_strictly_increasing_statement_ids() {
        let pool = PgPool::new(PgConfig::new("localhost", 5432, "db", "u", "p"), 1);
        let factory = QueryFactory::new(pool);

        let first = factory.query("SELECT 1", |row| row.read_i32());
        let second = factory.query("SELECT 2", |row| row.read_i32());
        let third = factory.query("SELECT 3", |row| row.read_i32());

        assert!(first.statement_id() < second.statement_id());
        assert!(second.statement_id() < third.statement_id());
        // Clones share the statement, not a fresh id.
        assert_eq!(third.clone().statement_id(), third.statement_id());
    }

    #[test]
    fn truncated_response_is_a_protocol_error() {
        let response = frame(b'2', &[]);
        assert!(matches!(
            decode_rows(&response, &pair_shaper),
            Err(PgError::Protocol(_))
        ));
    }
}
