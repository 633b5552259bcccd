//! # Bounded Connection Pool
//!
//! SQLite's `Connection` is `!Sync`, so it cannot be shared across tasks.
//! Instead each pooled connection is owned by a dedicated OS thread, and async
//! callers hand it closures over a channel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Async Tasks                            │
//! │   commit ─┐                                   ┌─ poll        │
//! │   query  ─┼──── tokio::sync::mpsc (bounded) ──┼─ ack         │
//! │   stats  ─┘                                   └─ project     │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │  Arc<Mutex<Receiver>>
//!              ┌─────────────────┼─────────────────┐
//!              ▼                 ▼                 ▼
//!       ┌────────────┐    ┌────────────┐    ┌────────────┐
//!       │ conn-0     │    │ conn-1     │    │ conn-N     │
//!       │ Connection │    │ Connection │    │ Connection │
//!       └────────────┘    └────────────┘    └────────────┘
//! ```
//!
//! Threads compete for the shared receiver, so a job runs on whichever
//! connection frees up first. A job owns its connection only for the duration
//! of the closure; the connection is released on success, error and panic
//! alike.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::stream::{RowSink, RowStream};

/// Capacity of the job queue shared by all connection threads.
const JOB_QUEUE_SIZE: usize = 4096;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum PoolMessage {
    Run(Job),
    Shutdown,
}

/// A fixed-size pool of SQLite connections, each on its own thread.
///
/// `Clone` is cheap; all clones share the same threads.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    tx: mpsc::Sender<PoolMessage>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    size: usize,
    stream_buffer: usize,
}

impl ConnectionPool {
    /// Opens `size` connections to `path` and starts one thread per connection.
    ///
    /// All connections are opened before any thread starts, so a bad path or
    /// a locked file fails here rather than on first use.
    pub fn open(
        path: impl AsRef<Path>,
        size: usize,
        busy_timeout: Duration,
        stream_buffer: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let size = size.max(1);

        let connections = (0..size)
            .map(|_| Database::open(path, busy_timeout).map(Database::into_connection))
            .collect::<Result<Vec<_>>>()?;

        let (tx, rx) = mpsc::channel(JOB_QUEUE_SIZE);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for (i, conn) in connections.into_iter().enumerate() {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("tideline-conn-{i}"))
                .spawn(move || worker_loop(conn, rx))
                .map_err(|e| Error::Schema(format!("failed to spawn connection thread: {e}")))?;
            handles.push(handle);
        }

        info!(path = %path.display(), size, "connection pool started");

        Ok(Self {
            inner: Arc::new(PoolInner {
                tx,
                handles: Mutex::new(handles),
                closed: AtomicBool::new(false),
                size,
                stream_buffer: stream_buffer.max(1),
            }),
        })
    }

    /// Number of pooled connections.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Runs `f` on the next free connection and returns its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = response_tx.send(f(conn));
        });

        self.submit(job).await?;

        // A dropped sender means the job panicked or the pool shut down first.
        response_rx.await.map_err(|_| Error::PoolClosed)?
    }

    /// Runs `f` on the next free connection, streaming every row it pushes
    /// into the returned [`RowStream`].
    ///
    /// The connection stays checked out until `f` returns, which happens
    /// when the rows are exhausted or the stream is dropped.
    pub async fn stream<T, F>(&self, f: F) -> Result<RowStream<T>>
    where
        F: FnOnce(&mut Connection, &RowSink<T>) -> Result<()> + Send + 'static,
        T: Send + 'static,
    {
        let (stream, sink) = RowStream::channel(self.inner.stream_buffer);
        let job: Job = Box::new(move |conn| {
            match catch_unwind(AssertUnwindSafe(|| f(conn, &sink))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => sink.fail(err),
                Err(_) => sink.fail(Error::Schema("streaming query panicked".to_string())),
            }
        });

        self.submit(job).await?;
        Ok(stream)
    }

    async fn submit(&self, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        self.inner
            .tx
            .send(PoolMessage::Run(job))
            .await
            .map_err(|_| Error::PoolClosed)
    }

    /// Stops accepting work, lets queued jobs finish, and joins every
    /// connection thread.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for _ in 0..self.inner.size {
            if self.inner.tx.send(PoolMessage::Shutdown).await.is_err() {
                break;
            }
        }

        let handles = match self.inner.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;

        if joined.is_err() {
            error!("failed to join connection threads");
        }
        info!(size = self.inner.size, "connection pool stopped");
    }
}

fn worker_loop(mut conn: Connection, rx: Arc<Mutex<mpsc::Receiver<PoolMessage>>>) {
    loop {
        let message = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.blocking_recv()
        };

        match message {
            Some(PoolMessage::Run(job)) => {
                if catch_unwind(AssertUnwindSafe(|| job(&mut conn))).is_err() {
                    error!(thread = ?thread::current().name(), "pooled job panicked");
                }
            }
            Some(PoolMessage::Shutdown) | None => break,
        }
    }
    debug!(thread = ?thread::current().name(), "connection thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn temp_pool(size: usize) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("pool.db"), size, Duration::from_secs(5), 4)
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn runs_jobs_and_returns_results() {
        let (_dir, pool) = temp_pool(2);
        let value: i64 = pool
            .run(|conn| Ok(conn.query_row("SELECT 40 + 2", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(value, 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn errors_release_the_connection() {
        let (_dir, pool) = temp_pool(1);
        let err = pool
            .run(|conn| Ok(conn.execute("SELECT * FROM missing", [])?))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));

        // Same single connection still serves the next job.
        let ok: i64 = pool
            .run(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn panics_release_the_connection() {
        let (_dir, pool) = temp_pool(1);
        let result: Result<()> = pool.run(|_| panic!("boom")).await;
        assert!(matches!(result, Err(Error::PoolClosed)));

        let ok = pool.run(|_| Ok(7)).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn streams_more_rows_than_the_buffer() {
        let (_dir, pool) = temp_pool(1);
        let rows: Vec<i64> = pool
            .stream(|_, sink| {
                for i in 0..20 {
                    if !sink.push(i) {
                        break;
                    }
                }
                Ok(())
            })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stream_surfaces_errors() {
        let (_dir, pool) = temp_pool(1);
        let result: Result<Vec<i64>> = pool
            .stream(|_, sink| {
                sink.push(1);
                Err(Error::InvalidArgument("bad".into()))
            })
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let (_dir, pool) = temp_pool(2);
        let clone = pool.clone();
        pool.shutdown().await;
        assert!(matches!(clone.run(|_| Ok(())).await, Err(Error::PoolClosed)));
    }
}
