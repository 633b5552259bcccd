//! Lazy query results.
//!
//! A [`RowStream`] is the async side of a query running on a pooled
//! connection. Rows arrive as the connection thread finds them; the bounded
//! buffer between the two applies backpressure, so a slow consumer never
//! makes the query materialize its whole result.
//!
//! Streams are finite and not restartable: once exhausted, a new query must
//! be issued. Dropping a stream early cancels the query at its next row.
//!
//! A stream holds a pooled connection until it finishes. With a pool of one
//! connection, drain or drop the stream before issuing the next operation.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Producer half, used on the connection thread.
pub struct RowSink<T> {
    tx: mpsc::Sender<Result<T>>,
}

impl<T> RowSink<T> {
    /// Sends one row, blocking while the buffer is full.
    ///
    /// Returns `false` once the stream has been dropped; the producer should
    /// stop scanning.
    pub fn push(&self, row: T) -> bool {
        self.tx.blocking_send(Ok(row)).is_ok()
    }

    pub(crate) fn fail(&self, err: Error) {
        let _ = self.tx.blocking_send(Err(err));
    }
}

/// Consumer half: a `futures::Stream` of `Result<T>`.
///
/// An `Err` item is always the last item.
pub struct RowStream<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> RowStream<T> {
    pub(crate) fn channel(buffer: usize) -> (Self, RowSink<T>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { rx }, RowSink { tx })
    }
}

impl<T> Stream for RowStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn dropping_the_stream_stops_the_producer() {
        let (stream, sink) = RowStream::<u32>::channel(1);
        drop(stream);

        let pushed = tokio::task::spawn_blocking(move || sink.push(1)).await.unwrap();
        assert!(!pushed);
    }

    #[tokio::test]
    async fn ends_when_the_producer_finishes() {
        let (mut stream, sink) = RowStream::channel(8);
        tokio::task::spawn_blocking(move || {
            sink.push("a");
            sink.push("b");
        })
        .await
        .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        assert!(stream.next().await.is_none());
    }
}
