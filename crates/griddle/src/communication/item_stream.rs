use std::pin::Pin;
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::task::TaskResult;

/// # ResultStream
///
/// An asynchronous stream over the results of one task.
///
/// `ResultStream` implements the `Stream` trait from the `futures` crate, so
/// a transport layer can forward streamed tokens with the usual combinators.
/// The stream yields every result in generation order and ends right after
/// the final one.
///
/// ## Implementation Details
///
/// The stream is backed by the task's Tokio unbounded channel receiver:
/// - It never blocks the producer; the scheduler is never slowed by a slow reader
/// - It ends after the final result, or when the scheduler drops the channel
///
/// Dropping the stream before the final result cancels the task.
pub struct ResultStream {
    /// The underlying channel receiver
    receiver: mpsc::UnboundedReceiver<TaskResult>,
    cancel: CancellationToken,
    done: bool,
}

impl ResultStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<TaskResult>, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            cancel,
            done: false,
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

impl Stream for ResultStream {
    type Item = TaskResult;

    /// Attempts to pull out the next result of the task.
    ///
    /// Returns:
    /// - `Poll::Ready(Some(result))` if a result is available
    /// - `Poll::Ready(None)` once the final result has been yielded
    /// - `Poll::Pending` if no result is available yet
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(result)) => {
                if result.is_final {
                    self.done = true;
                }
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Payload;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_ends_after_final() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut stream = ResultStream::new(rx, cancel.clone());

        tx.send(TaskResult::partial(1, Payload::Token { token: 3, position: 0 })).unwrap();
        tx.send(TaskResult::partial(1, Payload::Token { token: 4, position: 1 })).unwrap();
        tx.send(TaskResult::cancelled(1)).unwrap();
        // Anything after the final result is never observed.
        tx.send(TaskResult::cancelled(1)).unwrap();

        let results: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(results.len(), 3);
        assert!(results[2].is_final);
        assert!(stream.next().await.is_none());
        drop(stream);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut stream = ResultStream::new(rx, CancellationToken::new());
        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_before_final_cancels() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut stream = ResultStream::new(rx, cancel.clone());
        tx.send(TaskResult::partial(1, Payload::Token { token: 3, position: 0 })).unwrap();
        assert!(!stream.next().await.unwrap().is_final);

        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
