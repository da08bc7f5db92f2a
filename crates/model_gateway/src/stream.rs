//! Consumer side of a streamed completion.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use knowledge_hub_core::StreamChunk;

/// Bounded buffer between the provider task and the consumer.
pub const STREAM_BUFFER: usize = 32;

/// Stream of [`StreamChunk`]s ending with `Done` or `Error`.
///
/// Cancelling, or dropping the stream, stops the producer task and the
/// upstream provider stream. Nothing is yielded after cancellation.
pub struct ChunkStream {
    inner: ReceiverStream<StreamChunk>,
    cancel: CancellationToken,
}

impl ChunkStream {
    /// Channel pair: the sender goes to the producer task.
    pub fn channel(cancel: CancellationToken) -> (mpsc::Sender<StreamChunk>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
                cancel,
            },
        )
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ChunkStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_nothing_after_cancel() {
        let (tx, mut stream) = ChunkStream::channel(CancellationToken::new());
        tx.send(StreamChunk::delta("one")).await.unwrap();
        tx.send(StreamChunk::delta("two")).await.unwrap();

        assert_eq!(stream.next().await, Some(StreamChunk::delta("one")));
        stream.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_cancels_token() {
        let token = CancellationToken::new();
        let (_tx, stream) = ChunkStream::channel(token.clone());
        drop(stream);
        assert!(token.is_cancelled());
    }
}
