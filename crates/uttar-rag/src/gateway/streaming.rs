//! Streaming token delivery for answer generation.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Default channel capacity between a producing gateway task and the consumer.
pub const STREAM_BUFFER: usize = 100;

/// Incremental text chunks from a streaming completion call.
pub struct TokenStream {
    receiver: mpsc::Receiver<String>,
}

impl TokenStream {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Create a paired sender/stream with the default buffer.
    pub fn channel() -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (tx, Self::new(rx))
    }

    /// Next chunk, `None` once the producer is done.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Drain the stream into one string.
    pub async fn collect(mut self) -> String {
        let mut result = String::new();
        while let Some(chunk) = self.next().await {
            result.push_str(&chunk);
        }
        result
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_joins_chunks() {
        let (tx, stream) = TokenStream::channel();
        tokio::spawn(async move {
            for chunk in ["Hello", ", ", "world"] {
                tx.send(chunk.to_string()).await.ok();
            }
        });
        assert_eq!(stream.collect().await, "Hello, world");
    }

    #[tokio::test]
    async fn test_next_ends_after_sender_drop() {
        let (tx, mut stream) = TokenStream::channel();
        tx.send("one".to_string()).await.ok();
        drop(tx);

        assert_eq!(stream.next().await.as_deref(), Some("one"));
        assert_eq!(stream.next().await, None);
    }
}
