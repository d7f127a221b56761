//! Pull-based text streaming.
//!
//! A [`TextStream`] is fed by a background task that drains a provider
//! stream into a bounded flume channel. The consumer pulls at its own pace;
//! when the buffer is full the producer waits. Dropping the stream cancels
//! the producer.

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::llm::{ChunkStream, LlmError};

/// Default number of chunks buffered ahead of the consumer.
pub const DEFAULT_BUFFER: usize = 32;

pub struct TextStream {
    rx: flume::Receiver<Result<String, LlmError>>,
    producer: JoinHandle<()>,
}

impl TextStream {
    /// Spawn a producer that forwards `chunks` into a bounded channel.
    pub fn spawn(mut chunks: ChunkStream, buffer: usize) -> Self {
        let (tx, rx) = flume::bounded(buffer.max(1));
        let producer = tokio::spawn(async move {
            while let Some(item) = chunks.next().await {
                let failed = item.is_err();
                if tx.send_async(item).await.is_err() {
                    tracing::debug!("text stream consumer went away, stopping producer");
                    return;
                }
                if failed {
                    return;
                }
            }
        });
        Self { rx, producer }
    }

    /// Next chunk, or `None` once the provider stream is finished.
    pub async fn recv(&mut self) -> Option<Result<String, LlmError>> {
        self.rx.recv_async().await.ok()
    }

    /// Drain the remaining chunks into one string.
    pub async fn collect(mut self) -> Result<String, LlmError> {
        let mut out = String::new();
        while let Some(chunk) = self.recv().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(items: Vec<Result<String, LlmError>>) -> ChunkStream {
        Box::pin(futures_util::stream::iter(items))
    }

    #[tokio::test]
    async fn collects_chunks_in_order() {
        let stream = TextStream::spawn(
            chunks(vec![Ok("a".into()), Ok("b".into()), Ok("c".into())]),
            1,
        );
        assert_eq!(stream.collect().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn error_ends_the_stream() {
        let mut stream = TextStream::spawn(
            chunks(vec![
                Ok("a".into()),
                Err(LlmError::Timeout),
                Ok("never".into()),
            ]),
            4,
        );
        assert_eq!(stream.recv().await.unwrap().unwrap(), "a");
        assert!(matches!(stream.recv().await, Some(Err(LlmError::Timeout))));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn producer_is_bounded_and_stops_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let endless: ChunkStream = Box::pin(futures_util::stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("x".to_string())
        }));

        let mut stream = TextStream::spawn(endless, 2);
        assert_eq!(stream.recv().await.unwrap().unwrap(), "x");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before_drop = produced.load(Ordering::SeqCst);
        assert!(before_drop <= 5, "producer ran ahead: {before_drop}");

        drop(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(produced.load(Ordering::SeqCst) <= before_drop + 1);
    }
}
