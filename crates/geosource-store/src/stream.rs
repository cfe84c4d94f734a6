//! Producer tasks feeding lazy feature streams

use futures::{stream, StreamExt};
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::Feature;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::source::{ErrorSlot, FeatureStream};

/// Default number of decoded features buffered ahead of the consumer
pub const DEFAULT_BUFFER: usize = 256;

/// Sending half handed to blocking producers
pub struct BlockingSink {
    tx: mpsc::Sender<Feature>,
}

impl BlockingSink {
    /// Push one feature; returns false once the consumer dropped the stream
    pub fn send(&self, feature: Feature) -> bool {
        self.tx.blocking_send(feature).is_ok()
    }
}

/// Run a blocking scan on the blocking pool and stream what it sends.
///
/// A scan error ends the stream early; its text lands in `errors`.
pub fn spawn_blocking_scan<F>(buffer: usize, errors: ErrorSlot, scan: F) -> FeatureStream
where
    F: FnOnce(&BlockingSink) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::task::spawn_blocking(move || {
        let sink = BlockingSink { tx };
        if let Err(e) = scan(&sink) {
            tracing::warn!(error = %e, "feature scan aborted");
            *errors.write() = Some(e.to_string());
        }
    });
    ReceiverStream::new(rx).boxed()
}

/// Run an async producer on the runtime and stream what it sends
pub fn spawn_scan<F, Fut>(buffer: usize, errors: ErrorSlot, scan: F) -> FeatureStream
where
    F: FnOnce(mpsc::Sender<Feature>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let producer = scan(tx.clone());
    tokio::spawn(async move {
        if let Err(e) = producer.await {
            tracing::warn!(error = %e, "feature scan aborted");
            *errors.write() = Some(e.to_string());
        }
        // The stream ends only after the error is visible
        drop(tx);
    });
    ReceiverStream::new(rx).boxed()
}

/// Run blocking work (file or SQLite access) off the async workers
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| GeosourceError::Io(std::io::Error::other(format!("blocking task failed: {e}"))))?
}

/// Stream over already materialised features
pub fn from_vec(features: Vec<Feature>) -> FeatureStream {
    stream::iter(features).boxed()
}

/// Drain a stream, counting its features
pub async fn count(stream: FeatureStream) -> u64 {
    stream.fold(0u64, |n, _| async move { n + 1 }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_blocking_scan_streams_in_order() {
        let errors: ErrorSlot = Arc::new(RwLock::new(None));
        let stream = spawn_blocking_scan(2, errors.clone(), |sink| {
            for i in 1..=5i64 {
                if !sink.send(Feature::new(i, None)) {
                    break;
                }
            }
            Ok(())
        });
        let ids: Vec<_> = stream.map(|f| f.id).collect().await;
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], geosource_core::FeatureId::Integer(1));
        assert!(errors.read().is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let errors: ErrorSlot = Arc::new(RwLock::new(None));
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let mut stream = spawn_blocking_scan(1, errors, move |sink| {
            for i in 0..10_000i64 {
                if !sink.send(Feature::new(i, None)) {
                    break;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        assert!(stream.next().await.is_some());
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(produced.load(Ordering::SeqCst) < 10_000);
    }

    #[tokio::test]
    async fn test_scan_error_is_recorded() {
        let errors: ErrorSlot = Arc::new(RwLock::new(None));
        let stream = spawn_scan(4, errors.clone(), |tx| async move {
            let _ = tx.send(Feature::new(1i64, None)).await;
            Err(geosource_core::GeosourceError::Database("connection reset".into()))
        });
        assert_eq!(count(stream).await, 1);
        assert!(errors.read().as_deref().unwrap_or_default().contains("connection reset"));
    }
}
