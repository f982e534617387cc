//! Fixed-size worker pool for streaming ingestion.
//!
//! Each worker owns one queue. Events are routed by trace id so the updates
//! for one trace are delivered in order.

use crate::ingest::{with_retry, Ingestor, StreamEvent};
use spanwise_config::{Backpressure, RetryConfig, StreamingConfig};
use spanwise_core::TraceError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum Queue {
    Bounded(mpsc::Sender<StreamEvent>),
    Unbounded(mpsc::UnboundedSender<StreamEvent>),
}

enum Receiver {
    Bounded(mpsc::Receiver<StreamEvent>),
    Unbounded(mpsc::UnboundedReceiver<StreamEvent>),
}

impl Receiver {
    async fn recv(&mut self) -> Option<StreamEvent> {
        match self {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Pool of workers delivering stream events to a sink with retry.
pub struct StreamingPool {
    queues: Mutex<Vec<Queue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backpressure: Backpressure,
    in_flight: Arc<InFlight>,
    dropped: AtomicU64,
}

impl StreamingPool {
    /// Spawns the workers. Must be called from within a tokio runtime.
    pub fn start(
        config: &StreamingConfig,
        retry: RetryConfig,
        sink: Arc<dyn Ingestor>,
    ) -> Result<Self, TraceError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TraceError::InvalidState(format!("streaming needs a tokio runtime: {e}")))?;

        let workers = config.workers.max(1);
        let per_worker = (config.queue_capacity / workers).max(1);
        let in_flight = Arc::new(InFlight::default());

        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (queue, rx) = match config.backpressure {
                Backpressure::Grow => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    (Queue::Unbounded(tx), Receiver::Unbounded(rx))
                }
                Backpressure::Block | Backpressure::Drop => {
                    let (tx, rx) = mpsc::channel(per_worker);
                    (Queue::Bounded(tx), Receiver::Bounded(rx))
                }
            };
            queues.push(queue);
            handles.push(runtime.spawn(run_worker(
                worker,
                rx,
                retry.clone(),
                sink.clone(),
                in_flight.clone(),
            )));
        }

        tracing::debug!(workers, per_worker, backpressure = ?config.backpressure, "Streaming pool started");

        Ok(Self {
            queues: Mutex::new(queues),
            workers: Mutex::new(handles),
            backpressure: config.backpressure,
            in_flight,
            dropped: AtomicU64::new(0),
        })
    }

    fn queue_for(&self, event: &StreamEvent) -> Option<Queue> {
        let Ok(queues) = self.queues.lock() else { return None };
        if queues.is_empty() {
            return None;
        }
        let index = (event.routing_key().as_u128() % queues.len() as u128) as usize;
        queues.get(index).cloned()
    }

    /// Queues an event. Returns false when it was dropped.
    pub async fn submit(&self, event: StreamEvent) -> bool {
        let Some(queue) = self.queue_for(&event) else {
            tracing::warn!(event = event.name(), "Streaming pool is shut down, dropping event");
            return false;
        };

        self.in_flight.begin();
        let queued = match (queue, self.backpressure) {
            (Queue::Unbounded(tx), _) => tx.send(event).is_ok(),
            (Queue::Bounded(tx), Backpressure::Drop) => match tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event = event.name(), "Streaming queue full, dropping event");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            (Queue::Bounded(tx), _) => tx.send(event).await.is_ok(),
        };
        if !queued {
            self.in_flight.end();
        }
        queued
    }

    /// Waits until every queued event has been handled.
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Closes the queues and waits for the workers to drain them.
    pub async fn shutdown(&self) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.clear();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Streaming worker failed: {}", e);
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    mut rx: Receiver,
    retry: RetryConfig,
    sink: Arc<dyn Ingestor>,
    in_flight: Arc<InFlight>,
) {
    while let Some(event) = rx.recv().await {
        let name = event.name();
        if let Err(e) = with_retry(&retry, name, || sink.send_event(&event)).await {
            tracing::warn!(worker, event = name, error = %e, "Failed to deliver stream event");
        }
        in_flight.end();
    }
    tracing::debug!(worker, "Streaming worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemorySink;
    use crate::span::Trace;

    fn event_for(trace: &Trace, n: u64) -> StreamEvent {
        StreamEvent::StepUpdated {
            trace_id: trace.id(),
            step_id: trace.id(),
            output: Some(n.to_string()),
            status_code: None,
            duration_ns: Some(n),
            is_complete: false,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_pool_delivers_in_order_per_trace() {
        let sink = Arc::new(MemorySink::new());
        let pool = StreamingPool::start(&StreamingConfig::default(), fast_retry(), sink.clone()).unwrap();

        let trace = Trace::new("q");
        for n in 0..20 {
            assert!(pool.submit(event_for(&trace, n)).await);
        }
        pool.wait_idle().await;

        let durations: Vec<u64> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::StepUpdated { duration_ns, .. } => duration_ns,
                _ => None,
            })
            .collect();
        assert_eq!(durations, (0..20).collect::<Vec<_>>());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_retries_failed_delivery() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(1);
        let pool = StreamingPool::start(&StreamingConfig::default(), fast_retry(), sink.clone()).unwrap();

        pool.submit(event_for(&Trace::new("q"), 1)).await;
        pool.wait_idle().await;

        assert_eq!(sink.events().len(), 1);
        assert_eq!(pool.pending(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let sink = Arc::new(MemorySink::new());
        let pool = StreamingPool::start(&StreamingConfig::default(), fast_retry(), sink.clone()).unwrap();
        pool.shutdown().await;

        assert!(!pool.submit(event_for(&Trace::new("q"), 1)).await);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_grow_policy_accepts_bursts() {
        let sink = Arc::new(MemorySink::new());
        let config = StreamingConfig {
            workers: 1,
            queue_capacity: 1,
            backpressure: Backpressure::Grow,
        };
        let pool = StreamingPool::start(&config, fast_retry(), sink.clone()).unwrap();

        let trace = Trace::new("q");
        for n in 0..50 {
            assert!(pool.submit(event_for(&trace, n)).await);
        }
        pool.wait_idle().await;
        assert_eq!(sink.events().len(), 50);
        assert_eq!(pool.dropped(), 0);
        pool.shutdown().await;
    }
}
