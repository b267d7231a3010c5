//! Bounded-concurrency batch execution.
//!
//! Items are split into chunks of the requested (or recommended) batch size.
//! Each chunk fans out into one spawned task per item; every task acquires a
//! permit from the processor-wide semaphore before invoking the unit of work,
//! so at most `max_concurrent` invocations are ever in flight. Results are
//! collected by awaiting the join handles in input order.

use super::sizing::{BatchSizer, PerformanceSample};
use super::{BatchResult, ProcessingResult, ProcessingState, WorkError};
use crate::config::BatchConfig;
use crate::constants::batch_sizing::BREAKER_SUCCESS_RATE;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ExponentialBackoff};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a spawned item task needs, cheap to clone
#[derive(Debug, Clone)]
struct ItemRunner {
    semaphore: Arc<Semaphore>,
    circuit_breaker: Arc<CircuitBreaker>,
    backoff: ExponentialBackoff,
    retry_attempts: u32,
}

impl ItemRunner {
    async fn run<T, R, F, Fut>(
        &self,
        item: T,
        unit_of_work: Arc<F>,
        cancel: CancellationToken,
    ) -> ProcessingResult<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, WorkError>>,
    {
        if cancel.is_cancelled() {
            return ProcessingResult::cancelled();
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ProcessingResult::cancelled(),
            permit = self.semaphore.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return ProcessingResult::failed(
                WorkError::fatal("processor semaphore closed"),
                Duration::ZERO,
                0,
            );
        };

        if cancel.is_cancelled() {
            return ProcessingResult::cancelled();
        }

        if !self.circuit_breaker.should_allow() {
            return ProcessingResult::failed(
                WorkError::retryable("batch circuit breaker is open"),
                Duration::ZERO,
                0,
            );
        }

        let started = Instant::now();
        let mut retry_count = 0;
        loop {
            match unit_of_work(item.clone()).await {
                Ok(data) => return ProcessingResult::completed(data, started.elapsed(), retry_count),
                Err(error) => {
                    let exhausted = retry_count + 1 >= self.retry_attempts;
                    if exhausted || !error.is_retryable() || cancel.is_cancelled() {
                        return ProcessingResult::failed(error, started.elapsed(), retry_count);
                    }
                    let delay = self.backoff.delay_for(retry_count);
                    retry_count += 1;
                    debug!(
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "🔄 Retrying unit of work"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Snapshot of processor activity
#[derive(Debug, Clone, Serialize)]
pub struct BatchProcessorStats {
    pub batches_processed: u64,
    pub items_processed: u64,
    pub recommended_batch_size: usize,
    pub available_permits: usize,
    pub circuit_state: CircuitState,
    pub history: Vec<PerformanceSample>,
}

/// Adaptive batch processor
///
/// One instance owns one semaphore and one circuit breaker; share the
/// instance (e.g. behind an `Arc`) to share the concurrency bound.
#[derive(Debug)]
pub struct AdaptiveBatchProcessor {
    config: BatchConfig,
    runner: ItemRunner,
    sizer: Mutex<BatchSizer>,
    batches_processed: AtomicU64,
    items_processed: AtomicU64,
}

impl AdaptiveBatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            retry_attempts = config.retry_attempts,
            circuit_breaker_threshold = config.circuit_breaker_threshold,
            "⚙️ Adaptive batch processor initialized"
        );

        let runner = ItemRunner {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            circuit_breaker: Arc::new(CircuitBreaker::new(
                "batch_processor".to_string(),
                CircuitBreakerConfig::for_batch(&config),
            )),
            backoff: ExponentialBackoff::new(config.retry_base_delay(), config.retry_max_delay()),
            retry_attempts: config.retry_attempts.max(1),
        };

        Self {
            sizer: Mutex::new(BatchSizer::new(
                config.history_window,
                config.default_batch_size,
            )),
            config,
            runner,
            batches_processed: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
        }
    }

    /// Run `unit_of_work` over every item; results are index-aligned with `items`
    pub async fn process_batch<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        batch_size: Option<usize>,
    ) -> BatchResult<R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WorkError>> + Send + 'static,
    {
        self.process_batch_cancellable(items, unit_of_work, batch_size, &CancellationToken::new())
            .await
    }

    /// As [`process_batch`](Self::process_batch), observing `cancel`
    ///
    /// Items that have not started when `cancel` fires end `Cancelled`;
    /// in-flight invocations run to completion and keep their result.
    pub async fn process_batch_cancellable<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> BatchResult<R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WorkError>> + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let chunk_size = batch_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| self.recommended_batch_size());
        let unit_of_work = Arc::new(unit_of_work);

        debug!(total_items = total, chunk_size, "📦 Processing batch");

        let mut results: Vec<ProcessingResult<R>> = Vec::with_capacity(total);
        let mut remaining = items.into_iter();
        loop {
            let chunk: Vec<T> = remaining.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }

            let handles: Vec<_> = chunk
                .into_iter()
                .map(|item| {
                    let runner = self.runner.clone();
                    let unit_of_work = Arc::clone(&unit_of_work);
                    let cancel = cancel.clone();
                    tokio::spawn(async move { runner.run(item, unit_of_work, cancel).await })
                })
                .collect();

            let mut chunk_results = Vec::with_capacity(handles.len());
            for handle in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => ProcessingResult::failed(
                        WorkError::fatal(format!("unit of work aborted: {join_error}")),
                        Duration::ZERO,
                        0,
                    ),
                };
                chunk_results.push(result);
            }

            self.update_circuit_breaker(&chunk_results);
            results.extend(chunk_results);
        }

        let batch = BatchResult::from_results(results, started.elapsed());
        self.record_performance(&batch);

        info!(
            total_items = batch.total_items(),
            successful_items = batch.successful_items(),
            cancelled_items = batch.cancelled_items(),
            success_rate = batch.success_rate(),
            throughput = batch.throughput(),
            "✅ Batch complete"
        );
        batch
    }

    /// Streaming variant: yields `(input_index, result)` in completion order
    ///
    /// Memory stays bounded by `max_concurrent` outstanding items. Streamed
    /// runs do not feed the sizing history or the batch-level breaker update.
    pub fn process_stream<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        unit_of_work: F,
        cancel: CancellationToken,
    ) -> impl Stream<Item = (usize, ProcessingResult<R>)> + Send + 'static
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WorkError>> + Send + 'static,
    {
        let runner = self.runner.clone();
        let unit_of_work = Arc::new(unit_of_work);
        let width = self.config.max_concurrent.max(1);

        stream::iter(items.into_iter().enumerate())
            .map(move |(index, item)| {
                let runner = runner.clone();
                let unit_of_work = Arc::clone(&unit_of_work);
                let cancel = cancel.clone();
                async move { (index, runner.run(item, unit_of_work, cancel).await) }
            })
            .buffer_unordered(width)
    }

    /// Success rate above 0.8 records a success, anything else a failure.
    /// Fully cancelled chunks leave the breaker untouched.
    fn update_circuit_breaker<R>(&self, chunk: &[ProcessingResult<R>]) {
        let attempted: Vec<_> = chunk
            .iter()
            .filter(|r| r.state != ProcessingState::Cancelled)
            .collect();
        if attempted.is_empty() {
            return;
        }

        let successes = attempted.iter().filter(|r| r.success).count();
        let success_rate = successes as f64 / attempted.len() as f64;

        let breaker = &self.runner.circuit_breaker;
        if success_rate > BREAKER_SUCCESS_RATE {
            breaker.record_success();
        } else {
            breaker.record_failure();
            if breaker.is_open() {
                warn!(
                    success_rate,
                    consecutive_failures = breaker.consecutive_failures(),
                    "🔴 Batch circuit breaker open"
                );
            }
        }
    }

    fn record_performance<R>(&self, batch: &BatchResult<R>) {
        if batch.total_items() == 0 {
            return;
        }
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.items_processed
            .fetch_add(batch.total_items() as u64, Ordering::Relaxed);

        self.sizer.lock().record(PerformanceSample {
            total_items: batch.total_items(),
            successful_items: batch.successful_items(),
            duration: batch.total_duration(),
            throughput: batch.throughput(),
            success_rate: batch.success_rate(),
            recorded_at: Utc::now(),
        });
    }

    pub fn recommended_batch_size(&self) -> usize {
        self.sizer.lock().recommend()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.runner.circuit_breaker
    }

    pub fn stats(&self) -> BatchProcessorStats {
        let sizer = self.sizer.lock();
        BatchProcessorStats {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            recommended_batch_size: sizer.recommend(),
            available_permits: self.runner.semaphore.available_permits(),
            circuit_state: self.runner.circuit_breaker.state(),
            history: sizer.history(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> BatchConfig {
        BatchConfig {
            max_concurrent: 4,
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            circuit_breaker_threshold: 2,
            circuit_breaker_timeout_ms: 60_000,
            default_batch_size: 10,
            history_window: 10,
        }
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let items: Vec<u64> = (0..20).collect();

        let batch = processor
            .process_batch(
                items,
                |n: u64| async move {
                    // Later items finish first
                    tokio::time::sleep(Duration::from_millis(20 - n)).await;
                    Ok::<_, WorkError>(n * 2)
                },
                Some(20),
            )
            .await;

        let values: Vec<u64> = batch.results().iter().filter_map(|r| r.data).collect();
        assert_eq!(values, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(batch.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let batch = processor
            .process_batch(
                vec![()],
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(WorkError::retryable("flaky"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                None,
            )
            .await;

        let result = &batch.results()[0];
        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let batch = processor
            .process_batch(
                vec![1],
                move |_: i32| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(WorkError::fatal("malformed")) }
                },
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batch.results()[0].state, ProcessingState::Failed);
        assert_eq!(batch.results()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_failed_batches_and_short_circuits() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let failing = |_: u8| async { Err::<(), _>(WorkError::fatal("down")) };

        processor.process_batch(vec![1, 2], failing, None).await;
        processor.process_batch(vec![1, 2], failing, None).await;
        assert_eq!(processor.circuit_breaker().state(), CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let batch = processor
            .process_batch(
                vec![1u8, 2, 3],
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, WorkError>(()) }
                },
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(batch.successful_items(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_marks_items_cancelled() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = processor
            .process_batch_cancellable(
                vec![1, 2, 3],
                |n: i32| async move { Ok::<_, WorkError>(n) },
                None,
                &cancel,
            )
            .await;

        assert_eq!(batch.cancelled_items(), 3);
        assert!(batch
            .results()
            .iter()
            .all(|r| r.state == ProcessingState::Cancelled));
        // Cancellation is not a failure signal for the breaker
        assert_eq!(processor.circuit_breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_stream_yields_every_index() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        let stream = processor.process_stream(
            (0..12).collect::<Vec<u32>>(),
            |n| async move { Ok::<_, WorkError>(n + 1) },
            CancellationToken::new(),
        );

        let mut seen: Vec<(usize, u32)> = stream
            .map(|(index, result)| (index, result.data.unwrap_or_default()))
            .collect()
            .await;
        seen.sort();
        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|(index, value)| *value as usize == index + 1));
    }

    #[tokio::test]
    async fn test_history_drives_recommendation() {
        let processor = AdaptiveBatchProcessor::new(fast_config());
        assert_eq!(processor.recommended_batch_size(), 10);

        processor
            .process_batch(
                (0..100).collect::<Vec<u32>>(),
                |n| async move { Ok::<_, WorkError>(n) },
                Some(50),
            )
            .await;

        assert_eq!(processor.recommended_batch_size(), 20);
        let stats = processor.stats();
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.items_processed, 100);
        assert_eq!(stats.available_permits, 4);
    }
}
