//! # Work Handler
//!
//! The caller-supplied unit of work the pipeline dispatches each record to.

use crate::batch::WorkError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;

/// Executes one record on a selected worker
///
/// Retries re-invoke `handle` with the same record, so implementations must
/// tolerate repeated calls. Return [`WorkError::WorkerFailure`] when the worker
/// itself is at fault; that failure is routed to failover while the record is
/// reported Failed.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, worker_id: &str, record: Value) -> Result<Value, WorkError>;

    fn name(&self) -> &str {
        "work_handler"
    }
}

/// Adapts an async closure into a [`WorkHandler`]
pub struct FnWorkHandler<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnWorkHandler<F, Fut>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

impl<F, Fut> std::fmt::Debug for FnWorkHandler<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnWorkHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> WorkHandler for FnWorkHandler<F, Fut>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkError>> + Send,
{
    async fn handle(&self, worker_id: &str, record: Value) -> Result<Value, WorkError> {
        (self.func)(worker_id.to_string(), record).await
    }

    fn name(&self) -> &str {
        "fn_handler"
    }
}

/// Returns each record unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughHandler;

#[async_trait]
impl WorkHandler for PassThroughHandler {
    async fn handle(&self, _worker_id: &str, record: Value) -> Result<Value, WorkError> {
        Ok(record)
    }

    fn name(&self) -> &str {
        "pass_through"
    }
}
