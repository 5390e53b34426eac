//! Long-running operation registry.
//!
//! The echo service only initiates operations; tracking their lifecycle is
//! the job of a [`Waiter`]. [`InMemoryWaiter`] is the thread-safe default:
//! - Operations finish once their end time has passed
//! - A finished operation carries the requested error or response
//! - Operations can be polled by name
//! - Finished operations are dropped once their retention has passed

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::service::types::{Operation, OperationResult, WaitMetadata, WaitRequest};
use crate::status::Status;

/// Prefix of every operation name handed out by [`InMemoryWaiter`].
pub const OPERATION_PREFIX: &str = "operations/google.showcase.v1beta1.Echo/Wait/";

/// Creates and tracks long-running operations.
pub trait Waiter: Send + Sync {
    /// Start an operation for `request` and return its handle.
    fn wait(&self, request: WaitRequest) -> Result<Operation, Status>;

    /// Current state of a previously started operation.
    fn get_operation(&self, name: &str) -> Result<Operation, Status>;

    /// Forget operations that finished more than `retention` ago.
    /// Returns how many were removed.
    fn cleanup_finished(&self, retention: chrono::Duration) -> usize;
}

/// A registered operation
#[derive(Debug, Clone)]
struct PendingOperation {
    end_time: DateTime<Utc>,
    request: WaitRequest,
}

impl PendingOperation {
    fn is_done(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    fn snapshot(&self, name: &str, now: DateTime<Utc>) -> Operation {
        let done = self.is_done(now);
        let result = done.then(|| match &self.request.error {
            Some(error) if !error.code.is_ok() => OperationResult::Error(error.clone()),
            _ => OperationResult::Response(self.request.success.clone().unwrap_or_default()),
        });

        Operation {
            name: name.to_string(),
            done,
            metadata: WaitMetadata {
                end_time: self.end_time,
            },
            result,
        }
    }
}

/// Thread-safe in-memory operation registry
pub struct InMemoryWaiter {
    operations: RwLock<HashMap<String, PendingOperation>>,
    id_counter: AtomicU64,
}

impl InMemoryWaiter {
    pub fn new() -> Self {
        InMemoryWaiter {
            operations: RwLock::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
        }
    }

    fn next_name(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{OPERATION_PREFIX}{id}")
    }

    /// Absolute completion time: `end_time`, else now + `ttl`, else now.
    fn end_time(request: &WaitRequest, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(end_time) = request.end_time {
            return end_time;
        }
        request
            .ttl
            .and_then(|ttl| ttl.to_chrono())
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now)
    }
}

impl Default for InMemoryWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter for InMemoryWaiter {
    fn wait(&self, request: WaitRequest) -> Result<Operation, Status> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| Status::internal("operation registry unavailable"))?;

        let now = Utc::now();
        let name = self.next_name();
        let pending = PendingOperation {
            end_time: Self::end_time(&request, now),
            request,
        };
        let operation = pending.snapshot(&name, now);

        debug!(
            name = %name,
            end_time = %pending.end_time,
            registered = operations.len() + 1,
            "Operation started"
        );
        operations.insert(name, pending);
        Ok(operation)
    }

    fn get_operation(&self, name: &str) -> Result<Operation, Status> {
        let operations = self
            .operations
            .read()
            .map_err(|_| Status::internal("operation registry unavailable"))?;
        let pending = operations
            .get(name)
            .ok_or_else(|| Status::not_found(format!("Operation {name} not found")))?;

        let operation = pending.snapshot(name, Utc::now());
        trace!(name, done = operation.done, "Operation polled");
        Ok(operation)
    }

    fn cleanup_finished(&self, retention: chrono::Duration) -> usize {
        let Ok(mut operations) = self.operations.write() else {
            warn!("Operation registry poisoned, skipping cleanup");
            return 0;
        };

        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        let before = operations.len();
        operations.retain(|_, pending| pending.end_time > cutoff);

        let count = before - operations.len();
        if count > 0 {
            info!(count, remaining = operations.len(), "Cleaned up finished operations");
        }
        count
    }
}
