//! Dispatch slots, the bounded wait queue, and deadlines.
//!
//! Every tool call must hold three slots at once: global, per-tool, and
//! per-connection. A request that cannot take all three immediately
//! parks in a bounded FIFO of depth `Q`; a full queue rejects with
//! backpressure right away. Waiting is bounded by the request deadline
//! and the request's cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::LimitsConfig;
use crate::error::BridgeError;
use crate::session::Connection;

/// Slots held for the duration of one tool call.
///
/// Dropping the slot releases all three permits.
#[derive(Debug)]
pub struct DispatchSlot {
    _global: OwnedSemaphorePermit,
    _tool: Option<OwnedSemaphorePermit>,
    _connection: OwnedSemaphorePermit,
}

/// The concurrency controller.
pub struct DispatchLimits {
    global: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    per_tool: DashMap<String, Arc<Semaphore>>,
    config: LimitsConfig,
}

impl DispatchLimits {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.global_inflight)),
            queue: Arc::new(Semaphore::new(config.queue_depth.max(1))),
            per_tool: DashMap::new(),
            config,
        }
    }

    /// Free global slots (for tests and health reporting).
    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }

    /// Compute a request's deadline.
    ///
    /// The effective timeout is the minimum of the configured default,
    /// the per-tool override, and the client-requested timeout.
    pub fn compute_deadline(
        &self,
        tool: Option<&str>,
        client_timeout: Option<Duration>,
    ) -> (Instant, Duration) {
        let mut timeout = self.config.request_timeout;
        if let Some(tool) = tool {
            if let Some(per_tool) = self.config.per_tool_timeout.get(tool) {
                timeout = timeout.min(*per_tool);
            }
        }
        if let Some(client) = client_timeout {
            timeout = timeout.min(client);
        }
        (Instant::now() + timeout, timeout)
    }

    /// Hard ceiling after which an uncooperative tool's slot is released.
    pub fn hard_kill_after(&self, timeout: Duration) -> Duration {
        timeout * self.config.hard_kill_factor
    }

    fn tool_semaphore(&self, tool: &str) -> Arc<Semaphore> {
        self.per_tool
            .entry(tool.to_string())
            .or_insert_with(|| {
                let limit = self
                    .config
                    .per_tool
                    .get(tool)
                    .copied()
                    .unwrap_or(self.config.per_tool_default);
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    /// Acquire the three slots for a tool call.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ServerBusy`] when the slots are taken and the
    ///   wait queue is full
    /// - [`BridgeError::Timeout`] when the deadline passes while queued
    /// - [`BridgeError::Cancelled`] when `cancel` fires while queued
    pub async fn acquire(
        &self,
        tool: Option<&str>,
        connection: &Arc<Connection>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DispatchSlot, BridgeError> {
        let deadline_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        let tool_semaphore = tool.map(|name| self.tool_semaphore(name));

        if let Some(slot) = self.try_acquire(tool_semaphore.clone(), connection) {
            return Ok(slot);
        }

        // Park in the bounded queue; a full queue rejects immediately.
        let queued = match self.queue.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(BridgeError::ServerBusy),
        };

        let global = self.global.clone();
        let connection_slots = connection.inflight.clone();
        let acquire_all = async move {
            let global = global
                .acquire_owned()
                .await
                .expect("global semaphore never closed");
            let tool_permit = match tool_semaphore {
                Some(semaphore) => Some(
                    semaphore
                        .acquire_owned()
                        .await
                        .expect("tool semaphore never closed"),
                ),
                None => None,
            };
            let connection = connection_slots
                .acquire_owned()
                .await
                .expect("connection semaphore never closed");
            DispatchSlot {
                _global: global,
                _tool: tool_permit,
                _connection: connection,
            }
        };

        let result = tokio::select! {
            slot = acquire_all => Ok(slot),
            _ = tokio::time::sleep_until(deadline.into()) => Err(BridgeError::Timeout {
                tool: tool.map(String::from),
                deadline_ms,
            }),
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        };
        drop(queued);
        result
    }

    fn try_acquire(
        &self,
        tool_semaphore: Option<Arc<Semaphore>>,
        connection: &Arc<Connection>,
    ) -> Option<DispatchSlot> {
        let global = self.global.clone().try_acquire_owned().ok()?;
        let tool_permit = match tool_semaphore {
            Some(semaphore) => Some(semaphore.try_acquire_owned().ok()?),
            None => None,
        };
        let connection = connection.inflight.clone().try_acquire_owned().ok()?;
        Some(DispatchSlot {
            _global: global,
            _tool: tool_permit,
            _connection: connection,
        })
    }
}
