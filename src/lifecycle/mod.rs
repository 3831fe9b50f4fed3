//! Operational lifecycle management.
//!
//! Coordinates startup sequencing, readiness, and graceful shutdown:
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! Start order is config → telemetry → tool registry → dispatcher →
//! transports; `mark_ready` fires only once every transport listener is
//! bound. Stop reverses it: transports stop accepting, connections
//! drain, the dispatcher refuses new acquisitions, tool modules shut
//! down. A second stop signal during drain forces immediate close.

pub mod health;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use health::health_router;

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Initialization in progress
    Starting,
    /// Accepting traffic
    Ready,
    /// Draining, rejecting new requests
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Central coordination point for startup and shutdown.
///
/// Designed for concurrent access from every transport task; all state
/// lives in atomics or lock-free containers.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    /// Set when a second stop signal demands immediate close
    force_stop: AtomicBool,
    version: &'static str,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    /// Create a manager in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            force_stop: AtomicBool::new(false),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// True when accepting traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    /// True once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    /// Transition to `Ready`. Called after all transports are bound.
    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "toolbridge ready"
        );
    }

    /// Begin graceful shutdown: flip state and fire the shutdown token.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!("Shutdown initiated");
    }

    /// Record a second stop signal: skip the rest of the drain.
    pub fn force_shutdown(&self) {
        self.force_stop.store(true, Ordering::SeqCst);
        info!("Second stop signal, forcing immediate close");
    }

    /// Whether a forced stop was requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }

    /// Transition to `Stopped`.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Clone of the shutdown token for background tasks.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Version string.
    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }
}
