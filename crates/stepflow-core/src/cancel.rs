//! Cooperative cancellation with typed reasons.
//!
//! Wraps `tokio_util::sync::CancellationToken` with a reason slot so that
//! consumers distinguish manual cancellation from timeout structurally, not
//! by matching message strings.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StepError;

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancel request from a caller.
    Manual,
    /// The workflow-level deadline elapsed.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Manual => write!(f, "manual"),
            CancelReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Cloneable cancellation handle. Clones share the same underlying token and
/// reason slot.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The recorded reason. `None` until `cancel` is called.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Reason with a fallback for the race where the token fired but the
    /// slot is not yet visible.
    pub fn reason_or_manual(&self) -> CancelReason {
        self.reason().unwrap_or(CancelReason::Manual)
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Checkpoint for loop bodies and other suspension points: returns
    /// `Err(StepError::Cancelled)` once cancellation has been requested.
    pub fn error_if_cancelled(&self) -> Result<(), StepError> {
        if self.is_cancelled() {
            Err(StepError::Cancelled {
                reason: self.reason_or_manual(),
            })
        } else {
            Ok(())
        }
    }
}

/// Registry of live cancel tokens keyed by execution ID. The engine registers
/// a token when a run starts and removes it when the run reaches a terminal
/// status.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: DashMap<Uuid, CancelToken>,
    // serializes capacity check and insert in try_register
    admission: std::sync::Mutex<()>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: Uuid, token: CancelToken) {
        self.tokens.insert(execution_id, token);
    }

    /// Register a run if fewer than `max` are live. Check and insert happen
    /// under one lock so concurrent callers cannot over-admit; `Err` carries
    /// the live count that caused the rejection.
    pub fn try_register(
        &self,
        execution_id: Uuid,
        token: CancelToken,
        max: usize,
    ) -> Result<(), usize> {
        let _guard = self
            .admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let active = self.tokens.len();
        if active >= max {
            return Err(active);
        }
        self.tokens.insert(execution_id, token);
        Ok(())
    }

    pub fn remove(&self, execution_id: &Uuid) {
        self.tokens.remove(execution_id);
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Cancel a live run. Returns false when the run is unknown (already
    /// finished or never started).
    pub fn cancel(&self, execution_id: &Uuid, reason: CancelReason) -> bool {
        match self.tokens.get(execution_id) {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }
}
