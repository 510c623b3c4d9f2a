use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio_util::sync::CancellationToken;

/// The workspace a unit of work was started for. Handlers and reconcile
/// passes capture the active workspace once and compare against the live
/// value before every remote mutation; a mismatch means the user switched
/// workspaces and the work must stop.
#[derive(Clone)]
pub struct WorkspaceContext {
    captured: i64,
    current: Arc<AtomicI64>,
    pub cancel: CancellationToken,
}

impl WorkspaceContext {
    pub fn capture(current: &Arc<AtomicI64>, cancel: CancellationToken) -> Self {
        Self {
            captured: current.load(Ordering::SeqCst),
            current: Arc::clone(current),
            cancel,
        }
    }

    /// Fixed context for tests and single-workspace tools.
    pub fn fixed(workspace_id: i64) -> Self {
        Self {
            captured: workspace_id,
            current: Arc::new(AtomicI64::new(workspace_id)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn workspace_id(&self) -> i64 {
        self.captured
    }

    pub fn drifted(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.captured
    }

    /// Shared handle to the live workspace id, for switching in tests.
    pub fn current_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.current)
    }
}
