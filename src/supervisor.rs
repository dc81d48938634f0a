//! Run-lifecycle supervision (§4.9, C9): tracks at most one active run or
//! review per process so a `Ctrl-C` or external termination signal can wind
//! it down cleanly. Deliberately a plain struct threaded through commands
//! via `Arc`, not a process-global singleton — `run`/`review`/`apply` each
//! own a [`LifecycleSupervisor`] instance and pass it down explicitly.

use std::sync::Arc;

use tokio::sync::Mutex;

use voratiq_core::model::ids::SessionId;
use voratiq_core::model::session::SessionRecord;
use voratiq_core::store::RecordStore;

use crate::auth::StagedAuth;

/// The warning text attached to every agent invocation the supervisor
/// marks aborted.
pub const ABORT_WARNING: &str = "Run aborted before agent completed.";

/// Everything a supervisor tears down on termination: the session whose
/// in-flight invocations must be marked aborted, the record store backing
/// it, and every auth context staged for agents still in flight.
pub struct ActiveContext {
    /// Human-readable label for logs (e.g. `"run rr-20260730-abcd"`).
    pub label: String,
    /// The record store backing the active run or review.
    pub store: Arc<RecordStore>,
    /// The session being supervised.
    pub session_id: SessionId,
    /// Mutates the session record to mark every non-terminal agent
    /// invocation aborted with [`ABORT_WARNING`]. Domain-specific (run vs.
    /// review invocation lists differ), so the caller supplies it.
    pub mark_aborted: Box<dyn FnOnce(SessionRecord) -> SessionRecord + Send>,
    /// Auth contexts staged for agents still in flight.
    pub staged_auths: Vec<StagedAuth>,
}

/// The termination outcome a supervised operation was cut short with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    /// An external signal (Ctrl-C, SIGTERM to the voratiq process itself)
    /// requested shutdown.
    ExternalSignal,
    /// The operation aborted itself (e.g. a watchdog hard-abort it could
    /// not recover from).
    InternalAbort,
}

/// Tracks the single active run or review for this process invocation.
pub struct LifecycleSupervisor {
    active: Mutex<Option<ActiveContext>>,
}

impl LifecycleSupervisor {
    /// Create an empty supervisor.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(None),
        })
    }

    /// Register the context for the operation about to start. Replaces any
    /// previous context without tearing it down — callers must `clear`
    /// (or `terminate`) before registering a new one.
    pub async fn register(&self, context: ActiveContext) {
        *self.active.lock().await = Some(context);
    }

    /// Drop the active context without tearing anything down, once the
    /// operation has already finished its own cleanup.
    pub async fn clear(&self) {
        *self.active.lock().await = None;
    }

    /// Run the four-step termination protocol against whatever context is
    /// currently registered, then clear it. A no-op if nothing is active.
    ///
    /// 1. Mark every in-flight agent invocation in the session record
    ///    aborted, via the context's `mark_aborted`.
    /// 2. Force-flush the record store so the marks are durable.
    /// 3. Tear down every staged auth context exactly once.
    /// 4. Unregister the context (implicit: the lock's contents are taken).
    pub async fn terminate(&self, status: TerminationStatus) {
        let Some(context) = self.active.lock().await.take() else {
            return;
        };

        tracing::warn!(
            label = %context.label,
            ?status,
            "terminating active run; marking in-flight agents aborted"
        );

        if let Err(e) = context.store.rewrite(&context.session_id, context.mark_aborted) {
            tracing::warn!(error = %e, "failed to mark session aborted during termination");
        }
        if let Err(e) = context.store.flush_all() {
            tracing::warn!(error = %e, "failed to flush record store during termination");
        }
        for staged in &context.staged_auths {
            staged.teardown();
        }
    }

    /// Whether an operation is currently registered.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voratiq_core::paths::Domain;

    fn test_store() -> (Arc<RecordStore>, SessionId, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::new(tmp.path().to_owned(), Domain::Runs));
        let session_id = SessionId::new("rr-test0000000000000000").unwrap();
        (store, session_id, tmp)
    }

    #[tokio::test]
    async fn terminate_is_a_noop_without_an_active_context() {
        let supervisor = LifecycleSupervisor::new();
        supervisor.terminate(TerminationStatus::ExternalSignal).await;
        assert!(!supervisor.is_active().await);
    }

    #[tokio::test]
    async fn register_then_terminate_clears_the_context() {
        let supervisor = LifecycleSupervisor::new();
        let (store, session_id, _tmp) = test_store();
        supervisor
            .register(ActiveContext {
                label: "run rr-test".to_owned(),
                store,
                session_id,
                mark_aborted: Box::new(|record| record),
                staged_auths: Vec::new(),
            })
            .await;
        assert!(supervisor.is_active().await);

        supervisor.terminate(TerminationStatus::InternalAbort).await;
        assert!(!supervisor.is_active().await);
    }

    #[tokio::test]
    async fn clear_drops_without_disposing() {
        let supervisor = LifecycleSupervisor::new();
        let (store, session_id, _tmp) = test_store();
        supervisor
            .register(ActiveContext {
                label: "run rr-test".to_owned(),
                store,
                session_id,
                mark_aborted: Box::new(|record| record),
                staged_auths: Vec::new(),
            })
            .await;
        supervisor.clear().await;
        assert!(!supervisor.is_active().await);
    }
}
