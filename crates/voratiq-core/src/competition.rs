//! The competition engine protocol (§4.6, C6): an adapter-driven,
//! bounded-parallel orchestrator shared by the run and review pipelines.
//!
//! [`run_competition`] implements the engine's fixed sequencing; callers
//! supply a [`CompetitionAdapter`] that knows how to prepare, execute, and
//! account for one domain's candidates (agent invocations for a run,
//! reviewer invocations for a review). Bounded parallelism is enforced
//! with a `tokio::sync::Semaphore`, the way `other_examples`' orchestrator
//! supervisors gate concurrent subprocess fan-out.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// The result of [`CompetitionAdapter::prepare_candidates`]: candidates
/// that are ready to execute, and any failures encountered while preparing
/// them. Preparation is sequential and all-or-nothing — a non-empty
/// `failures` list means the whole competition aborts (§4.6).
pub struct PrepareOutcome<Prepared, Error> {
    /// Candidates successfully prepared before any failure (or all of
    /// them, if none failed).
    pub ready: Vec<Prepared>,
    /// Failures encountered while preparing candidates.
    pub failures: Vec<Error>,
}

/// The outcome of running a competition to completion.
pub enum CompetitionOutcome<Result, Error> {
    /// Preparation failed; the competition never executed any candidate.
    PrepareFailed {
        /// Candidates that were prepared before the failure.
        ready: Vec<Result>,
        /// The failures that aborted preparation.
        failures: Vec<Error>,
    },
    /// Every prepared candidate produced exactly one outcome, in the
    /// order supplied.
    Completed {
        /// One entry per prepared candidate: `Ok` for a (possibly
        /// synthetic) execution result, `Err` for an unrecovered
        /// execution failure.
        results: Vec<std::result::Result<Result, Error>>,
        /// Whether any candidate's outcome was an unrecovered failure.
        failed: bool,
    },
}

/// The adapter contract the competition engine drives (§4.6).
///
/// Implementations supply the domain-specific meaning of "prepare",
/// "execute", and "finalize" — e.g. scaffolding a run agent's workspace
/// and invoking it through the runtime harness, or staging a reviewer's
/// blinded inputs and invoking it.
pub trait CompetitionAdapter {
    /// An unprepared candidate (e.g. an agent id plus its resolved model).
    type Candidate: Send;
    /// A prepared candidate, ready for execution.
    type Prepared: Send;
    /// The result of successfully executing a prepared candidate.
    type ExecutionResult: Send;
    /// An error encountered during preparation or execution.
    type Error: Send;

    /// Prepare every candidate, sequentially and all-or-nothing.
    async fn prepare_candidates(
        &self,
        candidates: Vec<Self::Candidate>,
    ) -> PrepareOutcome<Self::Prepared, Self::Error>;

    /// Execute one prepared candidate.
    async fn execute_candidate(
        &self,
        prepared: &Self::Prepared,
    ) -> Result<Self::ExecutionResult, Self::Error>;

    /// Called once a candidate's outcome (success, or a synthesized
    /// failure) is known, for side effects such as persisting a record.
    async fn on_candidate_completed(&self, result: &Self::ExecutionResult);

    /// Convert an execution error into a synthetic failed result, if the
    /// domain has a "failed" terminal state to represent it in. Returning
    /// `None` leaves the error unrecovered.
    fn capture_execution_failure(
        &self,
        prepared: &Self::Prepared,
        error: &Self::Error,
    ) -> Option<Self::ExecutionResult>;

    /// Always called exactly once, even when preparation failed. Must
    /// release every resource the adapter allocated.
    async fn finalize_competition(&self, failed: bool);
}

/// Run `candidates` through `adapter` with at most `max_parallel`
/// concurrent executions (§4.6, §5).
///
/// # Panics
/// Panics if `max_parallel` is zero.
pub async fn run_competition<A>(
    adapter: &A,
    candidates: Vec<A::Candidate>,
    max_parallel: usize,
) -> CompetitionOutcome<A::ExecutionResult, A::Error>
where
    A: CompetitionAdapter,
{
    assert!(max_parallel > 0, "max_parallel must be at least 1");

    let prepared = adapter.prepare_candidates(candidates).await;
    if !prepared.failures.is_empty() {
        adapter.finalize_competition(true).await;
        return CompetitionOutcome::PrepareFailed {
            ready: Vec::new(),
            failures: prepared.failures,
        };
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut tasks = Vec::with_capacity(prepared.ready.len());
    for item in &prepared.ready {
        let semaphore = Arc::clone(&semaphore);
        tasks.push(async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("competition semaphore is never closed");
            (item, adapter.execute_candidate(item).await)
        });
    }

    let execution_results = futures_util::future::join_all(tasks).await;

    let mut results = Vec::with_capacity(execution_results.len());
    let mut failed = false;
    for (item, outcome) in execution_results {
        match outcome {
            Ok(result) => {
                adapter.on_candidate_completed(&result).await;
                results.push(Ok(result));
            }
            Err(error) => {
                if let Some(synthetic) = adapter.capture_execution_failure(item, &error) {
                    adapter.on_candidate_completed(&synthetic).await;
                    results.push(Ok(synthetic));
                } else {
                    failed = true;
                    results.push(Err(error));
                }
            }
        }
    }

    adapter.finalize_competition(failed).await;
    CompetitionOutcome::Completed { results, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAdapter {
        fail_every_other: bool,
        in_flight: AtomicUsize,
        max_observed_in_flight: AtomicUsize,
        finalized_with_failed: std::sync::Mutex<Option<bool>>,
    }

    impl CompetitionAdapter for CountingAdapter {
        type Candidate = u32;
        type Prepared = u32;
        type ExecutionResult = u32;
        type Error = u32;

        async fn prepare_candidates(
            &self,
            candidates: Vec<Self::Candidate>,
        ) -> PrepareOutcome<Self::Prepared, Self::Error> {
            PrepareOutcome {
                ready: candidates,
                failures: Vec::new(),
            }
        }

        async fn execute_candidate(
            &self,
            prepared: &Self::Prepared,
        ) -> Result<Self::ExecutionResult, Self::Error> {
            let prepared = *prepared;
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_every_other && prepared % 2 == 0 {
                Err(prepared)
            } else {
                Ok(prepared)
            }
        }

        async fn on_candidate_completed(&self, _result: &Self::ExecutionResult) {}

        fn capture_execution_failure(
            &self,
            _prepared: &Self::Prepared,
            _error: &Self::Error,
        ) -> Option<Self::ExecutionResult> {
            None
        }

        async fn finalize_competition(&self, failed: bool) {
            *self.finalized_with_failed.lock().unwrap() = Some(failed);
        }
    }

    #[tokio::test]
    async fn all_candidates_succeed_in_order() {
        let adapter = CountingAdapter {
            fail_every_other: false,
            in_flight: AtomicUsize::new(0),
            max_observed_in_flight: AtomicUsize::new(0),
            finalized_with_failed: std::sync::Mutex::new(None),
        };
        let outcome = run_competition(&adapter, vec![1, 2, 3], 2).await;
        match outcome {
            CompetitionOutcome::Completed { results, failed } => {
                assert!(!failed);
                let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
                assert_eq!(values, vec![1, 2, 3]);
            }
            CompetitionOutcome::PrepareFailed { .. } => panic!("unexpected prepare failure"),
        }
        assert_eq!(*adapter.finalized_with_failed.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn bounds_concurrency_to_max_parallel() {
        let adapter = CountingAdapter {
            fail_every_other: false,
            in_flight: AtomicUsize::new(0),
            max_observed_in_flight: AtomicUsize::new(0),
            finalized_with_failed: std::sync::Mutex::new(None),
        };
        let _ = run_competition(&adapter, vec![1, 2, 3, 4, 5, 6], 2).await;
        assert!(adapter.max_observed_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn a_failure_does_not_cancel_peers() {
        let adapter = CountingAdapter {
            fail_every_other: true,
            in_flight: AtomicUsize::new(0),
            max_observed_in_flight: AtomicUsize::new(0),
            finalized_with_failed: std::sync::Mutex::new(None),
        };
        let outcome = run_competition(&adapter, vec![1, 2, 3, 4], 4).await;
        match outcome {
            CompetitionOutcome::Completed { results, failed } => {
                assert!(failed);
                assert_eq!(results.len(), 4);
                assert!(results[0].is_ok());
                assert!(results[1].is_err());
            }
            CompetitionOutcome::PrepareFailed { .. } => panic!("unexpected prepare failure"),
        }
    }

    struct AlwaysFailsPrepare;

    impl CompetitionAdapter for AlwaysFailsPrepare {
        type Candidate = u32;
        type Prepared = u32;
        type ExecutionResult = u32;
        type Error = &'static str;

        async fn prepare_candidates(
            &self,
            _candidates: Vec<Self::Candidate>,
        ) -> PrepareOutcome<Self::Prepared, Self::Error> {
            PrepareOutcome {
                ready: Vec::new(),
                failures: vec!["workspace scaffold failed"],
            }
        }

        async fn execute_candidate(
            &self,
            prepared: &Self::Prepared,
        ) -> Result<Self::ExecutionResult, Self::Error> {
            Ok(*prepared)
        }

        async fn on_candidate_completed(&self, _result: &Self::ExecutionResult) {}

        fn capture_execution_failure(
            &self,
            _prepared: &Self::Prepared,
            _error: &Self::Error,
        ) -> Option<Self::ExecutionResult> {
            None
        }

        async fn finalize_competition(&self, _failed: bool) {}
    }

    #[tokio::test]
    async fn prepare_failure_aborts_and_still_finalizes() {
        let adapter = AlwaysFailsPrepare;
        let outcome = run_competition(&adapter, vec![1, 2], 4).await;
        match outcome {
            CompetitionOutcome::PrepareFailed { failures, .. } => {
                assert_eq!(failures, vec!["workspace scaffold failed"]);
            }
            CompetitionOutcome::Completed { .. } => panic!("expected prepare failure"),
        }
    }

    /// A candidate's execution error, if it has a domain "failed" terminal
    /// state, is captured into a synthetic result rather than left as an
    /// unrecovered error — its peers still complete normally and the
    /// competition as a whole is not marked `failed`.
    struct CapturingAdapter {
        completed: std::sync::Mutex<Vec<i64>>,
    }

    impl CompetitionAdapter for CapturingAdapter {
        type Candidate = i64;
        type Prepared = i64;
        type ExecutionResult = i64;
        type Error = i64;

        async fn prepare_candidates(
            &self,
            candidates: Vec<Self::Candidate>,
        ) -> PrepareOutcome<Self::Prepared, Self::Error> {
            PrepareOutcome {
                ready: candidates,
                failures: Vec::new(),
            }
        }

        async fn execute_candidate(
            &self,
            prepared: &Self::Prepared,
        ) -> Result<Self::ExecutionResult, Self::Error> {
            if *prepared < 0 { Err(*prepared) } else { Ok(*prepared) }
        }

        async fn on_candidate_completed(&self, result: &Self::ExecutionResult) {
            self.completed.lock().unwrap().push(*result);
        }

        fn capture_execution_failure(
            &self,
            _prepared: &Self::Prepared,
            error: &Self::Error,
        ) -> Option<Self::ExecutionResult> {
            // Represent "failed" by negating back to the candidate's id.
            Some(-*error)
        }

        async fn finalize_competition(&self, _failed: bool) {}
    }

    #[tokio::test]
    async fn captured_execution_failure_does_not_mark_competition_failed() {
        let adapter = CapturingAdapter {
            completed: std::sync::Mutex::new(Vec::new()),
        };
        // A=1 (succeeds), B=-2 (fails, captured), C=3 (succeeds).
        let outcome = run_competition(&adapter, vec![1, -2, 3], 2).await;
        match outcome {
            CompetitionOutcome::Completed { results, failed } => {
                assert!(!failed, "a captured failure should not propagate as unrecovered");
                let values: Vec<i64> = results.into_iter().map(|r| r.expect("captured, not an Err")).collect();
                assert_eq!(values, vec![1, 2, 3]);
            }
            CompetitionOutcome::PrepareFailed { .. } => panic!("unexpected prepare failure"),
        }
        let mut completed = adapter.completed.lock().unwrap().clone();
        completed.sort_unstable();
        assert_eq!(completed, vec![1, 2, 3]);
    }
}
