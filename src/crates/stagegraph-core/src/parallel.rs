//! Parallel fan-out and join
//!
//! [`dispatch`] forks one state into N named branches and runs them
//! concurrently on the tokio runtime. [`join`] folds the per-branch results
//! back into a single [`StateUpdate`] for the parent. [`ParallelStage`]
//! packages both as an ordinary stage function so a fan-out is just another
//! node in the graph.
//!
//! ```text
//!                       ┌─► branch "code"     (own copy) ─┐
//!   parent state ─fork──┼─► branch "audio"    (own copy) ─┼──► join ──► StateUpdate
//!                       └─► branch "graphics" (own copy) ─┘
//!
//!   branch_results = { code: {...}, audio: null, graphics: {...} }
//!   errors        += [ [fanout/audio] branch_failure: ... ]
//! ```
//!
//! # Guarantees
//!
//! - Every branch receives its own derived copy of the parent state. Nothing
//!   a branch writes is visible to a sibling.
//! - The dispatcher waits for *every* branch. A failing branch never cancels
//!   its siblings.
//! - The join writes exactly one `branch_results` key per dispatched branch:
//!   the branch's value on success, `null` otherwise. Each failed or cancelled
//!   branch additionally contributes one error record tagged with its name.
//! - Sibling completion order is undefined; join output is ordered by branch
//!   name.
//! - Dropping the future returned by [`dispatch`] (for example when a caller
//!   times out the whole run) cancels every branch that is still running.
//!
//! A branch's value is a JSON object holding the `outputs` entries the branch
//! wrote (added or changed relative to the parent state).
//!
//! Errors pushed into the branch's own state count as a failure of that branch.

use crate::error::{ErrorRecord, StageError};
use crate::executor::panic_message;
use crate::graph::{stage_fn, StageFn, StageFuture};
use crate::runtime::{self, RunContext};
use crate::state::{ExecutionState, StageOutput, StateUpdate};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One named unit of fan-out work
#[derive(Clone)]
pub struct Branch {
    pub name: String,
    pub stage: StageFn,
}

impl Branch {
    pub fn new(name: impl Into<String>, stage: StageFn) -> Self {
        Self {
            name: name.into(),
            stage,
        }
    }

    pub fn from_fn<F, Fut, O>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StageError>> + Send + 'static,
        O: Into<StageOutput>,
    {
        Self::new(name, stage_fn(func))
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Success,
    Failed,
    Cancelled,
}

/// Settled outcome of one branch
#[derive(Debug, Clone, PartialEq)]
pub struct BranchResult {
    pub branch_name: String,
    pub status: BranchStatus,
    /// Outputs written by the branch, `null` unless it succeeded
    pub value: Value,
    pub error: Option<ErrorRecord>,
}

impl BranchResult {
    pub fn is_success(&self) -> bool {
        self.status == BranchStatus::Success
    }
}

/// Dispatch settings
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Node the fan-out belongs to, used to attribute error records
    pub node: String,
    /// At most this many branches run at once; the rest queue
    pub max_concurrency: Option<usize>,
    /// Per-branch deadline, counted from when the branch starts running
    pub branch_timeout: Option<Duration>,
    /// Fires to cancel every unfinished branch
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

enum BranchOutcome {
    Completed(ExecutionState),
    Failed(String),
    Cancelled,
}

/// Run every branch on its own copy of `state` and wait for all of them
///
/// Branch names are expected to be unique; results are keyed by name.
pub async fn dispatch(
    state: &ExecutionState,
    branches: &[Branch],
    options: &DispatchOptions,
) -> BTreeMap<String, BranchResult> {
    let semaphore = options
        .max_concurrency
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let cancel = options
        .cancel
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    // Dropping the dispatch future stops every branch still in flight
    let _abandon = cancel.clone().drop_guard();
    let parent_ctx = runtime::current();

    debug!(
        node = %options.node,
        branches = branches.len(),
        max_concurrency = ?options.max_concurrency,
        "Dispatching fan-out"
    );

    let handles: Vec<_> = branches
        .iter()
        .map(|branch| {
            let base = state.derive();
            let stage = branch.stage.clone();
            let semaphore = semaphore.clone();
            let token = cancel.child_token();
            let timeout = options.branch_timeout;
            let ctx = parent_ctx
                .as_ref()
                .map(|ctx: &RunContext| ctx.clone().with_cancel(token.clone()));

            tokio::spawn(async move {
                let work = run_branch(base, stage, semaphore, token, timeout);
                match ctx {
                    Some(ctx) => runtime::scope(ctx, work).await,
                    None => work.await,
                }
            })
        })
        .collect();

    let settled = join_all(handles).await;

    branches
        .iter()
        .zip(settled)
        .map(|(branch, joined)| {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => BranchOutcome::Failed(format!(
                    "branch panicked: {}",
                    panic_message(err.into_panic().as_ref())
                )),
                Err(_) => BranchOutcome::Cancelled,
            };
            let result = settle(&options.node, &branch.name, state, outcome);
            (branch.name.clone(), result)
        })
        .collect()
}

async fn run_branch(
    base: ExecutionState,
    stage: StageFn,
    semaphore: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> BranchOutcome {
    let _permit = match semaphore {
        Some(semaphore) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return BranchOutcome::Cancelled,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return BranchOutcome::Cancelled,
                },
            }
        }
        None => None,
    };

    if cancel.is_cancelled() {
        return BranchOutcome::Cancelled;
    }

    let work = stage(base.derive());
    let bounded = async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.ok(),
            None => Some(work.await),
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => BranchOutcome::Cancelled,
        result = bounded => match result {
            None => BranchOutcome::Failed(format!(
                "timed out after {}ms",
                timeout.map(|t| t.as_millis()).unwrap_or_default()
            )),
            Some(Ok(output)) => {
                let mut scratch = base;
                scratch.apply(output);
                BranchOutcome::Completed(scratch)
            }
            Some(Err(StageError::Cancelled)) => BranchOutcome::Cancelled,
            Some(Err(err)) => BranchOutcome::Failed(err.to_string()),
        },
    }
}

fn settle(node: &str, branch: &str, base: &ExecutionState, outcome: BranchOutcome) -> BranchResult {
    let (status, value, error) = match outcome {
        BranchOutcome::Completed(scratch) if scratch.errors.len() > base.errors.len() => {
            let message = scratch.errors[base.errors.len()..]
                .iter()
                .map(|record| record.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            (
                BranchStatus::Failed,
                Value::Null,
                Some(ErrorRecord::branch_failure(node, branch, message)),
            )
        }
        BranchOutcome::Completed(scratch) => {
            let written: Map<String, Value> = scratch
                .outputs
                .into_iter()
                .filter(|(key, value)| base.outputs.get(key) != Some(value))
                .collect();
            (BranchStatus::Success, Value::Object(written), None)
        }
        BranchOutcome::Failed(message) => (
            BranchStatus::Failed,
            Value::Null,
            Some(ErrorRecord::branch_failure(node, branch, message)),
        ),
        BranchOutcome::Cancelled => (
            BranchStatus::Cancelled,
            Value::Null,
            Some(ErrorRecord::cancelled(node, "branch cancelled before completion").with_branch(branch)),
        ),
    };

    if let Some(record) = &error {
        warn!(node = %node, branch = %branch, error = %record, "Branch did not succeed");
    }

    BranchResult {
        branch_name: branch.to_string(),
        status,
        value,
        error,
    }
}

/// Fold branch results into a single update for the parent state
pub fn join(results: &BTreeMap<String, BranchResult>) -> StateUpdate {
    results.values().fold(StateUpdate::new(), |update, result| {
        let update = update.set_branch_result(result.branch_name.clone(), result.value.clone());
        match &result.error {
            Some(record) => update.push_error(record.clone()),
            None => update,
        }
    })
}

/// A fan-out usable as a graph node
///
/// Concurrency and timeout default to the running graph's
/// [`ExecutionConfig`](crate::config::ExecutionConfig) unless set here.
#[derive(Debug, Clone)]
pub struct ParallelStage {
    branches: Vec<Branch>,
    max_concurrency: Option<usize>,
    branch_timeout: Option<Duration>,
}

impl ParallelStage {
    pub fn new(branches: Vec<Branch>) -> Self {
        Self {
            branches,
            max_concurrency: None,
            branch_timeout: None,
        }
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.iter().map(|b| b.name.clone()).collect()
    }

    fn options(&self) -> DispatchOptions {
        let ctx = runtime::current();
        let mut options = DispatchOptions::new(
            ctx.as_ref()
                .map(|c| c.node.clone())
                .unwrap_or_else(|| "parallel".to_string()),
        );
        options.max_concurrency = self
            .max_concurrency
            .or_else(|| ctx.as_ref().and_then(|c| c.config.max_concurrency));
        options.branch_timeout = self
            .branch_timeout
            .or_else(|| ctx.as_ref().and_then(|c| c.config.branch_timeout()));
        options.cancel = ctx.map(|c| c.cancel);
        options
    }

    /// Dispatch and join against `state`
    pub async fn run(&self, state: &ExecutionState) -> StateUpdate {
        let results = dispatch(state, &self.branches, &self.options()).await;
        join(&results)
    }

    pub fn into_stage(self) -> StageFn {
        let stage = Arc::new(self);
        Arc::new(move |state| -> StageFuture {
            let stage = stage.clone();
            Box::pin(async move { Ok(StageOutput::Update(stage.run(&state).await)) })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn writes(name: &'static str, value: Value) -> Branch {
        Branch::from_fn(name, move |_| {
            let value = value.clone();
            async move { Ok(StateUpdate::new().set_output(name, value)) }
        })
    }

    fn fails(name: &'static str) -> Branch {
        Branch::from_fn(name, move |_| async move {
            Err::<StateUpdate, _>(StageError::failed(format!("{} broke", name)))
        })
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let branches = vec![writes("1", json!("a")), fails("2"), writes("3", json!("c"))];
        let results = dispatch(&ExecutionState::new(), &branches, &DispatchOptions::new("fan")).await;

        assert_eq!(results.len(), 3);
        assert!(results["1"].is_success());
        assert!(results["3"].is_success());
        assert_eq!(results["2"].status, BranchStatus::Failed);

        let error = results["2"].error.as_ref().unwrap();
        assert_eq!(error.branch.as_deref(), Some("2"));
        assert_eq!(error.kind, ErrorKind::BranchFailure);
        assert!(results["1"].error.is_none());
        assert!(results["3"].error.is_none());
    }

    #[tokio::test]
    async fn test_join_cardinality_and_values() {
        let branches = vec![writes("x", json!(1)), fails("y")];
        let results = dispatch(&ExecutionState::new(), &branches, &DispatchOptions::new("fan")).await;

        let mut state = ExecutionState::new();
        state.apply(join(&results));

        assert_eq!(state.branch_results.len(), 2);
        assert_eq!(state.branch_result("x"), Some(&json!({"x": 1})));
        assert_eq!(state.branch_result("y"), Some(&Value::Null));
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].branch.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_branches_do_not_see_each_other() {
        let spy = Branch::from_fn("spy", |state: ExecutionState| async move {
            tokio::task::yield_now().await;
            let saw = state.output("writer").cloned().unwrap_or(Value::Null);
            Ok(StateUpdate::new().set_output("saw", saw))
        });
        let branches = vec![writes("writer", json!("secret")), spy];

        let base = ExecutionState::new();
        let results = dispatch(&base, &branches, &DispatchOptions::new("fan")).await;

        assert_eq!(results["spy"].value, json!({"saw": null}));
        assert!(base.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_outputs_not_reported() {
        let mut base = ExecutionState::new();
        base.apply(StateUpdate::new().set_output("shared", json!(1)));

        let branch = Branch::from_fn("b", |state: ExecutionState| async move {
            Ok(StateUpdate::new()
                .set_output("shared", state.output("shared").cloned().unwrap_or_default())
                .set_output("own", json!(2)))
        });
        let results = dispatch(&base, &[branch], &DispatchOptions::new("fan")).await;

        assert_eq!(results["b"].value, json!({"own": 2}));
    }

    #[tokio::test]
    async fn test_pushed_errors_fail_the_branch() {
        let branch = Branch::from_fn("soft", |_| async {
            Ok(StateUpdate::new()
                .set_output("partial", json!(true))
                .push_error(ErrorRecord::node_failure("inner", "half done")))
        });
        let results = dispatch(&ExecutionState::new(), &[branch], &DispatchOptions::new("fan")).await;

        assert_eq!(results["soft"].status, BranchStatus::Failed);
        assert_eq!(results["soft"].error.as_ref().unwrap().message, "half done");
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let branch = Branch::from_fn("panics", |_| async {
            if true {
                panic!("branch exploded");
            }
            Ok(StateUpdate::new())
        });
        let results = dispatch(
            &ExecutionState::new(),
            &[branch, writes("fine", json!(1))],
            &DispatchOptions::new("fan"),
        )
        .await;

        assert_eq!(results["panics"].status, BranchStatus::Failed);
        assert!(results["panics"]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("branch exploded"));
        assert!(results["fine"].is_success());
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let branches: Vec<Branch> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                Branch::from_fn(format!("b{}", i), move |_| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(StateUpdate::new())
                    }
                })
            })
            .collect();

        let options = DispatchOptions::new("fan").with_max_concurrency(2);
        let results = dispatch(&ExecutionState::new(), &branches, &options).await;

        assert_eq!(results.len(), 6);
        assert!(results.values().all(BranchResult::is_success));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_timeout() {
        let slow = Branch::from_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StateUpdate::new())
        });
        let options = DispatchOptions::new("fan").with_branch_timeout(Duration::from_millis(100));
        let results = dispatch(
            &ExecutionState::new(),
            &[slow, writes("quick", json!(1))],
            &options,
        )
        .await;

        assert_eq!(results["slow"].status, BranchStatus::Failed);
        assert!(results["slow"].error.as_ref().unwrap().message.contains("timed out"));
        assert!(results["quick"].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_marks_unfinished_branches() {
        let token = CancellationToken::new();
        let slow = Branch::from_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StateUpdate::new())
        });

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let options = DispatchOptions::new("fan").with_cancel(token);
        let results = dispatch(
            &ExecutionState::new(),
            &[slow, writes("quick", json!(1))],
            &options,
        )
        .await;

        assert!(results["quick"].is_success());
        assert_eq!(results["slow"].status, BranchStatus::Cancelled);
        assert_eq!(
            results["slow"].error.as_ref().unwrap().kind,
            ErrorKind::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_dispatch_stops_branches() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let slow = Branch::from_fn("slow", move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StateUpdate::new())
            }
        });

        let state = ExecutionState::new();
        let branches = [slow];
        let options = DispatchOptions::new("fan");
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            dispatch(&state, &branches, &options),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finished_dispatch_leaves_caller_token_alone() {
        let token = CancellationToken::new();
        let options = DispatchOptions::new("fan").with_cancel(token.clone());
        let results = dispatch(&ExecutionState::new(), &[writes("a", json!(1))], &options).await;

        assert!(results["a"].is_success());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parallel_stage_without_run_context() {
        let stage = ParallelStage::new(vec![writes("a", json!(1)), fails("b")]);
        assert_eq!(stage.branch_names(), vec!["a", "b"]);

        let update = stage.run(&ExecutionState::new()).await;
        assert_eq!(update.errors().len(), 1);
        assert_eq!(update.errors()[0].node, "parallel");
    }
}
