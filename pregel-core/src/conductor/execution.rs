use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{sync::watch, task::AbortHandle};

use crate::{
    algorithm::{merge_data, Algorithms, StepInfo},
    common::{ExecutionId, ExecutionState},
    error::{PregelError, ReportedError},
    mapping::Mapping,
    store::KEY,
};

/// Snapshot of an execution, as returned by
/// [`Conductor::get_info`](super::Conductor::get_info).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub id: ExecutionId,
    pub graph: String,
    pub state: ExecutionState,
    pub step: u64,
    pub globals: Value,
    /// Active vertices after the last completed step.
    pub active: u64,
    /// Messages sent during the last completed step.
    pub messages: u64,
    pub error: Option<ReportedError>,
}

/// Where the results of an execution live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultGraph {
    pub graph_name: String,
    pub state: ExecutionState,
}

/// Answer of [`Conductor::get_result`](super::Conductor::get_result).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub error: Option<ReportedError>,
    pub result: ResultGraph,
}

/// Aggregated reports of the servers for one step.
///
/// Each server may answer once; later answers for the same step are
/// ignored. The server whose answer completes the set is told so, and only
/// that caller moves the execution on.
pub(crate) struct StepProgress {
    step: u64,
    answered: HashMap<String, AtomicBool>,
    remaining: AtomicUsize,
    active: AtomicU64,
    messages: AtomicU64,
    data: Mutex<Map<String, Value>>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Answer {
    Duplicate,
    Pending,
    Complete,
}

impl StepProgress {
    pub(crate) fn new(step: u64, servers: &[String]) -> Self {
        Self {
            step,
            answered: servers
                .iter()
                .map(|server| (server.clone(), AtomicBool::new(false)))
                .collect(),
            remaining: AtomicUsize::new(servers.len()),
            active: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            data: Mutex::new(Map::new()),
        }
    }

    pub(crate) fn step(&self) -> u64 {
        self.step
    }

    pub(crate) fn is_expected(&self, server: &str) -> bool {
        self.answered.contains_key(server)
    }

    pub(crate) fn answer(
        &self,
        server: &str,
        active: u64,
        messages: u64,
        data: Option<Map<String, Value>>,
    ) -> Answer {
        let Some(answered) = self.answered.get(server) else {
            return Answer::Duplicate;
        };
        if answered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Answer::Duplicate;
        }

        self.active.fetch_add(active, Ordering::SeqCst);
        self.messages.fetch_add(messages, Ordering::SeqCst);
        if let Some(data) = data {
            merge_data(&mut lock(&self.data), data);
        }

        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            Answer::Complete
        } else {
            Answer::Pending
        }
    }

    pub(crate) fn info(&self) -> StepInfo {
        StepInfo {
            step: self.step,
            active: self.active.load(Ordering::SeqCst),
            messages: self.messages.load(Ordering::SeqCst),
            data: lock(&self.data).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    state: ExecutionState,
    globals: Value,
    error: Option<ReportedError>,
    last: StepInfo,
    /// Step running the final program, once dispatched.
    final_step: Option<u64>,
    /// Servers yet to acknowledge cleanup of a finishing execution.
    cleanup_pending: Option<HashSet<String>>,
    timer: Option<AbortHandle>,
}

/// Conductor-side state of one execution.
pub(crate) struct Execution {
    pub(crate) id: ExecutionId,
    pub(crate) graph: String,
    pub(crate) algorithms: Algorithms,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) servers: Vec<String>,
    pub(crate) parameters: Value,
    pub(crate) timeout: Duration,
    step: AtomicU64,
    progress: RwLock<Arc<StepProgress>>,
    inner: Mutex<Inner>,
    state: watch::Sender<ExecutionState>,
}

impl Execution {
    pub(crate) fn new(
        id: ExecutionId,
        graph: String,
        algorithms: Algorithms,
        mapping: Mapping,
        parameters: Value,
        timeout: Duration,
    ) -> Self {
        let servers = mapping.servers();
        let (state, _) = watch::channel(ExecutionState::Running);
        Self {
            id,
            graph,
            algorithms,
            mapping: Arc::new(mapping),
            progress: RwLock::new(Arc::new(StepProgress::new(0, &servers))),
            servers,
            parameters,
            timeout,
            step: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: ExecutionState::Running,
                globals: Value::Object(Map::new()),
                error: None,
                last: StepInfo::default(),
                final_step: None,
                cleanup_pending: None,
                timer: None,
            }),
            state,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub(crate) fn step(&self) -> u64 {
        self.step.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ExecutionState {
        self.inner().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.state.subscribe()
    }

    pub(crate) fn globals(&self) -> Value {
        self.inner().globals.clone()
    }

    pub(crate) fn progress(&self) -> Arc<StepProgress> {
        self.progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to `step` and start collecting its reports.
    pub(crate) fn begin_step(&self, step: u64, final_step: bool) {
        let progress = Arc::new(StepProgress::new(step, &self.servers));
        *self.progress.write().unwrap_or_else(PoisonError::into_inner) = progress;
        self.step.store(step, Ordering::SeqCst);
        if final_step {
            self.inner().final_step = Some(step);
        }
    }

    pub(crate) fn is_final_step(&self, step: u64) -> bool {
        self.inner().final_step == Some(step)
    }

    pub(crate) fn has_final_program(&self) -> bool {
        self.algorithms.final_step.is_some()
    }

    /// Replace the step timer, aborting the previous one.
    pub(crate) fn set_timer(&self, timer: AbortHandle) {
        if let Some(previous) = self.inner().timer.replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_timer(&self) {
        if let Some(timer) = self.inner().timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn record_step(&self, info: &StepInfo) {
        self.inner().last = info.clone();
    }

    /// Run the superstep hook, if any, over the globals.
    pub(crate) fn run_hook(&self, info: &mut StepInfo) -> Result<(), PregelError> {
        let Some(hook) = &self.algorithms.superstep else {
            return Ok(());
        };
        let mut globals = self.globals();
        match catch_unwind(AssertUnwindSafe(|| hook.superstep(&mut globals, info))) {
            Ok(Ok(())) => {
                self.inner().globals = globals;
                Ok(())
            }
            Ok(Err(err)) => Err(PregelError::algorithm(err.context("superstep hook"))),
            Err(panic) => Err(PregelError::from_panic(panic)),
        }
    }

    /// Enter the error state. Only the first error is kept; returns whether
    /// this call made the transition.
    pub(crate) fn fail(&self, error: ReportedError) -> bool {
        let mut inner = self.inner();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = ExecutionState::Error;
        inner.error = Some(error);
        inner.cleanup_pending = None;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        drop(inner);

        self.state.send_replace(ExecutionState::Error);
        true
    }

    /// Start waiting for cleanup acknowledgements of every server. Returns
    /// false if the execution is already finishing or terminal.
    pub(crate) fn begin_cleanup(&self) -> bool {
        let mut inner = self.inner();
        if inner.state.is_terminal() || inner.cleanup_pending.is_some() {
            return false;
        }
        inner.cleanup_pending = Some(self.servers.iter().cloned().collect());
        true
    }

    /// Record a cleanup acknowledgement. Returns true when it was the last
    /// one and the execution is now finished.
    pub(crate) fn acknowledge_cleanup(&self, server: &str) -> bool {
        let mut inner = self.inner();
        let Some(pending) = inner.cleanup_pending.as_mut() else {
            return false;
        };
        if !pending.remove(server) || !pending.is_empty() {
            return false;
        }
        inner.cleanup_pending = None;
        inner.state = ExecutionState::Finished;
        drop(inner);

        self.state.send_replace(ExecutionState::Finished);
        true
    }

    pub(crate) fn info(&self) -> ExecutionInfo {
        let inner = self.inner();
        ExecutionInfo {
            id: self.id,
            graph: self.graph.clone(),
            state: inner.state,
            step: self.step(),
            globals: inner.globals.clone(),
            active: inner.last.active,
            messages: inner.last.messages,
            error: inner.error.clone(),
        }
    }

    pub(crate) fn result(&self) -> ExecutionResult {
        let inner = self.inner();
        ExecutionResult {
            error: inner.error.clone(),
            result: ResultGraph {
                graph_name: self.mapping.result_graph().to_string(),
                state: inner.state,
            },
        }
    }

    /// The durable record of the execution.
    pub(crate) fn record(&self) -> Value {
        let inner = self.inner();
        json!({
            KEY: self.id.to_string(),
            "graph": self.graph,
            "resultGraph": self.mapping.result_graph(),
            "state": inner.state,
            "step": self.step(),
            "timeoutMs": self.timeout.as_millis() as u64,
            "algorithms": self.algorithms.spec,
            "parameters": self.parameters,
            "globals": inner.globals,
            "error": inner.error,
        })
    }
}
