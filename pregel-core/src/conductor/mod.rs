//! The coordinator of executions.
//!
//! A [`Conductor`] owns the lifecycle of every execution started on it:
//!
//! 1. [`Conductor::start_execution`] resolves the algorithm, builds the
//!    [`Mapping`] and sends step 0 (setup) to every participating server.
//! 2. Each server answers every step with a [`StepReport`]. Once all servers
//!    answered, the superstep hook runs and the conductor either sends the
//!    next step, the final step, or cleanup.
//! 3. An execution finishes when every server acknowledged cleanup. Any
//!    error, including a step timeout, moves it to the error state at once;
//!    the first error is kept.
//!
//! Reports are validated in a fixed order before they change anything: step,
//! then shape, then sender. Reports for executions that already terminated
//! are ignored.
use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

pub use self::execution::{ExecutionInfo, ExecutionResult, ResultGraph};
use self::execution::{Answer, Execution};
use crate::{
    algorithm::{AlgorithmRegistry, AlgorithmSpec, StepInfo},
    common::{ExecutionId, ExecutionState},
    config::ExecutionOptions,
    error::{PregelError, ReportedError, Result},
    mapping::{shard_index, Mapping},
    store::{CollectionOptions, DocumentStore, KEY},
    transport::{
        ConductorEvent, ExecutionSetup, StepCommand, StepReport, Transport, WorkerCommand,
    },
};

mod execution;

/// Collection holding one record per execution.
pub const EXECUTIONS_COLLECTION: &str = "_pregel_executions";

pub struct Conductor {
    store: Arc<dyn DocumentStore>,
    registry: AlgorithmRegistry,
    transport: Arc<dyn Transport>,
    step_timeout: Duration,
    executions: DashMap<ExecutionId, Arc<Execution>>,
    this: Weak<Conductor>,
}

impl Conductor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
        transport: Arc<dyn Transport>,
        step_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            registry,
            transport,
            step_timeout,
            executions: DashMap::new(),
            this: this.clone(),
        })
    }

    fn execution(&self, id: ExecutionId) -> Result<Arc<Execution>> {
        self.executions
            .get(&id)
            .map(|execution| execution.value().clone())
            .ok_or(PregelError::ExecutionNotFound(id))
    }

    /// Start running `algorithms` over `graph`.
    ///
    /// Fails with [`PregelError::BadParameter`] if the graph or any algorithm
    /// name is unknown; nothing is started in that case.
    #[instrument(skip(self, algorithms, options), fields(algorithm = %algorithms.base))]
    pub async fn start_execution(
        &self,
        graph: &str,
        algorithms: AlgorithmSpec,
        options: ExecutionOptions,
    ) -> Result<ExecutionId> {
        let resolved = self.registry.resolve(&algorithms)?;

        let id = loop {
            let id = ExecutionId::random();
            if !self.executions.contains_key(&id) {
                break id;
            }
        };
        let mapping = Mapping::create(&*self.store, graph, id)?;
        if mapping.servers().is_empty() {
            return Err(PregelError::BadParameter(format!(
                "graph `{graph}` has no shards"
            )));
        }

        let setup = ExecutionSetup {
            algorithms,
            mapping: mapping.clone(),
            parameters: options.parameters.clone(),
        };
        let execution = Arc::new(Execution::new(
            id,
            graph.to_string(),
            resolved,
            mapping,
            options.parameters,
            options.timeout.unwrap_or(self.step_timeout),
        ));
        self.executions.insert(id, execution.clone());
        info!(%id, servers = execution.servers.len(), "starting execution");

        self.dispatch_step(&execution, 0, false, Some(setup)).await;
        Ok(id)
    }

    pub async fn handle_event(&self, event: ConductorEvent) -> Result<()> {
        match event {
            ConductorEvent::FinishedStep {
                execution,
                server,
                report,
            } => self.finished_step(execution, &server, report).await,
            ConductorEvent::FinishedCleanup { execution, server } => {
                self.finished_cleanup(execution, &server)
            }
        }
    }

    /// Accept the report of `server` for the current step.
    ///
    /// Protocol violations are returned as errors and leave the execution
    /// unchanged. A report carrying an error fails the execution.
    #[instrument(skip(self, report), fields(step = report.step))]
    pub async fn finished_step(
        &self,
        execution: ExecutionId,
        server: &str,
        report: StepReport,
    ) -> Result<()> {
        let execution = self.execution(execution)?;
        if execution.state().is_terminal() {
            debug!("ignoring report for a terminated execution");
            return Ok(());
        }

        let expected = execution.step();
        if report.step != expected {
            return Err(PregelError::MessageStepMismatch {
                expected,
                actual: report.step,
            });
        }
        let (Some(active), Some(messages)) = (report.active, report.messages) else {
            return Err(PregelError::MessageMalformed(
                "report lacks `active` or `messages`".to_string(),
            ));
        };
        let progress = execution.progress();
        if progress.step() != report.step {
            return Err(PregelError::MessageStepMismatch {
                expected: progress.step(),
                actual: report.step,
            });
        }
        if !progress.is_expected(server) {
            return Err(PregelError::MessageServerNameMismatch(server.to_string()));
        }

        if let Some(error) = report.error {
            warn!(code = error.code, "server reported an error: {}", error.message);
            self.fail_with(&execution, error).await;
            return Ok(());
        }

        match progress.answer(server, active, messages, report.data) {
            Answer::Duplicate => debug!("ignoring repeated report"),
            Answer::Pending => {}
            Answer::Complete => self.step_completed(&execution, progress.info()).await,
        }
        Ok(())
    }

    /// Accept the cleanup acknowledgement of `server`.
    pub fn finished_cleanup(&self, execution: ExecutionId, server: &str) -> Result<()> {
        let execution = self.execution(execution)?;
        if !execution.servers.iter().any(|s| s == server) {
            return Err(PregelError::MessageServerNameMismatch(server.to_string()));
        }
        self.cleanup_acknowledged(&execution, server);
        Ok(())
    }

    /// Fail a running execution with [`PregelError::Timeout`]. Terminated
    /// executions are left as they are.
    pub async fn time_out_execution(&self, execution: ExecutionId) -> Result<()> {
        let execution = self.execution(execution)?;
        let step = execution.step();
        self.fail(&execution, PregelError::Timeout { step }).await;
        Ok(())
    }

    pub fn get_info(&self, execution: ExecutionId) -> Result<ExecutionInfo> {
        Ok(self.execution(execution)?.info())
    }

    pub fn get_result(&self, execution: ExecutionId) -> Result<ExecutionResult> {
        Ok(self.execution(execution)?.result())
    }

    /// Wait until the execution reached a terminal state and return it.
    pub async fn wait_for_completion(&self, execution: ExecutionId) -> Result<ExecutionState> {
        let mut state = self.execution(execution)?.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return Ok(current);
            }
            if state.changed().await.is_err() {
                return Ok(*state.borrow());
            }
        }
    }

    /// Drop the result graph, the result collections and the record of a
    /// terminated execution.
    #[instrument(skip(self))]
    pub fn drop_result(&self, execution: ExecutionId) -> Result<()> {
        let execution = self.execution(execution)?;
        if !execution.state().is_terminal() {
            return Err(PregelError::BadParameter(format!(
                "execution {} is still running",
                execution.id
            )));
        }
        self.executions.remove(&execution.id);

        let mapping = &execution.mapping;
        if let Err(err) = self.store.drop_graph(mapping.result_graph()) {
            warn!("failed to drop result graph: {err:#}");
        }
        for collection in mapping.collections() {
            if let Err(err) = self.store.drop_collection(&collection.result_collection) {
                warn!("failed to drop `{}`: {err:#}", collection.result_collection);
            }
        }
        if let Err(err) = self.remove_record(execution.id) {
            warn!("failed to remove execution record: {err:#}");
        }

        info!("dropped results");
        Ok(())
    }

    #[instrument(skip(self, execution, setup), fields(execution = %execution.id))]
    async fn dispatch_step(
        &self,
        execution: &Arc<Execution>,
        step: u64,
        final_step: bool,
        setup: Option<ExecutionSetup>,
    ) {
        execution.begin_step(step, final_step);
        self.persist(execution);
        self.arm_timer(execution, step);
        debug!(final_step, "dispatching step");

        let globals = execution.globals();
        for server in &execution.servers {
            if execution.state().is_terminal() {
                return;
            }
            let command = WorkerCommand::NextStep(StepCommand {
                execution: execution.id,
                step,
                final_step,
                setup: setup.clone(),
                globals: globals.clone(),
            });
            if let Err(err) = self.transport.send_to_worker(server, command).await {
                let err = PregelError::Internal(format!(
                    "failed to send step {step} to `{server}`: {err:#}"
                ));
                self.fail(execution, err).await;
                return;
            }
        }
    }

    fn arm_timer(&self, execution: &Arc<Execution>, step: u64) {
        let conductor = self.this.clone();
        let id = execution.id;
        let timeout = execution.timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Failing aborts this timer, so the failure runs in its own task.
            tokio::spawn(async move {
                if let Some(conductor) = conductor.upgrade() {
                    conductor.step_timed_out(id, step).await;
                }
            });
        });
        execution.set_timer(timer.abort_handle());
    }

    async fn step_timed_out(&self, id: ExecutionId, step: u64) {
        let Ok(execution) = self.execution(id) else {
            return;
        };
        if execution.step() == step && !execution.state().is_terminal() {
            self.fail(&execution, PregelError::Timeout { step }).await;
        }
    }

    #[instrument(skip_all, fields(execution = %execution.id, step = info.step))]
    async fn step_completed(&self, execution: &Arc<Execution>, mut info: StepInfo) {
        execution.cancel_timer();
        if execution.state().is_terminal() {
            return;
        }
        execution.record_step(&info);
        debug!(active = info.active, messages = info.messages, "step completed");

        if execution.is_final_step(info.step) {
            self.finish(execution).await;
            return;
        }

        if let Err(err) = execution.run_hook(&mut info) {
            self.fail(execution, err).await;
            return;
        }

        let next = info.step + 1;
        if info.active == 0 && info.messages == 0 {
            if execution.has_final_program() {
                self.dispatch_step(execution, next, true, None).await;
            } else {
                self.finish(execution).await;
            }
        } else {
            self.dispatch_step(execution, next, false, None).await;
        }
    }

    /// Ask every server to persist results and release state. The execution
    /// finishes with the last acknowledgement.
    async fn finish(&self, execution: &Arc<Execution>) {
        if !execution.begin_cleanup() {
            return;
        }
        info!(execution = %execution.id, step = execution.step(), "execution converged, cleaning up");

        for server in &execution.servers {
            let command = WorkerCommand::CleanUp {
                execution: execution.id,
            };
            if let Err(err) = self.transport.send_to_worker(server, command).await {
                error!(%server, "failed to request cleanup: {err:#}");
                self.cleanup_acknowledged(execution, server);
            }
        }
    }

    fn cleanup_acknowledged(&self, execution: &Arc<Execution>, server: &str) {
        if execution.acknowledge_cleanup(server) {
            info!(execution = %execution.id, "execution finished");
            self.persist(execution);
        }
    }

    async fn fail(&self, execution: &Arc<Execution>, err: PregelError) {
        self.fail_with(execution, ReportedError::from(err)).await;
    }

    async fn fail_with(&self, execution: &Arc<Execution>, error: ReportedError) {
        if !execution.fail(error.clone()) {
            debug!("execution already terminated, keeping its first error");
            return;
        }
        error!(execution = %execution.id, step = execution.step(), "execution failed: {error}");
        self.persist(execution);

        for server in &execution.servers {
            let command = WorkerCommand::CleanUp {
                execution: execution.id,
            };
            if let Err(err) = self.transport.send_to_worker(server, command).await {
                warn!(%server, "failed to request cleanup: {err:#}");
            }
        }
    }

    fn persist(&self, execution: &Execution) {
        if let Err(err) = self.store_record(execution.record()) {
            warn!(execution = %execution.id, "failed to persist execution record: {err:#}");
        }
    }

    fn records_shard(&self, key: &str) -> anyhow::Result<String> {
        if !self.store.has_collection(EXECUTIONS_COLLECTION) {
            if let Err(err) = self
                .store
                .create_collection(EXECUTIONS_COLLECTION, CollectionOptions::vertex(1))
            {
                // Another execution may have created it in the meantime.
                if !self.store.has_collection(EXECUTIONS_COLLECTION) {
                    return Err(err);
                }
            }
        }
        let info = self.store.collection(EXECUTIONS_COLLECTION)?;
        info.shards
            .get(shard_index(key, info.shards.len()))
            .map(|shard| shard.id.clone())
            .context("execution records have no shards")
    }

    fn store_record(&self, record: Value) -> anyhow::Result<()> {
        let key = record
            .get(KEY)
            .and_then(Value::as_str)
            .context("record without key")?;
        let shard = self.records_shard(key)?;
        self.store.upsert_document(&shard, record)
    }

    fn remove_record(&self, execution: ExecutionId) -> anyhow::Result<()> {
        let key = execution.to_string();
        let shard = self.records_shard(&key)?;
        self.store.remove_document(&shard, &key)
    }
}
