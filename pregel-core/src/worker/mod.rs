//! The per-server execution unit.
//!
//! A [`Worker`] serves every execution its server takes part in. For one
//! execution it keeps a fixed number of local workers, each owning a
//! [`VertexPartition`] and a [`MessageQueue`]. A step runs as follows:
//!
//! 1. Every local worker pulls in the messages staged for the step and runs
//!    the vertex program over its partition.
//! 2. Outgoing messages are handed to the sibling that dispatches their target
//!    shard, followed by a barrier over all local workers.
//! 3. Each local worker delivers what it collected, either into the server's
//!    own inbox or as a [`MessageBatch`] to the owning server.
//! 4. The server reports `{step, active, messages, data, error}` to the
//!    conductor.
//!
//! Step 0 only loads the partitions and reports the number of vertices.
//!
//! Errors and panics of user code end the step for the local worker that hit
//! them. The step still completes on the server and the error travels to the
//! conductor in the report; no messages of a failed step are dispatched.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub use self::context::ComputeContext;
use self::exchange::LocalExchange;
use crate::{
    algorithm::{merge_data, AlgorithmRegistry, Algorithms},
    common::ExecutionId,
    error::PregelError,
    mapping::Mapping,
    message::{
        queue::{Inbox, MessageQueue, Outbox},
        VertexMessages,
    },
    partition::VertexPartition,
    store::DocumentStore,
    transport::{
        ConductorEvent, MessageBatch, StepCommand, StepReport, Transport, WorkerCommand,
    },
};

mod context;
mod exchange;

pub struct Worker {
    server: String,
    num_local_workers: usize,
    store: Arc<dyn DocumentStore>,
    registry: AlgorithmRegistry,
    transport: Arc<dyn Transport>,
    executions: DashMap<ExecutionId, Arc<WorkerExecution>>,
}

impl Worker {
    pub fn new(
        server: impl Into<String>,
        num_local_workers: usize,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server: server.into(),
            num_local_workers: num_local_workers.max(1),
            store,
            registry,
            transport,
            executions: Default::default(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the worker holds state for an execution.
    pub fn has_execution(&self, execution: ExecutionId) -> bool {
        self.executions.contains_key(&execution)
    }

    /// Entry point for every payload addressed to this server.
    ///
    /// Steps and cleanups run in the background; message batches are staged
    /// before this returns.
    pub async fn handle_command(self: &Arc<Self>, command: WorkerCommand) -> Result<()> {
        match command {
            WorkerCommand::NextStep(command) => {
                let worker = self.clone();
                tokio::spawn(async move { worker.next_step(command).await });
            }
            WorkerCommand::Messages(batch) => self.receive(batch),
            WorkerCommand::CleanUp { execution } => {
                let worker = self.clone();
                tokio::spawn(async move { worker.clean_up(execution).await });
            }
        }
        Ok(())
    }

    fn receive(&self, batch: MessageBatch) {
        match self.executions.get(&batch.execution) {
            Some(execution) => execution.inbox.deliver(batch.step, batch.messages),
            None => warn!(
                execution = %batch.execution,
                count = batch.messages.len(),
                "dropping messages for unknown execution"
            ),
        }
    }

    #[instrument(skip_all, fields(server = %self.server, execution = %command.execution, step = command.step))]
    async fn next_step(self: Arc<Self>, command: StepCommand) {
        let execution = command.execution;
        let step = command.step;

        let report = if step == 0 {
            match self.setup(command).await {
                Ok(report) => report,
                Err(err) => StepReport::failure(step, &err),
            }
        } else {
            let found = self.executions.get(&execution).map(|e| e.value().clone());
            match found {
                Some(state) => state.execute_step(command).await,
                None => StepReport::failure(step, &PregelError::ExecutionNotFound(execution)),
            }
        };

        if let Some(err) = &report.error {
            warn!(%err, "step failed");
        }
        let event = ConductorEvent::FinishedStep {
            execution,
            server: self.server.clone(),
            report,
        };
        if let Err(err) = self.transport.send_to_conductor(event).await {
            error!("failed to report step: {err:#}");
        }
    }

    /// Load the local partitions of a new execution.
    async fn setup(&self, command: StepCommand) -> Result<StepReport, PregelError> {
        let setup = command.setup.ok_or_else(|| {
            PregelError::MessageMalformed("step 0 command without setup".to_string())
        })?;
        let algorithms = self.registry.resolve(&setup.algorithms)?;
        let mapping = Arc::new(setup.mapping);

        let partitions = {
            let store = self.store.clone();
            let mapping = mapping.clone();
            let server = self.server.clone();
            let workers = self.num_local_workers;
            tokio::task::spawn_blocking(move || {
                let shards = mapping.local_vertex_shards(&server);
                VertexPartition::load_all(&store, &mapping, &shards, workers)
            })
            .await
            .map_err(PregelError::internal)?
            .map_err(|err| PregelError::internal(format!("{err:#}")))?
        };

        let inbox = Arc::new(Inbox::new(self.num_local_workers));
        let loaded: usize = partitions.iter().map(VertexPartition::len).sum();
        let locals = partitions
            .into_iter()
            .enumerate()
            .map(|(index, partition)| {
                let queue = MessageQueue::new(index, inbox.clone(), algorithms.combiner.clone());
                Arc::new(Mutex::new(LocalWorker { partition, queue }))
            })
            .collect();

        let state = Arc::new(WorkerExecution {
            id: command.execution,
            server: self.server.clone(),
            algorithms,
            mapping,
            parameters: setup.parameters,
            transport: self.transport.clone(),
            inbox,
            exchange: LocalExchange::new(self.num_local_workers),
            locals,
            step: AtomicU64::new(0),
            step_lock: Mutex::new(()),
            failed: AtomicBool::new(false),
        });
        if self.executions.insert(command.execution, state).is_some() {
            warn!("execution was set up twice, replacing its state");
        }

        info!(vertices = loaded, "loaded partitions");
        Ok(StepReport::success(0, loaded as u64, 0, Map::new()))
    }

    /// Persist pending results and release the execution's state.
    #[instrument(skip(self), fields(server = %self.server))]
    async fn clean_up(self: Arc<Self>, execution: ExecutionId) {
        if let Some((_, state)) = self.executions.remove(&execution) {
            let _running = state.step_lock.lock().await;
            for local in &state.locals {
                let mut local = local.clone().lock_owned().await;
                let persisted =
                    tokio::task::spawn_blocking(move || local.partition.persist_pending()).await;
                match persisted {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("failed to persist results: {err:#}"),
                    Err(err) => error!("failed to persist results: {err}"),
                }
            }
            state.inbox.clear();
            state.exchange.discard();
            debug!("released execution state");
        }

        let event = ConductorEvent::FinishedCleanup {
            execution,
            server: self.server.clone(),
        };
        if let Err(err) = self.transport.send_to_conductor(event).await {
            error!("failed to acknowledge cleanup: {err:#}");
        }
    }
}

struct LocalWorker {
    partition: VertexPartition,
    queue: MessageQueue,
}

/// Outcome of one local worker for one step.
#[derive(Default)]
struct LocalOutcome {
    active: u64,
    messages: u64,
    data: Map<String, Value>,
    error: Option<PregelError>,
    outbox: Outbox,
}

impl LocalOutcome {
    fn failed(err: PregelError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }
}

/// State of one execution on one server.
struct WorkerExecution {
    id: ExecutionId,
    server: String,
    algorithms: Algorithms,
    mapping: Arc<Mapping>,
    parameters: Value,
    transport: Arc<dyn Transport>,
    inbox: Arc<Inbox>,
    exchange: LocalExchange,
    locals: Vec<Arc<Mutex<LocalWorker>>>,
    /// Last step started.
    step: AtomicU64,
    step_lock: Mutex<()>,
    /// Set when any local worker failed the current step.
    failed: AtomicBool,
}

impl WorkerExecution {
    async fn execute_step(self: Arc<Self>, command: StepCommand) -> StepReport {
        let step = command.step;
        let _running = self.step_lock.lock().await;

        let previous = self.step.load(Ordering::SeqCst);
        if step != previous + 1 {
            return StepReport::failure(
                step,
                &PregelError::Internal(format!(
                    "execution {} is at step {previous}, cannot run step {step}",
                    self.id
                )),
            );
        }
        self.step.store(step, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let globals = Arc::new(command.globals);
        let handles: Vec<_> = (0..self.locals.len())
            .map(|index| {
                let state = self.clone();
                let globals = globals.clone();
                tokio::spawn(state.run_local(index, step, command.final_step, globals))
            })
            .collect();

        let mut active = 0;
        let mut messages = 0;
        let mut data = Map::new();
        let mut first_error = None;
        for outcome in join_all(handles).await {
            let outcome = outcome.unwrap_or_else(|err| LocalOutcome::failed(PregelError::internal(err)));
            active += outcome.active;
            messages += outcome.messages;
            merge_data(&mut data, outcome.data);
            if first_error.is_none() {
                first_error = outcome.error;
            }
        }

        match first_error {
            Some(err) => StepReport::failure(step, &err),
            None => {
                debug!(active, messages, "step done");
                StepReport::success(step, active, messages, data)
            }
        }
    }

    /// Run one local worker through compute, exchange and dispatch.
    ///
    /// Reaches the exchange barrier exactly once, whatever happens before.
    async fn run_local(
        self: Arc<Self>,
        index: usize,
        step: u64,
        final_step: bool,
        globals: Arc<Value>,
    ) -> LocalOutcome {
        let local = self.locals[index].clone().lock_owned().await;
        let state = self.clone();
        let computed = tokio::task::spawn_blocking(move || {
            let mut local = local;
            state.compute(&mut local, step, final_step, &globals)
        })
        .await;

        let mut outcome =
            computed.unwrap_or_else(|err| LocalOutcome::failed(PregelError::internal(err)));
        if outcome.error.is_none() {
            let outbox = std::mem::take(&mut outcome.outbox);
            if let Err(err) = self.exchange.stage(outbox) {
                outcome.error = Some(PregelError::internal(format!("{err:#}")));
            }
        }
        if outcome.error.is_some() {
            self.failed.store(true, Ordering::SeqCst);
        }

        self.exchange.wait().await;

        let collected = self
            .exchange
            .collect(index, self.algorithms.combiner.as_deref());
        if !self.failed.load(Ordering::SeqCst) {
            if let Err(err) = self.dispatch(step, collected).await {
                outcome.error = Some(PregelError::internal(format!("{err:#}")));
            }
        }
        outcome
    }

    fn compute(
        &self,
        local: &mut LocalWorker,
        step: u64,
        final_step: bool,
        globals: &Value,
    ) -> LocalOutcome {
        let LocalWorker { partition, queue } = local;
        if let Err(err) = queue.fill_queues(step) {
            return LocalOutcome::failed(err);
        }

        let program = match (final_step, &self.algorithms.final_step) {
            (true, Some(program)) => program.clone(),
            _ => self.algorithms.base.clone(),
        };
        let mut data = Map::new();
        let mut error = None;

        for index in 0..partition.len() {
            if partition.is_deleted(index) {
                queue.clear(partition.id(index));
                continue;
            }
            let id = partition.id(index).to_string();
            if !final_step && !partition.is_active(index) && !queue.has_messages(&id) {
                continue;
            }

            let mut messages = queue.load_vertex(&id);
            let mut vertex = partition.view(index);
            if !final_step {
                vertex.activate();
            }
            let mut ctx = ComputeContext {
                step,
                final_step,
                globals,
                parameters: &self.parameters,
                mapping: &self.mapping,
                queue: &mut *queue,
                data: &mut data,
                sender: vertex.location(),
            };

            let invoked = catch_unwind(AssertUnwindSafe(|| {
                program.compute(&mut vertex, &mut messages, &mut ctx)
            }));
            let result = match invoked {
                Ok(result) => result.map_err(PregelError::algorithm),
                Err(panic) => Err(PregelError::from_panic(panic)),
            }
            .and_then(|()| {
                vertex
                    .save()
                    .map_err(|err| PregelError::internal(format!("{err:#}")))
            });

            queue.clear(&id);
            if let Err(err) = result {
                error = Some(match err {
                    PregelError::AlgorithmRuntime(message) => {
                        PregelError::AlgorithmRuntime(format!("vertex `{id}`: {message}"))
                    }
                    err => err,
                });
                break;
            }
        }

        if error.is_some() {
            queue.discard_unread();
            return LocalOutcome {
                error,
                ..Default::default()
            };
        }

        let unread = queue.discard_unread();
        if !unread.is_empty() {
            warn!(
                execution = %self.id,
                step,
                count = unread.len(),
                "dropping messages for missing vertices"
            );
        }

        LocalOutcome {
            active: partition.active_count(),
            messages: queue.sent(),
            data,
            error: None,
            outbox: queue.take_outbox(),
        }
    }

    /// Deliver collected messages to the servers owning their shards.
    #[instrument(skip(self, outbox), level = "debug", fields(execution = %self.id))]
    async fn dispatch(&self, step: u64, outbox: Outbox) -> Result<()> {
        let mut local: Vec<(String, VertexMessages)> = Vec::new();
        let mut remote: HashMap<String, HashMap<String, VertexMessages>> = HashMap::new();

        for (shard, messages) in outbox {
            match self.mapping.server_of(&shard) {
                Some(server) if server == self.server => local.extend(messages),
                Some(server) => remote
                    .entry(server.to_string())
                    .or_default()
                    .extend(messages),
                None => warn!(%shard, "dropping messages for unknown shard"),
            }
        }

        self.inbox.deliver(step, local);
        for (server, messages) in remote {
            let batch = MessageBatch {
                execution: self.id,
                step,
                messages,
            };
            self.transport
                .send_to_worker(&server, WorkerCommand::Messages(batch))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test;
