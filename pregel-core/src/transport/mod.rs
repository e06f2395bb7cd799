//! How the conductor and the workers of an execution talk to each other.
//!
//! The protocol has two directions:
//! - [`WorkerCommand`]s flow to the worker of a named server: step commands
//!   and cleanup from the conductor, message batches from peer workers.
//! - [`ConductorEvent`]s flow to the conductor: step reports and cleanup
//!   acknowledgements.
//!
//! Every payload is [`Serializable`](crate::serializer::Serializable), so the
//! same protocol runs over direct calls ([`local::LocalTransport`]) and over
//! queues ([`queue::QueueTransport`], [`dynamic::DynamicTransport`]).
//!
//! # Ordering
//!
//! A worker dispatches its message batches for step `N` before it reports step
//! `N`, and the conductor sends step `N + 1` only after every report for step
//! `N` arrived. Transports must preserve the order of payloads sent to one
//! server, so that all batches for a step are delivered before the command
//! that reads them.
use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    algorithm::AlgorithmSpec,
    common::ExecutionId,
    error::{PregelError, ReportedError},
    mapping::Mapping,
    message::VertexMessages,
};

pub mod dynamic;
pub mod local;
pub mod queue;

/// Everything a worker needs to take part in an execution. Sent with step 0.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionSetup {
    pub algorithms: AlgorithmSpec,
    pub mapping: Mapping,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepCommand {
    pub execution: ExecutionId,
    pub step: u64,
    /// Run the final program instead of the base program.
    #[serde(default)]
    pub final_step: bool,
    #[serde(default)]
    pub setup: Option<ExecutionSetup>,
    #[serde(default)]
    pub globals: Value,
}

/// Progress of one server for one step.
///
/// `messages` and `active` are optional on the wire so that a malformed
/// report can be told apart from an empty one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: u64,
    #[serde(default)]
    pub messages: Option<u64>,
    #[serde(default)]
    pub active: Option<u64>,
    #[serde(default)]
    pub error: Option<ReportedError>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

impl StepReport {
    pub fn success(step: u64, active: u64, messages: u64, data: Map<String, Value>) -> Self {
        Self {
            step,
            messages: Some(messages),
            active: Some(active),
            error: None,
            data: (!data.is_empty()).then_some(data),
        }
    }

    pub fn failure(step: u64, err: &PregelError) -> Self {
        Self {
            step,
            messages: Some(0),
            active: Some(0),
            error: Some(err.into()),
            data: None,
        }
    }
}

/// Messages sent during `step` by one server to the vertices of another.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub execution: ExecutionId,
    pub step: u64,
    pub messages: HashMap<String, VertexMessages>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerCommand {
    NextStep(StepCommand),
    Messages(MessageBatch),
    CleanUp { execution: ExecutionId },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConductorEvent {
    FinishedStep {
        execution: ExecutionId,
        server: String,
        report: StepReport,
    },
    FinishedCleanup {
        execution: ExecutionId,
        server: String,
    },
}

impl ConductorEvent {
    pub fn execution(&self) -> ExecutionId {
        match self {
            Self::FinishedStep { execution, .. } | Self::FinishedCleanup { execution, .. } => {
                *execution
            }
        }
    }
}

/// Delivers protocol payloads between servers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver a command to the worker of `server`.
    async fn send_to_worker(&self, server: &str, command: WorkerCommand) -> Result<()>;

    /// Deliver an event to the conductor.
    async fn send_to_conductor(&self, event: ConductorEvent) -> Result<()>;
}
