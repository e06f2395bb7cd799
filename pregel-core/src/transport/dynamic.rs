//! A queue transport whose broker is chosen at runtime.
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{queue::QueueTransport, ConductorEvent, Transport, WorkerCommand};
use crate::{
    conductor::Conductor,
    config::{self, Config},
    queue::{
        amqp::{AMQPConnection, AMQPConnectionOptions},
        in_memory::InMemoryConnection,
    },
    serializer::Serializer,
    worker::Worker,
};

/// Number of unacknowledged deliveries an AMQP consumer may hold.
const AMQP_QOS: u16 = 16;

#[derive(Clone)]
pub enum DynamicTransport {
    Amqp(QueueTransport<AMQPConnection>),
    InMemory(QueueTransport<InMemoryConnection>),
}

impl DynamicTransport {
    /// Connect to the broker named by `config.runtime`.
    ///
    /// [`config::Runtime::Local`] uses no queues and is rejected.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let serializer = Serializer::from(config);
        match config.runtime {
            config::Runtime::Amqp => {
                let uri = config
                    .amqp_uri
                    .as_deref()
                    .context("the AMQP runtime requires an AMQP URI")?;
                let connection = AMQPConnection::new(AMQPConnectionOptions {
                    uri,
                    qos: Some(AMQP_QOS),
                    serializer,
                })
                .await?;
                Ok(Self::Amqp(QueueTransport::new(connection, &*config.queue_prefix)))
            }
            config::Runtime::InMemory => Ok(Self::InMemory(QueueTransport::new(
                InMemoryConnection::new(serializer),
                &*config.queue_prefix,
            ))),
            config::Runtime::Local => bail!("the local runtime does not use queues"),
        }
    }

    pub async fn serve_worker(&self, worker: Arc<Worker>, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.serve_worker(worker, cancel).await,
            Self::InMemory(transport) => transport.serve_worker(worker, cancel).await,
        }
    }

    pub async fn serve_conductor(
        &self,
        conductor: Arc<Conductor>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.serve_conductor(conductor, cancel).await,
            Self::InMemory(transport) => transport.serve_conductor(conductor, cancel).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.close().await,
            Self::InMemory(transport) => transport.close().await,
        }
    }
}

#[async_trait]
impl Transport for DynamicTransport {
    async fn send_to_worker(&self, server: &str, command: WorkerCommand) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.send_to_worker(server, command).await,
            Self::InMemory(transport) => transport.send_to_worker(server, command).await,
        }
    }

    async fn send_to_conductor(&self, event: ConductorEvent) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.send_to_conductor(event).await,
            Self::InMemory(transport) => transport.send_to_conductor(event).await,
        }
    }
}
