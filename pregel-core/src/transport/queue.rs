//! The protocol over a queue broker.
//!
//! Every server consumes its own queue, `{prefix}-worker-{server}`, and the
//! conductor consumes `{prefix}-conductor`. Deliveries are processed one at a
//! time in queue order, which gives the per-server ordering the protocol
//! relies on.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, Instrument};

use super::{ConductorEvent, Transport, WorkerCommand};
use crate::{
    acker::Acker,
    conductor::Conductor,
    queue::{Connection, QueueHandle},
    serializer::Serializable,
    worker::Worker,
};

#[derive(Clone)]
pub struct QueueTransport<C: Connection> {
    connection: C,
    prefix: String,
    handles: Arc<DashMap<String, C::QueueHandle>>,
}

impl<C: Connection> QueueTransport<C> {
    pub fn new(connection: C, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            handles: Default::default(),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn worker_queue(&self, server: &str) -> String {
        format!("{}-worker-{server}", self.prefix)
    }

    pub fn conductor_queue(&self) -> String {
        format!("{}-conductor", self.prefix)
    }

    async fn queue(&self, name: &str) -> Result<C::QueueHandle> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.connection.declare_queue(name).await?;
        self.handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    async fn publish<T: Serializable>(&self, queue: &str, payload: &T) -> Result<()> {
        self.queue(queue).await?.publish(payload).await
    }

    /// Feed the commands of `worker`'s queue into it until `cancel` fires or
    /// the queue closes.
    pub async fn serve_worker(&self, worker: Arc<Worker>, cancel: CancellationToken) -> Result<()> {
        let queue = self.queue(&self.worker_queue(worker.server())).await?;
        let mut consumer = queue
            .declare_consumer::<WorkerCommand>(worker.server())
            .await?;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = consumer.next() => next,
            };
            let Some((command, acker)) = next else {
                break;
            };

            let span = debug_span!("worker_command", server = worker.server());
            match worker.handle_command(command).instrument(span).await {
                Ok(()) => acker.ack().await?,
                Err(err) => {
                    error!("worker failed to handle command: {err:#}");
                    acker.nack().await?;
                }
            }
        }

        debug!(server = worker.server(), "worker queue closed");
        Ok(())
    }

    /// Feed the conductor queue into `conductor` until `cancel` fires or the
    /// queue closes.
    ///
    /// Events the conductor rejects are acknowledged and logged: a rejected
    /// report stays rejected on redelivery.
    pub async fn serve_conductor(
        &self,
        conductor: Arc<Conductor>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let queue = self.queue(&self.conductor_queue()).await?;
        let mut consumer = queue.declare_consumer::<ConductorEvent>("conductor").await?;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = consumer.next() => next,
            };
            let Some((event, acker)) = next else {
                break;
            };

            let span = debug_span!("conductor_event", execution = %event.execution());
            if let Err(err) = conductor.handle_event(event).instrument(span).await {
                error!(code = err.code(), "conductor rejected event: {err}");
            }
            acker.ack().await?;
        }

        debug!("conductor queue closed");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

#[async_trait]
impl<C: Connection> Transport for QueueTransport<C> {
    async fn send_to_worker(&self, server: &str, command: WorkerCommand) -> Result<()> {
        self.publish(&self.worker_queue(server), &command).await
    }

    async fn send_to_conductor(&self, event: ConductorEvent) -> Result<()> {
        self.publish(&self.conductor_queue(), &event).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        common::ExecutionId, queue::in_memory::InMemoryConnection, serializer::Serializer,
        transport::StepReport,
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn events_reach_the_conductor_queue_in_order() {
        let transport = QueueTransport::new(InMemoryConnection::new(Serializer::Cbor), "test");
        let queue = transport
            .connection()
            .declare_queue("test-conductor")
            .await
            .unwrap();
        let mut consumer = queue
            .declare_consumer::<ConductorEvent>("conductor")
            .await
            .unwrap();

        for step in 0..3 {
            transport
                .send_to_conductor(ConductorEvent::FinishedStep {
                    execution: ExecutionId(5),
                    server: "db1".to_string(),
                    report: StepReport::success(step, 1, 0, Default::default()),
                })
                .await
                .unwrap();
        }

        for step in 0..3 {
            let (event, acker) = consumer.next().await.unwrap();
            acker.ack().await.unwrap();
            match event {
                ConductorEvent::FinishedStep { report, .. } => assert_eq!(report.step, step),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn queue_names_carry_the_prefix() {
        let transport = QueueTransport::new(InMemoryConnection::new(Serializer::Json), "pregel");

        assert_eq!(transport.worker_queue("db2"), "pregel-worker-db2");
        assert_eq!(transport.conductor_queue(), "pregel-conductor");
    }
}
