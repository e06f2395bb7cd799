//! Simplified interface for interacting with queues.
//!
//! Queue based transports need very little from a broker: named FIFO queues,
//! publishing, and a consumer stream. Connection management, queue
//! declaration, queue consumption and message publishing are the only
//! operations supported.
//!
//! Payload ordering matters to the engine. A worker publishes its message
//! batches for a peer before it reports the step to the conductor, and the
//! conductor publishes the next step command after every report arrived, so a
//! single FIFO queue per server keeps batches ahead of the command that reads
//! them. Implementations must therefore deliver payloads of one queue in
//! publish order to a single consumer.

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use crate::{acker::Acker, serializer::Serializable};

/// A connection to a queue broker.
///
/// Connections should be cheap to clone such that references need not be passed
/// around.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    type QueueHandle: QueueHandle;

    /// Close the connection.
    async fn close(&self) -> Result<()>;

    /// Declare a queue.
    ///
    /// Queue declaration is idempotent: it instantiates the queue if it does
    /// not exist, and otherwise returns the existing queue.
    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle>;

    /// Delete the queue.
    async fn delete_queue(&self, name: &str) -> Result<()>;
}

/// A handle to a queue.
///
/// Handles should be cheap to clone such that references need not be passed
/// around.
#[async_trait]
pub trait QueueHandle: Clone + Send + Sync + 'static {
    type Acker: Acker;
    type Consumer<T: Serializable>: Stream<Item = (T, Self::Acker)> + Send + Unpin;

    /// Publish a message to the queue.
    ///
    /// The implementation takes care of serializing the payload before
    /// publishing.
    async fn publish<PayloadTarget: Serializable>(&self, payload: &PayloadTarget) -> Result<()>;

    /// Declare a queue consumer.
    async fn declare_consumer<PayloadTarget: Serializable>(
        &self,
        consumer_name: &str,
    ) -> Result<Self::Consumer<PayloadTarget>>;
}

pub mod amqp;
pub mod in_memory;
