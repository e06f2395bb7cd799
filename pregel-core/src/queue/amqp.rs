//! AMQP queue binding using [`lapin`].
//!
//! # Example
//!
//! ```no_run
//! use pregel::{
//!     serializer::Serializer,
//!     acker::Acker,
//!     queue::{Connection, QueueHandle, amqp::{AMQPConnection, AMQPConnectionOptions}},
//! };
//! use anyhow::Result;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = AMQPConnection::new(AMQPConnectionOptions {
//!         uri: "amqp://localhost:5672",
//!         qos: Some(16),
//!         serializer: Serializer::Cbor,
//!     })
//!     .await?;
//!     let queue = conn.declare_queue("pregel-conductor").await?;
//!
//!     queue.publish(&"hello".to_string()).await?;
//!
//!     let mut consumer = queue.declare_consumer::<String>("conductor").await?;
//!     while let Some((payload, delivery)) = consumer.next().await {
//!         delivery.ack().await?;
//!         break;
//!     }
//!
//!     Ok(())
//! }
//! ```
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::{ready, Stream};
use lapin::{
    options::{QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
};
use pin_project::pin_project;
use tracing::{error, instrument, warn};

use super::{Connection, QueueHandle};
use crate::{
    acker::Acker,
    serializer::{Serializable, Serializer},
};

/// How long to keep retrying the initial broker connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for creating an [`AMQPConnection`].
pub struct AMQPConnectionOptions<'a> {
    /// The AMQP URI to connect to.
    pub uri: &'a str,
    /// The number of unacknowledged deliveries the broker hands to a consumer
    /// before waiting for acknowledgements.
    /// See <https://www.rabbitmq.com/consumer-prefetch.html>
    pub qos: Option<u16>,
    pub serializer: Serializer,
}

/// A connection to an AMQP broker.
#[derive(Clone, Debug)]
pub struct AMQPConnection {
    channel: lapin::Channel,
    connection: Arc<lapin::Connection>,
    serializer: Serializer,
}

impl AMQPConnection {
    /// Connect to the broker, retrying with exponential backoff while it is
    /// unreachable.
    pub async fn new(options: AMQPConnectionOptions<'_>) -> Result<Self> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(CONNECT_TIMEOUT),
            ..Default::default()
        };
        let uri = options.uri.to_string();

        let connection = backoff::future::retry(policy, || {
            let uri = uri.clone();
            async move {
                let properties = lapin::ConnectionProperties::default()
                    .with_executor(tokio_executor_trait::Tokio::current())
                    .with_reactor(tokio_reactor_trait::Tokio);
                lapin::Connection::connect(&uri, properties)
                    .await
                    .map_err(|err| {
                        warn!("AMQP broker unavailable, retrying: {err}");
                        backoff::Error::transient(err)
                    })
            }
        })
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(options.qos.unwrap_or(1), Default::default())
            .await?;

        Ok(Self {
            channel,
            connection: Arc::new(connection),
            serializer: options.serializer,
        })
    }
}

#[async_trait]
impl Connection for AMQPConnection {
    type QueueHandle = AMQPQueueHandle;

    async fn close(&self) -> Result<()> {
        _ = self.channel.close(200, "Goodbye").await;
        _ = self.connection.close(200, "Goodbye").await;

        Ok(())
    }

    /// Declare a durable AMQP queue with the given name.
    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(AMQPQueueHandle {
            channel: self.channel.clone(),
            name: name.to_string(),
            serializer: self.serializer,
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;

        Ok(())
    }
}

/// A handle to an AMQP queue.
#[derive(Clone)]
pub struct AMQPQueueHandle {
    channel: lapin::Channel,
    name: String,
    serializer: Serializer,
}

#[async_trait]
impl QueueHandle for AMQPQueueHandle {
    type Acker = AMQPAcker;
    type Consumer<T: Serializable> = AMQPConsumerStream<T>;

    #[instrument(skip_all, level = "trace")]
    async fn publish<PayloadTarget: Serializable>(&self, payload: &PayloadTarget) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.name,
                Default::default(),
                &self.serializer.to_bytes(payload)?,
                lapin::BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn declare_consumer<PayloadTarget: Serializable>(
        &self,
        consumer_name: &str,
    ) -> Result<Self::Consumer<PayloadTarget>> {
        let consumer = self
            .channel
            .basic_consume(
                &self.name,
                consumer_name,
                Default::default(),
                Default::default(),
            )
            .await?;

        Ok(AMQPConsumerStream {
            inner: consumer,
            serializer: self.serializer,
            _phantom: std::marker::PhantomData,
        })
    }
}

/// Deserializing stream over a [`lapin::Consumer`].
///
/// Deliveries that fail to deserialize are logged and rejected; the stream
/// moves on to the next delivery.
#[pin_project]
pub struct AMQPConsumerStream<PayloadTarget> {
    #[pin]
    inner: lapin::Consumer,
    serializer: Serializer,
    _phantom: std::marker::PhantomData<PayloadTarget>,
}

impl<PayloadTarget: Serializable> Stream for AMQPConsumerStream<PayloadTarget> {
    type Item = (PayloadTarget, AMQPAcker);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(delivery)) => match this.serializer.from_bytes(&delivery.data) {
                    Ok(payload) => return Poll::Ready(Some((payload, AMQPAcker { delivery }))),
                    Err(err) => {
                        error!("Error deserializing message, error: {err}");
                        let acker = delivery.acker;
                        tokio::spawn(async move {
                            _ = acker.reject(Default::default()).await;
                        });
                    }
                },
                Some(Err(err)) => error!("Error receiving message, error: {err}"),
                None => return Poll::Ready(None),
            }
        }
    }
}

#[derive(Debug)]
pub struct AMQPAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acker for AMQPAcker {
    async fn ack(&self) -> Result<()> {
        Ok(self.delivery.ack(Default::default()).await?)
    }

    async fn nack(&self) -> Result<()> {
        Ok(self.delivery.nack(Default::default()).await?)
    }
}
