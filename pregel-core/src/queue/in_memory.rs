//! An in-memory implementation of [`Connection`] and [`QueueHandle`].
//!
//! Useful for tests and for emulating a multi-server cluster inside one
//! process (see [`Runtime::in_memory`](crate::runtime::Runtime::in_memory)).
//! Payloads are serialized on publish and deserialized on consumption so the
//! emulation exercises the same wire format as a real broker.
//!
//! ```
//! use pregel::queue::{Connection, QueueHandle, in_memory::InMemoryConnection};
//! use pregel::serializer::Serializer;
//! use futures::StreamExt;
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = InMemoryConnection::new(Serializer::Cbor);
//!     let queue = connection.declare_queue("pregel-worker-db1").await?;
//!
//!     queue.publish(&"hello".to_string()).await?;
//!
//!     let mut consumer = queue.declare_consumer::<String>("db1").await?;
//!     let (payload, _acker) = consumer.next().await.unwrap();
//!     assert_eq!(payload, "hello");
//!     Ok(())
//! }
//! ```
use std::{collections::VecDeque, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::{lock::Mutex, stream::BoxStream, StreamExt};
use tokio::sync::Semaphore;
use tracing::error;

use super::{Connection, QueueHandle};
use crate::{
    acker::NoopAcker,
    serializer::{Serializable, Serializer},
};

/// An in-memory queue broker.
///
/// Each clone of the connection maintains references to the same underlying
/// queues, which makes a clone behave like another connection to the same
/// broker.
#[derive(Clone)]
pub struct InMemoryConnection {
    queues: Arc<DashMap<String, InMemoryQueueHandle>>,
    serializer: Serializer,
}

impl InMemoryConnection {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            queues: Default::default(),
            serializer,
        }
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    type QueueHandle = InMemoryQueueHandle;

    /// Closes every queue. Pending consumers terminate.
    async fn close(&self) -> Result<()> {
        for queue in self.queues.iter() {
            queue.available.close();
        }

        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let queue = InMemoryQueueHandle::new(self.serializer);
                entry.insert(queue.clone());
                Ok(queue)
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.available.close();
        }

        Ok(())
    }
}

/// A FIFO queue of serialized payloads.
///
/// # Design
/// Payloads are kept as raw bytes behind a mutex. A semaphore counts the
/// available payloads: consumers acquire (and forget) one permit per payload
/// before popping it, which delivers every payload to exactly one consumer and
/// parks consumers while the queue is empty. Closing the semaphore terminates
/// all consumers.
#[derive(Clone)]
pub struct InMemoryQueueHandle {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
    available: Arc<Semaphore>,
    serializer: Serializer,
}

impl InMemoryQueueHandle {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            messages: Default::default(),
            available: Arc::new(Semaphore::new(0)),
            serializer,
        }
    }

    async fn next_payload<T: Serializable>(&self) -> Option<T> {
        loop {
            let permit = self.available.acquire().await.ok()?;
            permit.forget();
            let bytes = self.messages.lock().await.pop_front()?;
            match self.serializer.from_bytes(&bytes) {
                Ok(payload) => return Some(payload),
                Err(err) => error!("dropping undeliverable payload: {err}"),
            }
        }
    }
}

#[async_trait]
impl QueueHandle for InMemoryQueueHandle {
    type Acker = NoopAcker;
    type Consumer<T: Serializable> = BoxStream<'static, (T, NoopAcker)>;

    async fn publish<PayloadTarget: Serializable>(&self, payload: &PayloadTarget) -> Result<()> {
        if self.available.is_closed() {
            bail!("queue is closed");
        }
        let bytes = Bytes::from(self.serializer.to_bytes(payload)?);
        self.messages.lock().await.push_back(bytes);
        self.available.add_permits(1);

        Ok(())
    }

    async fn declare_consumer<PayloadTarget: Serializable>(
        &self,
        _consumer_name: &str,
    ) -> Result<Self::Consumer<PayloadTarget>> {
        let stream = futures::stream::unfold(self.clone(), |queue| async move {
            let payload = queue.next_payload::<PayloadTarget>().await?;
            Some(((payload, NoopAcker::new()), queue))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod helpers {
    use std::time::Duration;

    use futures::Future;
    use serde::{Deserialize, Serialize};
    use tokio::task::{JoinError, JoinHandle};

    use super::*;
    use crate::acker::Acker;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
    pub(super) struct Payload {
        step: u64,
    }

    pub(super) fn payload(step: u64) -> Payload {
        Payload { step }
    }

    pub(super) async fn with_timeout<O, F: Future<Output = Result<O, JoinError>>>(
        fut: F,
    ) -> Option<O> {
        tokio::select! {
            result = fut => Some(result.unwrap()),
            _ = tokio::time::sleep(Duration::from_millis(10)) => None,
        }
    }

    pub(super) fn consume_next(queue: &InMemoryQueueHandle, name: &'static str) -> JoinHandle<Payload> {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut stream = queue.declare_consumer::<Payload>(name).await.unwrap();
            let (payload, acker) = stream.next().await.unwrap();
            acker.ack().await.unwrap();
            payload
        })
    }

    pub(super) async fn queue_handle() -> InMemoryQueueHandle {
        let connection = InMemoryConnection::new(Serializer::Cbor);
        connection.declare_queue("pregel-worker-db1").await.unwrap()
    }
}

#[cfg(test)]
mod exactly_once {
    use tokio::{join, try_join};

    use super::helpers::*;
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_message_delivers_once_publish_first() {
        let queue = queue_handle().await;
        queue.publish(&payload(1)).await.unwrap();

        let (r1, r2) = (consume_next(&queue, "1"), consume_next(&queue, "2"));
        let (r1, r2) = join!(with_timeout(r1), with_timeout(r2));

        assert!([&r1, &r2].iter().any(|r| r.is_none()));
        assert!([&r1, &r2].iter().any(|r| **r == Some(payload(1))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_message_delivers_once_publish_last() {
        let queue = queue_handle().await;

        let (r1, r2) = (consume_next(&queue, "1"), consume_next(&queue, "2"));
        queue.publish(&payload(1)).await.unwrap();
        let (r1, r2) = join!(with_timeout(r1), with_timeout(r2));

        assert!([&r1, &r2].iter().any(|r| r.is_none()));
        assert!([&r1, &r2].iter().any(|r| **r == Some(payload(1))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn double_message_delivers_once() {
        let queue = queue_handle().await;

        let (r1, r2) = (consume_next(&queue, "1"), consume_next(&queue, "2"));
        queue.publish(&payload(1)).await.unwrap();
        queue.publish(&payload(2)).await.unwrap();
        let (r1, r2) = try_join!(r1, r2).unwrap();

        assert_ne!(r1, r2)
    }
}

#[cfg(test)]
mod ordering {
    use super::helpers::*;
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_consumer_sees_publish_order() {
        let queue = queue_handle().await;
        for step in 0..50 {
            queue.publish(&payload(step)).await.unwrap();
        }

        let consumer = queue.declare_consumer::<Payload>("db1").await.unwrap();
        let received: Vec<_> = consumer.take(50).map(|(p, _)| p).collect().await;

        assert_eq!(received, (0..50).map(payload).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn deleting_queue_ends_consumers() {
        let connection = InMemoryConnection::new(Serializer::Json);
        let queue = connection.declare_queue("pregel-conductor").await.unwrap();
        let mut consumer = queue.declare_consumer::<Payload>("conductor").await.unwrap();

        connection.delete_queue("pregel-conductor").await.unwrap();

        assert!(consumer.next().await.is_none());
        assert!(queue.publish(&payload(1)).await.is_err());
    }
}
