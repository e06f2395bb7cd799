//! Acknowledgement of queue deliveries.
//!
//! Every item yielded by a queue consumer is paired with an [`Acker`]. The
//! transport serve loops acknowledge a delivery once the command or event it
//! carries has been handed to the worker or conductor, so a broker can
//! redeliver payloads whose processing never started.
//!
//! ```
//! use pregel::acker::{Acker, NoopAcker};
//! use anyhow::Result;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let acker: Box<dyn Acker> = Box::new(NoopAcker::new());
//! acker.ack().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self) -> Result<()>;
}

#[async_trait]
impl<T: Acker + ?Sized> Acker for Box<T> {
    async fn ack(&self) -> Result<()> {
        (**self).ack().await
    }

    async fn nack(&self) -> Result<()> {
        (**self).nack().await
    }
}

#[async_trait]
impl<T: Acker + ?Sized> Acker for Arc<T> {
    async fn ack(&self) -> Result<()> {
        (**self).ack().await
    }

    async fn nack(&self) -> Result<()> {
        (**self).nack().await
    }
}

/// Acker for queues without delivery tracking, such as the in-memory queue.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopAcker;

impl NoopAcker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        Ok(())
    }
}
