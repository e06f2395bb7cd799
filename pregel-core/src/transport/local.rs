//! Direct calls between a conductor and workers sharing a process.
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use super::{ConductorEvent, Transport, WorkerCommand};
use crate::{conductor::Conductor, worker::Worker};

/// A [`Transport`] that hands payloads straight to the receiving component.
///
/// Components are held weakly: the transport is shared by the conductor and
/// every worker, and must not keep them alive.
#[derive(Default)]
pub struct LocalTransport {
    workers: DashMap<String, Weak<Worker>>,
    conductor: OnceLock<Weak<Conductor>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_worker(&self, worker: &Arc<Worker>) {
        self.workers
            .insert(worker.server().to_string(), Arc::downgrade(worker));
    }

    /// Route conductor events to `conductor`. Only the first registration
    /// takes effect.
    pub fn register_conductor(&self, conductor: &Arc<Conductor>) {
        let _ = self.conductor.set(Arc::downgrade(conductor));
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_to_worker(&self, server: &str, command: WorkerCommand) -> Result<()> {
        let worker = self
            .workers
            .get(server)
            .and_then(|worker| worker.upgrade())
            .with_context(|| format!("no worker registered for server `{server}`"))?;
        worker.handle_command(command).await
    }

    async fn send_to_conductor(&self, event: ConductorEvent) -> Result<()> {
        let conductor = self
            .conductor
            .get()
            .and_then(Weak::upgrade)
            .context("no conductor registered")?;
        conductor.handle_event(event).await?;
        Ok(())
    }
}
