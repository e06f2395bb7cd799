//! Assembly of conductors and workers.
//!
//! It provides two runtimes:
//! - [`Runtime`]: hosts the [`Conductor`], and for the local and in-memory
//!   runtimes also the workers of every server.
//! - [`WorkerRuntime`]: hosts the [`Worker`] of one server in a queue based
//!   deployment.
//!
//! Which transport connects them follows [`Config::runtime`]:
//!
//! | runtime    | transport                                   | workers            |
//! |------------|---------------------------------------------|--------------------|
//! | `local`    | [`LocalTransport`], direct calls            | in process         |
//! | `in-memory`| [`DynamicTransport`] over emulated queues   | in process, served |
//! | `amqp`     | [`DynamicTransport`] over an AMQP broker    | [`WorkerRuntime`]s |
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, error, Instrument};

use crate::{
    algorithm::AlgorithmRegistry,
    conductor::Conductor,
    config::{self, Config},
    queue::in_memory::InMemoryConnection,
    serializer::Serializer,
    store::DocumentStore,
    transport::{dynamic::DynamicTransport, local::LocalTransport, queue::QueueTransport},
    worker::Worker,
};

pub struct Runtime {
    conductor: Arc<Conductor>,
    workers: Vec<Arc<Worker>>,
    transport: Option<DynamicTransport>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build the runtime selected by `config.runtime`.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
    ) -> Result<Self> {
        match config.runtime {
            config::Runtime::Local => Ok(Self::in_process(config, store, registry)),
            config::Runtime::InMemory => Ok(Self::in_memory(config, store, registry)),
            config::Runtime::Amqp => {
                let transport = DynamicTransport::from_config(config).await?;
                Ok(Self::served(config, store, registry, transport, false))
            }
        }
    }

    /// Conductor and one worker per server of `config.cluster()`, calling
    /// each other directly.
    pub fn in_process(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
    ) -> Self {
        let transport = LocalTransport::new();
        let workers: Vec<_> = config
            .cluster()
            .into_iter()
            .map(|server| {
                let worker = Worker::new(
                    server,
                    config.num_local_workers,
                    store.clone(),
                    registry.clone(),
                    transport.clone(),
                );
                transport.register_worker(&worker);
                worker
            })
            .collect();
        let conductor = Conductor::new(store, registry, transport.clone(), config.step_timeout());
        transport.register_conductor(&conductor);

        Self {
            conductor,
            workers,
            transport: None,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Conductor and one worker per server of `config.cluster()`, talking
    /// over in-memory queues. Must be called within a tokio runtime.
    pub fn in_memory(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
    ) -> Self {
        let connection = InMemoryConnection::new(Serializer::from(config));
        let transport =
            DynamicTransport::InMemory(QueueTransport::new(connection, &*config.queue_prefix));
        Self::served(config, store, registry, transport, true)
    }

    fn served(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
        transport: DynamicTransport,
        with_workers: bool,
    ) -> Self {
        let cancel = CancellationToken::new();
        let shared = Arc::new(transport.clone());
        let conductor = Conductor::new(
            store.clone(),
            registry.clone(),
            shared.clone(),
            config.step_timeout(),
        );

        let mut handles = vec![spawn_serve(
            transport.clone(),
            cancel.clone(),
            debug_span!("conductor_loop"),
            {
                let conductor = conductor.clone();
                move |transport, cancel| async move {
                    transport.serve_conductor(conductor, cancel).await
                }
            },
        )];

        let mut workers = Vec::new();
        if with_workers {
            for server in config.cluster() {
                let worker = Worker::new(
                    server,
                    config.num_local_workers,
                    store.clone(),
                    registry.clone(),
                    shared.clone(),
                );
                handles.push(spawn_serve(
                    transport.clone(),
                    cancel.clone(),
                    debug_span!("worker_loop", server = worker.server()),
                    {
                        let worker = worker.clone();
                        move |transport, cancel| async move {
                            transport.serve_worker(worker, cancel).await
                        }
                    },
                ));
                workers.push(worker);
            }
        }

        Self {
            conductor,
            workers,
            transport: Some(transport),
            cancel,
            handles,
        }
    }

    pub fn conductor(&self) -> &Arc<Conductor> {
        &self.conductor
    }

    /// The in-process worker of `server`, if this runtime hosts it.
    pub fn worker(&self, server: &str) -> Option<&Arc<Worker>> {
        self.workers.iter().find(|worker| worker.server() == server)
    }

    /// Stop the serve loops and close the broker connection.
    pub async fn close(mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!("serve loop ended abnormally: {err}");
            }
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }
}

fn spawn_serve<F, Fut>(
    transport: DynamicTransport,
    cancel: CancellationToken,
    span: tracing::Span,
    serve: F,
) -> JoinHandle<()>
where
    F: FnOnce(DynamicTransport, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let serving = serve(transport, cancel);
    tokio::spawn(
        async move {
            if let Err(err) = serving.await {
                error!("serve loop failed: {err:#}");
            }
        }
        .instrument(span),
    )
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Hosts the worker of one server, fed from its queue.
pub struct WorkerRuntime {
    worker: Arc<Worker>,
    transport: DynamicTransport,
}

impl WorkerRuntime {
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        registry: AlgorithmRegistry,
    ) -> Result<Self> {
        let transport = DynamicTransport::from_config(config)
            .await
            .context("a worker runtime needs a queue based runtime")?;
        let worker = Worker::new(
            config.server_name.clone(),
            config.num_local_workers,
            store,
            registry,
            Arc::new(transport.clone()),
        );
        Ok(Self { worker, transport })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Serve the worker queue until `cancel` fires or the broker closes it.
    pub async fn main_loop(&self, cancel: CancellationToken) -> Result<()> {
        let span = debug_span!("worker_loop", server = self.worker.server());
        self.transport
            .serve_worker(self.worker.clone(), cancel)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::store::{memory::MemoryStore, CollectionOptions, GraphDefinition};

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn in_process_runtime_hosts_every_server() {
        let config = Config {
            servers: vec!["db1".to_string(), "db2".to_string()],
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(["db1", "db2"]));

        let runtime = Runtime::from_config(&config, store, AlgorithmRegistry::new())
            .await
            .unwrap();

        assert!(runtime.worker("db1").is_some());
        assert!(runtime.worker("db2").is_some());
        assert!(runtime.worker("db3").is_none());
        runtime.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn worker_runtime_rejects_the_local_runtime() {
        let store = Arc::new(MemoryStore::new(["db1"]));

        let result = WorkerRuntime::from_config(&Config::default(), store, AlgorithmRegistry::new()).await;

        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn in_memory_runtime_rejects_unknown_algorithms() {
        let config = Config {
            runtime: config::Runtime::InMemory,
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new([config.server_name.clone()]));
        store
            .create_collection("v", CollectionOptions::vertex(1))
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "g".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec![],
            })
            .unwrap();
        store.insert("v", json!({"_key": "1"})).unwrap();
        let registry = AlgorithmRegistry::new();
        let runtime = Runtime::in_memory(&config, store, registry);

        let err = runtime
            .conductor()
            .start_execution("missing", crate::algorithm::AlgorithmSpec::new("x"), Default::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::BadParameter);
        runtime.close().await.unwrap();
    }
}
