use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use super::*;
use crate::{
    algorithm::{AlgorithmSpec, Combiner, VertexProgram},
    error::ErrorKind,
    message::MessageCursor,
    partition::VertexView,
    store::{memory::MemoryStore, CollectionOptions, GraphDefinition},
    transport::ExecutionSetup,
};

const EXECUTION: ExecutionId = ExecutionId(1);

/// Routes worker commands directly and records conductor events.
struct Recording {
    workers: DashMap<String, Weak<Worker>>,
    events: mpsc::UnboundedSender<ConductorEvent>,
}

#[async_trait]
impl Transport for Recording {
    async fn send_to_worker(&self, server: &str, command: WorkerCommand) -> Result<()> {
        let worker = self
            .workers
            .get(server)
            .and_then(|worker| worker.upgrade())
            .with_context(|| format!("no worker `{server}`"))?;
        worker.handle_command(command).await
    }

    async fn send_to_conductor(&self, event: ConductorEvent) -> Result<()> {
        self.events.send(event)?;
        Ok(())
    }
}

/// Sends 1 along every edge in step 1 and sums what arrives afterwards.
struct Spread;

impl VertexProgram for Spread {
    fn compute(
        &self,
        vertex: &mut VertexView<'_>,
        messages: &mut MessageCursor,
        ctx: &mut ComputeContext<'_>,
    ) -> anyhow::Result<()> {
        if ctx.step() == 1 {
            let edges = vertex.edges()?;
            for edge in &edges {
                ctx.send_along(edge, json!(1))?;
            }
            ctx.contribute("senders", json!(1));
        } else {
            let total: i64 = messages.data().filter_map(|value| value.as_i64()).sum();
            vertex.set_result(json!(total));
        }
        vertex.deactivate();
        Ok(())
    }
}

/// Like [`Spread`], but `v/c` deletes itself instead of sending.
struct Pruning;

impl VertexProgram for Pruning {
    fn compute(
        &self,
        vertex: &mut VertexView<'_>,
        messages: &mut MessageCursor,
        ctx: &mut ComputeContext<'_>,
    ) -> anyhow::Result<()> {
        if vertex.key() == "c" {
            vertex.delete();
            return Ok(());
        }
        Spread.compute(vertex, messages, ctx)
    }
}

struct Failing;

impl VertexProgram for Failing {
    fn compute(
        &self,
        _vertex: &mut VertexView<'_>,
        _messages: &mut MessageCursor,
        _ctx: &mut ComputeContext<'_>,
    ) -> anyhow::Result<()> {
        bail!("`undefinedIdentifier` is not defined")
    }
}

struct Panicking;

impl VertexProgram for Panicking {
    fn compute(
        &self,
        _vertex: &mut VertexView<'_>,
        _messages: &mut MessageCursor,
        _ctx: &mut ComputeContext<'_>,
    ) -> anyhow::Result<()> {
        panic!("out of bounds")
    }
}

fn sum(new: Value, old: Option<Value>) -> Value {
    json!(new.as_i64().unwrap_or(0) + old.and_then(|v| v.as_i64()).unwrap_or(0))
}

fn registry() -> AlgorithmRegistry {
    let registry = AlgorithmRegistry::new();
    registry.register_program("spread", Spread);
    registry.register_program("pruning", Pruning);
    registry.register_program("failing", Failing);
    registry.register_program("panicking", Panicking);
    registry.register_combiner("sum", sum);
    registry
}

struct Cluster {
    store: Arc<MemoryStore>,
    mapping: Mapping,
    workers: Vec<Arc<Worker>>,
    events: Mutex<mpsc::UnboundedReceiver<ConductorEvent>>,
}

impl Cluster {
    fn new(servers: &[&str]) -> Self {
        let store = Arc::new(MemoryStore::new(servers.iter().copied()));
        store
            .create_collection("v", CollectionOptions::vertex(4))
            .unwrap();
        store
            .create_collection("e", CollectionOptions::edge_like("v", 4))
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "g".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec!["e".to_string()],
            })
            .unwrap();
        for key in ["a", "b", "c", "d", "e", "f"] {
            store.insert("v", json!({ "_key": key })).unwrap();
        }
        for (from, to) in [("a", "b"), ("a", "c"), ("b", "c"), ("d", "c"), ("e", "f")] {
            store
                .insert("e", json!({"_from": format!("v/{from}"), "_to": format!("v/{to}")}))
                .unwrap();
        }
        let mapping = Mapping::create(&*store, "g", EXECUTION).unwrap();

        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Recording {
            workers: DashMap::new(),
            events,
        });
        let workers: Vec<_> = servers
            .iter()
            .map(|server| {
                let worker = Worker::new(
                    *server,
                    4,
                    store.clone(),
                    registry(),
                    transport.clone(),
                );
                transport
                    .workers
                    .insert(server.to_string(), Arc::downgrade(&worker));
                worker
            })
            .collect();

        Self {
            store,
            mapping,
            workers,
            events: Mutex::new(receiver),
        }
    }

    async fn next_event(&self) -> ConductorEvent {
        let mut events = self.events.lock().await;
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("worker did not answer")
            .expect("event channel closed")
    }

    async fn broadcast(&self, command: WorkerCommand) {
        for worker in &self.workers {
            worker.handle_command(command.clone()).await.unwrap();
        }
    }

    /// Run a step on every worker and return the reports, keyed by server.
    async fn step(&self, step: u64, algorithms: Option<AlgorithmSpec>) -> Vec<(String, StepReport)> {
        let setup = algorithms.map(|algorithms| ExecutionSetup {
            algorithms,
            mapping: self.mapping.clone(),
            parameters: Value::Null,
        });
        self.broadcast(WorkerCommand::NextStep(StepCommand {
            execution: EXECUTION,
            step,
            final_step: false,
            setup,
            globals: Value::Null,
        }))
        .await;

        let mut reports = Vec::new();
        for _ in &self.workers {
            match self.next_event().await {
                ConductorEvent::FinishedStep { server, report, .. } => reports.push((server, report)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports
    }

    async fn clean_up(&self) {
        self.broadcast(WorkerCommand::CleanUp {
            execution: EXECUTION,
        })
        .await;
        for _ in &self.workers {
            assert!(matches!(
                self.next_event().await,
                ConductorEvent::FinishedCleanup { .. }
            ));
        }
    }

    fn result(&self, key: &str) -> Value {
        self.store
            .document("pregel_1_v", key)
            .unwrap()
            .map(|document| document["result"].clone())
            .unwrap_or(Value::Null)
    }
}

fn totals(reports: &[(String, StepReport)]) -> (u64, u64) {
    reports.iter().fold((0, 0), |(active, messages), (_, report)| {
        assert_eq!(report.error, None);
        (
            active + report.active.unwrap_or_default(),
            messages + report.messages.unwrap_or_default(),
        )
    })
}

async fn spread_over(servers: &[&str]) {
    let cluster = Cluster::new(servers);
    let spec = AlgorithmSpec::new("spread").with_aggregator("sum");

    let setup = cluster.step(0, Some(spec)).await;
    assert_eq!(totals(&setup), (6, 0));

    let first = cluster.step(1, None).await;
    assert_eq!(totals(&first), (0, 5));
    let senders: i64 = first
        .iter()
        .filter_map(|(_, report)| report.data.as_ref())
        .filter_map(|data| data["senders"].as_i64())
        .sum();
    assert_eq!(senders, 6);

    let second = cluster.step(2, None).await;
    assert_eq!(totals(&second), (0, 0));

    cluster.clean_up().await;
    for worker in &cluster.workers {
        assert!(!worker.has_execution(EXECUTION));
    }
    assert_eq!(cluster.result("c"), json!(3));
    assert_eq!(cluster.result("b"), json!(1));
    assert_eq!(cluster.result("f"), json!(1));
    assert_eq!(cluster.result("a"), Value::Null);
    assert_eq!(cluster.store.count("pregel_1_v").unwrap(), 6);
    assert_eq!(cluster.store.count("pregel_1_e").unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn runs_steps_on_a_single_server() {
    spread_over(&["db1"]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exchanges_messages_between_servers() {
    spread_over(&["db1", "db2", "db3"]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn messages_to_deleted_vertices_are_dropped() {
    let cluster = Cluster::new(&["db1", "db2"]);
    let spec = AlgorithmSpec::new("pruning").with_aggregator("sum");
    cluster.step(0, Some(spec)).await;

    assert_eq!(totals(&cluster.step(1, None).await), (0, 5));
    assert_eq!(totals(&cluster.step(2, None).await), (0, 0));
    assert_eq!(totals(&cluster.step(3, None).await), (0, 0));

    cluster.clean_up().await;
    assert_eq!(cluster.result("b"), json!(1));
    assert_eq!(cluster.result("f"), json!(1));
    assert_eq!(cluster.store.document("pregel_1_v", "c").unwrap(), None);
    assert_eq!(cluster.store.count("pregel_1_v").unwrap(), 5);
    assert_eq!(cluster.store.count("pregel_1_e").unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn algorithm_errors_are_reported() {
    for program in ["failing", "panicking"] {
        let cluster = Cluster::new(&["db1"]);
        cluster.step(0, Some(AlgorithmSpec::new(program))).await;

        let reports = cluster.step(1, None).await;
        let error = reports[0].1.error.clone().expect("step must fail");
        assert_eq!(error.kind, ErrorKind::AlgorithmRuntime, "{program}");
        assert!(error.message.contains("vertex `v/"), "{}", error.message);
        cluster.clean_up().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn setup_rejects_unknown_algorithms() {
    let cluster = Cluster::new(&["db1"]);

    let reports = cluster.step(0, Some(AlgorithmSpec::new("missing"))).await;

    let error = reports[0].1.error.clone().expect("setup must fail");
    assert_eq!(error.kind, ErrorKind::BadParameter);
    assert!(!cluster.workers[0].has_execution(EXECUTION));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn steps_must_follow_each_other() {
    let cluster = Cluster::new(&["db1"]);
    cluster.step(0, Some(AlgorithmSpec::new("spread"))).await;

    let reports = cluster.step(2, None).await;

    let error = reports[0].1.error.clone().expect("skipped step must fail");
    assert_eq!(error.kind, ErrorKind::Internal);
}

#[test]
fn sum_is_a_combiner() {
    let combiner: &dyn Combiner = &sum;
    assert_eq!(combiner.combine(json!(2), Some(json!(3))), json!(5));
}
