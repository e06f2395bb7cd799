//! User supplied per-run logic.
//!
//! An execution is parameterized by up to four pieces of user code:
//! - a base [`VertexProgram`], invoked for active vertices and vertices with
//!   pending messages in every superstep,
//! - an optional final [`VertexProgram`], invoked once for every non-deleted
//!   vertex after the graph went quiet,
//! - an optional [`SuperstepHook`], invoked by the conductor between
//!   supersteps with the globals and the aggregated [`StepInfo`],
//! - an optional [`Combiner`], folding sender-less messages bound for the same
//!   vertex.
//!
//! Implementations are registered by name in an [`AlgorithmRegistry`] on
//! every server. An [`AlgorithmSpec`] names the pieces a run uses; it is what
//! travels between servers, and every server resolves it against its own
//! registry.
//!
//! # Example
//!
//! ```
//! use pregel::{
//!     algorithm::{AlgorithmRegistry, AlgorithmSpec, VertexProgram},
//!     message::MessageCursor,
//!     partition::VertexView,
//!     worker::ComputeContext,
//! };
//! use serde_json::{json, Value};
//!
//! /// Counts incoming messages.
//! struct Count;
//!
//! impl VertexProgram for Count {
//!     fn compute(
//!         &self,
//!         vertex: &mut VertexView<'_>,
//!         messages: &mut MessageCursor,
//!         _ctx: &mut ComputeContext<'_>,
//!     ) -> anyhow::Result<()> {
//!         vertex.set_result(json!(messages.len()));
//!         vertex.deactivate();
//!         Ok(())
//!     }
//! }
//!
//! let registry = AlgorithmRegistry::new();
//! registry.register_program("count", Count);
//! registry.register_combiner("sum", |new: Value, old: Option<Value>| {
//!     json!(new.as_f64().unwrap_or(0.0) + old.and_then(|v| v.as_f64()).unwrap_or(0.0))
//! });
//!
//! let spec = AlgorithmSpec::new("count").with_aggregator("sum");
//! assert!(registry.resolve(&spec).is_ok());
//! assert!(registry.resolve(&AlgorithmSpec::new("unknown")).is_err());
//! ```
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{PregelError, Result},
    message::MessageCursor,
    partition::VertexView,
    worker::ComputeContext,
};

/// Per-vertex computation of one superstep.
pub trait VertexProgram: Send + Sync + 'static {
    fn compute(
        &self,
        vertex: &mut VertexView<'_>,
        messages: &mut MessageCursor,
        ctx: &mut ComputeContext<'_>,
    ) -> anyhow::Result<()>;
}

/// Folds a message into the running aggregate of its target vertex.
///
/// The fold order across senders is unspecified: implementations must be
/// commutative and associative.
pub trait Combiner: Send + Sync + 'static {
    fn combine(&self, new: Value, old: Option<Value>) -> Value;
}

impl<F> Combiner for F
where
    F: Fn(Value, Option<Value>) -> Value + Send + Sync + 'static,
{
    fn combine(&self, new: Value, old: Option<Value>) -> Value {
        self(new, old)
    }
}

/// Global decision point between supersteps.
///
/// The hook may rewrite the globals seen by the next superstep and may force
/// termination by zeroing `info.active` and `info.messages`.
pub trait SuperstepHook: Send + Sync + 'static {
    fn superstep(&self, globals: &mut Value, info: &mut StepInfo) -> anyhow::Result<()>;
}

/// Aggregated progress of one completed superstep.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: u64,
    /// Vertices still active across all servers.
    pub active: u64,
    /// Messages sent across all servers.
    pub messages: u64,
    /// Values vertex programs contributed through
    /// [`ComputeContext::contribute`].
    pub data: Map<String, Value>,
}

/// Names of the pieces an execution uses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub base: String,
    #[serde(default)]
    pub final_step: Option<String>,
    #[serde(default)]
    pub superstep: Option<String>,
    #[serde(default)]
    pub aggregator: Option<String>,
}

impl AlgorithmSpec {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            ..Default::default()
        }
    }

    pub fn with_final(mut self, name: impl Into<String>) -> Self {
        self.final_step = Some(name.into());
        self
    }

    pub fn with_superstep(mut self, name: impl Into<String>) -> Self {
        self.superstep = Some(name.into());
        self
    }

    pub fn with_aggregator(mut self, name: impl Into<String>) -> Self {
        self.aggregator = Some(name.into());
        self
    }
}

/// An [`AlgorithmSpec`] resolved to implementations.
#[derive(Clone)]
pub struct Algorithms {
    pub spec: AlgorithmSpec,
    pub base: Arc<dyn VertexProgram>,
    pub final_step: Option<Arc<dyn VertexProgram>>,
    pub superstep: Option<Arc<dyn SuperstepHook>>,
    pub combiner: Option<Arc<dyn Combiner>>,
}

impl std::fmt::Debug for Algorithms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Algorithms").field(&self.spec).finish()
    }
}

/// Named algorithm implementations available on a server.
///
/// Cloning the registry yields a handle to the same set of implementations.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    programs: Arc<DashMap<String, Arc<dyn VertexProgram>>>,
    hooks: Arc<DashMap<String, Arc<dyn SuperstepHook>>>,
    combiners: Arc<DashMap<String, Arc<dyn Combiner>>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_program(&self, name: impl Into<String>, program: impl VertexProgram) {
        self.programs.insert(name.into(), Arc::new(program));
    }

    pub fn register_superstep(&self, name: impl Into<String>, hook: impl SuperstepHook) {
        self.hooks.insert(name.into(), Arc::new(hook));
    }

    pub fn register_combiner(&self, name: impl Into<String>, combiner: impl Combiner) {
        self.combiners.insert(name.into(), Arc::new(combiner));
    }

    /// Resolve every name of `spec`.
    ///
    /// Fails with [`PregelError::BadParameter`] if the base program is
    /// missing or any name is unknown.
    pub fn resolve(&self, spec: &AlgorithmSpec) -> Result<Algorithms> {
        if spec.base.trim().is_empty() {
            return Err(PregelError::BadParameter(
                "no base algorithm given".to_string(),
            ));
        }

        Ok(Algorithms {
            spec: spec.clone(),
            base: lookup(&self.programs, "vertex program", &spec.base)?,
            final_step: spec
                .final_step
                .as_deref()
                .map(|name| lookup(&self.programs, "vertex program", name))
                .transpose()?,
            superstep: spec
                .superstep
                .as_deref()
                .map(|name| lookup(&self.hooks, "superstep hook", name))
                .transpose()?,
            combiner: spec
                .aggregator
                .as_deref()
                .map(|name| lookup(&self.combiners, "combiner", name))
                .transpose()?,
        })
    }
}

fn lookup<T: ?Sized>(map: &DashMap<String, Arc<T>>, what: &str, name: &str) -> Result<Arc<T>> {
    map.get(name)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| PregelError::BadParameter(format!("unknown {what} `{name}`")))
}

/// Merge step-local data contributed by vertices or servers.
///
/// Numbers add up, arrays concatenate, objects merge key-wise, and anything
/// else is replaced by the incoming value.
pub fn merge_data(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (key, value) in from {
        match into.get_mut(&key) {
            Some(existing) => merge_value(existing, value),
            None => {
                into.insert(key, value);
            }
        }
    }
}

fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Number(a), Value::Number(b)) => {
            let sum = match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.checked_add(b).map(Value::from),
                _ => None,
            };
            let sum = sum.unwrap_or_else(|| {
                Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
            });
            *a = match sum {
                Value::Number(n) => n,
                _ => a.clone(),
            };
        }
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (Value::Object(a), Value::Object(b)) => merge_data(a, b),
        (existing, incoming) => *existing = incoming,
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    struct Noop;

    impl SuperstepHook for Noop {
        fn superstep(&self, _globals: &mut Value, _info: &mut StepInfo) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_names_are_bad_parameters() {
        let registry = AlgorithmRegistry::new();
        registry.register_superstep("noop", Noop);

        assert!(matches!(
            registry.resolve(&AlgorithmSpec::new("")),
            Err(PregelError::BadParameter(_))
        ));
        let err = registry
            .resolve(&AlgorithmSpec::new("missing").with_superstep("noop"))
            .unwrap_err();
        assert_eq!(
            err,
            PregelError::BadParameter("unknown vertex program `missing`".to_string())
        );
    }

    #[test]
    fn merges_step_data() {
        let mut data = json!({"count": 2, "ids": ["a"], "nested": {"x": 1.5}, "label": "old"})
            .as_object()
            .cloned()
            .unwrap();
        let incoming = json!({"count": 3, "ids": ["b"], "nested": {"x": 1.0, "y": 2}, "label": "new", "fresh": true})
            .as_object()
            .cloned()
            .unwrap();

        merge_data(&mut data, incoming);

        assert_eq!(
            Value::Object(data),
            json!({
                "count": 5,
                "ids": ["a", "b"],
                "nested": {"x": 2.5, "y": 2},
                "label": "new",
                "fresh": true
            })
        );
    }
}
