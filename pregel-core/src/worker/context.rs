use serde_json::{Map, Value};

use crate::{
    algorithm::merge_data,
    error::{PregelError, Result},
    mapping::Mapping,
    message::{queue::MessageQueue, LocationRef, Message},
    partition::EdgeView,
};

/// What a vertex program sees of the world besides its own vertex.
///
/// A context lives for a single invocation. Messages sent through it become
/// visible to their targets in the next superstep.
pub struct ComputeContext<'a> {
    pub(crate) step: u64,
    pub(crate) final_step: bool,
    pub(crate) globals: &'a Value,
    pub(crate) parameters: &'a Value,
    pub(crate) mapping: &'a Mapping,
    pub(crate) queue: &'a mut MessageQueue,
    pub(crate) data: &'a mut Map<String, Value>,
    pub(crate) sender: LocationRef,
}

impl<'a> ComputeContext<'a> {
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Whether this invocation is the final program.
    pub fn is_final(&self) -> bool {
        self.final_step
    }

    /// Globals as left by the superstep hook after the previous round.
    pub fn globals(&self) -> &Value {
        self.globals
    }

    pub fn parameters(&self) -> &Value {
        self.parameters
    }

    /// Send a message without sender. It is folded by the combiner, if any.
    pub fn send(&mut self, target: &LocationRef, data: Value) -> Result<()> {
        self.check(target)?;
        self.queue.send(target, Message::new(data));
        Ok(())
    }

    /// Send a message carrying the invoking vertex as sender. It is never
    /// combined.
    pub fn send_with_sender(&mut self, target: &LocationRef, data: Value) -> Result<()> {
        self.check(target)?;
        self.queue
            .send(target, Message::with_sender(data, self.sender.clone()));
        Ok(())
    }

    /// Send to the vertex with the given document id.
    pub fn send_to(&mut self, id: &str, data: Value) -> Result<()> {
        let target = self.mapping.location_of(id)?;
        self.send(&target, data)
    }

    /// Send to the `_to` vertex of an edge.
    pub fn send_along(&mut self, edge: &EdgeView<'_>, data: Value) -> Result<()> {
        let target = self.mapping.to_location(edge.document())?;
        self.send(&target, data)
    }

    /// Add a value to this step's report data. Contributions of all vertices
    /// and servers are merged (see [`merge_data`]).
    pub fn contribute(&mut self, key: impl Into<String>, value: Value) {
        let mut entry = Map::new();
        entry.insert(key.into(), value);
        merge_data(self.data, entry);
    }

    fn check(&self, target: &LocationRef) -> Result<()> {
        if target.id.is_empty() {
            return Err(PregelError::NoTargetProvided);
        }
        if self.mapping.server_of(&target.shard).is_none() {
            return Err(PregelError::InvalidTargetVertex(target.id.clone()));
        }
        Ok(())
    }
}
