//! Hand-off of outgoing messages between the local workers of one server.
//!
//! Every local worker owns the dispatch of a fixed subset of target shards,
//! chosen by [`shard_index`] over the number of local workers. After
//! computing a step, each worker [stages](LocalExchange::stage) its outbox
//! towards the owners of the target shards and waits on the exchange barrier.
//! Once every sibling has arrived, each worker [collects](LocalExchange::collect)
//! the complete set of messages for its shards and dispatches them. No shard
//! is dispatched by two workers, and no worker dispatches before all of its
//! siblings staged.
use std::collections::HashMap;

use anyhow::{anyhow, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tokio::sync::Barrier;

use crate::{
    algorithm::Combiner,
    mapping::shard_index,
    message::{queue::Outbox, VertexMessages},
};

type ShardMessages = (String, HashMap<String, VertexMessages>);

pub(crate) struct LocalExchange {
    senders: Vec<Sender<ShardMessages>>,
    receivers: Vec<Receiver<ShardMessages>>,
    barrier: Barrier,
}

impl LocalExchange {
    pub(crate) fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| unbounded()).unzip();
        Self {
            senders,
            receivers,
            barrier: Barrier::new(workers),
        }
    }

    pub(crate) fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Local worker that dispatches messages bound for `shard`.
    pub(crate) fn owner_of(&self, shard: &str) -> usize {
        shard_index(shard, self.workers())
    }

    pub(crate) fn stage(&self, outbox: Outbox) -> Result<()> {
        for (shard, messages) in outbox {
            let owner = self.owner_of(&shard);
            self.senders[owner]
                .send((shard, messages))
                .map_err(|_| anyhow!("local worker {owner} is gone"))?;
        }
        Ok(())
    }

    /// Wait until every local worker staged its outbox for the current step.
    ///
    /// Every local worker must arrive exactly once per step, failed or not.
    pub(crate) async fn wait(&self) {
        self.barrier.wait().await;
    }

    /// Everything staged for the shards owned by `consumer`, merged per
    /// target vertex.
    pub(crate) fn collect(&self, consumer: usize, combiner: Option<&dyn Combiner>) -> Outbox {
        let mut collected = Outbox::new();
        for (shard, messages) in self.receivers[consumer].try_iter() {
            let shard = collected.entry(shard).or_default();
            for (id, messages) in messages {
                shard.entry(id).or_default().merge(messages, combiner);
            }
        }
        collected
    }

    /// Drop whatever was staged but never collected.
    pub(crate) fn discard(&self) {
        for receiver in &self.receivers {
            for _ in receiver.try_iter() {}
        }
    }
}
