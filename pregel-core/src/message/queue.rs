//! Per-superstep message routing.
//!
//! # Design notes
//!
//! - Every server keeps one [`Inbox`] per execution. Messages are staged by
//!   the parity of the step that will read them and by the local worker that
//!   owns the target vertex, so batches for step `N + 1` can arrive while step
//!   `N` still runs without leaking into it.
//! - Every local worker owns one [`MessageQueue`]. At the start of a step it
//!   drains its inbox slot for `step % 2`, merging partial deliveries for the
//!   same vertex. During the step it buffers outgoing messages per target
//!   shard, combining sender-less ones as they are sent.
//! - The worker reads a vertex's messages with
//!   [`load_vertex`](MessageQueue::load_vertex) and drops them with
//!   [`clear`](MessageQueue::clear) right after the invocation, so at most
//!   one superstep of messages is live per vertex.
use std::{collections::HashMap, mem, sync::Arc};

use dashmap::DashMap;

use super::{LocationRef, Message, MessageCursor, VertexMessages};
use crate::{
    algorithm::Combiner,
    common::split_id,
    error::{PregelError, Result},
    mapping::local_worker_index,
};

/// Outgoing messages of one step: target shard -> target vertex id -> messages.
pub type Outbox = HashMap<String, HashMap<String, VertexMessages>>;

fn parity(step: u64) -> usize {
    (step % 2) as usize
}

/// Raw inbound messages of one server for one execution.
pub struct Inbox {
    workers: usize,
    staged: DashMap<(usize, usize), Vec<(String, VertexMessages)>>,
}

impl Inbox {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            staged: Default::default(),
        }
    }

    /// Stage messages sent during step `sent_in`; they become readable in
    /// step `sent_in + 1`.
    pub fn deliver(
        &self,
        sent_in: u64,
        messages: impl IntoIterator<Item = (String, VertexMessages)>,
    ) {
        let slot = parity(sent_in + 1);
        for (id, messages) in messages {
            let key = split_id(&id).map_or(id.as_str(), |(_, key)| key);
            let worker = local_worker_index(key, self.workers);
            self.staged
                .entry((slot, worker))
                .or_default()
                .push((id, messages));
        }
    }

    fn drain(&self, step: u64, worker: usize) -> Vec<(String, VertexMessages)> {
        self.staged
            .remove(&(parity(step), worker))
            .map(|(_, staged)| staged)
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.staged.clear();
    }
}

pub struct MessageQueue {
    worker: usize,
    step: u64,
    combiner: Option<Arc<dyn Combiner>>,
    inbox: Arc<Inbox>,
    current: HashMap<String, VertexMessages>,
    outbox: Outbox,
    sent: u64,
}

impl MessageQueue {
    pub fn new(worker: usize, inbox: Arc<Inbox>, combiner: Option<Arc<dyn Combiner>>) -> Self {
        Self {
            worker,
            step: 0,
            combiner,
            inbox,
            current: HashMap::new(),
            outbox: HashMap::new(),
            sent: 0,
        }
    }

    /// The step the queue was last filled for.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn combiner(&self) -> Option<&dyn Combiner> {
        self.combiner.as_deref()
    }

    /// Pull in the messages staged for `step` and reset the outgoing side.
    ///
    /// Steps must be filled in order, one at a time.
    pub fn fill_queues(&mut self, step: u64) -> Result<()> {
        if step != self.step + 1 {
            return Err(PregelError::Internal(format!(
                "message queue of local worker {} is at step {}, cannot fill step {step}",
                self.worker, self.step
            )));
        }
        self.step = step;
        self.outbox.clear();
        self.sent = 0;

        let combiner = self.combiner.as_deref();
        for (id, messages) in self.inbox.drain(step, self.worker) {
            self.current.entry(id).or_default().merge(messages, combiner);
        }
        Ok(())
    }

    pub fn has_messages(&self, id: &str) -> bool {
        self.current.get(id).is_some_and(|messages| !messages.is_empty())
    }

    /// Take the messages of a vertex for one invocation.
    pub fn load_vertex(&mut self, id: &str) -> MessageCursor {
        self.current
            .remove(id)
            .map(MessageCursor::from)
            .unwrap_or_default()
    }

    pub fn clear(&mut self, id: &str) {
        self.current.remove(id);
    }

    /// Drop messages nobody read this step, returning their target ids.
    pub fn discard_unread(&mut self) -> Vec<String> {
        self.current.drain().map(|(id, _)| id).collect()
    }

    pub fn send(&mut self, target: &LocationRef, message: Message) {
        self.outbox
            .entry(target.shard.clone())
            .or_default()
            .entry(target.id.clone())
            .or_default()
            .push(message, self.combiner.as_deref());
        self.sent += 1;
    }

    /// Messages sent since the last fill.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn take_outbox(&mut self) -> Outbox {
        mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod test {
    use serde_json::{json, Value};

    use super::*;

    /// Concatenates in fold order, which makes the order observable.
    fn concat(new: Value, old: Option<Value>) -> Value {
        let old = old.and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
        json!(format!("{old}{}", new.as_str().unwrap_or_default()))
    }

    fn target(id: &str) -> LocationRef {
        LocationRef {
            id: id.to_string(),
            shard: "s100001".to_string(),
        }
    }

    fn single_worker(combiner: Option<Arc<dyn Combiner>>) -> (Arc<Inbox>, MessageQueue) {
        let inbox = Arc::new(Inbox::new(1));
        let queue = MessageQueue::new(0, inbox.clone(), combiner);
        (inbox, queue)
    }

    /// Send through `queue` during its current step and deliver locally.
    fn exchange(inbox: &Inbox, queue: &mut MessageQueue) {
        let step = queue.step();
        for (_, messages) in queue.take_outbox() {
            inbox.deliver(step, messages);
        }
    }

    #[test]
    fn aggregates_in_fold_order_before_plain_messages() {
        let (inbox, mut queue) = single_worker(Some(Arc::new(concat)));
        queue.fill_queues(1).unwrap();
        queue.send(&target("v/1"), Message::new(json!("a")));
        queue.send(&target("v/1"), Message::with_sender(json!("x"), target("v/2")));
        queue.send(&target("v/1"), Message::new(json!("b")));
        queue.send(&target("v/1"), Message::new(json!("c")));
        assert_eq!(queue.sent(), 4);
        exchange(&inbox, &mut queue);

        queue.fill_queues(2).unwrap();
        let data: Vec<_> = queue.load_vertex("v/1").data().collect();

        assert_eq!(data, vec![json!("abc"), json!("x")]);
    }

    #[test]
    fn messages_are_visible_exactly_one_step_later() {
        let (inbox, mut queue) = single_worker(None);
        queue.fill_queues(1).unwrap();
        queue.send(&target("v/1"), Message::new(json!(1)));
        exchange(&inbox, &mut queue);

        // Not readable during the step that sent it.
        assert!(!queue.has_messages("v/1"));

        queue.fill_queues(2).unwrap();
        assert!(queue.has_messages("v/1"));
        assert_eq!(queue.load_vertex("v/1").len(), 1);
        queue.clear("v/1");

        queue.fill_queues(3).unwrap();
        assert!(!queue.has_messages("v/1"));
        assert_eq!(queue.load_vertex("v/1").len(), 0);
    }

    #[test]
    fn early_deliveries_wait_for_their_step() {
        let (inbox, mut queue) = single_worker(None);
        queue.fill_queues(1).unwrap();

        // A faster peer already finished step 1 and sent for step 2, then a
        // second batch for the same vertex arrived.
        inbox.deliver(1, [("v/1".to_string(), VertexMessages {
            aggregate: None,
            plain: vec![Message::new(json!(1))],
        })]);
        inbox.deliver(1, [("v/1".to_string(), VertexMessages {
            aggregate: None,
            plain: vec![Message::new(json!(2))],
        })]);
        assert!(!queue.has_messages("v/1"));

        queue.fill_queues(2).unwrap();
        let data: Vec<_> = queue.load_vertex("v/1").data().collect();
        assert_eq!(data, vec![json!(1), json!(2)]);
    }

    #[test]
    fn routes_to_owning_local_worker() {
        let inbox = Arc::new(Inbox::new(4));
        let mut queues: Vec<_> = (0..4)
            .map(|worker| MessageQueue::new(worker, inbox.clone(), None))
            .collect();
        let ids: Vec<_> = (0..32).map(|key| format!("v/{key}")).collect();
        inbox.deliver(
            0,
            ids.iter()
                .map(|id| (id.clone(), VertexMessages {
                    aggregate: None,
                    plain: vec![Message::new(json!(id))],
                })),
        );

        for queue in &mut queues {
            queue.fill_queues(1).unwrap();
        }
        for id in &ids {
            let (_, key) = split_id(id).unwrap();
            let owner = local_worker_index(key, 4);
            for (worker, queue) in queues.iter().enumerate() {
                assert_eq!(queue.has_messages(id), worker == owner, "{id}");
            }
        }
    }

    #[test]
    fn out_of_order_fill_is_rejected() {
        let (_, mut queue) = single_worker(None);
        queue.fill_queues(1).unwrap();

        assert!(matches!(queue.fill_queues(3), Err(PregelError::Internal(_))));
        assert!(matches!(queue.fill_queues(1), Err(PregelError::Internal(_))));
        assert_eq!(queue.step(), 1);
    }

    #[test]
    fn unread_messages_are_discarded() {
        let (inbox, mut queue) = single_worker(None);
        queue.fill_queues(1).unwrap();
        queue.send(&target("v/gone"), Message::new(json!(1)));
        exchange(&inbox, &mut queue);
        queue.fill_queues(2).unwrap();

        assert_eq!(queue.discard_unread(), vec!["v/gone".to_string()]);
        assert!(!queue.has_messages("v/gone"));
    }
}
