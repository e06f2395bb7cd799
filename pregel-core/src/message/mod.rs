//! Messages exchanged between vertices.
//!
//! Messages sent to one vertex during a superstep are grouped into
//! [`VertexMessages`]: sender-less messages are folded by the execution's
//! [`Combiner`] into a single aggregate, messages carrying a sender are kept
//! verbatim. During the next superstep the receiving vertex reads them
//! through a [`MessageCursor`], aggregate first.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::algorithm::Combiner;

pub mod queue;

/// Addresses a vertex across shards and servers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationRef {
    pub id: String,
    pub shard: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<LocationRef>,
}

impl Message {
    pub fn new(data: Value) -> Self {
        Self { data, sender: None }
    }

    pub fn with_sender(data: Value, sender: LocationRef) -> Self {
        Self {
            data,
            sender: Some(sender),
        }
    }
}

/// Messages bound for one vertex.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexMessages {
    #[serde(default)]
    pub aggregate: Option<Value>,
    #[serde(default)]
    pub plain: Vec<Message>,
}

impl VertexMessages {
    /// Add a message, folding it into the aggregate when it has no sender and
    /// a combiner is configured.
    pub fn push(&mut self, message: Message, combiner: Option<&dyn Combiner>) {
        match (combiner, message.sender.is_none()) {
            (Some(combiner), true) => {
                let old = self.aggregate.take();
                self.aggregate = Some(combiner.combine(message.data, old));
            }
            _ => self.plain.push(message),
        }
    }

    /// Merge messages that were collected elsewhere for the same vertex.
    pub fn merge(&mut self, other: VertexMessages, combiner: Option<&dyn Combiner>) {
        if let Some(aggregate) = other.aggregate {
            self.aggregate = Some(match (combiner, self.aggregate.take()) {
                (Some(combiner), old) => combiner.combine(aggregate, old),
                // Aggregates only exist with a combiner; keep the newer value.
                (None, _) => aggregate,
            });
        }
        self.plain.extend(other.plain);
    }

    /// Number of messages a cursor over these messages yields.
    pub fn len(&self) -> usize {
        self.plain.len() + usize::from(self.aggregate.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterates over the messages of one vertex for one invocation.
///
/// The aggregate, if any, is yielded first as a sender-less message, followed
/// by the plain messages in the order they were sent. Reading past the end
/// yields `None`; [`len`](ExactSizeIterator::len) reports what is left.
#[derive(Debug, Default)]
pub struct MessageCursor {
    messages: VecDeque<Message>,
}

impl MessageCursor {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_next(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Data of all remaining messages, consuming them.
    pub fn data(&mut self) -> impl Iterator<Item = Value> + '_ {
        self.messages.drain(..).map(|message| message.data)
    }
}

impl From<VertexMessages> for MessageCursor {
    fn from(messages: VertexMessages) -> Self {
        let mut queue = VecDeque::with_capacity(messages.len());
        if let Some(aggregate) = messages.aggregate {
            queue.push_back(Message::new(aggregate));
        }
        queue.extend(messages.plain);
        Self { messages: queue }
    }
}

impl Iterator for MessageCursor {
    type Item = Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.messages.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.messages.len(), Some(self.messages.len()))
    }
}

impl ExactSizeIterator for MessageCursor {}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn sum(new: Value, old: Option<Value>) -> Value {
        let old = old.and_then(|v| v.as_i64()).unwrap_or(0);
        json!(new.as_i64().unwrap_or(0) + old)
    }

    fn sender(id: &str) -> LocationRef {
        LocationRef {
            id: id.to_string(),
            shard: "s1".to_string(),
        }
    }

    #[test]
    fn folds_senderless_messages() {
        let combiner: &dyn Combiner = &sum;
        let mut messages = VertexMessages::default();
        for value in 1..=4 {
            messages.push(Message::new(json!(value)), Some(combiner));
        }

        assert_eq!(messages.aggregate, Some(json!(10)));
        assert!(messages.plain.is_empty());
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn keeps_messages_with_sender() {
        let combiner: &dyn Combiner = &sum;
        let mut messages = VertexMessages::default();
        messages.push(Message::with_sender(json!(1), sender("v/1")), Some(combiner));
        messages.push(Message::new(json!(2)), Some(combiner));
        messages.push(Message::with_sender(json!(3), sender("v/3")), Some(combiner));

        let cursor = MessageCursor::from(messages);
        let received: Vec<_> = cursor.collect();
        assert_eq!(
            received,
            vec![
                Message::new(json!(2)),
                Message::with_sender(json!(1), sender("v/1")),
                Message::with_sender(json!(3), sender("v/3")),
            ]
        );
    }

    #[test]
    fn without_combiner_everything_is_plain() {
        let mut messages = VertexMessages::default();
        messages.push(Message::new(json!("a")), None);
        messages.push(Message::new(json!("b")), None);

        assert_eq!(messages.aggregate, None);
        let data: Vec<_> = MessageCursor::from(messages).data().collect();
        assert_eq!(data, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn merge_combines_partial_aggregates() {
        let combiner: &dyn Combiner = &sum;
        let mut left = VertexMessages::default();
        left.push(Message::new(json!(1)), Some(combiner));
        left.push(Message::with_sender(json!(9), sender("v/9")), Some(combiner));
        let mut right = VertexMessages::default();
        right.push(Message::new(json!(5)), Some(combiner));

        left.merge(right, Some(combiner));

        assert_eq!(left.aggregate, Some(json!(6)));
        assert_eq!(left.plain.len(), 1);
    }

    #[test]
    fn cursor_exhaustion_yields_none() {
        let mut cursor = MessageCursor::from(VertexMessages {
            aggregate: Some(json!(1)),
            plain: vec![],
        });

        assert_eq!(cursor.len(), 1);
        assert!(cursor.has_next());
        assert_eq!(cursor.next(), Some(Message::new(json!(1))));
        assert!(!cursor.has_next());
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.next(), None);
    }
}
