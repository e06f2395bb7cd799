#![cfg_attr(docsrs, feature(doc_cfg))]

//! A bulk-synchronous-parallel graph engine.
//!
//! Pregel runs user supplied vertex programs over a graph whose vertices and
//! edges are sharded across servers. Computation proceeds in supersteps: in
//! each step every active vertex reads the messages sent to it in the
//! previous step, updates its state and sends messages along its edges. A
//! single [`Conductor`](crate::conductor::Conductor) keeps the servers in
//! lockstep and decides when the run is over.
//!
//! # Pieces
//!
//! - [`algorithm`]: the capability traits a run is made of
//!   ([`VertexProgram`](crate::algorithm::VertexProgram),
//!   [`Combiner`](crate::algorithm::Combiner),
//!   [`SuperstepHook`](crate::algorithm::SuperstepHook)) and the registry
//!   resolving them by name.
//! - [`conductor`]: the per-cluster coordinator and its execution state
//!   machine.
//! - [`worker`]: the per-server execution unit.
//! - [`message`]: message cursors and the double-buffered message queue.
//! - [`mapping`]: the translation between shards, servers and result shards.
//! - [`partition`]: vertex and edge views handed to vertex programs.
//! - [`transport`]: the protocol between conductor and workers, over direct
//!   calls or queues.
//! - [`runtime`]: assembly of all of the above from a [`Config`](crate::config::Config).
//!
//! # Writing a vertex program
//!
//! ```
//! use pregel::{
//!     algorithm::VertexProgram, message::MessageCursor, partition::VertexView,
//!     worker::ComputeContext,
//! };
//! use serde_json::json;
//!
//! /// Counts incoming edges.
//! struct InDegree;
//!
//! impl VertexProgram for InDegree {
//!     fn compute(
//!         &self,
//!         vertex: &mut VertexView<'_>,
//!         messages: &mut MessageCursor,
//!         ctx: &mut ComputeContext<'_>,
//!     ) -> anyhow::Result<()> {
//!         if ctx.step() == 1 {
//!             for edge in &vertex.edges()? {
//!                 ctx.send_along(edge, json!(1))?;
//!             }
//!         } else {
//!             let count: i64 = messages.data().filter_map(|v| v.as_i64()).sum();
//!             vertex.set_result(json!(count));
//!         }
//!         vertex.deactivate();
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Register it with an [`AlgorithmRegistry`](crate::algorithm::AlgorithmRegistry)
//! on every server, then start runs by name through
//! [`Conductor::start_execution`](crate::conductor::Conductor::start_execution).
pub mod acker;
pub mod algorithm;
pub mod common;
pub mod conductor;
pub mod config;
pub mod error;
pub mod init;
pub mod mapping;
pub mod message;
pub mod partition;
pub mod queue;
pub mod runtime;
pub mod serializer;
pub mod store;
pub mod transport;
pub mod worker;
pub use async_trait::async_trait;
pub use futures;
pub use tracing;
