//! Shared runtime configuration.
//!
//! # Features:
//! - [`Config`]: process-level configuration, adorned with [`clap`] attributes
//!   so host binaries can flatten it into their own argument parser.
//! - [`Serializer`]: the wire format used by queue based transports.
//! - [`Runtime`]: how conductor and workers talk to each other.
//! - [`ExecutionOptions`]: per-run options passed to
//!   [`Conductor::start_execution`](crate::conductor::Conductor::start_execution).
//!
//! Nothing in the engine reads configuration from ambient state. The server
//! name in particular is handed to [`Worker::new`](crate::worker::Worker::new)
//! by whoever assembles the process, usually
//! [`Runtime::from_config`](crate::runtime::Runtime::from_config).

use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const HELP_HEADING: &str = "Pregel options";
pub const DEFAULT_SERVER_NAME: &str = "single";
pub const DEFAULT_LOCAL_WORKERS: usize = 4;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;
const DEFAULT_QUEUE_PREFIX: &str = "pregel";

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Name of this server. Shards are assigned to servers by name.
    #[arg(long, help_heading = HELP_HEADING, env = "PREGEL_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// All servers taking part in executions. Defaults to this server only.
    #[arg(long, help_heading = HELP_HEADING, value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Number of local worker tasks per server. Vertex partitions and the
    /// local message exchange are sized by this value.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_LOCAL_WORKERS)]
    pub num_local_workers: usize,

    /// Seconds a superstep may take before the execution is failed.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_STEP_TIMEOUT_SECS)]
    pub step_timeout_secs: u64,

    /// Determines the serialization format to be used on queues.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Cbor)]
    pub serializer: Serializer,

    /// Specifies the runtime environment to use.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Runtime::Local)]
    pub runtime: Runtime,

    /// Prefix for queue names used by queue based runtimes.
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_QUEUE_PREFIX)]
    pub queue_prefix: String,

    /// Provides the URI for the AMQP broker, if the AMQP runtime is selected.
    #[arg(long, help_heading = HELP_HEADING, env = "AMQP_URI", required_if_eq("runtime", "amqp"))]
    pub amqp_uri: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            servers: Default::default(),
            num_local_workers: DEFAULT_LOCAL_WORKERS,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            serializer: Default::default(),
            runtime: Default::default(),
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            amqp_uri: Default::default(),
        }
    }
}

impl Config {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// The participating servers, falling back to this server alone.
    pub fn cluster(&self) -> Vec<String> {
        if self.servers.is_empty() {
            vec![self.server_name.clone()]
        } else {
            self.servers.clone()
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Cbor,
    Json,
}

/// Enumerates the available runtime environments.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Runtime {
    /// Conductor and workers call each other directly.
    #[default]
    Local,
    /// Conductor and workers talk over emulated in-memory queues.
    InMemory,
    /// Conductor and workers talk over an AMQP broker.
    Amqp,
}

/// Options for a single execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Overrides the configured step timeout for this run.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Free-form parameters, visible read-only to vertex programs.
    #[serde(default)]
    pub parameters: Value,
}

impl ExecutionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn defaults_match_parser() {
        let cli = Cli::try_parse_from(["pregel"]).unwrap();
        assert_eq!(cli.options, Config::default());
        assert_eq!(cli.options.cluster(), vec!["single".to_string()]);
    }

    #[test]
    fn parses_cluster_and_runtime() {
        let cli = Cli::try_parse_from([
            "pregel",
            "--server-name",
            "db1",
            "--servers",
            "db1,db2",
            "--runtime",
            "in-memory",
            "--num-local-workers",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.options.server_name, "db1");
        assert_eq!(cli.options.cluster(), vec!["db1", "db2"]);
        assert_eq!(cli.options.runtime, Runtime::InMemory);
        assert_eq!(cli.options.num_local_workers, 2);
    }
}
