//! LXPCloud Device Agent Library
//!
//! This library provides the device side of the LXPCloud pipeline:
//!
//! - **config**: JSON configuration document with environment overrides
//! - **sensor**: Sensor readings, threshold status and simulated sources
//! - **host**: System metrics, network identity and location metadata
//! - **collector**: One sampling round across all sensors, with alarms
//! - **protocol**: LXP envelope formatting and validation
//! - **buffer**: Ordered holding area for envelopes awaiting transmission
//! - **client**: HTTP transport to the ingestion endpoint
//! - **sender**: Per-envelope delivery with exponential backoff
//! - **agent**: Sampling loop and lifecycle state machine
//!
//! # Example
//!
//! ```no_run
//! use lxp_device_agent::agent::{spawn_signal_listener, Agent};
//! use lxp_device_agent::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let mut agent = Agent::from_config(config).expect("Failed to build agent");
//!
//!     spawn_signal_listener(agent.shutdown_handle());
//!     agent.run().await.expect("Agent failed to start");
//! }
//! ```

pub mod agent;
pub mod buffer;
pub mod client;
pub mod collector;
pub mod config;
pub mod host;
pub mod protocol;
pub mod sender;
pub mod sensor;

pub use agent::{Agent, AgentError, AgentState, AgentStats, ShutdownHandle};
pub use buffer::{BufferStats, EnvelopeBuffer};
pub use client::{ClientError, IngestResponse, LxpClient, Transport};
pub use collector::{Alarm, Collector, SamplingRound, Severity};
pub use config::{Config, ConfigError};
pub use protocol::{Envelope, FormatError, LxpFormatter};
pub use sender::{BatchReport, RetryPolicy, Sender, SenderStats};
pub use sensor::{Reading, SensorError, SensorSource, Status, Thresholds};
