//! LXPCloud Device Agent - samples sensors and ships LXP envelopes to LXPCloud
//!
//! ## Configuration
//!
//! The agent reads a JSON document written by the setup tool. Its location
//! and a few fields can be overridden from the environment:
//!
//! - `LXP_AGENT_CONFIG`: Path of the document (default: /etc/lxpcloud-agent/device_config.json)
//! - `LXP_AGENT_API_KEY`: API key
//! - `LXP_AGENT_BASE_URL`: LXPCloud base URL
//! - `LXP_AGENT_INTERVAL_SECS`: Seconds between samples
//! - `LXP_AGENT_BATCH_SIZE`: Envelopes per flush
//! - `RUST_LOG`: Logging level filter (default: `logging.level`, then info)

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lxp_device_agent::agent::{spawn_signal_listener, Agent};
use lxp_device_agent::config::Config;

#[tokio::main]
async fn main() {
    // Configuration first: it carries the default log level
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(None);
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    init_tracing(Some(&config.logging.level));

    info!(
        device = %config.device.name,
        url = %config.api.url(),
        interval_secs = config.data_collection.interval,
        batch_size = config.data_collection.batch_size,
        retry_attempts = config.retry_attempts(),
        "Configuration loaded"
    );

    let mut agent = match Agent::from_config(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Failed to initialize agent");
            std::process::exit(1);
        }
    };

    let signals = spawn_signal_listener(agent.shutdown_handle());

    if let Err(e) = agent.run().await {
        error!(error = %e, "Agent failed to start");
        std::process::exit(1);
    }

    signals.abort();
    info!(stats = ?agent.stats(), "LXPCloud device agent stopped");
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(configured_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = configured_level.unwrap_or("info").to_lowercase();
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
