//! Agent: owns the sampling timer and the stopped/running lifecycle.
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//! ```
//!
//! Each tick runs collect -> format -> append, and flushes synchronously once
//! the buffer holds `batch_size` envelopes. Nothing that goes wrong inside a
//! tick ends the loop; only the [`ShutdownHandle`] does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferStats, EnvelopeBuffer};
use crate::client::{ClientError, LxpClient, Transport};
use crate::collector::Collector;
use crate::config::{Config, ConfigError};
use crate::protocol::LxpFormatter;
use crate::sender::{BatchReport, RetryPolicy, Sender, SenderStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort startup. The running loop never returns one.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connectivity check failed: {0}")]
    Connectivity(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Agent cannot start from state '{0}'")]
    InvalidState(AgentState),
}

/// Cloneable request to stop the sampling loop.
///
/// Cancelling more than once has no further effect.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Snapshot of the agent's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStats {
    pub state: AgentState,
    pub ticks: u64,
    /// Rounds that failed envelope validation
    pub rounds_dropped: u64,
    pub flushes: u64,
    /// Envelopes waiting in the buffer
    pub buffered: usize,
    pub buffer: BufferStats,
    pub sender: SenderStats,
}

/// Wall-clock source used to stamp envelopes.
pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Agent {
    config: Config,
    clock: Clock,
    collector: Collector,
    formatter: LxpFormatter,
    buffer: EnvelopeBuffer,
    sender: Sender,
    transport: Arc<dyn Transport>,
    state: AgentState,
    shutdown: ShutdownHandle,
    ticks: u64,
    rounds_dropped: u64,
    flushes: u64,
}

impl Agent {
    /// Build an agent around an already constructed collector and transport.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` when `config` fails [`Config::validate`].
    pub fn new(
        config: Config,
        collector: Collector,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let sender = Sender::new(transport.clone(), RetryPolicy::from_config(&config));
        let buffer = EnvelopeBuffer::with_capacity(config.data_collection.batch_size);

        Ok(Self {
            config,
            clock: Box::new(Utc::now),
            collector,
            formatter: LxpFormatter::default(),
            buffer,
            sender,
            transport,
            state: AgentState::Stopped,
            shutdown: ShutdownHandle::new(),
            ticks: 0,
            rounds_dropped: 0,
            flushes: 0,
        })
    }

    /// Validate the configuration and wire up the production collector and
    /// HTTP transport.
    pub fn from_config(config: Config) -> Result<Self, AgentError> {
        config.validate()?;
        let transport = Arc::new(LxpClient::new(&config.api)?);
        let collector = Collector::from_config(&config);
        Self::new(config, collector, transport)
    }

    /// Replace the clock envelopes are stamped with.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Share an existing shutdown handle instead of the agent's own.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            state: self.state,
            ticks: self.ticks,
            rounds_dropped: self.rounds_dropped,
            flushes: self.flushes,
            buffered: self.buffer.len(),
            buffer: self.buffer.stats().clone(),
            sender: self.sender.stats().clone(),
        }
    }

    /// Start, sample until shutdown is requested, then stop.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        self.start().await?;
        self.run_loop().await;
        self.stop().await;
        Ok(())
    }

    /// Acquire the transport and check connectivity.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` unless the agent is stopped, and with
    /// `Connectivity` when the endpoint cannot be reached or refuses the
    /// probe. A failed start leaves the agent stopped with the transport
    /// released.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.state != AgentState::Stopped {
            return Err(AgentError::InvalidState(self.state));
        }
        self.transition(AgentState::Starting);

        let data_collection = &self.config.data_collection;
        if data_collection.compression || data_collection.encryption {
            warn!(
                compression = data_collection.compression,
                encryption = data_collection.encryption,
                "Compression and encryption are not supported; envelopes are sent as plain JSON"
            );
        }

        if let Err(e) = self.transport.open().await {
            self.transition(AgentState::Stopped);
            return Err(e.into());
        }

        let failure = match self.transport.probe().await {
            Ok(true) => None,
            Ok(false) => Some("endpoint did not acknowledge the probe".to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            error!(reason = %reason, "Connectivity check failed");
            self.transport.close().await;
            self.transition(AgentState::Stopped);
            return Err(AgentError::Connectivity(reason));
        }

        info!(
            device = %self.config.device.name,
            interval_secs = self.config.data_collection.interval,
            batch_size = self.config.data_collection.batch_size,
            sensors = self.collector.sensor_count(),
            "Connectivity check passed"
        );
        self.transition(AgentState::Running);
        Ok(())
    }

    /// Tick at the configured interval until shutdown is requested.
    ///
    /// The first tick fires immediately. A shutdown request interrupts the
    /// wait between ticks, never a tick in progress.
    pub async fn run_loop(&mut self) {
        let shutdown = self.shutdown.clone();
        let mut ticker = interval(self.config.data_collection.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(ticks = self.ticks, "Shutdown requested, leaving sampling loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One sampling round: collect, format, buffer, and flush when full.
    pub async fn tick(&mut self) {
        self.ticks += 1;
        let round = self.collector.collect_all().await;

        let now = (self.clock)();
        match self.formatter.format_at(round, &self.config.device, now) {
            Ok(envelope) => self.buffer.append(envelope),
            Err(e) => {
                self.rounds_dropped += 1;
                warn!(error = %e, tick = self.ticks, "Dropping round that failed validation");
                return;
            }
        }

        if self.buffer.len() >= self.config.data_collection.batch_size {
            debug!(buffered = self.buffer.len(), "Batch size reached");
            self.flush().await;
        }
    }

    /// Send everything in the buffer. The buffer ends up empty whatever the
    /// per-envelope outcome.
    pub async fn flush(&mut self) -> BatchReport {
        let envelopes = self.buffer.drain();
        if envelopes.is_empty() {
            return BatchReport::default();
        }

        self.flushes += 1;
        let report = self.sender.send_batch(&envelopes).await;
        if report.failed > 0 {
            warn!(
                failed = report.failed,
                total = report.total,
                "Envelopes lost after exhausting retries"
            );
        }
        report
    }

    /// Flush what is left, release the transport and return to stopped.
    ///
    /// Does nothing when already stopped.
    pub async fn stop(&mut self) {
        if self.state == AgentState::Stopped {
            return;
        }
        self.transition(AgentState::Stopping);

        if !self.buffer.is_empty() {
            info!(buffered = self.buffer.len(), "Flushing remaining envelopes");
            self.flush().await;
        }

        self.transport.close().await;
        self.transition(AgentState::Stopped);
    }

    fn transition(&mut self, next: AgentState) {
        info!(from = %self.state, to = %next, "Agent state changed");
        self.state = next;
    }
}

/// Cancel `handle` on Ctrl-C or, on unix, SIGTERM.
///
/// The listener keeps running after the first signal so repeated signals are
/// absorbed instead of killing the process mid-flush.
pub fn spawn_signal_listener(handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = Signals::new();
        loop {
            match signals.next().await {
                Ok(name) if handle.is_shutdown() => {
                    debug!(signal = name, "Shutdown already requested");
                }
                Ok(name) => {
                    info!(signal = name, "Shutdown signal received");
                    handle.shutdown();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    return;
                }
            }
        }
    })
}

#[cfg(unix)]
struct Signals {
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                None
            }
        };
        Self { terminate }
    }

    async fn next(&mut self) -> std::io::Result<&'static str> {
        let terminate = async {
            if let Some(stream) = self.terminate.as_mut() {
                if stream.recv().await.is_some() {
                    return;
                }
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate => Ok("SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Self {
        Signals
    }

    async fn next(&mut self) -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}
