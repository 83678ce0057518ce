//! Sender module: delivers envelopes one at a time with bounded retries.
//!
//! Every failure is retried the same way, whether it is a transport error,
//! a non-2xx answer or a missing acknowledgement. An envelope whose attempts
//! are exhausted is reported as failed and is not re-enqueued.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::Transport;
use crate::config::Config;
use crate::protocol::Envelope;

/// Default unit of the exponential backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// How many times to try an envelope and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, DEFAULT_BACKOFF_BASE)
    }
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as a single attempt.
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retry_attempts(), DEFAULT_BACKOFF_BASE)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt with 0-based index `attempt`:
    /// `backoff_base * 2^attempt`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Counters accumulated across every `send` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Envelopes acknowledged by the endpoint
    pub sent: u64,

    /// Envelopes dropped after exhausting their attempts
    pub failed: u64,

    /// Transport calls issued
    pub attempts: u64,

    /// Attempts beyond the first for an envelope
    pub retries: u64,
}

/// Outcome tally of [`Sender::send_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

pub struct Sender {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    stats: SenderStats,
}

impl Sender {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            stats: SenderStats::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Send one envelope, retrying with exponential backoff.
    ///
    /// Returns `true` only when the endpoint acknowledged the envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> bool {
        let max_attempts = self.policy.max_attempts();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.stats.retries += 1;
            }
            self.stats.attempts += 1;

            match self.transport.send(envelope).await {
                Ok(_) => {
                    debug!(
                        device_id = %envelope.device_info.device_id,
                        attempt = attempt + 1,
                        "Envelope acknowledged"
                    );
                    self.stats.sent += 1;
                    return true;
                }
                Err(e) if attempt + 1 < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Send failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        attempts = max_attempts,
                        device_id = %envelope.device_info.device_id,
                        "Send failed permanently, envelope dropped"
                    );
                }
            }
        }

        self.stats.failed += 1;
        false
    }

    /// Send envelopes sequentially, in order, without stopping at a failure.
    pub async fn send_batch(&mut self, envelopes: &[Envelope]) -> BatchReport {
        let mut report = BatchReport {
            total: envelopes.len(),
            ..BatchReport::default()
        };

        for envelope in envelopes {
            if self.send(envelope).await {
                report.successful += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "Batch sent"
        );

        report
    }
}
