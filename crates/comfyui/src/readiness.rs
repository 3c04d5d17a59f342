//! Fixed-interval readiness polling for a ComfyUI instance.
//!
//! After a cold start the backend spends a roughly constant time loading
//! models before `/system_stats` answers. [`wait_ready`] probes at a fixed
//! delay until it does, the attempts run out, or the [`CancellationToken`]
//! is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;

/// Tunable parameters for readiness polling.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Number of probes before giving up.
    pub max_attempts: u32,
    /// Pause between probes.
    pub delay: Duration,
    /// Timeout of a single probe.
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            delay: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessConfig {
    /// Upper bound on the time spent waiting, ignoring probe latency.
    pub fn budget(&self) -> Duration {
        self.delay.saturating_mul(self.max_attempts)
    }
}

/// Probe the backend until it is healthy.
///
/// Returns `true` on the first healthy probe, `false` once all attempts
/// failed or the `cancel` token was triggered.
pub async fn wait_ready(
    api: &ComfyUIApi,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> bool {
    tracing::info!(
        max_attempts = config.max_attempts,
        budget_secs = config.budget().as_secs(),
        "Waiting for ComfyUI to become ready",
    );

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Readiness wait cancelled");
                return false;
            }
            healthy = api.probe_health(config.probe_timeout) => {
                if healthy {
                    tracing::info!(attempt, max_attempts = config.max_attempts, "ComfyUI is ready");
                    return true;
                }
            }
        }

        if attempt == config.max_attempts {
            break;
        }

        tracing::warn!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = config.delay.as_millis() as u64,
            "ComfyUI not ready, retrying",
        );

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(config.delay) => {}
        }
    }

    tracing::error!(
        max_attempts = config.max_attempts,
        "ComfyUI failed to become ready",
    );
    false
}
