// OpenReLife Desktop - Readiness Poller
// Probes the backend root until it answers, one attempt per interval

use crate::error::ClientError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Attempt budget for the status-check path
pub const STATUS_CHECK_ATTEMPTS: u32 = 10;

/// Spacing and budget for a retry chain. `max_attempts: None` retries forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Initial app load: the backend's boot time is not bounded
    pub const fn unbounded() -> Self {
        Self {
            interval: PROBE_INTERVAL,
            max_attempts: None,
        }
    }

    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            interval: PROBE_INTERVAL,
            max_attempts: Some(max_attempts),
        }
    }

    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
    /// The lifecycle ended (stop or window teardown) while polling
    Cancelled,
}

/// HTTP client for readiness probes; loopback only, so proxies are bypassed
pub fn probe_client() -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()?)
}

/// Wait for `url` to answer with a 2xx. Each attempt is preceded by one interval;
/// the chain ends early when `cancel` fires, even mid-probe.
pub async fn wait_until_ready(
    client: &reqwest::Client,
    url: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Readiness {
    log::info!("[Readiness] Waiting for backend at {}...", url);
    let mut attempts = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return cancelled(attempts),
            _ = tokio::time::sleep(policy.interval) => {}
        }

        attempts += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return cancelled(attempts),
            outcome = probe(client, url) => outcome,
        };

        match outcome {
            Ok(()) => {
                log::info!("[Readiness] Backend ready after {} attempt(s)", attempts);
                return Readiness::Ready { attempts };
            }
            Err(reason) => {
                log::debug!("[Readiness] Attempt {} failed: {}", attempts, reason);
            }
        }

        if policy.exhausted(attempts) {
            log::warn!("[Readiness] Backend not ready after {} attempts", attempts);
            return Readiness::TimedOut { attempts };
        }
    }
}

fn cancelled(attempts: u32) -> Readiness {
    log::debug!("[Readiness] Cancelled after {} attempt(s)", attempts);
    Readiness::Cancelled
}

async fn probe(client: &reqwest::Client, url: &str) -> Result<(), String> {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("status {}", resp.status())),
        Err(e) => Err(e.to_string()),
    }
}
