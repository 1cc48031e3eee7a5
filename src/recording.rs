// OpenReLife Desktop - Recording State Client
// Mirrors the backend's paused flag and keeps the paused reminder in step with it

use crate::error::ClientError;
use crate::notice::Notifier;
use crate::readiness::{RetryPolicy, STATUS_CHECK_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const REMINDER_INTERVAL: Duration = Duration::from_secs(30 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side recording state; the local copy is only a cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub paused: bool,
}

/// What a status change did to the reminder timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ReminderChange {
    Armed,
    Disarmed,
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: RecordingStatus,
    pub reminder: ReminderChange,
}

/// Recurring "still paused" reminder; exists only while paused
struct ReminderTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReminderTimer {
    fn arm(interval: Duration, notifier: Arc<dyn Notifier>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        log::info!("[Recording] Recording still paused, reminding");
                        notifier.recording_reminder();
                    }
                }
            }
        });
        Self { cancel, task }
    }

    async fn disarm(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct RecordingClient {
    base_url: String,
    http: reqwest::Client,
    status: Mutex<RecordingStatus>,
    reminder: Mutex<Option<ReminderTimer>>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    reminder_interval: Duration,
}

impl RecordingClient {
    pub fn new(base_url: impl Into<String>, notifier: Arc<dyn Notifier>) -> Result<Self, ClientError> {
        Self::with_timing(
            base_url,
            notifier,
            RetryPolicy::bounded(STATUS_CHECK_ATTEMPTS),
            REMINDER_INTERVAL,
        )
    }

    pub fn with_timing(
        base_url: impl Into<String>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        reminder_interval: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            status: Mutex::new(RecordingStatus::default()),
            reminder: Mutex::new(None),
            notifier,
            retry,
            reminder_interval,
        })
    }

    /// Mirrored status, for menu and icon rendering
    pub async fn status(&self) -> RecordingStatus {
        *self.status.lock().await
    }

    pub async fn reminder_active(&self) -> bool {
        self.reminder.lock().await.is_some()
    }

    /// Fetch the authoritative status, retrying to cover backend boot.
    /// Returns `None` (mirror untouched) once the attempt budget is spent.
    pub async fn check_status(&self) -> Option<StatusUpdate> {
        let max = self.retry.max_attempts.unwrap_or(STATUS_CHECK_ATTEMPTS).max(1);

        for attempt in 1..=max {
            match self.fetch_status().await {
                Ok(status) => {
                    log::info!("[Recording] Status: paused = {}", status.paused);
                    return Some(self.apply(status).await);
                }
                Err(e) => {
                    log::debug!("[Recording] Status check {}/{} failed: {}", attempt, max, e);
                }
            }
            if attempt < max {
                tokio::time::sleep(self.retry.interval).await;
            }
        }

        log::error!("[Recording] Could not get recording status after {} attempts", max);
        None
    }

    /// Flip the server state based on the mirrored value, then adopt the server's answer.
    /// On failure the mirror is left as it was.
    pub async fn toggle(&self) -> Result<StatusUpdate, ClientError> {
        let current = self.status().await;
        let endpoint = if current.paused {
            "/api/resume-recording"
        } else {
            "/api/pause-recording"
        };

        let result: Result<RecordingStatus, ClientError> = async {
            let resp = self.http.post(self.url(endpoint)).send().await?;
            parse_status(resp).await
        }
        .await;

        match result {
            Ok(status) => {
                log::info!("[Recording] Toggled: paused = {}", status.paused);
                Ok(self.apply(status).await)
            }
            Err(e) => {
                log::warn!("[Recording] Toggle via {} failed: {}", endpoint, e);
                Err(e)
            }
        }
    }

    /// Drop the reminder; called when the shell quits
    pub async fn shutdown(&self) {
        if let Some(timer) = self.reminder.lock().await.take() {
            timer.disarm().await;
        }
    }

    /// Overwrite the mirror and reconcile the reminder. Idempotent for a repeated status.
    async fn apply(&self, status: RecordingStatus) -> StatusUpdate {
        let mut mirrored = self.status.lock().await;
        *mirrored = status;

        let mut reminder = self.reminder.lock().await;
        let change = match (status.paused, reminder.is_some()) {
            (true, false) => {
                *reminder = Some(ReminderTimer::arm(self.reminder_interval, self.notifier.clone()));
                log::info!("[Recording] Paused reminder armed");
                ReminderChange::Armed
            }
            (false, true) => {
                if let Some(timer) = reminder.take() {
                    timer.disarm().await;
                }
                log::info!("[Recording] Paused reminder cleared");
                ReminderChange::Disarmed
            }
            _ => ReminderChange::Unchanged,
        };

        StatusUpdate {
            status,
            reminder: change,
        }
    }

    async fn fetch_status(&self) -> Result<RecordingStatus, ClientError> {
        let resp = self.http.get(self.url("/api/recording-status")).send().await?;
        parse_status(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn parse_status(resp: reqwest::Response) -> Result<RecordingStatus, ClientError> {
    if !resp.status().is_success() {
        return Err(ClientError::Status(resp.status()));
    }
    Ok(resp.json::<RecordingStatus>().await?)
}
