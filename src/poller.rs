//! Client-driven task status polling.
//!
//! `PollerMachine` holds the transition rules and is clock-free; `TaskPoller`
//! drives it on tokio time with a cancellation token. The poller only reads
//! status and never touches the ledger.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PollerConfig;
use crate::provider::{
    ComputeProvider, HttpComputeProvider, ProviderError, TaskSnapshot, task_url,
};
use crate::store::TaskStatus;
use crate::submission::TaskView;

const SIMULATED_PROGRESS_CEILING: u8 = 95;
const MAX_ERROR_BODY_BYTES: usize = 16 * 1024;
const MAX_RESPONSE_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl PollerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollFailure {
    /// The provider reported the task as failed.
    Task { message: Option<String> },
    /// The consecutive-failure budget ran out.
    Connectivity { consecutive: u32, last_error: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded { snapshot: TaskSnapshot },
    Failed(PollFailure),
    TimedOut { elapsed: Duration },
    Cancelled,
}

/// Emitted after every transition or status response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollUpdate {
    pub state: PollerState,
    pub status: Option<TaskStatus>,
    pub progress_pct: u8,
    pub consecutive_failures: u32,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub max_total: Duration,
    pub progress_ramp: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

impl From<&PollerConfig> for PollSettings {
    fn from(config: &PollerConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            max_total: Duration::from_millis(config.max_total_ms),
            progress_ramp: Duration::from_millis(config.progress_ramp_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PollerMachine {
    settings: PollSettings,
    state: PollerState,
    status: Option<TaskStatus>,
    progress_pct: u8,
    consecutive_failures: u32,
}

impl PollerMachine {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            state: PollerState::Idle,
            status: None,
            progress_pct: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn progress_pct(&self) -> u8 {
        self.progress_pct
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn start(&mut self) {
        if self.state == PollerState::Idle {
            self.state = PollerState::Polling;
        }
    }

    pub fn update(&self, elapsed: Duration) -> PollUpdate {
        PollUpdate {
            state: self.state,
            status: self.status,
            progress_pct: self.progress_pct,
            consecutive_failures: self.consecutive_failures,
            elapsed,
        }
    }

    /// Linear estimate reaching the ceiling after `progress_ramp`.
    pub fn simulated_progress(&self, elapsed: Duration) -> u8 {
        let ramp_ms = self.settings.progress_ramp.as_millis();
        if ramp_ms == 0 {
            return SIMULATED_PROGRESS_CEILING;
        }
        let pct = elapsed.as_millis() * u128::from(SIMULATED_PROGRESS_CEILING) / ramp_ms;
        u8::try_from(pct.min(u128::from(SIMULATED_PROGRESS_CEILING)))
            .unwrap_or(SIMULATED_PROGRESS_CEILING)
    }

    pub fn deadline_reached(&self, elapsed: Duration) -> bool {
        elapsed >= self.settings.max_total
    }

    pub fn time_out(&mut self, elapsed: Duration) -> Option<PollOutcome> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = PollerState::TimedOut;
        Some(PollOutcome::TimedOut { elapsed })
    }

    pub fn on_snapshot(&mut self, snapshot: &TaskSnapshot, elapsed: Duration) -> Option<PollOutcome> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = PollerState::Polling;
        self.consecutive_failures = 0;
        self.status = Some(snapshot.status);

        match snapshot.status {
            TaskStatus::Completed => {
                self.state = PollerState::Succeeded;
                self.progress_pct = 100;
                Some(PollOutcome::Succeeded {
                    snapshot: snapshot.clone(),
                })
            }
            TaskStatus::Failed => {
                self.state = PollerState::Failed;
                Some(PollOutcome::Failed(PollFailure::Task {
                    message: snapshot.message.clone(),
                }))
            }
            TaskStatus::Pending | TaskStatus::Processing => {
                let reported = snapshot.progress_pct.unwrap_or(0).min(99);
                let estimate = reported.max(self.simulated_progress(elapsed));
                self.progress_pct = self.progress_pct.max(estimate);
                None
            }
        }
    }

    pub fn on_error(&mut self, error: &ProviderError) -> Option<PollOutcome> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = PollerState::Polling;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.settings.max_consecutive_failures {
            return None;
        }
        self.state = PollerState::Failed;
        Some(PollOutcome::Failed(PollFailure::Connectivity {
            consecutive: self.consecutive_failures,
            last_error: error.to_string(),
        }))
    }
}

#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskSnapshot, ProviderError>;
}

#[async_trait]
impl TaskStatusSource for HttpComputeProvider {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        self.task_status(task_id).await
    }
}

#[derive(Clone, Debug)]
pub struct TaskPoller {
    settings: PollSettings,
}

impl TaskPoller {
    pub fn new(settings: PollSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Polls until a terminal state, the total-time ceiling, or cancellation.
    ///
    /// The first query is issued one interval after the call. No query is issued
    /// once `cancel` fires, and every query is bounded by the remaining budget.
    pub async fn run<S, F>(
        &self,
        source: &S,
        task_id: &str,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> PollOutcome
    where
        S: TaskStatusSource + ?Sized,
        F: FnMut(&PollUpdate),
    {
        let started = Instant::now();
        let mut machine = PollerMachine::new(self.settings);
        machine.start();
        on_update(&machine.update(Duration::ZERO));

        loop {
            let elapsed = started.elapsed();
            if machine.deadline_reached(elapsed) {
                return self.finish_timed_out(&mut machine, elapsed, &mut on_update);
            }

            let wait = self.settings.interval.min(self.settings.max_total - elapsed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(task_id, "poll cancelled");
                    return PollOutcome::Cancelled;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let elapsed = started.elapsed();
            if machine.deadline_reached(elapsed) {
                return self.finish_timed_out(&mut machine, elapsed, &mut on_update);
            }
            let remaining = self.settings.max_total - elapsed;

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(task_id, "poll cancelled");
                    return PollOutcome::Cancelled;
                }
                response = tokio::time::timeout(remaining, source.fetch_status(task_id)) => response,
            };

            let elapsed = started.elapsed();
            let outcome = match response {
                Err(_) => {
                    return self.finish_timed_out(&mut machine, elapsed, &mut on_update);
                }
                Ok(Ok(snapshot)) => machine.on_snapshot(&snapshot, elapsed),
                Ok(Err(err)) => {
                    tracing::warn!(
                        task_id,
                        consecutive = machine.consecutive_failures() + 1,
                        error = %err,
                        "status query failed"
                    );
                    machine.on_error(&err)
                }
            };
            on_update(&machine.update(elapsed));

            if let Some(outcome) = outcome {
                tracing::info!(task_id, state = ?machine.state(), "poll finished");
                return outcome;
            }
        }
    }

    fn finish_timed_out<F>(
        &self,
        machine: &mut PollerMachine,
        elapsed: Duration,
        on_update: &mut F,
    ) -> PollOutcome
    where
        F: FnMut(&PollUpdate),
    {
        tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "poll timed out");
        let outcome = machine
            .time_out(elapsed)
            .unwrap_or(PollOutcome::TimedOut { elapsed });
        on_update(&machine.update(elapsed));
        outcome
    }
}

/// Reads task status through a running creditgate server.
#[derive(Clone)]
pub struct GatewayStatusClient {
    base_url: String,
    bearer: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for GatewayStatusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayStatusClient")
            .field("base_url", &self.base_url)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GatewayStatusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Client(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: None,
            timeout,
            client,
        })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[async_trait]
impl TaskStatusSource for GatewayStatusClient {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        let url = task_url(&self.base_url, &["v1", "tasks"], task_id)?;
        let mut req = self.client.get(url);
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout {
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }
            } else {
                ProviderError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        if !status.is_success() {
            let body =
                crate::utils::http::response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let view: TaskView =
            crate::utils::http::response_json_limited(response, MAX_RESPONSE_BODY_BYTES)
                .await
                .map_err(ProviderError::Decode)?;
        Ok(TaskSnapshot {
            task_id: view.task_id,
            status: view.status,
            progress_pct: Some(view.progress_pct),
            result_url: view.result_url,
            message: view.message,
        })
    }
}
