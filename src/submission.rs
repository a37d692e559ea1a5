//! Admission control for paid tasks: reserve, forward, then record or refund.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::config::PricingConfig;
use crate::error::{CreditError, Result};
use crate::identity::{IdentityResolver, ResolvedIdentity};
use crate::ids::request_id;
use crate::provider::{ComputeProvider, ProviderError, TaskSnapshot, validate_task_id};
use crate::store::{
    LedgerStore, TaskRecord, TaskStatus, TaskUpdate, UsageOutcome, UsageRecord,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub action_type: String,
    /// Declared cost. Priced actions reject a lower value.
    #[serde(default)]
    pub cost: Option<i64>,
    #[serde(default)]
    pub payload: Value,
    /// Number of identical tasks to submit, each charged at the unit cost.
    #[serde(default = "single_task")]
    pub count: u32,
}

fn single_task() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress_pct: u8,
}

impl From<&TaskSnapshot> for TaskHandle {
    fn from(snapshot: &TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id.clone(),
            status: snapshot.status,
            progress_pct: snapshot.progress_pct.unwrap_or(0),
        }
    }
}

/// The first accepted task is repeated at the top level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress_pct: u8,
    pub tasks: Vec<TaskHandle>,
    /// Accepted tasks.
    pub count: u32,
    /// Credits kept after the unaccepted remainder was refunded.
    pub cost: i64,
    pub balance: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress_pct: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct TaskSubmissionGateway {
    provider: Arc<dyn ComputeProvider>,
    store: Arc<dyn LedgerStore>,
    identity: IdentityResolver,
    clock: Arc<dyn Clock>,
    pricing: PricingConfig,
}

impl TaskSubmissionGateway {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        store: Arc<dyn LedgerStore>,
        identity: IdentityResolver,
        clock: Arc<dyn Clock>,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            provider,
            store,
            identity,
            clock,
            pricing,
        }
    }

    pub fn price(&self, request: &TaskRequest) -> Result<i64> {
        let action = request.action_type.trim();
        if action.is_empty() {
            return Err(CreditError::invalid_request("actionType is required"));
        }
        let Some(listed) = self.pricing.cost_of(action) else {
            return Err(CreditError::invalid_request(format!(
                "unknown action type: {action}"
            )));
        };
        match request.cost {
            Some(declared) if declared < listed => Err(CreditError::invalid_request(format!(
                "cost {declared} is below the price of {action} ({listed})"
            ))),
            Some(declared) => Ok(declared),
            None => Ok(listed),
        }
    }

    pub fn batch_size(&self, request: &TaskRequest) -> Result<u32> {
        match request.count {
            0 => Err(CreditError::invalid_request("count must be at least 1")),
            count if count > self.pricing.max_batch => Err(CreditError::invalid_request(format!(
                "count {count} exceeds the batch limit of {}",
                self.pricing.max_batch
            ))),
            count => Ok(count),
        }
    }

    /// Reserves the whole batch once, then submits its tasks in order.
    ///
    /// The first provider rejection ends the batch and the unaccepted
    /// remainder is refunded. Fails only when no task was accepted.
    pub async fn submit(
        &self,
        identity: &ResolvedIdentity,
        request: &TaskRequest,
    ) -> Result<SubmittedTask> {
        let unit_cost = self.price(request)?;
        let count = self.batch_size(request)?;
        let total = unit_cost
            .checked_mul(i64::from(count))
            .ok_or_else(|| CreditError::invalid_request("batch cost is too large"))?;
        let account_id = identity.account_id.as_str();
        let action_type = request.action_type.trim();

        let mut balance = identity.ledger.reserve(account_id, total).await?;

        let mut tasks: Vec<TaskHandle> = Vec::new();
        let mut rejection = None;
        for _ in 0..count {
            match self.provider.create_task(action_type, &request.payload).await {
                Ok(snapshot) => {
                    self.record_acceptance(account_id, action_type, unit_cost, &snapshot)
                        .await;
                    tasks.push(TaskHandle::from(&snapshot));
                }
                Err(err) => {
                    rejection = Some(err);
                    break;
                }
            }
        }

        let accepted = u32::try_from(tasks.len()).unwrap_or(count);
        if let Some(err) = rejection {
            let unaccepted = unit_cost * i64::from(count - accepted);
            if let Some(refunded) = self
                .record_rejection(identity, action_type, unaccepted, &err)
                .await
            {
                balance = refunded;
            }
            if tasks.is_empty() {
                return Err(CreditError::UpstreamProvider(err));
            }
        }
        let Some(first) = tasks.first().cloned() else {
            return Err(CreditError::invalid_request("count must be at least 1"));
        };
        if count > 1 {
            tracing::info!(account_id, action_type, requested = count, accepted, "batch submitted");
        }

        Ok(SubmittedTask {
            task_id: first.task_id,
            status: first.status,
            progress_pct: first.progress_pct,
            tasks,
            count: accepted,
            cost: unit_cost * i64::from(accepted),
            balance,
        })
    }

    async fn record_acceptance(
        &self,
        account_id: &str,
        action_type: &str,
        cost: i64,
        snapshot: &TaskSnapshot,
    ) {
        let now_ms = self.clock.now_ms();
        let usage = UsageRecord {
            account_id: account_id.to_string(),
            action_type: action_type.to_string(),
            credits_used: cost,
            outcome: UsageOutcome::Success,
            ts_ms: now_ms,
            correlation_ref: snapshot.task_id.clone(),
        };
        if let Err(err) = self.store.append_usage(&usage).await {
            tracing::error!(account_id, task_id = %snapshot.task_id, error = %err, "usage record lost");
        }

        let task = TaskRecord {
            task_id: snapshot.task_id.clone(),
            account_id: account_id.to_string(),
            action_type: action_type.to_string(),
            cost,
            status: snapshot.status,
            progress_pct: snapshot.progress_pct.unwrap_or(0),
            result_url: snapshot.result_url.clone(),
            message: snapshot.message.clone(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        if let Err(err) = self.store.insert_task(&task).await {
            tracing::error!(account_id, task_id = %snapshot.task_id, error = %err, "task record lost");
        }
    }

    /// Refunds `cost` and records the failure. Returns the refunded balance.
    async fn record_rejection(
        &self,
        identity: &ResolvedIdentity,
        action_type: &str,
        cost: i64,
        cause: &ProviderError,
    ) -> Option<i64> {
        let account_id = identity.account_id.as_str();
        tracing::warn!(account_id, action_type, cost, error = %cause, "provider call failed; refunding");
        let balance = match identity.ledger.refund(account_id, cost).await {
            Ok(balance) => Some(balance),
            Err(err) => {
                tracing::error!(account_id, cost, error = %err, "refund after provider failure failed");
                None
            }
        };

        let usage = UsageRecord {
            account_id: account_id.to_string(),
            action_type: action_type.to_string(),
            credits_used: cost,
            outcome: UsageOutcome::Failed,
            ts_ms: self.clock.now_ms(),
            correlation_ref: format!("rejected:{}", request_id()),
        };
        if let Err(err) = self.store.append_usage(&usage).await {
            tracing::error!(account_id, error = %err, "usage record lost");
        }
        balance
    }

    /// Queries the provider and mirrors the snapshot onto a known task.
    pub async fn refresh_status(&self, task_id: &str) -> Result<TaskView> {
        validate_task_id(task_id)
            .map_err(|_| CreditError::invalid_request(format!("malformed task id {task_id:?}")))?;
        let snapshot = self
            .provider
            .task_status(task_id)
            .await
            .map_err(|err| match err {
                ProviderError::NotFound { task_id } => CreditError::TaskNotFound { task_id },
                other => CreditError::UpstreamProvider(other),
            })?;

        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(TaskView {
                task_id: snapshot.task_id,
                status: snapshot.status,
                progress_pct: progress_for(snapshot.status, snapshot.progress_pct, 0),
                result_url: snapshot.result_url,
                message: snapshot.message,
            });
        };

        let update = TaskUpdate {
            status: snapshot.status,
            progress_pct: progress_for(snapshot.status, snapshot.progress_pct, task.progress_pct),
            result_url: snapshot.result_url.clone().or(task.result_url.clone()),
            message: snapshot.message.clone(),
        };
        self.store
            .update_task(task_id, &update, self.clock.now_ms())
            .await?;

        if update.status == TaskStatus::Failed && task.status != TaskStatus::Failed {
            self.on_task_failed(&task).await;
        }

        Ok(TaskView {
            task_id: task.task_id,
            status: update.status,
            progress_pct: update.progress_pct,
            result_url: update.result_url,
            message: update.message,
        })
    }

    async fn on_task_failed(&self, task: &TaskRecord) {
        tracing::info!(task_id = %task.task_id, account_id = %task.account_id, "provider reported task failure");
        if !self.pricing.refund_failed_tasks {
            return;
        }
        let account = match self.store.get_account(&task.account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "failed-task refund lookup failed");
                return;
            }
        };
        let ledger = self.identity.ledger_for(account.kind);
        let key = format!("task-failed:{}", task.task_id);
        match ledger.credit(&task.account_id, task.cost, &key).await {
            Ok(applied) if applied.applied => {
                let usage = UsageRecord {
                    account_id: task.account_id.clone(),
                    action_type: task.action_type.clone(),
                    credits_used: task.cost,
                    outcome: UsageOutcome::Failed,
                    ts_ms: self.clock.now_ms(),
                    correlation_ref: task.task_id.clone(),
                };
                if let Err(err) = self.store.append_usage(&usage).await {
                    tracing::error!(task_id = %task.task_id, error = %err, "usage record lost");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "failed-task refund failed");
            }
        }
    }
}

fn progress_for(status: TaskStatus, reported: Option<u8>, previous: u8) -> u8 {
    if status == TaskStatus::Completed {
        return 100;
    }
    reported.unwrap_or(previous).max(previous).min(100)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::IdentityConfig;
    use crate::identity::Credentials;
    use crate::store::{AccountRecord, BalanceKind, MemoryStore};

    #[derive(Default)]
    struct ScriptedProvider {
        create_calls: AtomicUsize,
        reject_with: Option<u16>,
        /// Calls accepted before `reject_with` applies.
        accept_first: usize,
        status: Mutex<Option<TaskSnapshot>>,
    }

    #[async_trait]
    impl ComputeProvider for ScriptedProvider {
        async fn create_task(
            &self,
            _action_type: &str,
            _payload: &Value,
        ) -> std::result::Result<TaskSnapshot, ProviderError> {
            let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.reject_with.filter(|_| n >= self.accept_first) {
                return Err(ProviderError::Status {
                    status,
                    body: "rejected".to_string(),
                });
            }
            Ok(TaskSnapshot {
                task_id: format!("task-{n}"),
                status: TaskStatus::Pending,
                progress_pct: None,
                result_url: None,
                message: None,
            })
        }

        async fn task_status(
            &self,
            task_id: &str,
        ) -> std::result::Result<TaskSnapshot, ProviderError> {
            self.status
                .lock()
                .expect("lock")
                .clone()
                .ok_or_else(|| ProviderError::NotFound {
                    task_id: task_id.to_string(),
                })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        resolver: IdentityResolver,
        gateway: TaskSubmissionGateway,
    }

    fn harness(provider: ScriptedProvider, pricing: PricingConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00 UTC)));
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let resolver = IdentityResolver::new(
            store.clone(),
            clock.clone(),
            b"s",
            b"v",
            IdentityConfig::default(),
        );
        let gateway = TaskSubmissionGateway::new(
            provider.clone(),
            store.clone(),
            resolver.clone(),
            clock,
            pricing,
        );
        Harness {
            store,
            provider,
            resolver,
            gateway,
        }
    }

    fn sora(cost: Option<i64>) -> TaskRequest {
        TaskRequest {
            action_type: "sora2".to_string(),
            cost,
            payload: serde_json::json!({ "prompt": "a cat" }),
            count: 1,
        }
    }

    fn batch(count: u32) -> TaskRequest {
        TaskRequest {
            count,
            ..sora(None)
        }
    }

    async fn member(h: &Harness, id: &str, balance: i64) -> ResolvedIdentity {
        h.store
            .insert_account(&AccountRecord {
                id: id.to_string(),
                kind: BalanceKind::Durable,
                balance,
                created_at_ms: 0,
                expires_at_ms: None,
            })
            .await
            .expect("insert");
        let session = h
            .resolver
            .issue_session(id, time::Duration::hours(1))
            .expect("session");
        h.resolver
            .resolve(&Credentials {
                bearer: Some(session),
                ..Credentials::default()
            })
            .await
            .expect("resolve")
    }

    #[tokio::test]
    async fn visitor_can_spend_single_credit_once() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        let identity = h
            .resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");

        let submitted = h.gateway.submit(&identity, &sora(Some(1))).await.expect("submit");
        assert_eq!(submitted.balance, 0);
        assert_eq!(submitted.task_id, "task-0");

        let err = h.gateway.submit(&identity, &sora(Some(1))).await.unwrap_err();
        assert!(matches!(err, CreditError::InsufficientBalance { .. }));
        assert_eq!(h.provider.create_calls.load(Ordering::SeqCst), 1);

        let usage = h
            .store
            .list_usage(&identity.account_id, 10)
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].outcome, UsageOutcome::Success);
        assert!(h.store.get_task("task-0").await.expect("task").is_some());
    }

    #[tokio::test]
    async fn provider_rejection_refunds_and_records_failure() {
        let h = harness(
            ScriptedProvider {
                reject_with: Some(500),
                ..ScriptedProvider::default()
            },
            PricingConfig::default(),
        );
        let identity = member(&h, "user-1", 2).await;

        let err = h.gateway.submit(&identity, &sora(Some(1))).await.unwrap_err();
        assert!(matches!(err, CreditError::UpstreamProvider(_)));

        let account = h.store.get_account("user-1").await.expect("get").expect("row");
        assert_eq!(account.balance, 2);
        let usage = h.store.list_usage("user-1", 10).await.expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].outcome, UsageOutcome::Failed);
    }

    #[test]
    fn pricing_rejects_unknown_actions_and_under_declared_costs() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        assert_eq!(h.gateway.price(&sora(None)).expect("price"), 1);
        assert_eq!(h.gateway.price(&sora(Some(3))).expect("price"), 3);

        let mut unwm = sora(Some(1));
        unwm.action_type = "sora2-unwm".to_string();
        assert!(matches!(
            h.gateway.price(&unwm),
            Err(CreditError::InvalidRequest { .. })
        ));
        let mut unknown = sora(None);
        unknown.action_type = "veo".to_string();
        assert!(matches!(
            h.gateway.price(&unknown),
            Err(CreditError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn failed_task_refund_follows_policy() {
        let pricing = PricingConfig {
            refund_failed_tasks: true,
            ..PricingConfig::default()
        };
        let h = harness(ScriptedProvider::default(), pricing);
        let identity = h
            .resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        h.gateway.submit(&identity, &sora(None)).await.expect("submit");

        *h.provider.status.lock().expect("lock") = Some(TaskSnapshot {
            task_id: "task-0".to_string(),
            status: TaskStatus::Failed,
            progress_pct: None,
            result_url: None,
            message: Some("moderation".to_string()),
        });
        let view = h.gateway.refresh_status("task-0").await.expect("status");
        assert_eq!(view.status, TaskStatus::Failed);
        h.gateway.refresh_status("task-0").await.expect("status again");

        let balance = identity
            .ledger
            .balance_of(&identity.account_id)
            .await
            .expect("balance");
        assert_eq!(balance, 1);
    }

    #[tokio::test]
    async fn accepted_task_that_later_fails_stays_paid_by_default() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        let identity = h
            .resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        let submitted = h.gateway.submit(&identity, &sora(None)).await.expect("submit");
        assert_eq!(submitted.balance, 0);

        *h.provider.status.lock().expect("lock") = Some(TaskSnapshot {
            task_id: "task-0".to_string(),
            status: TaskStatus::Failed,
            progress_pct: None,
            result_url: None,
            message: Some("moderation".to_string()),
        });
        let view = h.gateway.refresh_status("task-0").await.expect("status");
        assert_eq!(view.status, TaskStatus::Failed);
        h.gateway.refresh_status("task-0").await.expect("status again");

        let balance = identity
            .ledger
            .balance_of(&identity.account_id)
            .await
            .expect("balance");
        assert_eq!(balance, 0);
        let usage = h
            .store
            .list_usage(&identity.account_id, 10)
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].outcome, UsageOutcome::Success);
        let task = h.store.get_task("task-0").await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn batch_reserves_once_and_returns_every_task() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        let identity = member(&h, "user-2", 10).await;

        let submitted = h.gateway.submit(&identity, &batch(3)).await.expect("submit");
        assert_eq!(submitted.count, 3);
        assert_eq!(submitted.cost, 3);
        assert_eq!(submitted.balance, 7);
        assert_eq!(submitted.task_id, "task-0");
        let ids: Vec<_> = submitted.tasks.iter().map(|task| task.task_id.as_str()).collect();
        assert_eq!(ids, ["task-0", "task-1", "task-2"]);

        for id in ids {
            assert!(h.store.get_task(id).await.expect("get").is_some());
        }
        let usage = h.store.list_usage("user-2", 10).await.expect("usage");
        assert_eq!(usage.len(), 3);
        assert!(usage.iter().all(|record| record.outcome == UsageOutcome::Success
            && record.credits_used == 1));
    }

    #[tokio::test]
    async fn batch_refunds_tasks_the_provider_did_not_accept() {
        let h = harness(
            ScriptedProvider {
                reject_with: Some(503),
                accept_first: 2,
                ..ScriptedProvider::default()
            },
            PricingConfig::default(),
        );
        let identity = member(&h, "user-3", 10).await;

        let submitted = h.gateway.submit(&identity, &batch(5)).await.expect("submit");
        assert_eq!(submitted.count, 2);
        assert_eq!(submitted.cost, 2);
        assert_eq!(submitted.tasks.len(), 2);
        assert_eq!(submitted.balance, 8);
        assert_eq!(h.provider.create_calls.load(Ordering::SeqCst), 3);

        let account = h.store.get_account("user-3").await.expect("get").expect("row");
        assert_eq!(account.balance, 8);
        let usage = h.store.list_usage("user-3", 10).await.expect("usage");
        let failed: Vec<_> = usage
            .iter()
            .filter(|record| record.outcome == UsageOutcome::Failed)
            .collect();
        assert_eq!(usage.len(), 3);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].credits_used, 3);
    }

    #[tokio::test]
    async fn batch_size_is_bounded_and_checked_before_any_call() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        let identity = member(&h, "user-4", 100).await;
        for count in [0, 7] {
            assert!(matches!(
                h.gateway.submit(&identity, &batch(count)).await,
                Err(CreditError::InvalidRequest { .. })
            ));
        }

        let visitor = h
            .resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        assert!(matches!(
            h.gateway.submit(&visitor, &batch(2)).await,
            Err(CreditError::InsufficientBalance { .. })
        ));
        assert_eq!(h.provider.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get_account("user-4").await.expect("get").expect("row").balance, 100);
    }

    #[tokio::test]
    async fn unknown_provider_task_is_not_found() {
        let h = harness(ScriptedProvider::default(), PricingConfig::default());
        assert!(matches!(
            h.gateway.refresh_status("nope").await,
            Err(CreditError::TaskNotFound { .. })
        ));
    }
}
