use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    AccountRecord, CreditApplication, DailyBonusRecord, DebitOutcome, LedgerStore, PaymentSession,
    PaymentStatus, StoreError, TaskRecord, TaskUpdate, UsageRecord,
};

/// In-process store. Each method holds the lock for its whole check-and-act step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<String, AccountRecord>,
    applied_credits: HashSet<String>,
    usage: Vec<UsageRecord>,
    tasks: HashMap<String, TaskRecord>,
    payment_sessions: HashMap<String, PaymentSession>,
    daily_bonus: HashSet<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn clamp(balance: i64, cap: Option<i64>) -> i64 {
    match cap {
        Some(cap) => balance.min(cap),
        None => balance,
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_account(&self, account: &AccountRecord) -> Result<AccountRecord, StoreError> {
        let mut state = self.lock()?;
        let stored = state
            .accounts
            .entry(account.id.clone())
            .or_insert_with(|| account.clone());
        Ok(stored.clone())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    async fn try_debit(&self, account_id: &str, amount: i64) -> Result<DebitOutcome, StoreError> {
        let mut state = self.lock()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;
        if account.balance < amount {
            return Ok(DebitOutcome::Insufficient {
                available: account.balance,
            });
        }
        account.balance -= amount;
        Ok(DebitOutcome::Debited {
            balance: account.balance,
        })
    }

    async fn add_balance(
        &self,
        account_id: &str,
        amount: i64,
        cap: Option<i64>,
    ) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;
        account.balance = clamp(account.balance.saturating_add(amount), cap).max(account.balance);
        Ok(account.balance)
    }

    async fn apply_credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
        cap: Option<i64>,
        _ts_ms: i64,
    ) -> Result<CreditApplication, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;
        if !state.applied_credits.insert(idempotency_key.to_string()) {
            return Ok(CreditApplication {
                applied: false,
                balance: account.balance,
            });
        }
        account.balance = clamp(account.balance.saturating_add(amount), cap).max(account.balance);
        Ok(CreditApplication {
            applied: true,
            balance: account.balance,
        })
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.lock()?.usage.push(record.clone());
        Ok(())
    }

    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .usage
            .iter()
            .rev()
            .filter(|record| record.account_id == account_id)
            .take(limit.max(1))
            .cloned()
            .collect())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.task_id) {
            return Err(StoreError::Duplicate {
                what: "task",
                id: task.task_id.clone(),
            });
        }
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    async fn update_task(
        &self,
        task_id: &str,
        update: &TaskUpdate,
        ts_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        task.status = update.status;
        task.progress_pct = update.progress_pct;
        task.result_url = update.result_url.clone();
        task.message = update.message.clone();
        task.updated_at_ms = ts_ms;
        Ok(true)
    }

    async fn insert_payment_session(&self, session: &PaymentSession) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.payment_sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate {
                what: "payment session",
                id: session.session_id.clone(),
            });
        }
        state
            .payment_sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_payment_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        Ok(self.lock()?.payment_sessions.get(session_id).cloned())
    }

    async fn complete_payment_session(
        &self,
        session_id: &str,
        ts_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(session) = state.payment_sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if session.status != PaymentStatus::Pending {
            return Ok(false);
        }
        session.status = PaymentStatus::Completed;
        session.completed_at_ms = Some(ts_ms);
        Ok(true)
    }

    async fn has_daily_bonus(&self, account_id: &str, date: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .daily_bonus
            .contains(&(account_id.to_string(), date.to_string())))
    }

    async fn try_insert_daily_bonus(&self, record: &DailyBonusRecord) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .daily_bonus
            .insert((record.account_id.clone(), record.granted_on.clone())))
    }

    async fn remove_daily_bonus(&self, account_id: &str, date: &str) -> Result<(), StoreError> {
        self.lock()?
            .daily_bonus
            .remove(&(account_id.to_string(), date.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BalanceKind;

    fn account(id: &str, balance: i64) -> AccountRecord {
        AccountRecord {
            id: id.to_string(),
            kind: BalanceKind::Durable,
            balance,
            created_at_ms: 0,
            expires_at_ms: None,
        }
    }

    #[tokio::test]
    async fn insert_account_keeps_existing_row() {
        let store = MemoryStore::new();
        store.insert_account(&account("a", 3)).await.expect("insert");
        let stored = store.insert_account(&account("a", 9)).await.expect("insert");
        assert_eq!(stored.balance, 3);
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let store = MemoryStore::new();
        store.insert_account(&account("a", 1)).await.expect("insert");
        assert_eq!(
            store.try_debit("a", 1).await.expect("debit"),
            DebitOutcome::Debited { balance: 0 }
        );
        assert_eq!(
            store.try_debit("a", 1).await.expect("debit"),
            DebitOutcome::Insufficient { available: 0 }
        );
        assert!(matches!(
            store.try_debit("missing", 1).await,
            Err(StoreError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn credits_apply_once_per_key_and_respect_cap() {
        let store = MemoryStore::new();
        store.insert_account(&account("a", 0)).await.expect("insert");
        let first = store.apply_credit("a", 10, "k1", None, 1).await.expect("credit");
        let second = store.apply_credit("a", 10, "k1", None, 2).await.expect("credit");
        assert_eq!(first, CreditApplication { applied: true, balance: 10 });
        assert_eq!(second, CreditApplication { applied: false, balance: 10 });

        store.insert_account(&account("b", 0)).await.expect("insert");
        assert_eq!(store.add_balance("b", 5, Some(1)).await.expect("add"), 1);
    }
}
