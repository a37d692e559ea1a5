//! Ledger store: the only shared mutable resource.
//!
//! Every mutating method is a single check-and-act step. Implementations must
//! never split a conditional balance change into a read followed by a write.

mod memory;
#[cfg(feature = "store-sqlite")]
mod sqlite;
mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;
pub use types::{
    AccountRecord, BalanceKind, CreditApplication, DailyBonusRecord, DebitOutcome,
    PaymentSession, PaymentStatus, TaskRecord, TaskStatus, TaskUpdate, UsageOutcome, UsageRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("duplicate {what}: {id}")]
    Duplicate { what: &'static str, id: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts the account unless one with the same id exists; returns the stored row.
    async fn insert_account(&self, account: &AccountRecord) -> Result<AccountRecord, StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError>;

    /// Decrements the balance by `amount` only if the balance covers it.
    async fn try_debit(&self, account_id: &str, amount: i64) -> Result<DebitOutcome, StoreError>;

    /// Increments the balance, clamped to `cap` when given. Returns the new balance.
    async fn add_balance(
        &self,
        account_id: &str,
        amount: i64,
        cap: Option<i64>,
    ) -> Result<i64, StoreError>;

    /// Increments the balance only if `idempotency_key` has never been applied.
    /// The grant is stamped with `ts_ms`.
    async fn apply_credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
        cap: Option<i64>,
        ts_ms: i64,
    ) -> Result<CreditApplication, StoreError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Most recent first.
    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Returns false when the task is unknown.
    async fn update_task(
        &self,
        task_id: &str,
        update: &TaskUpdate,
        ts_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn insert_payment_session(&self, session: &PaymentSession) -> Result<(), StoreError>;

    async fn get_payment_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, StoreError>;

    /// Moves a session from pending to completed. Returns false if it was not pending.
    async fn complete_payment_session(
        &self,
        session_id: &str,
        ts_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn has_daily_bonus(&self, account_id: &str, date: &str) -> Result<bool, StoreError>;

    /// Returns false when a record for `(account, date)` already exists.
    async fn try_insert_daily_bonus(&self, record: &DailyBonusRecord) -> Result<bool, StoreError>;

    async fn remove_daily_bonus(&self, account_id: &str, date: &str) -> Result<(), StoreError>;
}
