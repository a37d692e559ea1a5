//! Credit ledger: `reserve / refund / credit / balance_of` over either balance kind.
//!
//! Callers hold an `Arc<dyn Ledger>` and never branch on the account kind. The
//! ephemeral variant clamps every increment to its cap and refuses to spend an
//! expired balance; the durable variant is unbounded.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{CreditError, Result};
use crate::store::{BalanceKind, CreditApplication, DebitOutcome, LedgerStore};

#[async_trait]
pub trait Ledger: Send + Sync {
    fn kind(&self) -> BalanceKind;

    /// Debits `cost` only if the balance covers it. Returns the new balance.
    async fn reserve(&self, account_id: &str, cost: i64) -> Result<i64>;

    /// Reverses a reservation. Returns the new balance.
    async fn refund(&self, account_id: &str, cost: i64) -> Result<i64>;

    /// Applies `amount` at most once per `idempotency_key`.
    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<CreditApplication>;

    async fn balance_of(&self, account_id: &str) -> Result<i64>;
}

fn ensure_positive(what: &str, amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(CreditError::invalid_request(format!(
            "{what} must be > 0 (got {amount})"
        )));
    }
    Ok(())
}

fn debit_result(account_id: &str, cost: i64, outcome: DebitOutcome) -> Result<i64> {
    match outcome {
        DebitOutcome::Debited { balance } => {
            tracing::info!(account_id, cost, balance, "credits reserved");
            Ok(balance)
        }
        DebitOutcome::Insufficient { available } => {
            tracing::info!(account_id, cost, available, "reserve rejected");
            Err(CreditError::InsufficientBalance {
                required: cost,
                available,
            })
        }
    }
}

#[derive(Clone)]
pub struct DurableLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl DurableLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Ledger for DurableLedger {
    fn kind(&self) -> BalanceKind {
        BalanceKind::Durable
    }

    async fn reserve(&self, account_id: &str, cost: i64) -> Result<i64> {
        ensure_positive("cost", cost)?;
        let outcome = self.store.try_debit(account_id, cost).await?;
        debit_result(account_id, cost, outcome)
    }

    async fn refund(&self, account_id: &str, cost: i64) -> Result<i64> {
        ensure_positive("refund", cost)?;
        let balance = self.store.add_balance(account_id, cost, None).await?;
        tracing::info!(account_id, cost, balance, "credits refunded");
        Ok(balance)
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<CreditApplication> {
        ensure_positive("credit", amount)?;
        let applied = self
            .store
            .apply_credit(account_id, amount, idempotency_key, None, self.clock.now_ms())
            .await?;
        tracing::info!(
            account_id,
            amount,
            idempotency_key,
            applied = applied.applied,
            balance = applied.balance,
            "credit applied"
        );
        Ok(applied)
    }

    async fn balance_of(&self, account_id: &str) -> Result<i64> {
        let account = self.store.get_account(account_id).await?.ok_or_else(|| {
            CreditError::AccountNotFound {
                account_id: account_id.to_string(),
            }
        })?;
        Ok(account.balance)
    }
}

/// Anonymous visitor balance: bounded by `cap` and unusable past its expiry.
#[derive(Clone)]
pub struct EphemeralLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    cap: i64,
}

impl EphemeralLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, cap: i64) -> Self {
        Self {
            store,
            clock,
            cap: cap.max(0),
        }
    }

    pub fn cap(&self) -> i64 {
        self.cap
    }

    async fn ensure_live(&self, account_id: &str) -> Result<()> {
        let account = self.store.get_account(account_id).await?.ok_or_else(|| {
            CreditError::AccountNotFound {
                account_id: account_id.to_string(),
            }
        })?;
        if account.is_expired(self.clock.now_ms()) {
            return Err(CreditError::unauthenticated("visitor balance expired"));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for EphemeralLedger {
    fn kind(&self) -> BalanceKind {
        BalanceKind::Ephemeral
    }

    async fn reserve(&self, account_id: &str, cost: i64) -> Result<i64> {
        ensure_positive("cost", cost)?;
        self.ensure_live(account_id).await?;
        let outcome = self.store.try_debit(account_id, cost).await?;
        debit_result(account_id, cost, outcome)
    }

    async fn refund(&self, account_id: &str, cost: i64) -> Result<i64> {
        ensure_positive("refund", cost)?;
        let balance = self
            .store
            .add_balance(account_id, cost, Some(self.cap))
            .await?;
        tracing::info!(account_id, cost, balance, "visitor credits refunded");
        Ok(balance)
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<CreditApplication> {
        ensure_positive("credit", amount)?;
        self.ensure_live(account_id).await?;
        let applied = self
            .store
            .apply_credit(
                account_id,
                amount,
                idempotency_key,
                Some(self.cap),
                self.clock.now_ms(),
            )
            .await?;
        tracing::info!(
            account_id,
            amount,
            idempotency_key,
            applied = applied.applied,
            balance = applied.balance,
            "visitor credit applied"
        );
        Ok(applied)
    }

    async fn balance_of(&self, account_id: &str) -> Result<i64> {
        let account = self.store.get_account(account_id).await?.ok_or_else(|| {
            CreditError::AccountNotFound {
                account_id: account_id.to_string(),
            }
        })?;
        if account.is_expired(self.clock.now_ms()) {
            return Ok(0);
        }
        Ok(account.balance)
    }
}
