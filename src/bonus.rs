use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{CreditError, Result};
use crate::identity::ResolvedIdentity;
use crate::store::{DailyBonusRecord, LedgerStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusOutcome {
    pub rewarded: bool,
    pub credits_added: i64,
}

/// Grants `daily_credits` once per account per UTC calendar day.
#[derive(Clone)]
pub struct DailyBonusGranter {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    daily_credits: i64,
}

impl DailyBonusGranter {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, daily_credits: i64) -> Self {
        Self {
            store,
            clock,
            daily_credits,
        }
    }

    pub async fn claim(&self, identity: &ResolvedIdentity) -> Result<BonusOutcome> {
        if !identity.authenticated {
            return Err(CreditError::unauthenticated("sign in to claim the daily bonus"));
        }
        let account_id = identity.account_id.as_str();
        let today = self.clock.today_utc().to_string();
        let not_rewarded = BonusOutcome {
            rewarded: false,
            credits_added: 0,
        };

        if self.store.has_daily_bonus(account_id, &today).await? {
            return Ok(not_rewarded);
        }

        let record = DailyBonusRecord {
            account_id: account_id.to_string(),
            granted_on: today.clone(),
            ts_ms: self.clock.now_ms(),
        };
        if !self.store.try_insert_daily_bonus(&record).await? {
            tracing::debug!(account_id, date = %today, "daily bonus raced; already granted");
            return Ok(not_rewarded);
        }

        let key = format!("bonus:{account_id}:{today}");
        match identity
            .ledger
            .credit(account_id, self.daily_credits, &key)
            .await
        {
            Ok(_) => {
                tracing::info!(account_id, date = %today, credits = self.daily_credits, "daily bonus granted");
                Ok(BonusOutcome {
                    rewarded: true,
                    credits_added: self.daily_credits,
                })
            }
            Err(err) => {
                // Drop the claim so the account can retry today.
                if let Err(cleanup) = self.store.remove_daily_bonus(account_id, &today).await {
                    tracing::error!(account_id, date = %today, error = %cleanup, "daily bonus claim left behind");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::DurableLedger;
    use crate::store::{AccountRecord, BalanceKind, MemoryStore};

    async fn setup() -> (DailyBonusGranter, ResolvedIdentity, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 23:59 UTC)));
        let store = Arc::new(MemoryStore::new());
        store
            .insert_account(&AccountRecord {
                id: "user-1".to_string(),
                kind: BalanceKind::Durable,
                balance: 0,
                created_at_ms: 0,
                expires_at_ms: None,
            })
            .await
            .expect("insert");
        let identity = ResolvedIdentity {
            account_id: "user-1".to_string(),
            kind: BalanceKind::Durable,
            authenticated: true,
            minted: false,
            ledger: Arc::new(DurableLedger::new(store.clone(), clock.clone())),
        };
        let granter = DailyBonusGranter::new(store.clone(), clock.clone(), 5);
        (granter, identity, store, clock)
    }

    #[tokio::test]
    async fn grants_once_per_utc_day() {
        let (granter, identity, store, clock) = setup().await;

        let first = granter.claim(&identity).await.expect("claim");
        assert_eq!(
            first,
            BonusOutcome {
                rewarded: true,
                credits_added: 5
            }
        );
        let second = granter.claim(&identity).await.expect("claim");
        assert!(!second.rewarded);
        assert_eq!(second.credits_added, 0);

        clock.advance(time::Duration::minutes(2));
        let next_day = granter.claim(&identity).await.expect("claim");
        assert!(next_day.rewarded);

        let account = store.get_account("user-1").await.expect("get").expect("row");
        assert_eq!(account.balance, 10);
    }

    #[tokio::test]
    async fn concurrent_claims_reward_exactly_once() {
        let (granter, identity, store, _clock) = setup().await;

        let claims: Vec<_> = (0..8)
            .map(|_| {
                let granter = granter.clone();
                let identity = identity.clone();
                tokio::spawn(async move { granter.claim(&identity).await })
            })
            .collect();
        let mut rewarded = 0;
        for claim in claims {
            if claim.await.expect("join").expect("claim").rewarded {
                rewarded += 1;
            }
        }
        assert_eq!(rewarded, 1);
        let account = store.get_account("user-1").await.expect("get").expect("row");
        assert_eq!(account.balance, 5);
    }

    #[tokio::test]
    async fn visitors_cannot_claim() {
        let (granter, mut identity, _store, _clock) = setup().await;
        identity.authenticated = false;
        assert!(matches!(
            granter.claim(&identity).await,
            Err(CreditError::Authentication { .. })
        ));
    }
}
