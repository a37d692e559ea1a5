//! Resolves a request's credentials to an account and the ledger that governs it.
//!
//! Authenticated sessions win. A missing or invalid session falls back to the
//! visitor token, and a missing, forged, or expired visitor token mints a fresh
//! ephemeral account. The store row is authoritative for the balance; the
//! visitor token only names the account and mirrors its last known balance.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::error::Result;
use crate::ids::random_id;
use crate::ledger::{DurableLedger, EphemeralLedger, Ledger};
use crate::store::{AccountRecord, BalanceKind, LedgerStore};
use crate::token;

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    /// Unix seconds.
    pub exp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorClaims {
    pub account_id: String,
    pub balance: i64,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Raw credentials lifted from a request.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub session_cookie: Option<String>,
    pub visitor_token: Option<String>,
}

#[derive(Clone)]
pub struct ResolvedIdentity {
    pub account_id: String,
    pub kind: BalanceKind,
    pub authenticated: bool,
    /// True when a new ephemeral account was created for this request.
    pub minted: bool,
    pub ledger: Arc<dyn Ledger>,
}

impl std::fmt::Debug for ResolvedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedIdentity")
            .field("account_id", &self.account_id)
            .field("kind", &self.kind)
            .field("authenticated", &self.authenticated)
            .field("minted", &self.minted)
            .finish()
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    session_secret: Arc<[u8]>,
    visitor_secret: Arc<[u8]>,
    config: IdentityConfig,
    durable: Arc<DurableLedger>,
    ephemeral: Arc<EphemeralLedger>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("session_secret", &"<redacted>")
            .field("visitor_secret", &"<redacted>")
            .field("config", &self.config)
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        session_secret: impl AsRef<[u8]>,
        visitor_secret: impl AsRef<[u8]>,
        config: IdentityConfig,
    ) -> Self {
        let durable = Arc::new(DurableLedger::new(store.clone(), clock.clone()));
        let ephemeral = Arc::new(EphemeralLedger::new(
            store.clone(),
            clock.clone(),
            config.visitor_initial_credits,
        ));
        Self {
            store,
            clock,
            session_secret: Arc::from(session_secret.as_ref()),
            visitor_secret: Arc::from(visitor_secret.as_ref()),
            config,
            durable,
            ephemeral,
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn durable_ledger(&self) -> Arc<dyn Ledger> {
        self.durable.clone()
    }

    pub fn ledger_for(&self, kind: BalanceKind) -> Arc<dyn Ledger> {
        match kind {
            BalanceKind::Durable => self.durable.clone(),
            BalanceKind::Ephemeral => self.ephemeral.clone(),
        }
    }

    pub async fn resolve(&self, credentials: &Credentials) -> Result<ResolvedIdentity> {
        let session = credentials
            .bearer
            .as_deref()
            .or(credentials.session_cookie.as_deref());
        if let Some(raw) = session {
            match self.verify_session(raw) {
                Some(claims) => return self.resolve_durable(&claims.sub).await,
                None => tracing::debug!("session credential rejected; falling back to visitor"),
            }
        }
        self.resolve_visitor(credentials.visitor_token.as_deref())
            .await
    }

    /// Signs a session for `subject` valid for `ttl`.
    pub fn issue_session(&self, subject: &str, ttl: time::Duration) -> Result<String> {
        let claims = SessionClaims {
            sub: subject.to_string(),
            exp: (self.clock.now() + ttl).unix_timestamp(),
        };
        Ok(token::sign(&self.session_secret, &claims)?)
    }

    /// Re-signs the visitor token with the account's current stored balance.
    pub async fn visitor_token(&self, account_id: &str) -> Result<Option<String>> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        if account.kind != BalanceKind::Ephemeral {
            return Ok(None);
        }
        let claims = VisitorClaims {
            account_id: account.id,
            balance: account.balance,
            created_at_ms: account.created_at_ms,
            expires_at_ms: account.expires_at_ms.unwrap_or(account.created_at_ms),
        };
        Ok(Some(token::sign(&self.visitor_secret, &claims)?))
    }

    fn verify_session(&self, raw: &str) -> Option<SessionClaims> {
        let claims: SessionClaims = token::verify(&self.session_secret, raw).ok()?;
        if claims.sub.trim().is_empty() || claims.exp <= self.clock.now().unix_timestamp() {
            return None;
        }
        Some(claims)
    }

    async fn resolve_durable(&self, subject: &str) -> Result<ResolvedIdentity> {
        let seed = AccountRecord {
            id: subject.to_string(),
            kind: BalanceKind::Durable,
            balance: self.config.signup_credits,
            created_at_ms: self.clock.now_ms(),
            expires_at_ms: None,
        };
        let account = self.store.insert_account(&seed).await?;
        if account.kind != BalanceKind::Durable {
            return Err(crate::error::CreditError::unauthenticated(
                "session subject collides with a visitor account",
            ));
        }
        Ok(ResolvedIdentity {
            account_id: account.id,
            kind: BalanceKind::Durable,
            authenticated: true,
            minted: false,
            ledger: self.durable.clone(),
        })
    }

    async fn resolve_visitor(&self, raw: Option<&str>) -> Result<ResolvedIdentity> {
        let now_ms = self.clock.now_ms();
        let claims = raw
            .and_then(|raw| token::verify::<VisitorClaims>(&self.visitor_secret, raw).ok())
            .filter(|claims| claims.expires_at_ms > now_ms);

        if let Some(claims) = claims {
            let seed = AccountRecord {
                id: claims.account_id.clone(),
                kind: BalanceKind::Ephemeral,
                balance: claims.balance.clamp(0, self.config.visitor_initial_credits),
                created_at_ms: claims.created_at_ms,
                expires_at_ms: Some(claims.expires_at_ms),
            };
            let account = self.store.insert_account(&seed).await?;
            if account.kind == BalanceKind::Ephemeral && !account.is_expired(now_ms) {
                return Ok(self.visitor_identity(account.id, false));
            }
        }

        let account = AccountRecord {
            id: random_id("acct"),
            kind: BalanceKind::Ephemeral,
            balance: self.config.visitor_initial_credits,
            created_at_ms: now_ms,
            expires_at_ms: Some(now_ms + self.config.visitor_ttl_days * MS_PER_DAY),
        };
        let account = self.store.insert_account(&account).await?;
        tracing::info!(account_id = %account.id, "minted visitor account");
        Ok(self.visitor_identity(account.id, true))
    }

    fn visitor_identity(&self, account_id: String, minted: bool) -> ResolvedIdentity {
        ResolvedIdentity {
            account_id,
            kind: BalanceKind::Ephemeral,
            authenticated: false,
            minted,
            ledger: self.ephemeral.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn resolver() -> (IdentityResolver, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00 UTC)));
        let store = Arc::new(MemoryStore::new());
        let resolver = IdentityResolver::new(
            store.clone(),
            clock.clone(),
            b"session-secret",
            b"visitor-secret",
            IdentityConfig::default(),
        );
        (resolver, clock, store)
    }

    #[tokio::test]
    async fn anonymous_request_mints_one_credit_visitor() {
        let (resolver, _clock, store) = resolver();
        let identity = resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        assert_eq!(identity.kind, BalanceKind::Ephemeral);
        assert!(identity.minted);
        assert!(!identity.authenticated);

        let account = store
            .get_account(&identity.account_id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(account.balance, 1);
        assert_eq!(
            account.expires_at_ms,
            Some(account.created_at_ms + 30 * MS_PER_DAY)
        );
    }

    #[tokio::test]
    async fn visitor_token_round_trips_to_same_account() {
        let (resolver, _clock, _store) = resolver();
        let first = resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        let token = resolver
            .visitor_token(&first.account_id)
            .await
            .expect("token")
            .expect("ephemeral");

        let again = resolver
            .resolve(&Credentials {
                visitor_token: Some(token),
                ..Credentials::default()
            })
            .await
            .expect("resolve");
        assert_eq!(again.account_id, first.account_id);
        assert!(!again.minted);
    }

    #[tokio::test]
    async fn expired_or_forged_visitor_tokens_mint_new_accounts() {
        let (resolver, clock, _store) = resolver();
        let first = resolver
            .resolve(&Credentials::default())
            .await
            .expect("resolve");
        let token = resolver
            .visitor_token(&first.account_id)
            .await
            .expect("token")
            .expect("ephemeral");

        let forged = resolver
            .resolve(&Credentials {
                visitor_token: Some(format!("{token}x")),
                ..Credentials::default()
            })
            .await
            .expect("resolve");
        assert_ne!(forged.account_id, first.account_id);

        clock.advance(time::Duration::days(31));
        let expired = resolver
            .resolve(&Credentials {
                visitor_token: Some(token),
                ..Credentials::default()
            })
            .await
            .expect("resolve");
        assert!(expired.minted);
        assert_ne!(expired.account_id, first.account_id);
    }

    #[tokio::test]
    async fn session_takes_precedence_and_grants_signup_credits_once() {
        let (resolver, _clock, store) = resolver();
        let session = resolver
            .issue_session("user-1", time::Duration::hours(1))
            .expect("session");
        let creds = Credentials {
            bearer: Some(session),
            visitor_token: Some("garbage".to_string()),
            ..Credentials::default()
        };

        let identity = resolver.resolve(&creds).await.expect("resolve");
        assert!(identity.authenticated);
        assert_eq!(identity.kind, BalanceKind::Durable);
        assert_eq!(identity.account_id, "user-1");

        store.try_debit("user-1", 3).await.expect("debit");
        let again = resolver.resolve(&creds).await.expect("resolve");
        assert_eq!(again.account_id, "user-1");
        let account = store
            .get_account("user-1")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(account.balance, 0);
    }

    #[tokio::test]
    async fn invalid_session_falls_back_to_visitor() {
        let (resolver, clock, _store) = resolver();
        let session = resolver
            .issue_session("user-1", time::Duration::minutes(5))
            .expect("session");
        clock.advance(time::Duration::minutes(10));

        let identity = resolver
            .resolve(&Credentials {
                session_cookie: Some(session),
                ..Credentials::default()
            })
            .await
            .expect("resolve");
        assert!(!identity.authenticated);
        assert_eq!(identity.kind, BalanceKind::Ephemeral);
    }
}
