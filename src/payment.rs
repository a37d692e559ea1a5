//! Checkout sessions and webhook reconciliation.
//!
//! Deliveries are signed `t=<unix>,v1=<hex hmac-sha256("{t}.{body}")>`. A
//! verified `checkout.session.completed` event credits the session's account
//! under the session's idempotency key, then marks the session completed.
//! Redelivery after a partial failure re-runs both steps safely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::PaymentsConfig;
use crate::error::{CreditError, Result};
use crate::identity::ResolvedIdentity;
use crate::ids::{hex_decode, hex_encode, random_id};
use crate::ledger::Ledger;
use crate::store::{LedgerStore, PaymentSession, PaymentStatus};
use crate::token::{hmac_sha256, verify_hmac_sha256};

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub amount: serde_json::Number,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    pub amount: i64,
    pub currency: String,
    pub credits: i64,
    pub status: PaymentStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookReceipt {
    Ignored { event_type: String },
    AlreadyCompleted { session_id: String },
    Credited {
        session_id: String,
        credits: i64,
        balance: i64,
    },
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    webhook_secret: Arc<[u8]>,
    config: PaymentsConfig,
}

impl std::fmt::Debug for PaymentReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentReconciler")
            .field("webhook_secret", &"<redacted>")
            .field("config", &self.config)
            .finish()
    }
}

impl PaymentReconciler {
    /// `ledger` must be the durable ledger; checkout requires an authenticated account.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        webhook_secret: impl AsRef<[u8]>,
        config: PaymentsConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            webhook_secret: Arc::from(webhook_secret.as_ref()),
            config,
        }
    }

    pub async fn open_checkout(
        &self,
        identity: &ResolvedIdentity,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession> {
        if !identity.authenticated {
            return Err(CreditError::unauthenticated("sign in to buy credits"));
        }
        let currency = request
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|currency| !currency.is_empty())
            .unwrap_or(&self.config.default_currency)
            .to_ascii_lowercase();
        let rate = self.config.rate_for(&currency).ok_or_else(|| {
            CreditError::invalid_request(format!("currency {currency} is not accepted"))
        })?;
        let amount = whole_amount(&request.amount)?;
        if amount < rate.min_amount {
            return Err(CreditError::invalid_request(format!(
                "amount must be at least {} {currency}",
                rate.min_amount
            )));
        }
        let credits = amount
            .checked_mul(rate.credits_per_unit)
            .ok_or_else(|| CreditError::invalid_request("amount is too large"))?;

        let session_id = random_id("cs");
        let session = PaymentSession {
            session_id: session_id.clone(),
            account_id: identity.account_id.clone(),
            amount,
            currency,
            credits,
            status: PaymentStatus::Pending,
            idempotency_key: session_id,
            created_at_ms: self.clock.now_ms(),
            completed_at_ms: None,
        };
        self.store.insert_payment_session(&session).await?;
        tracing::info!(
            session_id = %session.session_id,
            account_id = %session.account_id,
            amount,
            currency = %session.currency,
            credits,
            "checkout session opened"
        );

        Ok(CheckoutSession {
            session_id: session.session_id,
            amount: session.amount,
            currency: session.currency,
            credits: session.credits,
            status: session.status,
        })
    }

    pub fn verify_signature(&self, header: Option<&str>, body: &[u8]) -> Result<()> {
        let header = header
            .map(str::trim)
            .filter(|header| !header.is_empty())
            .ok_or_else(|| webhook_error("missing signature header"))?;

        let mut timestamp: Option<i64> = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                "t" => timestamp = value.trim().parse().ok(),
                "v1" => candidates.push(value.trim()),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or_else(|| webhook_error("signature has no timestamp"))?;
        if candidates.is_empty() {
            return Err(webhook_error("signature has no v1 entry"));
        }

        let now = self.clock.now().unix_timestamp();
        if (now - timestamp).abs() > self.config.signature_tolerance_secs {
            return Err(webhook_error("signature timestamp outside tolerance"));
        }

        let signed = signed_payload(timestamp, body);
        let matched = candidates.iter().any(|candidate| {
            hex_decode(candidate)
                .is_some_and(|mac| verify_hmac_sha256(&self.webhook_secret, &signed, &mac).is_ok())
        });
        if !matched {
            return Err(webhook_error("signature mismatch"));
        }
        Ok(())
    }

    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookReceipt> {
        self.verify_signature(signature, body)?;

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|err| CreditError::invalid_request(format!("webhook body: {err}")))?;
        if event.event_type != CHECKOUT_COMPLETED {
            tracing::debug!(event_type = %event.event_type, "webhook event ignored");
            return Ok(WebhookReceipt::Ignored {
                event_type: event.event_type,
            });
        }
        let session_id = event
            .data
            .map(|data| data.object.id)
            .ok_or_else(|| CreditError::invalid_request("checkout event has no session"))?;

        self.complete_session(&session_id).await
    }

    pub async fn complete_session(&self, session_id: &str) -> Result<WebhookReceipt> {
        let session = self
            .store
            .get_payment_session(session_id)
            .await?
            .ok_or_else(|| CreditError::PaymentSessionNotFound {
                session_id: session_id.to_string(),
            })?;

        if session.status == PaymentStatus::Completed {
            tracing::info!(session_id, "payment session already completed");
            return Ok(WebhookReceipt::AlreadyCompleted {
                session_id: session.session_id,
            });
        }

        let applied = self
            .ledger
            .credit(&session.account_id, session.credits, &session.idempotency_key)
            .await?;
        let transitioned = self
            .store
            .complete_payment_session(session_id, self.clock.now_ms())
            .await?;
        tracing::info!(
            session_id,
            account_id = %session.account_id,
            credits = session.credits,
            applied = applied.applied,
            transitioned,
            "payment session reconciled"
        );

        Ok(WebhookReceipt::Credited {
            session_id: session.session_id,
            credits: session.credits,
            balance: applied.balance,
        })
    }
}

fn webhook_error(reason: &str) -> CreditError {
    CreditError::WebhookVerification {
        reason: reason.to_string(),
    }
}

fn whole_amount(raw: &serde_json::Number) -> Result<i64> {
    if let Some(amount) = raw.as_i64() {
        return Ok(amount);
    }
    match raw.as_f64() {
        Some(amount) if amount.fract() == 0.0 && amount.abs() < 9.0e15 => Ok(amount as i64),
        _ => Err(CreditError::invalid_request("amount must be a whole number")),
    }
}

fn signed_payload(timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(body);
    signed
}

/// Builds a signature header value for `body` as the payment provider would.
pub fn sign_webhook_payload(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String> {
    let mac = hmac_sha256(secret, &signed_payload(timestamp, body))?;
    Ok(format!("t={timestamp},v1={}", hex_encode(&mac)))
}
