use std::sync::Arc;

use axum::Router;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use axum::routing::{get, post};
use serde::Serialize;

use crate::bonus::DailyBonusGranter;
use crate::clock::Clock;
use crate::config::{CreditgateConfig, Secrets};
use crate::identity::{Credentials, IdentityResolver, ResolvedIdentity};
use crate::payment::PaymentReconciler;
use crate::provider::ComputeProvider;
use crate::store::{BalanceKind, LedgerStore};
use crate::submission::TaskSubmissionGateway;

use super::{account, payments, tasks};

pub const VISITOR_HEADER: &str = "x-visitor-token";
pub const VISITOR_COOKIE: &str = "visitor_credits";
pub const SESSION_COOKIE: &str = "session";

const DEFAULT_USAGE_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub(super) identity: IdentityResolver,
    pub(super) submissions: TaskSubmissionGateway,
    pub(super) payments: PaymentReconciler,
    pub(super) bonus: DailyBonusGranter,
    pub(super) store: Arc<dyn LedgerStore>,
    pub(super) allow_anonymous_tasks: bool,
    pub(super) visitor_cookie_max_age_secs: i64,
    pub(super) secure_cookies: bool,
    pub(super) usage_limit: usize,
}

impl AppState {
    pub fn new(
        identity: IdentityResolver,
        submissions: TaskSubmissionGateway,
        payments: PaymentReconciler,
        bonus: DailyBonusGranter,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        let visitor_cookie_max_age_secs = identity.config().visitor_ttl_days * 86_400;
        let allow_anonymous_tasks = identity.config().allow_anonymous_tasks;
        Self {
            identity,
            submissions,
            payments,
            bonus,
            store,
            allow_anonymous_tasks,
            visitor_cookie_max_age_secs,
            secure_cookies: false,
            usage_limit: DEFAULT_USAGE_LIMIT,
        }
    }

    /// Wires every component from one config and one set of collaborators.
    pub fn from_config(
        config: &CreditgateConfig,
        secrets: &Secrets,
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn ComputeProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = IdentityResolver::new(
            store.clone(),
            clock.clone(),
            secrets.session.as_bytes(),
            secrets.visitor.as_bytes(),
            config.identity.clone(),
        );
        let submissions = TaskSubmissionGateway::new(
            provider,
            store.clone(),
            identity.clone(),
            clock.clone(),
            config.pricing.clone(),
        );
        let payments = PaymentReconciler::new(
            store.clone(),
            identity.durable_ledger(),
            clock.clone(),
            secrets.webhook.as_bytes(),
            config.payments.clone(),
        );
        let bonus = DailyBonusGranter::new(store.clone(), clock, config.bonus.daily_credits);
        Self::new(identity, submissions, payments, bonus, store)
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    pub fn with_usage_limit(mut self, limit: usize) -> Self {
        self.usage_limit = limit.max(1);
        self
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub(super) async fn resolve(&self, headers: &HeaderMap) -> crate::error::Result<ResolvedIdentity> {
        self.identity.resolve(&credentials(headers)).await
    }

    /// Re-issues the visitor token so the client mirrors the stored balance.
    pub(super) async fn attach_visitor(
        &self,
        identity: &ResolvedIdentity,
        mut response: Response,
    ) -> Response {
        if identity.kind != BalanceKind::Ephemeral {
            return response;
        }
        let token = match self.identity.visitor_token(&identity.account_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return response,
            Err(err) => {
                tracing::warn!(account_id = %identity.account_id, error = %err, "visitor token not reissued");
                return response;
            }
        };

        let mut cookie = format!(
            "{VISITOR_COOKIE}={token}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.visitor_cookie_max_age_secs
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&token) {
            headers.insert(VISITOR_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(SET_COOKIE, value);
        }
        response
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "ok" })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tasks", post(tasks::submit_task))
        .route("/v1/tasks/:task_id", get(tasks::task_status))
        .route("/v1/payments/checkout", post(payments::open_checkout))
        .route("/v1/payments/webhook", post(payments::payment_webhook))
        .route("/v1/bonus/daily", post(account::claim_daily_bonus))
        .route("/v1/balance", get(account::balance))
        .route("/v1/usage", get(account::usage))
        .with_state(state)
}

pub(super) fn credentials(headers: &HeaderMap) -> Credentials {
    Credentials {
        bearer: extract_bearer(headers),
        session_cookie: extract_cookie(headers, SESSION_COOKIE),
        visitor_token: extract_header(headers, VISITOR_HEADER)
            .or_else(|| extract_cookie(headers, VISITOR_COOKIE)),
    }
}

pub(super) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_header_wins_over_cookie_and_bearer_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer  tok "));
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; visitor_credits=from-cookie; session=sess"),
        );
        let creds = credentials(&headers);
        assert_eq!(creds.bearer.as_deref(), Some("tok"));
        assert_eq!(creds.session_cookie.as_deref(), Some("sess"));
        assert_eq!(creds.visitor_token.as_deref(), Some("from-cookie"));

        headers.insert(VISITOR_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(
            credentials(&headers).visitor_token.as_deref(),
            Some("from-header")
        );
    }
}
