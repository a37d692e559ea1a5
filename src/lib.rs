//! Credit-metered task gateway.
//!
//! Accounts hold either an ephemeral (visitor) or a durable (signed-in)
//! balance. Task submissions reserve credits before calling the compute
//! provider and refund on synchronous rejection; payments and the daily bonus
//! add credits exactly once per idempotency key.

pub mod bonus;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod ids;
pub mod ledger;
pub mod logging;
#[cfg(feature = "otel")]
pub mod otel;
pub mod payment;
pub mod poller;
pub mod provider;
pub mod store;
pub mod submission;
pub mod token;
pub mod utils;

pub use bonus::{BonusOutcome, DailyBonusGranter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CreditgateConfig, Env, Secrets};
pub use error::{CreditError, Result};
pub use identity::{Credentials, IdentityResolver, ResolvedIdentity};
pub use ledger::{DurableLedger, EphemeralLedger, Ledger};
pub use payment::{PaymentReconciler, WebhookReceipt};
pub use poller::{PollOutcome, PollSettings, PollerState, TaskPoller};
pub use provider::{ComputeProvider, HttpComputeProvider, ProviderError, TaskSnapshot};
pub use store::{LedgerStore, MemoryStore};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use submission::{SubmittedTask, TaskHandle, TaskRequest, TaskSubmissionGateway, TaskView};
