//! Persistence for profiles, tasks, media and the credit ledger.
//!
//! Every credit movement goes through one of the atomic operations below so
//! the balance and its ledger row can never drift apart.

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    plans::MembershipTier,
    task::{GenerationTask, MediaFile, TaskTransition},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub credits: i64,
    pub membership_tier: MembershipTier,
    pub membership_status: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub free_generations_used: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    Purchase,
    Subscription,
    Usage,
    Refund,
    SignupBonus,
}

impl CreditReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditReason::Purchase => "purchase",
            CreditReason::Subscription => "subscription",
            CreditReason::Usage => "usage",
            CreditReason::Refund => "refund",
            CreditReason::SignupBonus => "signup_bonus",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditHistoryEntry {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub reason: CreditReason,
    pub source_id: String,
    pub balance_after: i64,
    pub task_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Credit grant keyed by `source_id`; repeating the key is a no-op.
#[derive(Clone, Debug)]
pub struct CreditGrant {
    pub user_id: String,
    pub amount: i64,
    pub reason: CreditReason,
    pub source_id: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted { balance: i64 },
    AlreadyProcessed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentRecord {
    pub id: String,
    pub user_id: String,
    pub price_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub user_id: String,
    pub source_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub credits: i64,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct MembershipUpdate {
    pub tier: MembershipTier,
    pub status: String,
    pub subscription_id: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>>;

    /// Returns the existing profile or creates one, granting `signup_credits`.
    async fn ensure_profile(
        &self,
        user_id: &str,
        email: Option<&str>,
        signup_credits: i64,
    ) -> StoreResult<UserProfile>;

    async fn find_profile_by_customer(&self, customer_id: &str)
        -> StoreResult<Option<UserProfile>>;

    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> StoreResult<()>;

    async fn update_membership(&self, user_id: &str, update: MembershipUpdate)
        -> StoreResult<()>;

    /// Increments the free-generation counter if it is below `limit`.
    async fn consume_free_generation(&self, user_id: &str, limit: i64) -> StoreResult<bool>;

    /// Gives a consumed free generation back (used when the vendor rejects the job).
    async fn release_free_generation(&self, user_id: &str) -> StoreResult<()>;

    /// Charges a task: deducts `amount`, records a usage row and sets the
    /// task's `charged_credits`, all at once. A task that already failed is
    /// not charged. Returns the balance afterwards.
    async fn charge_task(&self, user_id: &str, amount: i64, task_id: &str) -> StoreResult<i64>;

    async fn grant_credits(&self, grant: CreditGrant) -> StoreResult<GrantOutcome>;

    /// Refunds a task's charged credits once; `None` when nothing was refunded.
    async fn refund_task(&self, task_id: &str) -> StoreResult<Option<i64>>;

    async fn list_credit_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<CreditHistoryEntry>>;

    async fn create_task(&self, task: GenerationTask) -> StoreResult<GenerationTask>;

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<GenerationTask>>;

    async fn list_tasks(&self, user_id: &str, limit: usize) -> StoreResult<Vec<GenerationTask>>;

    /// Compare-and-set on status: `None` when the stored status does not allow it.
    async fn transition_task(
        &self,
        task_id: &str,
        transition: TaskTransition,
    ) -> StoreResult<Option<GenerationTask>>;

    async fn delete_task(&self, task_id: &str) -> StoreResult<()>;

    /// Inserts one row per URL, skipping URLs the task already has. Returns
    /// all of the task's media.
    async fn add_media(&self, task: &GenerationTask, urls: &[String])
        -> StoreResult<Vec<MediaFile>>;

    async fn list_media(&self, task_id: &str) -> StoreResult<Vec<MediaFile>>;

    async fn create_payment_intent(&self, record: PaymentIntentRecord) -> StoreResult<()>;

    async fn set_payment_intent_status(&self, id: &str, status: &str) -> StoreResult<()>;

    async fn record_transaction(&self, record: TransactionRecord) -> StoreResult<()>;
}
