use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    CreditGrant, CreditHistoryEntry, CreditReason, GrantOutcome, MembershipUpdate,
    PaymentIntentRecord, Store, StoreError, StoreResult, TransactionRecord, UserProfile,
};
use crate::{
    catalog::MediaKind,
    plans::resolve_tier,
    serde_num::de_i64_from_number,
    supabase::{eq, SupabaseClient},
    task::{GenerationTask, MediaFile, TaskStatus, TaskTransition},
};

const PROFILES: &str = "user_profiles";
const TASKS: &str = "generation_tasks";
const MEDIA: &str = "media_files";
const CREDIT_HISTORY: &str = "credit_history";
const PAYMENT_INTENTS: &str = "payment_intents";
const TRANSACTIONS: &str = "transactions";

/// Store backed by Supabase Postgres. Multi-row credit operations run inside
/// the SQL functions from `supabase/migrations`.
#[derive(Clone)]
pub struct SupabaseStore {
    client: SupabaseClient,
}

impl SupabaseStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: String,
    email: Option<String>,
    #[serde(deserialize_with = "de_i64_from_number")]
    credits: i64,
    membership_tier: Option<String>,
    membership_status: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    #[serde(deserialize_with = "de_i64_from_number")]
    free_generations_used: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProfileRow> for UserProfile {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            credits: row.credits,
            membership_tier: resolve_tier(row.membership_tier.as_deref()),
            membership_status: row.membership_status,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            free_generations_used: row.free_generations_used,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskRow {
    id: String,
    user_id: String,
    kind: MediaKind,
    model: String,
    prompt: String,
    #[serde(default)]
    input_image_urls: Vec<String>,
    status: TaskStatus,
    #[serde(deserialize_with = "de_i64_from_number")]
    cost: i64,
    #[serde(deserialize_with = "de_i64_from_number")]
    charged_credits: i64,
    refunded: bool,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for GenerationTask {
    fn from(row: TaskRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            kind: row.kind,
            model: row.model,
            prompt: row.prompt,
            input_image_urls: row.input_image_urls,
            status: row.status,
            cost: row.cost,
            charged_credits: row.charged_credits,
            refunded: row.refunded,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

impl From<GenerationTask> for TaskRow {
    fn from(task: GenerationTask) -> Self {
        Self {
            id: task.id,
            user_id: task.user_id,
            kind: task.kind,
            model: task.model,
            prompt: task.prompt,
            input_image_urls: task.input_image_urls,
            status: task.status,
            cost: task.cost,
            charged_credits: task.charged_credits,
            refunded: task.refunded,
            error_message: task.error_message,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MediaRow {
    id: String,
    task_id: String,
    user_id: String,
    url: String,
    media_type: MediaKind,
    created_at: DateTime<Utc>,
}

impl From<MediaRow> for MediaFile {
    fn from(row: MediaRow) -> Self {
        Self {
            id: row.id,
            task_id: row.task_id,
            user_id: row.user_id,
            url: row.url,
            media_type: row.media_type,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    id: String,
    user_id: String,
    #[serde(deserialize_with = "de_i64_from_number")]
    amount: i64,
    reason: CreditReason,
    source_id: String,
    #[serde(deserialize_with = "de_i64_from_number")]
    balance_after: i64,
    task_id: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<HistoryRow> for CreditHistoryEntry {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            reason: row.reason,
            source_id: row.source_id,
            balance_after: row.balance_after,
            task_id: row.task_id,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChargeResult {
    ok: bool,
    #[serde(deserialize_with = "de_i64_from_number")]
    balance: i64,
    #[serde(default)]
    missing: bool,
}

#[derive(Debug, Deserialize)]
struct GrantResult {
    granted: bool,
    #[serde(deserialize_with = "de_i64_from_number")]
    balance: i64,
}

fn open_statuses(next: TaskStatus) -> String {
    let names: Vec<&str> = TaskStatus::predecessors(next)
        .iter()
        .map(|status| status.as_str())
        .collect();
    format!("in.({})", names.join(","))
}

#[async_trait]
impl Store for SupabaseStore {
    async fn ping(&self) -> StoreResult<()> {
        let _rows: Vec<serde_json::Value> = self
            .client
            .select(PROFILES, &[("select", "id".to_string()), ("limit", "1".to_string())])
            .await
            .context("Supabase connectivity check failed")?;
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = self
            .client
            .select_one(PROFILES, &[("id", eq(user_id))])
            .await
            .context("failed to fetch user profile")?;
        Ok(row.map(UserProfile::from))
    }

    async fn ensure_profile(
        &self,
        user_id: &str,
        email: Option<&str>,
        signup_credits: i64,
    ) -> StoreResult<UserProfile> {
        let row: ProfileRow = self
            .client
            .rpc(
                "ensure_user_profile",
                json!({
                    "p_user_id": user_id,
                    "p_email": email,
                    "p_signup_credits": signup_credits,
                }),
            )
            .await
            .context("failed to ensure user profile")?;
        Ok(row.into())
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> StoreResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = self
            .client
            .select_one(PROFILES, &[("stripe_customer_id", eq(customer_id))])
            .await
            .context("failed to fetch profile by Stripe customer")?;
        Ok(row.map(UserProfile::from))
    }

    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> StoreResult<()> {
        let rows: Vec<serde_json::Value> = self
            .client
            .update(
                PROFILES,
                &[("id", eq(user_id))],
                &json!({ "stripe_customer_id": customer_id, "updated_at": Utc::now() }),
            )
            .await
            .context("failed to persist Stripe customer id")?;
        if rows.is_empty() {
            return Err(StoreError::NotFound {
                entity: "UserProfile",
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_membership(
        &self,
        user_id: &str,
        update: MembershipUpdate,
    ) -> StoreResult<()> {
        let _rows: Vec<serde_json::Value> = self
            .client
            .update(
                PROFILES,
                &[("id", eq(user_id))],
                &json!({
                    "membership_tier": update.tier.as_str(),
                    "membership_status": update.status,
                    "stripe_subscription_id": update.subscription_id,
                    "updated_at": Utc::now(),
                }),
            )
            .await
            .context("failed to update membership")?;
        Ok(())
    }

    async fn consume_free_generation(&self, user_id: &str, limit: i64) -> StoreResult<bool> {
        let consumed: bool = self
            .client
            .rpc(
                "consume_free_generation",
                json!({ "p_user_id": user_id, "p_limit": limit }),
            )
            .await
            .context("failed to consume free generation")?;
        Ok(consumed)
    }

    async fn release_free_generation(&self, user_id: &str) -> StoreResult<()> {
        let _: serde_json::Value = self
            .client
            .rpc("release_free_generation", json!({ "p_user_id": user_id }))
            .await
            .context("failed to release free generation")?;
        Ok(())
    }

    async fn charge_task(&self, user_id: &str, amount: i64, task_id: &str) -> StoreResult<i64> {
        let result: ChargeResult = self
            .client
            .rpc(
                "charge_task_credits",
                json!({
                    "p_user_id": user_id,
                    "p_task_id": task_id,
                    "p_amount": amount,
                }),
            )
            .await
            .context("failed to charge task credits")?;

        if result.missing {
            return Err(StoreError::NotFound {
                entity: "GenerationTask",
                id: task_id.to_string(),
            });
        }
        if !result.ok {
            return Err(StoreError::InsufficientCredits {
                balance: result.balance,
                required: amount,
            });
        }
        Ok(result.balance)
    }

    async fn grant_credits(&self, grant: CreditGrant) -> StoreResult<GrantOutcome> {
        let result: GrantResult = self
            .client
            .rpc(
                "grant_credits",
                json!({
                    "p_user_id": grant.user_id,
                    "p_amount": grant.amount,
                    "p_reason": grant.reason.as_str(),
                    "p_source_id": grant.source_id,
                    "p_description": grant.description,
                }),
            )
            .await
            .context("failed to grant credits")?;

        Ok(if result.granted {
            GrantOutcome::Granted {
                balance: result.balance,
            }
        } else {
            GrantOutcome::AlreadyProcessed
        })
    }

    async fn refund_task(&self, task_id: &str) -> StoreResult<Option<i64>> {
        let refunded: i64 = self
            .client
            .rpc("refund_task_credits", json!({ "p_task_id": task_id }))
            .await
            .context("failed to refund task credits")?;
        Ok((refunded > 0).then_some(refunded))
    }

    async fn list_credit_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<CreditHistoryEntry>> {
        let rows: Vec<HistoryRow> = self
            .client
            .select(
                CREDIT_HISTORY,
                &[
                    ("user_id", eq(user_id)),
                    ("order", "created_at.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await
            .context("failed to list credit history")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_task(&self, task: GenerationTask) -> StoreResult<GenerationTask> {
        let id = task.id.clone();
        let rows: Vec<TaskRow> = self
            .client
            .insert(TASKS, &TaskRow::from(task))
            .await
            .with_context(|| format!("failed to insert generation task {id}"))?;
        rows.into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("insert returned no task row")))
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<GenerationTask>> {
        let row: Option<TaskRow> = self
            .client
            .select_one(TASKS, &[("id", eq(task_id))])
            .await
            .context("failed to fetch generation task")?;
        Ok(row.map(Into::into))
    }

    async fn list_tasks(&self, user_id: &str, limit: usize) -> StoreResult<Vec<GenerationTask>> {
        let rows: Vec<TaskRow> = self
            .client
            .select(
                TASKS,
                &[
                    ("user_id", eq(user_id)),
                    ("order", "created_at.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await
            .context("failed to list generation tasks")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn transition_task(
        &self,
        task_id: &str,
        transition: TaskTransition,
    ) -> StoreResult<Option<GenerationTask>> {
        let now = Utc::now();
        let mut patch = json!({
            "status": transition.to.as_str(),
            "updated_at": now,
        });
        if let Some(message) = &transition.error_message {
            patch["error_message"] = json!(message);
        }
        if transition.to.is_terminal() {
            patch["completed_at"] = json!(now);
        }

        let rows: Vec<TaskRow> = self
            .client
            .update(
                TASKS,
                &[
                    ("id", eq(task_id)),
                    ("status", open_statuses(transition.to)),
                ],
                &patch,
            )
            .await
            .context("failed to transition generation task")?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        self.client
            .delete(MEDIA, &[("task_id", eq(task_id))])
            .await
            .context("failed to delete media files")?;
        self.client
            .delete(TASKS, &[("id", eq(task_id))])
            .await
            .context("failed to delete generation task")?;
        Ok(())
    }

    async fn add_media(
        &self,
        task: &GenerationTask,
        urls: &[String],
    ) -> StoreResult<Vec<MediaFile>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let rows: Vec<MediaRow> = urls
            .iter()
            .map(|url| MediaRow {
                id: uuid::Uuid::new_v4().to_string(),
                task_id: task.id.clone(),
                user_id: task.user_id.clone(),
                url: url.clone(),
                media_type: task.kind,
                created_at: now,
            })
            .collect();
        self.client
            .insert_ignore_duplicates(MEDIA, &rows, "task_id,url")
            .await
            .context("failed to insert media files")?;
        self.list_media(&task.id).await
    }

    async fn list_media(&self, task_id: &str) -> StoreResult<Vec<MediaFile>> {
        let rows: Vec<MediaRow> = self
            .client
            .select(
                MEDIA,
                &[
                    ("task_id", eq(task_id)),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await
            .context("failed to list media files")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_payment_intent(&self, record: PaymentIntentRecord) -> StoreResult<()> {
        self.client
            .insert_ignore_duplicates(
                PAYMENT_INTENTS,
                &json!({
                    "id": record.id,
                    "user_id": record.user_id,
                    "price_id": record.price_id,
                    "status": record.status,
                    "created_at": record.created_at,
                }),
                "id",
            )
            .await
            .context("failed to store payment intent")?;
        Ok(())
    }

    async fn set_payment_intent_status(&self, id: &str, status: &str) -> StoreResult<()> {
        let _rows: Vec<serde_json::Value> = self
            .client
            .update(
                PAYMENT_INTENTS,
                &[("id", eq(id))],
                &json!({ "status": status, "updated_at": Utc::now() }),
            )
            .await
            .context("failed to update payment intent")?;
        Ok(())
    }

    async fn record_transaction(&self, record: TransactionRecord) -> StoreResult<()> {
        self.client
            .insert_ignore_duplicates(
                TRANSACTIONS,
                &json!({
                    "id": record.id,
                    "user_id": record.user_id,
                    "source_id": record.source_id,
                    "amount_minor": record.amount_minor,
                    "currency": record.currency,
                    "credits": record.credits,
                    "kind": record.kind,
                    "created_at": record.created_at,
                }),
                "source_id",
            )
            .await
            .context("failed to record transaction")?;
        Ok(())
    }
}
