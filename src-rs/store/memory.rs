use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    CreditGrant, CreditHistoryEntry, CreditReason, GrantOutcome, MembershipUpdate,
    PaymentIntentRecord, Store, StoreError, StoreResult, TransactionRecord, UserProfile,
};
use crate::{
    plans::MembershipTier,
    task::{GenerationTask, MediaFile, TaskStatus, TaskTransition},
};

/// Process-local store. Each operation runs under one lock, which gives the
/// same atomicity the Postgres functions provide.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    profiles: HashMap<String, UserProfile>,
    tasks: HashMap<String, GenerationTask>,
    media: Vec<MediaFile>,
    history: Vec<CreditHistoryEntry>,
    payment_intents: HashMap<String, PaymentIntentRecord>,
    transactions: Vec<TransactionRecord>,
    #[cfg(test)]
    fail_next_media_insert: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.inner.lock().transactions.clone()
    }

    pub fn payment_intent(&self, id: &str) -> Option<PaymentIntentRecord> {
        self.inner.lock().payment_intents.get(id).cloned()
    }

    pub fn fail_next_media_insert(&self) {
        self.inner.lock().fail_next_media_insert = true;
    }

    pub fn set_task_created_at(&self, task_id: &str, created_at: chrono::DateTime<Utc>) {
        if let Some(task) = self.inner.lock().tasks.get_mut(task_id) {
            task.created_at = created_at;
        }
    }
}

impl Inner {
    fn profile_mut(&mut self, user_id: &str) -> StoreResult<&mut UserProfile> {
        self.profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "UserProfile",
                id: user_id.to_string(),
            })
    }

    fn has_source(&self, source_id: &str) -> bool {
        self.history.iter().any(|entry| entry.source_id == source_id)
    }

    /// Applies a signed balance change and appends its ledger row.
    fn apply(
        &mut self,
        user_id: &str,
        amount: i64,
        reason: CreditReason,
        source_id: String,
        task_id: Option<String>,
        description: Option<String>,
    ) -> StoreResult<i64> {
        let now = Utc::now();
        let profile = self.profile_mut(user_id)?;
        if profile.credits + amount < 0 {
            return Err(StoreError::InsufficientCredits {
                balance: profile.credits,
                required: -amount,
            });
        }
        profile.credits += amount;
        profile.updated_at = now;
        let balance = profile.credits;

        self.history.push(CreditHistoryEntry {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            reason,
            source_id,
            balance_after: balance,
            task_id,
            description,
            created_at: now,
        });
        Ok(balance)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        Ok(self.inner.lock().profiles.get(user_id).cloned())
    }

    async fn ensure_profile(
        &self,
        user_id: &str,
        email: Option<&str>,
        signup_credits: i64,
    ) -> StoreResult<UserProfile> {
        let mut inner = self.inner.lock();
        if let Some(profile) = inner.profiles.get(user_id) {
            return Ok(profile.clone());
        }

        let now = Utc::now();
        inner.profiles.insert(
            user_id.to_string(),
            UserProfile {
                id: user_id.to_string(),
                email: email.map(ToString::to_string),
                credits: 0,
                membership_tier: MembershipTier::Free,
                membership_status: None,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                free_generations_used: 0,
                created_at: now,
                updated_at: now,
            },
        );
        if signup_credits > 0 {
            inner.apply(
                user_id,
                signup_credits,
                CreditReason::SignupBonus,
                format!("signup:{user_id}"),
                None,
                Some("Welcome credits".to_string()),
            )?;
        }

        let profile = inner.profile_mut(user_id)?;
        Ok(profile.clone())
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> StoreResult<Option<UserProfile>> {
        Ok(self
            .inner
            .lock()
            .profiles
            .values()
            .find(|profile| profile.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let profile = inner.profile_mut(user_id)?;
        profile.stripe_customer_id = Some(customer_id.to_string());
        profile.updated_at = Utc::now();
        Ok(())
    }

    async fn update_membership(
        &self,
        user_id: &str,
        update: MembershipUpdate,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let profile = inner.profile_mut(user_id)?;
        profile.membership_tier = update.tier;
        profile.membership_status = Some(update.status);
        profile.stripe_subscription_id = update.subscription_id;
        profile.updated_at = Utc::now();
        Ok(())
    }

    async fn consume_free_generation(&self, user_id: &str, limit: i64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let profile = inner.profile_mut(user_id)?;
        if profile.free_generations_used >= limit {
            return Ok(false);
        }
        profile.free_generations_used += 1;
        profile.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_free_generation(&self, user_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let profile = inner.profile_mut(user_id)?;
        profile.free_generations_used = (profile.free_generations_used - 1).max(0);
        Ok(())
    }

    async fn charge_task(&self, user_id: &str, amount: i64, task_id: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock();
        let (status, already_charged) = match inner.tasks.get(task_id) {
            Some(task) => (task.status, task.charged_credits > 0),
            None => {
                return Err(StoreError::NotFound {
                    entity: "GenerationTask",
                    id: task_id.to_string(),
                })
            }
        };

        if amount <= 0 || status == TaskStatus::Failed || already_charged {
            return Ok(inner.profile_mut(user_id)?.credits);
        }

        let balance = inner.apply(
            user_id,
            -amount,
            CreditReason::Usage,
            format!("usage:{task_id}"),
            Some(task_id.to_string()),
            None,
        )?;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.charged_credits = amount;
            task.updated_at = Utc::now();
        }
        Ok(balance)
    }

    async fn grant_credits(&self, grant: CreditGrant) -> StoreResult<GrantOutcome> {
        let mut inner = self.inner.lock();
        if inner.has_source(&grant.source_id) {
            return Ok(GrantOutcome::AlreadyProcessed);
        }
        let balance = inner.apply(
            &grant.user_id,
            grant.amount,
            grant.reason,
            grant.source_id,
            None,
            grant.description,
        )?;
        Ok(GrantOutcome::Granted { balance })
    }

    async fn refund_task(&self, task_id: &str) -> StoreResult<Option<i64>> {
        let mut inner = self.inner.lock();
        let task = match inner.tasks.get(task_id) {
            Some(task) => task.clone(),
            None => return Ok(None),
        };
        if task.refunded || task.charged_credits <= 0 {
            return Ok(None);
        }

        inner.apply(
            &task.user_id,
            task.charged_credits,
            CreditReason::Refund,
            format!("refund:{task_id}"),
            Some(task_id.to_string()),
            task.error_message.clone(),
        )?;
        if let Some(stored) = inner.tasks.get_mut(task_id) {
            stored.refunded = true;
            stored.updated_at = Utc::now();
        }
        Ok(Some(task.charged_credits))
    }

    async fn list_credit_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<CreditHistoryEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: GenerationTask) -> StoreResult<GenerationTask> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                entity: "GenerationTask",
                id: task.id,
            });
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<GenerationTask>> {
        Ok(self.inner.lock().tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, user_id: &str, limit: usize) -> StoreResult<Vec<GenerationTask>> {
        let inner = self.inner.lock();
        let mut tasks: Vec<GenerationTask> = inner
            .tasks
            .values()
            .filter(|task| task.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        task_id: &str,
        transition: TaskTransition,
    ) -> StoreResult<Option<GenerationTask>> {
        let mut inner = self.inner.lock();
        let task = match inner.tasks.get_mut(task_id) {
            Some(task) => task,
            None => return Ok(None),
        };
        if !task.status.can_transition_to(transition.to) {
            return Ok(None);
        }

        let now = Utc::now();
        task.status = transition.to;
        task.updated_at = now;
        if transition.error_message.is_some() {
            task.error_message = transition.error_message;
        }
        if transition.to.is_terminal() {
            task.completed_at = Some(now);
        }
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.media.retain(|media| media.task_id != task_id);
        inner.tasks.remove(task_id);
        Ok(())
    }

    async fn add_media(
        &self,
        task: &GenerationTask,
        urls: &[String],
    ) -> StoreResult<Vec<MediaFile>> {
        let mut inner = self.inner.lock();
        #[cfg(test)]
        if std::mem::take(&mut inner.fail_next_media_insert) {
            return Err(StoreError::Backend(anyhow::anyhow!("media insert failed")));
        }

        let now = Utc::now();
        for url in urls {
            let exists = inner
                .media
                .iter()
                .any(|media| media.task_id == task.id && media.url == *url);
            if exists {
                continue;
            }
            inner.media.push(MediaFile {
                id: Uuid::new_v4().to_string(),
                task_id: task.id.clone(),
                user_id: task.user_id.clone(),
                url: url.clone(),
                media_type: task.kind,
                created_at: now,
            });
        }

        Ok(inner
            .media
            .iter()
            .filter(|media| media.task_id == task.id)
            .cloned()
            .collect())
    }

    async fn list_media(&self, task_id: &str) -> StoreResult<Vec<MediaFile>> {
        Ok(self
            .inner
            .lock()
            .media
            .iter()
            .filter(|media| media.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn create_payment_intent(&self, record: PaymentIntentRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .payment_intents
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_payment_intent_status(&self, id: &str, status: &str) -> StoreResult<()> {
        if let Some(record) = self.inner.lock().payment_intents.get_mut(id) {
            record.status = status.to_string();
        }
        Ok(())
    }

    async fn record_transaction(&self, record: TransactionRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner
            .transactions
            .iter()
            .any(|existing| existing.source_id == record.source_id)
        {
            return Ok(());
        }
        inner.transactions.push(record);
        Ok(())
    }
}
