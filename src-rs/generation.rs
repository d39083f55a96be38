//! Task lifecycle: submit to the vendor, charge, then settle from callbacks,
//! reconciliation or the cooperative timeout.

use axum::http::StatusCode;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::{
    catalog::{default_model, find_model, MediaKind, ModelSpec},
    kie::CallbackEvent,
    middleware::AuthenticatedUser,
    provider::{GenerationRequest, ProviderError, VendorOutcome},
    state::AppState,
    store::{StoreError, StoreResult},
    task::{GenerationTask, MediaFile, TaskStatus, TaskTransition},
};

pub const MAX_PROMPT_CHARS: usize = 5000;
pub const MAX_INPUT_IMAGES: usize = 5;
pub const TIMEOUT_MESSAGE: &str = "timeout";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Invalid(String),

    #[error("Insufficient credits")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Task not found")]
    NotFound,

    #[error("Task is still within its processing window")]
    TooEarly { retry_after_secs: i64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GenerationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GenerationError::Invalid(_) => StatusCode::BAD_REQUEST,
            GenerationError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            GenerationError::NotFound => StatusCode::NOT_FOUND,
            GenerationError::TooEarly { .. } => StatusCode::CONFLICT,
            GenerationError::Provider(ProviderError::NotConfigured(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GenerationError::Provider(_) => StatusCode::BAD_GATEWAY,
            GenerationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenerationInput {
    pub kind: MediaKind,
    pub prompt: String,
    pub model: Option<String>,
    pub image_urls: Vec<String>,
    pub aspect_ratio: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStarted {
    pub task_id: String,
    pub status: TaskStatus,
    pub model: &'static str,
    pub cost: i64,
    pub free: bool,
    pub charged_credits: i64,
    pub credits_remaining: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: GenerationTask,
    pub media: Vec<MediaFile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackAck {
    UnknownTask,
    Applied(TaskStatus),
}

fn validate(input: &GenerationInput) -> Result<(&'static ModelSpec, String), GenerationError> {
    let prompt = input.prompt.trim();
    if prompt.is_empty() {
        return Err(GenerationError::Invalid("Prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(GenerationError::Invalid(format!(
            "Prompt must be at most {MAX_PROMPT_CHARS} characters"
        )));
    }

    if input.image_urls.len() > MAX_INPUT_IMAGES {
        return Err(GenerationError::Invalid(format!(
            "At most {MAX_INPUT_IMAGES} input images are allowed"
        )));
    }
    if let Some(bad) = input.image_urls.iter().find(|url| !is_http_url(url)) {
        return Err(GenerationError::Invalid(format!(
            "Invalid image URL: {bad}"
        )));
    }

    let model = match input.model.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => find_model(id)
            .ok_or_else(|| GenerationError::Invalid(format!("Unknown model: {id}")))?,
        _ => default_model(input.kind),
    };
    if model.kind != input.kind {
        return Err(GenerationError::Invalid(format!(
            "Model {} does not produce {} output",
            model.id,
            input.kind.as_str()
        )));
    }
    if model.requires_image && input.image_urls.is_empty() {
        return Err(GenerationError::Invalid(format!(
            "Model {} requires an input image",
            model.id
        )));
    }

    Ok((model, prompt.to_string()))
}

fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.contains(char::is_whitespace))
}

pub async fn start_generation(
    state: &AppState,
    user: &AuthenticatedUser,
    input: GenerationInput,
) -> Result<GenerationStarted, GenerationError> {
    let (model, prompt) = validate(&input)?;
    let config = &state.config;

    let profile = state
        .store
        .ensure_profile(&user.user_id, user.email.as_deref(), config.signup_credits)
        .await?;

    let free = model.free_eligible
        && state
            .store
            .consume_free_generation(&user.user_id, config.free_generation_limit)
            .await?;
    let cost = if free { 0 } else { model.cost };

    if cost > profile.credits {
        return Err(GenerationError::InsufficientCredits {
            balance: profile.credits,
            required: cost,
        });
    }

    let callback_url = config.kie_callback_url();
    let submitted = state
        .provider
        .create_task(GenerationRequest {
            model,
            prompt: &prompt,
            image_urls: &input.image_urls,
            aspect_ratio: input.aspect_ratio.as_deref(),
            callback_url: &callback_url,
        })
        .await;

    let task_id = match submitted {
        Ok(task_id) => task_id,
        Err(error) => {
            tracing::error!(
                error = %error,
                user_id = %user.user_id,
                model = model.id,
                "generation provider rejected task"
            );
            if free {
                release_free_generation(state, &user.user_id).await;
            }
            return Err(error.into());
        }
    };

    let now = Utc::now();
    let created = state
        .store
        .create_task(GenerationTask {
            id: task_id.clone(),
            user_id: user.user_id.clone(),
            kind: model.kind,
            model: model.id.to_string(),
            prompt,
            input_image_urls: input.image_urls,
            status: TaskStatus::Pending,
            cost,
            charged_credits: 0,
            refunded: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
        .await;

    if let Err(error) = created {
        tracing::error!(
            error = %error,
            task_id = %task_id,
            user_id = %user.user_id,
            "failed to persist generation task after vendor accepted it"
        );
        if free {
            release_free_generation(state, &user.user_id).await;
        }
        return Err(error.into());
    }

    let mut credits_remaining = profile.credits;
    if cost > 0 {
        match state.store.charge_task(&user.user_id, cost, &task_id).await {
            Ok(balance) => credits_remaining = balance,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    task_id = %task_id,
                    user_id = %user.user_id,
                    cost,
                    "credit deduction failed; task continues uncharged"
                );
            }
        }
    }

    // The callback may already have settled the task, so report what was stored.
    let stored = state.store.get_task(&task_id).await?;
    let (status, charged_credits) = stored
        .map(|task| (task.status, task.charged_credits))
        .unwrap_or((TaskStatus::Pending, 0));

    tracing::info!(
        task_id = %task_id,
        user_id = %user.user_id,
        model = model.id,
        cost,
        free,
        "generation task started"
    );

    Ok(GenerationStarted {
        task_id,
        status,
        model: model.id,
        cost,
        free,
        charged_credits,
        credits_remaining,
    })
}

async fn release_free_generation(state: &AppState, user_id: &str) {
    if let Err(error) = state.store.release_free_generation(user_id).await {
        tracing::error!(error = %error, user_id = %user_id, "failed to release free generation");
    }
}

/// Moves a task according to a vendor outcome. Only the caller that wins the
/// status transition writes media or refunds, so replays are no-ops.
pub async fn apply_vendor_outcome(
    state: &AppState,
    task: GenerationTask,
    outcome: VendorOutcome,
) -> StoreResult<GenerationTask> {
    let task_id = task.id.clone();
    match outcome {
        VendorOutcome::Processing => {
            if task.status != TaskStatus::Pending {
                return Ok(task);
            }
            let updated = state
                .store
                .transition_task(&task_id, TaskTransition::processing())
                .await?;
            reload_or(state, updated, task).await
        }
        VendorOutcome::Succeeded { urls } => {
            let updated = state
                .store
                .transition_task(&task_id, TaskTransition::completed())
                .await?;
            match updated {
                Some(completed) => {
                    state.store.add_media(&completed, &urls).await?;
                    state.task_cache.remove(&task_id);
                    tracing::info!(task_id = %task_id, results = urls.len(), "task completed");
                    Ok(completed)
                }
                None => {
                    let current = reload_or(state, None, task).await?;
                    if current.status == TaskStatus::Completed {
                        restore_missing_media(state, &current, &urls).await?;
                    }
                    Ok(current)
                }
            }
        }
        VendorOutcome::Failed { message } => {
            match fail_and_refund(state, &task_id, &message).await? {
                Some(failed) => Ok(failed),
                None => reload_or(state, None, task).await,
            }
        }
    }
}

/// A completed task left without media by a failed insert gets its rows from
/// the next success report. Inserts skip URLs the task already has.
async fn restore_missing_media(
    state: &AppState,
    task: &GenerationTask,
    urls: &[String],
) -> StoreResult<()> {
    if !state.store.list_media(&task.id).await?.is_empty() {
        return Ok(());
    }
    let media = state.store.add_media(task, urls).await?;
    state.task_cache.remove(&task.id);
    tracing::warn!(task_id = %task.id, results = media.len(), "restored media for completed task");
    Ok(())
}

async fn reload_or(
    state: &AppState,
    updated: Option<GenerationTask>,
    fallback: GenerationTask,
) -> StoreResult<GenerationTask> {
    if let Some(task) = updated {
        return Ok(task);
    }
    Ok(state.store.get_task(&fallback.id).await?.unwrap_or(fallback))
}

/// Fails an open task and refunds it. `None` when the task was already terminal.
async fn fail_and_refund(
    state: &AppState,
    task_id: &str,
    message: &str,
) -> StoreResult<Option<GenerationTask>> {
    let failed = state
        .store
        .transition_task(task_id, TaskTransition::failed(message))
        .await?;
    let Some(failed) = failed else {
        return Ok(None);
    };

    if let Some(amount) = state.store.refund_task(task_id).await? {
        tracing::info!(task_id = %task_id, amount, "refunded failed task");
    }
    state.task_cache.remove(task_id);
    tracing::warn!(task_id = %task_id, reason = %message, "task failed");

    Ok(state.store.get_task(task_id).await?.or(Some(failed)))
}

pub async fn apply_callback(state: &AppState, event: CallbackEvent) -> StoreResult<CallbackAck> {
    let Some(task) = state.store.get_task(&event.task_id).await? else {
        tracing::warn!(task_id = %event.task_id, "callback for unknown task");
        return Ok(CallbackAck::UnknownTask);
    };

    if task.status.is_terminal() {
        if let (TaskStatus::Completed, VendorOutcome::Succeeded { urls }) =
            (task.status, &event.outcome)
        {
            restore_missing_media(state, &task, urls).await?;
        }
        tracing::debug!(
            task_id = %task.id,
            status = task.status.as_str(),
            "duplicate callback ignored"
        );
        return Ok(CallbackAck::Applied(task.status));
    }

    let updated = apply_vendor_outcome(state, task, event.outcome).await?;
    Ok(CallbackAck::Applied(updated.status))
}

async fn owned_task(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<GenerationTask, GenerationError> {
    match state.store.get_task(task_id).await? {
        Some(task) if task.user_id == user_id => Ok(task),
        _ => Err(GenerationError::NotFound),
    }
}

pub async fn task_detail(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<TaskDetail, GenerationError> {
    if let Some(cached) = state.task_cache.get(task_id) {
        if cached.task.user_id == user_id {
            return Ok(cached);
        }
        return Err(GenerationError::NotFound);
    }

    let mut task = owned_task(state, user_id, task_id).await?;

    if !task.status.is_terminal() && state.config.vendor_reconcile {
        task = reconcile(state, task).await?;
    }

    let media = state.store.list_media(task_id).await?;
    let detail = TaskDetail { task, media };
    if detail.task.status.is_terminal() {
        state.task_cache.insert(task_id, detail.clone());
    }
    Ok(detail)
}

/// Asks the vendor for a task whose callback may have been lost.
async fn reconcile(state: &AppState, task: GenerationTask) -> StoreResult<GenerationTask> {
    let Some(model) = find_model(&task.model) else {
        tracing::warn!(
            task_id = %task.id,
            model = %task.model,
            "cannot reconcile task with unknown model"
        );
        return Ok(task);
    };

    match state.provider.query_task(model, &task.id).await {
        Ok(outcome) => apply_vendor_outcome(state, task, outcome).await,
        Err(error) => {
            tracing::warn!(error = %error, task_id = %task.id, "vendor status query failed");
            Ok(task)
        }
    }
}

pub async fn list_tasks(
    state: &AppState,
    user_id: &str,
    limit: usize,
) -> Result<Vec<GenerationTask>, GenerationError> {
    Ok(state.store.list_tasks(user_id, limit.clamp(1, 100)).await?)
}

/// Cooperative timeout requested by the polling client.
pub async fn timeout_task(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<GenerationTask, GenerationError> {
    let task = owned_task(state, user_id, task_id).await?;
    if task.status.is_terminal() {
        return Ok(task);
    }

    let min_age = chrono::Duration::from_std(state.config.task_timeout_min_age)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let age = Utc::now() - task.created_at;
    if age < min_age {
        return Err(GenerationError::TooEarly {
            retry_after_secs: (min_age - age).num_seconds().max(1),
        });
    }

    match fail_and_refund(state, task_id, TIMEOUT_MESSAGE).await? {
        Some(failed) => Ok(failed),
        None => owned_task(state, user_id, task_id).await,
    }
}

pub async fn delete_task(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<(), GenerationError> {
    let task = owned_task(state, user_id, task_id).await?;
    if !task.status.is_terminal() {
        fail_and_refund(state, task_id, "deleted by user").await?;
    }
    state.store.delete_task(task_id).await?;
    state.task_cache.remove(task_id);
    tracing::info!(task_id = %task_id, user_id = %user_id, "task deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::testing::TestHarness, store::Store};

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            email: Some(format!("{id}@example.com")),
        }
    }

    fn image(prompt: &str, model: Option<&str>) -> GenerationInput {
        GenerationInput {
            kind: MediaKind::Image,
            prompt: prompt.to_string(),
            model: model.map(ToString::to_string),
            image_urls: Vec::new(),
            aspect_ratio: None,
        }
    }

    async fn funded(harness: &TestHarness, user_id: &str, credits: i64) {
        harness.store.ensure_profile(user_id, None, credits).await.unwrap();
    }

    async fn seeded_task(harness: &TestHarness, user_id: &str) -> GenerationStarted {
        start_generation(
            &harness.state,
            &user(user_id),
            image("a cat", Some("seedream-v4")),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn validation_rejects_bad_input() {
        let harness = TestHarness::new();
        let state = &harness.state;

        for input in [
            image("   ", None),
            image(&"x".repeat(MAX_PROMPT_CHARS + 1), None),
            image("cat", Some("unknown-model")),
            image("cat", Some("veo3")),
            image("cat", Some("nano-banana-edit")),
            GenerationInput {
                image_urls: vec!["ftp://files/x.png".to_string()],
                ..image("cat", None)
            },
            GenerationInput {
                image_urls: vec!["https://a/1.png".to_string(); MAX_INPUT_IMAGES + 1],
                ..image("cat", None)
            },
        ] {
            let error = start_generation(state, &user("u1"), input).await.unwrap_err();
            assert_eq!(error.status_code(), StatusCode::BAD_REQUEST, "{error}");
        }
        assert!(harness.provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn first_eligible_generation_is_free_then_charged() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 10).await;

        let first = start_generation(&harness.state, &user("u1"), image("a cat", None))
            .await
            .unwrap();
        assert!(first.free);
        assert_eq!(first.charged_credits, 0);
        assert_eq!(first.credits_remaining, 10);

        let second = start_generation(&harness.state, &user("u1"), image("a dog", None))
            .await
            .unwrap();
        assert!(!second.free);
        assert_eq!(second.cost, 4);
        assert_eq!(second.charged_credits, 4);
        assert_eq!(second.credits_remaining, 6);
        assert_eq!(second.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn insufficient_credits_is_payment_required_and_skips_vendor() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 5).await;

        let error = start_generation(
            &harness.state,
            &user("u1"),
            GenerationInput {
                kind: MediaKind::Video,
                ..image("waves", Some("veo3-fast"))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            GenerationError::InsufficientCredits { balance: 5, required: 60 }
        ));
        assert!(harness.provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn vendor_failure_charges_nothing_and_returns_free_slot() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 0).await;
        harness.provider.reject_with("upstream down");

        let error = start_generation(&harness.state, &user("u1"), image("a cat", None))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);

        let profile = harness.store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.free_generations_used, 0);
        assert_eq!(profile.credits, 0);
        assert!(harness.store.list_tasks("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_success_callback_creates_media_once() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 50).await;
        let started = seeded_task(&harness, "u1").await;

        let event = CallbackEvent {
            task_id: started.task_id.clone(),
            outcome: VendorOutcome::Succeeded {
                urls: vec!["https://cdn/a.png".to_string(), "https://cdn/b.png".to_string()],
            },
        };
        let first = apply_callback(&harness.state, event.clone()).await.unwrap();
        let second = apply_callback(&harness.state, event).await.unwrap();
        assert_eq!(first, CallbackAck::Applied(TaskStatus::Completed));
        assert_eq!(second, CallbackAck::Applied(TaskStatus::Completed));

        let media = harness.store.list_media(&started.task_id).await.unwrap();
        assert_eq!(media.len(), 2);
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 44);
    }

    #[tokio::test]
    async fn redelivered_success_restores_media_lost_to_a_failed_insert() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 50).await;
        let started = seeded_task(&harness, "u1").await;
        let event = CallbackEvent {
            task_id: started.task_id.clone(),
            outcome: VendorOutcome::Succeeded {
                urls: vec!["https://cdn/a.png".to_string()],
            },
        };

        harness.store.fail_next_media_insert();
        assert!(apply_callback(&harness.state, event.clone()).await.is_err());
        let task = harness.store.get_task(&started.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(harness.store.list_media(&started.task_id).await.unwrap().is_empty());

        let ack = apply_callback(&harness.state, event.clone()).await.unwrap();
        assert_eq!(ack, CallbackAck::Applied(TaskStatus::Completed));
        apply_callback(&harness.state, event).await.unwrap();

        let media = harness.store.list_media(&started.task_id).await.unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].url, "https://cdn/a.png");
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 44);
    }

    #[tokio::test]
    async fn queued_callback_moves_task_to_processing() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 50).await;
        let started = seeded_task(&harness, "u1").await;

        let event = crate::kie::parse_callback(&serde_json::json!({
            "code": 200,
            "data": { "taskId": started.task_id, "state": "waiting" }
        }))
        .unwrap();
        let ack = apply_callback(&harness.state, event).await.unwrap();
        assert_eq!(ack, CallbackAck::Applied(TaskStatus::Processing));
    }

    #[tokio::test]
    async fn duplicate_failure_callback_refunds_once() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 50).await;
        let started = seeded_task(&harness, "u1").await;
        assert_eq!(started.credits_remaining, 44);

        let event = CallbackEvent {
            task_id: started.task_id.clone(),
            outcome: VendorOutcome::Failed {
                message: "nsfw".to_string(),
            },
        };
        apply_callback(&harness.state, event.clone()).await.unwrap();
        apply_callback(&harness.state, event).await.unwrap();

        let task = harness.store.get_task(&started.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.refunded);
        assert_eq!(task.error_message.as_deref(), Some("nsfw"));
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 50);

        // A late success cannot resurrect a failed task.
        let late = apply_callback(
            &harness.state,
            CallbackEvent {
                task_id: started.task_id.clone(),
                outcome: VendorOutcome::Succeeded {
                    urls: vec!["https://cdn/late.png".to_string()],
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(late, CallbackAck::Applied(TaskStatus::Failed));
        assert!(harness.store.list_media(&started.task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_callback_is_acknowledged() {
        let harness = TestHarness::new();
        let ack = apply_callback(
            &harness.state,
            CallbackEvent {
                task_id: "nope".to_string(),
                outcome: VendorOutcome::Processing,
            },
        )
        .await
        .unwrap();
        assert_eq!(ack, CallbackAck::UnknownTask);
    }

    #[tokio::test]
    async fn timeout_waits_for_min_age_then_fails_and_refunds() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 20).await;
        let started = seeded_task(&harness, "u1").await;

        let early = timeout_task(&harness.state, "u1", &started.task_id)
            .await
            .unwrap_err();
        assert_eq!(early.status_code(), StatusCode::CONFLICT);

        harness.store.set_task_created_at(
            &started.task_id,
            Utc::now() - chrono::Duration::seconds(600),
        );
        let failed = timeout_task(&harness.state, "u1", &started.task_id)
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 20);

        let again = timeout_task(&harness.state, "u1", &started.task_id)
            .await
            .unwrap();
        assert_eq!(again.status, TaskStatus::Failed);
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 20);

        let other = timeout_task(&harness.state, "u2", &started.task_id)
            .await
            .unwrap_err();
        assert!(matches!(other, GenerationError::NotFound));
    }

    #[tokio::test]
    async fn reconciliation_settles_open_task() {
        let mut harness = TestHarness::new();
        harness.enable_reconcile();
        funded(&harness, "u1", 20).await;
        let started = seeded_task(&harness, "u1").await;

        harness.provider.set_outcome(
            &started.task_id,
            VendorOutcome::Succeeded {
                urls: vec!["https://cdn/r.png".to_string()],
            },
        );
        let detail = task_detail(&harness.state, "u1", &started.task_id)
            .await
            .unwrap();
        assert_eq!(detail.task.status, TaskStatus::Completed);
        assert_eq!(detail.media.len(), 1);

        let cached = task_detail(&harness.state, "u1", &started.task_id)
            .await
            .unwrap();
        assert_eq!(cached.media.len(), 1);
        assert!(matches!(
            task_detail(&harness.state, "u2", &started.task_id).await,
            Err(GenerationError::NotFound)
        ));
    }

    #[tokio::test]
    async fn deleting_open_task_refunds_before_removal() {
        let harness = TestHarness::new();
        funded(&harness, "u1", 20).await;
        let started = seeded_task(&harness, "u1").await;

        delete_task(&harness.state, "u1", &started.task_id)
            .await
            .unwrap();
        assert!(harness.store.get_task(&started.task_id).await.unwrap().is_none());
        assert_eq!(harness.store.get_profile("u1").await.unwrap().unwrap().credits, 20);
    }
}
