use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::json_body;
use crate::{
    middleware::AuthenticatedUser,
    plans::{is_subscription_active, MembershipTier, Product},
    response::{failure, internal_error, success},
    state::AppState,
    store::{
        CreditGrant, CreditReason, GrantOutcome, MembershipUpdate, PaymentIntentRecord,
        StoreError, TransactionRecord,
    },
    stripe_api::{
        CheckoutParams, IdOrObject, StripeCheckoutSession, StripeEvent, StripeInvoice,
        StripeSubscription,
    },
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub price_id: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub return_url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<CreateCheckoutRequest>, JsonRejection>,
) -> Response {
    let body = match json_body(payload) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let price_id = match non_empty(body.price_id) {
        Some(value) => value,
        None => return failure(StatusCode::BAD_REQUEST, "Missing required parameter: priceId"),
    };

    let product = match state.price_map.product_for_price_id(Some(price_id.as_str())) {
        Some(product) => product.clone(),
        None => {
            return failure(
                StatusCode::BAD_REQUEST,
                "Unknown or unsupported Stripe price ID.",
            )
        }
    };

    let frontend = state.config.frontend_url.clone();
    let success_url = non_empty(body.success_url).or_else(|| {
        frontend
            .as_ref()
            .map(|base| format!("{base}/payment/success?session_id={{CHECKOUT_SESSION_ID}}"))
    });
    let cancel_url = non_empty(body.cancel_url)
        .or_else(|| frontend.as_ref().map(|base| format!("{base}/pricing")));
    let (success_url, cancel_url) = match (success_url, cancel_url) {
        (Some(success_url), Some(cancel_url)) => (success_url, cancel_url),
        _ => {
            return failure(
                StatusCode::BAD_REQUEST,
                "Missing required parameters: successUrl, cancelUrl",
            )
        }
    };

    if !state.stripe.is_configured() {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "Payments are not configured");
    }

    let profile = match state
        .store
        .ensure_profile(
            &user.user_id,
            user.email.as_deref(),
            state.config.signup_credits,
        )
        .await
    {
        Ok(profile) => profile,
        Err(error) => {
            tracing::error!(
                error = %error,
                user_id = %user.user_id,
                "failed to load profile for checkout"
            );
            return internal_error();
        }
    };

    let customer_id = match profile.stripe_customer_id.clone() {
        Some(customer_id) => customer_id,
        None => {
            let customer = match state
                .stripe
                .create_customer(profile.email.as_deref(), &user.user_id)
                .await
            {
                Ok(customer) => customer,
                Err(error) => {
                    tracing::error!(error = %error, "failed to create Stripe customer");
                    return failure(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Error creating checkout session",
                    );
                }
            };

            if let Err(error) = state
                .store
                .set_stripe_customer_id(&user.user_id, &customer.id)
                .await
            {
                tracing::error!(error = %error, "failed to persist Stripe customer id");
                return failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error creating checkout session",
                );
            }
            customer.id
        }
    };

    let session = match state
        .stripe
        .create_checkout_session(CheckoutParams {
            customer_id: &customer_id,
            price_id: &price_id,
            mode: product.checkout_mode(),
            user_id: &user.user_id,
            success_url: &success_url,
            cancel_url: &cancel_url,
        })
        .await
    {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, "failed to create Stripe checkout session");
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating checkout session",
            );
        }
    };

    if let Err(error) = state
        .store
        .create_payment_intent(PaymentIntentRecord {
            id: session.id.clone(),
            user_id: user.user_id.clone(),
            price_id: price_id.clone(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        })
        .await
    {
        tracing::warn!(error = %error, session_id = %session.id, "failed to record payment intent");
    }

    match session.url {
        Some(url) => success(json!({ "url": url, "sessionId": session.id })),
        None => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error creating Stripe checkout session.",
        ),
    }
}

pub async fn create_portal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<PortalRequest>, JsonRejection>,
) -> Response {
    // The body is optional; without one the frontend account page is used.
    let body = payload.map(|Json(body)| body).unwrap_or_default();

    let profile = match state.store.get_profile(&user.user_id).await {
        Ok(profile) => profile,
        Err(error) => {
            tracing::error!(
                error = %error,
                user_id = %user.user_id,
                "failed to load profile for portal"
            );
            return internal_error();
        }
    };

    let customer_id = match profile.and_then(|profile| profile.stripe_customer_id) {
        Some(customer_id) => customer_id,
        None => return failure(StatusCode::BAD_REQUEST, "No billing account found"),
    };

    let return_url = match non_empty(body.return_url)
        .or_else(|| state.config.frontend_url.as_ref().map(|base| format!("{base}/account")))
    {
        Some(url) => url,
        None => return failure(StatusCode::BAD_REQUEST, "Missing required parameter: returnUrl"),
    };

    match state
        .stripe
        .create_billing_portal_session(&customer_id, &return_url)
        .await
    {
        Ok(portal) => match portal.url {
            Some(url) => success(json!({ "url": url })),
            None => failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating billing portal session",
            ),
        },
        Err(error) => {
            tracing::error!(error = %error, "failed to create Stripe billing portal session");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating billing portal session",
            )
        }
    }
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return failure(StatusCode::BAD_REQUEST, "Missing Stripe signature."),
    };

    if let Err(error) = state.stripe.verify_webhook_signature(signature, &body) {
        tracing::error!(error = %error, "Stripe webhook signature verification failed");
        if !state.stripe.has_webhook_secret() {
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "Webhook not configured.");
        }
        return failure(StatusCode::BAD_REQUEST, "Invalid signature.");
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid Stripe webhook payload");
            return failure(StatusCode::BAD_REQUEST, "Invalid payload.");
        }
    };

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

    let result = match event.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            match serde_json::from_value::<StripeCheckoutSession>(event.data.object) {
                Ok(session) => handle_checkout_completed(&state, session).await,
                Err(error) => Err(anyhow!("failed to decode checkout session: {}", error)),
            }
        }
        "invoice.payment_succeeded" => {
            match serde_json::from_value::<StripeInvoice>(event.data.object) {
                Ok(invoice) => handle_invoice_paid(&state, invoice).await,
                Err(error) => Err(anyhow!("failed to decode invoice: {}", error)),
            }
        }
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let deleted = event.event_type == "customer.subscription.deleted";
            match serde_json::from_value::<StripeSubscription>(event.data.object) {
                Ok(subscription) => sync_membership(&state, subscription, deleted).await,
                Err(error) => Err(anyhow!("failed to decode subscription: {}", error)),
            }
        }
        _ => Ok(()),
    };

    match result {
        Ok(()) => success(json!({ "received": true })),
        Err(error) => {
            tracing::error!(error = %error, event_id = %event.id, "Stripe webhook handling failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Webhook handler failed.")
        }
    }
}

async fn handle_checkout_completed(
    state: &AppState,
    session: StripeCheckoutSession,
) -> anyhow::Result<()> {
    let user_id = match checkout_user_id(state, &session).await? {
        Some(user_id) => user_id,
        None => {
            tracing::error!(session_id = %session.id, "checkout session has no resolvable user");
            return Ok(());
        }
    };

    if let Some(customer) = session.customer.as_ref().map(IdOrObject::id) {
        state.store.set_stripe_customer_id(&user_id, &customer).await?;
    }

    if session.mode.as_deref() != Some("payment") {
        // Subscription credits arrive with each paid invoice.
        return Ok(());
    }

    if session.payment_status.as_deref() != Some("paid") {
        tracing::info!(
            session_id = %session.id,
            payment_status = ?session.payment_status,
            "checkout completed without payment yet"
        );
        return Ok(());
    }

    let price_id = session.metadata.get("price_id").map(String::as_str);
    let pack = match state.price_map.product_for_price_id(price_id) {
        Some(Product::CreditPack(pack)) => pack.clone(),
        _ => {
            tracing::error!(
                session_id = %session.id,
                price_id = ?price_id,
                "checkout for unknown credit pack"
            );
            return Ok(());
        }
    };

    let source_id = format!("checkout:{}", session.id);
    let outcome = state
        .store
        .grant_credits(CreditGrant {
            user_id: user_id.clone(),
            amount: pack.credits,
            reason: CreditReason::Purchase,
            source_id: source_id.clone(),
            description: Some(format!("Credit pack {}", pack.price_id)),
        })
        .await?;
    log_grant(&outcome, &user_id, &source_id, pack.credits);

    state
        .store
        .set_payment_intent_status(&session.id, "succeeded")
        .await?;
    state
        .store
        .record_transaction(TransactionRecord {
            id: Uuid::new_v4().to_string(),
            user_id,
            source_id,
            amount_minor: session.amount_total.unwrap_or(0),
            currency: session.currency.unwrap_or_else(|| "usd".to_string()),
            credits: pack.credits,
            kind: "credit_pack".to_string(),
            created_at: Utc::now(),
        })
        .await?;

    Ok(())
}

async fn checkout_user_id(
    state: &AppState,
    session: &StripeCheckoutSession,
) -> anyhow::Result<Option<String>> {
    let from_session = session
        .metadata
        .get("user_id")
        .cloned()
        .or_else(|| session.client_reference_id.clone())
        .filter(|value| !value.trim().is_empty());
    if from_session.is_some() {
        return Ok(from_session);
    }

    match session.customer.as_ref() {
        Some(customer) => Ok(state
            .store
            .find_profile_by_customer(&customer.id())
            .await?
            .map(|profile| profile.id)),
        None => Ok(None),
    }
}

async fn handle_invoice_paid(state: &AppState, invoice: StripeInvoice) -> anyhow::Result<()> {
    let Some(subscription_id) = invoice.subscription_id() else {
        return Ok(());
    };

    let mut subscription: Option<StripeSubscription> = None;
    let price_id = match invoice.line_price_id() {
        Some(price_id) => price_id.to_string(),
        None => {
            let fetched = state.stripe.retrieve_subscription(&subscription_id).await?;
            let price_id = fetched
                .price_id()
                .map(ToString::to_string)
                .ok_or_else(|| anyhow!("subscription {} has no price", subscription_id))?;
            subscription = Some(fetched);
            price_id
        }
    };

    let plan = match state.price_map.product_for_price_id(Some(price_id.as_str())) {
        Some(Product::Subscription(plan)) => plan.clone(),
        _ => {
            tracing::error!(
                invoice_id = %invoice.id,
                price_id = %price_id,
                "invoice for unknown subscription plan"
            );
            return Ok(());
        }
    };

    let customer_id = invoice.customer.as_ref().map(IdOrObject::id);
    let mut user_id = match &customer_id {
        Some(customer_id) => state
            .store
            .find_profile_by_customer(customer_id)
            .await?
            .map(|profile| profile.id),
        None => None,
    };
    if user_id.is_none() {
        let subscription = match subscription {
            Some(subscription) => subscription,
            None => state.stripe.retrieve_subscription(&subscription_id).await?,
        };
        user_id = subscription.metadata.get("user_id").cloned();
    }
    let user_id = user_id.ok_or_else(|| {
        anyhow!(
            "no user for invoice {} (customer {:?})",
            invoice.id,
            customer_id
        )
    })?;

    let source_id = format!("invoice:{}", invoice.id);
    let outcome = state
        .store
        .grant_credits(CreditGrant {
            user_id: user_id.clone(),
            amount: plan.monthly_credits,
            reason: CreditReason::Subscription,
            source_id: source_id.clone(),
            description: Some(format!("{} membership credits", plan.tier.as_str())),
        })
        .await?;
    log_grant(&outcome, &user_id, &source_id, plan.monthly_credits);

    state
        .store
        .record_transaction(TransactionRecord {
            id: Uuid::new_v4().to_string(),
            user_id,
            source_id,
            amount_minor: invoice.amount_paid.unwrap_or(0),
            currency: invoice.currency.unwrap_or_else(|| "usd".to_string()),
            credits: plan.monthly_credits,
            kind: "subscription".to_string(),
            created_at: Utc::now(),
        })
        .await?;

    Ok(())
}

async fn sync_membership(
    state: &AppState,
    subscription: StripeSubscription,
    deleted: bool,
) -> anyhow::Result<()> {
    let customer_id = subscription.customer.id();
    let user_id = match state.store.find_profile_by_customer(&customer_id).await? {
        Some(profile) => profile.id,
        None => subscription
            .metadata
            .get("user_id")
            .cloned()
            .ok_or_else(|| anyhow!("no user for Stripe customer {}", customer_id))?,
    };

    let active = !deleted && is_subscription_active(Some(subscription.status.as_str()));
    let tier = if active {
        state
            .price_map
            .tier_for_price_id(subscription.price_id())
            .unwrap_or(MembershipTier::Free)
    } else {
        MembershipTier::Free
    };

    let update = MembershipUpdate {
        tier,
        status: if deleted {
            "canceled".to_string()
        } else {
            subscription.status.clone()
        },
        subscription_id: if deleted {
            None
        } else {
            Some(subscription.id.clone())
        },
    };

    match state.store.update_membership(&user_id, update).await {
        Ok(()) => {
            tracing::info!(
                user_id = %user_id,
                tier = tier.as_str(),
                status = %subscription.status,
                "membership synced"
            );
            Ok(())
        }
        Err(StoreError::NotFound { .. }) => {
            tracing::error!(user_id = %user_id, "membership update for missing profile");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

fn log_grant(outcome: &GrantOutcome, user_id: &str, source_id: &str, credits: i64) {
    match outcome {
        GrantOutcome::Granted { balance } => tracing::info!(
            user_id = %user_id,
            source_id = %source_id,
            credits,
            balance,
            "credits granted"
        ),
        GrantOutcome::AlreadyProcessed => tracing::info!(
            user_id = %user_id,
            source_id = %source_id,
            "duplicate payment event ignored"
        ),
    }
}
