use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
}

/// Inputs for a hosted checkout page.
#[derive(Debug, Clone)]
pub struct CheckoutParams<'a> {
    pub customer_id: &'a str,
    pub price_id: &'a str,
    pub mode: &'a str,
    pub user_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
}

impl StripeApi {
    pub fn new(secret_key: Option<String>, webhook_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: "https://api.stripe.com/v1".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.require_secret_key().is_ok()
    }

    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.is_some()
    }

    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.verify_webhook_signature_at(signature_header, payload, Utc::now().timestamp())
    }

    fn verify_webhook_signature_at(
        &self,
        signature_header: &str,
        payload: &[u8],
        now: i64,
    ) -> anyhow::Result<()> {
        let webhook_secret = self
            .webhook_secret
            .as_ref()
            .ok_or_else(|| anyhow!("STRIPE_WEBHOOK_SECRET is not configured."))?;

        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            let mut pieces = part.trim().splitn(2, '=');
            let key = pieces.next().unwrap_or_default();
            let value = pieces.next().unwrap_or_default();
            if key == "t" {
                timestamp = value.parse::<i64>().ok();
            } else if key == "v1" {
                v1_signatures.push(value);
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| anyhow!("Missing Stripe timestamp in signature."))?;
        if v1_signatures.is_empty() {
            return Err(anyhow!("Missing Stripe v1 signature."));
        }

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(anyhow!("Stripe signature timestamp outside tolerance."));
        }

        let expected = compute_signature(webhook_secret, timestamp, payload)?;

        let is_match = v1_signatures
            .into_iter()
            .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

        if !is_match {
            return Err(anyhow!("Invalid Stripe signature."));
        }

        Ok(())
    }

    pub async fn create_customer(
        &self,
        email: Option<&str>,
        user_id: &str,
    ) -> anyhow::Result<StripeCustomer> {
        let mut params = vec![("metadata[user_id]".to_string(), user_id.to_string())];
        if let Some(email) = email {
            params.push(("email".to_string(), email.to_string()));
        }
        self.post_form("customers", &params).await
    }

    pub async fn create_checkout_session(
        &self,
        checkout: CheckoutParams<'_>,
    ) -> anyhow::Result<StripeCheckoutSession> {
        let mut params = vec![
            ("customer".to_string(), checkout.customer_id.to_string()),
            ("line_items[0][price]".to_string(), checkout.price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("mode".to_string(), checkout.mode.to_string()),
            ("success_url".to_string(), checkout.success_url.to_string()),
            ("cancel_url".to_string(), checkout.cancel_url.to_string()),
            ("client_reference_id".to_string(), checkout.user_id.to_string()),
            ("metadata[user_id]".to_string(), checkout.user_id.to_string()),
            ("metadata[price_id]".to_string(), checkout.price_id.to_string()),
        ];
        if checkout.mode == "subscription" {
            params.push((
                "subscription_data[metadata][user_id]".to_string(),
                checkout.user_id.to_string(),
            ));
        }

        self.post_form("checkout/sessions", &params).await
    }

    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> anyhow::Result<StripeBillingPortalSession> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];

        self.post_form("billing_portal/sessions", &params).await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .form(params)
            .send()
            .await
            .with_context(|| format!("Stripe POST failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> anyhow::Result<String> {
    let payload_str =
        std::str::from_utf8(payload).context("invalid UTF-8 payload for Stripe signature")?;
    let signed_payload = format!("{}.{}", timestamp, payload_str);

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).context("invalid Stripe webhook secret")?;
    mac.update(signed_payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `Stripe-Signature` header value for a payload signed now.
#[cfg(test)]
pub fn test_signature_header(secret: &str, payload: &[u8]) -> String {
    let timestamp = Utc::now().timestamp();
    let signature = compute_signature(secret, timestamp, payload).unwrap();
    format!("t={timestamp},v1={signature}")
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub mode: Option<String>,
    pub payment_status: Option<String>,
    pub customer: Option<IdOrObject>,
    pub client_reference_id: Option<String>,
    pub subscription: Option<IdOrObject>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeBillingPortalSession {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: IdOrObject,
    pub status: String,
    pub items: StripeList<StripeSubscriptionItem>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeSubscription {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .iter()
            .find_map(|item| item.price.as_ref().and_then(|price| price.id.as_deref()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub price: Option<StripePrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> String {
        match self {
            IdOrObject::Id(value) => value.clone(),
            IdOrObject::Object { id } => id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub customer: Option<IdOrObject>,
    pub subscription: Option<IdOrObject>,
    pub parent: Option<StripeInvoiceParent>,
    pub amount_paid: Option<i64>,
    pub currency: Option<String>,
    pub lines: Option<StripeList<StripeInvoiceLine>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceParent {
    pub subscription_details: Option<StripeSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionDetails {
    pub subscription: Option<IdOrObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLine {
    pub price: Option<StripePrice>,
}

impl StripeInvoice {
    /// Subscription id from either the classic field or the newer `parent` block.
    pub fn subscription_id(&self) -> Option<String> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|parent| parent.subscription_details.as_ref())
                    .and_then(|details| details.subscription.as_ref())
            })
            .map(IdOrObject::id)
    }

    pub fn line_price_id(&self) -> Option<&str> {
        self.lines.as_ref().and_then(|lines| {
            lines
                .data
                .iter()
                .find_map(|line| line.price.as_ref().and_then(|price| price.id.as_deref()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn api(secret: Option<&str>) -> StripeApi {
        StripeApi::new(secret.map(ToString::to_string), Some("whsec_abc".to_string())).unwrap()
    }

    #[test]
    fn accepts_valid_signature_and_rejects_tampering() {
        let stripe = api(None);
        let payload = br#"{"id":"evt_1"}"#;
        let header = test_signature_header("whsec_abc", payload);

        assert!(stripe.verify_webhook_signature(&header, payload).is_ok());
        assert!(stripe
            .verify_webhook_signature(&header, br#"{"id":"evt_2"}"#)
            .is_err());
        assert!(stripe.verify_webhook_signature("v1=abc", payload).is_err());
        assert!(stripe.verify_webhook_signature("t=1", payload).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let stripe = api(None);
        let payload = b"{}";
        let timestamp = 1_700_000_000;
        let signature = compute_signature("whsec_abc", timestamp, payload).unwrap();
        let header = format!("t={timestamp},v1={signature}");

        assert!(stripe
            .verify_webhook_signature_at(&header, payload, timestamp + 100)
            .is_ok());
        assert!(stripe
            .verify_webhook_signature_at(&header, payload, timestamp + SIGNATURE_TOLERANCE_SECS + 1)
            .is_err());
    }

    #[test]
    fn missing_webhook_secret_is_reported() {
        let stripe = StripeApi::new(None, None).unwrap();
        let error = stripe
            .verify_webhook_signature("t=1,v1=x", b"{}")
            .unwrap_err()
            .to_string();
        assert!(error.contains("STRIPE_WEBHOOK_SECRET"));
    }

    #[tokio::test]
    async fn checkout_session_carries_mode_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test"))
            .and(body_string_contains("mode=payment"))
            .and(body_string_contains("metadata%5Buser_id%5D=u1"))
            .and(body_string_contains("metadata%5Bprice_id%5D=price_pack_100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_1",
                "url": "https://checkout.stripe.com/c/cs_1",
                "mode": "payment"
            })))
            .mount(&server)
            .await;

        let stripe = api(Some("sk_test")).with_base_url(server.uri());
        let session = stripe
            .create_checkout_session(CheckoutParams {
                customer_id: "cus_1",
                price_id: "price_pack_100",
                mode: "payment",
                user_id: "u1",
                success_url: "https://app/ok",
                cancel_url: "https://app/cancel",
            })
            .await
            .unwrap();
        assert_eq!(session.id, "cs_1");
        assert_eq!(session.url.as_deref(), Some("https://checkout.stripe.com/c/cs_1"));
    }

    #[tokio::test]
    async fn calls_fail_fast_without_secret_key() {
        let stripe = api(None);
        assert!(!stripe.is_configured());
        let error = stripe
            .create_customer(Some("a@example.com"), "u1")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("STRIPE_SECRET_KEY"));
    }

    #[test]
    fn invoice_subscription_id_reads_both_layouts() {
        let classic: StripeInvoice = serde_json::from_value(json!({
            "id": "in_1",
            "subscription": "sub_1"
        }))
        .unwrap();
        assert_eq!(classic.subscription_id().as_deref(), Some("sub_1"));

        let nested: StripeInvoice = serde_json::from_value(json!({
            "id": "in_2",
            "parent": { "subscription_details": { "subscription": "sub_2" } },
            "lines": { "data": [{ "price": { "id": "price_pro_monthly" } }] }
        }))
        .unwrap();
        assert_eq!(nested.subscription_id().as_deref(), Some("sub_2"));
        assert_eq!(nested.line_price_id(), Some("price_pro_monthly"));
    }
}
