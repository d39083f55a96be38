use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};

use crate::plans::{parse_credit_packs, parse_subscription_plans, CreditPack, SubscriptionPlan};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreBackend {
    Supabase,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub production: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub store_backend: StoreBackend,
    pub supabase_url: String,
    pub supabase_service_role_key: Option<String>,
    pub supabase_jwt_secret: Option<String>,
    pub supabase_jwt_issuer: Option<String>,
    pub storage_bucket: String,
    pub kie_api_base: String,
    pub kie_api_key: Option<String>,
    pub kie_callback_secret: Option<String>,
    pub public_base_url: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub frontend_url: Option<String>,
    pub signup_credits: i64,
    pub free_generation_limit: i64,
    pub task_timeout_min_age: Duration,
    pub vendor_reconcile: bool,
    pub max_upload_bytes: usize,
    pub credit_packs: Vec<CreditPack>,
    pub subscription_plans: Vec<SubscriptionPlan>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9001);

        // Forwarding headers are client-controlled unless a proxy rewrites them.
        let trust_proxy = parse_flag(env::var("TRUST_PROXY").ok(), false);

        let production = env::var("APP_ENV")
            .ok()
            .map(|value| value.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Supabase,
        };

        let supabase_url = match env::var("SUPABASE_URL") {
            Ok(value) => value.trim().trim_end_matches('/').to_string(),
            Err(_) if store_backend == StoreBackend::Memory => "http://localhost:54321".to_string(),
            Err(_) => return Err(anyhow!("SUPABASE_URL environment variable is not set")),
        };

        let supabase_service_role_key = non_empty(env::var("SUPABASE_SERVICE_ROLE_KEY").ok());
        if store_backend == StoreBackend::Supabase && supabase_service_role_key.is_none() {
            return Err(anyhow!(
                "SUPABASE_SERVICE_ROLE_KEY environment variable is not set"
            ));
        }

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("http://localhost:{port}"));

        let credit_packs = parse_credit_packs(&env::var("CREDIT_PACKS").unwrap_or_default())
            .context("invalid CREDIT_PACKS")?;
        let subscription_plans =
            parse_subscription_plans(&env::var("SUBSCRIPTION_PLANS").unwrap_or_default())
                .context("invalid SUBSCRIPTION_PLANS")?;

        Ok(Self {
            port,
            trust_proxy,
            production,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            store_backend,
            supabase_jwt_issuer: non_empty(env::var("SUPABASE_JWT_ISSUER").ok())
                .or_else(|| Some(format!("{}/auth/v1", supabase_url))),
            supabase_url,
            supabase_service_role_key,
            supabase_jwt_secret: non_empty(env::var("SUPABASE_JWT_SECRET").ok()),
            storage_bucket: non_empty(env::var("SUPABASE_STORAGE_BUCKET").ok())
                .unwrap_or_else(|| "uploads".to_string()),
            kie_api_base: env::var("KIE_API_BASE")
                .unwrap_or_else(|_| "https://api.kie.ai".to_string()),
            kie_api_key: non_empty(env::var("KIE_API_KEY").ok()),
            kie_callback_secret: non_empty(env::var("KIE_CALLBACK_SECRET").ok()),
            public_base_url,
            stripe_secret_key: non_empty(env::var("STRIPE_SECRET_KEY").ok()),
            stripe_webhook_secret: non_empty(env::var("STRIPE_WEBHOOK_SECRET").ok()),
            frontend_url: non_empty(env::var("FRONTEND_URL").ok()),
            signup_credits: parse_i64(env::var("SIGNUP_CREDITS").ok(), 0),
            free_generation_limit: parse_i64(env::var("FREE_GENERATION_LIMIT").ok(), 1),
            task_timeout_min_age: Duration::from_secs(parse_u64(
                env::var("TASK_TIMEOUT_MIN_AGE_SECS").ok(),
                170,
            )),
            vendor_reconcile: parse_flag(env::var("VENDOR_RECONCILE").ok(), true),
            max_upload_bytes: parse_usize(env::var("MAX_UPLOAD_BYTES").ok(), 10 * 1024 * 1024),
            credit_packs,
            subscription_plans,
        })
    }

    /// Callback URL handed to the generation vendor.
    pub fn kie_callback_url(&self) -> String {
        let base = format!("{}/api/callback/kie", self.public_base_url);
        match &self.kie_callback_secret {
            Some(secret) => format!("{}?token={}", base, secret),
            None => base,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_i64(value: Option<String>, fallback: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(fallback)
}

fn parse_flag(value: Option<String>, fallback: bool) -> bool {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("true" | "1" | "on" | "yes") => true,
        Some("false" | "0" | "off" | "no") => false,
        _ => fallback,
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            port: 9001,
            trust_proxy: false,
            production: false,
            tls_key_path: None,
            tls_cert_path: None,
            store_backend: StoreBackend::Memory,
            supabase_url: "http://localhost:54321".to_string(),
            supabase_service_role_key: None,
            supabase_jwt_secret: Some("test-jwt-secret".to_string()),
            supabase_jwt_issuer: None,
            storage_bucket: "uploads".to_string(),
            kie_api_base: "http://localhost:1".to_string(),
            kie_api_key: None,
            kie_callback_secret: None,
            public_base_url: "http://localhost:9001".to_string(),
            stripe_secret_key: None,
            stripe_webhook_secret: Some("whsec_test".to_string()),
            frontend_url: Some("http://localhost:3000".to_string()),
            signup_credits: 0,
            free_generation_limit: 1,
            task_timeout_min_age: Duration::from_secs(170),
            vendor_reconcile: false,
            max_upload_bytes: 1024 * 1024,
            credit_packs: vec![CreditPack {
                price_id: "price_pack_100".to_string(),
                credits: 100,
            }],
            subscription_plans: vec![SubscriptionPlan {
                price_id: "price_pro_monthly".to_string(),
                monthly_credits: 500,
                tier: crate::plans::MembershipTier::Pro,
            }],
        }
    }
}
