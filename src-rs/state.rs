use std::{sync::Arc, time::Duration};

use crate::{
    auth::AuthService, cache::TtlCache, config::Config, generation::TaskDetail, plans::PriceMap,
    provider::GenerationProvider, rate_limit::InMemoryRateLimiter, store::Store,
    stripe_api::StripeApi, supabase::SupabaseClient,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn GenerationProvider>,
    pub auth: AuthService,
    pub stripe: StripeApi,
    /// Object storage for uploads; absent when running on the memory backend.
    pub storage: Option<SupabaseClient>,
    pub price_map: PriceMap,
    pub task_cache: Arc<TtlCache<TaskDetail>>,
    pub generation_limiter: Arc<InMemoryRateLimiter>,
    pub api_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        provider: Arc<dyn GenerationProvider>,
        auth: AuthService,
        stripe: StripeApi,
        storage: Option<SupabaseClient>,
    ) -> Self {
        let price_map = PriceMap::from_config(&config);
        Self {
            task_cache: Arc::new(TtlCache::new(Duration::from_secs(60), 10_000)),
            generation_limiter: Arc::new(InMemoryRateLimiter::new(Duration::from_secs(60), 20)),
            api_limiter: Arc::new(InMemoryRateLimiter::new(
                Duration::from_secs(15 * 60),
                300,
            )),
            config: Arc::new(config),
            store,
            provider,
            auth,
            stripe,
            storage,
            price_map,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;

    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::AppState;
    use crate::{
        auth::AuthService, config::Config, provider::fake::FakeProvider, store::MemoryStore,
        stripe_api::StripeApi, supabase::SupabaseClient,
    };

    /// App state wired to the in-memory store and the scripted provider.
    pub struct TestHarness {
        pub state: AppState,
        pub store: Arc<MemoryStore>,
        pub provider: Arc<FakeProvider>,
    }

    impl TestHarness {
        pub fn new() -> Self {
            Self::with_config(Config::for_tests())
        }

        pub fn with_config(config: Config) -> Self {
            Self::with_stripe_base(config, None)
        }

        pub fn with_stripe_base(config: Config, stripe_base: Option<String>) -> Self {
            Self::build(config, stripe_base, None)
        }

        pub fn with_storage(config: Config, storage: SupabaseClient) -> Self {
            Self::build(config, None, Some(storage))
        }

        fn build(
            config: Config,
            stripe_base: Option<String>,
            storage: Option<SupabaseClient>,
        ) -> Self {
            let store = Arc::new(MemoryStore::new());
            let provider = Arc::new(FakeProvider::new());
            let auth = AuthService::new(
                config.supabase_jwt_secret.clone(),
                config.supabase_jwt_issuer.clone(),
            )
            .unwrap();
            let mut stripe = StripeApi::new(
                config.stripe_secret_key.clone(),
                config.stripe_webhook_secret.clone(),
            )
            .unwrap();
            if let Some(base) = stripe_base {
                stripe = stripe.with_base_url(base);
            }
            let state = AppState::new(
                config,
                store.clone(),
                provider.clone(),
                auth,
                stripe,
                storage,
            );
            Self {
                state,
                store,
                provider,
            }
        }

        pub fn enable_reconcile(&mut self) {
            Arc::make_mut(&mut self.state.config).vendor_reconcile = true;
        }

        /// HS256 access token shaped like the ones Supabase Auth issues.
        pub fn token_for(&self, user_id: &str) -> String {
            let secret = self
                .state
                .config
                .supabase_jwt_secret
                .clone()
                .unwrap_or_default();
            let claims = json!({
                "sub": user_id,
                "email": format!("{user_id}@example.com"),
                "aud": "authenticated",
                "role": "authenticated",
                "exp": chrono::Utc::now().timestamp() + 3600,
            });
            encode(
                &Header::default(),
                &claims,
                &EncodingKey::from_secret(secret.as_bytes()),
            )
            .unwrap()
        }
    }
}
