mod auth;
mod cache;
mod catalog;
mod config;
mod generation;
mod handlers;
mod kie;
mod middleware;
mod plans;
mod provider;
mod rate_limit;
mod response;
mod serde_num;
mod state;
mod store;
mod stripe_api;
mod supabase;
mod task;
mod upload;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::{Config, StoreBackend};
use state::AppState;
use store::{MemoryStore, Store, SupabaseStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;
    check_vendor_keys(&config)?;

    let (store, storage) = match config.store_backend {
        StoreBackend::Supabase => {
            let key = config
                .supabase_service_role_key
                .as_deref()
                .context("SUPABASE_SERVICE_ROLE_KEY environment variable is not set")?;
            let client = supabase::SupabaseClient::new(config.supabase_url.clone(), key)?;
            let store: Arc<dyn Store> = Arc::new(SupabaseStore::new(client.clone()));
            (store, Some(client))
        }
        StoreBackend::Memory => {
            tracing::warn!(
                "STORE_BACKEND=memory: data is lost on restart and uploads are disabled."
            );
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            (store, None)
        }
    };

    let provider = Arc::new(kie::KieClient::new(
        config.kie_api_base.clone(),
        config.kie_api_key.clone(),
    )?);
    let auth = auth::AuthService::new(
        config.supabase_jwt_secret.clone(),
        config.supabase_jwt_issuer.clone(),
    )?;
    let stripe = stripe_api::StripeApi::new(
        config.stripe_secret_key.clone(),
        config.stripe_webhook_secret.clone(),
    )?;

    let state = AppState::new(config.clone(), store, provider, auth, stripe, storage);

    match state.store.ping().await {
        Ok(()) => tracing::info!("Database connectivity check passed"),
        Err(error) => {
            tracing::error!(
                error = %error,
                supabase_url = %config.supabase_url,
                "Database connectivity check failed. Check SUPABASE_URL and that the migrations under supabase/migrations were applied."
            );
        }
    }

    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

/// Missing vendor keys are fatal in production and a warning elsewhere.
fn check_vendor_keys(config: &Config) -> anyhow::Result<()> {
    let missing = [
        ("STRIPE_SECRET_KEY", config.stripe_secret_key.is_none()),
        ("STRIPE_WEBHOOK_SECRET", config.stripe_webhook_secret.is_none()),
        ("KIE_API_KEY", config.kie_api_key.is_none()),
    ];

    for (name, is_missing) in missing {
        if !is_missing {
            continue;
        }
        if config.production {
            return Err(anyhow::anyhow!("{} environment variable is not set", name));
        }
        tracing::warn!(
            variable = name,
            "Environment variable is not set. The features that depend on it will fail until it is provided."
        );
    }

    if config.supabase_jwt_secret.is_none() {
        tracing::info!(
            issuer = ?config.supabase_jwt_issuer,
            "SUPABASE_JWT_SECRET is not set. Access tokens are verified against the issuer JWKS."
        );
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let generation_router = Router::new()
        .route("/generate", post(handlers::generate_image))
        .route("/generate-video", post(handlers::generate_video))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::generation_rate_limit,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let private_router = Router::new()
        .route("/tasks", get(handlers::list_tasks))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/tasks/{id}/timeout", post(handlers::timeout_task))
        .route("/payment/create-checkout", post(handlers::create_checkout))
        .route("/payment/portal", post(handlers::create_portal))
        .route("/upload", post(handlers::upload_image))
        .route("/user/profile", get(handlers::get_profile))
        .route("/user/credits/history", get(handlers::credit_history))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let webhook_router = Router::new()
        .route("/callback/kie", post(handlers::kie_callback))
        .route("/payment/webhook", post(handlers::stripe_webhook));

    let api_router = Router::new()
        .merge(generation_router)
        .merge(private_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_rate_limit,
        ))
        .merge(webhook_router);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let body_limit = state.config.max_upload_bytes + 1024 * 1024;

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(
                path = %cert_path,
                "TLS certificate file provided but TLS key path missing"
            );
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(
                path = %key_path,
                "TLS key file provided but TLS certificate path missing"
            );
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
