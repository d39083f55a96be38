use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

const AUDIENCE: &str = "authenticated";

/// Verifies Supabase Auth access tokens: HS256 with the project JWT secret,
/// or asymmetric keys published at `<issuer>/.well-known/jwks.json`.
#[derive(Clone)]
pub struct AuthService {
    http: reqwest::Client,
    jwt_secret: Option<String>,
    jwks_cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
    jwks_ttl: Duration,
    expected_issuer: Option<String>,
}

#[derive(Clone)]
struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupabaseClaims {
    pub sub: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub exp: usize,
}

impl AuthService {
    pub fn new(
        jwt_secret: Option<String>,
        expected_issuer: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build auth HTTP client")?;

        Ok(Self {
            http,
            jwt_secret: jwt_secret.filter(|value| !value.trim().is_empty()),
            jwks_cache: Arc::new(RwLock::new(HashMap::new())),
            jwks_ttl: Duration::from_secs(10 * 60),
            expected_issuer: expected_issuer
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
        })
    }

    pub async fn verify_bearer_token(
        &self,
        authorization_header: &str,
    ) -> anyhow::Result<SupabaseClaims> {
        let token = extract_bearer_token(authorization_header)?;
        self.verify_token(token).await
    }

    pub async fn verify_token(&self, token: &str) -> anyhow::Result<SupabaseClaims> {
        let header = decode_header(token).context("invalid JWT header")?;

        let decoding_key = match header.alg {
            Algorithm::HS256 => {
                let secret = self
                    .jwt_secret
                    .as_ref()
                    .ok_or_else(|| {
                        anyhow!("HS256 token received but SUPABASE_JWT_SECRET is not set")
                    })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            Algorithm::RS256 | Algorithm::ES256 => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| anyhow!("JWT header missing kid"))?;
                self.decoding_key_for(kid, header.alg).await?
            }
            other => return Err(anyhow!("Unsupported JWT alg: {:?}", other)),
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[AUDIENCE]);
        if let Some(issuer) = &self.expected_issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let token_data = decode::<SupabaseClaims>(token, &decoding_key, &validation)
            .context("JWT signature validation failed")?;

        let claims = token_data.claims;
        tracing::debug!(
            user_id = %claims.sub,
            exp = claims.exp,
            role = ?claims.role,
            "verified Supabase access token"
        );
        Ok(claims)
    }

    async fn decoding_key_for(&self, kid: &str, alg: Algorithm) -> anyhow::Result<DecodingKey> {
        let issuer = self
            .expected_issuer
            .as_deref()
            .ok_or_else(|| anyhow!("asymmetric JWT received but SUPABASE_JWT_ISSUER is not set"))?;

        let jwks = self.get_jwks(issuer).await?;
        let jwk = jwks
            .iter()
            .find(|candidate| candidate.kid.as_deref() == Some(kid))
            .ok_or_else(|| anyhow!("No matching JWK found for kid"))?;

        match (alg, jwk.kty.as_str()) {
            (Algorithm::RS256, "RSA") => {
                let n = jwk.n.as_ref().ok_or_else(|| anyhow!("JWK missing modulus (n)"))?;
                let e = jwk.e.as_ref().ok_or_else(|| anyhow!("JWK missing exponent (e)"))?;
                DecodingKey::from_rsa_components(n, e).context("failed to build RSA decoding key")
            }
            (Algorithm::ES256, "EC") => {
                let x = jwk.x.as_ref().ok_or_else(|| anyhow!("JWK missing x coordinate"))?;
                let y = jwk.y.as_ref().ok_or_else(|| anyhow!("JWK missing y coordinate"))?;
                DecodingKey::from_ec_components(x, y).context("failed to build EC decoding key")
            }
            (alg, kty) => Err(anyhow!("JWK type {} does not match alg {:?}", kty, alg)),
        }
    }

    async fn get_jwks(&self, issuer: &str) -> anyhow::Result<Vec<Jwk>> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.get(issuer) {
                if cached.fetched_at.elapsed() < self.jwks_ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let jwks_url = format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'));
        let response = self
            .http
            .get(&jwks_url)
            .send()
            .await
            .with_context(|| format!("failed to fetch JWKS from {jwks_url}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to fetch JWKS from {}: HTTP {}",
                jwks_url,
                response.status()
            ));
        }

        let jwks: Jwks = response
            .json()
            .await
            .with_context(|| format!("invalid JWKS response from {jwks_url}"))?;

        let keys = jwks.keys;
        let mut cache = self.jwks_cache.write().await;
        cache.insert(
            issuer.to_string(),
            CachedJwks {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(keys)
    }
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(anyhow!("Invalid Authorization header format"));
    }

    Ok(token.trim())
}
