use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::{response::failure, state::AppState};

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return failure(StatusCode::UNAUTHORIZED, "Unauthorized"),
    };

    let claims = match state.auth.verify_bearer_token(auth_header).await {
        Ok(claims) => claims,
        Err(error) => {
            tracing::warn!(error = %error, "authorization failed");
            return failure(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: claims.sub,
        email: claims.email.filter(|email| !email.trim().is_empty()),
    });

    next.run(request).await
}

/// Per-user limit on the generation endpoints; runs after `require_auth`.
pub async fn generation_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = match request.extensions().get::<AuthenticatedUser>() {
        Some(user) => format!("user:{}", user.user_id),
        None => request_identity(&request, state.config.trust_proxy),
    };

    if !state.generation_limiter.check_and_count(&key) {
        tracing::warn!(key = %key, "generation rate limit exceeded");
        return failure(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many generation requests, please slow down",
        );
    }

    next.run(request).await
}

pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = request_identity(&request, state.config.trust_proxy);

    if !state.api_limiter.check_and_count(&key) {
        return failure(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests from this IP, please try again after 15 minutes",
        );
    }

    next.run(request).await
}

fn request_identity(request: &Request<Body>, trust_proxy: bool) -> String {
    let socket_addr = request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        });
    client_identity(request.headers(), socket_addr, trust_proxy)
}

fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_is_used_only_behind_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer), true), "203.0.113.7");
        assert_eq!(client_identity(&headers, Some(peer), false), "10.0.0.1");
        assert_eq!(client_identity(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn real_ip_header_is_a_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static(" 198.51.100.2 "));
        assert_eq!(client_identity(&headers, None, true), "198.51.100.2");
    }
}
