//! Bearer-token authentication and upstream credential management.
//!
//! Two concerns live here:
//! - the optional shared-secret gate on the HTTP transports (AUTH_SECRET
//!   env; unset = dev mode, everything open);
//! - the `TokenSource` that hands the API client a Google bearer token and
//!   silently refreshes it when a refresh token is configured.
//!
//! The per-user session cap keys on a user id derived deterministically from
//! the caller's bearer token — the token itself is never stored or logged.

use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Refresh this long before the reported expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Deterministic user id: `sha256(bearer)` truncated to 16 hex chars.
/// Absent credentials collapse to a single "anonymous" user so unattributed
/// callers share one session budget.
pub fn derive_user_id(bearer: Option<&str>) -> String {
    match bearer {
        Some(token) if !token.is_empty() => {
            let digest = Sha256::digest(token.as_bytes());
            hex::encode(digest)[..16].to_string()
        }
        _ => "anonymous".to_string(),
    }
}

/// Extract the bearer token from an Authorization header value.
pub fn bearer_from_header(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ")
}

/// Request extension carrying the derived user id.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

/// Middleware enforcing the shared secret when AUTH_SECRET is configured,
/// and attaching the derived `UserId` either way.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| bearer_from_header(Some(h)))
        .map(str::to_string);

    if let Some(secret) = state.config.auth_secret.as_deref() {
        let ok = bearer
            .as_deref()
            .map(|t| t.as_bytes().ct_eq(secret.as_bytes()).into())
            .unwrap_or(false);
        if !ok {
            tracing::warn!("auth failed: missing or invalid bearer token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    request
        .extensions_mut()
        .insert(UserId(derive_user_id(bearer.as_deref())));
    Ok(next.run(request).await)
}

// ── TokenSource ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
}

/// Supplies the Google API bearer. Priority:
/// 1. cached access token still inside the expiry buffer,
/// 2. refresh-token grant when `GOOGLE_REFRESH_TOKEN` is configured,
/// 3. static `GOOGLE_ACCESS_TOKEN` from the environment.
pub struct TokenSource {
    http: reqwest::Client,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    state: RwLock<TokenState>,
}

impl TokenSource {
    pub fn from_env(http: reqwest::Client) -> Self {
        let access_token = std::env::var("GOOGLE_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        Self {
            http,
            refresh_token: std::env::var("GOOGLE_REFRESH_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            client_id: std::env::var("GOOGLE_OAUTH_CLIENT_ID").ok(),
            client_secret: std::env::var("GOOGLE_OAUTH_CLIENT_SECRET").ok(),
            state: RwLock::new(TokenState {
                access_token,
                expires_at: None,
            }),
        }
    }

    /// Fixed token, never refreshed. Used by tests and static deployments.
    pub fn fixed(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            state: RwLock::new(TokenState {
                access_token: Some(token.into()),
                expires_at: None,
            }),
        }
    }

    pub async fn bearer(&self) -> Result<String, ApiError> {
        {
            let state = self.state.read().await;
            if let Some(token) = &state.access_token {
                let fresh = match state.expires_at {
                    Some(at) => Instant::now() + TOKEN_EXPIRY_BUFFER < at,
                    None => true, // static token, no known expiry
                };
                if fresh {
                    return Ok(token.clone());
                }
            }
        }
        self.refresh().await?;
        let state = self.state.read().await;
        state.access_token.clone().ok_or_else(|| {
            ApiError::new(ErrorCode::AuthError, "no Google credential available")
                .with_steps(vec![
                    "Set GOOGLE_ACCESS_TOKEN, or".to_string(),
                    "Set GOOGLE_REFRESH_TOKEN with GOOGLE_OAUTH_CLIENT_ID/SECRET".to_string(),
                ])
        })
    }

    /// Exchange the refresh token for a new access token. Terminal
    /// `AUTH_ERROR` when no refresh token is configured or the grant fails.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let (refresh_token, client_id, client_secret) = match (
            &self.refresh_token,
            &self.client_id,
            &self.client_secret,
        ) {
            (Some(r), Some(i), Some(s)) => (r, i, s),
            _ => {
                return Err(ApiError::new(
                    ErrorCode::AuthError,
                    "access token expired and no refresh token is configured",
                ));
            }
        };

        let resp = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| {
                ApiError::new(ErrorCode::AuthError, format!("token refresh failed: {e}"))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::error!("google token refresh returned {status}");
            return Err(ApiError::new(
                ErrorCode::AuthError,
                format!("token refresh rejected with status {status}"),
            ));
        }

        let tokens: TokenResponse = resp.json().await.map_err(|e| {
            ApiError::new(ErrorCode::AuthError, format!("token refresh body: {e}"))
        })?;

        let mut state = self.state.write().await;
        state.expires_at =
            Some(Instant::now() + Duration::from_secs(tokens.expires_in.max(0) as u64));
        state.access_token = Some(tokens.access_token);
        tracing::info!("google access token refreshed");
        Ok(())
    }
}
