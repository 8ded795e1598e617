//! Bearer credentials for the agent endpoint.
//!
//! [`TokenProvider`] is the one piece of process-wide mutable state in the
//! engine. The cached token is guarded by an async mutex that is held across
//! the credential exchange, so when many conversations start at once exactly
//! one exchange runs and the others wait for its result.

use crate::config::IdentityConfig;
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::RetryPolicy;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Minimum margin before expiry at which a cached token stops being reused.
pub const MIN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// An opaque bearer token and its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Usable at `now` with at least `skew` left before expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match chrono::Duration::from_std(skew) {
            Ok(skew) => now < self.expires_at - skew,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &format_args!("<{} chars>", self.value.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges configured credentials for a fresh token.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self) -> AuthResult<Token>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// Some identity providers send `expires_in` as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<i64> {
        match self {
            ExpiresIn::Seconds(s) => Some(*s),
            ExpiresIn::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth 2.0 client-credentials grant against `{authority}/{tenant}/oauth2/v2.0/token`.
pub struct ClientCredentialsExchange {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    retry: RetryPolicy,
}

impl ClientCredentialsExchange {
    pub fn new(config: &IdentityConfig) -> AuthResult<Self> {
        config.validate().map_err(|e| AuthError::Config {
            message: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AuthError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            retry: config.retry.clone(),
        })
    }

    async fn request_token(&self) -> AuthResult<Token> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AuthError::Unavailable {
            message: e.to_string(),
        })?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AuthError::Unavailable {
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        if !status.is_success() {
            let message = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(description) => format!("{}: {}", e.error, description),
                    None => e.error,
                })
                .unwrap_or(body);
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse {
                message: e.to_string(),
            })?;

        let expires_in = parsed
            .expires_in
            .seconds()
            .ok_or_else(|| AuthError::InvalidResponse {
                message: "expires_in is not a number".to_string(),
            })?;

        if expires_in < 0 {
            return Err(AuthError::InvalidResponse {
                message: format!("expires_in is negative: {}", expires_in),
            });
        }
        let expires_at = chrono::Duration::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| AuthError::InvalidResponse {
                message: format!("expires_in is out of range: {}", expires_in),
            })?;

        Ok(Token::new(parsed.access_token, expires_at))
    }
}

#[async_trait]
impl CredentialExchange for ClientCredentialsExchange {
    async fn exchange(&self) -> AuthResult<Token> {
        self.retry
            .run(
                "token exchange",
                |_| self.request_token(),
                AuthError::is_transient,
            )
            .await
    }
}

/// Caching token source shared by all conversations of a process.
pub struct TokenProvider {
    exchange: Arc<dyn CredentialExchange>,
    skew: Duration,
    cache: Mutex<Option<Token>>,
    exchanges: AtomicU64,
}

impl TokenProvider {
    /// `skew` is raised to [`MIN_EXPIRY_SKEW`] if smaller.
    pub fn new(exchange: Arc<dyn CredentialExchange>, skew: Duration) -> Self {
        Self {
            exchange,
            skew: skew.max(MIN_EXPIRY_SKEW),
            cache: Mutex::new(None),
            exchanges: AtomicU64::new(0),
        }
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    /// Number of credential exchanges performed so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Return the cached token if still fresh, otherwise exchange for a new one.
    pub async fn acquire(&self) -> AuthResult<Token> {
        let mut cached = self.cache.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now(), self.skew) {
                return Ok(token.clone());
            }
            debug!("Cached token is within {:?} of expiry, refreshing", self.skew);
        }

        self.refresh_locked(&mut cached).await
    }

    /// Replace `rejected` after the agent refused it.
    ///
    /// If another caller already replaced it, the newer token is returned
    /// without a second exchange.
    pub async fn refresh_after_rejection(&self, rejected: &Token) -> AuthResult<Token> {
        let mut cached = self.cache.lock().await;

        if let Some(token) = cached.as_ref() {
            if token != rejected && token.is_fresh(Utc::now(), self.skew) {
                debug!("Rejected token was already replaced");
                return Ok(token.clone());
            }
        }

        warn!("Agent rejected the bearer token, forcing a refresh");
        *cached = None;
        self.refresh_locked(&mut cached).await
    }

    /// Drop the cached token.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn refresh_locked(&self, cached: &mut Option<Token>) -> AuthResult<Token> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        match self.exchange.exchange().await {
            Ok(token) => {
                info!(
                    "Acquired agent token ({} chars, expires {})",
                    token.value().len(),
                    token.expires_at()
                );
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(e) => {
                warn!("Token acquisition failed: {}", e);
                *cached = None;
                Err(e)
            }
        }
    }
}
