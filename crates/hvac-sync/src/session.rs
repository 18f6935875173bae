//! # Token Session
//!
//! Bearer-token handling for every remote call. Keeps the access/refresh
//! token pair in memory and renews it before it expires or when the remote
//! answers 401.
//!
//! ## Renewal Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Token Renewal                                  │
//! │                                                                         │
//! │   caller A ──┐                                                          │
//! │   caller B ──┼──► ensure_valid()                                        │
//! │   caller C ──┘        │                                                 │
//! │                       ├── token fresh? ───────────────────► true       │
//! │                       │                                                 │
//! │                       ├── renewal in flight? ──► await shared future   │
//! │                       │                                                 │
//! │                       └── start renewal (stored as shared future)      │
//! │                               │                                         │
//! │                               ├── refresh(refresh_token)               │
//! │                               │     └── on any failure ──┐             │
//! │                               └── no refresh token ──────┤             │
//! │                                                          ▼             │
//! │                                                   login(user, pass)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Renewal starts 5 minutes before the estimated expiry. Expiry is computed
//! from the runtime clock so paused-clock tests can advance past it.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ApiSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{TokenRequest, TokenResponse};
use crate::pull::endpoint;

/// Margin before token expiration to trigger renewal (5 minutes).
pub const REFRESH_MARGIN_SECS: u64 = 300;

/// Assumed lifetime when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

// =============================================================================
// Token Types
// =============================================================================

/// Token pair as returned by the auth backend.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

impl From<TokenResponse> for TokenGrant {
    fn from(resp: TokenResponse) -> Self {
        TokenGrant {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_in: resp.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }
}

/// Token information held by the session.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Estimated expiry (runtime clock).
    pub expires_at: Instant,
}

impl TokenInfo {
    fn from_grant(grant: TokenGrant, previous_refresh: Option<String>) -> Self {
        TokenInfo {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: Instant::now() + Duration::from_secs(grant.expires_in),
        }
    }

    /// Check if the token is expired or about to expire.
    pub fn needs_refresh(&self) -> bool {
        Instant::now() + Duration::from_secs(REFRESH_MARGIN_SECS) >= self.expires_at
    }

    /// Check if the token is completely expired.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Get remaining valid time.
    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }
}

// =============================================================================
// Auth Backend
// =============================================================================

/// Token endpoint operations.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Full authentication with the configured credentials.
    async fn login(&self) -> SyncResult<TokenGrant>;

    /// Exchanges a refresh token for a new pair.
    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant>;
}

/// Auth backend talking to `{base}/oauth/token`.
pub struct HttpAuthBackend {
    client: reqwest::Client,
    token_url: url::Url,
    username: String,
    password: String,
    client_id: String,
    timeout_secs: u64,
}

impl HttpAuthBackend {
    pub fn new(api: &ApiSettings) -> SyncResult<Self> {
        let base = url::Url::parse(&api.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpAuthBackend {
            client,
            token_url: endpoint(&base, &["oauth", "token"])?,
            username: api.username.clone(),
            password: api.password.clone(),
            client_id: api.client_name.clone(),
            timeout_secs: api.request_timeout_secs,
        })
    }

    async fn request(&self, body: &TokenRequest) -> SyncResult<TokenGrant> {
        let response = self
            .client
            .post(self.token_url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::from_http(e, self.timeout_secs))?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response
                .json()
                .await
                .map_err(|e| SyncError::from_http(e, self.timeout_secs))?;
            return Ok(body.into());
        }

        let message = response.text().await.unwrap_or_default();
        match status.as_u16() {
            400 | 401 | 403 => Err(SyncError::AuthFailed(format!(
                "token endpoint returned {}: {}",
                status, message
            ))),
            code => Err(SyncError::Http {
                status: code,
                message,
            }),
        }
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self) -> SyncResult<TokenGrant> {
        if self.username.is_empty() {
            return Err(SyncError::AuthFailed("no username configured".into()));
        }
        self.request(&TokenRequest::Password {
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
        })
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant> {
        self.request(&TokenRequest::RefreshToken {
            refresh_token: refresh_token.to_string(),
            client_id: self.client_id.clone(),
        })
        .await
    }
}

// =============================================================================
// Token Session
// =============================================================================

type Renewal = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct SessionState {
    token: Option<TokenInfo>,
    in_flight: Option<Renewal>,
}

/// Shared bearer-token session.
///
/// Cloning is cheap; clones share the same token and in-flight renewal.
#[derive(Clone)]
pub struct TokenSession {
    backend: Arc<dyn AuthBackend>,
    state: Arc<Mutex<SessionState>>,
}

impl TokenSession {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        TokenSession {
            backend,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Returns true once a usable access token is held, renewing first if
    /// the token is absent or close to expiry.
    pub async fn ensure_valid(&self) -> bool {
        let renewal = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.token.as_ref() {
                if !token.needs_refresh() {
                    debug!(remaining_secs = token.remaining_secs(), "Using cached token");
                    return true;
                }
            }
            self.join_or_start(&mut state, false)
        };
        renewal.await
    }

    /// Forces a renewal after the remote rejected the current token.
    /// Returns true if the rejected request should be retried.
    pub async fn on_unauthorized(&self) -> bool {
        let renewal = {
            let mut state = self.state.lock().await;
            warn!("Remote rejected access token, forcing renewal");
            self.join_or_start(&mut state, true)
        };
        renewal.await
    }

    /// Current access token, without triggering a renewal.
    pub async fn access_token(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    /// Joins the in-flight renewal or starts a new one. Must be called with
    /// the state lock held; the returned future is awaited after release.
    fn join_or_start(&self, state: &mut SessionState, forced: bool) -> Renewal {
        if let Some(renewal) = state.in_flight.as_ref() {
            debug!("Joining in-flight token renewal");
            return renewal.clone();
        }

        let backend = Arc::clone(&self.backend);
        let shared_state = Arc::clone(&self.state);
        let refresh_token = state.token.as_ref().and_then(|t| t.refresh_token.clone());

        let renewal = async move {
            let grant = match refresh_token.as_deref() {
                Some(rt) => match backend.refresh(rt).await {
                    Ok(grant) => {
                        debug!("Token refreshed");
                        Ok(grant)
                    }
                    Err(e) => {
                        warn!(error = %e, "Token refresh failed, will re-authenticate");
                        backend.login().await
                    }
                },
                None => backend.login().await,
            };

            let mut state = shared_state.lock().await;
            state.in_flight = None;
            match grant {
                Ok(grant) => {
                    let token = TokenInfo::from_grant(grant, refresh_token);
                    info!(expires_in_secs = token.remaining_secs(), "Authenticated with cloud");
                    state.token = Some(token);
                    true
                }
                Err(e) => {
                    error!(error = %e, "Token renewal failed");
                    if forced {
                        state.token = None;
                    }
                    false
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(renewal.clone());
        renewal
    }
}
