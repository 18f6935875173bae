//! # Pull Channel (HTTP)
//!
//! Request/response access to the cloud REST API. Used for the periodic
//! site pulls, on-demand single-device fetches and every command.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Authenticated Request                             │
//! │                                                                         │
//! │   ensure_valid() ──false──► AuthFailed (no updates this cycle)         │
//! │        │ true                                                           │
//! │        ▼                                                                │
//! │   send(bearer) ──► 401? ──no──► map status                             │
//! │                     │ yes                                               │
//! │                     ▼                                                   │
//! │              on_unauthorized() ──false──► AuthFailed                   │
//! │                     │ true                                              │
//! │                     ▼                                                   │
//! │              send(bearer) once more ──► map status                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Mapping
//! | Status        | Result                               |
//! |---------------|--------------------------------------|
//! | 2xx           | parsed body                          |
//! | 304           | `PullOutcome::Unchanged` (pull only) |
//! | 400, 409, 422 | `SyncError::Rejected`                |
//! | 401 (twice)   | `SyncError::AuthFailed`              |
//! | anything else | `SyncError::Http`                    |

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use hvac_core::{DeviceCommand, DeviceSerial, SiteId, StateReport};

use crate::config::ApiSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{CollectionResponse, CommandRequest, WireDeviceState};
use crate::session::TokenSession;
use crate::source::{PullOutcome, RemoteStateSource};

/// Appends path segments to a base URL, keeping any path the base has.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> SyncResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidUrl(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// =============================================================================
// Cloud Client
// =============================================================================

/// reqwest client bound to the API base URL and the token session.
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base: Url,
    session: TokenSession,
    timeout_secs: u64,
}

impl CloudClient {
    pub fn new(api: &ApiSettings, session: TokenSession) -> SyncResult<Self> {
        let base = Url::parse(&api.base_url)?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(api.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(CloudClient {
            http,
            base,
            session,
            timeout_secs: api.request_timeout_secs,
        })
    }

    pub fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        endpoint(&self.base, segments)
    }

    /// Sends an authenticated request, renewing the token and retrying
    /// exactly once if the remote answers 401.
    pub async fn execute<F>(&self, build: F) -> SyncResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        if !self.session.ensure_valid().await {
            return Err(SyncError::AuthFailed(
                "no usable access token, no updates possible this cycle".into(),
            ));
        }

        let response = self.send_with_token(&build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if !self.session.on_unauthorized().await {
            return Err(SyncError::AuthFailed("token renewal after 401 failed".into()));
        }

        let response = self.send_with_token(&build).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::AuthFailed(
                "access token rejected after renewal".into(),
            ));
        }
        Ok(response)
    }

    async fn send_with_token<F>(&self, build: &F) -> SyncResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self
            .session
            .access_token()
            .await
            .ok_or_else(|| SyncError::AuthFailed("no access token held".into()))?;

        build(&self.http)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::from_http(e, self.timeout_secs))
    }

    async fn body_text(&self, response: reqwest::Response) -> SyncResult<String> {
        response
            .text()
            .await
            .map_err(|e| SyncError::from_http(e, self.timeout_secs))
    }

    /// Converts a non-success response into an error.
    async fn failure(&self, response: reqwest::Response) -> SyncError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        match status {
            400 | 409 | 422 => SyncError::Rejected { status, message },
            401 | 403 => SyncError::AuthFailed(format!("remote returned {}", status)),
            _ => SyncError::Http { status, message },
        }
    }
}

// =============================================================================
// HTTP State Source
// =============================================================================

/// [`RemoteStateSource`] backed by the cloud REST API.
pub struct HttpStateSource {
    client: CloudClient,
    debug: bool,
}

impl HttpStateSource {
    pub fn new(client: CloudClient) -> Self {
        HttpStateSource {
            client,
            debug: false,
        }
    }

    /// Logs payload sizes at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[async_trait]
impl RemoteStateSource for HttpStateSource {
    async fn fetch_collection(
        &self,
        site: &SiteId,
        etag: Option<&str>,
    ) -> SyncResult<PullOutcome> {
        let url = self
            .client
            .url(&["sites", site.as_str(), "devices", "state"])?;

        let response = self
            .client
            .execute(|http| {
                let request = http.get(url.clone());
                match etag {
                    Some(tag) => request.header(IF_NONE_MATCH, tag),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(site = %site, "Collection unchanged");
            return Ok(PullOutcome::Unchanged);
        }
        if !status.is_success() {
            return Err(self.client.failure(response).await);
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = self.client.body_text(response).await?;
        if self.debug {
            debug!(site = %site, bytes = body.len(), "Pull payload received");
        }

        let collection: CollectionResponse = serde_json::from_str(&body)?;
        let reports = collection
            .devices
            .into_iter()
            .filter_map(|wire| match wire.into_report() {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(site = %site, error = %e, "Skipping unusable device entry");
                    None
                }
            })
            .collect();

        Ok(PullOutcome::Updated {
            reports,
            etag: new_etag,
        })
    }

    async fn fetch_device(&self, serial: &DeviceSerial) -> SyncResult<StateReport> {
        let url = self.client.url(&["devices", serial.as_str(), "state"])?;
        let response = self.client.execute(|http| http.get(url.clone())).await?;

        if !response.status().is_success() {
            return Err(self.client.failure(response).await);
        }

        let body = self.client.body_text(response).await?;
        if self.debug {
            debug!(serial = %serial, bytes = body.len(), "Device payload received");
        }
        let wire: WireDeviceState = serde_json::from_str(&body)?;
        Ok(wire.into_report()?)
    }

    async fn send_command(
        &self,
        serial: &DeviceSerial,
        command: &DeviceCommand,
    ) -> SyncResult<()> {
        let url = self.client.url(&["devices", serial.as_str(), "commands"])?;
        let body = CommandRequest::from(command);

        let response = self
            .client
            .execute(|http| http.post(url.clone()).json(&body))
            .await?;

        if !response.status().is_success() {
            return Err(self.client.failure(response).await);
        }
        debug!(serial = %serial, "Command accepted");
        Ok(())
    }
}
