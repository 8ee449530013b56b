//! The serialized REST client: the service's primary and secondary rate
//! limits require that no two calls from one gate run concurrently, so
//! every request goes through one mutex-guarded client slot.

use crate::gates::github::config::GithubConfig;
use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use reqwest::{Method, Response, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const GITHUB_API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DELAY_CHUNK: Duration = Duration::from_secs(30);
const SECONDARY_BACKOFF: Duration = Duration::from_secs(60);
const PRIMARY_MARGIN: Duration = Duration::from_secs(30);

/// Last observed rate-limit headers.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RateInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct AuthedClient {
    pub http: reqwest::Client,
    pub token: String,

    /// True when the token is an App installation token; the two token
    /// kinds list repositories through different endpoints.
    pub installation: bool,
}

#[derive(Default, Debug)]
pub(crate) struct ClientState {
    pub client: Option<AuthedClient>,
    pub rate: Option<RateInfo>,

    /// Earliest moment the next REST call may fire.
    pub delay_till: Option<Instant>,
}

pub(crate) struct SerialClient {
    cfg: GithubConfig,
    state: Mutex<ClientState>,
    cancel: CancellationToken,
}

impl SerialClient {
    pub(crate) fn new(cfg: GithubConfig, cancel: CancellationToken) -> Self {
        Self { cfg, state: Mutex::new(ClientState::default()), cancel }
    }

    /// Acquires exclusive API access: takes the client lock, waits out any
    /// active delay in chunks so shutdown stays responsive, and lazily
    /// (re)builds the client.
    pub(crate) async fn lock(&self) -> anyhow::Result<MutexGuard<'_, ClientState>> {
        let mut state = self.state.lock().await;
        while let Some(till) = state.delay_till {
            let now = Instant::now();
            if till <= now {
                state.delay_till = None;
                break;
            }
            let wait = (till - now).min(MAX_DELAY_CHUNK);
            info!("Rate limited, waiting {wait:?} before the next call");
            tokio::select! {
                _ = self.cancel.cancelled() => bail!("shutting down"),
                _ = time::sleep(wait) => {}
            }
        }
        if state.client.is_none() {
            debug!("Building a fresh API client");
            state.client = Some(self.build_client().await?);
        }
        Ok(state)
    }

    /// Issues one request; `path_for` receives whether the client holds an
    /// App installation token. The call holds the client lock end to end.
    pub(crate) async fn request<F>(
        &self,
        method: Method,
        path_for: F,
        query: &[(&str, String)],
    ) -> anyhow::Result<Response>
    where
        F: FnOnce(bool) -> String + Send,
    {
        let mut state = self.lock().await?;
        let client = state.client.as_ref().context("client slot empty after lock")?;
        let path = path_for(client.installation);
        let url = if path.starts_with("http") { path } else { format!("{}{path}", self.cfg.base_url()) };
        let mut builder = client
            .http
            .request(method, &url)
            .bearer_auth(&client.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let result = builder.send().await;
        self.check_response(&mut state, &url, result).await
    }

    /// Folds one response into the shared state: refreshes `rate`, arms
    /// `delay_till` on a rate-limit error and drops the client on any
    /// failure so the next acquisition rebuilds it.
    async fn check_response(
        &self,
        state: &mut ClientState,
        url: &str,
        result: reqwest::Result<Response>,
    ) -> anyhow::Result<Response> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                state.client = None;
                return Err(e).with_context(|| format!("request to {url} failed"));
            }
        };

        if let Some(rate) = parse_rate(response.headers()) {
            debug!("Rate limit: {}/{} until {}", rate.remaining, rate.limit, rate.reset);
            state.rate = Some(rate);
        }
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        state.client = None;
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let primary = state.rate.as_ref().is_some_and(|r| r.remaining == 0);
            let delay = if primary {
                let until_reset = state
                    .rate
                    .as_ref()
                    .map(|r| (r.reset - Utc::now()).to_std().unwrap_or_default())
                    .unwrap_or_default();
                until_reset + PRIMARY_MARGIN
            } else {
                SECONDARY_BACKOFF
            };
            state.delay_till = Some(Instant::now() + delay);
            let kind = if primary { "primary" } else { "secondary" };
            warn!("Hit the {kind} rate limit, delaying calls for {delay:?}");
            bail!("{kind} rate limit hit, delaying calls for {delay:?}");
        }
        bail!("request to {url} failed with status {status}");
    }

    async fn build_client(&self) -> anyhow::Result<AuthedClient> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("fish-node")
            .build()
            .context("failed to build HTTP client")?;
        if self.cfg.app_configured() {
            match self.installation_token(&http).await {
                Ok(token) => return Ok(AuthedClient { http, token, installation: true }),
                Err(e) => warn!("App installation auth failed, falling back to the token: {e:#}"),
            }
        }
        if !self.cfg.api_token.is_empty() {
            return Ok(AuthedClient { http, token: self.cfg.api_token.clone(), installation: false });
        }
        bail!("no usable authentication")
    }

    /// Trades the App's RSA key for a short-lived installation token.
    async fn installation_token(&self, http: &reqwest::Client) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let key = jsonwebtoken::EncodingKey::from_rsa_pem(self.cfg.api_app_key.as_bytes())
            .context("bad App private key")?;
        let now = Utc::now().timestamp();
        // iat is backdated to survive clock drift between us and the service.
        let claims = Claims { iat: now - 60, exp: now + 9 * 60, iss: self.cfg.api_app_id.to_string() };
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let jwt = jsonwebtoken::encode(&header, &claims, &key).context("failed to sign App JWT")?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.cfg.base_url(),
            self.cfg.api_app_install_id
        );
        let response = http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .send()
            .await
            .context("failed to request installation token")?;
        if !response.status().is_success() {
            bail!("installation token request failed with status {}", response.status());
        }
        let token: TokenResponse = response.json().await.context("bad installation token response")?;
        Ok(token.token)
    }
}

fn parse_rate(headers: &HeaderMap) -> Option<RateInfo> {
    let number = |name: &str| -> Option<i64> { headers.get(name)?.to_str().ok()?.trim().parse().ok() };
    let limit = u32::try_from(number("x-ratelimit-limit")?).ok()?;
    let remaining = u32::try_from(number("x-ratelimit-remaining")?).ok()?;
    let reset = DateTime::from_timestamp(number("x-ratelimit-reset")?, 0)?;
    Some(RateInfo { limit, remaining, reset })
}

/// Pulls the opaque `cursor` of the `rel="next"` segment out of a Link
/// header, for the delivery log's cursor pagination.
pub(crate) fn parse_next_cursor(link_header: &str) -> Option<String> {
    for segment in link_header.split(',') {
        let (target, params) = segment.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            continue;
        }
        let url = target.trim().trim_start_matches('<').trim_end_matches('>');
        let (_, query) = url.split_once('?')?;
        for pair in query.split('&') {
            if let Some(cursor) = pair.strip_prefix("cursor=") {
                return Some(cursor.to_string());
            }
        }
    }
    None
}
