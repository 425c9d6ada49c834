use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::settings::Settings;

const BASE_BACKOFF_MS: u64 = 2000;

/// Per-request hints taken from the site profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchFlags {
    /// The site only renders through a real browser session.
    pub use_automation: bool,
    /// Playback is HLS; the page is fetched for its metadata only.
    pub is_m3u8: bool,
}

/// Source of page markup. A run owns its fetcher, so any session state
/// (cookies, a browser tab) is scoped to that run.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, flags: FetchFlags) -> Result<String, FetchError>;

    /// Whether concurrent fetches are independent of one another. A single
    /// browser tab is not.
    fn isolated_sessions(&self) -> bool {
        false
    }
}

/// Plain HTTP fetcher with retry and exponential backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.fetch_timeout())
            .cookie_store(true)
            .build()?;
        Ok(HttpFetcher {
            client,
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(http)
    }
}

fn should_retry(err: &FetchError) -> bool {
    match err {
        FetchError::Status { status, .. } => matches!(
            StatusCode::from_u16(*status),
            Ok(StatusCode::TOO_MANY_REQUESTS
                | StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE)
        ),
        FetchError::Http { source, .. } => source.is_timeout() || source.is_connect(),
        _ => false,
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, flags: FetchFlags) -> Result<String, FetchError> {
        if flags.use_automation {
            debug!(url, "no browser session available, fetching over plain HTTP");
        }

        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.max_retries && should_retry(&e) => {
                    let backoff = self.base_backoff * 2u32.pow(attempt);
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt + 1,
                        self.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn isolated_sessions(&self) -> bool {
        true
    }
}
