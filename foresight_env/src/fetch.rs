//! Fetch transport abstraction for the prefetch scheduler.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::types::ResourceKey;

/// Performs the actual retrieval behind a prefetch.
///
/// # Implementations
///
/// - **Production**: `HttpFetcher` issues a GET and drains the body
/// - **Simulation**: `SimFetcher` with tick-based latency and seeded failures
/// - **Custom**: anything that warms an application cache
///
/// # Cancellation
///
/// Implementations must return `Err(FetchError::Cancelled)` promptly once
/// `cancel` fires. The scheduler cancels on cache clear, eviction of a
/// pending entry, superseding evaluations and teardown.
#[async_trait]
pub trait FetchExecutor: Send + Sync + 'static {
    /// Fetches the resource behind `key`.
    ///
    /// # Returns
    /// * `Ok(())` - The resource is now warm
    /// * `Err(FetchError::Cancelled)` - Preempted, not a failure
    /// * `Err(_)` - Real failure, recorded as `Failed` by the scheduler
    async fn fetch(&self, key: &ResourceKey, cancel: CancellationToken) -> Result<(), FetchError>;
}

/// Default executor: a plain HTTP GET whose body is read and discarded,
/// leaving the response in whatever HTTP cache sits in between.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    /// Prefix joined with keys that are not absolute URLs
    base_url: Option<String>,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    /// Creates a fetcher with a default client.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Creates a fetcher around an existing client (shared pools, proxies...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Resolves relative keys against `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn resolve(&self, key: &ResourceKey) -> String {
        let raw = key.as_str();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return raw.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                raw.trim_start_matches('/')
            ),
            None => raw.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl FetchExecutor for HttpFetcher {
    async fn fetch(&self, key: &ResourceKey, cancel: CancellationToken) -> Result<(), FetchError> {
        let url = self.resolve(key);

        let request = async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| FetchError::transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    key: key.to_string(),
                    status: status.as_u16(),
                });
            }

            response
                .bytes()
                .await
                .map_err(|e| FetchError::transport(e.to_string()))?;
            Ok(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = request => result,
        }
    }
}
