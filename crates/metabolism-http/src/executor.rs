//! Bounded, retrying request execution
//!
//! A [`RequestExecutor`] owns the admission semaphore shared by every request
//! it sends. A permit is held only for the duration of one transport call, so
//! a request waiting out its backoff never blocks other requests.

use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// Sends requests through a [`Transport`] with bounded concurrency and retries
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("max_concurrent", &self.max_concurrent)
            .field("available_permits", &self.available_permits())
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_concurrent: usize,
        retry_policy: RetryPolicy,
    ) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        retry_policy.validate()?;

        Ok(Self {
            transport,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            retry_policy,
        })
    }

    /// Executor using [`ReqwestTransport`] and the limits from `config`
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Self::new(
            Arc::new(transport),
            config.max_concurrent_requests,
            config.retry_policy.clone(),
        )
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Configured concurrency ceiling
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held by an in-flight request
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// One attempt: wait for a permit, send, release.
    ///
    /// A 5xx status becomes [`Error::ServerError`] so the retry layer sees it;
    /// every other status is handed back to the caller.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();

        let response = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| Error::InvalidConfig("request executor was shut down".to_string()))?;
            self.transport.send(request).await?
        };

        if response.status.is_server_error() {
            debug!("{} for {url}", response.status);
            return Err(Error::ServerError {
                url,
                status: response.status,
            });
        }

        Ok(response)
    }

    /// Run `op` under this executor's retry policy.
    ///
    /// `op` is invoked once per attempt and should call [`Self::send`] for each
    /// request it makes, so that no permit is held across a backoff delay.
    pub async fn retry<F, Fut, T>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_policy.execute(what, op).await
    }

    /// Send `request`, retrying transport failures and 5xx responses
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let what = request.url.clone();
        self.retry(&what, move || self.send(request.clone())).await
    }
}

/// Whether `status` is a usable 2xx answer carrying a body
pub(crate) fn is_ok_with_body(status: StatusCode) -> bool {
    status.is_success() && status != StatusCode::NO_CONTENT
}
