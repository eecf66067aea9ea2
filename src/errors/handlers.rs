use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{CloudError, CloudResult};

/// Bounded retry for agent calls. Only errors that report
/// `is_retryable()` are retried; everything else is returned at once.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_retries: u32,
    backoff: Duration,
}

impl RetryHandler {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub async fn handle<T, F, Fut>(&self, operation: &str, attempt: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        self.handle_when(operation, CloudError::is_retryable, attempt)
            .await
    }

    /// Like `handle`, but only errors matching `retryable` are retried.
    pub async fn handle_when<T, F, Fut, R>(
        &self,
        operation: &str,
        retryable: R,
        mut attempt: F,
    ) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
        R: Fn(&CloudError) -> bool,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(result) => {
                    if retries > 0 {
                        info!(operation, retries, "Operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) if retryable(&e) && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        operation,
                        error = %e,
                        retry_count = retries,
                        max_retries = self.max_retries,
                        "Operation failed, retrying"
                    );
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => {
                    if retryable(&e) {
                        error!(operation, error = %e, "Maximum retries reached, operation failed");
                    }
                    return Err(e);
                }
            }
        }
    }
}
