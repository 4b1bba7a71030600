use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use vigil_core::config::RetryConfig;
use vigil_core::error::AnalyzerError;
use vigil_core::traits::Analyzer;
use vigil_core::types::{AnalyzerOutput, PromptContext};

/// An analyzer that retries transient failures with exponential backoff.
pub struct RetryingAnalyzer {
    inner: Box<dyn Analyzer>,
    retry_config: RetryConfig,
}

impl RetryingAnalyzer {
    pub fn new(inner: Box<dyn Analyzer>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &AnalyzerError) -> bool {
    match e {
        AnalyzerError::Unavailable { status, .. } => {
            matches!(status, None | Some(429) | Some(500..=599))
        }
        AnalyzerError::Timeout { .. } => true,
        AnalyzerError::MalformedOutput(_) | AnalyzerError::Cancelled => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Analyzer for RetryingAnalyzer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut attempt = 0;
            loop {
                match self.inner.invoke(ctx.clone()).await {
                    Ok(out) => return Ok(out),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            analyzer = %self.inner.name(),
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying analyzer request"
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(AnalyzerError::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
