pub mod http;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use vigil_core::config::AppConfig;
use vigil_core::traits::Analyzer;

pub use http::HttpAnalyzer;
pub use retry::RetryingAnalyzer;

/// Build one analyzer per `[analyzers.<capability>]` section.
/// Endpoints with a `retry` table are wrapped in a [`RetryingAnalyzer`].
pub fn build_analyzers(config: &AppConfig) -> HashMap<String, Arc<dyn Analyzer>> {
    config
        .analyzers
        .iter()
        .map(|(name, endpoint)| {
            let http = HttpAnalyzer::new(name.clone(), endpoint.clone());
            let analyzer: Arc<dyn Analyzer> = match endpoint.retry.clone() {
                Some(retry) => Arc::new(RetryingAnalyzer::new(Box::new(http), retry)),
                None => Arc::new(http),
            };
            (name.clone(), analyzer)
        })
        .collect()
}
