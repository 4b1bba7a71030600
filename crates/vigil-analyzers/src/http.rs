use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use vigil_core::config::AnalyzerEndpointConfig;
use vigil_core::error::AnalyzerError;
use vigil_core::traits::Analyzer;
use vigil_core::types::{AnalyzerOutput, Proposal, PromptContext, StructuredResult, ToolCall};

/// Analyzer reached over HTTP: POSTs the prompt context as JSON and reads back
/// either a scored verdict or a proposal that may carry tool calls.
pub struct HttpAnalyzer {
    name: String,
    config: AnalyzerEndpointConfig,
    http: Client,
}

impl HttpAnalyzer {
    pub fn new(name: impl Into<String>, config: AnalyzerEndpointConfig) -> Self {
        Self {
            name: name.into(),
            config,
            http: Client::new(),
        }
    }
}

// Response types
#[derive(Deserialize)]
#[serde(untagged)]
enum WireOutput {
    Tagged(AnalyzerOutput),
    Scored(StructuredResult),
    Proposal(WireProposal),
}

#[derive(Deserialize)]
struct WireProposal {
    #[serde(alias = "content")]
    text: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default, alias = "arguments")]
    args: serde_json::Value,
}

/// Parse an analyzer response body. Accepts the tagged form, a bare
/// `{score, justification}` record, or a bare `{text, tool_calls}` proposal.
pub(crate) fn parse_output(body: &str) -> Result<AnalyzerOutput, AnalyzerError> {
    let wire: WireOutput = serde_json::from_str(body)
        .map_err(|e| AnalyzerError::MalformedOutput(e.to_string()))?;

    Ok(match wire {
        WireOutput::Tagged(out) => out,
        WireOutput::Scored(s) => AnalyzerOutput::Scored(s),
        WireOutput::Proposal(p) => {
            let tool_calls = p
                .tool_calls
                .into_iter()
                .map(|c| {
                    let mut call = ToolCall::from_json(c.name, c.args);
                    if let Some(id) = c.id {
                        call.id = id;
                    }
                    call
                })
                .collect();
            AnalyzerOutput::Proposal(Proposal {
                text: p.text,
                tool_calls,
            })
        }
    })
}

fn map_send_error(e: reqwest::Error, timeout_ms: u64) -> AnalyzerError {
    if e.is_timeout() {
        AnalyzerError::Timeout { timeout_ms }
    } else if e.is_connect() {
        AnalyzerError::unreachable(format!("connection failed: {}", e))
    } else {
        AnalyzerError::unreachable(e.to_string())
    }
}

impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            let timeout = Duration::from_secs(self.config.timeout_secs);
            let timeout_ms = timeout.as_millis() as u64;
            let cancel = ctx.cancel.clone();

            let mut req = self
                .http
                .post(&self.config.url)
                .timeout(timeout)
                .header("content-type", "application/json")
                .json(&ctx);
            if let Some(ref key) = self.config.api_key {
                req = req.bearer_auth(key);
            }

            debug!(
                analyzer = %self.name,
                node_id = %ctx.node_id,
                conversation = %ctx.conversation_id,
                "Invoking HTTP analyzer"
            );

            let call = async {
                let resp = req.send().await.map_err(|e| map_send_error(e, timeout_ms))?;
                let status = resp.status();
                let body = resp.text().await.map_err(|e| map_send_error(e, timeout_ms))?;

                if !status.is_success() {
                    warn!(analyzer = %self.name, status = %status, "Analyzer returned error status");
                    return Err(AnalyzerError::http(
                        status.as_u16(),
                        body.chars().take(200).collect::<String>(),
                    ));
                }

                parse_output(&body)
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AnalyzerError::Cancelled),
                result = call => result,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::ConversationId;

    #[test]
    fn test_parse_tagged_output() {
        let out = parse_output(r#"{"type":"scored","score":7.5,"justification":"threat"}"#).unwrap();
        assert_eq!(out, AnalyzerOutput::Scored(StructuredResult::new(7.5, "threat")));
    }

    #[test]
    fn test_parse_bare_score() {
        let out = parse_output(r#"{"score":0.2,"justification":"calm"}"#).unwrap();
        assert_eq!(out, AnalyzerOutput::Scored(StructuredResult::new(0.2, "calm")));
    }

    #[test]
    fn test_parse_bare_proposal_with_calls() {
        let out = parse_output(
            r#"{"content":"flagging","tool_calls":[{"id":"c1","name":"flag_route","arguments":{"route_id":"r1"}}]}"#,
        )
        .unwrap();
        match out {
            AnalyzerOutput::Proposal(p) => {
                assert_eq!(p.text, "flagging");
                assert_eq!(p.tool_calls.len(), 1);
                assert_eq!(p.tool_calls[0].id, "c1");
                assert_eq!(p.tool_calls[0].args["route_id"], "r1");
            }
            other => panic!("expected proposal, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        let err = parse_output("not json at all").unwrap_err();
        assert!(matches!(err, AnalyzerError::MalformedOutput(_)));

        let err = parse_output(r#"{"verdict":"yes"}"#).unwrap_err();
        assert!(matches!(err, AnalyzerError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let analyzer = HttpAnalyzer::new(
            "judge",
            AnalyzerEndpointConfig {
                url: "http://127.0.0.1:9/judge".into(),
                api_key: None,
                timeout_secs: 1,
                retry: None,
            },
        );
        let ctx = PromptContext::new(ConversationId::from_str("room-1"), "final_judge");
        ctx.cancel.cancel();

        let err = analyzer.invoke(ctx).await.unwrap_err();
        assert_eq!(err, AnalyzerError::Cancelled);
    }
}
