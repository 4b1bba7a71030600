use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

use vigil_core::config::FlagRouteConfig;
use vigil_core::error::ToolError;
use vigil_core::traits::Tool;
use vigil_core::types::ToolOutcome;

const TOOL_NAME: &str = "flag_route";

/// Raises a backend alert for a route (or room) that looks dangerous.
pub struct FlagRouteTool {
    config: FlagRouteConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagPayload<'a> {
    room_id: &'a str,
    severity: &'a str,
    #[serde(rename = "ai_reason")]
    ai_reason: &'a str,
}

impl FlagRouteTool {
    pub fn new(config: FlagRouteConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/api/room/flag-room",
            self.config.backend_url.trim_end_matches('/')
        )
    }
}

/// Extract the route identifier; `id` is accepted as an alias of `route_id`.
fn route_id(args: &serde_json::Map<String, serde_json::Value>) -> Result<String, ToolError> {
    let value = args
        .get("route_id")
        .or_else(|| args.get("id"))
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: TOOL_NAME.to_string(),
            message: "missing required argument 'route_id'".to_string(),
        })?;

    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(ToolError::InvalidArguments {
            tool: TOOL_NAME.to_string(),
            message: "'route_id' must be a non-empty string".to_string(),
        }),
    }
}

impl Tool for FlagRouteTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Trigger a backend alert for a specific route id. Use when a route's score pattern indicates danger."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "route_id": {
                    "type": "string",
                    "description": "The id of the suspicious route"
                }
            },
            "required": ["route_id"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }

    fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<ToolOutcome, ToolError>> {
        Box::pin(async move {
            let route_id = route_id(&args)?;
            let endpoint = self.endpoint();

            debug!(route_id = %route_id, endpoint = %endpoint, "Flagging route");

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
                .build()
                .map_err(|e| ToolError::CallFailed {
                    tool: TOOL_NAME.to_string(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let payload = FlagPayload {
                room_id: &route_id,
                severity: &self.config.severity,
                ai_reason: "Automated surveillance flag by AI agent",
            };

            let resp = client
                .post(&endpoint)
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    warn!(route_id = %route_id, error = %e, "Flag request failed");
                    ToolError::CallFailed {
                        tool: TOOL_NAME.to_string(),
                        message: format!("FAILED to trigger alarm for {}: {}", route_id, e),
                    }
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(ToolError::CallFailed {
                    tool: TOOL_NAME.to_string(),
                    message: format!(
                        "FAILED to trigger alarm for {}: HTTP {}",
                        route_id,
                        status.as_u16()
                    ),
                });
            }

            Ok(ToolOutcome::text(format!(
                "ALARM TRIGGERED for {}. Status: {}",
                route_id,
                status.as_u16()
            )))
        })
    }
}
