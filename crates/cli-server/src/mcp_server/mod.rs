//! MCP server exposing the phase controller's single `step` entry point.
//!
//! The orchestration core never talks to a transport directly; this module
//! is the thin adapter that deserializes a tool call, invokes
//! `PhaseController::step`, and serializes the response back.

use std::sync::Arc;

use eightfold_runtime::prelude::*;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StepParams {
    /// Opaque session identifier; the same session_id must be reused across
    /// every turn of one workflow.
    pub session_id: String,
    /// The phase the agent just finished, omitted on the very first turn.
    pub phase_completed: Option<String>,
    /// The user's objective; only read on the first turn of a session.
    pub initial_objective: Option<String>,
    /// Phase-specific fields the agent reports back (see the phase's prompt).
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct OrchestratorMcpServer {
    controller: Arc<PhaseController>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl OrchestratorMcpServer {
    pub fn new(controller: Arc<PhaseController>) -> Self {
        Self { controller, tool_router: Self::tool_router() }
    }

    #[tool(
        description = "Advance the eight-phase workflow by one turn. Report the phase just completed and its output; receive the next phase's prompt and allowed tools."
    )]
    async fn step(&self, Parameters(params): Parameters<StepParams>) -> Result<CallToolResult, McpError> {
        if let Err(reason) = validate_wire_shape(&params) {
            return Ok(CallToolResult::error(vec![Content::text(reason)]));
        }

        let phase_completed = match params.phase_completed.as_deref() {
            None => None,
            Some(raw) => match parse_phase(raw) {
                Some(p) => Some(p),
                None => {
                    return Ok(CallToolResult::error(vec![Content::text(format!(
                        "unrecognized phase_completed '{raw}'"
                    ))]));
                }
            },
        };

        let request = StepRequest {
            session_id: params.session_id,
            phase_completed,
            initial_objective: params.initial_objective,
            payload: params.payload.into_iter().collect(),
        };

        let response = self.controller.step(request).await;
        let json = serde_json::to_string_pretty(&StepResponseView::from(&response)).unwrap_or_default();
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

/// Request-shape checks from the wire protocol's field constraints:
/// `session_id` is 8+ chars of `[A-Za-z0-9_-]`; `initial_objective`, when
/// present, is 10..1000 characters.
fn validate_wire_shape(params: &StepParams) -> Result<(), String> {
    let id = &params.session_id;
    if id.len() < 8 || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(format!(
            "session_id must be 8+ characters of [A-Za-z0-9_-], got '{id}'"
        ));
    }
    if let Some(objective) = &params.initial_objective {
        if !(10..=1000).contains(&objective.chars().count()) {
            return Err(format!(
                "initial_objective must be 10..1000 characters, got {}",
                objective.chars().count()
            ));
        }
    }
    Ok(())
}

fn parse_phase(raw: &str) -> Option<Phase> {
    match raw.to_uppercase().as_str() {
        "INIT" => Some(Phase::Init),
        "QUERY" => Some(Phase::Query),
        "ENHANCE" => Some(Phase::Enhance),
        "KNOWLEDGE" => Some(Phase::Knowledge),
        "PLAN" => Some(Phase::Plan),
        "EXECUTE" => Some(Phase::Execute),
        "VERIFY" => Some(Phase::Verify),
        "DONE" => Some(Phase::Done),
        _ => None,
    }
}

#[derive(serde::Serialize)]
struct StepResponseView {
    next_phase: String,
    system_prompt: String,
    allowed_next_tools: Vec<String>,
    payload: serde_json::Map<String, serde_json::Value>,
    status: String,
}

impl From<&StepResponse> for StepResponseView {
    fn from(r: &StepResponse) -> Self {
        Self {
            next_phase: r.next_phase.as_str().to_string(),
            system_prompt: r.system_prompt.clone(),
            allowed_next_tools: r.allowed_next_tools.clone(),
            payload: r.payload.clone().into_iter().collect(),
            status: match r.status {
                StepStatus::InProgress => "IN_PROGRESS".to_string(),
                StepStatus::Done => "DONE".to_string(),
                StepStatus::Error => "ERROR".to_string(),
            },
        }
    }
}

#[tool_handler]
impl ServerHandler for OrchestratorMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Eight-phase task orchestrator — call `step` with the phase you just completed to advance the workflow."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Starts the MCP server over stdio transport.
pub async fn start_mcp_server(controller: Arc<PhaseController>) -> anyhow::Result<()> {
    let service = OrchestratorMcpServer::new(controller).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(session_id: &str, initial_objective: Option<&str>) -> StepParams {
        StepParams {
            session_id: session_id.to_string(),
            phase_completed: None,
            initial_objective: initial_objective.map(str::to_string),
            payload: serde_json::Map::new(),
        }
    }

    #[test]
    fn rejects_short_session_id() {
        assert!(validate_wire_shape(&params("short", None)).is_err());
    }

    #[test]
    fn rejects_session_id_with_invalid_characters() {
        assert!(validate_wire_shape(&params("has a space", None)).is_err());
    }

    #[test]
    fn accepts_valid_session_id_with_no_objective() {
        assert!(validate_wire_shape(&params("s-0000001", None)).is_ok());
    }

    #[test]
    fn rejects_too_short_objective() {
        assert!(validate_wire_shape(&params("s-0000001", Some("too short"))).is_err());
    }

    #[test]
    fn accepts_well_formed_objective() {
        assert!(validate_wire_shape(&params("s-0000001", Some("build a small CLI tool for parsing logs"))).is_ok());
    }
}
