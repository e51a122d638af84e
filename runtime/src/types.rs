//! Core data model shared across the phase controller, session store and
//! prompt assembler: phases, todos, session state and the wire request/response
//! shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One state of the eight-phase workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Init,
    Query,
    Enhance,
    Knowledge,
    Plan,
    Execute,
    Verify,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Query => "QUERY",
            Phase::Enhance => "ENHANCE",
            Phase::Knowledge => "KNOWLEDGE",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::Verify => "VERIFY",
            Phase::Done => "DONE",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: Priority,
}

impl Todo {
    /// A todo is critical when it is high priority or carries a meta-prompt
    /// (see `crate::prompts::parse_meta_prompt`).
    pub fn is_critical(&self) -> bool {
        self.priority == Priority::High || crate::prompts::parse_meta_prompt(&self.content).is_some()
    }
}

/// Per-session control state. This is the only state the orchestrator persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub current_phase: Phase,
    pub initial_objective: String,
    pub detected_role: crate::roles::Role,
    pub reasoning_effectiveness: f64,
    pub payload: HashMap<String, Value>,
    pub phase_transition_count: u32,
    pub last_activity: i64,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            current_phase: Phase::Init,
            initial_objective: String::new(),
            detected_role: crate::roles::Role::Researcher,
            reasoning_effectiveness: crate::config::DEFAULT_INITIAL_REASONING_EFFECTIVENESS,
            payload: HashMap::new(),
            phase_transition_count: 0,
            last_activity: now_ms,
        }
    }

    pub fn current_todos(&self) -> Vec<Todo> {
        self.payload
            .get("current_todos")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_current_todos(&mut self, todos: &[Todo]) {
        self.payload.insert(
            "current_todos".to_string(),
            serde_json::to_value(todos).unwrap_or(Value::Array(vec![])),
        );
    }

    pub fn current_task_index(&self) -> usize {
        self.payload
            .get("current_task_index")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize
    }

    pub fn set_current_task_index(&mut self, idx: usize) {
        self.payload
            .insert("current_task_index".to_string(), Value::from(idx as u64));
    }
}

/// Incoming wire request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepRequest {
    pub session_id: String,
    #[serde(default)]
    pub phase_completed: Option<Phase>,
    #[serde(default)]
    pub initial_objective: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    InProgress,
    Done,
    Error,
}

/// Outgoing wire response.
#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub next_phase: Phase,
    pub system_prompt: String,
    pub allowed_next_tools: Vec<String>,
    pub payload: HashMap<String, Value>,
    pub status: StepStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_is_critical_on_high_priority() {
        let t = Todo {
            id: "t1".into(),
            content: "do the thing".into(),
            status: TodoStatus::Pending,
            priority: Priority::High,
        };
        assert!(t.is_critical());
    }

    #[test]
    fn todo_is_critical_on_meta_prompt_regardless_of_priority() {
        let t = Todo {
            id: "t1".into(),
            content: "(ROLE: coder) (CONTEXT: x) (PROMPT: y) (OUTPUT: z)".into(),
            status: TodoStatus::Pending,
            priority: Priority::Low,
        };
        assert!(t.is_critical());
    }

    #[test]
    fn todo_not_critical_when_low_priority_and_plain() {
        let t = Todo {
            id: "t1".into(),
            content: "tidy up".into(),
            status: TodoStatus::Pending,
            priority: Priority::Low,
        };
        assert!(!t.is_critical());
    }

    #[test]
    fn phase_display_matches_wire_casing() {
        assert_eq!(Phase::Knowledge.as_str(), "KNOWLEDGE");
        assert_eq!(Phase::Done.to_string(), "DONE");
    }

    #[test]
    fn session_state_defaults() {
        let s = SessionState::new("abcd1234", 0);
        assert_eq!(s.current_phase, Phase::Init);
        assert!(s.current_todos().is_empty());
        assert_eq!(s.current_task_index(), 0);
    }
}
