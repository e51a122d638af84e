//! Prompt assembler: produces the per-turn instruction text and the
//! allowed-tool set for a phase, enriched with the session's detected role
//! and accumulated payload.

use crate::types::{Phase, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPrompt {
    pub role: String,
    pub context: String,
    pub prompt: String,
    pub output: String,
}

/// Parses the four-tag meta-prompt pattern out of a todo's content, if present.
pub fn parse_meta_prompt(content: &str) -> Option<MetaPrompt> {
    let role = extract_tag(content, "ROLE")?;
    let context = extract_tag(content, "CONTEXT")?;
    let prompt = extract_tag(content, "PROMPT")?;
    let output = extract_tag(content, "OUTPUT")?;
    Some(MetaPrompt { role, context, prompt, output })
}

fn extract_tag(content: &str, tag: &str) -> Option<String> {
    let marker = format!("({tag}:");
    let lower = content.to_lowercase();
    let marker_lower = marker.to_lowercase();
    let start = lower.find(&marker_lower)? + marker.len();
    let end = content[start..].find(')')? + start;
    Some(content[start..end].trim().to_string())
}

pub fn allowed_tools(phase: Phase) -> Vec<&'static str> {
    match phase {
        Phase::Init | Phase::Query | Phase::Enhance => vec!["JARVIS"],
        Phase::Knowledge => vec!["WebSearch", "WebFetch", "APITaskAgent", "PythonComputationalTool", "Task", "JARVIS"],
        Phase::Plan => vec!["TodoWrite"],
        Phase::Execute => vec!["TodoRead", "TodoWrite", "Task", "Bash", "Read", "Write", "Edit", "PythonComputationalTool"],
        Phase::Verify => vec!["TodoRead", "Read", "PythonComputationalTool"],
        Phase::Done => vec![],
    }
}

fn base_prompt(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => "Acknowledge the objective. You will be guided through QUERY next.",
        Phase::Query => "Interpret the user's objective precisely. State what they are actually asking for, then select the role best suited to the work.",
        Phase::Enhance => "Enhance the interpreted goal: add missing detail, surface hidden requirements, and restate it as an actionable goal.",
        Phase::Knowledge => "Gather any external knowledge needed before planning. Use the available tools or accept the synthesized knowledge already gathered.",
        Phase::Plan => "Produce a todo list covering every step needed to complete the goal. Attach a (ROLE)(CONTEXT)(PROMPT)(OUTPUT) meta-prompt to each non-trivial task.",
        Phase::Execute => "Execute the current task. Report success or failure and whether more tasks remain.",
        Phase::Verify => "Verify the work against the task list. Report whether verification passed.",
        Phase::Done => "The task is complete. No further action is required.",
    }
}

fn tool_guidance(phase: Phase) -> String {
    let tools = allowed_tools(phase);
    if tools.is_empty() {
        "No tools are available in this phase.".to_string()
    } else {
        format!("Tools available this phase: {}.", tools.join(", "))
    }
}

/// Assembles the prompt text for the phase the session is about to enter.
pub fn assemble(phase: Phase, session: &SessionState) -> String {
    let mut sections = vec![base_prompt(phase).to_string()];

    let role_cfg = session.detected_role.config();
    sections.push(format!(
        "Role: {} ({}). Focus: {}. Methodology: {}.",
        session.detected_role.as_str(),
        role_cfg.default_output,
        role_cfg.focus,
        role_cfg.thinking_methodology.join("; ")
    ));

    sections.push(tool_guidance(phase));

    match phase {
        Phase::Query => {
            let awaiting = session
                .payload
                .get("awaiting_role_selection")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if awaiting {
                let roles = crate::roles::Role::ALL.map(|r| r.as_str()).join(", ");
                sections.push(format!(
                    "Select the role best suited to this objective from: {roles}. \
                     Reply on your next turn with `claude_response` set to a JSON string \
                     of the shape {{\"selected_role\": \"<role>\"}}."
                ));
            }
        }
        Phase::Enhance => {
            if let Some(goal) = session.payload.get("interpreted_goal").and_then(|v| v.as_str()) {
                sections.push(format!("Interpreted goal so far: {goal}"));
            }
        }
        Phase::Knowledge => {
            if let Some(conf) = session.payload.get("knowledge_confidence").and_then(|v| v.as_f64()) {
                sections.push(format!("Prior synthesis confidence: {conf:.2}"));
            }
        }
        Phase::Execute => {
            let todos = session.current_todos();
            let idx = session.current_task_index();
            if let Some(todo) = todos.get(idx) {
                sections.push(format!("Current task ({}/{}): {}", idx + 1, todos.len(), todo.content));
            }
        }
        Phase::Verify => {
            let todos = session.current_todos();
            let done = todos.iter().filter(|t| matches!(t.status, crate::types::TodoStatus::Completed)).count();
            sections.push(format!("Task breakdown: {done}/{} completed.", todos.len()));
            if let Some(reason) = session.payload.get("verification_failure_reason").and_then(|v| v.as_str()) {
                sections.push(format!("Previous verification failure: {reason}"));
            }
        }
        _ => {}
    }

    let body = sections.join("\n\n");
    body.replace("{{session_id}}", &session.session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;

    #[test]
    fn parse_meta_prompt_extracts_all_four_tags() {
        let mp = parse_meta_prompt(
            "(ROLE: coder) (CONTEXT: billing service) (PROMPT: add retries) (OUTPUT: diff)",
        )
        .unwrap();
        assert_eq!(mp.role, "coder");
        assert_eq!(mp.context, "billing service");
        assert_eq!(mp.prompt, "add retries");
        assert_eq!(mp.output, "diff");
    }

    #[test]
    fn parse_meta_prompt_none_when_incomplete() {
        assert!(parse_meta_prompt("(ROLE: coder) (CONTEXT: x)").is_none());
    }

    #[test]
    fn allowed_tools_empty_in_done() {
        assert!(allowed_tools(Phase::Done).is_empty());
    }

    #[test]
    fn assemble_embeds_role_selection_prompt_when_awaiting() {
        let mut s = SessionState::new("sess-0002", 0);
        s.current_phase = Phase::Query;
        s.payload.insert("awaiting_role_selection".to_string(), serde_json::Value::Bool(true));
        let prompt = assemble(Phase::Query, &s);
        assert!(prompt.contains("selected_role"));
        assert!(prompt.contains("ui_refiner"));
    }

    #[test]
    fn assemble_includes_role_and_current_task() {
        let mut s = SessionState::new("sess-0001", 0);
        s.detected_role = Role::Coder;
        s.current_phase = Phase::Execute;
        s.set_current_todos(&[crate::types::Todo {
            id: "t1".into(),
            content: "write the parser".into(),
            status: crate::types::TodoStatus::Pending,
            priority: crate::types::Priority::High,
        }]);
        let prompt = assemble(Phase::Execute, &s);
        assert!(prompt.contains("write the parser"));
        assert!(prompt.contains("coder"));
    }
}
