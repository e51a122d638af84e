//! Phase controller: the finite state machine over (phase, event, payload).
//!
//! This is the sole entry point external callers use: report what phase just
//! completed and what the agent produced, get back the next phase, its
//! prompt, and the tools allowed for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::Config;
use crate::fetcher::HttpFetcher;
use crate::knowledge::KnowledgeOrchestrator;
use crate::prompts;
use crate::registry::EndpointRegistry;
use crate::roles::{self, Role};
use crate::session::SessionStore;
use crate::types::{Phase, SessionState, StepRequest, StepResponse, StepStatus, Todo};
use crate::validator;

pub struct PhaseController {
    config: Config,
    sessions: Arc<SessionStore>,
    registry: EndpointRegistry,
    fetcher: HttpFetcher,
    /// One mutex per session, created on first use. Serializes the
    /// read-modify-write across `step` for a given session so two
    /// concurrent turns of the same session can't race past each other's
    /// `get`/`update`, while turns on different sessions stay parallel.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PhaseController {
    pub fn new(config: Config, sessions: Arc<SessionStore>, registry: EndpointRegistry) -> Self {
        let fetcher = HttpFetcher::new(&config);
        Self { config, sessions, registry, fetcher, session_locks: DashMap::new() }
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .session_locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        )
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn step(&self, request: StepRequest) -> StepResponse {
        let lock = self.lock_for(&request.session_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let mut session = self.sessions.get(&request.session_id, now).await;

        if let Some(objective) = request.initial_objective.clone() {
            if session.current_phase == Phase::Init && session.initial_objective.is_empty() {
                session.initial_objective = objective.clone();
                session.detected_role = roles::heuristic(&objective);
                session.payload.insert("awaiting_role_selection".to_string(), Value::Bool(true));
            }
        }

        let completed = request.phase_completed;
        let next_phase = self.transition(&mut session, completed, &request.payload).await;
        session.current_phase = next_phase;
        session.phase_transition_count += 1;
        session.last_activity = now;

        self.sessions.update(session.clone()).await;

        let system_prompt = prompts::assemble(next_phase, &session);
        let allowed_next_tools = prompts::allowed_tools(next_phase).into_iter().map(String::from).collect();
        let status = if next_phase == Phase::Done { StepStatus::Done } else { StepStatus::InProgress };

        let mut payload = session.payload.clone();
        payload.insert("session_id".to_string(), Value::String(session.session_id.clone()));
        payload.insert("current_objective".to_string(), Value::String(session.initial_objective.clone()));
        payload.insert("detected_role".to_string(), Value::String(session.detected_role.as_str().to_string()));
        payload.insert(
            "reasoning_effectiveness".to_string(),
            serde_json::Number::from_f64(session.reasoning_effectiveness)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "phase_transition_count".to_string(),
            Value::Number(session.phase_transition_count.into()),
        );

        StepResponse { next_phase, system_prompt, allowed_next_tools, payload, status }
    }

    async fn transition(
        &self,
        session: &mut SessionState,
        completed: Option<Phase>,
        payload: &std::collections::HashMap<String, Value>,
    ) -> Phase {
        match (session.current_phase, completed) {
            (Phase::Init, _) => Phase::Query,

            (Phase::Query, Some(Phase::Query)) => {
                let awaiting = session
                    .payload
                    .get("awaiting_role_selection")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if awaiting {
                    if let Some(reply) = payload.get("claude_response").and_then(|v| v.as_str()) {
                        if let Some(role) = parse_role_selection(reply) {
                            session.detected_role = role;
                        } else {
                            tracing::info!(session_id = %session.session_id, "role selection reply malformed, keeping heuristic role");
                        }
                    }
                    session.payload.remove("awaiting_role_selection");
                }
                if let Some(goal) = payload.get("interpreted_goal") {
                    session.payload.insert("interpreted_goal".to_string(), goal.clone());
                }
                Phase::Enhance
            }

            (Phase::Enhance, Some(Phase::Enhance)) => {
                if let Some(goal) = payload.get("enhanced_goal") {
                    session.payload.insert("enhanced_goal".to_string(), goal.clone());
                }
                Phase::Knowledge
            }

            (Phase::Knowledge, Some(Phase::Knowledge)) => {
                self.run_knowledge_phase(session).await;
                Phase::Plan
            }

            (Phase::Plan, Some(Phase::Plan)) => {
                let created = payload.get("plan_created").and_then(|v| v.as_bool()).unwrap_or(false);
                if created {
                    if let Some(todos_value) = payload.get("todos_with_metaprompts") {
                        if let Ok(todos) = serde_json::from_value::<Vec<Todo>>(todos_value.clone()) {
                            session.set_current_todos(&todos);
                            session.set_current_task_index(0);
                        }
                    }
                }
                Phase::Execute
            }

            (Phase::Execute, Some(Phase::Execute)) => {
                for (k, v) in payload {
                    session.payload.insert(k.clone(), v.clone());
                }
                let success = payload.get("execution_success").and_then(|v| v.as_bool()).unwrap_or(true);
                let magnitude = match session.detected_role.config().complexity {
                    roles::Complexity::Complex => 0.15,
                    roles::Complexity::Simple | roles::Complexity::MultiStep => 0.10,
                };
                let delta = if success { magnitude } else { -magnitude };
                session.reasoning_effectiveness = (session.reasoning_effectiveness + delta)
                    .clamp(self.config.thresholds.min_reasoning_effectiveness, self.config.thresholds.max_reasoning_effectiveness);

                let todos = session.current_todos();
                let more_pending = payload.get("more_tasks_pending").and_then(|v| v.as_bool()).unwrap_or(false);
                let idx = session.current_task_index();
                if more_pending || idx + 1 < todos.len() {
                    session.set_current_task_index(idx + 1);
                    Phase::Execute
                } else {
                    Phase::Verify
                }
            }

            (Phase::Verify, Some(Phase::Verify)) => {
                let todos = session.current_todos();
                let claim = payload.get("verification_passed").and_then(|v| v.as_bool()).unwrap_or(false);
                let outcome = validator::validate(&todos, session.reasoning_effectiveness, claim, &self.config.thresholds);

                session.payload.insert(
                    "last_completion_percentage".to_string(),
                    Value::Number(serde_json::Number::from_f64(outcome.completion_pct).unwrap_or(0.into())),
                );

                if outcome.valid {
                    Phase::Done
                } else {
                    if let Some(reason) = &outcome.reason {
                        session.payload.insert("verification_failure_reason".to_string(), Value::String(reason.clone()));
                    }
                    let idx = session.current_task_index();
                    let (target, new_idx) = validator::rollback_target(outcome.completion_pct, idx);
                    session.set_current_task_index(new_idx);
                    target
                }
            }

            (Phase::Done, _) => Phase::Done,

            // Defensive resync: an event we don't recognize for the current phase.
            _ => {
                tracing::warn!(session_id = %session.session_id, phase = %session.current_phase, completed = ?completed, "unmatched transition, resyncing to QUERY");
                Phase::Query
            }
        }
    }

    async fn run_knowledge_phase(&self, session: &mut SessionState) {
        if !self.config.knowledge.auto_connection_enabled {
            return;
        }
        let workspace = PathBuf::from(&self.config.session_store.store_path)
            .join(&session.session_id)
            .join("workspace");
        let orchestrator = KnowledgeOrchestrator::new(&self.registry, &self.fetcher, &self.config);
        let result = orchestrator.gather(&session.initial_objective, session.detected_role, &workspace).await;

        session.payload.insert("synthesized_knowledge".to_string(), Value::String(result.answer));
        session.payload.insert(
            "knowledge_confidence".to_string(),
            serde_json::Number::from_f64(result.confidence).map(Value::Number).unwrap_or(Value::Null),
        );
        session
            .payload
            .insert("api_usage_metrics".to_string(), serde_json::to_value(&result.metrics).unwrap_or(Value::Null));
    }
}

fn parse_role_selection(reply: &str) -> Option<Role> {
    let value: Value = serde_json::from_str(reply).ok()?;
    let role_str = value.get("selected_role")?.as_str()?;
    Role::from_str_loose(role_str)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FileSessionBackend;
    use serde_json::json;
    use std::collections::HashMap;

    async fn controller() -> PhaseController {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSessionBackend::new(dir.path()));
        let sessions = Arc::new(SessionStore::new(backend));
        let registry = EndpointRegistry::new(vec![]);
        let config = Config::default();
        PhaseController::new(config, sessions, registry)
    }

    fn req(session_id: &str, phase_completed: Option<Phase>, payload: HashMap<String, Value>) -> StepRequest {
        StepRequest {
            session_id: session_id.to_string(),
            phase_completed,
            initial_objective: None,
            payload,
        }
    }

    #[tokio::test]
    async fn init_to_query_on_first_turn() {
        let pc = controller().await;
        let mut first = req("s-00000001", None, HashMap::new());
        first.initial_objective = Some("Analyze CSV sales data and produce insights".to_string());
        let resp = pc.step(first).await;
        assert_eq!(resp.next_phase, Phase::Query);
        assert_eq!(
            resp.payload.get("detected_role").and_then(|v| v.as_str()),
            Some("analyzer")
        );
    }

    #[tokio::test]
    async fn happy_path_reaches_done() {
        let pc = controller().await;
        let sid = "s-happypath01";

        let mut init = req(sid, None, HashMap::new());
        init.initial_objective = Some("Build a small CLI tool".to_string());
        let r1 = pc.step(init).await;
        assert_eq!(r1.next_phase, Phase::Query);

        let r2 = pc.step(req(sid, Some(Phase::Query), HashMap::new())).await;
        assert_eq!(r2.next_phase, Phase::Enhance);

        let r3 = pc.step(req(sid, Some(Phase::Enhance), HashMap::new())).await;
        assert_eq!(r3.next_phase, Phase::Knowledge);

        let r4 = pc.step(req(sid, Some(Phase::Knowledge), HashMap::new())).await;
        assert_eq!(r4.next_phase, Phase::Plan);

        let mut plan_payload = HashMap::new();
        plan_payload.insert("plan_created".to_string(), json!(true));
        plan_payload.insert(
            "todos_with_metaprompts".to_string(),
            json!([{"id": "t1", "content": "build it", "status": "pending", "priority": "high"}]),
        );
        let r5 = pc.step(req(sid, Some(Phase::Plan), plan_payload)).await;
        assert_eq!(r5.next_phase, Phase::Execute);

        let mut exec_payload = HashMap::new();
        exec_payload.insert("execution_success".to_string(), json!(true));
        exec_payload.insert("more_tasks_pending".to_string(), json!(false));
        exec_payload.insert(
            "current_todos".to_string(),
            json!([{"id": "t1", "content": "build it", "status": "completed", "priority": "high"}]),
        );
        let r6 = pc.step(req(sid, Some(Phase::Execute), exec_payload)).await;
        assert_eq!(r6.next_phase, Phase::Verify);

        let mut verify_payload = HashMap::new();
        verify_payload.insert("verification_passed".to_string(), json!(true));
        let r7 = pc.step(req(sid, Some(Phase::Verify), verify_payload)).await;
        assert_eq!(r7.next_phase, Phase::Done);
        assert_eq!(r7.status, StepStatus::Done);
    }

    #[tokio::test]
    async fn verify_failure_rolls_back_to_plan_when_completion_low() {
        let pc = controller().await;
        let sid = "s-rollback001";
        let mut init = req(sid, None, HashMap::new());
        init.initial_objective = Some("multi step project".to_string());
        pc.step(init).await;
        pc.step(req(sid, Some(Phase::Query), HashMap::new())).await;
        pc.step(req(sid, Some(Phase::Enhance), HashMap::new())).await;
        pc.step(req(sid, Some(Phase::Knowledge), HashMap::new())).await;

        let mut plan_payload = HashMap::new();
        plan_payload.insert("plan_created".to_string(), json!(true));
        plan_payload.insert(
            "todos_with_metaprompts".to_string(),
            json!([
                {"id": "t1", "content": "step one", "status": "completed", "priority": "low"},
                {"id": "t2", "content": "step two", "status": "pending", "priority": "low"},
                {"id": "t3", "content": "step three", "status": "pending", "priority": "low"},
                {"id": "t4", "content": "step four", "status": "pending", "priority": "low"},
                {"id": "t5", "content": "step five", "status": "pending", "priority": "low"},
            ]),
        );
        pc.step(req(sid, Some(Phase::Plan), plan_payload)).await;

        // Five todos means five Execute turns before the controller moves on.
        let mut r = pc.step(req(sid, Some(Phase::Execute), HashMap::new())).await;
        for _ in 0..4 {
            assert_eq!(r.next_phase, Phase::Execute);
            r = pc.step(req(sid, Some(Phase::Execute), HashMap::new())).await;
        }
        assert_eq!(r.next_phase, Phase::Verify);

        let mut verify_payload = HashMap::new();
        verify_payload.insert("verification_passed".to_string(), json!(true));
        let r = pc.step(req(sid, Some(Phase::Verify), verify_payload)).await;
        assert_eq!(r.next_phase, Phase::Plan);
    }

    #[tokio::test]
    async fn execute_success_bumps_effectiveness_by_complexity_magnitude() {
        let pc = controller().await;
        let sid = "s-complexity1";
        let mut init = req(sid, None, HashMap::new());
        init.initial_objective = Some("integrate and merge two competing proposals".to_string());
        let r1 = pc.step(init).await;
        assert_eq!(r1.payload.get("detected_role").and_then(|v| v.as_str()), Some("synthesizer"));

        pc.step(req(sid, Some(Phase::Query), HashMap::new())).await;
        pc.step(req(sid, Some(Phase::Enhance), HashMap::new())).await;
        pc.step(req(sid, Some(Phase::Knowledge), HashMap::new())).await;

        let mut plan_payload = HashMap::new();
        plan_payload.insert("plan_created".to_string(), json!(true));
        plan_payload.insert(
            "todos_with_metaprompts".to_string(),
            json!([{"id": "t1", "content": "combine", "status": "pending", "priority": "low"}]),
        );
        pc.step(req(sid, Some(Phase::Plan), plan_payload)).await;

        let mut exec_payload = HashMap::new();
        exec_payload.insert("execution_success".to_string(), json!(true));
        let r = pc.step(req(sid, Some(Phase::Execute), exec_payload)).await;
        let effectiveness = r.payload.get("reasoning_effectiveness").and_then(|v| v.as_f64()).unwrap();
        assert!((effectiveness - 0.95).abs() < 1e-9, "expected 0.8 + 0.15 = 0.95, got {effectiveness}");
    }

    #[tokio::test]
    async fn done_phase_is_idempotent() {
        let sid = "s-donetwice1";
        let backend_path = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(Arc::new(FileSessionBackend::new(backend_path.path()))));
        let mut session = SessionState::new(sid, 0);
        session.current_phase = Phase::Done;
        sessions.update(session).await;

        let pc = PhaseController::new(Config::default(), sessions, EndpointRegistry::new(vec![]));
        let r = pc.step(req(sid, Some(Phase::Verify), HashMap::new())).await;
        assert_eq!(r.next_phase, Phase::Done);
    }

    #[tokio::test]
    async fn malformed_role_selection_reply_keeps_heuristic_role() {
        let pc = controller().await;
        let sid = "s-malformed1";
        let mut init = req(sid, None, HashMap::new());
        init.initial_objective = Some("review the security of this service".to_string());
        let r1 = pc.step(init).await;
        assert_eq!(r1.payload.get("detected_role").and_then(|v| v.as_str()), Some("critic"));

        let mut payload = HashMap::new();
        payload.insert("claude_response".to_string(), json!("{selected_role: coder"));
        let r2 = pc.step(req(sid, Some(Phase::Query), payload)).await;
        assert_eq!(r2.next_phase, Phase::Enhance);
        assert_eq!(r2.payload.get("detected_role").and_then(|v| v.as_str()), Some("critic"));
    }

    #[tokio::test]
    async fn concurrent_turns_on_same_session_serialize_without_lost_updates() {
        let pc = Arc::new(controller().await);
        let sid = "s-concurrent1";
        let mut init = req(sid, None, HashMap::new());
        init.initial_objective = Some("build a small CLI tool for parsing logs".to_string());
        pc.step(init).await;

        let (a, b) = tokio::join!(
            pc.step(req(sid, Some(Phase::Query), HashMap::new())),
            pc.step(req(sid, Some(Phase::Query), HashMap::new()))
        );

        // Whichever order the two racing turns actually ran in, both must
        // have been applied in full — no lost update from an interleaved
        // get/update pair — so the session ends up exactly two turns past
        // the initial INIT->QUERY step.
        let final_count = a.payload["phase_transition_count"]
            .as_i64()
            .unwrap()
            .max(b.payload["phase_transition_count"].as_i64().unwrap());
        assert_eq!(final_count, 3);
    }
}
