//! Session store: an in-memory cache backed by a write-behind persistent
//! graph, with a bounded exponential-backoff retry queue for failed writes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::roles::Role;
use crate::types::{Phase, SessionState};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Whether a failed backend call is worth retrying. Network/timeout-class
/// errors are transient; permission/auth-class errors and malformed data
/// will not resolve themselves on a later attempt.
#[derive(Debug, PartialEq, Eq)]
enum RetryClass {
    Retriable,
    Permanent,
}

fn classify(err: &SessionStoreError) -> RetryClass {
    match err {
        SessionStoreError::Io(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied => RetryClass::Permanent,
            _ => RetryClass::Retriable,
        },
        SessionStoreError::Serde(_) => RetryClass::Permanent,
    }
}

#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync {
    async fn save(&self, state: &SessionState) -> Result<(), SessionStoreError>;
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, SessionStoreError>;
}

/// A per-session JSON-lines file encoding a small entity/relation graph:
/// one entity for the session's scalar fields, one entity per task.
pub struct FileSessionBackend {
    root: PathBuf,
}

impl FileSessionBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait::async_trait]
impl SessionBackend for FileSessionBackend {
    async fn save(&self, state: &SessionState) -> Result<(), SessionStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let lines = encode_graph(state);
        tokio::fs::write(self.path_for(&state.session_id), lines.join("\n")).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, SessionStoreError> {
        match tokio::fs::read_to_string(self.path_for(session_id)).await {
            Ok(content) => Ok(Some(decode_graph(session_id, &content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct GraphLine {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(rename = "entityType")]
    entity_type: String,
    observations: Vec<String>,
}

fn encode_graph(state: &SessionState) -> Vec<String> {
    let mut observations = vec![
        format!("phase: {}", state.current_phase),
        format!("objective: {}", state.initial_objective),
        format!("role: {}", state.detected_role.as_str()),
        format!("effectiveness: {}", state.reasoning_effectiveness),
        format!("transition_count: {}", state.phase_transition_count),
        format!("last_activity: {}", state.last_activity),
    ];
    for (key, value) in &state.payload {
        observations.push(format!("payload.{key}: {}", value));
    }

    let session_entity = GraphLine {
        kind: "entity".to_string(),
        name: state.session_id.clone(),
        entity_type: "session".to_string(),
        observations,
    };

    let mut lines = vec![serde_json::to_string(&session_entity).unwrap_or_default()];

    for todo in state.current_todos() {
        let task_entity = GraphLine {
            kind: "entity".to_string(),
            name: format!("{}:{}", state.session_id, todo.id),
            entity_type: "task".to_string(),
            observations: vec![
                format!("content: {}", todo.content),
                format!("status: {:?}", todo.status),
                format!("priority: {:?}", todo.priority),
            ],
        };
        lines.push(serde_json::to_string(&task_entity).unwrap_or_default());
    }

    lines
}

/// Reads the value portion of a `key: value` observation, applying the
/// malformed-observation rules: a literal `undefined`/`null` value means
/// "use the field's default" (the caller does that by treating it as
/// absent); a key with nothing after the colon returns an empty string.
fn read_observation<'a>(observations: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{key}: ");
    for obs in observations {
        if let Some(rest) = obs.strip_prefix(&prefix) {
            return match rest {
                "undefined" | "null" => None,
                _ => Some(rest),
            };
        }
        if obs == &format!("{key}:") {
            return Some("");
        }
    }
    None
}

fn decode_graph(session_id: &str, content: &str) -> SessionState {
    let mut state = SessionState::new(session_id, 0);

    for line in content.lines() {
        let Ok(parsed) = serde_json::from_str::<GraphLine>(line) else { continue };
        if parsed.kind != "entity" || parsed.entity_type != "session" {
            continue;
        }

        if let Some(v) = read_observation(&parsed.observations, "phase") {
            state.current_phase = match v {
                "INIT" => Phase::Init,
                "QUERY" => Phase::Query,
                "ENHANCE" => Phase::Enhance,
                "KNOWLEDGE" => Phase::Knowledge,
                "PLAN" => Phase::Plan,
                "EXECUTE" => Phase::Execute,
                "VERIFY" => Phase::Verify,
                "DONE" => Phase::Done,
                _ => Phase::Init,
            };
        }
        if let Some(v) = read_observation(&parsed.observations, "objective") {
            state.initial_objective = v.to_string();
        }
        if let Some(v) = read_observation(&parsed.observations, "role") {
            state.detected_role = Role::from_str_loose(v).unwrap_or(Role::Researcher);
        }
        if let Some(v) = read_observation(&parsed.observations, "effectiveness") {
            state.reasoning_effectiveness = v.parse().unwrap_or(crate::config::DEFAULT_INITIAL_REASONING_EFFECTIVENESS);
        }
        if let Some(v) = read_observation(&parsed.observations, "transition_count") {
            state.phase_transition_count = v.parse().unwrap_or(0);
        }
        if let Some(v) = read_observation(&parsed.observations, "last_activity") {
            state.last_activity = v.parse().unwrap_or(0);
        }
        for obs in &parsed.observations {
            if let Some(rest) = obs.strip_prefix("payload.") {
                if let Some((key, raw_value)) = rest.split_once(": ") {
                    if raw_value == "undefined" || raw_value == "null" {
                        continue;
                    }
                    let value = serde_json::from_str(raw_value)
                        .unwrap_or_else(|_| serde_json::Value::String(raw_value.to_string()));
                    state.payload.insert(key.to_string(), value);
                }
            }
        }
    }

    state
}

/// In-memory cache + write-behind persistence + bounded retry.
pub struct SessionStore {
    cache: Arc<DashMap<String, SessionState>>,
    backend: Arc<dyn SessionBackend>,
}

const MAX_RETRY_ATTEMPTS: u32 = 3;

#[cfg(not(test))]
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
#[cfg(test)]
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(5);

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            backend,
        }
    }

    /// Returns the session from L1, or loads it from L2, or synthesizes a
    /// fresh default. Never blocks on a retry.
    pub async fn get(&self, session_id: &str, now_ms: i64) -> SessionState {
        if let Some(state) = self.cache.get(session_id) {
            return state.clone();
        }
        match self.backend.load(session_id).await {
            Ok(Some(state)) => {
                self.cache.insert(session_id.to_string(), state.clone());
                state
            }
            Ok(None) => SessionState::new(session_id, now_ms),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "session load failed, returning fresh default");
                self.schedule_load_retry(session_id.to_string(), &e);
                SessionState::new(session_id, now_ms)
            }
        }
    }

    /// Replaces the L1 entry and asynchronously persists to L2. Persistence
    /// failure enqueues a retry; it never fails the in-memory update.
    pub async fn update(&self, state: SessionState) {
        let session_id = state.session_id.clone();
        self.cache.insert(session_id.clone(), state.clone());
        if let Err(e) = self.backend.save(&state).await {
            tracing::warn!(session_id = %session_id, error = %e, "session persist failed, enqueueing retry");
            self.schedule_save_retry(state, &e);
        }
    }

    /// Retries persisting `state` itself, not just a load, so a failed
    /// `update()` actually reaches L2 once the backend recovers.
    fn schedule_save_retry(&self, state: SessionState, first_error: &SessionStoreError) {
        if classify(first_error) == RetryClass::Permanent {
            tracing::error!(session_id = %state.session_id, error = %first_error, "permanent error persisting session, not retrying");
            return;
        }
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if attempt > MAX_RETRY_ATTEMPTS {
                    tracing::error!(session_id = %state.session_id, "giving up on session persistence after repeated failures");
                    return;
                }
                let delay = INITIAL_RETRY_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
                match backend.save(&state).await {
                    Ok(()) => {
                        tracing::info!(session_id = %state.session_id, attempt, "session store recovered, write persisted");
                        return;
                    }
                    Err(e) if classify(&e) == RetryClass::Permanent => {
                        tracing::error!(session_id = %state.session_id, attempt, error = %e, "permanent error persisting session, giving up");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %state.session_id, attempt, error = %e, "retry attempt failed");
                    }
                }
            }
        });
    }

    /// Retries the load that failed on `get()`, repopulating L1 on success
    /// so the store actually recovers instead of serving fresh defaults
    /// forever.
    fn schedule_load_retry(&self, session_id: String, first_error: &SessionStoreError) {
        if classify(first_error) == RetryClass::Permanent {
            tracing::error!(session_id = %session_id, error = %first_error, "permanent error loading session, not retrying");
            return;
        }
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if attempt > MAX_RETRY_ATTEMPTS {
                    tracing::error!(session_id = %session_id, "giving up on session load after repeated failures");
                    return;
                }
                let delay = INITIAL_RETRY_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
                match backend.load(&session_id).await {
                    Ok(Some(state)) => {
                        cache.insert(session_id.clone(), state);
                        tracing::info!(session_id = %session_id, attempt, "session store recovered, repopulated cache");
                        return;
                    }
                    Ok(None) => {
                        tracing::info!(session_id = %session_id, attempt, "session store recovered, no persisted state found");
                        return;
                    }
                    Err(e) if classify(&e) == RetryClass::Permanent => {
                        tracing::error!(session_id = %session_id, attempt, error = %e, "permanent error loading session, giving up");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, attempt, error = %e, "retry attempt failed");
                    }
                }
            }
        });
    }

    /// Drops L1 entries whose `last_activity` is older than `max_age`. The
    /// L2 entry is left untouched.
    pub fn evict_inactive(&self, now_ms: i64, max_age: Duration) {
        let cutoff = now_ms - max_age.as_millis() as i64;
        self.cache.retain(|_, state| state.last_activity >= cutoff);
    }

    /// Flushes every cached session to L2 once. Meant to run on process
    /// shutdown so a pending write-behind retry doesn't get silently
    /// dropped when the process exits before its backoff delay elapses.
    pub async fn drain(&self) {
        let states: Vec<SessionState> = self.cache.iter().map(|entry| entry.value().clone()).collect();
        for state in states {
            if let Err(e) = self.backend.save(&state).await {
                tracing::error!(session_id = %state.session_id, error = %e, "final shutdown flush failed");
            }
        }
    }
}

/// Spawns the periodic L1 eviction sweep on the given store. The ticker
/// runs at the same cadence as `max_age` halved (capped at one hour) so a
/// session is never more than half its own eviction window past due.
pub fn spawn_eviction_sweep(store: Arc<SessionStore>, max_age: Duration) -> tokio::task::JoinHandle<()> {
    let tick = (max_age / 2).min(Duration::from_secs(3600)).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let now_ms = crate::fsm::now_ms();
            store.evict_inactive(now_ms, max_age);
        }
    })
}
