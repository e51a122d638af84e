//! Completion validator: decides whether VERIFY may advance to DONE, or
//! which phase to roll back to and how far.

use serde::Serialize;

use crate::config::ThresholdConfig;
use crate::types::{Phase, Priority, Todo, TodoStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
    pub completion_pct: f64,
    pub critical_done: usize,
    pub critical_total: usize,
}

pub fn validate(
    todos: &[Todo],
    reasoning_effectiveness: f64,
    verification_passed_claim: bool,
    thresholds: &ThresholdConfig,
) -> ValidationOutcome {
    let total = todos.len();
    let completed = todos.iter().filter(|t| t.status == TodoStatus::Completed).count();
    let completion_pct = if total == 0 { 100.0 } else { (completed as f64 / total as f64 * 100.0).round() };

    let critical: Vec<&Todo> = todos.iter().filter(|t| t.is_critical()).collect();
    let critical_total = critical.len();
    let critical_done = critical.iter().filter(|t| t.status == TodoStatus::Completed).count();

    let mut outcome = ValidationOutcome {
        valid: false,
        reason: None,
        completion_pct,
        critical_done,
        critical_total,
    };

    if critical_done < critical_total {
        outcome.reason = Some(format!("{}/{} critical tasks incomplete", critical_total - critical_done, critical_total));
        return outcome;
    }
    if completion_pct < thresholds.verification_completion_threshold {
        outcome.reason = Some(format!("completion {completion_pct}% below threshold {}%", thresholds.verification_completion_threshold));
        return outcome;
    }
    if todos.iter().any(|t| t.priority == Priority::High && t.status == TodoStatus::Pending) {
        outcome.reason = Some("a high-priority task is still pending".to_string());
        return outcome;
    }
    if todos.iter().any(|t| t.status == TodoStatus::InProgress) {
        outcome.reason = Some("a task is still in progress".to_string());
        return outcome;
    }
    if reasoning_effectiveness < thresholds.execution_success_rate_threshold {
        outcome.reason = Some(format!(
            "reasoning effectiveness {reasoning_effectiveness} below threshold {}",
            thresholds.execution_success_rate_threshold
        ));
        return outcome;
    }
    if !verification_passed_claim {
        outcome.reason = Some("agent did not claim verification passed".to_string());
        return outcome;
    }

    outcome.valid = true;
    outcome
}

/// Where VERIFY rolls back to when validation fails, and the new task index.
pub fn rollback_target(completion_pct: f64, current_task_index: usize) -> (Phase, usize) {
    if completion_pct < 50.0 {
        (Phase::Plan, 0)
    } else if completion_pct < 80.0 {
        (Phase::Execute, current_task_index)
    } else {
        (Phase::Execute, current_task_index.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo(id: &str, status: TodoStatus, priority: Priority) -> Todo {
        Todo { id: id.to_string(), content: "x".to_string(), status, priority }
    }

    #[test]
    fn empty_todo_list_is_100_percent() {
        let thresholds = ThresholdConfig::default();
        let outcome = validate(&[], 0.9, true, &thresholds);
        assert!(outcome.valid);
        assert_eq!(outcome.completion_pct, 100.0);
    }

    #[test]
    fn fails_when_high_priority_pending() {
        let todos = vec![todo("t1", TodoStatus::Pending, Priority::High)];
        let thresholds = ThresholdConfig::default();
        let outcome = validate(&todos, 0.9, true, &thresholds);
        assert!(!outcome.valid);
    }

    #[test]
    fn fails_when_below_completion_threshold() {
        let todos = vec![
            todo("t1", TodoStatus::Completed, Priority::Low),
            todo("t2", TodoStatus::Pending, Priority::Low),
        ];
        let thresholds = ThresholdConfig::default();
        let outcome = validate(&todos, 0.9, true, &thresholds);
        assert!(!outcome.valid);
        assert_eq!(outcome.completion_pct, 50.0);
    }

    #[test]
    fn rollback_to_plan_below_50() {
        assert_eq!(rollback_target(20.0, 3), (Phase::Plan, 0));
    }

    #[test]
    fn rollback_to_execute_keeps_index_in_mid_band() {
        assert_eq!(rollback_target(60.0, 3), (Phase::Execute, 3));
    }

    #[test]
    fn rollback_to_execute_decrements_in_high_band() {
        assert_eq!(rollback_target(85.0, 3), (Phase::Execute, 2));
    }

    #[test]
    fn rollback_index_floors_at_zero() {
        assert_eq!(rollback_target(90.0, 0), (Phase::Execute, 0));
    }

    #[test]
    fn valid_when_everything_completed_and_claimed() {
        let todos = vec![todo("t1", TodoStatus::Completed, Priority::High)];
        let thresholds = ThresholdConfig::default();
        let outcome = validate(&todos, 0.9, true, &thresholds);
        assert!(outcome.valid);
    }
}
