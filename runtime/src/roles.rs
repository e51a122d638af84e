//! Static role configuration table.
//!
//! Each role is an immutable cognitive profile that shapes the prompt the
//! external agent receives. Grounded in the built-in-role-table pattern: a
//! tagged enum plus a static map from tag to configuration record, rather
//! than free-form strings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Coder,
    Critic,
    Researcher,
    Analyzer,
    Synthesizer,
    UiArchitect,
    UiImplementer,
    UiRefiner,
}

impl Role {
    pub const ALL: [Role; 9] = [
        Role::Planner,
        Role::Coder,
        Role::Critic,
        Role::Researcher,
        Role::Analyzer,
        Role::Synthesizer,
        Role::UiArchitect,
        Role::UiImplementer,
        Role::UiRefiner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Coder => "coder",
            Role::Critic => "critic",
            Role::Researcher => "researcher",
            Role::Analyzer => "analyzer",
            Role::Synthesizer => "synthesizer",
            Role::UiArchitect => "ui_architect",
            Role::UiImplementer => "ui_implementer",
            Role::UiRefiner => "ui_refiner",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Role> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Role::ALL.into_iter().find(|r| r.as_str() == normalized)
    }

    pub fn config(&self) -> &'static RoleConfig {
        role_table().get(self).expect("every Role has a table entry")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    MultiStep,
    Complex,
}

/// Immutable per-role configuration record.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub role: Role,
    pub default_output: &'static str,
    pub focus: &'static str,
    pub complexity: Complexity,
    pub frameworks: &'static [&'static str],
    pub validation_rules: &'static [&'static str],
    pub thinking_methodology: &'static [&'static str],
    pub authority: &'static str,
}

fn role_table() -> &'static HashMap<Role, RoleConfig> {
    static TABLE: OnceLock<HashMap<Role, RoleConfig>> = OnceLock::new();
    TABLE.get_or_init(build_role_table)
}

fn build_role_table() -> HashMap<Role, RoleConfig> {
    let mut t = HashMap::new();

    t.insert(
        Role::Planner,
        RoleConfig {
            role: Role::Planner,
            default_output: "structured task breakdown",
            focus: "decomposition and sequencing",
            complexity: Complexity::MultiStep,
            frameworks: &["work breakdown structure", "dependency graph"],
            validation_rules: &["no_cyclic_dependencies", "every_task_has_owner_role"],
            thinking_methodology: &[
                "identify the smallest set of independent tasks",
                "order tasks by dependency, not by convenience",
                "attach a meta-prompt to every non-trivial task",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::Coder,
        RoleConfig {
            role: Role::Coder,
            default_output: "working code change",
            focus: "implementation correctness",
            complexity: Complexity::MultiStep,
            frameworks: &["test-driven development"],
            validation_rules: &["compiles", "tests_pass"],
            thinking_methodology: &[
                "match the surrounding code's idiom before introducing a new one",
                "prefer the smallest diff that satisfies the task",
            ],
            authority: "executing",
        },
    );

    t.insert(
        Role::Critic,
        RoleConfig {
            role: Role::Critic,
            default_output: "review findings",
            focus: "defect and risk detection",
            complexity: Complexity::Simple,
            frameworks: &["checklist review"],
            validation_rules: &["every_finding_has_a_reproduction"],
            thinking_methodology: &[
                "assume the happy path already works; look for what breaks it",
                "state the concrete failing input, not a vague concern",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::Researcher,
        RoleConfig {
            role: Role::Researcher,
            default_output: "synthesized findings with sources",
            focus: "information gathering",
            complexity: Complexity::Simple,
            frameworks: &["source triangulation"],
            validation_rules: &["claims_cite_a_source"],
            thinking_methodology: &[
                "prefer primary sources over summaries",
                "flag contradictions instead of silently picking a side",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::Analyzer,
        RoleConfig {
            role: Role::Analyzer,
            default_output: "quantitative summary",
            complexity: Complexity::MultiStep,
            focus: "data interpretation",
            frameworks: &["descriptive statistics"],
            validation_rules: &["numbers_trace_to_input_data"],
            thinking_methodology: &[
                "state the method before the number",
                "call out sample-size or data-quality caveats",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::Synthesizer,
        RoleConfig {
            role: Role::Synthesizer,
            default_output: "integrated recommendation",
            focus: "combination and tradeoff resolution",
            complexity: Complexity::Complex,
            frameworks: &["weighted tradeoff matrix"],
            validation_rules: &["tradeoffs_are_named_explicitly"],
            thinking_methodology: &[
                "surface the tension between inputs before resolving it",
                "pick one recommendation, not a menu",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::UiArchitect,
        RoleConfig {
            role: Role::UiArchitect,
            default_output: "component and layout plan",
            focus: "interface structure",
            complexity: Complexity::MultiStep,
            frameworks: &["component hierarchy", "design tokens"],
            validation_rules: &["every_screen_maps_to_a_component"],
            thinking_methodology: &[
                "start from user flow, not from widget catalog",
                "name component boundaries before styling them",
            ],
            authority: "advisory",
        },
    );

    t.insert(
        Role::UiImplementer,
        RoleConfig {
            role: Role::UiImplementer,
            default_output: "working interface code",
            focus: "interface implementation",
            complexity: Complexity::MultiStep,
            frameworks: &["component-driven development"],
            validation_rules: &["renders_without_console_errors"],
            thinking_methodology: &[
                "build the structure before the styling",
                "wire real data before polishing placeholders",
            ],
            authority: "executing",
        },
    );

    t.insert(
        Role::UiRefiner,
        RoleConfig {
            role: Role::UiRefiner,
            default_output: "polish and accessibility fixes",
            focus: "visual and interaction polish",
            complexity: Complexity::Simple,
            frameworks: &["accessibility audit"],
            validation_rules: &["contrast_and_focus_states_checked"],
            thinking_methodology: &[
                "fix consistency issues before adding new visual flourish",
                "verify keyboard and screen-reader paths, not just the mouse path",
            ],
            authority: "executing",
        },
    );

    t
}

/// Deterministic role detection from a free-form objective string.
/// Used as the fallback when the agent hasn't replied to the structured
/// role-selection prompt yet, or replies with something unparseable.
pub fn heuristic(objective: &str) -> Role {
    let lower = objective.to_lowercase();

    if let Some(tag) = extract_tag(&lower, "context") {
        if tag.contains("ui") {
            return ui_sub_role(&lower);
        }
    }

    if let Some(tag) = extract_tag(&lower, "role") {
        if let Some(role) = Role::from_str_loose(&tag) {
            return role;
        }
    }

    if contains_any(&lower, &["plan", "strategy", "design", "architect"]) {
        return Role::Planner;
    }
    if contains_any(&lower, &["implement", "code", "build", "develop", "program"]) {
        return Role::Coder;
    }
    if contains_any(&lower, &["review", "audit", "validate", "security"]) {
        return Role::Critic;
    }
    if contains_any(&lower, &["data", "metrics", "statistics"]) {
        return Role::Analyzer;
    }
    if contains_any(&lower, &["integrate", "combine", "merge", "optimize"]) {
        return Role::Synthesizer;
    }

    Role::Researcher
}

fn ui_sub_role(lower: &str) -> Role {
    if contains_any(lower, &["refine", "polish", "optimize", "styling"]) {
        Role::UiRefiner
    } else if contains_any(lower, &["architect", "design system", "plan"]) {
        Role::UiArchitect
    } else {
        Role::UiImplementer
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Extracts the value of a `(TAG: value)` marker, case-insensitively, from
/// an already-lowercased string. `tag` must itself be lowercase.
fn extract_tag(lower: &str, tag: &str) -> Option<String> {
    let marker = format!("({tag}:");
    let start = lower.find(&marker)? + marker.len();
    let end = lower[start..].find(')')? + start;
    Some(lower[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_a_table_entry() {
        for role in Role::ALL {
            let cfg = role.config();
            assert_eq!(cfg.role, role);
        }
    }

    #[test]
    fn from_str_loose_normalizes_hyphens() {
        assert_eq!(Role::from_str_loose("ui-architect"), Some(Role::UiArchitect));
        assert_eq!(Role::from_str_loose("UI_REFINER"), Some(Role::UiRefiner));
        assert_eq!(Role::from_str_loose("not_a_role"), None);
    }

    #[test]
    fn heuristic_picks_coder_for_implementation_objective() {
        assert_eq!(heuristic("implement a rate limiter for the API"), Role::Coder);
    }

    #[test]
    fn heuristic_picks_analyzer_for_data_objective() {
        assert_eq!(
            heuristic("Analyze CSV sales data and produce insights"),
            Role::Analyzer
        );
    }

    #[test]
    fn heuristic_respects_explicit_role_tag() {
        assert_eq!(heuristic("do the thing (ROLE: critic)"), Role::Critic);
    }

    #[test]
    fn heuristic_routes_ui_context_to_refiner_when_polish_mentioned() {
        assert_eq!(
            heuristic("clean up spacing (CONTEXT: ui polish pass)"),
            Role::UiRefiner
        );
    }

    #[test]
    fn heuristic_defaults_to_researcher() {
        assert_eq!(heuristic("what is the capital of France"), Role::Researcher);
    }
}
