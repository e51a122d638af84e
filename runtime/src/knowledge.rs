//! Knowledge phase orchestrator: selects endpoints, fans out fetches with
//! bounded concurrency, filters by confidence and synthesizes a single
//! answer with an aggregate confidence score.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::fetcher::{FetchResult, HttpFetcher};
use crate::registry::EndpointRegistry;
use crate::roles::Role;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageMetrics {
    pub endpoints_discovered: usize,
    pub endpoints_queried: usize,
    pub successful: usize,
    pub total_duration_ms: u64,
    pub synthesis_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeResult {
    pub answer: String,
    pub confidence: f64,
    pub contradictions: Vec<String>,
    pub metrics: UsageMetrics,
}

pub struct KnowledgeOrchestrator<'a> {
    pub registry: &'a EndpointRegistry,
    pub fetcher: &'a HttpFetcher,
    pub config: &'a Config,
}

impl<'a> KnowledgeOrchestrator<'a> {
    pub fn new(registry: &'a EndpointRegistry, fetcher: &'a HttpFetcher, config: &'a Config) -> Self {
        Self { registry, fetcher, config }
    }

    /// Entry point. `session_workspace` is the per-session directory the
    /// agent may have already written a `synthesized_knowledge.md` into.
    pub async fn gather(&self, objective: &str, role: Role, session_workspace: &Path) -> KnowledgeResult {
        if let Some(pre) = read_preexisting_synthesis(session_workspace) {
            return KnowledgeResult {
                answer: pre,
                confidence: 1.0,
                contradictions: vec![],
                metrics: UsageMetrics { synthesis_confidence: 1.0, ..Default::default() },
            };
        }

        let start = std::time::Instant::now();
        let endpoints = self.registry.select_by_role(role, 3);
        if endpoints.is_empty() {
            tracing::info!(objective, role = role.as_str(), "no endpoints affine to role");
            return KnowledgeResult {
                answer: "no relevant endpoints".to_string(),
                confidence: 0.0,
                contradictions: vec![],
                metrics: UsageMetrics { endpoints_discovered: 0, ..Default::default() },
            };
        }

        let per_task_timeout = Duration::from_millis(self.config.knowledge.timeout_ms);
        let overall_deadline = per_task_timeout * endpoints.len() as u32 + Duration::from_millis(1000);
        let semaphore = Semaphore::new(self.config.knowledge.max_concurrency);

        let fetches = endpoints.iter().map(|ep| {
            let sem = &semaphore;
            async move {
                let _permit = sem.acquire().await.expect("semaphore not closed");
                self.fetcher.fetch(&ep.id, &ep.url, ep.confidence_weight, per_task_timeout).await
            }
        });

        let results = match tokio::time::timeout(overall_deadline, futures::future::join_all(fetches)).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!("knowledge gather deadline exceeded, using partial results");
                vec![]
            }
        };

        let threshold = self.config.knowledge.confidence_threshold;
        let mut surviving: Vec<FetchResult> = results
            .into_iter()
            .filter(|r| r.ok && r.confidence >= threshold)
            .collect();
        surviving.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

        let contradictions = detect_contradictions(&surviving);
        let answer = synthesize(&surviving, self.config.knowledge.max_response_size);
        let confidence = aggregate_confidence(&surviving);

        KnowledgeResult {
            answer,
            confidence,
            contradictions,
            metrics: UsageMetrics {
                endpoints_discovered: endpoints.len(),
                endpoints_queried: endpoints.len(),
                successful: surviving.len(),
                total_duration_ms: start.elapsed().as_millis() as u64,
                synthesis_confidence: confidence,
            },
        }
    }
}

fn read_preexisting_synthesis(session_workspace: &Path) -> Option<String> {
    let path = session_workspace.join("synthesized_knowledge.md");
    std::fs::read_to_string(path).ok()
}

fn synthesize(results: &[FetchResult], max_chars: usize) -> String {
    let mut out = String::new();
    for r in results {
        if out.chars().count() >= max_chars {
            break;
        }
        out.push_str(&format!("[{}] ", r.endpoint_id));
        out.push_str(&r.body);
        out.push('\n');
    }
    out.chars().take(max_chars).collect()
}

fn aggregate_confidence(results: &[FetchResult]) -> f64 {
    let total_weight: usize = results.iter().map(|r| r.body.len().max(1)).sum();
    if total_weight == 0 {
        return 0.0;
    }
    let weighted: f64 = results
        .iter()
        .map(|r| r.confidence * r.body.len().max(1) as f64)
        .sum();
    (weighted / total_weight as f64).clamp(0.0, 1.0)
}

/// Pairwise scan for endpoints reporting a different number after the same
/// keyword — a deliberately loose cross-validation heuristic.
fn detect_contradictions(results: &[FetchResult]) -> Vec<String> {
    let mut tokens_by_endpoint: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for r in results {
        tokens_by_endpoint.push((r.endpoint_id.clone(), keyword_number_pairs(&r.body)));
    }

    let mut contradictions = Vec::new();
    for i in 0..tokens_by_endpoint.len() {
        for j in (i + 1)..tokens_by_endpoint.len() {
            let (id_a, pairs_a) = &tokens_by_endpoint[i];
            let (id_b, pairs_b) = &tokens_by_endpoint[j];
            for (kw_a, num_a) in pairs_a {
                for (kw_b, num_b) in pairs_b {
                    if kw_a == kw_b && num_a != num_b {
                        contradictions.push(format!("{id_a} vs {id_b}: '{kw_a}' {num_a} != {num_b}"));
                    }
                }
            }
        }
    }
    contradictions
}

fn keyword_number_pairs(body: &str) -> Vec<(String, String)> {
    let words: Vec<&str> = body.split_whitespace().collect();
    let mut pairs = Vec::new();
    for pair in words.windows(2) {
        let (kw, maybe_num) = (pair[0], pair[1]);
        if maybe_num.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            pairs.push((kw.to_lowercase(), maybe_num.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.').to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, body: &str, confidence: f64) -> FetchResult {
        FetchResult {
            endpoint_id: id.to_string(),
            ok: true,
            body: body.to_string(),
            duration_ms: 10,
            confidence,
            error: None,
        }
    }

    #[test]
    fn synthesize_concatenates_in_given_order_and_caps_length() {
        let results = vec![result("a", "alpha body", 0.9), result("b", "beta body", 0.5)];
        let out = synthesize(&results, 15);
        assert_eq!(out.chars().count(), 15);
    }

    #[test]
    fn aggregate_confidence_is_length_weighted() {
        let results = vec![result("a", "x", 1.0), result("b", &"y".repeat(9), 0.0)];
        let conf = aggregate_confidence(&results);
        assert!(conf < 0.2, "long low-confidence body should dominate: {conf}");
    }

    #[test]
    fn detects_conflicting_numeric_claims_for_same_keyword() {
        let results = vec![result("a", "revenue 500 units", 0.9), result("b", "revenue 700 units", 0.9)];
        let contradictions = detect_contradictions(&results);
        assert_eq!(contradictions.len(), 1);
        assert!(contradictions[0].contains("revenue"));
    }

    #[test]
    fn no_contradiction_when_numbers_agree() {
        let results = vec![result("a", "revenue 500 units", 0.9), result("b", "revenue 500 dollars", 0.9)];
        assert!(detect_contradictions(&results).is_empty());
    }
}
