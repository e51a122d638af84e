//! Endpoint registry: a read-only catalog of external knowledge endpoints,
//! tagged by category and role affinity. Loaded once at startup.

use crate::roles::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
    pub category: String,
    pub role_affinity: HashSet<Role>,
    pub auth_hint: Option<String>,
    pub confidence_weight: f64,
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<EndpointDescriptor>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self { endpoints }
    }

    /// Bundled defaults, optionally overlaid with entries read from a JSON
    /// file (a top-level array of `EndpointDescriptor`). A file entry whose
    /// `id` matches a bundled default replaces it; new ids are appended.
    /// A missing or unreadable path is not an error — the bundled set is
    /// used as-is and a warning is logged.
    pub fn load(config_path: Option<&str>) -> Self {
        let mut endpoints = bundled_defaults();

        if let Some(path) = config_path {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<Vec<EndpointDescriptor>>(&raw) {
                    Ok(overlay) => {
                        for entry in overlay {
                            if let Some(existing) = endpoints.iter_mut().find(|e| e.id == entry.id) {
                                *existing = entry;
                            } else {
                                endpoints.push(entry);
                            }
                        }
                    }
                    Err(e) => tracing::warn!(path, error = %e, "failed to parse endpoint registry overlay, using bundled defaults only"),
                },
                Err(e) => tracing::warn!(path, error = %e, "failed to read endpoint registry overlay, using bundled defaults only"),
            }
        }

        Self { endpoints }
    }

    /// Up to `limit` endpoints affine to `role`, sorted by confidence weight
    /// descending, ties broken by id ascending.
    pub fn select_by_role(&self, role: Role, limit: usize) -> Vec<&EndpointDescriptor> {
        let mut matches: Vec<&EndpointDescriptor> = self
            .endpoints
            .iter()
            .filter(|e| e.role_affinity.contains(&role))
            .collect();
        matches.sort_by(|a, b| {
            b.confidence_weight
                .partial_cmp(&a.confidence_weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(limit);
        matches
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// The registry ships with no hardcoded endpoints — which endpoints exist is
/// a deployment concern, supplied entirely through the `ENDPOINT_REGISTRY_PATH`
/// overlay. This function is the seam a deployment-specific build would use
/// to compile in a fixed catalog instead.
fn bundled_defaults() -> Vec<EndpointDescriptor> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str, weight: f64, roles: &[Role]) -> EndpointDescriptor {
        EndpointDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://{id}.example/api"),
            category: "test".to_string(),
            role_affinity: roles.iter().copied().collect(),
            auth_hint: None,
            confidence_weight: weight,
        }
    }

    #[test]
    fn selects_only_affine_endpoints_sorted_by_weight() {
        let reg = EndpointRegistry::new(vec![
            ep("a", 0.5, &[Role::Analyzer]),
            ep("b", 0.9, &[Role::Analyzer]),
            ep("c", 0.8, &[Role::Coder]),
        ]);
        let selected = reg.select_by_role(Role::Analyzer, 3);
        assert_eq!(selected.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn ties_broken_lexicographically() {
        let reg = EndpointRegistry::new(vec![
            ep("z", 0.5, &[Role::Researcher]),
            ep("a", 0.5, &[Role::Researcher]),
        ]);
        let selected = reg.select_by_role(Role::Researcher, 3);
        assert_eq!(selected.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "z"]);
    }

    #[test]
    fn respects_limit() {
        let reg = EndpointRegistry::new(vec![
            ep("a", 0.1, &[Role::Researcher]),
            ep("b", 0.2, &[Role::Researcher]),
            ep("c", 0.3, &[Role::Researcher]),
        ]);
        assert_eq!(reg.select_by_role(Role::Researcher, 2).len(), 2);
    }

    #[test]
    fn empty_for_unaffine_role() {
        let reg = EndpointRegistry::new(vec![ep("a", 0.5, &[Role::Coder])]);
        assert!(reg.select_by_role(Role::UiRefiner, 3).is_empty());
    }

    #[test]
    fn load_with_missing_overlay_path_falls_back_to_bundled_defaults() {
        let reg = EndpointRegistry::load(Some("/nonexistent/path/registry.json"));
        assert_eq!(reg.len(), bundled_defaults().len());
    }

    #[test]
    fn load_overlays_endpoints_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            serde_json::to_string(&vec![ep("overlay-a", 0.7, &[Role::Researcher])]).unwrap(),
        )
        .unwrap();
        let reg = EndpointRegistry::load(Some(path.to_str().unwrap()));
        assert_eq!(reg.select_by_role(Role::Researcher, 5).len(), 1);
    }
}
