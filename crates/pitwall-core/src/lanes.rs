//! Lane registry: which check tools exist in this project.
//!
//! A lane is installed when an executable wrapper named after it sits in
//! the `.taskgraph/` directory. The registry is probed fresh on every
//! invocation, so dropping a wrapper in (or deleting one) takes effect
//! immediately without any registration step.

use crate::paths;
use crate::policy::Policy;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const BASELINE_LANE: &str = "core";
pub const UX_LANE: &str = "ux";
pub const REBUILD_LANE: &str = "rebuild";
pub const HEAL_LANE: &str = "heal";

pub const OPTIONAL_LANES: &[&str] = &[
    "spec", "data", "arch", "deps", "ux", "heal", "yagni", "rebuild",
];

const ALL_LANES: &[&str] = &[
    "core", "spec", "data", "arch", "deps", "ux", "heal", "yagni", "rebuild",
];

pub fn all_lane_names() -> &'static [&'static str] {
    ALL_LANES
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneDescriptor {
    pub name: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_path: Option<PathBuf>,
    pub order_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneRegistry {
    pub lanes: Vec<LaneDescriptor>,
}

impl LaneRegistry {
    /// Probe `.taskgraph/<lane>` wrappers, ordered baseline-first then by
    /// policy order.
    pub fn discover(graph_dir: &Path, policy: &Policy) -> Self {
        let mut lanes = Vec::new();
        let ordered = std::iter::once(BASELINE_LANE.to_string())
            .chain(policy.ordered_optional_lanes());
        for (order_index, name) in ordered.enumerate() {
            let path = paths::lane_wrapper_path(graph_dir, &name);
            let installed = path.is_file();
            lanes.push(LaneDescriptor {
                name,
                installed,
                command_path: installed.then_some(path),
                order_index,
            });
        }
        Self { lanes }
    }

    /// Build a registry from explicit (name, command) pairs, ordered as
    /// given. Used by tests and canned runners.
    pub fn fixed(entries: &[(&str, Option<&Path>)]) -> Self {
        let lanes = entries
            .iter()
            .enumerate()
            .map(|(order_index, (name, path))| LaneDescriptor {
                name: (*name).to_string(),
                installed: path.is_some(),
                command_path: path.map(Path::to_path_buf),
                order_index,
            })
            .collect();
        Self { lanes }
    }

    pub fn get(&self, name: &str) -> Option<&LaneDescriptor> {
        self.lanes.iter().find(|l| l.name == name)
    }

    pub fn baseline(&self) -> Option<&LaneDescriptor> {
        self.get(BASELINE_LANE)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.get(name).map(|l| l.installed).unwrap_or(false)
    }

    /// Installed optional lanes in registry order.
    pub fn installed_optional(&self) -> impl Iterator<Item = &LaneDescriptor> {
        self.lanes
            .iter()
            .filter(|l| l.installed && l.name != BASELINE_LANE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discover_probes_wrappers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("core"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("spec"), "#!/bin/sh\n").unwrap();

        let registry = LaneRegistry::discover(dir.path(), &Policy::default());
        assert!(registry.is_installed("core"));
        assert!(registry.is_installed("spec"));
        assert!(!registry.is_installed("ux"));
        assert_eq!(registry.baseline().unwrap().order_index, 0);
    }

    #[test]
    fn discover_honors_policy_order() {
        let dir = TempDir::new().unwrap();
        let mut policy = Policy::default();
        policy.order = vec!["core".into(), "ux".into(), "spec".into()];
        let registry = LaneRegistry::discover(dir.path(), &policy);
        let names: Vec<&str> = registry.lanes.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(&names[..3], &["core", "ux", "spec"]);
        assert_eq!(names.len(), 1 + OPTIONAL_LANES.len());
    }

    #[test]
    fn installed_optional_excludes_baseline() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("core"), "").unwrap();
        std::fs::write(dir.path().join("deps"), "").unwrap();
        let registry = LaneRegistry::discover(dir.path(), &Policy::default());
        let names: Vec<&str> = registry
            .installed_optional()
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(names, vec!["deps"]);
    }
}
