//! Lane selection: which checks run for a given task.
//!
//! Escalation to the full suite is a pure function of the parsed fences
//! and contract, never of run history, so the same task text always
//! yields the same plan.

use crate::fence::{FenceOutcome, LaneConfig, TaskFences};
use crate::lanes::{LaneRegistry, BASELINE_LANE, REBUILD_LANE};
use serde::Serialize;
use std::collections::BTreeMap;

pub const FULL_SUITE_MAX_FILES: i64 = 30;
pub const FULL_SUITE_MAX_LOC: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Auto,
    Fences,
    All,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Auto => "auto",
            Strategy::Fences => "fences",
            Strategy::All => "all",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = crate::error::PitwallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Strategy::Auto),
            "fences" => Ok(Strategy::Fences),
            "all" => Ok(Strategy::All),
            other => Err(crate::error::PitwallError::InvalidStrategy(
                other.to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LanePlan {
    pub strategy: Strategy,
    pub full_suite: bool,
    pub full_suite_reasons: Vec<String>,
    /// Lanes to execute, baseline first, registry order.
    pub selected: Vec<String>,
    pub lane_reasons: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

pub fn select_lanes(
    fences: &TaskFences,
    registry: &LaneRegistry,
    strategy: Strategy,
) -> LanePlan {
    let mut reasons: BTreeMap<String, String> = BTreeMap::new();
    reasons.insert(BASELINE_LANE.to_string(), "baseline".to_string());

    for lane in registry.lanes.iter().filter(|l| l.name != BASELINE_LANE) {
        match fences.lane(&lane.name) {
            FenceOutcome::Valid(LaneConfig::Raw { .. }) | FenceOutcome::Absent => {}
            FenceOutcome::Valid(_) => {
                reasons.insert(lane.name.clone(), "task fence".to_string());
            }
            FenceOutcome::Invalid { .. } => {}
        }
    }

    let (full_suite, full_suite_reasons) = match strategy {
        Strategy::Fences => (false, Vec::new()),
        Strategy::All => (true, vec!["lane strategy forced all lanes".to_string()]),
        Strategy::Auto => full_suite_signals(fences),
    };

    if full_suite {
        for lane in registry.lanes.iter().filter(|l| l.name != BASELINE_LANE) {
            reasons
                .entry(lane.name.clone())
                .and_modify(|r| *r = format!("{r} + full suite"))
                .or_insert_with(|| "full suite".to_string());
        }
    }

    let mut selected = Vec::new();
    let mut warnings = Vec::new();
    for lane in &registry.lanes {
        if !reasons.contains_key(&lane.name) {
            continue;
        }
        if !lane.installed {
            warnings.push(format!("lane {} selected but not installed", lane.name));
            continue;
        }
        selected.push(lane.name.clone());
    }

    LanePlan {
        strategy,
        full_suite,
        full_suite_reasons,
        selected,
        lane_reasons: reasons,
        warnings,
    }
}

/// Elevated-complexity signals in the task contract that escalate an auto
/// plan to the full suite.
fn full_suite_signals(fences: &TaskFences) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if let Some(contract) = fences.valid_contract() {
        if let Some(mode) = contract.mode.as_deref() {
            if mode == "rebuild" || mode == "migration" {
                reasons.push(format!("contract mode {mode}"));
            }
        }
        if let Some(n) = contract.max_files {
            if n >= FULL_SUITE_MAX_FILES {
                reasons.push(format!("contract max_files={n}"));
            }
        }
        if let Some(n) = contract.max_loc {
            if n >= FULL_SUITE_MAX_LOC {
                reasons.push(format!("contract max_loc={n}"));
            }
        }
    }
    if fences.valid_lane(REBUILD_LANE).is_some() {
        reasons.push("rebuild fence declared".to_string());
    }

    (!reasons.is_empty(), reasons)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::parse_fences;
    use std::path::Path;

    fn full_registry() -> LaneRegistry {
        let bin = Path::new("/bin/true");
        LaneRegistry::fixed(&[
            ("core", Some(bin)),
            ("spec", Some(bin)),
            ("data", Some(bin)),
            ("arch", Some(bin)),
            ("deps", Some(bin)),
            ("ux", Some(bin)),
            ("heal", Some(bin)),
            ("yagni", Some(bin)),
            ("rebuild", Some(bin)),
        ])
    }

    #[test]
    fn no_fences_auto_selects_baseline_only() {
        let plan = select_lanes(&parse_fences("plain task"), &full_registry(), Strategy::Auto);
        assert_eq!(plan.selected, vec!["core"]);
        assert!(!plan.full_suite);
    }

    #[test]
    fn valid_fence_selects_lane_in_order() {
        let fences = parse_fences("```ux\nschema = 1\nurl = \"http://x\"\n```\n```spec\nschema = 1\n```\n");
        let plan = select_lanes(&fences, &full_registry(), Strategy::Auto);
        assert_eq!(plan.selected, vec!["core", "spec", "ux"]);
    }

    #[test]
    fn invalid_fence_is_not_selected() {
        let fences = parse_fences("```spec\nno schema here\n```\n");
        let plan = select_lanes(&fences, &full_registry(), Strategy::Auto);
        assert_eq!(plan.selected, vec!["core"]);
    }

    #[test]
    fn all_strategy_forces_full_suite() {
        let plan = select_lanes(&parse_fences(""), &full_registry(), Strategy::All);
        assert!(plan.full_suite);
        assert_eq!(plan.selected.len(), 9);
        assert_eq!(plan.selected[0], "core");
    }

    #[test]
    fn fences_strategy_never_escalates() {
        let fences = parse_fences("```contract\nschema = 1\nmax_files = 80\n```\n");
        let plan = select_lanes(&fences, &full_registry(), Strategy::Fences);
        assert!(!plan.full_suite);
        assert_eq!(plan.selected, vec!["core"]);
    }

    #[test]
    fn auto_escalates_on_contract_signals() {
        for desc in [
            "```contract\nschema = 1\nmode = \"rebuild\"\n```\n",
            "```contract\nschema = 1\nmode = \"migration\"\n```\n",
            "```contract\nschema = 1\nmax_files = 30\n```\n",
            "```contract\nschema = 1\nmax_loc = 1000\n```\n",
            "```rebuild\nschema = 1\n```\n",
        ] {
            let plan = select_lanes(&parse_fences(desc), &full_registry(), Strategy::Auto);
            assert!(plan.full_suite, "expected full suite for: {desc}");
            assert_eq!(plan.selected.len(), 9);
        }
    }

    #[test]
    fn below_threshold_contract_stays_small() {
        let fences = parse_fences("```contract\nschema = 1\nmax_files = 29\nmax_loc = 999\n```\n");
        let plan = select_lanes(&fences, &full_registry(), Strategy::Auto);
        assert!(!plan.full_suite);
    }

    #[test]
    fn fenced_but_uninstalled_lane_is_a_warning() {
        let bin = Path::new("/bin/true");
        let registry = LaneRegistry::fixed(&[("core", Some(bin)), ("spec", None)]);
        let fences = parse_fences("```spec\nschema = 1\n```\n");
        let plan = select_lanes(&fences, &registry, Strategy::Auto);
        assert_eq!(plan.selected, vec!["core"]);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("spec"));
    }
}
