//! Orchestration policy: `.taskgraph/pitwall-policy.toml`.
//!
//! Loading is fail-open: a missing or unreadable file yields the default
//! policy, so a damaged config degrades behavior instead of halting checks.
//! The policy is loaded once per invocation and never mutated.

use crate::error::Result;
use crate::io::write_if_missing;
use crate::lanes::{BASELINE_LANE, HEAL_LANE, OPTIONAL_LANES};
use crate::paths;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

pub const SUPPORTED_SCHEMA: i64 = 1;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Observe,
    Advise,
    #[default]
    Redirect,
    Heal,
    Breaker,
}

impl Mode {
    /// Unknown mode strings fall back to redirect rather than failing the
    /// whole policy file.
    pub fn parse(raw: &str) -> Mode {
        match raw.trim().to_ascii_lowercase().as_str() {
            "observe" => Mode::Observe,
            "advise" => Mode::Advise,
            "redirect" => Mode::Redirect,
            "heal" => Mode::Heal,
            "breaker" => Mode::Breaker,
            _ => Mode::Redirect,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Observe => "observe",
            Mode::Advise => "advise",
            Mode::Redirect => "redirect",
            Mode::Heal => "heal",
            Mode::Breaker => "breaker",
        }
    }

    /// Per-lane effect flags under this mode.
    pub fn effect_flags(self, lane: &str) -> EffectFlags {
        match self {
            Mode::Observe => EffectFlags {
                write_log: false,
                create_followups: false,
            },
            Mode::Advise | Mode::Breaker => EffectFlags {
                write_log: true,
                create_followups: false,
            },
            Mode::Redirect => EffectFlags {
                write_log: true,
                create_followups: true,
            },
            Mode::Heal => EffectFlags {
                write_log: true,
                create_followups: lane == HEAL_LANE,
            },
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(de)?;
        Ok(Mode::parse(&raw))
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectFlags {
    pub write_log: bool,
    pub create_followups: bool,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_schema")]
    pub schema: i64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_order")]
    pub order: Vec<String>,
    #[serde(default)]
    pub recursion: RecursionPolicy,
    #[serde(default)]
    pub loop_safety: LoopSafetyPolicy,
    #[serde(default)]
    pub updates: UpdatesPolicy,
    #[serde(default)]
    pub contracts: ContractsPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursionPolicy {
    pub cooldown_seconds: i64,
    pub max_auto_actions_per_hour: i64,
    pub require_new_evidence: bool,
    pub max_auto_depth: i64,
    pub circuit_breaker_after: i64,
}

impl Default for RecursionPolicy {
    fn default() -> Self {
        Self {
            cooldown_seconds: 1800,
            max_auto_actions_per_hour: 2,
            require_new_evidence: true,
            max_auto_depth: 2,
            circuit_breaker_after: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSafetyPolicy {
    pub max_rebuild_depth: i64,
    pub max_ready_followups: i64,
    pub block_followup_creation: bool,
}

impl Default for LoopSafetyPolicy {
    fn default() -> Self {
        Self {
            max_rebuild_depth: 2,
            max_ready_followups: 20,
            block_followup_creation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesPolicy {
    pub enabled: bool,
    pub check_interval_seconds: i64,
    pub create_followup: bool,
}

impl Default for UpdatesPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 21600,
            create_followup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsPolicy {
    pub auto_ensure: bool,
}

impl Default for ContractsPolicy {
    fn default() -> Self {
        Self { auto_ensure: true }
    }
}

fn default_schema() -> i64 {
    1
}

fn default_order() -> Vec<String> {
    std::iter::once(BASELINE_LANE)
        .chain(OPTIONAL_LANES.iter().copied())
        .map(str::to_string)
        .collect()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            schema: 1,
            mode: Mode::Redirect,
            order: default_order(),
            recursion: RecursionPolicy::default(),
            loop_safety: LoopSafetyPolicy::default(),
            updates: UpdatesPolicy::default(),
            contracts: ContractsPolicy::default(),
        }
    }
}

impl Policy {
    /// Load the policy from `.taskgraph/pitwall-policy.toml`. Missing or
    /// unparseable files degrade to defaults.
    pub fn load(graph_dir: &Path) -> Policy {
        let path = paths::policy_path(graph_dir);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Policy::default();
        };
        match toml::from_str::<Policy>(&text) {
            Ok(policy) => policy.normalized(),
            Err(_) => Policy::default(),
        }
    }

    /// Write the default policy file if absent. Returns true if written.
    pub fn ensure(graph_dir: &Path) -> Result<bool> {
        write_if_missing(
            &paths::policy_path(graph_dir),
            default_policy_text().as_bytes(),
        )
    }

    /// Clamp numeric fields and repair the lane order: baseline stays
    /// first, unknown entries are kept, missing defaults are appended.
    fn normalized(mut self) -> Policy {
        self.recursion.cooldown_seconds = self.recursion.cooldown_seconds.max(0);
        self.recursion.max_auto_actions_per_hour = self.recursion.max_auto_actions_per_hour.max(0);
        self.recursion.max_auto_depth = self.recursion.max_auto_depth.max(1);
        self.recursion.circuit_breaker_after = self.recursion.circuit_breaker_after.max(1);
        self.loop_safety.max_rebuild_depth = self.loop_safety.max_rebuild_depth.max(0);
        self.loop_safety.max_ready_followups = self.loop_safety.max_ready_followups.max(0);
        self.updates.check_interval_seconds = self.updates.check_interval_seconds.max(0);

        let mut order: Vec<String> = self
            .order
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(pos) = order.iter().position(|l| l == BASELINE_LANE) {
            order.remove(pos);
        }
        order.insert(0, BASELINE_LANE.to_string());
        for lane in OPTIONAL_LANES {
            if !order.iter().any(|l| l == lane) {
                order.push((*lane).to_string());
            }
        }
        self.order = order;
        self
    }

    /// Optional lanes in policy order, unlisted known lanes appended.
    pub fn ordered_optional_lanes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for lane in &self.order {
            if OPTIONAL_LANES.contains(&lane.as_str()) && !out.contains(lane) {
                out.push(lane.clone());
            }
        }
        for lane in OPTIONAL_LANES {
            if !out.iter().any(|l| l == lane) {
                out.push((*lane).to_string());
            }
        }
        out
    }

    /// Position of a lane in policy order, used for queue ranking.
    pub fn lane_rank(&self, lane: &str) -> usize {
        self.order
            .iter()
            .position(|l| l == lane)
            .unwrap_or(self.order.len())
    }
}

fn default_policy_text() -> String {
    let order = default_order()
        .iter()
        .map(|l| format!("\"{l}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "schema = 1\n\
         mode = \"redirect\"\n\
         order = [{order}]\n\
         \n\
         [recursion]\n\
         cooldown_seconds = 1800\n\
         max_auto_actions_per_hour = 2\n\
         require_new_evidence = true\n\
         max_auto_depth = 2\n\
         circuit_breaker_after = 3\n\
         \n\
         [contracts]\n\
         auto_ensure = true\n\
         \n\
         [updates]\n\
         enabled = true\n\
         check_interval_seconds = 21600\n\
         create_followup = false\n\
         \n\
         [loop_safety]\n\
         max_rebuild_depth = 2\n\
         max_ready_followups = 20\n\
         block_followup_creation = true\n"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
