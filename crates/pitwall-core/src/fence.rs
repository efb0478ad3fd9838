//! Fenced config blocks embedded in task descriptions.
//!
//! A fence opens with ```` ```<tag> ```` and closes with ```` ``` ````.
//! Tags naming a lane (or `contract`) carry a TOML body with a mandatory
//! integer `schema` field; anything else is treated as an opaque text
//! block and left alone. Parsing happens fresh on every check, so edits
//! to a task description take effect on the next run. A lane that is not
//! mentioned at all is `Absent`; a lane that is mentioned but malformed
//! is `Invalid` and gets skipped without aborting the run.

use crate::lanes::{all_lane_names, UX_LANE};
use std::collections::BTreeMap;

pub const CONTRACT_TAG: &str = "contract";
pub const SUPPORTED_FENCE_SCHEMA: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum LaneConfig {
    Ux { url: String, pages: Vec<String> },
    Rebuild { mode: Option<String> },
    Generic { table: toml::Table },
    Raw { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FenceOutcome {
    Absent,
    Invalid { reason: String },
    Valid(LaneConfig),
}

impl FenceOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, FenceOutcome::Valid(_))
    }
}

/// Scope limits and intent declared by the task's `contract` fence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskContract {
    pub max_files: Option<i64>,
    pub max_loc: Option<i64>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractOutcome {
    Invalid { reason: String },
    Valid(TaskContract),
}

#[derive(Debug, Clone, Default)]
pub struct TaskFences {
    pub lanes: BTreeMap<String, FenceOutcome>,
    pub contract: Option<ContractOutcome>,
    pub warnings: Vec<String>,
}

impl TaskFences {
    pub fn lane(&self, name: &str) -> &FenceOutcome {
        self.lanes.get(name).unwrap_or(&FenceOutcome::Absent)
    }

    pub fn valid_lane(&self, name: &str) -> Option<&LaneConfig> {
        match self.lane(name) {
            FenceOutcome::Valid(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn valid_contract(&self) -> Option<&TaskContract> {
        match self.contract.as_ref() {
            Some(ContractOutcome::Valid(c)) => Some(c),
            _ => None,
        }
    }

    pub fn has_contract(&self) -> bool {
        self.contract.is_some()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_fences(description: &str) -> TaskFences {
    let mut fences = TaskFences::default();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in description.lines() {
        let trimmed = line.trim();
        match &mut open {
            None => {
                if let Some(rest) = trimmed.strip_prefix("```") {
                    let tag = rest
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    if !tag.is_empty() {
                        open = Some((tag, Vec::new()));
                    }
                }
            }
            Some((tag, body)) => {
                if trimmed == "```" {
                    let text = body.join("\n");
                    record_block(&mut fences, tag, &text);
                    open = None;
                } else {
                    body.push(line);
                }
            }
        }
    }

    if let Some((tag, _)) = open {
        if is_validated_tag(&tag) {
            record_invalid(&mut fences, &tag, "unterminated fence");
        }
    }
    fences
}

fn is_validated_tag(tag: &str) -> bool {
    tag == CONTRACT_TAG || all_lane_names().contains(&tag)
}

fn record_block(fences: &mut TaskFences, tag: &str, body: &str) {
    if tag == CONTRACT_TAG {
        if fences.contract.is_some() {
            fences
                .warnings
                .push("duplicate contract fence ignored".to_string());
            return;
        }
        fences.contract = Some(validate_contract(body));
        return;
    }

    if !all_lane_names().contains(&tag) {
        // Opaque block (code sample, shell transcript): never validated.
        fences.lanes.entry(tag.to_string()).or_insert_with(|| {
            FenceOutcome::Valid(LaneConfig::Raw {
                text: body.to_string(),
            })
        });
        return;
    }

    if fences.lanes.contains_key(tag) {
        fences
            .warnings
            .push(format!("duplicate {tag} fence ignored"));
        return;
    }
    fences
        .lanes
        .insert(tag.to_string(), validate_lane(tag, body));
}

fn record_invalid(fences: &mut TaskFences, tag: &str, reason: &str) {
    if tag == CONTRACT_TAG {
        if fences.contract.is_none() {
            fences.contract = Some(ContractOutcome::Invalid {
                reason: reason.to_string(),
            });
        }
        return;
    }
    fences
        .lanes
        .entry(tag.to_string())
        .or_insert(FenceOutcome::Invalid {
            reason: reason.to_string(),
        });
}

/// Returns the parsed table after the schema gate, or the rejection reason.
fn check_schema(body: &str) -> std::result::Result<toml::Table, String> {
    let table: toml::Table = toml::from_str(body).map_err(|e| format!("invalid TOML: {e}"))?;
    match table.get("schema") {
        None => Err("missing schema field".to_string()),
        Some(v) => match v.as_integer() {
            None => Err("schema must be an integer".to_string()),
            Some(n) if n > SUPPORTED_FENCE_SCHEMA => {
                Err(format!("unsupported schema {n} (supported: 1)"))
            }
            Some(_) => Ok(table),
        },
    }
}

fn validate_lane(lane: &str, body: &str) -> FenceOutcome {
    let table = match check_schema(body) {
        Ok(t) => t,
        Err(reason) => return FenceOutcome::Invalid { reason },
    };

    if lane == UX_LANE {
        let Some(url) = table.get("url").and_then(|v| v.as_str()) else {
            return FenceOutcome::Invalid {
                reason: "ux fence requires a url string".to_string(),
            };
        };
        let pages = match table.get("pages") {
            None => Vec::new(),
            Some(v) => match v.as_array() {
                Some(items) if items.iter().all(|i| i.is_str()) => items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .map(str::to_string)
                    .collect(),
                _ => {
                    return FenceOutcome::Invalid {
                        reason: "pages must be an array of strings".to_string(),
                    }
                }
            },
        };
        return FenceOutcome::Valid(LaneConfig::Ux {
            url: url.to_string(),
            pages,
        });
    }

    if lane == "rebuild" {
        let mode = match table.get("mode") {
            None => None,
            Some(v) => match v.as_str() {
                Some(s) => Some(s.to_string()),
                None => {
                    return FenceOutcome::Invalid {
                        reason: "mode must be a string".to_string(),
                    }
                }
            },
        };
        return FenceOutcome::Valid(LaneConfig::Rebuild { mode });
    }

    FenceOutcome::Valid(LaneConfig::Generic { table })
}

fn validate_contract(body: &str) -> ContractOutcome {
    let table = match check_schema(body) {
        Ok(t) => t,
        Err(reason) => return ContractOutcome::Invalid { reason },
    };

    let mut contract = TaskContract::default();
    for (key, slot) in [
        ("max_files", &mut contract.max_files),
        ("max_loc", &mut contract.max_loc),
    ] {
        if let Some(v) = table.get(key) {
            match v.as_integer() {
                Some(n) => *slot = Some(n),
                None => {
                    return ContractOutcome::Invalid {
                        reason: format!("{key} must be an integer"),
                    }
                }
            }
        }
    }
    if let Some(v) = table.get("mode") {
        match v.as_str() {
            Some(s) => contract.mode = Some(s.to_ascii_lowercase()),
            None => {
                return ContractOutcome::Invalid {
                    reason: "mode must be a string".to_string(),
                }
            }
        }
    }
    ContractOutcome::Valid(contract)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_vs_invalid_are_distinct() {
        let fences = parse_fences("```spec\nschema = 2\n```\n");
        assert!(matches!(fences.lane("spec"), FenceOutcome::Invalid { .. }));
        assert_eq!(*fences.lane("data"), FenceOutcome::Absent);
    }

    #[test]
    fn missing_schema_fails_closed() {
        let fences = parse_fences("```spec\ndepth = 3\n```\n");
        match fences.lane("spec") {
            FenceOutcome::Invalid { reason } => assert!(reason.contains("schema")),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn generic_lane_parses_table() {
        let fences = parse_fences("```spec\nschema = 1\ndepth = 3\n```\n");
        match fences.valid_lane("spec") {
            Some(LaneConfig::Generic { table }) => {
                assert_eq!(table.get("depth").and_then(|v| v.as_integer()), Some(3));
            }
            other => panic!("expected generic config, got {other:?}"),
        }
    }

    #[test]
    fn ux_fence_requires_url() {
        let fences = parse_fences("```ux\nschema = 1\npages = [\"/\"]\n```\n");
        assert!(matches!(fences.lane("ux"), FenceOutcome::Invalid { .. }));

        let fences = parse_fences(
            "```ux\nschema = 1\nurl = \"http://localhost:3000\"\npages = [\"/\", \"/about\"]\n```\n",
        );
        match fences.valid_lane("ux") {
            Some(LaneConfig::Ux { url, pages }) => {
                assert_eq!(url, "http://localhost:3000");
                assert_eq!(pages.len(), 2);
            }
            other => panic!("expected ux config, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_are_opaque() {
        let fences = parse_fences("```rust\nfn main() { let x = [1; 2]; }\n```\n");
        match fences.lane("rust") {
            FenceOutcome::Valid(LaneConfig::Raw { text }) => assert!(text.contains("fn main")),
            other => panic!("expected raw block, got {other:?}"),
        }
    }

    #[test]
    fn first_fence_wins_with_warning() {
        let fences =
            parse_fences("```spec\nschema = 1\na = 1\n```\n\n```spec\nschema = 1\na = 2\n```\n");
        match fences.valid_lane("spec") {
            Some(LaneConfig::Generic { table }) => {
                assert_eq!(table.get("a").and_then(|v| v.as_integer()), Some(1));
            }
            other => panic!("expected generic config, got {other:?}"),
        }
        assert_eq!(fences.warnings.len(), 1);
    }

    #[test]
    fn contract_fields() {
        let fences = parse_fences(
            "```contract\nschema = 1\nmax_files = 40\nmax_loc = 500\nmode = \"Rebuild\"\n```\n",
        );
        let contract = fences.valid_contract().unwrap();
        assert_eq!(contract.max_files, Some(40));
        assert_eq!(contract.max_loc, Some(500));
        assert_eq!(contract.mode.as_deref(), Some("rebuild"));
    }

    #[test]
    fn unterminated_fence_is_invalid() {
        let fences = parse_fences("```spec\nschema = 1\n");
        assert!(matches!(fences.lane("spec"), FenceOutcome::Invalid { .. }));
    }

    #[test]
    fn multiple_blocks_coexist() {
        let desc = "Intro text\n```contract\nschema = 1\nmax_files = 5\n```\nmiddle\n```rebuild\nschema = 1\nmode = \"full\"\n```\n";
        let fences = parse_fences(desc);
        assert!(fences.valid_contract().is_some());
        assert!(matches!(
            fences.valid_lane("rebuild"),
            Some(LaneConfig::Rebuild { mode: Some(m) }) if m == "full"
        ));
    }
}
