//! Ecosystem update monitor.
//!
//! Watches lane tool repos, GitHub users, and report URLs for changes,
//! diffing each source against the snapshot at
//! `.taskgraph/.pitwall/update-state.json`. Detection only: the monitor
//! reports and (optionally, via the caller) files an advisory task, it
//! never applies an update. All network access goes through the
//! [`UpdateFetcher`] trait so checks are testable with canned data.

use crate::error::{PitwallError, Result};
use crate::io::{atomic_write, FileLock};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

const KEYWORD_HIT_LIMIT: usize = 5;
const KEYWORD_LINE_CAP: usize = 240;

/// Default watch set: the orchestrator itself plus every lane tool.
pub fn default_repos() -> BTreeMap<String, String> {
    let mut repos = BTreeMap::new();
    repos.insert("pitwall".to_string(), "pitwall-dev/pitwall".to_string());
    for lane in crate::lanes::all_lane_names() {
        repos.insert(
            format!("lane-{lane}"),
            format!("pitwall-dev/lane-{lane}"),
        );
    }
    repos
}

// ---------------------------------------------------------------------------
// Snapshot state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    pub rev: String,
    #[serde(default)]
    pub committed_at: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRepoState {
    #[serde(default)]
    pub pushed_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub description: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub seen_at: DateTime<Utc>,
    #[serde(default)]
    pub repos: BTreeMap<String, UserRepoState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportState {
    #[serde(default)]
    pub name: String,
    pub content_hash: String,
    pub seen_at: DateTime<Utc>,
    #[serde(default)]
    pub last_changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateState {
    pub schema: i64,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoState>,
    #[serde(default)]
    pub users: BTreeMap<String, UserState>,
    #[serde(default)]
    pub reports: BTreeMap<String, ReportState>,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            schema: 1,
            last_checked_at: None,
            repos: BTreeMap::new(),
            users: BTreeMap::new(),
            reports: BTreeMap::new(),
        }
    }
}

impl UpdateState {
    /// Fail-open load: a missing or corrupt snapshot starts fresh.
    pub fn load(graph_dir: &Path) -> UpdateState {
        let path = paths::update_state_path(graph_dir);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, graph_dir: &Path) -> Result<()> {
        let path = paths::update_state_path(graph_dir);
        let _lock = FileLock::acquire(&path)?;
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        atomic_write(&path, text.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Sources and fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSources {
    pub repos: BTreeMap<String, String>,
    pub users: Vec<String>,
    pub reports: Vec<ReportSource>,
    pub report_keywords: Vec<String>,
    pub user_repo_limit: usize,
}

impl UpdateSources {
    pub fn defaults() -> Self {
        Self {
            repos: default_repos(),
            user_repo_limit: 10,
            ..Default::default()
        }
    }

    /// Add a `tool=owner/repo` watch spec.
    pub fn add_repo_spec(&mut self, spec: &str) -> Result<()> {
        let invalid = |reason: &str| PitwallError::InvalidWatchSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (tool, repo) = spec.split_once('=').ok_or_else(|| invalid("expected tool=owner/repo"))?;
        let (tool, repo) = (tool.trim(), repo.trim());
        if tool.is_empty() || repo.is_empty() {
            return Err(invalid("expected tool=owner/repo"));
        }
        if !repo.contains('/') {
            return Err(invalid("repo must be owner/repo"));
        }
        self.repos.insert(tool.to_string(), repo.to_string());
        Ok(())
    }

    /// Add a `@user` or bare-user watch spec, deduplicated.
    pub fn add_user_spec(&mut self, spec: &str) {
        let user = spec.trim().trim_start_matches('@').to_string();
        if !user.is_empty() && !self.users.contains(&user) {
            self.users.push(user);
        }
    }

    /// Add a `name=url` report watch spec.
    pub fn add_report_spec(&mut self, spec: &str) -> Result<()> {
        let invalid = |reason: &str| PitwallError::InvalidWatchSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (name, url) = spec.split_once('=').ok_or_else(|| invalid("expected name=url"))?;
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() || url.is_empty() {
            return Err(invalid("expected name=url"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(invalid("url must be http(s)"));
        }
        self.reports.push(ReportSource {
            name: name.to_string(),
            url: url.to_string(),
            keywords: Vec::new(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RepoHead {
    pub rev: String,
    pub committed_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserRepo {
    pub full_name: String,
    pub html_url: String,
    pub description: String,
    pub pushed_at: String,
    pub updated_at: String,
}

/// Per-source errors are reported as strings and never abort the check.
pub trait UpdateFetcher {
    fn repo_head(&self, repo: &str) -> std::result::Result<RepoHead, String>;
    fn user_repos(&self, user: &str, limit: usize) -> std::result::Result<Vec<UserRepo>, String>;
    fn report_content(&self, url: &str) -> std::result::Result<String, String>;
}

// ---------------------------------------------------------------------------
// Review config
// ---------------------------------------------------------------------------

/// `.taskgraph/.pitwall/ecosystem-review.json`: optional source overrides
/// for the monitor.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReviewConfig {
    pub repos: Option<BTreeMap<String, String>>,
    pub extra_repos: BTreeMap<String, String>,
    pub github_users: Vec<String>,
    pub reports: Vec<ReportEntry>,
    pub report_keywords: Vec<String>,
    pub user_repo_limit: Option<i64>,
}

/// A report entry is either a bare URL string or a named object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReportEntry {
    Url(String),
    Named {
        url: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        keywords: Vec<String>,
    },
}

impl ReviewConfig {
    /// Absent file means no overrides; a present but unparseable file is
    /// a real error since the operator wrote it by hand.
    pub fn load(graph_dir: &Path, override_path: Option<&Path>) -> Result<ReviewConfig> {
        let path = override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths::review_config_path(graph_dir));
        if !path.exists() {
            return Ok(ReviewConfig::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn into_sources(self) -> UpdateSources {
        let mut repos = self.repos.unwrap_or_else(default_repos);
        repos.extend(self.extra_repos);

        let mut users = Vec::new();
        for raw in self.github_users {
            let user = raw.trim().trim_start_matches('@').to_string();
            if !user.is_empty() && !users.contains(&user) {
                users.push(user);
            }
        }

        let reports = self
            .reports
            .into_iter()
            .filter_map(|entry| match entry {
                ReportEntry::Url(url) => {
                    let url = url.trim().to_string();
                    (!url.is_empty()).then(|| ReportSource {
                        name: url.clone(),
                        url,
                        keywords: Vec::new(),
                    })
                }
                ReportEntry::Named { url, name, keywords } => {
                    let url = url.trim().to_string();
                    (!url.is_empty()).then(|| ReportSource {
                        name: name
                            .map(|n| n.trim().to_string())
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| url.clone()),
                        url,
                        keywords: dedup_trimmed(keywords),
                    })
                }
            })
            .collect();

        UpdateSources {
            repos,
            users,
            reports,
            report_keywords: dedup_trimmed(self.report_keywords),
            user_repo_limit: self.user_repo_limit.unwrap_or(10).clamp(1, 100) as usize,
        }
    }
}

fn dedup_trimmed(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        let v = raw.trim().to_string();
        if !v.is_empty() && !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RepoUpdate {
    pub tool: String,
    pub repo: String,
    pub previous_rev: String,
    pub current_rev: String,
    pub committed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoCheck {
    pub tool: String,
    pub repo: String,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UserFinding {
    NewRepo {
        user: String,
        repo: String,
        html_url: String,
    },
    RepoPushed {
        user: String,
        repo: String,
        previous_pushed_at: String,
        current_pushed_at: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UserCheck {
    pub user: String,
    pub repo_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportFinding {
    pub name: String,
    pub url: String,
    pub previous_hash: String,
    pub current_hash: String,
    pub keyword_hits: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportCheck {
    pub name: String,
    pub url: String,
    pub changed: bool,
    pub keyword_hits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub checked_at: DateTime<Utc>,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub interval_seconds: i64,
    pub updates: Vec<RepoUpdate>,
    pub repo_checks: Vec<RepoCheck>,
    pub user_findings: Vec<UserFinding>,
    pub user_checks: Vec<UserCheck>,
    pub report_findings: Vec<ReportFinding>,
    pub report_checks: Vec<ReportCheck>,
}

impl UpdateReport {
    fn skipped(now: DateTime<Utc>, interval: i64, elapsed: i64) -> Self {
        Self {
            checked_at: now,
            skipped: true,
            skip_reason: Some(format!(
                "interval not elapsed ({elapsed}s of {interval}s)"
            )),
            interval_seconds: interval,
            updates: Vec::new(),
            repo_checks: Vec::new(),
            user_findings: Vec::new(),
            user_checks: Vec::new(),
            report_findings: Vec::new(),
            report_checks: Vec::new(),
        }
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn has_discoveries(&self) -> bool {
        !self.user_findings.is_empty() || !self.report_findings.is_empty()
    }

    pub fn has_anything(&self) -> bool {
        self.has_updates() || self.has_discoveries()
    }
}

fn text_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn keyword_hits(text: &str, keywords: &[String]) -> Vec<String> {
    let lowered: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if lowered.is_empty() {
        return Vec::new();
    }
    let mut hits = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let line_l = line.to_lowercase();
        if lowered.iter().any(|kw| line_l.contains(kw)) {
            hits.push(line.chars().take(KEYWORD_LINE_CAP).collect());
            if hits.len() >= KEYWORD_HIT_LIMIT {
                break;
            }
        }
    }
    hits
}

/// Run the update check. Skips entirely (cache hit) unless forced or the
/// interval has elapsed; otherwise diffs every source, records per-source
/// errors inline, and saves the snapshot.
pub fn check_updates(
    graph_dir: &Path,
    sources: &UpdateSources,
    fetcher: &dyn UpdateFetcher,
    interval_seconds: i64,
    force: bool,
    now: DateTime<Utc>,
) -> Result<UpdateReport> {
    let mut state = UpdateState::load(graph_dir);
    let interval = interval_seconds.max(0);

    if !force && interval > 0 {
        if let Some(last) = state.last_checked_at {
            let elapsed = (now - last).num_seconds();
            if elapsed < interval {
                return Ok(UpdateReport::skipped(now, interval, elapsed.max(0)));
            }
        }
    }

    let mut report = UpdateReport {
        checked_at: now,
        skipped: false,
        skip_reason: None,
        interval_seconds: interval,
        updates: Vec::new(),
        repo_checks: Vec::new(),
        user_findings: Vec::new(),
        user_checks: Vec::new(),
        report_findings: Vec::new(),
        report_checks: Vec::new(),
    };

    for (tool, repo) in &sources.repos {
        let previous_rev = state
            .repos
            .get(tool)
            .map(|r| r.rev.clone())
            .unwrap_or_default();
        match fetcher.repo_head(repo) {
            Ok(head) => {
                let changed = !previous_rev.is_empty() && head.rev != previous_rev;
                if changed {
                    report.updates.push(RepoUpdate {
                        tool: tool.clone(),
                        repo: repo.clone(),
                        previous_rev: previous_rev.clone(),
                        current_rev: head.rev.clone(),
                        committed_at: head.committed_at.clone(),
                    });
                }
                state.repos.insert(
                    tool.clone(),
                    RepoState {
                        repo: repo.clone(),
                        rev: head.rev,
                        committed_at: head.committed_at,
                        seen_at: now,
                    },
                );
                report.repo_checks.push(RepoCheck {
                    tool: tool.clone(),
                    repo: repo.clone(),
                    changed,
                    error: None,
                });
            }
            Err(e) => report.repo_checks.push(RepoCheck {
                tool: tool.clone(),
                repo: repo.clone(),
                changed: false,
                error: Some(e),
            }),
        }
    }

    for user in &sources.users {
        let prev_repos = state
            .users
            .get(user)
            .map(|u| u.repos.clone())
            .unwrap_or_default();
        // First observation seeds the baseline silently.
        let baseline_exists = !prev_repos.is_empty();
        match fetcher.user_repos(user, sources.user_repo_limit.clamp(1, 100)) {
            Ok(repos) => {
                let mut current: BTreeMap<String, UserRepoState> = BTreeMap::new();
                for item in repos {
                    if item.full_name.is_empty() {
                        continue;
                    }
                    match prev_repos.get(&item.full_name) {
                        None if baseline_exists => report.user_findings.push(UserFinding::NewRepo {
                            user: user.clone(),
                            repo: item.full_name.clone(),
                            html_url: item.html_url.clone(),
                        }),
                        Some(prev)
                            if baseline_exists
                                && !prev.pushed_at.is_empty()
                                && !item.pushed_at.is_empty()
                                && prev.pushed_at != item.pushed_at =>
                        {
                            report.user_findings.push(UserFinding::RepoPushed {
                                user: user.clone(),
                                repo: item.full_name.clone(),
                                previous_pushed_at: prev.pushed_at.clone(),
                                current_pushed_at: item.pushed_at.clone(),
                            })
                        }
                        _ => {}
                    }
                    current.insert(
                        item.full_name.clone(),
                        UserRepoState {
                            pushed_at: item.pushed_at,
                            updated_at: item.updated_at,
                            html_url: item.html_url,
                            description: item.description,
                            seen_at: now,
                        },
                    );
                }
                report.user_checks.push(UserCheck {
                    user: user.clone(),
                    repo_count: current.len(),
                    error: None,
                });
                state.users.insert(
                    user.clone(),
                    UserState {
                        seen_at: now,
                        repos: current,
                    },
                );
            }
            Err(e) => report.user_checks.push(UserCheck {
                user: user.clone(),
                repo_count: 0,
                error: Some(e),
            }),
        }
    }

    for source in &sources.reports {
        let (prev_hash, prev_changed_at) = state
            .reports
            .get(&source.url)
            .map(|r| (r.content_hash.clone(), r.last_changed_at))
            .unwrap_or((String::new(), None));
        let mut merged = sources.report_keywords.clone();
        for kw in &source.keywords {
            if !merged.contains(kw) {
                merged.push(kw.clone());
            }
        }
        match fetcher.report_content(&source.url) {
            Ok(content) => {
                let content_hash = text_hash(&content);
                let hits = keyword_hits(&content, &merged);
                let changed = !prev_hash.is_empty() && prev_hash != content_hash;
                if changed {
                    report.report_findings.push(ReportFinding {
                        name: source.name.clone(),
                        url: source.url.clone(),
                        previous_hash: prev_hash.clone(),
                        current_hash: content_hash.clone(),
                        keyword_hits: hits.clone(),
                    });
                }
                report.report_checks.push(ReportCheck {
                    name: source.name.clone(),
                    url: source.url.clone(),
                    changed,
                    keyword_hits: hits.len(),
                    error: None,
                });
                state.reports.insert(
                    source.url.clone(),
                    ReportState {
                        name: source.name.clone(),
                        content_hash,
                        seen_at: now,
                        last_changed_at: if changed { Some(now) } else { prev_changed_at },
                    },
                );
            }
            Err(e) => report.report_checks.push(ReportCheck {
                name: source.name.clone(),
                url: source.url.clone(),
                changed: false,
                keyword_hits: 0,
                error: Some(e),
            }),
        }
    }

    state.last_checked_at = Some(now);
    state.save(graph_dir)?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn summarize_updates(report: &UpdateReport) -> String {
    if !report.has_anything() {
        return "No ecosystem updates detected.".to_string();
    }

    let mut lines: Vec<String> = Vec::new();
    if !report.updates.is_empty() {
        lines.push("Lane ecosystem updates detected:".to_string());
        for item in &report.updates {
            lines.push(format!(
                "- {}: {} -> {}",
                item.tool,
                short_rev(&item.previous_rev),
                short_rev(&item.current_rev)
            ));
        }
    }

    if !report.user_findings.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push("Watched GitHub source findings:".to_string());
        for item in report.user_findings.iter().take(12) {
            match item {
                UserFinding::NewRepo { user, repo, .. } => {
                    lines.push(format!("- @{user}: new repo discovered -> {repo}"))
                }
                UserFinding::RepoPushed { user, repo, .. } => {
                    lines.push(format!("- @{user}: repo activity changed -> {repo}"))
                }
            }
        }
        if report.user_findings.len() > 12 {
            lines.push(format!(
                "- ... and {} more user findings",
                report.user_findings.len() - 12
            ));
        }
    }

    if !report.report_findings.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push("Watched report changes detected:".to_string());
        for item in report.report_findings.iter().take(10) {
            if item.keyword_hits.is_empty() {
                lines.push(format!("- {}: content changed", item.name));
            } else {
                lines.push(format!(
                    "- {}: content changed ({} keyword hits)",
                    item.name,
                    item.keyword_hits.len()
                ));
            }
        }
        if report.report_findings.len() > 10 {
            lines.push(format!(
                "- ... and {} more report findings",
                report.report_findings.len() - 10
            ));
        }
    }

    lines.push("Decision needed: adopt the updated tooling now or defer?".to_string());
    lines.join("\n")
}

fn short_rev(rev: &str) -> &str {
    if rev.is_empty() {
        "unknown"
    } else {
        &rev[..rev.len().min(7)]
    }
}

pub fn render_review_markdown(report: &UpdateReport) -> String {
    let mut lines = vec![
        "# Ecosystem Review".to_string(),
        String::new(),
        format!("- Checked at (UTC): `{}`", report.checked_at.to_rfc3339()),
        format!("- Repo updates: `{}`", report.updates.len()),
        format!("- GitHub user findings: `{}`", report.user_findings.len()),
        format!("- Report findings: `{}`", report.report_findings.len()),
        String::new(),
        "## Summary".to_string(),
        String::new(),
        summarize_updates(report),
        String::new(),
        "## Repo Updates".to_string(),
        String::new(),
    ];

    if report.updates.is_empty() {
        lines.push("- none".to_string());
    } else {
        for item in &report.updates {
            lines.push(format!(
                "- `{}` (`{}`): `{}` -> `{}`",
                item.tool,
                item.repo,
                short_rev(&item.previous_rev),
                short_rev(&item.current_rev)
            ));
        }
    }
    lines.push(String::new());

    lines.push("## GitHub User Findings".to_string());
    lines.push(String::new());
    if report.user_findings.is_empty() {
        lines.push("- none".to_string());
    } else {
        for item in &report.user_findings {
            match item {
                UserFinding::NewRepo { user, repo, .. } => {
                    lines.push(format!("- `@{user}` new repo: `{repo}`"))
                }
                UserFinding::RepoPushed { user, repo, .. } => {
                    lines.push(format!("- `@{user}` repo pushed: `{repo}`"))
                }
            }
        }
    }
    lines.push(String::new());

    lines.push("## Report Findings".to_string());
    lines.push(String::new());
    if report.report_findings.is_empty() {
        lines.push("- none".to_string());
    } else {
        for item in &report.report_findings {
            lines.push(format!("- `{}`: changed (`{}`)", item.name, item.url));
            for hit in item.keyword_hits.iter().take(3) {
                lines.push(format!("  - keyword hit: {hit}"));
            }
        }
    }
    lines.push(String::new());

    let mut errors: Vec<String> = Vec::new();
    for check in &report.repo_checks {
        if let Some(e) = &check.error {
            errors.push(format!("- {}: {e}", check.tool));
        }
    }
    for check in &report.user_checks {
        if let Some(e) = &check.error {
            errors.push(format!("- {}: {e}", check.user));
        }
    }
    for check in &report.report_checks {
        if let Some(e) = &check.error {
            errors.push(format!("- {}: {e}", check.name));
        }
    }
    lines.push("## Lookup Errors".to_string());
    lines.push(String::new());
    if errors.is_empty() {
        lines.push("- none".to_string());
    } else {
        lines.extend(errors);
    }
    lines.push(String::new());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
