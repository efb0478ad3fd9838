use crate::fetch::GithubFetcher;
use crate::output::print_json;
use anyhow::Context;
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use pitwall_core::updates::{
    check_updates, render_review_markdown, summarize_updates, ReviewConfig, UpdateReport,
};
use std::path::{Path, PathBuf};

pub struct UpdatesArgs {
    pub force: bool,
    pub write_review: Option<PathBuf>,
    pub watch_repo: Vec<String>,
    pub watch_user: Vec<String>,
    pub watch_report: Vec<String>,
    pub report_keyword: Vec<String>,
    pub user_repo_limit: Option<usize>,
}

pub fn run(root: &Path, args: UpdatesArgs, json: bool) -> anyhow::Result<i32> {
    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let policy = Policy::load(&graph_dir);

    if !policy.updates.enabled && !args.force {
        let message = format!(
            "Update checks disabled in {} ([updates].enabled = false).",
            paths::POLICY_FILE
        );
        if json {
            print_json(&serde_json::json!({
                "enabled": false,
                "checked": false,
                "message": message,
            }))?;
        } else {
            println!("{message}");
        }
        return Ok(0);
    }

    let mut sources = ReviewConfig::load(&graph_dir, None)
        .context("failed to read ecosystem review config")?
        .into_sources();
    for spec in &args.watch_repo {
        sources.add_repo_spec(spec)?;
    }
    for spec in &args.watch_user {
        sources.add_user_spec(spec);
    }
    for spec in &args.watch_report {
        sources.add_report_spec(spec)?;
    }
    for keyword in &args.report_keyword {
        let keyword = keyword.trim().to_string();
        if !keyword.is_empty() && !sources.report_keywords.contains(&keyword) {
            sources.report_keywords.push(keyword);
        }
    }
    if let Some(limit) = args.user_repo_limit {
        sources.user_repo_limit = limit.clamp(1, 100);
    }

    let fetcher = GithubFetcher::new();
    let report = check_updates(
        &graph_dir,
        &sources,
        &fetcher,
        policy.updates.check_interval_seconds,
        args.force,
        chrono::Utc::now(),
    )?;

    if let Some(review_path) = &args.write_review {
        if let Some(parent) = review_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = std::fs::write(review_path, render_review_markdown(&report)) {
            eprintln!(
                "note: could not write review markdown ({}): {e}",
                review_path.display()
            );
        }
    }

    let has_findings = report.has_anything();

    if json {
        #[derive(serde::Serialize)]
        struct UpdatesOutput<'a> {
            enabled: bool,
            force: bool,
            has_findings: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            summary: Option<String>,
            #[serde(flatten)]
            report: &'a UpdateReport,
        }
        print_json(&UpdatesOutput {
            enabled: policy.updates.enabled,
            force: args.force,
            has_findings,
            summary: has_findings.then(|| summarize_updates(&report)),
            report: &report,
        })?;
        return Ok(if has_findings { 3 } else { 0 });
    }

    if report.skipped {
        println!(
            "Update check skipped: {}.",
            report.skip_reason.as_deref().unwrap_or("interval not elapsed")
        );
    } else if has_findings {
        println!("{}", summarize_updates(&report));
    } else {
        println!("No ecosystem updates detected.");
    }

    let errors: Vec<&String> = report
        .repo_checks
        .iter()
        .filter_map(|c| c.error.as_ref())
        .chain(report.user_checks.iter().filter_map(|c| c.error.as_ref()))
        .chain(report.report_checks.iter().filter_map(|c| c.error.as_ref()))
        .collect();
    if !errors.is_empty() {
        eprintln!("Update check errors:");
        for error in errors.iter().take(6) {
            eprintln!("- {error}");
        }
    }

    Ok(if has_findings { 3 } else { 0 })
}
