mod cmd;
mod fetch;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pitwall",
    about = "Lane-check orchestrator — route check lanes over tasks and gate automated follow-ups",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .taskgraph/ or .git/)
    #[arg(long, global = true, env = "PITWALL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold .taskgraph/, the default policy, and the state directory
    Init,

    /// Run the lane suite against one task
    Check {
        /// Task id to check
        #[arg(long)]
        task: String,

        /// Lane selection strategy: auto, fences, or all
        #[arg(long, default_value = "auto")]
        lane_strategy: String,

        /// Force best-effort log appends regardless of mode
        #[arg(long)]
        write_log: bool,

        /// Force follow-up creation regardless of mode
        #[arg(long)]
        create_followups: bool,
    },

    /// One-shot operation: full-effect check plus the ranked next queue
    Run {
        /// Task id to check
        #[arg(long)]
        task: String,

        /// Max queued next actions to print
        #[arg(long, default_value = "3")]
        max_next: usize,
    },

    /// Continuous loop: rank the ready queue and check each task per cycle
    Orchestrate {
        /// Seconds to sleep between cycles
        #[arg(long, default_value = "300")]
        interval: u64,

        /// Cycle bound (0 = run forever)
        #[arg(long, default_value = "0")]
        max_cycles: u64,

        /// Force best-effort log appends regardless of mode
        #[arg(long)]
        write_log: bool,

        /// Force follow-up creation regardless of mode
        #[arg(long)]
        create_followups: bool,
    },

    /// Check lane ecosystem repos, users, and reports for upstream movement
    Updates {
        /// Bypass the check-interval cache
        #[arg(long)]
        force: bool,

        /// Write a review markdown file to this path
        #[arg(long)]
        write_review: Option<PathBuf>,

        /// Watch an extra repo (tool=owner/repo, repeatable)
        #[arg(long = "watch-repo")]
        watch_repo: Vec<String>,

        /// Watch a GitHub user for new or pushed repos (repeatable)
        #[arg(long = "watch-user")]
        watch_user: Vec<String>,

        /// Watch a report URL (name=url, repeatable)
        #[arg(long = "watch-report")]
        watch_report: Vec<String>,

        /// Extra keyword to highlight in changed reports (repeatable)
        #[arg(long = "report-keyword")]
        report_keyword: Vec<String>,

        /// Max repos fetched per watched user (1-100)
        #[arg(long)]
        user_repo_limit: Option<usize>,
    },

    /// Health audit: wrappers, policy, queue pressure, and loop risk
    Doctor {
        /// Re-ensure the policy file and state directories first
        #[arg(long)]
        fix: bool,
    },

    /// Show the ranked ready follow-up queue and duplicate groups
    Queue {
        /// Max entries to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Plan (and optionally apply) duplicate/overflow queue compaction
    Compact {
        /// Apply the plan instead of reporting it
        #[arg(long)]
        apply: bool,

        /// Target ready-queue size (default: policy limit)
        #[arg(long)]
        max_ready: Option<usize>,

        /// Hours to push deferred tasks out by
        #[arg(long, default_value = "24")]
        defer_hours: i64,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Check {
            task,
            lane_strategy,
            write_log,
            create_followups,
        } => cmd::check::run(
            &root,
            &task,
            &lane_strategy,
            write_log,
            create_followups,
            cli.json,
        ),
        Commands::Run { task, max_next } => cmd::run::run(&root, &task, max_next, cli.json),
        Commands::Orchestrate {
            interval,
            max_cycles,
            write_log,
            create_followups,
        } => cmd::orchestrate::run(
            &root,
            interval,
            max_cycles,
            write_log,
            create_followups,
            cli.json,
        ),
        Commands::Updates {
            force,
            write_review,
            watch_repo,
            watch_user,
            watch_report,
            report_keyword,
            user_repo_limit,
        } => cmd::updates::run(
            &root,
            cmd::updates::UpdatesArgs {
                force,
                write_review,
                watch_repo,
                watch_user,
                watch_report,
                report_keyword,
                user_repo_limit,
            },
            cli.json,
        ),
        Commands::Doctor { fix } => cmd::doctor::run(&root, fix, cli.json),
        Commands::Queue { limit } => cmd::queue::run(&root, limit, cli.json),
        Commands::Compact {
            apply,
            max_ready,
            defer_hours,
        } => cmd::compact::run(&root, apply, max_ready, defer_hours, cli.json),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
