use anyhow::Context;
use pitwall_core::{io, paths, policy::Policy};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<i32> {
    let graph_dir = paths::taskgraph_dir(root);

    println!("Initializing pitwall in: {}", root.display());

    let dirs = [
        graph_dir.clone(),
        graph_dir.join(paths::LOGS_DIR),
        paths::state_dir(&graph_dir),
    ];
    for dir in &dirs {
        io::ensure_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let graph_file = paths::graph_path(&graph_dir);
    if io::write_if_missing(&graph_file, b"").context("failed to write graph.jsonl")? {
        println!("  created: .taskgraph/graph.jsonl");
    } else {
        println!("  exists:  .taskgraph/graph.jsonl");
    }

    if Policy::ensure(&graph_dir).context("failed to write policy file")? {
        println!("  created: .taskgraph/{}", paths::POLICY_FILE);
    } else {
        println!("  exists:  .taskgraph/{}", paths::POLICY_FILE);
    }

    println!("\nInstall lane wrappers as executables at .taskgraph/<lane> (baseline: core).");
    Ok(0)
}
