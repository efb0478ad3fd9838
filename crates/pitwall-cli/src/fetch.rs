//! GitHub-backed [`UpdateFetcher`] used by the `updates` preflight and
//! subcommand. Anonymous access works; a token raises the rate limit.

use pitwall_core::updates::{RepoHead, UpdateFetcher, UserRepo};
use std::time::Duration;

const USER_AGENT: &str = concat!("pitwall/", env!("CARGO_PKG_VERSION"));
const TOKEN_VARS: [&str; 3] = ["PITWALL_GITHUB_TOKEN", "GITHUB_TOKEN", "GH_TOKEN"];

pub struct GithubFetcher {
    agent: ureq::Agent,
    token: Option<String>,
}

impl GithubFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(20))
            .build();
        let token = TOKEN_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .filter(|t| !t.trim().is_empty());
        Self { agent, token }
    }

    fn get(&self, url: &str, api: bool) -> Result<String, String> {
        let mut request = self.agent.get(url).set("User-Agent", USER_AGENT);
        if api {
            request = request.set("Accept", "application/vnd.github+json");
            if let Some(token) = &self.token {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
        }
        request
            .call()
            .map_err(|e| e.to_string())?
            .into_string()
            .map_err(|e| e.to_string())
    }

    fn get_json(&self, url: &str) -> Result<serde_json::Value, String> {
        let body = self.get(url, true)?;
        serde_json::from_str(&body).map_err(|e| e.to_string())
    }
}

fn text_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl UpdateFetcher for GithubFetcher {
    fn repo_head(&self, repo: &str) -> Result<RepoHead, String> {
        let url = format!("https://api.github.com/repos/{repo}/commits?per_page=1");
        let parsed = self.get_json(&url)?;
        let commit = parsed
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| format!("{repo}: empty commit list"))?;
        let rev = text_field(commit, "sha");
        if rev.is_empty() {
            return Err(format!("{repo}: no sha in response"));
        }
        let committed_at = commit
            .pointer("/commit/committer/date")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(RepoHead { rev, committed_at })
    }

    fn user_repos(&self, user: &str, limit: usize) -> Result<Vec<UserRepo>, String> {
        let url = format!("https://api.github.com/users/{user}/repos?sort=updated&per_page={limit}");
        let parsed = self.get_json(&url)?;
        let entries = parsed
            .as_array()
            .ok_or_else(|| format!("{user}: unexpected repo list shape"))?;
        Ok(entries
            .iter()
            .filter(|e| !text_field(e, "full_name").is_empty())
            .map(|e| UserRepo {
                full_name: text_field(e, "full_name"),
                html_url: text_field(e, "html_url"),
                description: text_field(e, "description"),
                pushed_at: text_field(e, "pushed_at"),
                updated_at: text_field(e, "updated_at"),
            })
            .collect())
    }

    fn report_content(&self, url: &str) -> Result<String, String> {
        if !url.starts_with("https://") {
            return Err(format!("{url}: report sources must use https"));
        }
        self.get(url, false)
    }
}
