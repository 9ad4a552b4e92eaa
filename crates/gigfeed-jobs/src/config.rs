use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gigfeed_core::RankingPolicy;
use tracing::info;

/// Cron expressions carry a leading seconds field (`sec min hour dom mon dow`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub journal_path: Option<PathBuf>,
    pub catalog_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub daily_cron: String,
    pub hourly_cron: String,
    pub frequent_cron: String,
    pub job_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub policy_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_url: None,
            journal_path: None,
            catalog_url: None,
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            scheduler_enabled: false,
            daily_cron: "0 0 2 * * *".to_string(),
            hourly_cron: "0 0 * * * *".to_string(),
            frequent_cron: "0 */15 * * * *".to_string(),
            job_timeout_secs: 600,
            http_timeout_secs: 20,
            policy_path: PathBuf::from("./ranking.yaml"),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            bind_addr: std::env::var("GIGFEED_BIND").unwrap_or(defaults.bind_addr),
            database_url: non_empty("DATABASE_URL"),
            journal_path: non_empty("GIGFEED_JOURNAL_PATH").map(PathBuf::from),
            catalog_url: non_empty("GIGFEED_CATALOG_URL"),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: std::env::var("GIGFEED_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            scheduler_enabled: std::env::var("GIGFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            daily_cron: std::env::var("GIGFEED_DAILY_CRON").unwrap_or(defaults.daily_cron),
            hourly_cron: std::env::var("GIGFEED_HOURLY_CRON").unwrap_or(defaults.hourly_cron),
            frequent_cron: std::env::var("GIGFEED_FREQUENT_CRON").unwrap_or(defaults.frequent_cron),
            job_timeout_secs: std::env::var("GIGFEED_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.job_timeout_secs),
            http_timeout_secs: std::env::var("GIGFEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            policy_path: std::env::var("GIGFEED_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_path),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

/// Reads the ranking policy YAML; a missing file means the built-in defaults.
pub fn load_policy(path: &Path) -> Result<RankingPolicy> {
    if !path.exists() {
        info!(path = %path.display(), "no ranking policy file, using defaults");
        return Ok(RankingPolicy::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let policy = RankingPolicy::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), "loaded ranking policy");
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_policy_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let policy = load_policy(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(policy, RankingPolicy::default());
    }

    #[test]
    fn invalid_policy_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ranking.yaml");
        std::fs::write(&path, "component_weights:\n  tags: 0.9\n").expect("write");
        let err = load_policy(&path).unwrap_err();
        assert!(format!("{err:#}").contains("sum to 1"));
    }

    #[test]
    fn shipped_policy_file_matches_builtin_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../ranking.yaml");
        let policy = load_policy(&path).expect("ranking.yaml");
        assert_eq!(policy, RankingPolicy::default());
    }

    #[test]
    fn default_timeouts_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.job_timeout(), Duration::from_secs(600));
        assert_eq!(config.daily_cron, "0 0 2 * * *");
        assert_eq!(config.hourly_cron, "0 0 * * * *");
        assert_eq!(config.frequent_cron, "0 */15 * * * *");
    }
}
