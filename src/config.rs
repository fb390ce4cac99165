use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the local side of the engine. Everything can be
/// overridden by env vars but no config file is required.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_host: String,
    pub local_port: u16,
    pub local_user: String,
    pub local_pass: String,
    /// Directory for per-user lock files.
    pub state_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    /// UIDs per fetch sub-batch.
    pub batch_size: usize,
    /// Concurrent sub-batches, each with its own connection pair.
    pub batch_jobs: usize,
    pub skip_drafts: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        let local_host =
            env::var("MAILSTATION_LOCAL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let local_port = env::var("MAILSTATION_LOCAL_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(143);
        let local_user = env::var("MAILSTATION_LOCAL_USER").unwrap_or_else(|_| "mail".to_string());
        let local_pass = env::var("MAILSTATION_LOCAL_PASS").unwrap_or_default();
        let state_dir = env::var("MAILSTATION_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/mailstation"));
        let poll_interval_secs = env::var("MAILSTATION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(300);
        let timeout_secs = env::var("MAILSTATION_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(120);
        let batch_size = env::var("MAILSTATION_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(500);
        let batch_jobs = env::var("MAILSTATION_BATCH_JOBS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4);
        let skip_drafts = env::var("MAILSTATION_SKIP_DRAFTS")
            .ok()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            local_host,
            local_port,
            local_user,
            local_pass,
            state_dir,
            poll_interval_secs,
            timeout_secs,
            batch_size,
            batch_jobs,
            skip_drafts,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
