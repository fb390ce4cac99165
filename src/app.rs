use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::cli::Cli;
use crate::config::Config;
use crate::local;
use crate::remote;

/// Run the engine per the CLI flags: a single pass with `--once`, otherwise
/// a polling loop. A cycle never takes the scheduler down with it: errors
/// are logged and the next tick runs as usual.
pub async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load()?;
    local::ensure_boxes(&cfg).await?;

    if cli.parse_only {
        let parsed = local::parse::parse(&cfg).await?;
        info!(parsed = parsed, "parse finished");
        return Ok(());
    }

    let account = local::settings::account(&cfg)
        .await?
        .context("no remote account configured (settings key remote/account)")?;

    if cli.once {
        return cycle(&cfg, &account, &cli).await;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if let Err(e) = cycle(&cfg, &account, &cli).await {
            error!(error = ?e, "sync cycle failed");
        }
    }
}

async fn cycle(cfg: &Config, account: &crate::account::Account, cli: &Cli) -> Result<()> {
    if cli.fetch_only {
        remote::fetch(cfg, account, None).await?;
        local::parse::parse(cfg).await?;
        return Ok(());
    }
    remote::sync(cfg, account, cli.flags_only).await
}
