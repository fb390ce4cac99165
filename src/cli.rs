use clap::Parser;

/// Command-line options for the sync engine.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Run one sync cycle and exit instead of polling.
    #[arg(long)]
    pub once: bool,

    /// Fetch and parse only; skip flag reconciliation.
    #[arg(long)]
    pub fetch_only: bool,

    /// Reconcile flags only; skip fetching new mail.
    #[arg(long)]
    pub flags_only: bool,

    /// Re-run the threader over unparsed source rows and exit.
    #[arg(long)]
    pub parse_only: bool,
}
