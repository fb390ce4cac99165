//! In-process fake IMAP server for integration tests.
//!
//! - `store` — mailboxes, messages, CONDSTORE/Gmail bookkeeping, and the
//!   command evaluator (search terms, fetch items, stores, appends)
//! - `server` — TCP accept loop with literal framing
//!
//! Tests start two instances (a "remote" and a "local" daemon), point the
//! engine at them via `Config`/`Account`, and assert on the store state.

#![allow(dead_code)]

pub mod server;
pub mod store;

pub use server::FakeImapServer;
pub use store::{message, Mailbox, Msg, Store};

use mailstation::config::Config;

/// Engine config pointed at a fake local daemon, batching kept small and
/// sequential so scenarios stay deterministic.
pub fn test_config(local_port: u16, state_dir: &std::path::Path) -> Config {
    Config {
        local_host: "127.0.0.1".to_string(),
        local_port,
        local_user: "mail".to_string(),
        local_pass: "secret".to_string(),
        state_dir: state_dir.to_path_buf(),
        poll_interval_secs: 300,
        timeout_secs: 10,
        batch_size: 500,
        batch_jobs: 1,
        skip_drafts: true,
    }
}

/// An account pointed at a fake remote (non-993 port keeps it plaintext).
pub fn test_account(remote_port: u16, gmail: bool) -> mailstation::account::Account {
    mailstation::account::Account {
        username: "alice@example.com".to_string(),
        password: "secret".to_string(),
        imap_host: "127.0.0.1".to_string(),
        imap_port: remote_port,
        smtp_host: "127.0.0.1".to_string(),
        smtp_port: 2587,
        gmail: Some(gmail),
    }
}

/// The three local boxes every scenario needs.
pub fn local_store() -> Store {
    Store::new()
        .with_box("Src", Mailbox::new(7))
        .with_box("All", Mailbox::new(7))
        .with_box("Settings", Mailbox::new(7))
}

pub fn raw_message(msgid: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: bob@example.com\r\n\
         Subject: {subject}\r\n\
         Date: Mon, 20 Jul 2026 10:00:00 +0000\r\n\
         Message-ID: {msgid}\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}
