//! Outbound mail: SMTP submission over STARTTLS, then an immediate fetch +
//! parse so the sent message shows up in `All` right away (it comes back
//! through the remote `\Sent` folder).

use anyhow::{Context, Result};
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::info;

use crate::account::Account;
use crate::config::Config;
use crate::local;
use crate::remote;

/// A fully composed RFC-5322 message plus its envelope.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub from: String,
    pub to: Vec<String>,
    pub raw: Vec<u8>,
}

pub async fn send(cfg: &Config, account: &Account, msg: &Outgoing) -> Result<()> {
    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.smtp_host)
        .context("building smtp transport")?
        .port(account.smtp_port)
        .credentials(Credentials::new(
            account.username.clone(),
            account.password.clone(),
        ))
        .build();

    let from: Address = msg
        .from
        .parse()
        .with_context(|| format!("bad sender address {}", msg.from))?;
    let to = msg
        .to
        .iter()
        .map(|addr| {
            addr.parse::<Address>()
                .with_context(|| format!("bad recipient address {addr}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let envelope = Envelope::new(Some(from), to).context("building envelope")?;

    transport
        .send_raw(&envelope, &msg.raw)
        .await
        .context("smtp submission")?;
    info!(to = ?msg.to, "message submitted");

    // pick the sent copy up from the remote right away
    remote::fetch(cfg, account, None).await?;
    local::parse::parse(cfg).await?;
    Ok(())
}
