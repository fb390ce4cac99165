//! Remote account client and the incremental fetcher.
//!
//! `fetch_folder` pulls new UIDs into the local `Src` mirror under the
//! per-user lock: load the saved `(UIDVALIDITY, UIDNEXT)` cursor, reset it
//! when the remote epoch changed, search `UID n:*`, dispatch batched
//! concurrent fetches, and persist the new cursor only after every append
//! landed. Deduplication (SHA-256, or X-GM-MSGID for Gmail) makes re-runs of
//! the same range no-ops.

pub mod labels;
pub mod reconcile;
pub mod send;

use std::collections::HashSet;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::Config;
use crate::errors::Error;
use crate::imap::types::{uid_set, AppendMsg};
use crate::imap::{Connection, ImapConfig};
use crate::local::{self, prepend_provenance, settings, sha256_hex, SRC};
use crate::lock::UserLock;
use labels::{flags_by_gmail, take_thrid, Special};

/// What to open on the remote: an explicit mailbox, a special-use tag, or
/// both (the mailbox is selected, the tag names its role).
#[derive(Debug, Clone)]
pub struct FolderSel {
    pub mailbox: Option<String>,
    pub special: Option<Special>,
}

impl FolderSel {
    pub fn tag(special: Special) -> FolderSel {
        FolderSel {
            mailbox: None,
            special: Some(special),
        }
    }

    pub fn mailbox(name: &str, special: Option<Special>) -> FolderSel {
        FolderSel {
            mailbox: Some(name.to_string()),
            special,
        }
    }

    /// Cursor key part and log label. The tag wins so a mailbox rename does
    /// not orphan the cursor.
    pub fn key_part(&self) -> String {
        match (self.special, &self.mailbox) {
            (Some(s), _) => s.as_imap().to_string(),
            (None, Some(m)) => m.clone(),
            (None, None) => "INBOX".to_string(),
        }
    }
}

/// Cursor key: `host:user:folder`.
pub fn box_key(account: &Account, part: &str) -> String {
    format!("{}:{}:{}", account.imap_host, account.username, part)
}

fn imap_config(cfg: &Config, account: &Account) -> ImapConfig {
    ImapConfig {
        host: account.imap_host.clone(),
        port: account.imap_port,
        username: account.username.clone(),
        password: account.password.clone(),
        timeout: cfg.timeout(),
    }
}

/// Open a logged-in remote session, selecting the requested folder. The
/// connection is closed here on any setup failure.
pub async fn client(
    cfg: &Config,
    account: &Account,
    sel: Option<&FolderSel>,
    readonly: bool,
) -> crate::errors::Result<Connection> {
    let icfg = imap_config(cfg, account);
    let mut con = Connection::connect(&icfg).await?;
    if let Err(e) = con.login(&icfg.username, &icfg.password).await {
        con.logout().await;
        return Err(e);
    }
    if let Some(sel) = sel {
        let selected = match &sel.mailbox {
            Some(mbox) => con.select(mbox, readonly).await.map(Some),
            None => {
                let tag = sel.special.map(Special::as_imap).unwrap_or("\\All");
                con.select_tag(tag, readonly).await
            }
        };
        match selected {
            Ok(Some(_)) => {}
            Ok(None) => {
                con.logout().await;
                return Err(Error::No(format!(
                    "no mailbox carries {}",
                    sel.key_part()
                )));
            }
            Err(e) => {
                con.logout().await;
                return Err(e);
            }
        }
    }
    Ok(con)
}

/// The folders one sync cycle covers. Gmail exposes everything under
/// `\All` plus the two folders excluded from it; generic servers get
/// `\All` when they have it, otherwise INBOX and, when resolvable, `\Sent`.
pub async fn get_folders(cfg: &Config, account: &Account) -> Result<Vec<FolderSel>> {
    if account.is_gmail() {
        return Ok(vec![
            FolderSel::tag(Special::All),
            FolderSel::tag(Special::Junk),
            FolderSel::tag(Special::Trash),
        ]);
    }

    let mut con = client(cfg, account, None, true).await?;
    let res = async {
        if con.select_tag(Special::All.as_imap(), true).await?.is_some() {
            return Ok(vec![FolderSel::tag(Special::All)]);
        }
        let mut folders = vec![FolderSel::mailbox("INBOX", Some(Special::Inbox))];
        if con.select_tag(Special::Sent.as_imap(), true).await?.is_some() {
            folders.push(FolderSel::tag(Special::Sent));
        }
        Ok(folders)
    }
    .await;
    con.logout().await;
    res
}

/// Fetch one folder (when given) or every folder of the account.
pub async fn fetch(cfg: &Config, account: &Account, sel: Option<&FolderSel>) -> Result<()> {
    match sel {
        Some(sel) => fetch_folder(cfg, account, sel).await,
        None => {
            for sel in get_folders(cfg, account).await? {
                fetch_folder(cfg, account, &sel).await?;
            }
            Ok(())
        }
    }
}

pub async fn fetch_folder(cfg: &Config, account: &Account, sel: &FolderSel) -> Result<()> {
    let _lock = UserLock::acquire(&cfg.state_dir, &account.username, "remote-fetch")?;

    let key = box_key(account, &sel.key_part());
    let saved = settings::uidnext(cfg, &key).await?;
    info!(
        folder = %sel.key_part(),
        saved_uidvalidity = ?saved.map(|s| s.0),
        saved_uidnext = ?saved.map(|s| s.1),
        "fetch cursor"
    );

    let mut con = client(cfg, account, Some(sel), true).await?;
    let remote = con.selected.clone().unwrap_or_default();
    let remote_uidvalidity = remote
        .uidvalidity
        .context("remote did not report UIDVALIDITY")?;
    let remote_uidnext = remote.uidnext.context("remote did not report UIDNEXT")?;
    info!(
        folder = %sel.key_part(),
        uidvalidity = remote_uidvalidity,
        uidnext = remote_uidnext,
        exists = remote.exists,
        "remote state"
    );

    let start = match saved {
        Some((uidvalidity, uidnext)) if uidvalidity == remote_uidvalidity => uidnext,
        Some((uidvalidity, _)) => {
            warn!(
                folder = %sel.key_part(),
                old = uidvalidity,
                new = remote_uidvalidity,
                "UIDVALIDITY changed, cursor reset"
            );
            1
        }
        None => 1,
    };

    // `UID n:*` returns at least the highest message even when the range is
    // empty, so re-filter against the cursor.
    let uids_res = con.uid_search(&format!("UID {start}:*")).await;
    con.logout().await;
    let uids: Vec<u32> = uids_res?.into_iter().filter(|u| *u >= start).collect();
    info!(folder = %sel.key_part(), new = uids.len(), "new uids");

    if !uids.is_empty() {
        fetch_uids(cfg, account, sel, uids).await?;
    }

    settings::save_uidnext(cfg, &key, remote_uidvalidity, remote_uidnext).await?;
    Ok(())
}

/// Split the UID list into batches fetched over concurrent connection
/// pairs. Ordering across batches is undefined; append idempotence makes
/// that safe.
async fn fetch_uids(cfg: &Config, account: &Account, sel: &FolderSel, uids: Vec<u32>) -> Result<()> {
    let chunks: Vec<Vec<u32>> = uids.chunks(cfg.batch_size.max(1)).map(<[u32]>::to_vec).collect();
    let jobs = cfg.batch_jobs.max(1);
    stream::iter(chunks)
        .map(|chunk| {
            let cfg = cfg.clone();
            let account = account.clone();
            let sel = sel.clone();
            async move {
                if account.is_gmail() {
                    fetch_gmail(&cfg, &account, &sel, &chunk).await
                } else {
                    fetch_imap(&cfg, &account, &sel, &chunk).await
                }
            }
        })
        .buffer_unordered(jobs)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

/// Generic IMAP batch: dedup by SHA-256 of the original bytes.
async fn fetch_imap(cfg: &Config, account: &Account, sel: &FolderSel, uids: &[u32]) -> Result<()> {
    let mut local_con = local::client(cfg, Some(SRC), false).await?;
    let res = fetch_imap_into(cfg, account, sel, uids, &mut local_con).await;
    local_con.logout().await;
    res
}

async fn fetch_imap_into(
    cfg: &Config,
    account: &Account,
    sel: &FolderSel,
    uids: &[u32],
    local_con: &mut Connection,
) -> Result<()> {
    let exists = local::scan_header(local_con, "X-SHA256").await?;

    let mut rem = client(cfg, account, Some(sel), true).await?;
    let recs_res = rem
        .uid_fetch(&uid_set(uids), "(UID INTERNALDATE FLAGS BODY.PEEK[])", None)
        .await;
    rem.logout().await;
    let recs = recs_res.context("fetching remote batch")?;

    let tag_kw = sel.special.and_then(Special::tag_keyword);
    let mut batch_seen: HashSet<String> = HashSet::new();
    let mut msgs = Vec::new();
    for rec in recs {
        let Some(body) = rec.body else { continue };
        let hash = sha256_hex(&body);
        if exists.contains_key(&hash) || !batch_seen.insert(hash.clone()) {
            continue;
        }
        let mut flags: Vec<String> = rec
            .flags
            .iter()
            .filter(|f| f.as_str() != "\\Recent")
            .cloned()
            .collect();
        if let Some(kw) = tag_kw {
            if !flags.iter().any(|f| f == kw) {
                flags.push(kw.to_string());
            }
        }
        let fields = [
            ("X-SHA256", hash),
            ("X-Remote-Host", account.imap_host.clone()),
            ("X-Remote-Login", account.username.clone()),
        ];
        msgs.push(AppendMsg {
            internal_date: rec.internal_date,
            flags: flags.join(" "),
            raw: prepend_provenance(&fields, &body),
        });
    }

    if msgs.is_empty() {
        debug!(folder = %sel.key_part(), "batch already imported");
        return Ok(());
    }
    info!(folder = %sel.key_part(), count = msgs.len(), "appending source rows");
    local_con
        .multiappend(SRC, msgs)
        .await
        .context("appending batch")?;
    Ok(())
}

/// Gmail batch: a message appears under every label it carries, so dedup by
/// X-GM-MSGID with a cheap id-only pre-pass before pulling bodies.
async fn fetch_gmail(cfg: &Config, account: &Account, sel: &FolderSel, uids: &[u32]) -> Result<()> {
    let mut local_con = local::client(cfg, Some(SRC), false).await?;
    let res = fetch_gmail_into(cfg, account, sel, uids, &mut local_con).await;
    local_con.logout().await;
    res
}

async fn fetch_gmail_into(
    cfg: &Config,
    account: &Account,
    sel: &FolderSel,
    uids: &[u32],
    local_con: &mut Connection,
) -> Result<()> {
    let existing = local::scan_header(local_con, "X-GM-MSGID").await?;

    let mut gm = client(cfg, account, Some(sel), true).await?;
    let res = gmail_batch(cfg, account, sel, uids, &existing, &mut gm).await;
    gm.logout().await;
    let msgs = res?;

    if msgs.is_empty() {
        return Ok(());
    }
    info!(folder = %sel.key_part(), count = msgs.len(), "appending source rows");
    local_con
        .multiappend(SRC, msgs)
        .await
        .context("appending batch")?;
    Ok(())
}

async fn gmail_batch(
    cfg: &Config,
    account: &Account,
    sel: &FolderSel,
    uids: &[u32],
    existing: &std::collections::HashMap<String, u32>,
    gm: &mut Connection,
) -> Result<Vec<AppendMsg>> {
    let id_recs = gm
        .uid_fetch(&uid_set(uids), "(UID X-GM-MSGID)", None)
        .await
        .context("fetching batch msgids")?;
    let new_uids: Vec<u32> = id_recs
        .into_iter()
        .filter_map(|rec| {
            let uid = rec.uid?;
            let msgid = rec.gm_msgid?;
            (!existing.contains_key(&msgid.to_string())).then_some(uid)
        })
        .collect();
    if new_uids.is_empty() {
        debug!(folder = %sel.key_part(), count = uids.len(), "batch already imported");
        return Ok(Vec::new());
    }

    let recs = gm
        .uid_fetch(
            &uid_set(&new_uids),
            "(UID INTERNALDATE FLAGS BODY.PEEK[] X-GM-LABELS X-GM-MSGID X-GM-THRID)",
            None,
        )
        .await
        .context("fetching batch bodies")?;

    let mut batch_seen: HashSet<u64> = HashSet::new();
    let mut msgs = Vec::new();
    for rec in recs {
        // rows without a body happen in "[Gmail]/Chats"
        let (Some(uid), Some(body), Some(msgid)) = (rec.uid, rec.body, rec.gm_msgid) else {
            continue;
        };
        if existing.contains_key(&msgid.to_string()) || !batch_seen.insert(msgid) {
            continue;
        }

        let mapped = flags_by_gmail(sel.special, &rec.flags, rec.gm_labels.as_deref());
        let mut keywords = mapped.keywords;
        for name in mapped.custom {
            keywords.insert(local::get_tag(cfg, &name).await?);
        }
        let thrid = take_thrid(&mut keywords);

        if cfg.skip_drafts && keywords.contains("\\Draft") {
            debug!(uid = uid, "skipping draft");
            continue;
        }

        let mut fields = vec![
            ("X-SHA256", sha256_hex(&body)),
            ("X-GM-UID", uid.to_string()),
            ("X-GM-MSGID", msgid.to_string()),
        ];
        if let Some(thrid_gm) = rec.gm_thrid {
            fields.push(("X-GM-THRID", thrid_gm.to_string()));
        }
        fields.push(("X-GM-Login", account.username.clone()));
        if let Some(t) = thrid {
            fields.push(("X-Thread-ID", format!("mlr/thrid/{t}@mailur.link")));
        }

        msgs.push(AppendMsg {
            internal_date: rec.internal_date,
            flags: keywords.into_iter().collect::<Vec<_>>().join(" "),
            raw: prepend_provenance(&fields, &body),
        });
    }
    Ok(msgs)
}

/// One sync cycle: fetch + parse, then flag reconciliation for Gmail.
/// Lock contention downgrades the fetch half to a warning.
pub async fn sync(cfg: &Config, account: &Account, only_flags: bool) -> Result<()> {
    if !only_flags {
        let res: Result<()> = async {
            fetch(cfg, account, None).await?;
            local::parse::parse(cfg).await?;
            Ok(())
        }
        .await;
        match res {
            Err(e) if Error::is_lock(&e) => {
                warn!(error = %e, "fetch already in progress, skipping")
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }
    }

    if account.is_gmail() {
        reconcile::sync_flags(cfg, account).await?;
    }
    Ok(())
}
