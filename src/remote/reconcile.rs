//! Bidirectional flag reconciliation against Gmail.
//!
//! Both sides are read through CONDSTORE deltas: each remote folder and the
//! local `Src` box keep a MODSEQ cursor, and only messages changed since the
//! cursor participate. Overlapping changes resolve local-wins. Cursors are
//! persisted in one write after both directions finish, so a failed run
//! replays the same deltas.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::Config;
use crate::imap::Connection;
use crate::local::{self, settings, LOCAL_TAG, SRC};
use crate::remote::labels::{
    flags_by_gmail, label_for_keyword, Special, FOLDER_LABELS, PUSHED_LABELS, SYNCED_FLAGS,
};
use crate::remote::{self, box_key, FolderSel};

pub async fn sync_flags(cfg: &Config, account: &Account) -> Result<()> {
    let folders = remote::get_folders(cfg, account).await?;
    let local_key = box_key(account, LOCAL_TAG);
    let mut modseqs: HashMap<String, u64> = HashMap::new();

    // Local side: the msgid index plus flag deltas under the \Local cursor.
    let mut src = local::client(cfg, Some(SRC), true).await?;
    let res = read_local_side(cfg, &mut src, &local_key).await;
    src.logout().await;
    let (uids_by_msgid, local_highestmodseq, flags_local) = res?;
    modseqs.insert(local_key, local_highestmodseq);
    let msgids_by_uid: HashMap<u32, String> = uids_by_msgid
        .iter()
        .map(|(msgid, uid)| (*uid, msgid.clone()))
        .collect();

    // Remote side: deltas per folder. A server without CONDSTORE cannot
    // reconcile; the cycle becomes a no-op.
    let mut flags_remote: HashMap<u32, BTreeSet<String>> = HashMap::new();
    for sel in &folders {
        let key = box_key(account, &sel.key_part());
        let saved = settings::modseq(cfg, &key).await?;
        let mut con = remote::client(cfg, account, Some(sel), true).await?;
        if !con.has_cap("CONDSTORE") {
            info!("remote lacks CONDSTORE, flag sync disabled");
            con.logout().await;
            return Ok(());
        }
        let info = con.selected.clone().unwrap_or_default();
        let Some(highestmodseq) = info.highestmodseq else {
            info!(folder = %sel.key_part(), "no HIGHESTMODSEQ, flag sync disabled");
            con.logout().await;
            return Ok(());
        };
        modseqs.insert(key.clone(), highestmodseq);

        let saved = match saved {
            Some(s) if s > highestmodseq => {
                warn!(folder = %sel.key_part(), saved = s, current = highestmodseq,
                    "modseq cursor ahead of mailbox, reseeding");
                None
            }
            other => other,
        };
        let Some(saved) = saved else {
            // first run for this folder seeds the cursor only
            con.logout().await;
            continue;
        };

        let recs_res = con
            .uid_fetch("1:*", "(UID X-GM-MSGID X-GM-LABELS FLAGS)", Some(saved))
            .await;
        con.logout().await;
        for rec in recs_res.context("fetching remote flag deltas")? {
            let Some(msgid) = rec.gm_msgid else { continue };
            // unknown msgid is usually a draft we never imported
            let Some(&local_uid) = uids_by_msgid.get(&msgid.to_string()) else {
                continue;
            };
            let mapped = flags_by_gmail(sel.special, &rec.flags, rec.gm_labels.as_deref());
            let mut keywords = mapped.keywords;
            for name in mapped.custom {
                keywords.insert(local::get_tag(cfg, &name).await?);
            }
            flags_remote.insert(local_uid, keywords);
        }
    }

    reconcile(cfg, account, &folders, &flags_local, &flags_remote, &msgids_by_uid).await?;

    debug!(?modseqs, "saving modseq cursors");
    settings::save_modseqs(cfg, &modseqs).await?;
    Ok(())
}

async fn read_local_side(
    cfg: &Config,
    src: &mut Connection,
    local_key: &str,
) -> Result<(HashMap<String, u32>, u64, HashMap<u32, BTreeSet<String>>)> {
    let uids_by_msgid = local::scan_header(src, "X-GM-MSGID").await?;

    let info = src.selected.clone().unwrap_or_default();
    let highestmodseq = info
        .highestmodseq
        .context("local daemon does not report HIGHESTMODSEQ")?;

    let mut flags_local: HashMap<u32, BTreeSet<String>> = HashMap::new();
    let saved = settings::modseq(cfg, local_key).await?;
    let saved = match saved {
        Some(s) if s > highestmodseq => {
            warn!(saved = s, current = highestmodseq, "local modseq cursor corrupt, reseeding");
            None
        }
        other => other,
    };
    if let Some(saved) = saved {
        let recs = src
            .uid_fetch("1:*", "(UID FLAGS)", Some(saved))
            .await
            .context("fetching local flag deltas")?;
        for rec in recs {
            let Some(uid) = rec.uid else { continue };
            let flags: BTreeSet<String> = rec
                .flags
                .iter()
                .filter(|f| f.as_str() != "\\Recent")
                .cloned()
                .collect();
            flags_local.insert(uid, flags);
        }
    }
    Ok((uids_by_msgid, highestmodseq, flags_local))
}

async fn reconcile(
    cfg: &Config,
    account: &Account,
    folders: &[FolderSel],
    flags_local: &HashMap<u32, BTreeSet<String>>,
    flags_remote: &HashMap<u32, BTreeSet<String>>,
    msgids_by_uid: &HashMap<u32, String>,
) -> Result<()> {
    if flags_local.is_empty() && flags_remote.is_empty() {
        return Ok(());
    }

    let local_uids: HashSet<u32> = flags_local.keys().copied().collect();
    let remote_uids: HashSet<u32> = flags_remote.keys().copied().collect();
    // local wins: overlapping changes are pushed, not pulled
    let mut to_remote: Vec<u32> = local_uids.iter().copied().collect();
    to_remote.sort_unstable();
    let mut remote_only: Vec<u32> = remote_uids.difference(&local_uids).copied().collect();
    remote_only.sort_unstable();

    if !to_remote.is_empty() {
        info!(uids = ?to_remote, "pushing flags to gmail");
        let mut gm = remote::client(cfg, account, None, false).await?;
        for uid in &to_remote {
            let Some(msgid) = msgids_by_uid.get(uid) else { continue };
            if let Err(e) = push_msg(&mut gm, folders, msgid, &flags_local[uid]).await {
                // one broken message must not sink the whole push phase
                warn!(uid = *uid, error = %e, "failed to push flags");
            }
        }
        gm.logout().await;
    }

    if !remote_only.is_empty() {
        info!(uids = ?remote_only, "pulling flags from gmail");
        for uid in &remote_only {
            let parsed = local::pair_origin_uids(cfg, &[*uid]).await?;
            let flags = &flags_remote[uid];
            if !flags.is_empty() {
                let add: Vec<String> = flags.iter().cloned().collect();
                local::msgs_flag(cfg, &parsed, &[], &add).await?;
            }
            let removed: Vec<String> = SYNCED_FLAGS
                .iter()
                .filter(|f| !flags.contains(**f))
                .map(|f| f.to_string())
                .collect();
            if !removed.is_empty() {
                local::msgs_flag(cfg, &parsed, &removed, &[]).await?;
            }
        }
    }
    Ok(())
}

/// Locate a message by msgid across the synced folders. Leaves `gm`
/// selected (read-only) on the folder that matched.
async fn find_uid_remote(
    gm: &mut Connection,
    folders: &[FolderSel],
    msgid: &str,
) -> Result<Option<(u32, FolderSel)>> {
    for sel in folders {
        let selected = match &sel.mailbox {
            Some(mbox) => gm.select(mbox, true).await.map(Some),
            None => {
                let tag = sel.special.map(Special::as_imap).unwrap_or("\\All");
                gm.select_tag(tag, true).await
            }
        };
        if selected?.is_none() {
            continue;
        }
        let uids = gm.uid_search(&format!("X-GM-MSGID {msgid}")).await?;
        if let Some(&uid) = uids.first() {
            return Ok(Some((uid, sel.clone())));
        }
    }
    Ok(None)
}

/// Push one message's flag set: label diffs via X-GM-LABELS plus `\Seen`.
/// Removing `\Trash`/`\Junk` while the message lives in that folder first
/// relocates it by adding `\Inbox`, then re-finds the UID.
async fn push_msg(
    gm: &mut Connection,
    folders: &[FolderSel],
    msgid: &str,
    flags: &BTreeSet<String>,
) -> Result<()> {
    let Some((mut uid, mut sel)) = find_uid_remote(gm, folders, msgid).await? else {
        debug!(msgid = %msgid, "message gone from remote");
        return Ok(());
    };

    let reselect = gm
        .selected
        .clone()
        .map(|s| s.mailbox)
        .context("no mailbox selected after find")?;
    gm.select(&reselect, false).await?;

    let wanted: BTreeSet<&str> = flags
        .iter()
        .filter_map(|f| label_for_keyword(f))
        .collect();
    let removed: Vec<&str> = PUSHED_LABELS
        .iter()
        .filter(|l| !wanted.contains(**l))
        .copied()
        .collect();

    let in_folder = sel
        .special
        .map(|s| FOLDER_LABELS.contains(&s.as_imap()))
        .unwrap_or(false);
    if in_folder && removed.iter().any(|l| FOLDER_LABELS.contains(l)) {
        // gmail refuses to drop the only folder label in place
        gm.uid_store(&uid.to_string(), "+X-GM-LABELS", "(\\Inbox)")
            .await?;
        let Some((new_uid, new_sel)) = find_uid_remote(gm, folders, msgid).await? else {
            return Ok(());
        };
        uid = new_uid;
        sel = new_sel;
        let reselect = gm
            .selected
            .clone()
            .map(|s| s.mailbox)
            .context("no mailbox selected after relocation")?;
        gm.select(&reselect, false).await?;
        debug!(msgid = %msgid, folder = %sel.key_part(), "relocated before unlabeling");
    }

    if !wanted.is_empty() {
        let labels: Vec<&str> = wanted.iter().copied().collect();
        gm.uid_store(&uid.to_string(), "+X-GM-LABELS", &format!("({})", labels.join(" ")))
            .await?;
    }
    if !removed.is_empty() {
        gm.uid_store(&uid.to_string(), "-X-GM-LABELS", &format!("({})", removed.join(" ")))
            .await?;
    }

    let mark = if flags.contains("\\Seen") {
        "+FLAGS.SILENT"
    } else {
        "-FLAGS.SILENT"
    };
    gm.uid_store(&uid.to_string(), mark, "(\\Seen)").await?;
    Ok(())
}
