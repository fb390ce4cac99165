//! In-process operations behind the web boundary. The HTTP layer is an
//! external collaborator; everything it needs from the engine is callable
//! here with the same shapes, transport aside.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::imap::types::uid_set;
use crate::local::{self, parse::MsgMeta, split_provenance, ALL, SRC};
use crate::query::parse_query;

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub uids: Vec<u32>,
    /// Preloaded metadata keyed by uid.
    pub msgs: HashMap<u32, MsgInfo>,
    /// Uids whose metadata was not preloaded.
    pub msgs_info: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<HashMap<u64, ThreadInfo>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgInfo {
    pub flags: Vec<String>,
    #[serde(flatten)]
    pub meta: MsgMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub uids: Vec<u32>,
    /// The `#latest` member, or the highest uid.
    pub latest: u32,
}

#[derive(Debug, Deserialize)]
pub struct FlagEdit {
    pub uids: Vec<u32>,
    #[serde(default)]
    pub old: Vec<String>,
    #[serde(default)]
    pub new: Vec<String>,
}

/// `GET/POST /search` equivalent.
pub async fn search(cfg: &Config, q: &str, preload: usize) -> Result<SearchResult> {
    let (expr, opts) = parse_query(q);
    let mut uids = local::search_msgs(cfg, &expr).await?;
    // newest first
    uids.sort_unstable_by(|a, b| b.cmp(a));

    let preload_uids: Vec<u32> = uids.iter().take(preload.max(1)).copied().collect();
    let msgs = msgs_info(cfg, &preload_uids).await?;
    let rest: Vec<u32> = uids.iter().skip(preload.max(1)).copied().collect();

    let threads = if opts.threads {
        Some(thread_groups(cfg, &uids).await?)
    } else {
        None
    };

    Ok(SearchResult {
        uids,
        msgs,
        msgs_info: rest,
        threads,
        tags: opts.tags.clone(),
    })
}

/// `POST /msgs/info` equivalent.
pub async fn msgs_info(cfg: &Config, uids: &[u32]) -> Result<HashMap<u32, MsgInfo>> {
    let mut out = HashMap::new();
    if uids.is_empty() {
        return Ok(out);
    }
    let mut con = local::client(cfg, Some(ALL), true).await?;
    let res = con
        .uid_fetch(&uid_set(uids), "(UID FLAGS BODY.PEEK[])", None)
        .await;
    con.logout().await;
    for rec in res.context("fetching parsed rows")? {
        let (Some(uid), Some(body)) = (rec.uid, rec.body) else {
            continue;
        };
        let text = String::from_utf8_lossy(&body);
        let Some((_, json_part)) = text.split_once("\r\n\r\n") else {
            continue;
        };
        let meta: MsgMeta = serde_json::from_str(json_part.trim())
            .with_context(|| format!("bad metadata for uid {uid}"))?;
        out.insert(
            uid,
            MsgInfo {
                flags: rec.flags.clone(),
                meta,
            },
        );
    }
    Ok(out)
}

/// `POST /msgs/body` equivalent: original message bytes, provenance
/// stripped, keyed by parsed uid.
pub async fn msgs_body(cfg: &Config, uids: &[u32]) -> Result<HashMap<u32, String>> {
    let mut out = HashMap::new();
    if uids.is_empty() {
        return Ok(out);
    }
    let mut all_con = local::client(cfg, Some(ALL), true).await?;
    let res = local::scan_header(&mut all_con, "X-Origin-UID").await;
    all_con.logout().await;
    let all_to_origin: HashMap<u32, u32> = res?
        .into_iter()
        .filter_map(|(origin, all)| origin.parse::<u32>().ok().map(|o| (all, o)))
        .collect();
    let origin_for: HashMap<u32, u32> = uids
        .iter()
        .filter_map(|u| all_to_origin.get(u).map(|o| (*u, *o)))
        .collect();
    let origin_uids: Vec<u32> = origin_for.values().copied().collect();

    let mut con = local::client(cfg, Some(SRC), true).await?;
    let res = con
        .uid_fetch(&uid_set(&origin_uids), "(UID BODY.PEEK[])", None)
        .await;
    con.logout().await;

    let mut by_src: HashMap<u32, String> = HashMap::new();
    for rec in res.context("fetching source bodies")? {
        let (Some(uid), Some(body)) = (rec.uid, rec.body) else {
            continue;
        };
        let (_, original) = split_provenance(&body);
        by_src.insert(uid, String::from_utf8_lossy(original).into_owned());
    }
    for (parsed, src) in origin_for {
        if let Some(body) = by_src.get(&src) {
            out.insert(parsed, body.clone());
        }
    }
    Ok(out)
}

/// `POST /msgs/flag` equivalent.
pub async fn msgs_flag(cfg: &Config, edit: &FlagEdit) -> Result<()> {
    local::msgs_flag(cfg, &edit.uids, &edit.old, &edit.new).await?;
    Ok(())
}

/// `POST /thrs/info` equivalent: thread membership for the given uids.
pub async fn thrs_info(cfg: &Config, uids: &[u32]) -> Result<HashMap<u64, ThreadInfo>> {
    thread_groups(cfg, uids).await
}

async fn thread_groups(cfg: &Config, uids: &[u32]) -> Result<HashMap<u64, ThreadInfo>> {
    let mut out: HashMap<u64, ThreadInfo> = HashMap::new();
    if uids.is_empty() {
        return Ok(out);
    }
    let mut con = local::client(cfg, Some(ALL), true).await?;
    let res = con.uid_fetch(&uid_set(uids), "(UID FLAGS)", None).await;
    con.logout().await;

    for rec in res.context("fetching thread flags")? {
        let Some(uid) = rec.uid else { continue };
        let Some(thrid) = rec
            .flags
            .iter()
            .find_map(|f| f.strip_prefix("mlr/thrid/").and_then(|n| n.parse::<u64>().ok()))
        else {
            continue;
        };
        let latest = rec.flags.iter().any(|f| f == "#latest");
        let entry = out.entry(thrid).or_insert(ThreadInfo {
            uids: Vec::new(),
            latest: uid,
        });
        entry.uids.push(uid);
        if latest || uid > entry.latest {
            entry.latest = uid;
        }
    }
    for info in out.values_mut() {
        info.uids.sort_unstable();
    }
    Ok(out)
}

/// Listing of registered tags plus the reserved ones, for the UI sidebar.
pub async fn tags(cfg: &Config) -> Result<Value> {
    let registry = local::settings::tags(cfg).await?;
    Ok(registry)
}
