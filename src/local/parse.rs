//! The threader: materialize `Src` rows into parsed rows in `All`.
//!
//! A parsed row keeps the searchable headers of the original (Subject, From,
//! addressing, Message-ID, References) plus `X-Origin-UID` and the thread
//! assignment, with normalized JSON metadata as its body. Flags mirror the
//! source row; the thread keyword `mlr/thrid/N` and `#latest` are parsed-side
//! additions.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::imap::types::uid_set;
use crate::local::{self, settings, split_provenance, ALL, SRC};
use crate::remote::labels::take_thrid;

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileMeta {
    pub filename: String,
    pub size: usize,
}

/// Normalized metadata stored as the parsed row's JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MsgMeta {
    pub subject: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub date: Option<i64>,
    pub msgid: String,
    pub in_reply_to: Option<String>,
    pub refs: Vec<String>,
    pub preview: String,
    pub files: Vec<FileMeta>,
    pub origin_uid: u32,
    pub thrid: u64,
}

/// Process every source row not yet represented in `All`. Returns the number
/// of newly parsed rows.
pub async fn parse(cfg: &Config) -> Result<usize> {
    // Source side: uids currently present.
    let mut src_ro = local::client(cfg, Some(SRC), true).await?;
    let res = src_ro.uid_fetch("1:*", "(UID)", None).await;
    src_ro.logout().await;
    let src_uids: HashSet<u32> = res
        .context("listing source uids")?
        .into_iter()
        .filter_map(|r| r.uid)
        .collect();

    // Parsed side: origin map and per-message thread assignments.
    let mut all = local::client(cfg, Some(ALL), false).await?;
    let res = parse_against_all(cfg, &mut all, &src_uids).await;
    all.logout().await;
    res
}

async fn parse_against_all(
    cfg: &Config,
    all: &mut crate::imap::Connection,
    src_uids: &HashSet<u32>,
) -> Result<usize> {
    let origin_to_all = local::scan_header(all, "X-Origin-UID").await?;

    // Parsed rows whose source is gone are dead: flag and expunge.
    let orphans: Vec<u32> = origin_to_all
        .iter()
        .filter(|(origin, _)| {
            origin
                .parse::<u32>()
                .map(|o| !src_uids.contains(&o))
                .unwrap_or(true)
        })
        .map(|(_, all_uid)| *all_uid)
        .collect();
    if !orphans.is_empty() {
        info!(count = orphans.len(), "removing orphaned parsed rows");
        all.uid_store(&uid_set(&orphans), "+FLAGS.SILENT", "(\\Deleted)")
            .await?;
        all.expunge().await?;
    }

    let parsed_origins: HashSet<u32> = origin_to_all
        .keys()
        .filter_map(|o| o.parse().ok())
        .collect();
    let mut unparsed: Vec<u32> = src_uids.difference(&parsed_origins).copied().collect();
    unparsed.sort_unstable();
    if unparsed.is_empty() {
        return Ok(0);
    }
    info!(count = unparsed.len(), "parsing source rows");

    let mut thrid_by_msgid = thread_index(all).await?;

    let mut src = local::client(cfg, Some(SRC), false).await?;
    let res = parse_rows(cfg, all, &mut src, &unparsed, &mut thrid_by_msgid).await;
    src.logout().await;
    res
}

/// Message-ID → thread id for everything already parsed.
async fn thread_index(all: &mut crate::imap::Connection) -> Result<HashMap<String, u64>> {
    let mut index = HashMap::new();
    if all.selected.as_ref().map(|s| s.exists).unwrap_or(0) == 0 {
        return Ok(index);
    }
    let recs = all
        .uid_fetch("1:*", "(UID FLAGS BODY.PEEK[HEADER.FIELDS (Message-ID)])", None)
        .await?;
    for rec in recs {
        let Some(thrid) = rec
            .flags
            .iter()
            .find_map(|f| f.strip_prefix("mlr/thrid/").and_then(|n| n.parse().ok()))
        else {
            continue;
        };
        let Some(bytes) = rec.header_fields else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("Message-ID") {
                    index.insert(value.trim().to_string(), thrid);
                }
            }
        }
    }
    Ok(index)
}

async fn parse_rows(
    cfg: &Config,
    all: &mut crate::imap::Connection,
    src: &mut crate::imap::Connection,
    unparsed: &[u32],
    thrid_by_msgid: &mut HashMap<String, u64>,
) -> Result<usize> {
    let mut parsed = 0usize;
    for chunk in unparsed.chunks(100) {
        let recs = src
            .uid_fetch(&uid_set(chunk), "(UID FLAGS INTERNALDATE BODY.PEEK[])", None)
            .await
            .context("fetching source bodies")?;
        for rec in recs {
            let Some(uid) = rec.uid else { continue };
            let Some(body) = rec.body else { continue };
            match parse_one(cfg, all, src, uid, &rec.flags, rec.internal_date.as_deref(), &body, thrid_by_msgid)
                .await
            {
                Ok(()) => parsed += 1,
                // a broken message skips itself, not the batch
                Err(e) => warn!(uid = uid, error = %e, "failed to parse source row"),
            }
        }
    }
    Ok(parsed)
}

#[allow(clippy::too_many_arguments)]
async fn parse_one(
    cfg: &Config,
    all: &mut crate::imap::Connection,
    src: &mut crate::imap::Connection,
    uid: u32,
    src_flags: &[String],
    internal_date: Option<&str>,
    stored: &[u8],
    thrid_by_msgid: &mut HashMap<String, u64>,
) -> Result<()> {
    let (provenance, original) = split_provenance(stored);
    let mail = mailparse::parse_mail(original).context("parsing message")?;

    let mut meta = meta_from_mail(&mail, uid)?;
    if meta.msgid.is_empty() {
        // messages without a Message-ID still need a stable identity
        meta.msgid = format!(
            "<{}@mailstation.local>",
            provenance
                .get("X-SHA256")
                .cloned()
                .unwrap_or_else(|| uid.to_string())
        );
    }

    let mut flags: BTreeSet<String> = src_flags
        .iter()
        .filter(|f| f.as_str() != "\\Recent")
        .cloned()
        .collect();
    let kw_thrid = take_thrid(&mut flags);

    let thrid = resolve_thrid(cfg, kw_thrid, &provenance, &meta, thrid_by_msgid).await?;
    meta.thrid = thrid;
    thrid_by_msgid.insert(meta.msgid.clone(), thrid);

    let thrid_kw = format!("mlr/thrid/{thrid}");
    let mut row_flags: Vec<String> = flags.iter().cloned().collect();
    row_flags.push(thrid_kw.clone());
    row_flags.push("#latest".to_string());

    let raw = parsed_row(&mail, &meta, &thrid_kw)?;
    all.append(
        ALL,
        crate::imap::types::AppendMsg {
            internal_date: internal_date.map(str::to_string),
            flags: row_flags.join(" "),
            raw,
        },
    )
    .await
    .context("appending parsed row")?;

    // #latest stays on the thread's highest uid only
    let mut marked = all
        .uid_search(&format!("KEYWORD {thrid_kw} KEYWORD #latest"))
        .await?;
    marked.sort_unstable();
    if marked.len() > 1 {
        marked.pop();
        all.uid_store(&uid_set(&marked), "-FLAGS.SILENT", "(#latest)")
            .await?;
    }

    // keep the assignment on the source row so a re-parse adopts it
    src.uid_store(&uid.to_string(), "+FLAGS.SILENT", &format!("({thrid_kw})"))
        .await?;
    Ok(())
}

/// Thread id resolution: adopt a keyword, then the provenance header, then a
/// referenced parent, then mint a new id.
async fn resolve_thrid(
    cfg: &Config,
    kw_thrid: Option<u64>,
    provenance: &HashMap<String, String>,
    meta: &MsgMeta,
    thrid_by_msgid: &HashMap<String, u64>,
) -> Result<u64> {
    if let Some(t) = kw_thrid {
        return Ok(t);
    }
    if let Some(header) = provenance.get("X-Thread-ID") {
        if let Some(t) = header
            .trim_start_matches("mlr/thrid/")
            .split('@')
            .next()
            .and_then(|n| n.parse().ok())
        {
            return Ok(t);
        }
    }
    // most recent reference first
    for reference in meta.in_reply_to.iter().chain(meta.refs.iter().rev()) {
        if let Some(t) = thrid_by_msgid.get(reference) {
            return Ok(*t);
        }
    }
    let minted = settings::next_thrid(cfg).await?;
    debug!(msgid = %meta.msgid, thrid = minted, "minted thread");
    Ok(minted)
}

fn meta_from_mail(mail: &ParsedMail, origin_uid: u32) -> Result<MsgMeta> {
    let headers = &mail.headers;
    let date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok());
    let refs: Vec<String> = headers
        .get_first_value("References")
        .map(|r| r.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let mut meta = MsgMeta {
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        cc: headers.get_first_value("Cc"),
        date,
        msgid: headers
            .get_first_value("Message-ID")
            .map(|m| m.trim().to_string())
            .unwrap_or_default(),
        in_reply_to: headers
            .get_first_value("In-Reply-To")
            .map(|m| m.trim().to_string()),
        refs,
        preview: String::new(),
        files: Vec::new(),
        origin_uid,
        thrid: 0,
    };
    fill_parts(mail, &mut meta);
    Ok(meta)
}

/// Depth-first part walk: first text part becomes the preview, attachments
/// are recorded by name and size.
fn fill_parts(part: &ParsedMail, meta: &mut MsgMeta) {
    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .unwrap_or_else(|| "unnamed".to_string());
        let size = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
        meta.files.push(FileMeta { filename, size });
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if meta.preview.is_empty() => {
            if let Ok(body) = part.get_body() {
                meta.preview = clip(&body);
            }
        }
        "text/html" if meta.preview.is_empty() => {
            if let Ok(body) = part.get_body() {
                let text = html2text::from_read(body.as_bytes(), 80).unwrap_or_default();
                meta.preview = clip(&text);
            }
        }
        _ => {}
    }
    for sub in &part.subparts {
        fill_parts(sub, meta);
    }
}

fn clip(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREVIEW_CHARS)
        .collect()
}

/// Build the parsed row: searchable headers plus the JSON body.
fn parsed_row(mail: &ParsedMail, meta: &MsgMeta, thrid_kw: &str) -> Result<Vec<u8>> {
    let mut out = String::new();
    out.push_str(&format!("Subject: {}\r\n", meta.subject));
    if let Some(from) = &meta.from {
        out.push_str(&format!("From: {from}\r\n"));
    }
    if let Some(to) = &meta.to {
        out.push_str(&format!("To: {to}\r\n"));
    }
    if let Some(cc) = &meta.cc {
        out.push_str(&format!("Cc: {cc}\r\n"));
    }
    if let Some(date) = mail.headers.get_first_value("Date") {
        out.push_str(&format!("Date: {date}\r\n"));
    }
    out.push_str(&format!("Message-ID: {}\r\n", meta.msgid));
    if let Some(irt) = &meta.in_reply_to {
        out.push_str(&format!("In-Reply-To: {irt}\r\n"));
    }
    if !meta.refs.is_empty() {
        out.push_str(&format!("References: {}\r\n", meta.refs.join(" ")));
    }
    if let Some(draft_id) = mail.headers.get_first_value("X-Draft-Id") {
        out.push_str(&format!("X-Draft-Id: {draft_id}\r\n"));
    }
    out.push_str(&format!("X-Origin-UID: <{}>\r\n", meta.origin_uid));
    out.push_str(&format!("X-Thread-ID: <{thrid_kw}@mailur.link>\r\n"));
    out.push_str("Content-Type: application/json\r\n\r\n");
    out.push_str(&serde_json::to_string(meta)?);
    Ok(out.into_bytes())
}
