//! Local IMAP store: the durable, append-only cache.
//!
//! `Src` holds raw source rows exactly as fetched, prefixed with provenance
//! headers; `All` holds the parsed rows the UI reads. Flag edits land on
//! `All` and are mirrored onto the paired `Src` rows in the same operation.

pub mod parse;
pub mod settings;

use std::collections::HashMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::errors::Result;
use crate::imap::types::uid_set;
use crate::imap::{Connection, ImapConfig};

/// Raw source rows, append-only.
pub const SRC: &str = "Src";
/// Parsed rows, what search and the UI operate on.
pub const ALL: &str = "All";
/// KV documents (cursors, account, tag registry).
pub const SETTINGS: &str = "Settings";
/// Cursor key suffix for the user-editable side.
pub const LOCAL_TAG: &str = "\\Local";

fn imap_config(cfg: &Config) -> ImapConfig {
    ImapConfig {
        host: cfg.local_host.clone(),
        port: cfg.local_port,
        username: cfg.local_user.clone(),
        password: cfg.local_pass.clone(),
        timeout: cfg.timeout(),
    }
}

/// Open a logged-in session against the local daemon, optionally selecting
/// a mailbox. The connection is closed here on any setup failure.
pub async fn client(cfg: &Config, mailbox: Option<&str>, readonly: bool) -> Result<Connection> {
    let icfg = imap_config(cfg);
    let mut con = Connection::connect(&icfg).await?;
    if let Err(e) = con.login(&icfg.username, &icfg.password).await {
        con.logout().await;
        return Err(e);
    }
    if let Some(mbox) = mailbox {
        if let Err(e) = con.select(mbox, readonly).await {
            con.logout().await;
            return Err(e);
        }
    }
    Ok(con)
}

/// Create the engine's mailboxes; existing ones are left alone.
pub async fn ensure_boxes(cfg: &Config) -> Result<()> {
    let mut con = client(cfg, None, false).await?;
    let mut res = Ok(());
    for mbox in [SRC, ALL, SETTINGS] {
        res = con.create(mbox).await;
        if res.is_err() {
            break;
        }
    }
    con.logout().await;
    res
}

// -- provenance headers --

/// Header names the fetcher may prepend to a source row, in storage order.
pub const PROVENANCE_FIELDS: &[&str] = &[
    "X-SHA256",
    "X-Remote-Host",
    "X-Remote-Login",
    "X-GM-UID",
    "X-GM-MSGID",
    "X-GM-THRID",
    "X-GM-Login",
    "X-Thread-ID",
];

/// Prepend provenance fields to original message bytes. Each value is
/// angle-bracketed; the block ends with a single CRLF so the fields join
/// the original header block.
pub fn prepend_provenance(fields: &[(&str, String)], raw: &[u8]) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in fields {
        out.push_str(&format!("{name}: <{value}>\r\n"));
    }
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(raw);
    bytes
}

/// Split a stored row back into its provenance fields and the byte-identical
/// original message.
pub fn split_provenance(raw: &[u8]) -> (HashMap<String, String>, &[u8]) {
    let mut fields = HashMap::new();
    let mut rest = raw;
    loop {
        let Some(eol) = rest.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line = String::from_utf8_lossy(&rest[..eol]);
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            break;
        };
        let name = name.trim();
        if !PROVENANCE_FIELDS
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
        {
            break;
        }
        let value = value.trim().trim_start_matches('<').trim_end_matches('>');
        fields.insert(name.to_string(), value.to_string());
        rest = &rest[eol + 1..];
    }
    (fields, rest)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Scan one header field across a whole mailbox: value → uid. This is the
/// dedup index; the full scan keeps behavior identical under deletions.
pub async fn scan_header(con: &mut Connection, field: &str) -> Result<HashMap<String, u32>> {
    let mut index = HashMap::new();
    if con.selected.as_ref().map(|s| s.exists).unwrap_or(0) == 0 {
        return Ok(index);
    }
    let items = format!("(UID BODY.PEEK[HEADER.FIELDS ({field})])");
    let recs = con.uid_fetch("1:*", &items, None).await?;
    for rec in recs {
        let Some(uid) = rec.uid else { continue };
        let Some(bytes) = rec.header_fields else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case(field) {
                let value = value.trim().trim_start_matches('<').trim_end_matches('>');
                if !value.is_empty() {
                    index.insert(value.to_string(), uid);
                }
            }
        }
    }
    Ok(index)
}

/// Map source uids to their parsed counterparts.
pub async fn pair_origin_uids(cfg: &Config, src_uids: &[u32]) -> Result<Vec<u32>> {
    let mut con = client(cfg, Some(ALL), true).await?;
    let res = scan_header(&mut con, "X-Origin-UID").await;
    con.logout().await;
    let origin_to_all = res?;
    Ok(src_uids
        .iter()
        .filter_map(|uid| origin_to_all.get(&uid.to_string()).copied())
        .collect())
}

/// Map parsed uids back to their source rows.
pub async fn pair_parsed_uids(cfg: &Config, parsed_uids: &[u32]) -> Result<Vec<u32>> {
    let mut con = client(cfg, Some(ALL), true).await?;
    let res = scan_header(&mut con, "X-Origin-UID").await;
    con.logout().await;
    let origin_to_all = res?;
    let all_to_origin: HashMap<u32, u32> = origin_to_all
        .into_iter()
        .filter_map(|(origin, all)| origin.parse::<u32>().ok().map(|o| (all, o)))
        .collect();
    Ok(parsed_uids
        .iter()
        .filter_map(|uid| all_to_origin.get(uid).copied())
        .collect())
}

/// Apply a flag edit to parsed rows and mirror it onto their source rows.
pub async fn msgs_flag(
    cfg: &Config,
    parsed_uids: &[u32],
    remove: &[String],
    add: &[String],
) -> Result<()> {
    if parsed_uids.is_empty() || (remove.is_empty() && add.is_empty()) {
        return Ok(());
    }

    let mut all = client(cfg, Some(ALL), false).await?;
    let res = async {
        let set = uid_set(parsed_uids);
        if !remove.is_empty() {
            all.uid_store(&set, "-FLAGS.SILENT", &format!("({})", remove.join(" ")))
                .await?;
        }
        if !add.is_empty() {
            all.uid_store(&set, "+FLAGS.SILENT", &format!("({})", add.join(" ")))
                .await?;
        }
        scan_header(&mut all, "X-Origin-UID").await
    }
    .await;
    all.logout().await;
    let origin_to_all = res?;

    let all_to_origin: HashMap<u32, u32> = origin_to_all
        .into_iter()
        .filter_map(|(origin, all)| origin.parse::<u32>().ok().map(|o| (all, o)))
        .collect();
    let src_uids: Vec<u32> = parsed_uids
        .iter()
        .filter_map(|uid| all_to_origin.get(uid).copied())
        .collect();
    if src_uids.is_empty() {
        return Ok(());
    }

    let mut src = client(cfg, Some(SRC), false).await?;
    let res = async {
        let set = uid_set(&src_uids);
        if !remove.is_empty() {
            src.uid_store(&set, "-FLAGS.SILENT", &format!("({})", remove.join(" ")))
                .await?;
        }
        if !add.is_empty() {
            src.uid_store(&set, "+FLAGS.SILENT", &format!("({})", add.join(" ")))
                .await?;
        }
        Ok(())
    }
    .await;
    src.logout().await;
    res
}

/// Search the parsed box with a translated expression.
pub async fn search_msgs(cfg: &Config, expr: &str) -> Result<Vec<u32>> {
    let mut con = client(cfg, Some(ALL), true).await?;
    let res = con.uid_search(expr).await;
    con.logout().await;
    res
}

/// Resolve a decoded label name to a stable tag id, registering it on first
/// sight. Reserved names (`#...`, `\...`, `mlr/...`) pass through.
pub async fn get_tag(cfg: &Config, name: &str) -> Result<String> {
    let name = name.trim();
    if name.starts_with('#') || name.starts_with('\\') || name.starts_with("mlr/") {
        return Ok(name.to_string());
    }
    let id = format!("#t{}", &sha256_hex(name.to_lowercase().as_bytes())[..8]);
    let mut doc = settings::tags(cfg).await?;
    if doc.get(&id).is_none() {
        doc[id.as_str()] = json!({ "name": name });
        settings::save_tags(cfg, &doc).await?;
    }
    Ok(id)
}
