//! Per-user settings store: small JSON documents kept in a mailbox on the
//! local server. A write appends a new row for the key; the highest UID
//! wins. Reads go through a process-wide cache so a sync cycle does not
//! re-open the settings box for every cursor.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::account::Account;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::imap::types::AppendMsg;
use crate::local::{self, SETTINGS};

static CACHE: Lazy<Mutex<HashMap<String, Value>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(cfg: &Config, key: &str) -> String {
    format!("{}:{}:{}", cfg.local_host, cfg.local_port, key)
}

pub async fn get(cfg: &Config, key: &str) -> Result<Option<Value>> {
    {
        let cache = CACHE.lock().await;
        if let Some(v) = cache.get(&cache_key(cfg, key)) {
            return Ok(Some(v.clone()));
        }
    }

    let mut con = local::client(cfg, Some(SETTINGS), true).await?;
    let res = read_latest(&mut con, key).await;
    con.logout().await;
    let value = res?;

    if let Some(v) = &value {
        CACHE.lock().await.insert(cache_key(cfg, key), v.clone());
    }
    Ok(value)
}

async fn read_latest(con: &mut crate::imap::Connection, key: &str) -> Result<Option<Value>> {
    let uids = con
        .uid_search(&format!("HEADER Subject {}", crate::imap::quote(key)))
        .await?;
    let Some(uid) = uids.last().copied() else {
        return Ok(None);
    };
    let recs = con
        .uid_fetch(&uid.to_string(), "(UID BODY.PEEK[])", None)
        .await?;
    let body = recs
        .into_iter()
        .find_map(|r| r.body)
        .ok_or_else(|| Error::State(format!("settings row {key} has no body")))?;
    let text = String::from_utf8_lossy(&body);
    let json_part = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b)
        .unwrap_or(&text);
    let value: Value = serde_json::from_str(json_part.trim())
        .map_err(|e| Error::State(format!("settings {key}: bad JSON: {e}")))?;
    Ok(Some(value))
}

pub async fn set(cfg: &Config, key: &str, value: &Value) -> Result<()> {
    let raw = format!(
        "Subject: {key}\r\nContent-Type: application/json\r\n\r\n{}",
        serde_json::to_string(value).map_err(|e| Error::State(e.to_string()))?
    );
    let mut con = local::client(cfg, None, false).await?;
    let res = con
        .append(
            SETTINGS,
            AppendMsg {
                internal_date: None,
                flags: "\\Seen".to_string(),
                raw: raw.into_bytes(),
            },
        )
        .await;
    con.logout().await;
    res?;

    CACHE
        .lock()
        .await
        .insert(cache_key(cfg, key), value.clone());
    debug!(key = %key, "settings saved");
    Ok(())
}

// -- typed accessors --

pub async fn account(cfg: &Config) -> Result<Option<Account>> {
    match get(cfg, "remote/account").await? {
        Some(v) => Account::validate(&v).map(Some),
        None => Ok(None),
    }
}

/// Validate and persist the account document.
pub async fn set_account(cfg: &Config, value: &Value) -> Result<Account> {
    let account = Account::validate(value)?;
    let stored = serde_json::to_value(&account).map_err(|e| Error::State(e.to_string()))?;
    set(cfg, "remote/account", &stored).await?;
    Ok(account)
}

/// Saved `(uidvalidity, uidnext)` for one fetch cursor key.
pub async fn uidnext(cfg: &Config, key: &str) -> Result<Option<(u32, u32)>> {
    let doc = get(cfg, "remote/uidnext").await?;
    Ok(doc
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| {
            let uv = v.get(0)?.as_u64()? as u32;
            let un = v.get(1)?.as_u64()? as u32;
            Some((uv, un))
        }))
}

pub async fn save_uidnext(cfg: &Config, key: &str, uidvalidity: u32, next: u32) -> Result<()> {
    let mut doc = get(cfg, "remote/uidnext").await?.unwrap_or_else(|| json!({}));
    doc[key] = json!([uidvalidity, next]);
    set(cfg, "remote/uidnext", &doc).await
}

pub async fn modseq(cfg: &Config, key: &str) -> Result<Option<u64>> {
    let doc = get(cfg, "remote/modseq").await?;
    Ok(doc.as_ref().and_then(|d| d.get(key)).and_then(Value::as_u64))
}

/// Persist all reconciler cursors at once, after both directions finished.
pub async fn save_modseqs(cfg: &Config, entries: &HashMap<String, u64>) -> Result<()> {
    let mut doc = get(cfg, "remote/modseq").await?.unwrap_or_else(|| json!({}));
    for (key, value) in entries {
        doc[key] = json!(value);
    }
    set(cfg, "remote/modseq", &doc).await
}

/// Mint the next thread id.
pub async fn next_thrid(cfg: &Config) -> Result<u64> {
    let current = get(cfg, "local/thrid")
        .await?
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let next = current + 1;
    set(cfg, "local/thrid", &json!(next)).await?;
    Ok(next)
}

/// The tag registry document: id → {"name": human name}.
pub async fn tags(cfg: &Config) -> Result<Value> {
    Ok(get(cfg, "tags").await?.unwrap_or_else(|| json!({})))
}

pub async fn save_tags(cfg: &Config, doc: &Value) -> Result<()> {
    set(cfg, "tags", doc).await
}
