use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, Result};

/// The remote account this workstation mirrors. A single account per user;
/// the value is persisted under the `remote/account` settings key and passed
/// through the sync operations explicitly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Derived from `imap_host` when absent; stored explicitly so
    /// non-standard Gmail endpoints can opt in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmail: Option<bool>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

const REQUIRED: &[&str] = &["username", "password", "imap_host", "smtp_host"];

impl Account {
    /// Validate a raw settings document into an account, naming the failing
    /// fields. Fills in the derived `gmail` marker.
    pub fn validate(value: &Value) -> Result<Account> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Validation("account: expected an object".to_string()))?;

        let missing: Vec<&str> = REQUIRED
            .iter()
            .filter(|k| !obj.get(**k).map(Value::is_string).unwrap_or(false))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "account: missing or non-string fields: {}",
                missing.join(", ")
            )));
        }
        for key in ["imap_port", "smtp_port"] {
            if let Some(v) = obj.get(key) {
                if !v.is_u64() {
                    return Err(Error::Validation(format!(
                        "account: {key} must be an integer"
                    )));
                }
            }
        }

        let mut account: Account = serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("account: {e}")))?;
        if account.gmail.is_none() {
            account.gmail = Some(account.imap_host == "imap.gmail.com");
        }
        Ok(account)
    }

    pub fn is_gmail(&self) -> bool {
        self.gmail
            .unwrap_or_else(|| self.imap_host == "imap.gmail.com")
    }
}
