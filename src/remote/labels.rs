//! Flag and label vocabulary shared by the fetcher and the reconciler.
//!
//! Gmail exposes state twice: IMAP system flags and `X-GM-LABELS`. Both are
//! finite vocabularies with a custom-string tail, so they are modeled as sum
//! types; the free-form pieces (tokenizing a raw label list, modified UTF-7)
//! live here as the label codec.

use std::collections::BTreeSet;

use crate::imap::utf7;

/// Special-use folder tags the engine selects by (RFC 6154 / XLIST).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    All,
    Inbox,
    Sent,
    Junk,
    Trash,
}

impl Special {
    pub fn as_imap(self) -> &'static str {
        match self {
            Special::All => "\\All",
            Special::Inbox => "\\Inbox",
            Special::Sent => "\\Sent",
            Special::Junk => "\\Junk",
            Special::Trash => "\\Trash",
        }
    }

    /// The keyword a message earns for having been fetched out of this
    /// folder. `\All` is every message's home and earns nothing.
    pub fn tag_keyword(self) -> Option<&'static str> {
        match self {
            Special::All => None,
            Special::Inbox => Some("#inbox"),
            Special::Sent => Some("#sent"),
            Special::Junk => Some("#spam"),
            Special::Trash => Some("#trash"),
        }
    }
}

/// A Gmail label after UTF-7 decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GmailLabel {
    Drafts,
    Starred,
    Inbox,
    Junk,
    Trash,
    Sent,
    Chats,
    Important,
    Custom(String),
}

impl GmailLabel {
    pub fn parse(decoded: &str) -> GmailLabel {
        match decoded {
            "\\Drafts" | "\\Draft" => GmailLabel::Drafts,
            "\\Starred" => GmailLabel::Starred,
            "\\Inbox" => GmailLabel::Inbox,
            "\\Junk" | "\\Spam" => GmailLabel::Junk,
            "\\Trash" => GmailLabel::Trash,
            "\\Sent" => GmailLabel::Sent,
            "\\Chats" => GmailLabel::Chats,
            "\\Important" => GmailLabel::Important,
            other => GmailLabel::Custom(other.to_string()),
        }
    }
}

/// What a single Gmail label maps to on our side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedLabel {
    Keyword(&'static str),
    /// `\Important` carries no signal we keep.
    Dropped,
    /// Needs a tag id from the registry (decoded human name).
    Custom(String),
}

pub fn map_label(label: &GmailLabel) -> MappedLabel {
    match label {
        GmailLabel::Drafts => MappedLabel::Keyword("\\Draft"),
        GmailLabel::Starred => MappedLabel::Keyword("\\Flagged"),
        GmailLabel::Inbox => MappedLabel::Keyword("#inbox"),
        GmailLabel::Junk => MappedLabel::Keyword("#spam"),
        GmailLabel::Trash => MappedLabel::Keyword("#trash"),
        GmailLabel::Sent => MappedLabel::Keyword("#sent"),
        GmailLabel::Chats => MappedLabel::Keyword("#chats"),
        GmailLabel::Important => MappedLabel::Dropped,
        GmailLabel::Custom(name) => MappedLabel::Custom(name.clone()),
    }
}

/// System flags survive as themselves; anything else in FLAGS is Gmail
/// noise and is dropped (labels are the durable channel).
pub fn map_system_flag(flag: &str) -> Option<&'static str> {
    match flag {
        "\\Answered" => Some("\\Answered"),
        "\\Flagged" => Some("\\Flagged"),
        "\\Deleted" => Some("\\Deleted"),
        "\\Seen" => Some("\\Seen"),
        "\\Draft" => Some("\\Draft"),
        _ => None,
    }
}

/// Tokenize a raw `X-GM-LABELS` list: atoms split on whitespace, quoted
/// groups kept together with `\\` collapsing to `\`, each token decoded
/// from modified UTF-7.
pub fn tokenize_labels(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut token = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped) => token.push(escaped),
                            None => break,
                        },
                        '"' => break,
                        _ => token.push(c),
                    }
                }
                tokens.push(utf7::decode(&token));
            }
            _ => {
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                tokens.push(utf7::decode(&token));
            }
        }
    }
    tokens
}

/// Result of mapping one remote message's flags+labels: resolved keywords
/// plus custom label names still needing registry ids.
#[derive(Debug, Default)]
pub struct MappedFlags {
    pub keywords: BTreeSet<String>,
    pub custom: Vec<String>,
}

/// Translate Gmail FLAGS and X-GM-LABELS into our keyword set, appending
/// the folder-of-origin tag. Flag tokens are whitespace-split and mapped
/// individually.
pub fn flags_by_gmail(
    tag: Option<Special>,
    flags: &[String],
    labels_raw: Option<&str>,
) -> MappedFlags {
    let mut out = MappedFlags::default();
    for flag in flags {
        if let Some(kept) = map_system_flag(flag) {
            out.keywords.insert(kept.to_string());
        }
    }
    if let Some(raw) = labels_raw {
        for token in tokenize_labels(raw) {
            match map_label(&GmailLabel::parse(&token)) {
                MappedLabel::Keyword(kw) => {
                    out.keywords.insert(kw.to_string());
                }
                MappedLabel::Dropped => {}
                MappedLabel::Custom(name) => out.custom.push(name),
            }
        }
    }
    if let Some(kw) = tag.and_then(Special::tag_keyword) {
        out.keywords.insert(kw.to_string());
    }
    out
}

/// Pull a `mlr/thrid/N` keyword out of a flag set, returning `N`.
pub fn take_thrid(keywords: &mut BTreeSet<String>) -> Option<u64> {
    let found = keywords
        .iter()
        .find_map(|k| k.strip_prefix("mlr/thrid/").and_then(|n| n.parse::<u64>().ok()).map(|n| (k.clone(), n)));
    match found {
        Some((key, n)) => {
            keywords.remove(&key);
            Some(n)
        }
        None => None,
    }
}

/// The labels we write back to Gmail; inverse of the labels-only mapping.
pub fn label_for_keyword(keyword: &str) -> Option<&'static str> {
    match keyword {
        "#trash" => Some("\\Trash"),
        "#spam" => Some("\\Junk"),
        "#inbox" => Some("\\Inbox"),
        "\\Flagged" => Some("\\Starred"),
        _ => None,
    }
}

pub const PUSHED_LABELS: &[&str] = &["\\Trash", "\\Junk", "\\Inbox", "\\Starred"];

/// Labels that are also folders: removing one while the message lives there
/// requires relocating the message first.
pub const FOLDER_LABELS: &[&str] = &["\\Trash", "\\Junk"];

/// The flag subset under our control during a remote→local pull.
pub const SYNCED_FLAGS: &[&str] = &["#trash", "#spam", "#inbox", "\\Flagged", "\\Seen"];
