//! Search DSL → IMAP SEARCH translation.
//!
//! One pass over the user string: recognized tokens are cut out and turned
//! into IMAP clauses, whatever is left becomes a full-text `text` clause.
//! String literals are JSON-encoded so the server reads them as quoted
//! literals with UTF-8 intact.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Options accumulated while translating, for the caller to act on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Opts {
    pub thread: bool,
    pub threads: bool,
    pub tags: Vec<String>,
    pub draft: Option<String>,
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)[ ]?(?:(?P<raw>:raw)(?P<raw_val>.*)|(?P<thread>thr(?:ead)?:)(?P<thread_id>\d+)|(?P<threads>:threads)|(?P<tag>(?:tag|in|has):)(?P<tag_id>[^ ]+)|(?P<subj>subj(?:ect)?:)(?P<subj_val>"[^"]*"|\S*)|(?P<from>from:)(?P<from_val>[^ ]+)|(?P<mid>(?:message_id|mid):)(?P<mid_val>[^ ]+)|(?P<ref>ref:)(?P<ref_val>[^ ]+)|(?P<uid>uid:)(?P<uid_val>\d+)|(?P<date>date:)(?P<date_val>\d{4}(?:-\d{2}(?:-\d{2})?)?)|(?P<draft_edit>draft:(?P<draft_val><.{8}>))|(?P<draft>:draft)|(?P<unseen>:(?:unread|unseen))|(?P<seen>:(?:read|seen))|(?P<flagged>:(?:pin(?:ned)?|flagged))|(?P<unflagged>:(?:unpin(?:ned)?|unflagged)))(?: |$)"#,
    )
    .expect("static token grammar")
});

fn escape(val: &str) -> String {
    serde_json::to_string(val).unwrap_or_else(|_| format!("\"{val}\""))
}

/// Translate a user query into `(imap_search_expression, opts)`.
pub fn parse_query(q: &str) -> (String, Opts) {
    let mut opts = Opts::default();
    let mut parts: Vec<String> = Vec::new();

    let leftover = TOKEN_RE.replace_all(q, |caps: &Captures| {
        let clause = translate_token(caps, &mut opts);
        if let Some(clause) = clause {
            if !clause.is_empty() {
                parts.push(clause);
            }
        }
        " ".to_string()
    });

    let free_text = leftover.split_whitespace().collect::<Vec<_>>().join(" ");
    if !free_text.is_empty() {
        parts.push(format!("text {}", escape(&free_text)));
    }

    parts.push("unkeyword #link".to_string());
    if !opts.tags.iter().any(|t| t == "#trash") {
        parts.push("unkeyword #trash".to_string());
    }
    if !opts.tags.iter().any(|t| t == "#spam" || t == "#trash") {
        parts.push("unkeyword #spam".to_string());
    }

    let expr = parts.join(" ").trim().to_string();
    let expr = if expr.is_empty() {
        "all".to_string()
    } else {
        expr
    };
    (expr, opts)
}

fn translate_token(caps: &Captures, opts: &mut Opts) -> Option<String> {
    // one-word flag states first, they have no value group
    for (group, flag) in [
        ("draft", "draft"),
        ("unseen", "unseen"),
        ("seen", "seen"),
        ("flagged", "flagged"),
        ("unflagged", "unflagged"),
    ] {
        if caps.name(group).is_some() {
            return Some(flag.to_string());
        }
    }

    if caps.name("raw").is_some() {
        return Some(caps["raw_val"].trim().to_string());
    }
    if caps.name("thread").is_some() {
        opts.thread = true;
        return Some(format!("uid {}", &caps["thread_id"]));
    }
    if caps.name("threads").is_some() {
        opts.threads = true;
        return Some(String::new());
    }
    if caps.name("draft_edit").is_some() {
        let id = caps["draft_val"].to_string();
        opts.thread = true;
        let clause = format!("header x-draft-id {id}");
        opts.draft = Some(id);
        return Some(clause);
    }
    if caps.name("tag").is_some() {
        let id = caps["tag_id"].to_string();
        let clause = format!("keyword {id}");
        opts.tags.push(id);
        return Some(clause);
    }
    if caps.name("subj").is_some() {
        let val = caps["subj_val"].trim_matches('"');
        return Some(format!("header subject {}", escape(val)));
    }
    if caps.name("from").is_some() {
        return Some(format!("from {}", escape(&caps["from_val"])));
    }
    if caps.name("mid").is_some() {
        return Some(format!("header message-id {}", &caps["mid_val"]));
    }
    if caps.name("ref").is_some() {
        let val = &caps["ref_val"];
        return Some(format!(
            "or header message-id {val} header references {val}"
        ));
    }
    if caps.name("uid").is_some() {
        return Some(format!("uid {}", &caps["uid_val"]));
    }
    if caps.name("date").is_some() {
        return date_clause(&caps["date_val"]);
    }
    None
}

/// `date:YYYY[-MM[-DD]]` widens to the containing year/month, with an
/// exclusive upper bound; a full day becomes `on`.
fn date_clause(val: &str) -> Option<String> {
    let imap = |d: NaiveDate| d.format("%d-%b-%Y").to_string();
    match val.matches('-').count() {
        0 => {
            let year: i32 = val.parse().ok()?;
            let since = NaiveDate::from_ymd_opt(year, 1, 1)?;
            let before = NaiveDate::from_ymd_opt(year + 1, 1, 1)?;
            Some(format!("since {} before {}", imap(since), imap(before)))
        }
        1 => {
            let (y, m) = val.split_once('-')?;
            let year: i32 = y.parse().ok()?;
            let month: u32 = m.parse().ok()?;
            let since = NaiveDate::from_ymd_opt(year, month, 1)?;
            let before = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)?
            };
            Some(format!("since {} before {}", imap(since), imap(before)))
        }
        _ => {
            let date = NaiveDate::parse_from_str(val, "%Y-%m-%d").ok()?;
            Some(format!("on {}", imap(date)))
        }
    }
}
