//! Test data model and command evaluation for the fake server.
//!
//! The store holds mailboxes, messages, and CONDSTORE bookkeeping; command
//! execution is synchronous and produces the full response bytes, so the
//! network layer only frames lines and literals.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

#[derive(Debug, Clone)]
pub struct Msg {
    pub uid: u32,
    pub flags: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub internal_date: String,
    pub body: Vec<u8>,
    pub modseq: u64,
    pub gm_msgid: Option<u64>,
    pub gm_thrid: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: u64,
    pub special_use: Option<String>,
    pub msgs: Vec<Msg>,
}

impl Mailbox {
    pub fn new(uidvalidity: u32) -> Mailbox {
        Mailbox {
            uidvalidity,
            uidnext: 1,
            highestmodseq: 1,
            special_use: None,
            msgs: Vec::new(),
        }
    }

    pub fn special(mut self, tag: &str) -> Mailbox {
        self.special_use = Some(tag.to_string());
        self
    }

    fn bump(&mut self) -> u64 {
        self.highestmodseq += 1;
        self.highestmodseq
    }

    pub fn add(&mut self, mut msg: Msg) -> u32 {
        let uid = self.uidnext;
        self.uidnext += 1;
        msg.uid = uid;
        msg.modseq = self.bump();
        self.msgs.push(msg);
        uid
    }
}

/// Build a message with sensible defaults for tests.
pub fn message(body: &[u8]) -> Msg {
    Msg {
        uid: 0,
        flags: BTreeSet::new(),
        labels: BTreeSet::new(),
        internal_date: "25-Jul-2026 10:11:12 +0000".to_string(),
        body: body.to_vec(),
        modseq: 0,
        gm_msgid: None,
        gm_thrid: None,
    }
}

#[derive(Debug, Default)]
pub struct Store {
    pub mailboxes: BTreeMap<String, Mailbox>,
    /// Advertise CONDSTORE + X-GM-EXT-1.
    pub gmail: bool,
    pub condstore: bool,
}

impl Store {
    pub fn new() -> Store {
        Store {
            mailboxes: BTreeMap::new(),
            gmail: false,
            condstore: true,
        }
    }

    pub fn with_box(mut self, name: &str, mailbox: Mailbox) -> Store {
        self.mailboxes.insert(name.to_string(), mailbox);
        self
    }

    fn find_special(&self, tag: &str) -> Option<String> {
        self.mailboxes
            .iter()
            .find(|(_, m)| m.special_use.as_deref() == Some(tag))
            .map(|(name, _)| name.clone())
    }
}

#[derive(Debug, Default)]
pub struct Session {
    pub selected: Option<String>,
    pub readonly: bool,
    pub done: bool,
}

/// One framed command: the text parts with their literals inlined in order.
#[derive(Debug)]
pub struct Command {
    pub parts: Vec<(String, Option<Vec<u8>>)>,
}

impl Command {
    fn text(&self) -> String {
        self.parts
            .iter()
            .map(|(t, _)| t.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn execute(store: &mut Store, session: &mut Session, cmd: &Command) -> Vec<u8> {
    let text = cmd.parts[0].0.clone();
    let mut tokens = tokenize(&text);
    if tokens.is_empty() {
        return b"* BAD empty\r\n".to_vec();
    }
    let tag = tokens.remove(0);
    if tokens.is_empty() {
        return format!("{tag} BAD missing command\r\n").into_bytes();
    }
    let mut verb = tokens.remove(0).to_ascii_uppercase();
    if verb == "UID" && !tokens.is_empty() {
        verb = format!("UID {}", tokens.remove(0).to_ascii_uppercase());
    }

    let mut out = Vec::new();
    match verb.as_str() {
        "CAPABILITY" => {
            out.extend_from_slice(caps_line(store).as_bytes());
            out.extend_from_slice(format!("{tag} OK CAPABILITY completed\r\n").as_bytes());
        }
        "NOOP" => out.extend_from_slice(format!("{tag} OK NOOP completed\r\n").as_bytes()),
        "LOGIN" => {
            out.extend_from_slice(
                format!("{tag} OK [{}] LOGIN completed\r\n", caps_code(store)).as_bytes(),
            );
        }
        "LOGOUT" => {
            session.done = true;
            out.extend_from_slice(b"* BYE logging out\r\n");
            out.extend_from_slice(format!("{tag} OK LOGOUT completed\r\n").as_bytes());
        }
        "CREATE" => {
            let name = tokens.first().cloned().unwrap_or_default();
            if store.mailboxes.contains_key(&name) {
                out.extend_from_slice(
                    format!("{tag} NO [ALREADYEXISTS] mailbox exists\r\n").as_bytes(),
                );
            } else {
                store.mailboxes.insert(name, Mailbox::new(1));
                out.extend_from_slice(format!("{tag} OK CREATE completed\r\n").as_bytes());
            }
        }
        "LIST" | "XLIST" | "LSUB" => {
            for (name, mbox) in &store.mailboxes {
                let mut attrs = vec!["\\HasNoChildren".to_string()];
                if let Some(special) = &mbox.special_use {
                    attrs.push(special.clone());
                }
                out.extend_from_slice(
                    format!("* LIST ({}) \"/\" \"{name}\"\r\n", attrs.join(" ")).as_bytes(),
                );
            }
            out.extend_from_slice(format!("{tag} OK LIST completed\r\n").as_bytes());
        }
        "SELECT" | "EXAMINE" => {
            let name = tokens.first().cloned().unwrap_or_default();
            match store.mailboxes.get(&name) {
                None => out.extend_from_slice(
                    format!("{tag} NO [TRYCREATE] no such mailbox\r\n").as_bytes(),
                ),
                Some(mbox) => {
                    session.selected = Some(name.clone());
                    session.readonly = verb == "EXAMINE";
                    out.extend_from_slice(format!("* {} EXISTS\r\n", mbox.msgs.len()).as_bytes());
                    out.extend_from_slice(b"* 0 RECENT\r\n");
                    out.extend_from_slice(b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n");
                    out.extend_from_slice(
                        format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", mbox.uidvalidity).as_bytes(),
                    );
                    out.extend_from_slice(
                        format!("* OK [UIDNEXT {}] predicted next UID\r\n", mbox.uidnext).as_bytes(),
                    );
                    if store.condstore {
                        out.extend_from_slice(
                            format!("* OK [HIGHESTMODSEQ {}] highest\r\n", mbox.highestmodseq)
                                .as_bytes(),
                        );
                    }
                    let access = if session.readonly { "READ-ONLY" } else { "READ-WRITE" };
                    out.extend_from_slice(
                        format!("{tag} OK [{access}] {verb} completed\r\n").as_bytes(),
                    );
                }
            }
        }
        "UID SEARCH" => match selected(store, session) {
            Err(e) => out.extend_from_slice(format!("{tag} NO {e}\r\n").as_bytes()),
            Ok(mbox) => {
                let max = mbox.msgs.iter().map(|m| m.uid).max().unwrap_or(0);
                let uids: Vec<String> = match parse_terms(&tokens) {
                    Some(terms) => mbox
                        .msgs
                        .iter()
                        .filter(|m| terms.iter().all(|t| t.matches(m, max)))
                        .map(|m| m.uid.to_string())
                        .collect(),
                    None => {
                        out.extend_from_slice(format!("{tag} BAD bad search\r\n").as_bytes());
                        return out;
                    }
                };
                let line = if uids.is_empty() {
                    "* SEARCH\r\n".to_string()
                } else {
                    format!("* SEARCH {}\r\n", uids.join(" "))
                };
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(format!("{tag} OK SEARCH completed\r\n").as_bytes());
            }
        },
        "UID FETCH" => match fetch(store, session, &tokens) {
            Err(e) => out.extend_from_slice(format!("{tag} BAD {e}\r\n").as_bytes()),
            Ok(body) => {
                out.extend_from_slice(&body);
                out.extend_from_slice(format!("{tag} OK FETCH completed\r\n").as_bytes());
            }
        },
        "UID STORE" => match uid_store(store, session, &tokens) {
            Err(e) => out.extend_from_slice(format!("{tag} NO {e}\r\n").as_bytes()),
            Ok(()) => out.extend_from_slice(format!("{tag} OK STORE completed\r\n").as_bytes()),
        },
        "APPEND" => match append(store, cmd) {
            Err(e) => out.extend_from_slice(format!("{tag} NO {e}\r\n").as_bytes()),
            Ok((uidvalidity, uids)) => {
                let set: Vec<String> = uids.iter().map(u32::to_string).collect();
                out.extend_from_slice(
                    format!(
                        "{tag} OK [APPENDUID {uidvalidity} {}] APPEND completed\r\n",
                        set.join(",")
                    )
                    .as_bytes(),
                );
            }
        },
        "EXPUNGE" => match selected_name(session) {
            Err(e) => out.extend_from_slice(format!("{tag} NO {e}\r\n").as_bytes()),
            Ok(name) => {
                let mbox = store.mailboxes.get_mut(&name).unwrap();
                mbox.msgs.retain(|m| !m.flags.contains("\\Deleted"));
                out.extend_from_slice(format!("{tag} OK EXPUNGE completed\r\n").as_bytes());
            }
        },
        other => {
            out.extend_from_slice(format!("{tag} BAD unknown command {other}\r\n").as_bytes())
        }
    }
    out
}

fn caps_line(store: &Store) -> String {
    format!("* CAPABILITY {}\r\n", caps(store))
}

fn caps_code(store: &Store) -> String {
    format!("CAPABILITY {}", caps(store))
}

fn caps(store: &Store) -> String {
    let mut caps = vec!["IMAP4rev1", "UIDPLUS", "LITERAL+", "SPECIAL-USE", "XLIST"];
    if store.condstore {
        caps.push("CONDSTORE");
    }
    if store.gmail {
        caps.push("X-GM-EXT-1");
    }
    caps.join(" ")
}

fn selected<'a>(store: &'a Store, session: &Session) -> Result<&'a Mailbox, String> {
    let name = selected_name(session)?;
    store
        .mailboxes
        .get(&name)
        .ok_or_else(|| "selected mailbox is gone".to_string())
}

fn selected_name(session: &Session) -> Result<String, String> {
    session
        .selected
        .clone()
        .ok_or_else(|| "no mailbox selected".to_string())
}

// -- FETCH --

fn fetch(store: &mut Store, session: &Session, tokens: &[String]) -> Result<Vec<u8>, String> {
    let name = selected_name(session)?;
    let mbox = store
        .mailboxes
        .get(&name)
        .ok_or("selected mailbox is gone")?;

    let set = tokens.first().ok_or("missing sequence set")?;
    let uids = expand_set(set, mbox);

    let items_text = tokens[1..].join(" ");
    let changed_since = items_text
        .to_ascii_uppercase()
        .find("CHANGEDSINCE")
        .and_then(|idx| {
            items_text[idx + "CHANGEDSINCE".len()..]
                .trim_start()
                .trim_end_matches(')')
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<u64>().ok())
        });
    let upper = items_text.to_ascii_uppercase();

    let header_fields: Option<Vec<String>> = upper.find("HEADER.FIELDS").map(|idx| {
        let rest = &items_text[idx..];
        rest.find('(')
            .and_then(|open| rest[open + 1..].find(')').map(|close| {
                rest[open + 1..open + 1 + close]
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            }))
            .unwrap_or_default()
    });
    let want_full_body = upper.contains("BODY.PEEK[]") || upper.contains("BODY[]");

    let mut out = Vec::new();
    for (seq0, msg) in mbox.msgs.iter().enumerate() {
        if !uids.contains(&msg.uid) {
            continue;
        }
        if let Some(since) = changed_since {
            if msg.modseq <= since {
                continue;
            }
        }
        let mut attrs: Vec<Vec<u8>> = vec![format!("UID {}", msg.uid).into_bytes()];
        if upper.contains("FLAGS") {
            let flags: Vec<&str> = msg.flags.iter().map(String::as_str).collect();
            attrs.push(format!("FLAGS ({})", flags.join(" ")).into_bytes());
        }
        if upper.contains("INTERNALDATE") {
            attrs.push(format!("INTERNALDATE \"{}\"", msg.internal_date).into_bytes());
        }
        if upper.contains("X-GM-MSGID") && store.gmail {
            if let Some(id) = msg.gm_msgid {
                attrs.push(format!("X-GM-MSGID {id}").into_bytes());
            }
        }
        if upper.contains("X-GM-THRID") && store.gmail {
            if let Some(id) = msg.gm_thrid {
                attrs.push(format!("X-GM-THRID {id}").into_bytes());
            }
        }
        if upper.contains("X-GM-LABELS") && store.gmail {
            let labels: Vec<String> = msg
                .labels
                .iter()
                .map(|l| {
                    if l.contains(' ') || l.contains('\\') && !l.starts_with('\\') {
                        format!("\"{}\"", l.replace('\\', "\\\\"))
                    } else {
                        l.clone()
                    }
                })
                .collect();
            attrs.push(format!("X-GM-LABELS ({})", labels.join(" ")).into_bytes());
        }
        if changed_since.is_some() || upper.contains("MODSEQ") {
            attrs.push(format!("MODSEQ ({})", msg.modseq).into_bytes());
        }
        if let Some(fields) = &header_fields {
            let selected = select_headers(&msg.body, fields);
            let mut attr =
                format!("BODY[HEADER.FIELDS ({})] {{{}}}\r\n", fields.join(" "), selected.len())
                    .into_bytes();
            attr.extend_from_slice(&selected);
            attrs.push(attr);
        }
        if want_full_body {
            let mut attr = format!("BODY[] {{{}}}\r\n", msg.body.len()).into_bytes();
            attr.extend_from_slice(&msg.body);
            attrs.push(attr);
        }

        out.extend_from_slice(format!("* {} FETCH (", seq0 + 1).as_bytes());
        for (i, attr) in attrs.iter().enumerate() {
            if i > 0 {
                out.push(b' ');
            }
            out.extend_from_slice(attr);
        }
        out.extend_from_slice(b")\r\n");
    }
    Ok(out)
}

fn select_headers(body: &[u8], fields: &[String]) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let headers = text.split("\r\n\r\n").next().unwrap_or("");
    let mut out = String::new();
    for line in headers.lines() {
        if let Some((name, _)) = line.split_once(':') {
            if fields.iter().any(|f| f.eq_ignore_ascii_case(name.trim())) {
                out.push_str(line);
                out.push_str("\r\n");
            }
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn expand_set(set: &str, mbox: &Mailbox) -> BTreeSet<u32> {
    let max = mbox.msgs.iter().map(|m| m.uid).max().unwrap_or(0);
    let mut uids = BTreeSet::new();
    for part in set.split(',') {
        match part.split_once(':') {
            Some((a, b)) => {
                let a: u32 = a.parse().unwrap_or(1);
                let b: u32 = if b == "*" { max.max(a) } else { b.parse().unwrap_or(a) };
                for uid in a.min(b)..=a.max(b) {
                    uids.insert(uid);
                }
                // `n:*` always covers the highest message
                if part.ends_with('*') {
                    uids.insert(max);
                }
            }
            None => {
                if part == "*" {
                    uids.insert(max);
                } else if let Ok(uid) = part.parse() {
                    uids.insert(uid);
                }
            }
        }
    }
    uids.remove(&0);
    uids
}

// -- STORE --

fn uid_store(store: &mut Store, session: &Session, tokens: &[String]) -> Result<(), String> {
    let name = selected_name(session)?;
    let set = tokens.first().ok_or("missing sequence set")?.clone();
    let item = tokens.get(1).ok_or("missing store item")?.to_ascii_uppercase();
    let values: Vec<String> = tokens[2..]
        .iter()
        .flat_map(|t| tokenize(t.trim_matches(|c| c == '(' || c == ')')))
        .filter(|t| !t.is_empty())
        .collect();

    let gmail = store.gmail;
    let mbox = store
        .mailboxes
        .get_mut(&name)
        .ok_or("selected mailbox is gone")?;
    let uids = expand_set(&set, mbox);

    let mut relocate: Vec<u32> = Vec::new();
    for msg in mbox.msgs.iter_mut() {
        if !uids.contains(&msg.uid) {
            continue;
        }
        match item.as_str() {
            "+FLAGS" | "+FLAGS.SILENT" => {
                msg.flags.extend(values.iter().cloned());
            }
            "-FLAGS" | "-FLAGS.SILENT" => {
                for v in &values {
                    msg.flags.remove(v);
                }
            }
            "+X-GM-LABELS" => {
                msg.labels.extend(values.iter().cloned());
                if gmail
                    && values.iter().any(|v| v == "\\Inbox")
                    && matches!(mbox.special_use.as_deref(), Some("\\Trash") | Some("\\Junk"))
                {
                    relocate.push(msg.uid);
                }
            }
            "-X-GM-LABELS" => {
                for v in &values {
                    msg.labels.remove(v);
                }
            }
            other => return Err(format!("unsupported store item {other}")),
        }
        msg.modseq = mbox.highestmodseq + 1;
        mbox.highestmodseq += 1;
    }

    // gmail semantics: labeling \Inbox pulls the message out of Trash/Junk
    // and back under \All
    if !relocate.is_empty() {
        let folder_label = mbox.special_use.clone().unwrap_or_default();
        let mut moved: Vec<Msg> = Vec::new();
        mbox.msgs.retain(|m| {
            if relocate.contains(&m.uid) {
                moved.push(m.clone());
                false
            } else {
                true
            }
        });
        if let Some(all_name) = store.find_special("\\All") {
            let all = store.mailboxes.get_mut(&all_name).unwrap();
            for mut msg in moved {
                msg.labels.remove(&folder_label);
                all.add(msg);
            }
        }
    }
    Ok(())
}

// -- APPEND --

fn append(store: &mut Store, cmd: &Command) -> Result<(u32, Vec<u32>), String> {
    let head = tokenize(&cmd.parts[0].0);
    // a0001 APPEND "box" ...
    let name = head.get(2).cloned().ok_or("missing mailbox")?;
    let mbox = store
        .mailboxes
        .get_mut(&name)
        .ok_or("[TRYCREATE] no such mailbox")?;
    let uidvalidity = mbox.uidvalidity;

    let mut uids = Vec::new();
    for (text, literal) in &cmd.parts {
        let Some(literal) = literal else { continue };
        let flags = text
            .rfind('(')
            .and_then(|open| text[open..].find(')').map(|close| &text[open + 1..open + close]))
            .unwrap_or("");
        // the date, when present, is the quoted string after the flag list
        let after_flags = text.rfind(')').map(|i| &text[i + 1..]).unwrap_or(text.as_str());
        let date = after_flags
            .rfind('"')
            .and_then(|end| after_flags[..end].rfind('"').map(|start| &after_flags[start + 1..end]));
        let mut msg = message(literal);
        msg.flags = flags.split_whitespace().map(str::to_string).collect();
        if let Some(date) = date {
            msg.internal_date = date.to_string();
        }
        uids.push(mbox.add(msg));
    }
    if uids.is_empty() {
        return Err("no messages in append".to_string());
    }
    Ok((uidvalidity, uids))
}

// -- SEARCH terms --

#[derive(Debug)]
enum Term {
    All,
    FlagSet(String),
    FlagUnset(String),
    Keyword(String),
    Unkeyword(String),
    Header(String, String),
    From(String),
    Text(String),
    Uid(String),
    GmMsgid(u64),
    Since(NaiveDate),
    Before(NaiveDate),
    On(NaiveDate),
    Or(Box<Term>, Box<Term>),
    Not(Box<Term>),
}

impl Term {
    fn matches(&self, msg: &Msg, max_uid: u32) -> bool {
        match self {
            Term::All => true,
            Term::FlagSet(f) => msg.flags.contains(f),
            Term::FlagUnset(f) => !msg.flags.contains(f),
            Term::Keyword(k) => msg.flags.contains(k),
            Term::Unkeyword(k) => !msg.flags.contains(k),
            Term::Header(name, value) => {
                let text = String::from_utf8_lossy(&msg.body);
                let headers = text.split("\r\n\r\n").next().unwrap_or("").to_string();
                headers.lines().any(|line| {
                    line.split_once(':').is_some_and(|(n, v)| {
                        n.trim().eq_ignore_ascii_case(name)
                            && v.to_lowercase().contains(&value.to_lowercase())
                    })
                })
            }
            Term::From(v) => Term::Header("From".into(), v.clone()).matches(msg, max_uid),
            Term::Text(v) => String::from_utf8_lossy(&msg.body)
                .to_lowercase()
                .contains(&v.to_lowercase()),
            Term::Uid(set) => set.split(',').any(|part| match part.split_once(':') {
                Some((a, b)) => {
                    let a: u32 = a.parse().unwrap_or(u32::MAX);
                    if b == "*" {
                        // `n:*` always covers the highest message, even when
                        // n is past the end
                        msg.uid >= a || msg.uid == max_uid
                    } else {
                        let b: u32 = b.parse().unwrap_or(0);
                        (a.min(b)..=a.max(b)).contains(&msg.uid)
                    }
                }
                None => part.parse() == Ok(msg.uid),
            }),
            Term::GmMsgid(id) => msg.gm_msgid == Some(*id),
            Term::Since(d) => msg_date(msg).map(|md| md >= *d).unwrap_or(false),
            Term::Before(d) => msg_date(msg).map(|md| md < *d).unwrap_or(false),
            Term::On(d) => msg_date(msg).map(|md| md == *d).unwrap_or(false),
            Term::Or(a, b) => a.matches(msg, max_uid) || b.matches(msg, max_uid),
            Term::Not(t) => !t.matches(msg, max_uid),
        }
    }
}

fn msg_date(msg: &Msg) -> Option<NaiveDate> {
    let day = msg.internal_date.split_whitespace().next()?;
    NaiveDate::parse_from_str(day, "%d-%b-%Y").ok()
}

fn parse_terms(tokens: &[String]) -> Option<Vec<Term>> {
    let mut iter = tokens.iter().peekable();
    let mut terms = Vec::new();
    while iter.peek().is_some() {
        terms.push(parse_term(&mut iter)?);
    }
    Some(terms)
}

fn parse_term<'a, I>(iter: &mut std::iter::Peekable<I>) -> Option<Term>
where
    I: Iterator<Item = &'a String>,
{
    let word = iter.next()?;
    let term = match word.to_ascii_uppercase().as_str() {
        "ALL" => Term::All,
        "SEEN" => Term::FlagSet("\\Seen".into()),
        "UNSEEN" => Term::FlagUnset("\\Seen".into()),
        "FLAGGED" => Term::FlagSet("\\Flagged".into()),
        "UNFLAGGED" => Term::FlagUnset("\\Flagged".into()),
        "DRAFT" => Term::FlagSet("\\Draft".into()),
        "UNDRAFT" => Term::FlagUnset("\\Draft".into()),
        "ANSWERED" => Term::FlagSet("\\Answered".into()),
        "DELETED" => Term::FlagSet("\\Deleted".into()),
        "KEYWORD" => Term::Keyword(iter.next()?.clone()),
        "UNKEYWORD" => Term::Unkeyword(iter.next()?.clone()),
        "HEADER" => {
            let name = iter.next()?.clone();
            let value = iter.next()?.clone();
            Term::Header(name, value)
        }
        "FROM" => Term::From(iter.next()?.clone()),
        "SUBJECT" => Term::Header("Subject".into(), iter.next()?.clone()),
        "TEXT" => Term::Text(iter.next()?.clone()),
        "UID" => Term::Uid(iter.next()?.clone()),
        "X-GM-MSGID" => Term::GmMsgid(iter.next()?.parse().ok()?),
        "SINCE" => Term::Since(NaiveDate::parse_from_str(iter.next()?, "%d-%b-%Y").ok()?),
        "BEFORE" => Term::Before(NaiveDate::parse_from_str(iter.next()?, "%d-%b-%Y").ok()?),
        "ON" => Term::On(NaiveDate::parse_from_str(iter.next()?, "%d-%b-%Y").ok()?),
        "OR" => {
            let a = parse_term(iter)?;
            let b = parse_term(iter)?;
            Term::Or(Box::new(a), Box::new(b))
        }
        "NOT" => Term::Not(Box::new(parse_term(iter)?)),
        _ => return None,
    };
    Some(term)
}

/// Split command text into tokens: whitespace-separated, quoted strings
/// unescaped, parens kept glued to their group contents for STORE values.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
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
                        '\\' => {
                            if let Some(next) = chars.next() {
                                token.push(next);
                            }
                        }
                        '"' => break,
                        _ => token.push(c),
                    }
                }
                tokens.push(token);
            }
            '(' => {
                // capture the balanced group as one token, parens included
                let mut depth = 0;
                let mut token = String::new();
                for c in chars.by_ref() {
                    token.push(c);
                    match c {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                tokens.push(token);
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
                tokens.push(token);
            }
        }
    }
    tokens
}
