//! Structured IMAP response parser.
//!
//! A response is one logical line: text segments interleaved with counted
//! literals. The parser first flattens segments into a token stream (atoms,
//! quoted strings, literals, brackets), then reads typed responses out of
//! it. FETCH attributes are accepted in any order; unknown attributes and
//! response codes are skipped structurally instead of failing the line.

use crate::errors::{Error, Result};
use crate::imap::types::{FetchRecord, ListEntry};

/// One text fragment of a logical line plus the literal that followed it,
/// if the fragment ended with `{n}`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    pub literal: Option<Vec<u8>>,
}

/// A complete logical line as read from the socket.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespCode {
    UidValidity(u32),
    UidNext(u32),
    HighestModSeq(u64),
    ReadOnly,
    ReadWrite,
    Capability(Vec<String>),
    AppendUid { uidvalidity: u32, uids: Vec<u32> },
    PermanentFlags(Vec<String>),
    Other(String),
}

#[derive(Debug, Clone)]
pub enum Untagged {
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch(FetchRecord),
    Search(Vec<u32>),
    Flags(Vec<String>),
    Capability(Vec<String>),
    List(ListEntry),
    Condition {
        status: Status,
        code: Option<RespCode>,
        text: String,
    },
    Bye(String),
    Other(String),
}

#[derive(Debug, Clone)]
pub enum Parsed {
    Untagged(Untagged),
    Tagged {
        tag: String,
        status: Status,
        code: Option<RespCode>,
        text: String,
    },
    Continuation(String),
}

pub fn parse_response(resp: RawResponse) -> Result<Parsed> {
    let first = resp
        .segments
        .first()
        .map(|s| s.text.as_str())
        .unwrap_or_default();
    if let Some(rest) = first.strip_prefix('+') {
        return Ok(Parsed::Continuation(rest.trim().to_string()));
    }

    let tokens = tokenize(resp)?;
    let mut cur = Cursor::new(tokens);
    let head = cur.atom()?;
    if head == "*" {
        return Ok(Parsed::Untagged(parse_untagged(&mut cur)?));
    }

    let status = parse_status(&cur.atom()?)
        .ok_or_else(|| Error::Protocol(format!("unexpected tagged response after {head}")))?;
    let (code, text) = parse_resp_text(&mut cur)?;
    Ok(Parsed::Tagged {
        tag: head,
        status,
        code,
        text,
    })
}

fn parse_status(word: &str) -> Option<Status> {
    match word.to_ascii_uppercase().as_str() {
        "OK" => Some(Status::Ok),
        "NO" => Some(Status::No),
        "BAD" => Some(Status::Bad),
        _ => None,
    }
}

fn parse_untagged(cur: &mut Cursor) -> Result<Untagged> {
    let word = cur.atom()?;

    if let Ok(n) = word.parse::<u32>() {
        let kind = cur.atom()?.to_ascii_uppercase();
        return match kind.as_str() {
            "EXISTS" => Ok(Untagged::Exists(n)),
            "RECENT" => Ok(Untagged::Recent(n)),
            "EXPUNGE" => Ok(Untagged::Expunge(n)),
            "FETCH" => parse_fetch(n, cur).map(Untagged::Fetch),
            _ => Ok(Untagged::Other(format!("{n} {kind}"))),
        };
    }

    match word.to_ascii_uppercase().as_str() {
        "OK" | "NO" | "BAD" => {
            let status = parse_status(&word).expect("status keyword");
            let (code, text) = parse_resp_text(cur)?;
            Ok(Untagged::Condition { status, code, text })
        }
        "BYE" => Ok(Untagged::Bye(cur.rest_text())),
        "CAPABILITY" => Ok(Untagged::Capability(cur.atoms_to_end())),
        "SEARCH" => parse_search(cur),
        "FLAGS" => Ok(Untagged::Flags(cur.flag_list()?)),
        "LIST" | "XLIST" | "LSUB" => parse_list(cur).map(Untagged::List),
        other => Ok(Untagged::Other(other.to_string())),
    }
}

/// `* SEARCH 1 2 3` with an optional CONDSTORE `(MODSEQ n)` trailer.
fn parse_search(cur: &mut Cursor) -> Result<Untagged> {
    let mut ids = Vec::new();
    loop {
        match cur.peek() {
            None => break,
            Some(Token::LParen) => {
                cur.skip_balanced()?;
            }
            _ => {
                let atom = cur.atom()?;
                let id = atom
                    .parse::<u32>()
                    .map_err(|_| Error::Protocol(format!("bad SEARCH id {atom}")))?;
                ids.push(id);
            }
        }
    }
    Ok(Untagged::Search(ids))
}

fn parse_list(cur: &mut Cursor) -> Result<ListEntry> {
    let attrs = cur.flag_list()?;
    let delimiter = match cur.next() {
        Some(Token::Quoted(s)) => Some(s),
        Some(Token::Atom(a)) if a.eq_ignore_ascii_case("NIL") => None,
        other => {
            return Err(Error::Protocol(format!("bad LIST delimiter: {other:?}")));
        }
    };
    let name = cur.string()?;
    Ok(ListEntry {
        attrs,
        delimiter,
        name,
    })
}

fn parse_resp_text(cur: &mut Cursor) -> Result<(Option<RespCode>, String)> {
    let code = if matches!(cur.peek(), Some(Token::LBracket)) {
        cur.next();
        Some(parse_resp_code(cur)?)
    } else {
        None
    };
    Ok((code, cur.rest_text()))
}

fn parse_resp_code(cur: &mut Cursor) -> Result<RespCode> {
    let name = cur.atom()?.to_ascii_uppercase();
    let code = match name.as_str() {
        "UIDVALIDITY" => RespCode::UidValidity(cur.number()? as u32),
        "UIDNEXT" => RespCode::UidNext(cur.number()? as u32),
        "HIGHESTMODSEQ" => RespCode::HighestModSeq(cur.number()?),
        "READ-ONLY" => RespCode::ReadOnly,
        "READ-WRITE" => RespCode::ReadWrite,
        "CAPABILITY" => {
            let mut caps = Vec::new();
            while !matches!(cur.peek(), Some(Token::RBracket) | None) {
                caps.push(cur.atom()?);
            }
            RespCode::Capability(caps)
        }
        "APPENDUID" => {
            let uidvalidity = cur.number()? as u32;
            let uids = parse_uid_sequence(&cur.atom()?)?;
            RespCode::AppendUid { uidvalidity, uids }
        }
        "PERMANENTFLAGS" => RespCode::PermanentFlags(cur.flag_list()?),
        _ => {
            // consume the unknown code body up to its closing bracket
            while !matches!(cur.peek(), Some(Token::RBracket) | None) {
                cur.skip_value()?;
            }
            RespCode::Other(name)
        }
    };
    match cur.next() {
        Some(Token::RBracket) => Ok(code),
        other => Err(Error::Protocol(format!(
            "unterminated response code: {other:?}"
        ))),
    }
}

/// Expand `1:3,7` as used by APPENDUID.
fn parse_uid_sequence(s: &str) -> Result<Vec<u32>> {
    let mut uids = Vec::new();
    for part in s.split(',') {
        match part.split_once(':') {
            Some((a, b)) => {
                let a: u32 = a
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad uid set {s}")))?;
                let b: u32 = b
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad uid set {s}")))?;
                uids.extend(a.min(b)..=a.max(b));
            }
            None => uids.push(
                part.parse()
                    .map_err(|_| Error::Protocol(format!("bad uid set {s}")))?,
            ),
        }
    }
    Ok(uids)
}

fn parse_fetch(seq: u32, cur: &mut Cursor) -> Result<FetchRecord> {
    let mut rec = FetchRecord::new(seq);
    cur.expect(Token::LParen)?;
    loop {
        match cur.peek() {
            Some(Token::RParen) => {
                cur.next();
                break;
            }
            None => return Err(Error::Protocol("unterminated FETCH list".to_string())),
            _ => {}
        }
        let attr = cur.atom()?.to_ascii_uppercase();
        match attr.as_str() {
            "UID" => rec.uid = Some(cur.number()? as u32),
            "FLAGS" => rec.flags = cur.flag_list()?,
            "INTERNALDATE" => rec.internal_date = Some(cur.string()?),
            "RFC822.SIZE" => rec.size = Some(cur.number()? as u32),
            "MODSEQ" => {
                cur.expect(Token::LParen)?;
                rec.modseq = Some(cur.number()?);
                cur.expect(Token::RParen)?;
            }
            "X-GM-MSGID" => rec.gm_msgid = Some(cur.number()?),
            "X-GM-THRID" => rec.gm_thrid = Some(cur.number()?),
            "X-GM-LABELS" => rec.gm_labels = Some(cur.raw_list()?),
            "BODY" | "BODY.PEEK" => {
                let section = cur.section()?;
                let value = cur.bytes_value()?;
                if section.is_empty() {
                    rec.body = value;
                } else if section.to_ascii_uppercase().starts_with("HEADER") {
                    rec.header_fields = value;
                } // other sections were not requested; drop them
            }
            "ENVELOPE" | "BODYSTRUCTURE" => cur.skip_value()?,
            _ => cur.skip_value()?,
        }
    }
    Ok(rec)
}

// -- token stream --

fn tokenize(resp: RawResponse) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    for seg in resp.segments {
        let b = seg.text.as_bytes();
        let mut i = 0;
        while i < b.len() {
            match b[i] {
                b' ' => i += 1,
                b'(' => {
                    tokens.push(Token::LParen);
                    i += 1;
                }
                b')' => {
                    tokens.push(Token::RParen);
                    i += 1;
                }
                b'[' => {
                    tokens.push(Token::LBracket);
                    i += 1;
                }
                b']' => {
                    tokens.push(Token::RBracket);
                    i += 1;
                }
                b'"' => {
                    let (s, next) = take_quoted(&seg.text, i)?;
                    tokens.push(Token::Quoted(s));
                    i = next;
                }
                b'{' => {
                    // `{n}` closes the segment; the literal itself follows
                    // as the segment's payload
                    let close = seg.text[i..]
                        .find('}')
                        .ok_or_else(|| Error::Protocol("unterminated literal marker".into()))?;
                    i += close + 1;
                }
                _ => {
                    let start = i;
                    while i < b.len() && !matches!(b[i], b' ' | b'(' | b')' | b'[' | b']' | b'"' | b'{') {
                        i += 1;
                    }
                    tokens.push(Token::Atom(seg.text[start..i].to_string()));
                }
            }
        }
        if let Some(lit) = seg.literal {
            tokens.push(Token::Literal(lit));
        }
    }
    Ok(tokens)
}

fn take_quoted(s: &str, start: usize) -> Result<(String, usize)> {
    let b = s.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    while i < b.len() {
        match b[i] {
            b'\\' if i + 1 < b.len() => {
                out.push(b[i + 1] as char);
                i += 2;
            }
            b'"' => return Ok((out, i + 1)),
            _ => {
                // multi-byte chars pass through untouched
                let ch_len = s[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&s[i..i + ch_len]);
                i += ch_len;
            }
        }
    }
    Err(Error::Protocol("unterminated quoted string".to_string()))
}

struct Cursor {
    tokens: std::vec::IntoIter<Token>,
    peeked: Option<Token>,
}

impl Cursor {
    fn new(tokens: Vec<Token>) -> Self {
        Cursor {
            tokens: tokens.into_iter(),
            peeked: None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        self.peeked.take().or_else(|| self.tokens.next())
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.tokens.next();
        }
        self.peeked.as_ref()
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(Error::Protocol(format!(
                "expected {want:?}, got {other:?}"
            ))),
        }
    }

    fn atom(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Atom(a)) => Ok(a),
            other => Err(Error::Protocol(format!("expected atom, got {other:?}"))),
        }
    }

    fn number(&mut self) -> Result<u64> {
        let a = self.atom()?;
        a.parse()
            .map_err(|_| Error::Protocol(format!("expected number, got {a}")))
    }

    /// Quoted string, literal, or atom (NIL maps to empty).
    fn string(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Quoted(s)) => Ok(s),
            Some(Token::Atom(a)) if a.eq_ignore_ascii_case("NIL") => Ok(String::new()),
            Some(Token::Atom(a)) => Ok(a),
            Some(Token::Literal(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(Error::Protocol(format!("expected string, got {other:?}"))),
        }
    }

    /// Value position that may be a literal: returns raw bytes, `None` for NIL.
    fn bytes_value(&mut self) -> Result<Option<Vec<u8>>> {
        match self.next() {
            Some(Token::Literal(bytes)) => Ok(Some(bytes)),
            Some(Token::Quoted(s)) => Ok(Some(s.into_bytes())),
            Some(Token::Atom(a)) if a.eq_ignore_ascii_case("NIL") => Ok(None),
            other => Err(Error::Protocol(format!("expected data, got {other:?}"))),
        }
    }

    /// `(atom atom ...)` of flags or mailbox attributes.
    fn flag_list(&mut self) -> Result<Vec<String>> {
        self.expect(Token::LParen)?;
        let mut flags = Vec::new();
        loop {
            match self.next() {
                Some(Token::RParen) => return Ok(flags),
                Some(Token::Atom(a)) => flags.push(a),
                Some(Token::Quoted(s)) => flags.push(s),
                other => {
                    return Err(Error::Protocol(format!("bad flag list item: {other:?}")));
                }
            }
        }
    }

    /// A parenthesized list reconstructed as its raw text, escapes restored.
    /// Used for X-GM-LABELS where decoding belongs to the label codec.
    fn raw_list(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::LParen) => {}
            // a single unparenthesized value
            _ => return Ok(self.string()?),
        }
        self.next();
        let mut parts = Vec::new();
        let mut depth = 1usize;
        loop {
            match self.next() {
                Some(Token::LParen) => {
                    depth += 1;
                    parts.push("(".to_string());
                }
                Some(Token::RParen) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(parts.join(" "));
                    }
                    parts.push(")".to_string());
                }
                Some(Token::Atom(a)) => parts.push(a),
                Some(Token::Quoted(s)) => {
                    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                    parts.push(format!("\"{escaped}\""));
                }
                Some(Token::Literal(bytes)) => {
                    parts.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(Token::LBracket) => parts.push("[".to_string()),
                Some(Token::RBracket) => parts.push("]".to_string()),
                None => return Err(Error::Protocol("unterminated list".to_string())),
            }
        }
    }

    /// The `[...]` section specifier after a BODY attribute name.
    fn section(&mut self) -> Result<String> {
        self.expect(Token::LBracket)?;
        let mut parts = Vec::new();
        loop {
            match self.next() {
                Some(Token::RBracket) => break,
                Some(Token::Atom(a)) => parts.push(a),
                Some(Token::Quoted(s)) => parts.push(s),
                Some(Token::LParen) => parts.push("(".to_string()),
                Some(Token::RParen) => parts.push(")".to_string()),
                other => {
                    return Err(Error::Protocol(format!("bad BODY section: {other:?}")));
                }
            }
        }
        // servers may follow with a partial marker like <0>, sent as an atom
        if matches!(self.peek(), Some(Token::Atom(a)) if a.starts_with('<') && a.ends_with('>')) {
            self.next();
        }
        Ok(parts.join(" "))
    }

    /// Skip one value of unknown shape: atom, string, literal, or a
    /// balanced parenthesized list.
    fn skip_value(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::LParen) => {
                let mut depth = 1usize;
                while depth > 0 {
                    match self.next() {
                        Some(Token::LParen) => depth += 1,
                        Some(Token::RParen) => depth -= 1,
                        Some(_) => {}
                        None => {
                            return Err(Error::Protocol("unterminated list".to_string()));
                        }
                    }
                }
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::Protocol("expected value".to_string())),
        }
    }

    fn skip_balanced(&mut self) -> Result<()> {
        self.skip_value()
    }

    fn atoms_to_end(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(t) = self.next() {
            if let Token::Atom(a) = t {
                out.push(a);
            }
        }
        out
    }

    fn rest_text(&mut self) -> String {
        let mut out = Vec::new();
        while let Some(t) = self.next() {
            match t {
                Token::Atom(a) => out.push(a),
                Token::Quoted(s) => out.push(s),
                Token::LParen => out.push("(".to_string()),
                Token::RParen => out.push(")".to_string()),
                Token::LBracket => out.push("[".to_string()),
                Token::RBracket => out.push("]".to_string()),
                Token::Literal(bytes) => out.push(String::from_utf8_lossy(&bytes).into_owned()),
            }
        }
        out.join(" ")
    }
}
