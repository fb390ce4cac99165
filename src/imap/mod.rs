//! IMAP client shared by the remote and local sides.
//!
//! One connection type covers both variants: implicit TLS when the port is
//! 993 (remote accounts), plaintext otherwise (the local daemon and tests).
//! Commands are tagged, literals honor LITERAL+ when advertised, and every
//! read or write is bounded by the configured socket timeout.

pub mod parser;
pub mod types;
pub mod utf7;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustls_native_certs::load_native_certs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::errors::{Error, Result};
use parser::{parse_response, Parsed, RawResponse, RespCode, Segment, Status, Untagged};
use types::{AppendMsg, FetchRecord, ListEntry, SelectInfo};

/// Endpoint + credentials for one IMAP server.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl ImapConfig {
    fn implicit_tls(&self) -> bool {
        self.port == 993
    }
}

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// One logged-in session. `logout` consumes the connection; operations that
/// own a connection run `let res = ...; con.logout().await; res` so the
/// session is closed on every exit path.
pub struct Connection {
    stream: BufStream<Box<dyn IoStream>>,
    host: String,
    tag: u32,
    caps: HashSet<String>,
    timeout: Duration,
    pub selected: Option<SelectInfo>,
}

enum CmdPart {
    Text(String),
    Literal(Vec<u8>),
}

async fn io<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(Error::from),
        Err(_) => Err(Error::Net(format!("{what}: socket timeout"))),
    }
}

impl Connection {
    /// Connect and read the greeting. TLS setup mirrors the system trust
    /// store; the greeting may already carry `[CAPABILITY ...]`.
    pub async fn connect(cfg: &ImapConfig) -> Result<Connection> {
        debug!(host = %cfg.host, port = cfg.port, tls = cfg.implicit_tls(), "connecting");
        let tcp = io(
            cfg.timeout,
            "connect",
            TcpStream::connect((cfg.host.as_str(), cfg.port)),
        )
        .await
        .map_err(|e| Error::Net(format!("connecting to {}:{}: {e}", cfg.host, cfg.port)))?;

        let stream: Box<dyn IoStream> = if cfg.implicit_tls() {
            let mut root_store = RootCertStore::empty();
            for cert in
                load_native_certs().map_err(|e| Error::Tls(format!("loading native certs: {e}")))?
            {
                root_store
                    .add(&Certificate(cert.0))
                    .map_err(|e| Error::Tls(format!("adding cert to root store: {e}")))?;
            }
            let config = ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(cfg.host.as_str())
                .map_err(|e| Error::Tls(format!("invalid server name {}: {e}", cfg.host)))?;
            let tls = io(cfg.timeout, "tls handshake", connector.connect(server_name, tcp))
                .await
                .map_err(|e| Error::Tls(format!("starting TLS for {}: {e}", cfg.host)))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut con = Connection {
            stream: BufStream::new(stream),
            host: cfg.host.clone(),
            tag: 0,
            caps: HashSet::new(),
            timeout: cfg.timeout,
            selected: None,
        };

        let greeting = con.read_logical().await?;
        match parse_response(greeting)? {
            Parsed::Untagged(Untagged::Condition {
                status: Status::Ok,
                code,
                ..
            }) => {
                if let Some(RespCode::Capability(caps)) = code {
                    con.set_caps(caps);
                }
            }
            Parsed::Untagged(Untagged::Bye(text)) => {
                return Err(Error::Net(format!("server rejected connection: {text}")));
            }
            other => {
                return Err(Error::Protocol(format!("unexpected greeting: {other:?}")));
            }
        }
        Ok(con)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        match self.run(vec![CmdPart::Text(cmd)]).await {
            Ok((_, code, _)) => {
                if let Some(RespCode::Capability(caps)) = code {
                    self.set_caps(caps);
                } else if self.caps.is_empty() {
                    self.capability().await?;
                }
                debug!(host = %self.host, user = %username, "logged in");
                Ok(())
            }
            Err(Error::No(text)) => Err(Error::Auth(text)),
            Err(e) => Err(e),
        }
    }

    pub async fn capability(&mut self) -> Result<()> {
        let (untagged, _, _) = self.run(vec![CmdPart::Text("CAPABILITY".into())]).await?;
        for u in untagged {
            if let Untagged::Capability(caps) = u {
                self.set_caps(caps);
            }
        }
        Ok(())
    }

    fn set_caps(&mut self, caps: Vec<String>) {
        self.caps = caps.into_iter().map(|c| c.to_ascii_uppercase()).collect();
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.contains(&cap.to_ascii_uppercase())
    }

    /// SELECT (writable) or EXAMINE (readonly), with CONDSTORE enabled when
    /// the server supports it so HIGHESTMODSEQ is reported.
    pub async fn select(&mut self, mailbox: &str, readonly: bool) -> Result<SelectInfo> {
        let verb = if readonly { "EXAMINE" } else { "SELECT" };
        let params = if self.has_cap("CONDSTORE") {
            " (CONDSTORE)"
        } else {
            ""
        };
        let cmd = format!("{verb} {}{params}", quote(mailbox));
        let (untagged, code, _) = self.run(vec![CmdPart::Text(cmd)]).await?;

        let mut info = SelectInfo {
            mailbox: mailbox.to_string(),
            readonly,
            ..Default::default()
        };
        let mut apply = |code: &RespCode| match code {
            RespCode::UidValidity(v) => info.uidvalidity = Some(*v),
            RespCode::UidNext(v) => info.uidnext = Some(*v),
            RespCode::HighestModSeq(v) => info.highestmodseq = Some(*v),
            RespCode::ReadOnly => info.readonly = true,
            RespCode::ReadWrite => info.readonly = false,
            _ => {}
        };
        for u in &untagged {
            match u {
                Untagged::Exists(n) => info.exists = *n,
                Untagged::Condition {
                    code: Some(code), ..
                } => apply(code),
                _ => {}
            }
        }
        if let Some(code) = &code {
            apply(code);
        }
        self.selected = Some(info.clone());
        Ok(info)
    }

    pub async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let (untagged, _, _) = self
            .run(vec![CmdPart::Text(format!("UID SEARCH {query}"))])
            .await?;
        let mut uids = Vec::new();
        for u in untagged {
            if let Untagged::Search(ids) = u {
                uids.extend(ids);
            }
        }
        uids.sort_unstable();
        Ok(uids)
    }

    /// UID FETCH with an optional CHANGEDSINCE modifier. `items` is the
    /// parenthesized attribute list.
    pub async fn uid_fetch(
        &mut self,
        set: &str,
        items: &str,
        changed_since: Option<u64>,
    ) -> Result<Vec<FetchRecord>> {
        if set.is_empty() {
            return Ok(Vec::new());
        }
        let cmd = match changed_since {
            Some(modseq) => format!("UID FETCH {set} {items} (CHANGEDSINCE {modseq})"),
            None => format!("UID FETCH {set} {items}"),
        };
        let (untagged, _, _) = self.run(vec![CmdPart::Text(cmd)]).await?;
        Ok(untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::Fetch(rec) => Some(rec),
                _ => None,
            })
            .collect())
    }

    /// UID STORE; unsolicited FETCH updates are discarded.
    pub async fn uid_store(&mut self, set: &str, item: &str, value: &str) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        self.run(vec![CmdPart::Text(format!("UID STORE {set} {item} {value}"))])
            .await?;
        Ok(())
    }

    pub async fn append(&mut self, mailbox: &str, msg: AppendMsg) -> Result<Vec<u32>> {
        self.multiappend(mailbox, vec![msg]).await
    }

    /// MULTIAPPEND: all messages in one command, atomically. Returns the
    /// assigned UIDs when the server reports APPENDUID.
    pub async fn multiappend(&mut self, mailbox: &str, msgs: Vec<AppendMsg>) -> Result<Vec<u32>> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        let mut parts = vec![CmdPart::Text(format!("APPEND {}", quote(mailbox)))];
        for msg in msgs {
            let mut head = format!(" ({})", msg.flags);
            if let Some(date) = &msg.internal_date {
                head.push_str(&format!(" \"{date}\""));
            }
            head.push(' ');
            parts.push(CmdPart::Text(head));
            parts.push(CmdPart::Literal(msg.raw));
        }
        let (_, code, _) = self.run(parts).await?;
        match code {
            Some(RespCode::AppendUid { uids, .. }) => Ok(uids),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn create(&mut self, mailbox: &str) -> Result<()> {
        match self
            .run(vec![CmdPart::Text(format!("CREATE {}", quote(mailbox)))])
            .await
        {
            Ok(_) => Ok(()),
            // already existing is fine for ensure-style callers
            Err(Error::No(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn expunge(&mut self) -> Result<()> {
        self.run(vec![CmdPart::Text("EXPUNGE".into())]).await?;
        Ok(())
    }

    /// LIST with special-use attributes; falls back to XLIST for servers
    /// predating RFC 6154.
    pub async fn list_special_use(&mut self) -> Result<Vec<ListEntry>> {
        let cmd = if self.has_cap("SPECIAL-USE") {
            "LIST (SPECIAL-USE) \"\" \"*\""
        } else if self.has_cap("XLIST") {
            "XLIST \"\" \"*\""
        } else {
            "LIST \"\" \"*\""
        };
        let (untagged, _, _) = self.run(vec![CmdPart::Text(cmd.into())]).await?;
        Ok(untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::List(e) => Some(e),
                _ => None,
            })
            .collect())
    }

    /// Resolve a special-use tag (`\All`, `\Sent`, ...) to a mailbox and
    /// select it. `None` when no mailbox carries the tag.
    pub async fn select_tag(&mut self, tag: &str, readonly: bool) -> Result<Option<SelectInfo>> {
        let entries = self.list_special_use().await?;
        let found = entries.into_iter().find(|e| {
            e.attrs.iter().any(|a| a.eq_ignore_ascii_case(tag))
                && !e.attrs.iter().any(|a| a.eq_ignore_ascii_case("\\NoSelect"))
        });
        match found {
            Some(entry) => Ok(Some(self.select(&entry.name, readonly).await?)),
            None => Ok(None),
        }
    }

    /// Close the session. Errors are ignored: the connection is gone either
    /// way, and logout runs on failure paths where the original error is the
    /// one worth keeping.
    pub async fn logout(mut self) {
        let _ = self.run(vec![CmdPart::Text("LOGOUT".into())]).await;
    }

    // -- wire plumbing --

    async fn run(
        &mut self,
        parts: Vec<CmdPart>,
    ) -> Result<(Vec<Untagged>, Option<RespCode>, String)> {
        self.tag += 1;
        let tag = format!("a{:04}", self.tag);
        let mut pending = Vec::new();

        io(
            self.timeout,
            "write",
            self.stream.write_all(tag.as_bytes()),
        )
        .await?;
        io(self.timeout, "write", self.stream.write_all(b" ")).await?;
        let literal_plus = self.has_cap("LITERAL+");
        for part in &parts {
            match part {
                CmdPart::Text(text) => {
                    io(self.timeout, "write", self.stream.write_all(text.as_bytes())).await?;
                }
                CmdPart::Literal(data) => {
                    if literal_plus {
                        let marker = format!("{{{}+}}\r\n", data.len());
                        io(self.timeout, "write", self.stream.write_all(marker.as_bytes()))
                            .await?;
                    } else {
                        let marker = format!("{{{}}}\r\n", data.len());
                        io(self.timeout, "write", self.stream.write_all(marker.as_bytes()))
                            .await?;
                        io(self.timeout, "flush", self.stream.flush()).await?;
                        self.await_continuation(&tag, &mut pending).await?;
                    }
                    io(self.timeout, "write", self.stream.write_all(data)).await?;
                }
            }
        }
        io(self.timeout, "write", self.stream.write_all(b"\r\n")).await?;
        io(self.timeout, "flush", self.stream.flush()).await?;

        loop {
            let resp = self.read_logical().await?;
            match parse_response(resp)? {
                Parsed::Untagged(Untagged::Bye(text)) => {
                    return Err(Error::Net(format!("server closed session: {text}")));
                }
                Parsed::Untagged(u) => pending.push(u),
                Parsed::Continuation(text) => {
                    return Err(Error::Protocol(format!("unexpected continuation: {text}")));
                }
                Parsed::Tagged {
                    tag: got,
                    status,
                    code,
                    text,
                } => {
                    if got != tag {
                        return Err(Error::Protocol(format!(
                            "response tag {got} does not match {tag}"
                        )));
                    }
                    trace!(host = %self.host, tag = %tag, ?status, "command done");
                    return match status {
                        Status::Ok => Ok((pending, code, text)),
                        Status::No => Err(Error::No(text)),
                        Status::Bad => Err(Error::Protocol(text)),
                    };
                }
            }
        }
    }

    /// Wait for the server's `+` before sending literal bytes, stashing any
    /// untagged responses that arrive first.
    async fn await_continuation(&mut self, tag: &str, pending: &mut Vec<Untagged>) -> Result<()> {
        loop {
            let resp = self.read_logical().await?;
            match parse_response(resp)? {
                Parsed::Continuation(_) => return Ok(()),
                Parsed::Untagged(u) => pending.push(u),
                Parsed::Tagged { tag: got, text, .. } if got == tag => {
                    return Err(Error::No(format!("literal rejected: {text}")));
                }
                Parsed::Tagged { text, .. } => {
                    return Err(Error::Protocol(format!("unexpected tagged reply: {text}")));
                }
            }
        }
    }

    /// Read one logical line: CRLF-terminated text, plus counted literals
    /// whenever a fragment ends with `{n}`.
    async fn read_logical(&mut self) -> Result<RawResponse> {
        let mut segments = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = io(self.timeout, "read", self.stream.read_until(b'\n', &mut line)).await?;
            if n == 0 {
                return Err(Error::Net(format!("{}: connection closed", self.host)));
            }
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            match literal_len(&text) {
                Some(len) => {
                    let mut data = vec![0u8; len];
                    io(self.timeout, "read literal", self.stream.read_exact(&mut data)).await?;
                    segments.push(Segment {
                        text,
                        literal: Some(data),
                    });
                }
                None => {
                    segments.push(Segment {
                        text,
                        literal: None,
                    });
                    return Ok(RawResponse { segments });
                }
            }
        }
    }
}

/// Does the line end with a literal marker `{n}`? Returns the byte count.
fn literal_len(text: &str) -> Option<usize> {
    let stripped = text.strip_suffix('}')?;
    let open = stripped.rfind('{')?;
    stripped[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string with `\` and `"` escaped.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
