//! Data carried across the IMAP wire, independent of any command flow.

/// Mailbox state collected from SELECT/EXAMINE untagged responses.
#[derive(Debug, Clone, Default)]
pub struct SelectInfo {
    pub mailbox: String,
    pub exists: u32,
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub highestmodseq: Option<u64>,
    pub readonly: bool,
}

/// One untagged FETCH response, attributes in any order. Absent attributes
/// stay `None`; servers are free to send more than was asked for.
#[derive(Debug, Clone, Default)]
pub struct FetchRecord {
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    /// Verbatim INTERNALDATE contents (without quotes) so it can be passed
    /// straight back into APPEND.
    pub internal_date: Option<String>,
    pub modseq: Option<u64>,
    pub size: Option<u32>,
    /// BODY[] (full message bytes).
    pub body: Option<Vec<u8>>,
    /// BODY[HEADER.FIELDS (...)] bytes.
    pub header_fields: Option<Vec<u8>>,
    pub gm_msgid: Option<u64>,
    pub gm_thrid: Option<u64>,
    /// Raw X-GM-LABELS list contents, still quoted/escaped; decoding is the
    /// label codec's job.
    pub gm_labels: Option<String>,
}

impl FetchRecord {
    pub fn new(seq: u32) -> Self {
        FetchRecord {
            seq,
            ..Default::default()
        }
    }
}

/// One LIST/XLIST row.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub attrs: Vec<String>,
    pub delimiter: Option<String>,
    pub name: String,
}

/// One message of a MULTIAPPEND batch.
#[derive(Debug, Clone)]
pub struct AppendMsg {
    /// INTERNALDATE to preserve, as returned by a fetch.
    pub internal_date: Option<String>,
    /// Space-separated flag list, may be empty.
    pub flags: String,
    pub raw: Vec<u8>,
}

/// Compress a UID list into an IMAP sequence set (`1:5,7,10:12`).
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            i += 1;
            end = sorted[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}:{end}"));
        }
        i += 1;
    }
    out
}
