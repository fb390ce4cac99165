//! Modified UTF-7 for mailbox and label names (RFC 3501 §5.1.3).
//!
//! Differs from RFC 2152: `&` is the shift character (encoded as `&-`), the
//! base64 alphabet uses `,` instead of `/`, and padding is forbidden.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::NO_PAD;
use base64::engine::{Engine as _, GeneralPurpose};
use once_cell::sync::Lazy;

static B64: Lazy<GeneralPurpose> = Lazy::new(|| {
    let alphabet =
        Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+,")
            .expect("static alphabet");
    GeneralPurpose::new(&alphabet, NO_PAD)
});

/// Decode a modified-UTF-7 name. Malformed input is returned unchanged;
/// servers in the wild occasionally hand out raw UTF-8 here.
pub fn decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &s[i + 1..];
        let Some(end) = rest.find('-') else {
            return s.to_string();
        };
        let run = &rest[..end];
        if run.is_empty() {
            out.push('&');
        } else {
            let Some(decoded) = decode_run(run) else {
                return s.to_string();
            };
            out.push_str(&decoded);
        }
        // skip the consumed run and its terminating '-'
        for _ in 0..end + 1 {
            chars.next();
        }
    }
    out
}

fn decode_run(run: &str) -> Option<String> {
    let bytes = B64.decode(run).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Encode a Unicode name into modified UTF-7.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run: Vec<u16> = Vec::new();

    let flush = |run: &mut Vec<u16>, out: &mut String| {
        if run.is_empty() {
            return;
        }
        let bytes: Vec<u8> = run.iter().flat_map(|u| u.to_be_bytes()).collect();
        out.push('&');
        out.push_str(&B64.encode(bytes));
        out.push('-');
        run.clear();
    };

    for c in s.chars() {
        if c == '&' {
            flush(&mut run, &mut out);
            out.push_str("&-");
        } else if (' '..='~').contains(&c) {
            flush(&mut run, &mut out);
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            run.extend_from_slice(c.encode_utf16(&mut units));
        }
    }
    flush(&mut run, &mut out);
    out
}
