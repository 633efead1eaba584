//! Payload decoding for command output.
//!
//! The agent base64-encodes everything it captures. PowerShell additionally
//! wraps error records written to stdout in a CLIXML envelope, which is
//! flattened back to plain text here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::QgaError;

/// Prefix PowerShell puts in front of serialized output.
pub const CLIXML_MARKER: &[u8] = b"#< CLIXML";

/// Decode an optional base64 payload. Absent or empty means no bytes.
pub fn decode_payload(command: &str, raw: Option<&str>) -> Result<Vec<u8>, QgaError> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(b64) => STANDARD
            .decode(b64)
            .map_err(|e| QgaError::protocol(command, format!("invalid base64 payload: {e}"))),
    }
}

/// Unwrap a CLIXML envelope; anything without the marker is returned as is.
pub fn unwrap_clixml(data: Vec<u8>) -> Vec<u8> {
    if !data.starts_with(CLIXML_MARKER) {
        return data;
    }
    parse_clixml(&String::from_utf8_lossy(&data), "Error").into_bytes()
}

/// Collect the text of every top-level `<S S="{stream}">` element across
/// all `<Objs>` documents in `data`. Once something has been collected, each
/// further document starts with CRLF.
fn parse_clixml(mut data: &str, stream: &str) -> String {
    let mut out = String::new();
    let mut matched = false;

    while let (Some(start), Some(end)) = (data.find("<Objs"), data.find("</Objs>")) {
        let end = end + "</Objs>".len();
        if start >= end {
            data = &data[end..];
            continue;
        }
        let doc = &data[start..end];
        data = &data[end..];

        if matched {
            out.push_str("\r\n");
        }
        for (attr, text) in string_elements(doc) {
            if attr.as_deref() == Some(stream) {
                out.push_str(&unescape_ps(&unescape_xml(text)));
                matched = true;
            }
        }
    }
    out
}

/// `(S attribute, raw text)` for each `<S>` directly under `<Objs>`, in
/// document order. `<Obj>` subtrees are skipped whole.
fn string_elements(doc: &str) -> Vec<(Option<String>, &str)> {
    let mut entries = Vec::new();
    let Some(open_end) = doc.find('>') else {
        return entries;
    };
    let mut rest = &doc[open_end + 1..];

    while let Some(pos) = rest.find('<') {
        let after = &rest[pos + 1..];
        if let Some(tail) = tag_named(after, "Obj") {
            rest = skip_obj(tail);
            continue;
        }
        let Some(tail) = tag_named(after, "S") else {
            rest = after;
            continue;
        };
        let Some(tag_end) = tail.find('>') else {
            break;
        };
        let attrs = &tail[..tag_end];
        let stream = attribute(attrs, "S");
        let body = &tail[tag_end + 1..];

        if attrs.trim_end().ends_with('/') {
            entries.push((stream, ""));
            rest = body;
            continue;
        }
        let Some(close) = body.find("</S>") else {
            break;
        };
        entries.push((stream, &body[..close]));
        rest = &body[close + "</S>".len()..];
    }
    entries
}

/// If `after` (the text following a `<`) opens a `name` element, the rest of
/// the tag. `<SD>` is not `<S>`, `<Objs>` is not `<Obj>`.
fn tag_named<'a>(after: &'a str, name: &str) -> Option<&'a str> {
    after
        .strip_prefix(name)
        .filter(|t| t.starts_with(|c: char| c == '>' || c == '/' || c.is_whitespace()))
}

/// `tail` follows `<Obj`; returns the text after the matching `</Obj>`.
fn skip_obj(tail: &str) -> &str {
    let Some(end) = tail.find('>') else {
        return "";
    };
    if tail[..end].trim_end().ends_with('/') {
        return &tail[end + 1..];
    }
    let mut rest = &tail[end + 1..];
    let mut depth = 1;
    while depth > 0 {
        let Some(pos) = rest.find('<') else {
            return "";
        };
        let after = &rest[pos + 1..];
        if let Some(inner) = tag_named(after, "Obj") {
            let Some(e) = inner.find('>') else {
                return "";
            };
            if !inner[..e].trim_end().ends_with('/') {
                depth += 1;
            }
            rest = &inner[e + 1..];
        } else if let Some(inner) = after.strip_prefix("/Obj>") {
            depth -= 1;
            rest = inner;
        } else {
            rest = after;
        }
    }
    rest
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let needle = format!("{name}={quote}");
        let mut search = attrs;
        while let Some(pos) = search.find(&needle) {
            let preceded_by_space =
                pos == 0 || search[..pos].ends_with(|c: char| c.is_whitespace());
            let value_start = &search[pos + needle.len()..];
            if preceded_by_space {
                let end = value_start.find(quote)?;
                return Some(unescape_xml(&value_start[..end]));
            }
            search = value_start;
        }
    }
    None
}

fn unescape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode PowerShell's `_xHHHH_` escapes. Each escape is one UTF-16 code
/// unit, so surrogate pairs arrive as two consecutive escapes.
fn unescape_ps(text: &str) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("_x") {
        let (head, tail) = rest.split_at(pos);
        units.extend(head.encode_utf16());
        let unit = tail
            .get(2..6)
            .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
            .filter(|_| tail.as_bytes().get(6) == Some(&b'_'))
            .and_then(|h| u16::from_str_radix(h, 16).ok());
        match unit {
            Some(unit) => {
                units.push(unit);
                rest = &tail[7..];
            }
            _ => {
                units.extend("_x".encode_utf16());
                rest = &tail[2..];
            }
        }
    }
    units.extend(rest.encode_utf16());
    String::from_utf16_lossy(&units)
}
