use std::collections::BTreeMap;

use http::StatusCode;

/// Prefix marking a metadata line at the top of a stored entry.
const METADATA_MARKER: &str = "__";

/// Metadata field carrying the upstream HTTP status code.
pub const STATUS_FIELD: &str = "status";

/// A stored entry split back into its metadata block and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub metadata: BTreeMap<String, String>,
    pub body: String,
}

/// Serialize a response body with its metadata into the single-file format:
/// one `__<key>: <value>` line per metadata field, then the body verbatim.
///
/// The format has no explicit delimiter; a body whose own first lines match
/// the marker pattern will be re-read as metadata by [`decode_entry`]. That
/// is a known limitation of the single-file scheme, not something callers
/// need to guard against for the JSON payloads this store is built for.
pub fn encode_entry(body: &str, metadata: &BTreeMap<String, String>) -> String {
    let mut text = String::with_capacity(body.len() + metadata.len() * 16);
    for (key, value) in metadata {
        text.push_str(METADATA_MARKER);
        text.push_str(key);
        text.push_str(": ");
        text.push_str(value);
        text.push('\n');
    }
    text.push_str(body);
    text
}

/// Split a stored entry into metadata and body.
///
/// Scans contiguous leading lines of the form `__<key>: <value>`; the first
/// line that does not match ends the block and starts the body. An entry with
/// no matching lines decodes to empty metadata and the full text as body.
pub fn decode_entry(text: &str) -> DecodedEntry {
    let mut metadata = BTreeMap::new();
    let mut offset = 0;

    while offset < text.len() {
        let rest = &text[offset..];
        let (line, line_len) = match rest.find('\n') {
            Some(pos) => (&rest[..pos], pos + 1),
            None => (rest, rest.len()),
        };
        let Some((key, value)) = parse_metadata_line(line) else {
            break;
        };
        metadata.insert(key.to_string(), value.to_string());
        offset += line_len;
    }

    DecodedEntry {
        metadata,
        body: text[offset..].to_string(),
    }
}

fn parse_metadata_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(METADATA_MARKER)?;
    let (key, value) = rest.split_once(": ")?;
    if key.is_empty() || key.contains(':') {
        return None;
    }
    Some((key, value))
}

/// Metadata block for a freshly recorded response.
pub fn status_metadata(status: StatusCode) -> BTreeMap<String, String> {
    BTreeMap::from([(STATUS_FIELD.to_string(), status.as_u16().to_string())])
}

/// Recover the replay status from decoded metadata. Missing or unparsable
/// values fall back to 200 rather than failing the read.
pub fn status_from(metadata: &BTreeMap<String, String>) -> StatusCode {
    metadata
        .get(STATUS_FIELD)
        .and_then(|value| value.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}
