//! Content fingerprints used as the dedup key for migrated items.
//!
//! A signature only depends on header values that survive a copy between
//! folders, so the same logical message hashes identically wherever it is.

use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Minimal header set fetched per item; enough to compute a signature and
/// to look the item up again in another folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderSubset {
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub size: u64,
}

impl HeaderSubset {
    /// Parse the raw header block of a message.
    pub fn from_raw(raw_headers: &[u8], size: u64) -> Self {
        let Some(message) = MessageParser::default().parse_headers(raw_headers) else {
            return Self {
                size,
                ..Self::default()
            };
        };

        Self {
            message_id: message.message_id().unwrap_or_default().to_string(),
            from: message
                .from()
                .and_then(|addr| addr.first())
                .and_then(|addr| addr.address())
                .unwrap_or_default()
                .to_string(),
            subject: message.subject().unwrap_or_default().to_string(),
            date: message
                .date()
                .map(|date| date.to_rfc3339())
                .or_else(|| raw_header(raw_headers, "date"))
                .unwrap_or_default(),
            size,
        }
    }
}

/// Unfolded text of the first `name` header. Keeps a value the date parser
/// rejects, so two messages with different malformed dates stay distinct.
fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));
    while let Some(line) = lines.next() {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case(name) {
            continue;
        }
        let mut value = value.trim().to_string();
        for folded in lines.by_ref() {
            if !folded.starts_with([' ', '\t']) {
                break;
            }
            value.push(' ');
            value.push_str(folded.trim());
        }
        let value = canonical(&value);
        return (!value.is_empty()).then_some(value);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl From<String> for Signature {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_bytes(headers: &HeaderSubset) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in [
        ("message-id", canonical(&headers.message_id)),
        ("from", canonical(&headers.from).to_lowercase()),
        ("subject", canonical(&headers.subject)),
        ("date", canonical(&headers.date)),
        ("size", headers.size.to_string()),
    ] {
        out.push_str(name);
        out.push(':');
        out.push_str(&value);
        out.push('\n');
    }
    out.into_bytes()
}

pub fn signature(headers: &HeaderSubset) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(headers));
    Signature(format!("{:x}", hasher.finalize()))
}
