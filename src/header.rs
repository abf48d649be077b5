//! Extraction of leading comment metadata from data files.
//!
//! Benchmark data files start with a block of `#` comment lines, for example:
//!
//! ```text
//! # problem=SEAS Benchmark BP1-QD
//! # code=mycode
//! # mu = 0.6
//! # This is a free-text comment
//! t slip slip_rate
//! ```
//!
//! `key = value` lines become key/value pairs; other comment lines are kept as free text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker character starting a comment line.
pub const COMMENT_MARKER: char = '#';

/// Key under which free-text comments are serialised. A `key = value` line using it is kept as
/// free text.
const COMMENTS_KEY: &str = "comments";

/// Header metadata extracted from the first file seen for one prefix.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PrefixHeader {
    /// Free-text comment lines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// `key = value` pairs
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

/// Header metadata for every file prefix in an upload.
pub type HeaderDocument = BTreeMap<String, PrefixHeader>;

/// Record the header of `text` under `prefix`, unless that prefix already has one.
///
/// Returns whether the document was updated.
pub fn extract_header(doc: &mut HeaderDocument, prefix: &str, text: &str) -> bool {
    if doc.contains_key(prefix) {
        return false;
    }
    doc.insert(prefix.to_string(), parse_header(text));
    true
}

/// Parse the leading comment block of `text`.
pub fn parse_header(text: &str) -> PrefixHeader {
    let mut header = PrefixHeader::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(comment) = line.strip_prefix(COMMENT_MARKER) else {
            break;
        };
        let comment = comment.trim();
        match comment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && key.trim() != COMMENTS_KEY => {
                header
                    .values
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
            _ if !comment.is_empty() => header.comments.push(comment.to_string()),
            _ => (),
        }
    }
    header
}
