//! Patches: immutable, identified units of change.

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::Id;
use std::collections::BTreeMap;

/// Reserved header carrying the patch's own id.
pub const HEADER_ID: &str = "id";
/// Reserved header carrying the id of the preceding patch in the log.
pub const HEADER_PREVIOUS: &str = "previous";

/// An immutable unit of change to a dataset.
///
/// A patch is an opaque byte body plus string-keyed headers. Two headers are
/// reserved: `id` (the patch's own identifier) and `previous` (the id of the
/// patch immediately before it in its log; absent only for the first patch).
/// The body's format is the concern of the dataset engine, not of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Patch {
    /// Creates a patch with the given id and body.
    pub fn new(id: Id, body: Vec<u8>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_ID.to_string(), id.to_string());
        Patch { headers, body }
    }

    /// Creates a patch with no headers at all.
    ///
    /// The server assigns an id to such a patch on append.
    pub fn anonymous(body: Vec<u8>) -> Self {
        Patch {
            headers: BTreeMap::new(),
            body,
        }
    }

    /// The patch's own id, if set.
    pub fn id(&self) -> Option<Id> {
        self.headers.get(HEADER_ID).map(|s| Id::parse(s))
    }

    /// The id of the preceding patch in the log, if set.
    pub fn previous(&self) -> Option<Id> {
        self.headers.get(HEADER_PREVIOUS).map(|s| Id::parse(s))
    }

    /// Sets the patch's own id.
    pub fn set_id(&mut self, id: &Id) {
        self.headers.insert(HEADER_ID.to_string(), id.to_string());
    }

    /// Sets the `previous` header.
    pub fn set_previous(&mut self, id: &Id) {
        self.headers
            .insert(HEADER_PREVIOUS.to_string(), id.to_string());
    }

    /// Sets a freeform header.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Reads a header by name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers, sorted by key.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The opaque body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serializes the patch to bytes.
    ///
    /// Layout: one `key: value` line per header, a blank line, then the raw
    /// body. Header keys and values must not contain newlines.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64);
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// Deserializes a patch from bytes produced by [`Patch::encode`].
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut headers = BTreeMap::new();
        let mut pos = 0usize;
        loop {
            let rest = &bytes[pos..];
            let nl = rest
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| ProtocolError::BadPatch("unterminated header section".into()))?;
            let line = &rest[..nl];
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::BadPatch("non-UTF-8 header line".into()))?;
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| ProtocolError::BadPatch(format!("malformed header: {line}")))?;
            headers.insert(key.to_string(), value.to_string());
        }
        Ok(Patch {
            headers,
            body: bytes[pos..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers() {
        let id = Id::fresh();
        let prev = Id::fresh();
        let mut patch = Patch::new(id.clone(), b"add <s> <p> <o> .".to_vec());
        patch.set_previous(&prev);

        assert_eq!(patch.id(), Some(id));
        assert_eq!(patch.previous(), Some(prev));
    }

    #[test]
    fn anonymous_patch_has_no_id() {
        let patch = Patch::anonymous(b"body".to_vec());
        assert!(patch.id().is_none());
        assert!(patch.previous().is_none());
    }

    #[test]
    fn encode_decode() {
        let mut patch = Patch::new(Id::fresh(), b"raw body\nwith newlines".to_vec());
        patch.set_header("origin", "node-3");

        let bytes = patch.encode();
        let back = Patch::decode(&bytes).unwrap();
        assert_eq!(back, patch);
        assert_eq!(back.header("origin"), Some("node-3"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Patch::decode(b"no separator at all").is_err());
        assert!(Patch::decode(b"not a header line\n\nbody").is_err());
    }

    #[test]
    fn empty_body() {
        let patch = Patch::new(Id::fresh(), Vec::new());
        let back = Patch::decode(&patch.encode()).unwrap();
        assert!(back.body().is_empty());
    }
}
