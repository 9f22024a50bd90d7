//! The detached XML element type emitted by the decoder.

use std::fmt;

/// A fully-qualified element name: an optional namespace URI plus a local name.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QName {
    pub namespace: Option<String>,
    pub local_name: String,
}

impl QName {
    pub fn new(namespace: impl Into<Option<String>>, local_name: impl Into<String>) -> QName {
        QName {
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }

    pub fn local(local_name: impl Into<String>) -> QName {
        QName {
            namespace: None,
            local_name: local_name.into(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{ns}}}{}", self.local_name),
            None => write!(f, "{}", self.local_name),
        }
    }
}

/// A detached XML node, independent of any live parser state.
///
/// Once built by the decoder this value owns every byte of itself: no
/// borrowed spans into a parser buffer, no shared mutable state. Holders may
/// keep it for as long as they like without blocking the decoder's trimming.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Element {
    pub name: QName,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
    /// Raw serialized form as received on the wire, preserved verbatim so
    /// the MQTT forwarder can republish without re-encoding namespace
    /// prefixes it never parsed into `name`.
    pub raw: Vec<u8>,
}

impl Element {
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == local_name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_named(&self, name: &QName) -> bool {
        &self.name == name
    }
}
