//! Prototype keys and the naming convention for topic/document prototypes.

use std::fmt;

use serde::{Deserialize, Serialize};

const DOC_PREFIX: &str = "doc:";
const TOPIC_PREFIX: &str = "topic:";
const TOPIC_SEPARATOR: &str = "|topic:";

/// Stable primary key of a prototype row.
///
/// Two shapes carry meaning: `doc:{document}|topic:{topic}` for a topic
/// within one source document and `topic:{topic}` for a global topic. Any
/// other string is accepted as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrototypeKey(String);

impl PrototypeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for `topic` restricted to one source document.
    pub fn for_document_topic(document: &str, topic: &str) -> Self {
        Self(format!("{DOC_PREFIX}{document}{TOPIC_SEPARATOR}{topic}"))
    }

    /// Key for a global topic aggregated across documents.
    pub fn for_topic(topic: &str) -> Self {
        Self(format!("{TOPIC_PREFIX}{topic}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic encoded in the key, if it follows either convention.
    pub fn topic(&self) -> Option<&str> {
        if let Some(rest) = self.0.strip_prefix(DOC_PREFIX) {
            return rest.split_once(TOPIC_SEPARATOR).map(|(_, topic)| topic);
        }
        self.0.strip_prefix(TOPIC_PREFIX)
    }

    /// Source document encoded in the key, if any.
    pub fn document(&self) -> Option<&str> {
        self.0
            .strip_prefix(DOC_PREFIX)
            .and_then(|rest| rest.split_once(TOPIC_SEPARATOR))
            .map(|(document, _)| document)
    }

    /// True for `topic:{topic}` keys.
    pub fn is_global_topic(&self) -> bool {
        self.0.starts_with(TOPIC_PREFIX)
    }
}

impl fmt::Display for PrototypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrototypeKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PrototypeKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_topic_key() {
        let key = PrototypeKey::for_document_topic("d42", "billing");
        assert_eq!(key.as_str(), "doc:d42|topic:billing");
        assert_eq!(key.document(), Some("d42"));
        assert_eq!(key.topic(), Some("billing"));
        assert!(!key.is_global_topic());
    }

    #[test]
    fn test_global_topic_key() {
        let key = PrototypeKey::for_topic("billing");
        assert_eq!(key.as_str(), "topic:billing");
        assert_eq!(key.topic(), Some("billing"));
        assert_eq!(key.document(), None);
        assert!(key.is_global_topic());
    }

    #[test]
    fn test_opaque_key() {
        let key = PrototypeKey::from("topicA");
        assert_eq!(key.topic(), None);
        assert_eq!(key.document(), None);
    }
}
