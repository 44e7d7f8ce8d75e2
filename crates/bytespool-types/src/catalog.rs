//! Configured catalog handed to buffer factories.
//!
//! The registry passes it through untouched; factories decide which
//! streams they will buffer.

use serde::{Deserialize, Serialize};

use crate::stream::StreamDescriptor;

/// A stream selected for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamDescriptor,
}

/// The set of streams selected for this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    #[serde(default)]
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Look up the configuration of one stream.
    #[must_use]
    pub fn find(&self, stream: &StreamDescriptor) -> Option<&ConfiguredStream> {
        self.streams.iter().find(|s| &s.stream == stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_matches_namespace_and_name() {
        let json = r#"{"streams":[{"stream":{"namespace":"public","name":"users"}}]}"#;
        let catalog: ConfiguredCatalog = serde_json::from_str(json).unwrap();
        assert!(catalog
            .find(&StreamDescriptor::with_namespace("public", "users"))
            .is_some());
        assert!(catalog.find(&StreamDescriptor::new("users")).is_none());
    }
}
