use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

fn default_provider_name() -> Option<String> {
    Some("unknown".to_string())
}

/// A registered launcher process and the labels it can serve
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Launcher {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_provider_name")]
    pub provider_name: Option<String>,
    #[serde(default)]
    supported_labels: BTreeSet<String>,
}

impl Launcher {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_name: default_provider_name(),
            supported_labels: BTreeSet::new(),
        }
    }

    pub fn supported_labels(&self) -> &BTreeSet<String> {
        &self.supported_labels
    }

    pub fn set_supported_labels(&mut self, labels: BTreeSet<String>) {
        self.supported_labels = labels;
    }

    pub fn with_labels<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.supported_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

impl PartialEq for Launcher {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.supported_labels == other.supported_labels
    }
}
