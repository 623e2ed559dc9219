use serde::{Deserialize, Serialize};

use super::{default_python_path, default_username, Base, BuildState, Stateful};

/// Formats travel as one comma-joined string
mod comma_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(formats: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        let mut sorted = formats.to_vec();
        sorted.sort();
        serializer.serialize_str(&sorted.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let joined: Option<String> = Option::deserialize(deserializer)?;
        Ok(match joined {
            Some(joined) if !joined.is_empty() => joined.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        })
    }
}

/// One disk image build of a named image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBuild {
    #[serde(flatten)]
    base: Base<BuildState>,
    /// Hostname of the builder, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,
    /// Stable identity of the owning builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_id: Option<String>,
    #[serde(default, with = "comma_list", skip_serializing_if = "Vec::is_empty")]
    formats: Vec<String>,
    #[serde(default = "default_username")]
    pub username: Option<String>,
    #[serde(default = "default_python_path")]
    pub python_path: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
}

impl ImageBuild {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            base: Base::new(id),
            builder: None,
            builder_id: None,
            formats: Vec::new(),
            username: default_username(),
            python_path: default_python_path(),
            shell_type: None,
        }
    }

    /// Image formats produced, sorted
    pub fn formats(&self) -> Vec<String> {
        let mut formats = self.formats.clone();
        formats.sort();
        formats
    }

    pub fn set_formats(&mut self, formats: Vec<String>) {
        self.formats = formats;
    }
}

impl Stateful for ImageBuild {
    type State = BuildState;

    fn base(&self) -> &Base<BuildState> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base<BuildState> {
        &mut self.base
    }
}
