use serde::{Deserialize, Serialize};

use super::{default_python_path, default_username, Base, Stateful, UploadState};

/// A build uploaded to one provider. The identity fields come from the
/// path and are never stored in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpload {
    #[serde(flatten)]
    base: Base<UploadState>,
    #[serde(skip)]
    build_id: String,
    #[serde(skip)]
    provider_name: String,
    #[serde(skip)]
    image_name: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_username")]
    pub username: Option<String>,
    #[serde(default = "default_python_path")]
    pub python_path: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_name: Option<String>,
}

impl ImageUpload {
    pub fn new(
        build_id: impl Into<String>,
        provider_name: impl Into<String>,
        image_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            base: Base::new(id),
            build_id: build_id.into(),
            provider_name: provider_name.into(),
            image_name: image_name.into(),
            format: None,
            username: default_username(),
            python_path: default_python_path(),
            shell_type: None,
            external_id: None,
            external_name: None,
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Attach the identity a decoded document was read from
    pub(crate) fn with_identity(
        mut self,
        build_id: &str,
        provider_name: &str,
        image_name: &str,
        id: &str,
    ) -> Self {
        self.build_id = build_id.to_string();
        self.provider_name = provider_name.to_string();
        self.image_name = image_name.to_string();
        self.set_id(id);
        self
    }
}

impl Stateful for ImageUpload {
    type State = UploadState;

    fn base(&self) -> &Base<UploadState> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base<UploadState> {
        &mut self.base
    }
}

impl PartialEq for ImageUpload {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
            && self.provider_name == other.provider_name
            && self.build_id == other.build_id
            && self.image_name == other.image_name
            && self.format == other.format
    }
}
