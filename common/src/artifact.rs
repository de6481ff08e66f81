use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed identity of a user-supplied executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub size: u64,
    pub hash: String,
}

impl Artifact {
    pub fn from_content(name: impl Into<String>, artifact_type: impl Into<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            size: content.len() as u64,
            hash: content_hash(content),
        }
    }
}

/// Hex SHA-256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
