use std::path::PathBuf;

use bytes::Bytes;

/// Where an engine reads its network from.
#[derive(Clone, Debug)]
pub enum ModelArtifact {
    Path(PathBuf),
    Inline { name: String, bytes: Bytes },
}

impl ModelArtifact {
    pub fn inline(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        ModelArtifact::Inline {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelArtifact::Path(path) => path.display().to_string(),
            ModelArtifact::Inline { name, .. } => format!("<inline:{name}>"),
        }
    }

    /// Reads the artifact contents.
    pub fn load_bytes(&self) -> anyhow::Result<Bytes> {
        match self {
            ModelArtifact::Path(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    anyhow::anyhow!("failed to read model file '{}': {e}", path.display())
                })?;
                Ok(Bytes::from(data))
            }
            ModelArtifact::Inline { bytes, .. } => Ok(bytes.clone()),
        }
    }
}
