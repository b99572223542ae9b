use super::{StoreError, read_optional, write_atomic};
use std::fmt;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

const IDENTITY_LEN: usize = 16;

/// Anonymous installation identifier. Generated on first access, then reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity(String);

impl MachineIdentity {
    pub async fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if let Some(content) = read_optional(path).await? {
            let existing = content.trim();
            if Self::is_valid(existing) {
                return Ok(Self(existing.to_string()));
            }
        }

        let generated: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(IDENTITY_LEN)
            .collect();
        write_atomic(path, generated.as_bytes()).await?;
        info!(path = %path.display(), "created machine identity");

        Ok(Self(generated))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(candidate: &str) -> bool {
        !candidate.is_empty()
            && candidate.len() <= 64
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for MachineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_generated_identity_is_short_hex() {
        let temp_dir = TempDir::new().unwrap();
        let identity = MachineIdentity::load_or_create(&temp_dir.path().join("machine_id"))
            .await
            .unwrap();
        assert_eq!(identity.as_str().len(), IDENTITY_LEN);
        assert!(identity.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_existing_identity_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("machine_id");
        std::fs::write(&path, "abc-123\n").unwrap();

        let identity = MachineIdentity::load_or_create(&path).await.unwrap();
        assert_eq!(identity.as_str(), "abc-123");
    }

    #[tokio::test]
    async fn test_corrupt_identity_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("machine_id");
        std::fs::write(&path, "   ").unwrap();

        let identity = MachineIdentity::load_or_create(&path).await.unwrap();
        assert_eq!(identity.as_str().len(), IDENTITY_LEN);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), identity.as_str());
    }
}
