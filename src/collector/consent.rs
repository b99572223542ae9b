use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read-only "may I transmit" flag owned by whatever records the user's consent.
pub trait ConsentGate: Send + Sync {
    fn may_transmit(&self) -> bool;
}

/// Consent granted iff the consent file exists. Never creates the file.
#[derive(Debug, Clone)]
pub struct FileConsent {
    path: PathBuf,
}

impl FileConsent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConsentGate for FileConsent {
    fn may_transmit(&self) -> bool {
        self.path.is_file()
    }
}

/// Fixed consent value, flippable at runtime. Used by embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticConsent {
    granted: Arc<AtomicBool>,
}

impl StaticConsent {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(granted)),
        }
    }

    pub fn set(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl ConsentGate for StaticConsent {
    fn may_transmit(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_consent_defaults_to_denied() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("consent");
        let consent = FileConsent::new(&path);

        assert!(!consent.may_transmit());
        assert!(!path.exists());

        std::fs::write(&path, "").unwrap();
        assert!(consent.may_transmit());
    }

    #[test]
    fn test_static_consent_default_is_denied() {
        let consent = StaticConsent::default();
        assert!(!consent.may_transmit());
        consent.set(true);
        assert!(consent.may_transmit());
    }
}
