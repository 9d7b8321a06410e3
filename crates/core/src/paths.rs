use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".taskgate"))
            .unwrap_or_else(|| PathBuf::from(".taskgate"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Encrypted credential records, one file per reference id.
    pub fn credentials_dir(&self) -> PathBuf {
        self.base.join("credentials")
    }

    /// Master key used when `TASKGATE_CREDENTIAL_KEY` is not set.
    pub fn credential_key_file(&self) -> PathBuf {
        self.credentials_dir().join(".master.key")
    }

    /// Throwaway browser profiles. Each task run gets its own subdirectory,
    /// removed again when the browser closes.
    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.credentials_dir())?;
        std::fs::create_dir_all(self.profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/tg"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/tg/config.json"));
        assert_eq!(paths.credentials_dir(), PathBuf::from("/tmp/tg/credentials"));
        assert_eq!(
            paths.credential_key_file(),
            PathBuf::from("/tmp/tg/credentials/.master.key")
        );
        assert_eq!(paths.profiles_dir(), PathBuf::from("/tmp/tg/profiles"));
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(tmp.path().join("home"));
        paths.ensure_dirs().unwrap();
        assert!(paths.credentials_dir().is_dir());
        assert!(paths.profiles_dir().is_dir());
    }
}
