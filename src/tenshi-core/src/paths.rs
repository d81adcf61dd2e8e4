use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
    adapters_dir: PathBuf,
}

impl AppDirs {
    pub fn discover() -> Result<Self, DirsError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        Ok(Self::from_roots(dirs.config_dir(), dirs.data_dir()))
    }

    /// Lay out the directory tree under explicit roots (tests, portable installs).
    pub fn from_roots(config_dir: &Path, data_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            log_dir: data_dir.join("logs"),
            adapters_dir: data_dir.join("adapters"),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.log_dir,
            &self.adapters_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Default location searched for installed content adapters.
    pub fn adapters_dir(&self) -> &Path {
        &self.adapters_dir
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("unable to determine project directories for Tenshi")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_layout_nests_logs_and_adapters() {
        let dirs = AppDirs::from_roots(Path::new("/cfg"), Path::new("/data"));
        assert!(dirs.log_dir().ends_with("logs"));
        assert!(dirs.adapters_dir().ends_with("adapters"));
        assert_eq!(dirs.config_dir(), Path::new("/cfg"));
    }

    #[test]
    fn ensure_exists_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = AppDirs::from_roots(&tmp.path().join("cfg"), &tmp.path().join("data"));
        dirs.ensure_exists().expect("dirs should be created");
        assert!(dirs.adapters_dir().is_dir());
        assert!(dirs.log_dir().is_dir());
    }
}
