//! Installed adapter manifests (`adapter.toml`).
//!
//! ```toml
//! [service]
//! package = "io.example.gogo"
//! name = "GogoAdapterService"
//! exported = true
//! capabilities = ["io.github.shadow578.tenshi.content.ADAPTER"]
//!
//! [metadata]
//! "io.github.shadow578.tenshi.content.ADAPTER_VERSION" = 2
//!
//! [exec]
//! executable = "bin/gogo-adapter"
//! args = ["--quiet"]
//! ```

use crate::host::PluginConfig;
use crate::transport::{ComponentName, ServiceMetadata};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "adapter.toml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read adapter manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse adapter manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid adapter manifest {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterManifest {
    pub service: ServiceSection,
    #[serde(default)]
    pub metadata: ServiceMetadata,
    pub exec: ExecSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub package: String,
    pub name: String,
    #[serde(default = "default_exported")]
    pub exported: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSection {
    /// Relative paths resolve against the manifest's directory.
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_exported() -> bool {
    true
}

/// A manifest together with where it was found.
#[derive(Debug, Clone)]
pub struct InstalledAdapter {
    pub manifest_path: PathBuf,
    pub manifest: AdapterManifest,
}

impl InstalledAdapter {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: AdapterManifest =
            toml::from_str(&contents).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let invalid = |reason: &str| ManifestError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if manifest.service.package.trim().is_empty() {
            return Err(invalid("service.package is empty"));
        }
        if manifest.service.name.trim().is_empty() {
            return Err(invalid("service.name is empty"));
        }
        if manifest.exec.executable.as_os_str().is_empty() {
            return Err(invalid("exec.executable is empty"));
        }

        Ok(Self {
            manifest_path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn component(&self) -> ComponentName {
        ComponentName::new(&self.manifest.service.package, &self.manifest.service.name)
    }

    pub fn advertises(&self, capability: &str) -> bool {
        self.manifest
            .service
            .capabilities
            .iter()
            .any(|c| c == capability)
    }

    fn base_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Process launch settings, with relative paths resolved.
    pub fn plugin_config(&self) -> PluginConfig {
        let base = self.base_dir();
        let exec = &self.manifest.exec;
        PluginConfig {
            executable: base.join(&exec.executable),
            args: exec.args.clone(),
            working_dir: Some(
                exec.working_dir
                    .as_ref()
                    .map(|dir| base.join(dir))
                    .unwrap_or_else(|| base.to_path_buf()),
            ),
            env: exec
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Find every manifest under `dirs`, in directory order then file name order.
///
/// Each directory is searched two levels deep (`<dir>/<adapter>/adapter.toml`).
/// Unreadable directories and broken manifests are logged and skipped.
pub fn scan(dirs: &[PathBuf]) -> Vec<InstalledAdapter> {
    let mut found = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "adapter directory does not exist");
            continue;
        }
        let walker = WalkDir::new(dir)
            .max_depth(2)
            .follow_links(true)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %err,
                        "failed to scan adapter directory"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
                continue;
            }
            match InstalledAdapter::load(entry.path()) {
                Ok(adapter) => found.push(adapter),
                Err(err) => tracing::warn!(error = %err, "ignoring adapter manifest"),
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CAPABILITY_CONTENT_ADAPTER, META_API_VERSION};

    fn write_manifest(root: &Path, dir: &str, body: &str) -> PathBuf {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(MANIFEST_FILE);
        fs::write(&path, body).unwrap();
        path
    }

    const GOGO: &str = r#"
        [service]
        package = "io.example.gogo"
        name = "GogoService"
        capabilities = ["io.github.shadow578.tenshi.content.ADAPTER"]

        [metadata]
        "io.github.shadow578.tenshi.content.ADAPTER_VERSION" = 2

        [exec]
        executable = "bin/gogo"
        args = ["--quiet"]
        env = { GOGO_MIRROR = "eu" }
    "#;

    #[test]
    fn loads_manifest_and_resolves_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(tmp.path(), "gogo", GOGO);
        let adapter = InstalledAdapter::load(&path).unwrap();

        assert_eq!(
            adapter.component(),
            ComponentName::new("io.example.gogo", "GogoService")
        );
        assert!(adapter.manifest.service.exported);
        assert!(adapter.advertises(CAPABILITY_CONTENT_ADAPTER));
        assert_eq!(
            adapter.manifest.metadata[META_API_VERSION].as_int(),
            Some(2)
        );

        let config = adapter.plugin_config();
        assert_eq!(config.executable, tmp.path().join("gogo").join("bin/gogo"));
        assert_eq!(config.working_dir, Some(tmp.path().join("gogo")));
        assert_eq!(config.env, vec![("GOGO_MIRROR".into(), "eu".into())]);
    }

    #[test]
    fn empty_package_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let body = GOGO.replace("io.example.gogo", "");
        let path = write_manifest(tmp.path(), "bad", &body);
        assert!(matches!(
            InstalledAdapter::load(&path),
            Err(ManifestError::Invalid { .. })
        ));
    }

    #[test]
    fn scan_orders_by_name_and_skips_broken() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "b-second", &GOGO.replace("GogoService", "Second"));
        write_manifest(tmp.path(), "a-first", &GOGO.replace("GogoService", "First"));
        write_manifest(tmp.path(), "c-broken", "not = [valid");

        let found = scan(&[tmp.path().to_path_buf(), tmp.path().join("missing")]);
        let names: Vec<_> = found.iter().map(|a| a.manifest.service.name.clone()).collect();
        assert_eq!(names, vec!["First", "Second"]);
    }
}
