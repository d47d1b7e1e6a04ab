//! Backend registry
//!
//! Maps a backend name onto the config file and binary that belong to it.
//! Names are matched exactly, so one backend whose name is a substring of
//! another's (`calico` and `calico-ipam`) can never pick up the wrong file.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{BackendPaths, NetworkConfig};
use crate::error::GenieError;
use crate::netconf::ConfList;

/// Extensions of files scanned in the config directory
pub const CONF_EXTENSIONS: &[&str] = &["conf", "conflist"];

/// Resolves backend names to files on disk
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    conf_dir: PathBuf,
    bin_dirs: Vec<PathBuf>,
    explicit: BTreeMap<String, BackendPaths>,
}

impl BackendRegistry {
    /// Create a registry over a config dir and binary search path
    pub fn new(
        conf_dir: PathBuf,
        bin_dirs: Vec<PathBuf>,
        explicit: BTreeMap<String, BackendPaths>,
    ) -> Self {
        Self {
            conf_dir,
            bin_dirs,
            explicit,
        }
    }

    /// Create the registry described by genie's network config
    pub fn from_config(config: &NetworkConfig, cni_path: Option<&str>) -> Self {
        Self::new(
            config.conf_dir(),
            config.plugin_path(cni_path),
            config.backends.clone(),
        )
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Directories backends' binaries are searched in
    ///
    /// Directories of explicitly registered binaries come first.
    pub fn search_path(&self) -> Vec<PathBuf> {
        let mut path: Vec<PathBuf> = self
            .explicit
            .values()
            .filter_map(|p| p.bin.as_deref().and_then(Path::parent))
            .map(Path::to_path_buf)
            .collect();

        for dir in &self.bin_dirs {
            if !path.contains(dir) {
                path.push(dir.clone());
            }
        }
        path
    }

    /// Find the config belonging to `backend`
    ///
    /// An explicitly registered file must exist and parse. Otherwise the
    /// config dir is scanned in sorted order and the first file that parses
    /// and matches wins. Files that fail to parse are skipped, but when no
    /// usable file matches, a broken file named after the backend is
    /// reported instead of `None`.
    pub fn find_conf(&self, backend: &str) -> Result<Option<(PathBuf, ConfList)>, GenieError> {
        if backend.is_empty() {
            return Ok(None);
        }

        if let Some(path) = self.explicit.get(backend).and_then(|p| p.conf.as_ref()) {
            if !path.exists() {
                return Err(GenieError::ConfigNotFound {
                    backend: backend.to_string(),
                });
            }
            let list = ConfList::from_file(path)?;
            return Ok(Some((path.clone(), list)));
        }

        let mut broken = None;

        for path in self.conf_files()? {
            let list = match ConfList::from_file(&path) {
                Ok(list) => list,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unusable config file");
                    if conf_stem(&path) == Some(backend) {
                        broken = Some(e);
                    }
                    continue;
                }
            };

            if conf_matches(backend, &path, &list) {
                debug!(backend, path = %path.display(), backend_type = list.backend_type(), "found config");
                return Ok(Some((path, list)));
            }
        }

        match broken {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Find the binary installed for `backend`
    pub fn find_binary(&self, backend: &str) -> Option<PathBuf> {
        if backend.is_empty() {
            return None;
        }

        if let Some(bin) = self.explicit.get(backend).and_then(|p| p.bin.as_ref()) {
            return bin.is_file().then(|| bin.clone());
        }

        self.bin_dirs
            .iter()
            .map(|dir| dir.join(backend))
            .find(|path| path.is_file())
    }

    /// Config files in the config dir, sorted by path
    fn conf_files(&self) -> Result<Vec<PathBuf>, GenieError> {
        let entries = match fs::read_dir(&self.conf_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GenieError::io(
                    format!("failed to read config dir {}", self.conf_dir.display()),
                    e,
                ))
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| CONF_EXTENSIONS.contains(&ext))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// File stem without a numeric priority prefix (`10-weave` -> `weave`)
fn conf_stem(path: &Path) -> Option<&str> {
    let stem = path.file_stem()?.to_str()?;
    match stem.split_once('-') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) => {
            Some(rest)
        }
        _ => Some(stem),
    }
}

/// Whether a parsed config belongs to `backend`
fn conf_matches(backend: &str, path: &Path, list: &ConfList) -> bool {
    conf_stem(path) == Some(backend) || list.name == backend || list.backend_type() == backend
}
