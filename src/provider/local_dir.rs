//! Local-file-directory provider
//!
//! Recursively scans a directory tree for `*.json` files (names starting
//! with `_` are ignored), re-reads a file only when its `(mtime, size)`
//! changed, and bumps a monotonic epoch serving as the etag. A scan error
//! (including a missing directory) propagates out of `load()` so the
//! reload loop keeps serving the last accepted set. `//` comment lines
//! and trailing ` // ...` tails are stripped before parsing; each file
//! holds a JSON array of the resource kind.

use super::Provider;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileInfo {
    modtime: SystemTime,
    size: u64,
}

#[derive(Debug, Default)]
struct FileState {
    data: String,
    last: Option<FileInfo>,
}

pub struct DirProvider<T> {
    dir: PathBuf,
    files: Mutex<HashMap<PathBuf, FileState>>,
    epoch: AtomicU64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DirProvider<T> {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn etag(&self) -> String {
        self.epoch.load(Ordering::Relaxed).to_string()
    }

    /// Walk the directory tree and re-read changed files. Returns true
    /// when anything changed since the previous scan. A scan error leaves
    /// the previously-seen files and the epoch untouched.
    fn refresh(&self) -> Result<bool> {
        let mut files = self.files.lock().expect("dir provider poisoned");

        let mut seen: Vec<(PathBuf, FileInfo)> = Vec::new();
        scan_dir(&self.dir, &mut seen)?;

        let mut changed = false;

        // Forget files removed from the directory.
        let current: Vec<PathBuf> = seen.iter().map(|(p, _)| p.clone()).collect();
        let before = files.len();
        files.retain(|path, _| current.contains(path));
        if files.len() != before {
            changed = true;
        }

        for (path, info) in seen {
            let state = files.entry(path.clone()).or_default();
            if state.last.as_ref() == Some(&info) {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                GatewayError::Config(format!("failed to read '{}': {}", path.display(), e))
            })?;
            state.data = strip_json_comments(&raw);
            state.last = Some(info);
            changed = true;
        }

        if changed {
            self.epoch.fetch_add(1, Ordering::Relaxed);
        }
        Ok(changed)
    }

    fn parse_all(&self) -> Result<Vec<T>> {
        let files = self.files.lock().expect("dir provider poisoned");
        let mut out = Vec::new();
        let mut paths: Vec<&PathBuf> = files.keys().collect();
        paths.sort();
        for path in paths {
            let state = &files[path];
            if state.data.trim().is_empty() {
                continue;
            }
            let items: Vec<T> = serde_json::from_str(&state.data).map_err(|e| {
                GatewayError::Config(format!(
                    "failed to decode the config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            out.extend(items);
        }
        Ok(out)
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + Sync> Provider<T> for DirProvider<T> {
    async fn load(&self, last_etag: &str) -> Result<Option<(Vec<T>, String)>> {
        self.refresh()?;
        let etag = self.etag();
        if etag == last_etag {
            return Ok(None);
        }
        let resources = self.parse_all()?;
        Ok(Some((resources, etag)))
    }
}

/// Collect `*.json` files under `dir`, recursing into subdirectories.
/// Only file names starting with `_` are skipped; directories are always
/// descended into. Any stat error propagates to the caller.
fn scan_dir(dir: &Path, out: &mut Vec<(PathBuf, FileInfo)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            scan_dir(&path, out)?;
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('_') || !name.ends_with(".json") {
            continue;
        }

        out.push((
            path,
            FileInfo {
                modtime: meta.modified()?,
                size: meta.len(),
            },
        ));
    }
    Ok(())
}

/// Remove whole-line `//` comments and ` // ...` line tails. A tail
/// containing a `"` after the marker is kept, so URLs in strings survive.
pub fn strip_json_comments(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    for line in data.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        match line.find("//") {
            Some(idx) if !line[idx..].contains('"') => {
                out.push_str(line[..idx].trim_end());
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    out
}
