//! Configuration providers — load full desired config sets
//!
//! A provider returns the complete set of one resource kind plus an etag;
//! an unchanged etag means "nothing new" and the reload loop skips the
//! diff entirely. The local-file-directory provider watches `*.json`
//! files by `(mtime, size)`.

mod local_dir;

pub use local_dir::{strip_json_comments, DirProvider};

use crate::error::Result;
use async_trait::async_trait;
use std::sync::RwLock;

/// Loads the full desired set of a resource kind.
#[async_trait]
pub trait Provider<T>: Send + Sync {
    /// Returns `None` when nothing changed since `last_etag`; otherwise
    /// the complete new set and its etag.
    async fn load(&self, last_etag: &str) -> Result<Option<(Vec<T>, String)>>;
}

/// The last accepted config set, shared with the management API.
pub struct ConfigStore<T> {
    inner: RwLock<(Vec<T>, String)>,
}

impl<T: Clone> Default for ConfigStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ConfigStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new((Vec::new(), String::new())),
        }
    }

    pub fn resource(&self) -> Vec<T> {
        self.inner.read().expect("config store poisoned").0.clone()
    }

    pub fn etag(&self) -> String {
        self.inner.read().expect("config store poisoned").1.clone()
    }

    pub fn set(&self, resource: Vec<T>, etag: String) {
        *self.inner.write().expect("config store poisoned") = (resource, etag);
    }
}
