use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::SystemTime,
};

use tracing::debug;

use crate::registry::{MacroDef, PendingRule};

/// What loading a dependency once buys every later `@include` of it.
pub struct DependencyEntry {
    pub macros: Vec<Rc<MacroDef>>,
    /// Rules the dependency installed on its includer; re-installed into
    /// each subsequent includer's registry.
    pub pending_rules: Vec<Rc<PendingRule>>,
    pub output: String,
    pub mtime: Option<SystemTime>,
}

/// Absolute path keyed, no eviction. Shared by every registry of a
/// session so a file is loaded at most once per modification.
#[derive(Default)]
pub struct DependencyCache {
    entries: HashMap<PathBuf, Rc<DependencyEntry>>,
}

impl DependencyCache {
    pub fn has(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// A hit whose file changed on disk since caching reads as a miss.
    pub fn get(&self, path: &Path) -> Option<Rc<DependencyEntry>> {
        let entry = self.entries.get(path)?;
        if let (Some(cached), Ok(metadata)) = (entry.mtime, fs::metadata(path)) {
            if metadata.modified().ok() != Some(cached) {
                debug!(path = %path.display(), "dependency cache entry stale");
                return None;
            }
        }
        Some(entry.clone())
    }

    pub fn set(&mut self, path: PathBuf, entry: DependencyEntry) {
        self.entries.insert(path, Rc::new(entry));
    }

    pub fn set_and_get(&mut self, path: PathBuf, entry: DependencyEntry) -> Rc<DependencyEntry> {
        let entry = Rc::new(entry);
        self.entries.insert(path, entry.clone());
        entry
    }
}
