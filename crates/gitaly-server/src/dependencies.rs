use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gitaly_git::hooks::HookManager;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every service.
#[derive(Debug, Clone)]
pub struct Dependencies {
    pub storage_paths: HashMap<String, PathBuf>,
    pub hooks: Arc<HookManager>,
}

impl Dependencies {
    #[must_use]
    pub fn new(storage_paths: HashMap<String, PathBuf>) -> Self {
        Self::default().with_storage_paths(storage_paths)
    }

    #[must_use]
    pub fn with_storage_paths(mut self, storage_paths: HashMap<String, PathBuf>) -> Self {
        self.storage_paths = storage_paths;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.storage_paths.insert(name.into(), path.into());
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, global_hooks_dir: Option<PathBuf>, timeout: Duration) -> Self {
        self.hooks = Arc::new(HookManager::new(global_hooks_dir, timeout));
        self
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self {
            storage_paths: HashMap::new(),
            hooks: Arc::new(HookManager::new(None, DEFAULT_HOOK_TIMEOUT)),
        }
    }
}
