//! Hot reload
//!
//! With hot reload enabled before the program is loaded, a new image of
//! the same program can be patched in: function bodies are replaced while
//! static state and live objects are kept. Every successful patch bumps
//! the runtime's resolution generation, so memoized lookups and cached
//! calls are re-resolved.

use crate::error::{EmbedError, Result};
use crate::options::ResolveStrategy;
use crate::runtime::{not_initialized, Runtime};
use ember_core::{Module, VmError};
use std::path::{Path, PathBuf};

type ReloadCallback = Box<dyn FnMut(bool) + Send>;

/// Reload configuration and the file being watched
#[derive(Default)]
pub(crate) struct HotReload {
    enabled: bool,
    source: Option<PathBuf>,
    observed_len: Option<u64>,
    callback: Option<ReloadCallback>,
}

impl HotReload {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remember `path` as the program source and its current size
    pub(crate) fn remember(&mut self, path: &Path) {
        self.source = Some(path.to_path_buf());
        self.observed_len = std::fs::metadata(path).ok().map(|m| m.len());
    }

    fn changed_on_disk(&self) -> bool {
        let Some(source) = &self.source else {
            return false;
        };
        match std::fs::metadata(source) {
            Ok(meta) => Some(meta.len()) != self.observed_len,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for HotReload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReload")
            .field("enabled", &self.enabled)
            .field("source", &self.source)
            .field("observed_len", &self.observed_len)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Runtime {
    /// Enable or disable hot reload. Must be called before a program is
    /// loaded; not available with the reflection resolution strategy.
    pub fn enable_hot_reload(&mut self, enable: bool) -> Result<()> {
        let result = if self.is_loaded() {
            Err(EmbedError::AlreadyInitialized(
                "hot reload must be configured before loading a program".to_string(),
            ))
        } else if enable && self.options.strategy == ResolveStrategy::Reflection {
            Err(EmbedError::NotImplemented(
                "hot reload requires the type-table resolution strategy".to_string(),
            ))
        } else {
            self.reload.enabled = enable;
            Ok(())
        };
        self.record(result)
    }

    /// Whether hot reload is enabled
    pub fn is_hot_reload_enabled(&self) -> bool {
        self.reload.enabled
    }

    /// Called after every successful reload with whether any code changed
    pub fn set_reload_callback(&mut self, callback: impl FnMut(bool) + Send + 'static) {
        self.reload.callback = Some(Box::new(callback));
    }

    /// Remove the reload callback
    pub fn clear_reload_callback(&mut self) {
        self.reload.callback = None;
    }

    /// Reload from `path`, or from the file the program was loaded from.
    /// Returns whether any code changed.
    pub fn reload_file(&mut self, path: Option<&Path>) -> Result<bool> {
        let result = self.reload_file_inner(path);
        self.record(result)
    }

    fn reload_file_inner(&mut self, path: Option<&Path>) -> Result<bool> {
        self.check_reloadable()?;
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.reload.source.clone())
            .ok_or_else(|| EmbedError::InvalidArgument("no program file to reload from".to_string()))?;
        let data = self.read_image(&path)?;
        let module = Module::decode(&data).map_err(|e| EmbedError::ReloadFailed(e.to_string()))?;
        let changed = self.apply_patch(module)?;
        self.reload.remember(&path);
        Ok(changed)
    }

    /// Reload from an in-memory image
    pub fn reload_bytes(&mut self, data: &[u8]) -> Result<bool> {
        let result = self.check_reloadable().and_then(|_| {
            let module = Module::decode(data).map_err(|e| EmbedError::ReloadFailed(e.to_string()))?;
            self.apply_patch(module)
        });
        self.record(result)
    }

    /// Reload from a decoded program
    pub fn reload_module(&mut self, module: Module) -> Result<bool> {
        let result = self.check_reloadable().and_then(|_| self.apply_patch(module));
        self.record(result)
    }

    /// Reload if the program file's size changed since it was last read.
    /// Returns whether a reload happened.
    pub fn check_for_reload(&mut self) -> Result<bool> {
        if !self.reload.enabled || !self.reload.changed_on_disk() {
            return Ok(false);
        }
        log::info!("program file changed on disk; reloading");
        self.reload_file(None).map(|_| true)
    }

    fn check_reloadable(&self) -> Result<()> {
        if !self.reload.enabled {
            return Err(EmbedError::ReloadNotEnabled);
        }
        if !self.is_loaded() {
            return Err(EmbedError::NotInitialized("no program loaded".to_string()));
        }
        Ok(())
    }

    fn apply_patch(&mut self, module: Module) -> Result<bool> {
        let vm = self.vm.as_mut().ok_or_else(not_initialized)?;
        let changed = vm.patch(module).map_err(|err| match err {
            VmError::ReloadNotEnabled => EmbedError::ReloadNotEnabled,
            other => EmbedError::ReloadFailed(other.to_string()),
        })?;
        let generation = self.bump_generation();
        log::info!("reload applied (changed: {}, generation {})", changed, generation);
        if let Some(callback) = self.reload.callback.as_mut() {
            callback(changed);
        }
        Ok(changed)
    }
}
