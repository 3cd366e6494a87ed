//! The only place in the runtime that touches foreign code.
//!
//! Everything here wraps `libloading` and the raw export table in owned,
//! safe types. A [`NativePlugin`] keeps its [`NativeLibrary`] alive, so the
//! code backing a plugin object is never unmapped while the object exists.

#![allow(unsafe_code)]

use crate::error::{LoadError, LoadResult};
use keel_plugin_api::abi::{
    ApiVersionFn, CleanupFn, CreateFn, DestroyFn, ExportsFn, PluginExports, API_VERSION_SYMBOL,
    EXPORTS_SYMBOL,
};
use keel_plugin_api::Plugin;
use libloading::Library;
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// Export table copied out of a module
#[derive(Debug, Clone)]
pub struct ModuleExports {
    /// Name reported by the module
    pub name: String,
    /// Version string reported by the module
    pub version: String,
    /// Embedded metadata JSON, if the module provides it
    pub metadata_json: Option<String>,
    create: CreateFn,
    destroy: DestroyFn,
    cleanup: Option<CleanupFn>,
}

impl ModuleExports {
    /// Whether the module registered a teardown hook
    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }
}

/// An open shared library.
///
/// Dropping the last handle runs the module's cleanup hook (if one was read
/// from its export table) and then closes the library.
pub struct NativeLibrary {
    path: PathBuf,
    cleanup: Mutex<Option<CleanupFn>>,
    library: Option<Library>,
}

impl NativeLibrary {
    /// Open the library at `path`
    pub(crate) fn open(path: &Path) -> Result<Self, LoadError> {
        // SAFETY: loading runs the module's initializers. The caller has
        // already passed the path through the security and permission checks.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            LoadError::new(
                LoadResult::InvalidFormat,
                format!("failed to open {}: {e}", path.display()),
            )
        })?;

        debug!(path = %path.display(), "Native library opened");

        Ok(Self {
            path: path.to_path_buf(),
            cleanup: Mutex::new(None),
            library: Some(library),
        })
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn library(&self) -> Result<&Library, LoadError> {
        self.library
            .as_ref()
            .ok_or_else(|| LoadError::new(LoadResult::InvalidFormat, "library already closed"))
    }

    /// Call the module's version query symbol
    pub(crate) fn api_version(&self) -> Result<u32, LoadError> {
        let library = self.library()?;

        // SAFETY: the symbol type matches the documented ABI signature.
        let query = unsafe { library.get::<ApiVersionFn>(API_VERSION_SYMBOL) }.map_err(|e| {
            LoadError::new(
                LoadResult::MissingSymbols,
                format!("{} does not export the API version query: {e}", self.path.display()),
            )
        })?;

        Ok(query())
    }

    /// Read and copy the module's export table.
    ///
    /// Only call after the version handshake succeeded.
    pub(crate) fn exports(&self) -> Result<ModuleExports, LoadError> {
        let library = self.library()?;

        // SAFETY: the symbol type matches the documented ABI signature.
        let get_exports = unsafe { library.get::<ExportsFn>(EXPORTS_SYMBOL) }.map_err(|e| {
            LoadError::new(
                LoadResult::MissingSymbols,
                format!("{} does not export a plugin table: {e}", self.path.display()),
            )
        })?;

        let table = get_exports();
        if table.is_null() {
            return Err(LoadError::new(
                LoadResult::MissingSymbols,
                format!("{} returned a null plugin table", self.path.display()),
            ));
        }

        // SAFETY: non-null and produced by a module that passed the handshake,
        // so it points to a `PluginExports` that lives as long as the library.
        let table: &PluginExports = unsafe { &*table };

        let name = read_c_string(table.name).ok_or_else(|| {
            LoadError::new(LoadResult::InvalidFormat, "plugin table has no valid name")
        })?;
        let version = read_c_string(table.version).ok_or_else(|| {
            LoadError::new(LoadResult::InvalidFormat, "plugin table has no valid version")
        })?;
        let metadata_json = read_c_string(table.metadata_json).filter(|json| !json.is_empty());

        *self.cleanup.lock() = table.cleanup;

        trace!(module = %name, version = %version, "Export table read");

        Ok(ModuleExports {
            name,
            version,
            metadata_json,
            create: table.create,
            destroy: table.destroy,
            cleanup: table.cleanup,
        })
    }

    /// Produce a plugin object through the module's factory
    pub(crate) fn instantiate(
        self: &Arc<Self>,
        exports: &ModuleExports,
    ) -> Result<NativePlugin, LoadError> {
        let raw = (exports.create)() as *mut Box<dyn Plugin>;

        let ptr = NonNull::new(raw).ok_or_else(|| {
            LoadError::new(
                LoadResult::InitializationFailed,
                format!("factory of {} returned null", exports.name),
            )
        })?;

        Ok(NativePlugin {
            ptr,
            destroy: exports.destroy,
            _library: Arc::clone(self),
        })
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                debug!(path = %self.path.display(), error = %e, "Library close reported an error");
            }
        }
        debug!(path = %self.path.display(), "Native library released");
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("path", &self.path)
            .field("open", &self.library.is_some())
            .finish()
    }
}

/// A plugin object created by a native module
pub struct NativePlugin {
    ptr: NonNull<Box<dyn Plugin>>,
    destroy: DestroyFn,
    _library: Arc<NativeLibrary>,
}

impl NativePlugin {
    /// Borrow the plugin
    pub fn plugin(&self) -> &dyn Plugin {
        // SAFETY: `ptr` came from the module factory and is only freed in Drop.
        unsafe { &**self.ptr.as_ref() }
    }

    /// Mutably borrow the plugin
    pub fn plugin_mut(&mut self) -> &mut dyn Plugin {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { &mut **self.ptr.as_mut() }
    }
}

impl Drop for NativePlugin {
    fn drop(&mut self) {
        // SAFETY: the module's own destructor for a pointer its factory made.
        // `_library` is dropped after this body, so the code is still mapped.
        unsafe { (self.destroy)(self.ptr.as_ptr() as *mut c_void) };
    }
}

// SAFETY: the pointee is a `Box<dyn Plugin>` and `Plugin: Send + Sync`.
unsafe impl Send for NativePlugin {}
unsafe impl Sync for NativePlugin {}

impl fmt::Debug for NativePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativePlugin")
            .field("plugin", &self.plugin().name())
            .field("library", &self._library.path())
            .finish()
    }
}

fn read_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null, NUL-terminated per the export table contract.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(str::to_string)
}
