//! C ABI shared between the runtime and native plugin modules
//!
//! A module exports two symbols:
//!
//! - [`API_VERSION_SYMBOL`]: `extern "C" fn() -> u32` returning [`PLUGIN_API_VERSION`]
//! - [`EXPORTS_SYMBOL`]: `extern "C" fn() -> *const PluginExports`
//!
//! Use [`export_plugin!`](crate::export_plugin) instead of writing them by hand.

use crate::plugin::{Plugin, PluginMetadata};
use std::ffi::{c_char, c_void, CString};
use std::panic::{self, AssertUnwindSafe};

/// Interface version this crate was built with
pub const PLUGIN_API_VERSION: u32 = 1;

/// Version query symbol
pub const API_VERSION_SYMBOL: &[u8] = b"keel_plugin_api_version";

/// Export table symbol
pub const EXPORTS_SYMBOL: &[u8] = b"keel_plugin_exports";

/// Signature of the version query symbol
pub type ApiVersionFn = extern "C" fn() -> u32;

/// Signature of the export table symbol
pub type ExportsFn = extern "C" fn() -> *const PluginExports;

/// Produces a `*mut Box<dyn Plugin>` as an opaque pointer
pub type CreateFn = extern "C" fn() -> *mut c_void;

/// Destroys a pointer returned by [`CreateFn`]
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Module-wide teardown, called once before the library is released
pub type CleanupFn = extern "C" fn();

/// Fixed-layout export record
#[repr(C)]
#[derive(Debug)]
pub struct PluginExports {
    /// NUL-terminated plugin name
    pub name: *const c_char,
    /// NUL-terminated version string
    pub version: *const c_char,
    /// Plugin factory
    pub create: CreateFn,
    /// Plugin destructor
    pub destroy: DestroyFn,
    /// Optional module teardown hook
    pub cleanup: Option<CleanupFn>,
    /// NUL-terminated JSON [`PluginMetadata`], may be null
    pub metadata_json: *const c_char,
}

/// Owner of the strings an export record points into.
///
/// Lives in a `static` inside the plugin module so the pointers stay valid for
/// as long as the library is loaded.
#[derive(Debug)]
pub struct ExportRecord {
    _name: CString,
    _version: CString,
    _metadata_json: CString,
    exports: PluginExports,
}

impl ExportRecord {
    /// Build a record from metadata and the module's callbacks
    pub fn new(
        metadata: &PluginMetadata,
        create: CreateFn,
        destroy: DestroyFn,
        cleanup: Option<CleanupFn>,
    ) -> Self {
        let name = CString::new(metadata.name.as_str()).unwrap_or_default();
        let version = CString::new(metadata.version.to_string()).unwrap_or_default();
        let metadata_json = serde_json::to_string(metadata)
            .ok()
            .and_then(|json| CString::new(json).ok())
            .unwrap_or_default();

        let exports = PluginExports {
            name: name.as_ptr(),
            version: version.as_ptr(),
            create,
            destroy,
            cleanup,
            metadata_json: metadata_json.as_ptr(),
        };

        Self {
            _name: name,
            _version: version,
            _metadata_json: metadata_json,
            exports,
        }
    }

    /// Pointer handed across the ABI boundary
    pub fn as_ptr(&self) -> *const PluginExports {
        &self.exports
    }
}

// The record only points into its own immutable CStrings.
#[allow(unsafe_code)]
unsafe impl Send for ExportRecord {}
#[allow(unsafe_code)]
unsafe impl Sync for ExportRecord {}

/// Run a plugin constructor on behalf of a module factory.
///
/// Returns the boxed plugin as an opaque pointer, or null if the constructor
/// panicked. A panic must not unwind across the `extern "C"` boundary.
pub fn guarded_create<F>(constructor: F) -> *mut c_void
where
    F: FnOnce() -> Box<dyn Plugin>,
{
    match panic::catch_unwind(AssertUnwindSafe(constructor)) {
        Ok(plugin) => Box::into_raw(Box::new(plugin)) as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Export a plugin type from a `cdylib` crate.
///
/// ```rust,ignore
/// keel_plugin_api::export_plugin!(CounterPlugin::default(), CounterPlugin::metadata());
/// keel_plugin_api::export_plugin!(CounterPlugin::default(), CounterPlugin::metadata(), cleanup = on_unload);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($constructor:expr, $metadata:expr) => {
        $crate::export_plugin!(@emit $constructor, $metadata, ::std::option::Option::None);
    };
    ($constructor:expr, $metadata:expr, cleanup = $cleanup:path) => {
        $crate::export_plugin!(@emit $constructor, $metadata, ::std::option::Option::Some($cleanup as $crate::abi::CleanupFn));
    };
    (@emit $constructor:expr, $metadata:expr, $cleanup:expr) => {
        #[no_mangle]
        pub extern "C" fn keel_plugin_api_version() -> u32 {
            $crate::abi::PLUGIN_API_VERSION
        }

        #[no_mangle]
        pub extern "C" fn keel_plugin_exports() -> *const $crate::abi::PluginExports {
            static RECORD: ::std::sync::OnceLock<$crate::abi::ExportRecord> =
                ::std::sync::OnceLock::new();
            RECORD
                .get_or_init(|| {
                    $crate::abi::ExportRecord::new(
                        &$metadata,
                        __keel_create_plugin,
                        __keel_destroy_plugin,
                        $cleanup,
                    )
                })
                .as_ptr()
        }

        extern "C" fn __keel_create_plugin() -> *mut ::std::ffi::c_void {
            $crate::abi::guarded_create(|| {
                let plugin: ::std::boxed::Box<dyn $crate::Plugin> =
                    ::std::boxed::Box::new($constructor);
                plugin
            })
        }

        unsafe extern "C" fn __keel_destroy_plugin(ptr: *mut ::std::ffi::c_void) {
            if !ptr.is_null() {
                drop(::std::boxed::Box::from_raw(
                    ptr as *mut ::std::boxed::Box<dyn $crate::Plugin>,
                ));
            }
        }
    };
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::context::HostContext;
    use crate::error::Result;
    use crate::version::PluginVersion;
    use async_trait::async_trait;
    use std::ffi::CStr;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Stub;

    #[async_trait]
    impl Plugin for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn initialize(&mut self, _context: Arc<dyn HostContext>) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    extern "C" fn create() -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe extern "C" fn destroy(_ptr: *mut c_void) {}

    #[test]
    fn test_export_record_strings() {
        let metadata = PluginMetadata::new("counter", PluginVersion::new(1, 2, 0));
        let record = ExportRecord::new(&metadata, create, destroy, None);
        let exports = unsafe { &*record.as_ptr() };

        let name = unsafe { CStr::from_ptr(exports.name) };
        let version = unsafe { CStr::from_ptr(exports.version) };
        let json = unsafe { CStr::from_ptr(exports.metadata_json) };

        assert_eq!(name.to_str().unwrap(), "counter");
        assert_eq!(version.to_str().unwrap(), "1.2.0");

        let parsed: PluginMetadata = serde_json::from_str(json.to_str().unwrap()).unwrap();
        assert_eq!(parsed, metadata);
        assert!(exports.cleanup.is_none());
    }

    #[test]
    fn test_guarded_create_returns_plugin() {
        let raw = guarded_create(|| -> Box<dyn Plugin> { Box::new(Stub) });
        assert!(!raw.is_null());

        let plugin = unsafe { Box::from_raw(raw as *mut Box<dyn Plugin>) };
        assert_eq!(plugin.name(), "stub");
    }

    #[test]
    fn test_guarded_create_catches_panic() {
        let raw = guarded_create(|| -> Box<dyn Plugin> { panic!("constructor failed") });
        assert!(raw.is_null());
    }
}
