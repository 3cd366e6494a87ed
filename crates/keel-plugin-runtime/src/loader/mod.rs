//! Native module loading
//!
//! [`PluginLoader`] turns a name or path into a validated [`LoadInfo`]:
//! resolve on the search paths, run the security predicate, verify the file's
//! trusted checksum, check file permissions and extension, open the library,
//! perform the API version
//! handshake and validate the embedded metadata. All unsafe code lives in
//! [`ffi`].

pub mod ffi;

use crate::error::{LoadError, LoadResult};
use chrono::{DateTime, Utc};
use ffi::{ModuleExports, NativeLibrary, NativePlugin};
use keel_plugin_api::abi::PLUGIN_API_VERSION;
use keel_plugin_api::{Plugin, PluginMetadata, PluginVersion};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Predicate deciding whether a resolved module path may be loaded
pub type SecurityPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// A module that has been opened and validated
#[derive(Debug, Clone)]
pub struct NativeModule {
    library: Arc<NativeLibrary>,
    exports: ModuleExports,
}

impl NativeModule {
    /// Export table of the module
    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// Number of live handles to the library, including this one
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.library)
    }
}

/// Where an instance came from and what it declared
#[derive(Debug, Clone)]
pub struct LoadInfo {
    /// Module path; `None` for in-process plugins
    pub path: Option<PathBuf>,
    /// Validated metadata
    pub metadata: PluginMetadata,
    /// Library handle; `None` for in-process plugins
    pub module: Option<NativeModule>,
    /// When the load completed
    pub loaded_at: DateTime<Utc>,
}

impl LoadInfo {
    /// Load info for an in-process plugin
    pub fn in_process(metadata: PluginMetadata) -> Self {
        Self {
            path: None,
            metadata,
            module: None,
            loaded_at: Utc::now(),
        }
    }
}

/// A live plugin object
#[derive(Debug)]
pub enum PluginObject {
    /// Created in-process
    Static(Box<dyn Plugin>),
    /// Created by a native module
    Native(NativePlugin),
}

impl PluginObject {
    /// Borrow the plugin
    pub fn plugin(&self) -> &dyn Plugin {
        match self {
            PluginObject::Static(plugin) => plugin.as_ref(),
            PluginObject::Native(plugin) => plugin.plugin(),
        }
    }

    /// Mutably borrow the plugin
    pub fn plugin_mut(&mut self) -> &mut dyn Plugin {
        match self {
            PluginObject::Static(plugin) => plugin.as_mut(),
            PluginObject::Native(plugin) => plugin.plugin_mut(),
        }
    }
}

/// Loads native plugin modules
pub struct PluginLoader {
    search_paths: Vec<PathBuf>,
    trusted_directories: Vec<PathBuf>,
    security_policy: Option<SecurityPredicate>,
    trusted_checksums: BTreeMap<String, String>,
    require_checksums: bool,
    reject_world_writable: bool,
    loaded: Mutex<HashMap<PathBuf, String>>,
}

impl PluginLoader {
    /// Create a loader with no search paths and no policy
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            trusted_directories: Vec::new(),
            security_policy: None,
            trusted_checksums: BTreeMap::new(),
            require_checksums: false,
            reject_world_writable: true,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Append a search path
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Append a search path in place
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.search_paths.push(path.into());
        self
    }

    /// Search paths in lookup order
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Only accept modules under `dir` (may be called several times)
    pub fn with_trusted_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trusted_directories.push(dir.into());
        self
    }

    /// Install a custom path predicate
    pub fn with_security_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.security_policy = Some(Arc::new(policy));
        self
    }

    /// Expect the module file named `file_name` to hash to `sha256_hex`
    pub fn with_trusted_checksum(
        mut self,
        file_name: impl Into<String>,
        sha256_hex: impl Into<String>,
    ) -> Self {
        self.trusted_checksums
            .insert(file_name.into(), sha256_hex.into().to_ascii_lowercase());
        self
    }

    /// Refuse modules whose file name has no trusted checksum
    pub fn with_require_checksums(mut self, require: bool) -> Self {
        self.require_checksums = require;
        self
    }

    /// Reject world-writable module files (unix only)
    pub fn with_reject_world_writable(mut self, reject: bool) -> Self {
        self.reject_world_writable = reject;
        self
    }

    /// File names tried for a bare plugin name, in order
    pub fn name_variants(name: &str) -> Vec<OsString> {
        let ext = std::env::consts::DLL_EXTENSION;
        let mut variants = vec![
            OsString::from(name),
            libloading::library_filename(name),
            OsString::from(format!("{name}.{ext}")),
            OsString::from(format!("lib{name}.{ext}")),
        ];
        let mut seen = Vec::new();
        variants.retain(|v| {
            if seen.contains(v) {
                false
            } else {
                seen.push(v.clone());
                true
            }
        });
        variants
    }

    /// Resolve a name or path to an existing file
    pub fn resolve(&self, name_or_path: impl AsRef<Path>) -> Result<PathBuf, LoadError> {
        let requested = name_or_path.as_ref();

        if requested.is_file() {
            return canonical(requested);
        }

        let bare = requested.components().count() == 1;
        let mut tried = Vec::new();

        if let (true, Some(name)) = (bare, requested.to_str()) {
            for dir in &self.search_paths {
                for variant in Self::name_variants(name) {
                    let candidate = dir.join(&variant);
                    if candidate.is_file() {
                        return canonical(&candidate);
                    }
                    tried.push(candidate);
                }
            }
        } else {
            tried.push(requested.to_path_buf());
        }

        Err(LoadError::new(
            LoadResult::FileNotFound,
            format!(
                "{} not found (tried {})",
                requested.display(),
                tried
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ))
    }

    fn check_security(&self, path: &Path) -> Result<(), LoadError> {
        if !self.trusted_directories.is_empty() {
            let trusted = self.trusted_directories.iter().any(|dir| {
                dir.canonicalize()
                    .map(|dir| path.starts_with(dir))
                    .unwrap_or(false)
            });
            if !trusted {
                return Err(LoadError::new(
                    LoadResult::SecurityViolation,
                    format!("{} is outside the trusted directories", path.display()),
                ));
            }
        }

        if let Some(policy) = &self.security_policy {
            if !policy(path) {
                return Err(LoadError::new(
                    LoadResult::SecurityViolation,
                    format!("{} rejected by security policy", path.display()),
                ));
            }
        }

        self.check_checksum(path)
    }

    fn check_checksum(&self, path: &Path) -> Result<(), LoadError> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let Some(expected) = self.trusted_checksums.get(file_name) else {
            if self.require_checksums {
                return Err(LoadError::new(
                    LoadResult::SecurityViolation,
                    format!("{} has no trusted checksum", path.display()),
                ));
            }
            return Ok(());
        };

        let actual = file_checksum(path)?;
        if &actual != expected {
            warn!(path = %path.display(), %expected, %actual, "Module checksum mismatch");
            return Err(LoadError::new(
                LoadResult::SecurityViolation,
                format!(
                    "checksum of {} is {actual}, expected {expected}",
                    path.display()
                ),
            ));
        }
        debug!(path = %path.display(), "Module checksum verified");
        Ok(())
    }

    fn check_permissions(&self, path: &Path) -> Result<(), LoadError> {
        std::fs::File::open(path).map_err(|e| {
            LoadError::new(
                LoadResult::PermissionDenied,
                format!("cannot read {}: {e}", path.display()),
            )
        })?;

        #[cfg(unix)]
        if self.reject_world_writable {
            use std::os::unix::fs::PermissionsExt;

            let mode = std::fs::metadata(path)
                .map_err(|e| LoadError::new(LoadResult::PermissionDenied, e))?
                .permissions()
                .mode();
            if mode & 0o002 != 0 {
                return Err(LoadError::new(
                    LoadResult::PermissionDenied,
                    format!("{} is world-writable", path.display()),
                ));
            }
        }

        Ok(())
    }

    fn check_format(path: &Path) -> Result<(), LoadError> {
        let ext = path.extension().and_then(|e| e.to_str());
        if ext != Some(std::env::consts::DLL_EXTENSION) {
            return Err(LoadError::new(
                LoadResult::InvalidFormat,
                format!(
                    "{} does not have the .{} extension",
                    path.display(),
                    std::env::consts::DLL_EXTENSION
                ),
            ));
        }
        Ok(())
    }

    /// Run every pre-open check on a resolved path
    pub fn verify(&self, path: &Path) -> Result<(), LoadError> {
        self.check_security(path)?;
        self.check_permissions(path)?;
        Self::check_format(path)
    }

    fn open_validated(&self, path: &Path) -> Result<(Arc<NativeLibrary>, ModuleExports, PluginMetadata), LoadError> {
        self.verify(path)?;

        let library = Arc::new(NativeLibrary::open(path)?);

        let version = library.api_version()?;
        if version != PLUGIN_API_VERSION {
            return Err(LoadError::new(
                LoadResult::IncompatibleVersion,
                format!(
                    "{} was built against plugin API {version}, runtime expects {PLUGIN_API_VERSION}",
                    path.display()
                ),
            ));
        }

        let exports = library.exports()?;
        let metadata = metadata_from_exports(&exports)?;

        metadata
            .validate()
            .map_err(|e| LoadError::new(LoadResult::InvalidFormat, e))?;

        Ok((library, exports, metadata))
    }

    /// Read a module's metadata without keeping it loaded
    pub fn inspect(&self, name_or_path: impl AsRef<Path>) -> Result<PluginMetadata, LoadError> {
        let path = self.resolve(name_or_path)?;
        let (_library, _exports, metadata) = self.open_validated(&path)?;
        Ok(metadata)
    }

    /// Load and validate a module
    pub fn load(&self, name_or_path: impl AsRef<Path>) -> Result<LoadInfo, LoadError> {
        let path = self.resolve(name_or_path)?;

        if let Some(existing) = self.loaded.lock().get(&path) {
            return Err(LoadError::new(
                LoadResult::AlreadyLoaded,
                format!("{} is already loaded as {existing}", path.display()),
            ));
        }

        let (library, exports, metadata) = self.open_validated(&path)?;

        self.loaded
            .lock()
            .insert(path.clone(), metadata.name.clone());

        info!(
            plugin = %metadata.name,
            version = %metadata.version,
            path = %path.display(),
            "Plugin module loaded"
        );

        Ok(LoadInfo {
            path: Some(path),
            metadata,
            module: Some(NativeModule { library, exports }),
            loaded_at: Utc::now(),
        })
    }

    /// Create a plugin object from a loaded module
    pub fn instantiate(&self, info: &LoadInfo) -> Result<PluginObject, LoadError> {
        let module = info.module.as_ref().ok_or_else(|| {
            LoadError::new(
                LoadResult::InvalidFormat,
                format!("{} is not a native module", info.metadata.name),
            )
        })?;

        module
            .library
            .instantiate(&module.exports)
            .map(PluginObject::Native)
    }

    /// Release a module.
    ///
    /// The library closes (after its cleanup hook) once every object it
    /// produced has been dropped.
    pub fn unload(&self, info: LoadInfo) {
        if let Some(path) = &info.path {
            self.loaded.lock().remove(path);
        }

        if let Some(module) = &info.module {
            let others = module.reference_count().saturating_sub(1);
            if others > 0 {
                debug!(
                    plugin = %info.metadata.name,
                    live_objects = others,
                    "Library release deferred until live objects are dropped"
                );
            }
        }

        info!(plugin = %info.metadata.name, "Plugin module unloaded");
    }

    /// Unload then load the same path.
    ///
    /// Refused while any object produced by the old module is still alive.
    pub fn reload(&self, info: LoadInfo) -> Result<LoadInfo, LoadError> {
        let path = info.path.clone().ok_or_else(|| {
            LoadError::new(
                LoadResult::InvalidFormat,
                format!("{} has no module path", info.metadata.name),
            )
        })?;

        if let Some(module) = &info.module {
            let others = module.reference_count().saturating_sub(1);
            if others > 0 {
                warn!(plugin = %info.metadata.name, live_objects = others, "Hot swap refused");
                return Err(LoadError::new(
                    LoadResult::AlreadyLoaded,
                    format!(
                        "{} still has {others} live object(s) from the old module",
                        info.metadata.name
                    ),
                ));
            }
        }

        self.unload(info);
        self.load(&path)
    }

    /// Whether a module at `path` is currently loaded
    pub fn is_loaded(&self, path: &Path) -> bool {
        canonical(path)
            .map(|p| self.loaded.lock().contains_key(&p))
            .unwrap_or(false)
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("search_paths", &self.search_paths)
            .field("trusted_directories", &self.trusted_directories)
            .field("security_policy", &self.security_policy.as_ref().map(|_| "<opaque>"))
            .field("trusted_checksums", &self.trusted_checksums.len())
            .field("require_checksums", &self.require_checksums)
            .field("reject_world_writable", &self.reject_world_writable)
            .field("loaded", &self.loaded.lock().len())
            .finish()
    }
}

/// SHA-256 of a file as lowercase hex
pub fn file_checksum(path: &Path) -> Result<String, LoadError> {
    let bytes = std::fs::read(path).map_err(|e| {
        LoadError::new(
            LoadResult::PermissionDenied,
            format!("cannot read {}: {e}", path.display()),
        )
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn canonical(path: &Path) -> Result<PathBuf, LoadError> {
    path.canonicalize().map_err(|e| {
        LoadError::new(
            LoadResult::FileNotFound,
            format!("{}: {e}", path.display()),
        )
    })
}

fn metadata_from_exports(exports: &ModuleExports) -> Result<PluginMetadata, LoadError> {
    let metadata = match &exports.metadata_json {
        Some(json) => serde_json::from_str::<PluginMetadata>(json).map_err(|e| {
            LoadError::new(
                LoadResult::InvalidFormat,
                format!("embedded metadata of {} is malformed: {e}", exports.name),
            )
        })?,
        None => {
            let version: PluginVersion = exports
                .version
                .parse()
                .map_err(|e| LoadError::new(LoadResult::InvalidFormat, e))?;
            PluginMetadata::new(exports.name.clone(), version)
        }
    };

    if metadata.name != exports.name {
        return Err(LoadError::new(
            LoadResult::InvalidFormat,
            format!(
                "export table names '{}' but metadata names '{}'",
                exports.name, metadata.name
            ),
        ));
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_name(name: &str) -> String {
        format!("{name}.{}", std::env::consts::DLL_EXTENSION)
    }

    #[test]
    fn test_name_variants() {
        let variants = PluginLoader::name_variants("physics");
        assert_eq!(variants[0], OsString::from("physics"));
        assert!(variants.contains(&libloading::library_filename("physics")));
        assert!(variants.contains(&OsString::from(module_name("physics"))));
    }

    #[test]
    fn test_resolve_via_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(libloading::library_filename("audio"));
        std::fs::write(&file, b"").unwrap();

        let loader = PluginLoader::new()
            .with_search_path(dir.path().join("missing"))
            .with_search_path(dir.path());

        let resolved = loader.resolve("audio").unwrap();
        assert_eq!(resolved, file.canonicalize().unwrap());
    }

    #[test]
    fn test_file_not_found() {
        let loader = PluginLoader::new();
        let err = loader.load("does-not-exist").unwrap_err();
        assert_eq!(err.result, LoadResult::FileNotFound);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_security_policy_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(module_name("evil"));
        std::fs::write(&file, b"").unwrap();

        let loader = PluginLoader::new().with_security_policy(|_| false);
        let err = loader.load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::SecurityViolation);
    }

    #[test]
    fn test_untrusted_directory_rejected() {
        let trusted = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let file = other.path().join(module_name("stray"));
        std::fs::write(&file, b"").unwrap();

        let loader = PluginLoader::new().with_trusted_directory(trusted.path());
        let err = loader.load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::SecurityViolation);
    }

    #[test]
    fn test_checksum_verified_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(module_name("signed"));
        std::fs::write(&file, b"test").unwrap();
        let name = module_name("signed");
        let digest = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert_eq!(file_checksum(&file).unwrap(), digest);

        let tampered = PluginLoader::new().with_trusted_checksum(name.clone(), "00".repeat(32));
        let err = tampered.load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::SecurityViolation);
        assert!(err.message.contains(digest));

        // A matching digest passes the check; the junk file then fails to open
        let trusted = PluginLoader::new()
            .with_reject_world_writable(false)
            .with_trusted_checksum(name, digest.to_uppercase());
        assert_eq!(trusted.load(&file).unwrap_err().result, LoadResult::InvalidFormat);
    }

    #[test]
    fn test_required_checksum_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(module_name("unlisted"));
        std::fs::write(&file, b"").unwrap();

        let loader = PluginLoader::new().with_require_checksums(true);
        let err = loader.load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::SecurityViolation);
        assert!(PluginLoader::new()
            .with_reject_world_writable(false)
            .verify(&file)
            .is_ok());
    }

    #[test]
    fn test_wrong_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.txt");
        std::fs::write(&file, b"").unwrap();

        let err = PluginLoader::new().load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::InvalidFormat);
    }

    #[cfg(unix)]
    #[test]
    fn test_world_writable_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(module_name("open"));
        std::fs::write(&file, b"").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();

        let err = PluginLoader::new().load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::PermissionDenied);
    }

    #[test]
    fn test_garbage_library_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(module_name("garbage"));
        std::fs::write(&file, b"definitely not ELF").unwrap();

        let loader = PluginLoader::new().with_reject_world_writable(false);
        let err = loader.load(&file).unwrap_err();
        assert_eq!(err.result, LoadResult::InvalidFormat);
        assert!(!loader.is_loaded(&file));
    }
}
