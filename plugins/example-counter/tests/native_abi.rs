//! Loads real modules through the C ABI: the counter cdylib built with this
//! crate, and small fixture libraries compiled with rustc on the fly.

use keel_plugin_api::abi::PLUGIN_API_VERSION;
use keel_plugin_api::{MessagePriority, PluginEvent, PluginState};
use keel_plugin_runtime::loader::file_checksum;
use keel_plugin_runtime::prelude::*;
use keel_plugin_runtime::{LoadResult, PluginLoader};
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WRONG_VERSION: &str = r#"
#[no_mangle]
pub extern "C" fn keel_plugin_api_version() -> u32 {
    @VERSION@ + 1
}
"#;

const NO_SYMBOLS: &str = r#"
#[no_mangle]
pub extern "C" fn unrelated_entry_point() -> u32 {
    7
}
"#;

const HOLLOW: &str = r#"
use std::ffi::{c_char, c_void};

#[repr(C)]
pub struct Exports {
    name: *const c_char,
    version: *const c_char,
    create: extern "C" fn() -> *mut c_void,
    destroy: unsafe extern "C" fn(*mut c_void),
    cleanup: Option<extern "C" fn()>,
    metadata_json: *const c_char,
}

unsafe impl Sync for Exports {}

extern "C" fn create() -> *mut c_void {
    std::ptr::null_mut()
}

unsafe extern "C" fn destroy(_ptr: *mut c_void) {}

extern "C" fn cleanup() {
    let _ = std::fs::write(@MARKER@, b"released");
}

static EXPORTS: Exports = Exports {
    name: b"hollow\0".as_ptr() as *const c_char,
    version: b"1.0.0\0".as_ptr() as *const c_char,
    create,
    destroy,
    cleanup: Some(cleanup),
    metadata_json: std::ptr::null(),
};

#[no_mangle]
pub extern "C" fn keel_plugin_api_version() -> u32 {
    @VERSION@
}

#[no_mangle]
pub extern "C" fn keel_plugin_exports() -> *const Exports {
    &EXPORTS
}
"#;

fn module_file(name: &str) -> String {
    format!("{DLL_PREFIX}{name}{DLL_SUFFIX}")
}

/// The counter cdylib cargo built next to this test binary
fn built_counter() -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let file = module_file("example_counter");
    [deps.join(&file), deps.parent().unwrap().join(&file)]
        .into_iter()
        .find(|p| p.is_file())
        .unwrap_or_else(|| panic!("{file} not found near {}", deps.display()))
}

/// Copy the counter module (and optionally a manifest) into a fresh directory
fn counter_dir(manifest: Option<&str>) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join(module_file("example_counter"));
    std::fs::copy(built_counter(), &module).unwrap();
    if let Some(manifest) = manifest {
        std::fs::write(dir.path().join("plugin.json"), manifest).unwrap();
    }
    (dir, module)
}

fn rustc() -> PathBuf {
    if let Some(rustc) = std::env::var_os("RUSTC") {
        return PathBuf::from(rustc);
    }
    let sibling = Path::new(env!("CARGO")).with_file_name(format!(
        "rustc{}",
        std::env::consts::EXE_SUFFIX
    ));
    if sibling.is_file() {
        sibling
    } else {
        PathBuf::from("rustc")
    }
}

/// Compile `source` into a cdylib named `name` inside `dir`
fn build_fixture(dir: &Path, name: &str, source: &str) -> PathBuf {
    let source = source.replace("@VERSION@", &PLUGIN_API_VERSION.to_string());
    let src = dir.join(format!("{name}.rs"));
    std::fs::write(&src, source).unwrap();

    let out = dir.join(module_file(name));
    let status = Command::new(rustc())
        .args(["--crate-type", "cdylib", "--edition", "2021", "--crate-name", name, "-o"])
        .arg(&out)
        .arg(&src)
        .status()
        .unwrap();
    assert!(status.success(), "failed to compile fixture {name}");
    out
}

fn registry(dir: &Path, configure: impl FnOnce(&mut RuntimeConfig)) -> PluginRegistry {
    let mut config = RuntimeConfig::default();
    config.plugins.plugin_dir = dir.join("state");
    configure(&mut config);
    let registry = PluginRegistry::new(config).unwrap();
    registry.start();
    registry
}

#[test]
fn test_counter_module_handshake() {
    let (_dir, module) = counter_dir(None);
    let loader = PluginLoader::new();

    let info = loader.load(&module).unwrap();
    assert_eq!(info.metadata.name, "counter");
    assert_eq!(info.metadata.version, PluginVersion::new(0, 1, 0));
    assert!(loader.is_loaded(&module));

    let object = loader.instantiate(&info).unwrap();
    assert_eq!(object.plugin().name(), "counter");

    let module_handle = info.module.clone().unwrap();
    assert_eq!(module_handle.reference_count(), 3);

    drop(object);
    loader.unload(info);
    assert!(!loader.is_loaded(&module));
    assert_eq!(module_handle.reference_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_counter_runs_in_registry() {
    let (dir, module) = counter_dir(Some(include_str!("../plugin.json")));
    let registry = registry(dir.path(), |_| {});

    let ticks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ticks);
    registry
        .events()
        .subscribe(
            "observer",
            "counter.tick",
            Arc::new(move |_event: &PluginEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            MessagePriority::Low,
        )
        .unwrap();

    let name = registry
        .load_plugin(PluginSource::Native(module.clone()))
        .await
        .unwrap();
    assert_eq!(name, "counter");
    let instance = registry.instance("counter").unwrap();
    assert_eq!(instance.metadata().author, "Keel contributors");

    registry.start_plugin("counter").await.unwrap();
    assert_eq!(registry.plugin_state("counter"), Some(PluginState::Active));

    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert_eq!(registry.update_plugins(0.016).await, 1);
    assert!(registry.events().wait_idle(Duration::from_secs(2)).await);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    drop(instance);
    registry.unload_plugin("counter", false).await.unwrap();
    assert!(!registry.is_plugin_loaded("counter"));
    assert!(!registry.loader().is_loaded(&module));

    registry.shutdown().await.unwrap();
}

#[test]
fn test_wrong_api_version_is_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    let module = build_fixture(dir.path(), "future_abi", WRONG_VERSION);

    let err = PluginLoader::new().load(&module).unwrap_err();
    assert_eq!(err.result, LoadResult::IncompatibleVersion);
}

#[test]
fn test_module_without_exports_is_missing_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let module = build_fixture(dir.path(), "bare_library", NO_SYMBOLS);

    let err = PluginLoader::new().load(&module).unwrap_err();
    assert_eq!(err.result, LoadResult::MissingSymbols);
}

#[test]
fn test_null_factory_fails_and_unload_runs_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("cleanup.marker");
    let source = HOLLOW.replace("@MARKER@", &format!("{:?}", marker.display().to_string()));
    let module = build_fixture(dir.path(), "hollow", &source);
    let loader = PluginLoader::new();

    let info = loader.load(&module).unwrap();
    assert_eq!(info.metadata.name, "hollow");
    assert!(info.module.as_ref().unwrap().exports().has_cleanup());

    let err = loader.instantiate(&info).unwrap_err();
    assert_eq!(err.result, LoadResult::InitializationFailed);
    assert!(!marker.exists());

    loader.unload(info);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "released");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_manifest_refuses_load() {
    let (dir, module) = counter_dir(Some("{ \"name\": \"counter\", "));
    let registry = registry(dir.path(), |_| {});

    let err = registry
        .load_plugin(PluginSource::Native(module.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.load_result(), Some(LoadResult::InvalidFormat));
    assert!(!registry.is_plugin_loaded("counter"));
    assert!(!registry.loader().is_loaded(&module));

    registry.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_checksum_gates_native_load() {
    let (dir, module) = counter_dir(None);
    let file = module_file("example_counter");
    let digest = file_checksum(&module).unwrap();

    let wrong = "0".repeat(64);
    let guarded = registry(dir.path(), |config| {
        config.security.trusted_checksums.insert(file.clone(), wrong);
    });
    let err = guarded
        .load_plugin(PluginSource::Native(module.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.load_result(), Some(LoadResult::SecurityViolation));
    guarded.shutdown().await.unwrap();

    let trusted = registry(dir.path(), |config| {
        config.security.require_checksums = true;
        config.security.trusted_checksums.insert(file.clone(), digest);
    });
    let name = trusted
        .load_plugin(PluginSource::Native(module))
        .await
        .unwrap();
    assert_eq!(name, "counter");
    trusted.shutdown().await.unwrap();
}
