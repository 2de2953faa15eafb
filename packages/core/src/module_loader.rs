// ============================================================================
// File: packages/core/src/module_loader.rs
// ----------------------------------------------------------------------------
// ModuleLoader: maps module.method(args) invocations to reloaded shared
// libraries on disk, one writer-priority lock per module. Hot reload is
// built around a dynamic library with a stable C-ABI entry point rather
// than runtime source re-exec. Mtime polling follows the same polling-loop
// idiom as a directory watcher, generalized from "watch a directory" to
// "check one module's mtime on demand, throttled".
// ============================================================================

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use libloading::{Library, Symbol};
use log::{info, warn};

use crate::error::ModuleError;
use crate::request_context::RequestContext;
use crate::sync::DeadlineRwLock;

/// One exported callable. Declared explicitly by the module rather than
/// scraped from a function signature (§9: "Hidden source_module_name /
/// call_attributes kwargs... replace with an explicit opt-in").
#[repr(C)]
pub struct MethodDescriptor {
    pub name: *const c_char,
    pub wants_source_module: bool,
    pub wants_call_attributes: bool,
    pub invoke: extern "C" fn(
        args_json: *const c_char,
        source_module: *const c_char,
        call_attributes_json: *const c_char,
        out_result_json: *mut *mut c_char,
    ) -> bool,
}

/// The export table a module's entry point returns. `EXPORTS` lists every
/// public name; an entry of `"*"` enables the `__getattr__`-equivalent
/// dynamic lookup fallback.
#[repr(C)]
pub struct ModuleDescriptor {
    pub exports: *const *const c_char,
    pub exports_len: usize,
    pub methods: *const MethodDescriptor,
    pub methods_len: usize,
    /// A module opts out of hot reload by setting this to `false`; the
    /// loader then only ever loads it once, on first access.
    pub reloadable: bool,
}

type DescriptorFn = unsafe extern "C" fn() -> *mut ModuleDescriptor;

/// Safe, owned view of a loaded module's export table.
#[derive(Clone)]
pub struct ExportedMethod {
    pub name: String,
    pub wants_source_module: bool,
    pub wants_call_attributes: bool,
    invoke: extern "C" fn(*const c_char, *const c_char, *const c_char, *mut *mut c_char) -> bool,
}

impl std::fmt::Debug for ExportedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedMethod").field("name", &self.name).finish()
    }
}

impl ExportedMethod {
    pub fn invoke(&self, args_json: &str, source_module: Option<&str>, call_attributes_json: &str) -> Result<String, ModuleError> {
        use std::ffi::CString;
        let args_c = CString::new(args_json).map_err(|e| ModuleError::CallFailed(e.to_string()))?;
        let source_c = source_module.map(CString::new).transpose().map_err(|e| ModuleError::CallFailed(e.to_string()))?;
        let attrs_c = CString::new(call_attributes_json).map_err(|e| ModuleError::CallFailed(e.to_string()))?;

        let mut out: *mut c_char = std::ptr::null_mut();
        let source_ptr = source_c.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
        let ok = (self.invoke)(args_c.as_ptr(), source_ptr, attrs_c.as_ptr(), &mut out);
        if !ok || out.is_null() {
            return Err(ModuleError::CallFailed(self.name.clone()));
        }
        let result = unsafe { CStr::from_ptr(out) }.to_string_lossy().into_owned();
        Ok(result)
    }
}

struct LoadedModule {
    _library: Library,
    exports: Vec<String>,
    methods: HashMap<String, ExportedMethod>,
    wildcard: bool,
    reloadable: bool,
    version: u64,
}

/// Per-module record: last-seen mtime, reloadable flag, a writer-priority
/// lock guarding the loaded library, and the reload throttle interval.
///
/// `reloadable` starts `true` (unknown until first load) and is pinned to
/// whatever the module itself declared in its `ModuleDescriptor` once a load
/// succeeds; a module that opts out never triggers another mtime check.
pub struct Module {
    name: String,
    path: PathBuf,
    reloadable: std::sync::atomic::AtomicBool,
    throttle: Duration,
    last_mtime: Mutex<Option<SystemTime>>,
    last_check: Mutex<Instant>,
    loaded: DeadlineRwLock<Option<LoadedModule>>,
}

impl Module {
    fn new(name: String, path: PathBuf, throttle: Duration) -> Self {
        Self {
            name,
            path,
            reloadable: std::sync::atomic::AtomicBool::new(true),
            throttle,
            last_mtime: Mutex::new(None),
            last_check: Mutex::new(Instant::now() - throttle),
            loaded: DeadlineRwLock::new(None),
        }
    }

    fn current_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok()?.modified().ok()
    }

    fn needs_reload_check(&self) -> bool {
        if !self.reloadable.load(std::sync::atomic::Ordering::SeqCst) {
            return self.loaded.read(Duration::ZERO).map(|g| g.is_none()).unwrap_or(true);
        }
        let mut last_check = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
        if last_check.elapsed() < self.throttle {
            return false;
        }
        *last_check = Instant::now();
        true
    }

    fn reload_if_needed(&self, ctx: &RequestContext) -> Result<(), ModuleError> {
        if !self.needs_reload_check() {
            return Ok(());
        }

        let current_mtime = self.current_mtime();
        let stale = {
            let last = self.last_mtime.lock().unwrap_or_else(|e| e.into_inner());
            match (current_mtime, *last) {
                (Some(cur), Some(prev)) => cur > prev,
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if !stale {
            return Ok(());
        }

        let mut guard = ctx
            .acquire_write(&self.loaded)
            .ok_or_else(|| ModuleError::LockTimeout(self.name.clone()))?;

        // re-check inside the lock: another thread may have already reloaded
        let recheck_mtime = self.current_mtime();
        let still_stale = {
            let last = self.last_mtime.lock().unwrap_or_else(|e| e.into_inner());
            match (recheck_mtime, *last) {
                (Some(cur), Some(prev)) => cur > prev,
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if !still_stale {
            return Ok(());
        }

        match self.do_reload() {
            Ok(loaded) => {
                let version = guard.as_ref().map_or(1, |m| m.version + 1);
                self.reloadable.store(loaded.reloadable, std::sync::atomic::Ordering::SeqCst);
                *guard = Some(LoadedModule { version, ..loaded });
                *self.last_mtime.lock().unwrap_or_else(|e| e.into_inner()) = recheck_mtime;
                info!("module '{}' reloaded to version {} at {}", self.name, version, chrono::Utc::now().to_rfc3339());
                Ok(())
            }
            Err(e) => {
                // failed reload never replaces a working module
                warn!("module '{}' reload failed, keeping previous version: {}", self.name, e);
                Ok(())
            }
        }
    }

    fn do_reload(&self) -> Result<LoadedModule, ModuleError> {
        let source = std::fs::read_to_string(&self.path)
            .map_err(|e| ModuleError::LoadFailed { module: self.name.clone(), reason: e.to_string() })?;
        if !source.trim_end().ends_with("// EOF") {
            return Err(ModuleError::MissingSentinel(self.name.clone()));
        }

        let library = unsafe { Library::new(&self.path) }
            .map_err(|e| ModuleError::LoadFailed { module: self.name.clone(), reason: e.to_string() })?;

        let descriptor_ptr = unsafe {
            let symbol: Symbol<DescriptorFn> = library
                .get(b"pmnc_module_descriptor\0")
                .map_err(|e| ModuleError::LoadFailed { module: self.name.clone(), reason: e.to_string() })?;
            symbol()
        };
        if descriptor_ptr.is_null() {
            return Err(ModuleError::LoadFailed { module: self.name.clone(), reason: "null descriptor".into() });
        }
        let descriptor = unsafe { &*descriptor_ptr };

        let exports: Vec<String> = unsafe {
            std::slice::from_raw_parts(descriptor.exports, descriptor.exports_len)
                .iter()
                .map(|p| CStr::from_ptr(*p).to_string_lossy().into_owned())
                .collect()
        };
        let wildcard = exports.iter().any(|e| e == "*");

        let methods: HashMap<String, ExportedMethod> = unsafe {
            std::slice::from_raw_parts(descriptor.methods, descriptor.methods_len)
                .iter()
                .map(|m| {
                    let name = CStr::from_ptr(m.name).to_string_lossy().into_owned();
                    (
                        name.clone(),
                        ExportedMethod {
                            name,
                            wants_source_module: m.wants_source_module,
                            wants_call_attributes: m.wants_call_attributes,
                            invoke: m.invoke,
                        },
                    )
                })
                .collect()
        };

        Ok(LoadedModule { _library: library, exports, methods, wildcard, reloadable: descriptor.reloadable, version: 0 })
    }

    /// Look up `attr` in the export table, returning the callable. Must be
    /// exported (`__all__` equivalent) and must not start with `_`.
    fn resolve(&self, attr: &str, ctx: &RequestContext) -> Result<ExportedMethod, ModuleError> {
        if attr.starts_with('_') {
            return Err(ModuleError::Private { module: self.name.clone(), attr: attr.to_string() });
        }

        let guard = ctx
            .acquire_read(&self.loaded)
            .ok_or_else(|| ModuleError::LockTimeout(self.name.clone()))?;
        let loaded = guard.as_ref().ok_or_else(|| ModuleError::NotFound(self.name.clone()))?;

        if !loaded.wildcard && !loaded.exports.iter().any(|e| e == attr) {
            return Err(ModuleError::NotExported { module: self.name.clone(), attr: attr.to_string() });
        }

        loaded
            .methods
            .get(attr)
            .cloned()
            .ok_or_else(|| ModuleError::NotExported { module: self.name.clone(), attr: attr.to_string() })
    }
}

/// Per-process registry of `Module`s, addressed by name. Equivalent of the
/// ambient `pmnc` binding, minus the runtime-reflection pieces §9 calls out
/// for re-architecture.
pub struct ModuleLoader {
    search_dirs: Vec<PathBuf>,
    throttle: Duration,
    modules: Mutex<HashMap<String, std::sync::Arc<Module>>>,
}

fn platform_suffix() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

impl ModuleLoader {
    /// `search_dirs` is searched in order (cage-local first, then shared).
    pub fn new(search_dirs: Vec<PathBuf>, reload_throttle: Duration) -> Self {
        Self { search_dirs, throttle: reload_throttle, modules: Mutex::new(HashMap::new()) }
    }

    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        let filename = format!("{name}.{}", platform_suffix());
        self.search_dirs.iter().map(|dir| dir.join(&filename)).find(|p| p.exists())
    }

    fn module_for(&self, name: &str) -> Result<std::sync::Arc<Module>, ModuleError> {
        let mut modules = self.modules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = modules.get(name) {
            return Ok(std::sync::Arc::clone(m));
        }
        let path = self.resolve_path(name).ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
        let module = std::sync::Arc::new(Module::new(name.to_string(), path, self.throttle));
        modules.insert(name.to_string(), std::sync::Arc::clone(&module));
        Ok(module)
    }

    /// `pmnc.module_name.method_name(args)`. Ensures the module is
    /// up to date (subject to throttling) then invokes `method_name` with
    /// the call's JSON-encoded arguments.
    pub fn call(&self, module_name: &str, method_name: &str, args_json: &str, ctx: &RequestContext) -> Result<String, ModuleError> {
        let module = self.module_for(module_name)?;
        module.reload_if_needed(ctx)?;
        let method = module.resolve(method_name, ctx)?;
        let source_module = method.wants_source_module.then_some(ctx.interface());
        method.invoke(args_json, source_module, "[]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_module_is_not_found() {
        let loader = ModuleLoader::new(vec![PathBuf::from("/nonexistent")], Duration::from_secs(1));
        let ctx = RequestContext::fake(Duration::from_secs(1));
        let err = loader.call("missing", "foo", "[]", &ctx).unwrap_err();
        assert!(matches!(err, ModuleError::NotFound(_)));
    }

    #[test]
    fn private_attribute_is_rejected_before_lock_lookup() {
        let module = Module::new("m".into(), PathBuf::from("/nonexistent/m.so"), Duration::from_secs(1));
        let ctx = RequestContext::fake(Duration::from_secs(1));
        let err = module.resolve("_hidden", &ctx).unwrap_err();
        assert!(matches!(err, ModuleError::Private { .. }));
    }

    #[test]
    fn missing_sentinel_is_detected_before_library_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.so");
        std::fs::write(&path, b"not a real library, no sentinel").unwrap();
        let module = Module::new("broken".into(), path, Duration::ZERO);
        let err = module.do_reload().unwrap_err();
        assert!(matches!(err, ModuleError::MissingSentinel(_)));
    }

    #[test]
    fn non_reloadable_module_never_requests_another_mtime_check_once_loaded() {
        let module = Module::new("m".into(), PathBuf::from("/nonexistent/m.so"), Duration::ZERO);
        // before any successful load the loader must still be willing to try
        assert!(module.needs_reload_check());
        module.reloadable.store(false, std::sync::atomic::Ordering::SeqCst);
        *module.loaded.write(Duration::from_secs(1)).unwrap() = Some(LoadedModule {
            _library: unsafe { Library::new(std::env::current_exe().unwrap()).unwrap() },
            exports: vec!["answer".to_string()],
            methods: HashMap::new(),
            wildcard: false,
            reloadable: false,
            version: 1,
        });
        assert!(!module.needs_reload_check());
    }
}
