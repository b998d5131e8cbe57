//! The MPQDraft plugin boundary.
//!
//! MPQDraft loads a plugin DLL, asks it for an `IMPQDraftPlugin` vtable through the
//! exported [`GetMPQDraftPlugin`], and drives it through a fixed method sequence;
//! `InitializePlugin` fires inside the target process once everything is loaded. That
//! is the moment this plugin opens its log, resolves Storm's file functions by ordinal,
//! and redirects every import of them to the hook bodies below by patching the
//! executable's import graph.
//!
//! Initialization degrades instead of failing: a missing Storm, unresolvable ordinals,
//! or a patch error leave the game exactly as it was, with a note in the log file.
//! Nothing here may take the host process down - the vtable shims and hook bodies run
//! their Rust work under `catch_unwind`, since a panic must not cross the FFI boundary.
//!
//! The hook bodies receive their context (resolved originals, the shared log) from one
//! [`HookRuntime`] parked in a `OnceLock`: machine code calls the hooks directly, so
//! this is the one place a context argument cannot be threaded through.

use std::{
    ffi::{c_char, c_void, CStr},
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    ptr,
    sync::{Mutex, OnceLock},
};

use log::{debug, warn};
use windows::Win32::{
    Foundation::{HINSTANCE, HMODULE},
    System::LibraryLoader::DisableThreadLibraryCalls,
    System::SystemServices::DLL_PROCESS_ATTACH,
};

use crate::{
    config::{Config, CONFIG_FILE_NAME},
    patch::patch_import_entry,
    process::{system::SystemProcess, ModuleHandle, ProcessView},
    storm::{self, StormBool, StormFunctions, StormHandle},
    trace::FileAccessLog,
};

/// Identifies this plugin to MPQDraft; `MQSC`.
pub const PLUGIN_ID: u32 = 0x4D51_5343;

/// Name shown in MPQDraft's plugin list.
pub const PLUGIN_NAME: &str = "MpqScope v1.1";

/// Maximum plugin-module path length in the MPQDraft interface, final NUL included.
const MPQDRAFT_MAX_PATH: usize = 264;

type RawBool = i32;
const TRUE: RawBool = 1;
const FALSE: RawBool = 0;

/// One auxiliary module a plugin can ask MPQDraft to load; this plugin needs none.
#[repr(C, packed)]
pub struct MpqDraftPluginModule {
    /// Component the module belongs to.
    pub component_id: u32,
    /// Module identifier within the component.
    pub module_id: u32,
    /// Whether the module is executed after loading.
    pub execute: i32,
    /// NUL-terminated path of the module file.
    pub file_name: [u8; MPQDRAFT_MAX_PATH],
}

/// The `IMPQDraftPlugin` method table, in declaration order.
///
/// MPQDraft is a 32-bit host and declares every method `WINAPI`, so each entry is
/// `extern "system"` with the object pointer as its leading argument.
#[repr(C)]
struct PluginVtbl {
    identify: unsafe extern "system" fn(*mut PluginObject, *mut u32) -> RawBool,
    get_plugin_name: unsafe extern "system" fn(*mut PluginObject, *mut u8, u32) -> RawBool,
    can_patch_executable: unsafe extern "system" fn(*mut PluginObject, *const u8) -> RawBool,
    configure: unsafe extern "system" fn(*mut PluginObject, *mut c_void) -> RawBool,
    ready_for_patch: unsafe extern "system" fn(*mut PluginObject) -> RawBool,
    get_modules:
        unsafe extern "system" fn(*mut PluginObject, *mut MpqDraftPluginModule, *mut u32) -> RawBool,
    initialize_plugin: unsafe extern "system" fn(*mut PluginObject, *mut c_void) -> RawBool,
    terminate_plugin: unsafe extern "system" fn(*mut PluginObject) -> RawBool,
}

/// The plugin object handed to MPQDraft: a bare vtable pointer, `IMPQDraftPlugin`-shaped.
#[repr(C)]
pub struct PluginObject {
    vtbl: *const PluginVtbl,
}

// The vtable pointer is immutable and the methods keep their state in sync primitives.
unsafe impl Sync for PluginObject {}

static VTBL: PluginVtbl = PluginVtbl {
    identify,
    get_plugin_name,
    can_patch_executable,
    configure,
    ready_for_patch,
    get_modules,
    initialize_plugin,
    terminate_plugin,
};

static PLUGIN: PluginObject = PluginObject { vtbl: &VTBL };

/// Configuration loaded when the DLL attached, before MPQDraft calls anything.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Context shared with the hook bodies once initialization succeeds.
static RUNTIME: OnceLock<HookRuntime> = OnceLock::new();

struct HookRuntime {
    storm: StormFunctions,
    wants_archive: bool,
    log: Option<Mutex<FileAccessLog>>,
}

impl HookRuntime {
    fn note(&self, line: &str) {
        if let Some(log) = &self.log {
            if let Ok(mut log) = log.lock() {
                log.note(line);
            }
        }
    }
}

/// The export MPQDraft discovers the plugin through.
///
/// # Safety
/// `plugin` must be a valid pointer to writable storage for one pointer.
#[no_mangle]
pub unsafe extern "system" fn GetMPQDraftPlugin(plugin: *mut *const PluginObject) -> RawBool {
    if plugin.is_null() {
        return FALSE;
    }

    *plugin = &PLUGIN;
    TRUE
}

/// DLL entry point: loads the configuration while the process is still single-threaded.
///
/// # Safety
/// Called by the loader with its documented arguments.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    module: HINSTANCE,
    reason: u32,
    _reserved: *mut c_void,
) -> RawBool {
    if reason == DLL_PROCESS_ATTACH {
        let handle = HMODULE(module.0);
        let _ = DisableThreadLibraryCalls(handle);
        let _ = catch_unwind(move || bootstrap(handle));
    }

    TRUE
}

/// Locate and load the configuration file next to the plugin DLL.
fn bootstrap(module: HMODULE) {
    let process = SystemProcess::new();
    let config = process
        .module_path(ModuleHandle::new(module.0 as usize))
        .and_then(|path| path.parent().map(|dir| dir.join(CONFIG_FILE_NAME)))
        .map(|path| Config::load(&path))
        .unwrap_or_default();

    let _ = CONFIG.set(config);
}

unsafe extern "system" fn identify(_this: *mut PluginObject, id: *mut u32) -> RawBool {
    if id.is_null() {
        return FALSE;
    }

    *id = PLUGIN_ID;
    TRUE
}

unsafe extern "system" fn get_plugin_name(
    _this: *mut PluginObject,
    name: *mut u8,
    buffer_len: u32,
) -> RawBool {
    if name.is_null() {
        return FALSE;
    }

    let bytes = PLUGIN_NAME.as_bytes();
    if (buffer_len as usize) < bytes.len() + 1 {
        return FALSE;
    }

    ptr::copy_nonoverlapping(bytes.as_ptr(), name, bytes.len());
    *name.add(bytes.len()) = 0;
    TRUE
}

unsafe extern "system" fn can_patch_executable(
    _this: *mut PluginObject,
    _exe_file_name: *const u8,
) -> RawBool {
    // Works with any executable that pulls files through Storm.
    TRUE
}

unsafe extern "system" fn configure(_this: *mut PluginObject, _parent: *mut c_void) -> RawBool {
    // Configured through the file next to the DLL; there is no dialog.
    TRUE
}

unsafe extern "system" fn ready_for_patch(_this: *mut PluginObject) -> RawBool {
    TRUE
}

unsafe extern "system" fn get_modules(
    _this: *mut PluginObject,
    _modules: *mut MpqDraftPluginModule,
    count: *mut u32,
) -> RawBool {
    if count.is_null() {
        return FALSE;
    }

    *count = 0;
    TRUE
}

unsafe extern "system" fn initialize_plugin(
    _this: *mut PluginObject,
    _server: *mut c_void,
) -> RawBool {
    let _ = catch_unwind(initialize);
    // Degraded initialization must not abort the patch; the game runs un-hooked.
    TRUE
}

unsafe extern "system" fn terminate_plugin(_this: *mut PluginObject) -> RawBool {
    if let Some(runtime) = RUNTIME.get() {
        if let Some(log) = &runtime.log {
            if let Ok(mut log) = log.lock() {
                log.clear_seen();
                log.flush();
            }
        }
    }

    TRUE
}

fn initialize() {
    if RUNTIME.get().is_some() {
        return;
    }

    let process = SystemProcess::new();
    let config = CONFIG.get().cloned().unwrap_or_default();

    let game_dir = process
        .executable_path()
        .and_then(|path| path.parent().map(Path::to_path_buf));
    let log_path = config.resolve_log_path(game_dir.as_deref());
    let mut log = match FileAccessLog::create(&log_path, &config) {
        Ok(log) => Some(log),
        Err(err) => {
            warn!("log file {} not opened: {err}", log_path.display());
            None
        }
    };

    let storm = ["Storm", "storm.dll", "Storm.dll"]
        .iter()
        .find_map(|name| process.module_by_name(name).map(|module| (*name, module)));
    let Some((storm_name, storm_module)) = storm else {
        if let Some(log) = log.as_mut() {
            log.note("ERROR: Storm.dll not found");
        }
        install_runtime(StormFunctions::default(), &config, log);
        return;
    };

    let functions = storm::resolve(storm_module, config.target_game.storm_ordinals());
    if !functions.any_open_resolved() {
        if let Some(log) = log.as_mut() {
            log.note("ERROR: Neither SFileOpenFile nor SFileOpenFileEx found in Storm.dll");
        }
        install_runtime(functions, &config, log);
        return;
    }

    let Some(host) = process.executable_module() else {
        install_runtime(functions, &config, log);
        return;
    };

    // The context must be in place before the first slot is rewritten; a patched
    // call can land immediately.
    install_runtime(functions, &config, log);
    let Some(runtime) = RUNTIME.get() else {
        return;
    };

    if let Some(original) = runtime.storm.open_file {
        install_hook(
            &process,
            host,
            storm_name,
            "SFileOpenFile",
            original as usize,
            hooked_open_file as usize,
            runtime,
        );
    }

    if let Some(original) = runtime.storm.open_file_ex {
        install_hook(
            &process,
            host,
            storm_name,
            "SFileOpenFileEx",
            original as usize,
            hooked_open_file_ex as usize,
            runtime,
        );
    }
}

fn install_runtime(storm: StormFunctions, config: &Config, log: Option<FileAccessLog>) {
    let _ = RUNTIME.set(HookRuntime {
        storm,
        wants_archive: config.format.wants_archive(),
        log: log.map(Mutex::new),
    });
}

fn install_hook(
    process: &SystemProcess,
    host: ModuleHandle,
    storm_name: &str,
    function_name: &str,
    old_fn: usize,
    new_fn: usize,
    runtime: &HookRuntime,
) {
    match patch_import_entry(process, host, storm_name, old_fn, new_fn, true) {
        Ok(count) => debug!("{function_name}: {count} import slots redirected"),
        Err(err) => {
            warn!("{function_name} hook not installed: {err}");
            runtime.note(&format!("ERROR: {function_name} hook not installed"));
        }
    }
}

unsafe extern "system" fn hooked_open_file(
    file_name: *const c_char,
    file: *mut StormHandle,
) -> StormBool {
    let Some(runtime) = RUNTIME.get() else {
        return 0;
    };

    let result = match runtime.storm.open_file {
        Some(original) => original(file_name, file),
        None => 0,
    };

    if result != 0 && !file_name.is_null() && !file.is_null() && !(*file).is_null() {
        let name = CStr::from_ptr(file_name).to_string_lossy().into_owned();
        let handle = *file;
        let _ = catch_unwind(AssertUnwindSafe(|| record_open(runtime, &name, handle)));
    }

    result
}

unsafe extern "system" fn hooked_open_file_ex(
    mpq: StormHandle,
    file_name: *const c_char,
    search_scope: u32,
    file: *mut StormHandle,
) -> StormBool {
    let Some(runtime) = RUNTIME.get() else {
        return 0;
    };

    let result = match runtime.storm.open_file_ex {
        Some(original) => original(mpq, file_name, search_scope, file),
        None => 0,
    };

    if result != 0 && !file_name.is_null() && !file.is_null() && !(*file).is_null() {
        let name = CStr::from_ptr(file_name).to_string_lossy().into_owned();
        let handle = *file;
        let _ = catch_unwind(AssertUnwindSafe(|| record_open(runtime, &name, handle)));
    }

    result
}

fn record_open(runtime: &HookRuntime, file_name: &str, file: StormHandle) {
    let archive = if runtime.wants_archive {
        resolve_archive(&runtime.storm, file)
    } else {
        None
    };

    if let Some(log) = &runtime.log {
        if let Ok(mut log) = log.lock() {
            log.record(file_name, archive.as_deref());
        }
    }
}

/// Ask Storm which archive an open file came from.
fn resolve_archive(storm: &StormFunctions, file: StormHandle) -> Option<String> {
    const MAX_PATH: usize = 260;

    let get_file_archive = storm.get_file_archive?;
    let get_archive_name = storm.get_archive_name?;

    // SAFETY: both pointers were resolved from the loaded Storm module, and the
    // buffer outlives the call that fills it.
    unsafe {
        let mut archive: StormHandle = ptr::null_mut();
        if get_file_archive(file, &mut archive) == 0 || archive.is_null() {
            return None;
        }

        let mut buf = [0 as c_char; MAX_PATH];
        if get_archive_name(archive, buf.as_mut_ptr(), MAX_PATH as u32) == 0 || buf[0] == 0 {
            return None;
        }

        Some(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
    }
}
