//! Rewriting import tables so calls land in a replacement function.
//!
//! Given a function exported by one loaded module and imported by others, the patch
//! engine rewrites every thunk slot currently holding that function's address so it holds
//! a caller-supplied replacement instead - without touching the exporting module, and
//! with a recursive mode that follows the whole module dependency graph from a starting
//! module. The original stays reachable through whatever pointer the caller resolved
//! before patching; lookups against the export table are unaffected.
//!
//! # Traversal
//!
//! The dependency graph can be cyclic and diamond-shaped (two modules importing the same
//! third), so the engine carries a [`VisitedModules`] set and processes every reachable
//! module exactly once. Work is bounded by the number of reachable modules, and the
//! returned count is the number of distinct slots rewritten, never inflated by multiple
//! paths to the same module.
//!
//! Malformed modules and imports of modules that are not loaded contribute zero patches
//! and do not disturb the rest of the traversal. Only two things abort the whole
//! operation: invalid arguments, and a failure to make a thunk slot writable - the
//! latter because an import table that cannot be unprotected indicates something
//! structurally wrong, not a slot worth skipping.
//!
//! # Examples
//!
//! ```rust
//! use mpqscope::{patch_import_entry, process::simulated::{ModuleImageBuilder, SimulatedProcess}};
//!
//! let old = 0x6000_1000;
//! let new = 0x0040_9000;
//!
//! let mut process = SimulatedProcess::new();
//! process.map_module("storm.dll", ModuleImageBuilder::new().build());
//! let game = process.map_module(
//!     "game.exe",
//!     ModuleImageBuilder::new().import("storm.dll", &[old, 0x6000_2000]).build(),
//! );
//!
//! let patched = patch_import_entry(&process, game, "storm.dll", old, new, true)?;
//! assert_eq!(patched, 1);
//! # Ok::<(), mpqscope::Error>(())
//! ```

use std::collections::HashSet;

use log::debug;

use crate::{
    image::{headers::locate_directory, imports, IMPORT_DIRECTORY},
    process::{ModuleHandle, PageProtection, ProcessView, SLOT_SIZE},
    Error, Result,
};

/// The set of modules a patch traversal has already processed.
///
/// Normally allocated fresh per call by [`patch_import_entry`]; callers patching
/// several functions in sequence can construct one themselves and pass it to
/// [`patch_import_entry_with`] to share traversal state. A module present in the
/// set is skipped entirely, so only reuse a set across calls that are meant to
/// see the same modules as already handled.
#[derive(Debug, Default)]
pub struct VisitedModules {
    seen: HashSet<ModuleHandle>,
}

impl VisitedModules {
    /// Create an empty set.
    pub fn new() -> VisitedModules {
        VisitedModules::default()
    }

    /// Number of modules recorded so far.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no module has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Whether `module` has already been processed.
    pub fn contains(&self, module: ModuleHandle) -> bool {
        self.seen.contains(&module)
    }

    /// Record `module`; returns `false` if it was already present.
    fn insert(&mut self, module: ModuleHandle) -> bool {
        self.seen.insert(module)
    }
}

/// Redirect an imported function by rewriting import tables, starting at `host`.
///
/// Every thunk slot whose current value equals `old_fn` exactly is rewritten to
/// `new_fn`. Matching is pointer identity on the address, never name-based: two
/// differently named imports aliasing the same address are both patched. With
/// `recurse` set, the traversal follows `host`'s imports into every reachable
/// loaded module; without it, only `host`'s own import table is scanned.
///
/// Returns the number of slots rewritten, which is legitimately zero when no
/// loaded module imports `old_fn`.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] - `host` is null, the name is empty, or either
///   function address is null
/// - [`Error::ModuleNotLoaded`] - `exporting_module` does not resolve to a
///   loaded module
/// - [`Error::ProtectionDenied`] / [`Error::WriteProtected`] /
///   [`Error::UnmappedMemory`] - the traversal or a rewrite faulted; the
///   operation is aborted as a whole and the count is not available
pub fn patch_import_entry<V: ProcessView>(
    view: &V,
    host: ModuleHandle,
    exporting_module: &str,
    old_fn: usize,
    new_fn: usize,
    recurse: bool,
) -> Result<usize> {
    let mut visited = VisitedModules::new();
    patch_import_entry_with(
        view,
        host,
        exporting_module,
        old_fn,
        new_fn,
        recurse,
        &mut visited,
    )
}

/// [`patch_import_entry`] with caller-supplied traversal state.
///
/// See [`VisitedModules`] for when sharing the set across calls makes sense.
///
/// # Errors
/// Same conditions as [`patch_import_entry`].
pub fn patch_import_entry_with<V: ProcessView>(
    view: &V,
    host: ModuleHandle,
    exporting_module: &str,
    old_fn: usize,
    new_fn: usize,
    recurse: bool,
    visited: &mut VisitedModules,
) -> Result<usize> {
    if host.is_null() {
        return Err(Error::InvalidArgument("host module handle is null"));
    }
    if exporting_module.is_empty() {
        return Err(Error::InvalidArgument("exporting module name is empty"));
    }
    if old_fn == 0 || new_fn == 0 {
        return Err(Error::InvalidArgument("function address is null"));
    }

    let exporter = view
        .module_by_name(exporting_module)
        .ok_or_else(|| Error::ModuleNotLoaded(exporting_module.to_string()))?;

    patch_module(view, host, exporter, old_fn, new_fn, recurse, visited)
}

/// Process one module and, in recursive mode, everything reachable from it.
fn patch_module<V: ProcessView>(
    view: &V,
    module: ModuleHandle,
    exporter: ModuleHandle,
    old_fn: usize,
    new_fn: usize,
    recurse: bool,
    visited: &mut VisitedModules,
) -> Result<usize> {
    // Marked before descending, so a cyclic import graph cannot recurse forever.
    if !visited.insert(module) {
        return Ok(0);
    }

    let Some(directory) = locate_directory(view, module, IMPORT_DIRECTORY)? else {
        debug!(
            "module {:#x}: no usable import directory, contributing 0 patches",
            module.base()
        );
        return Ok(0);
    };

    let mut patched = 0;

    for entry in imports::import_descriptors(view, module, &directory) {
        let entry = entry?;

        if let Some(child) = entry.resolved {
            if child != exporter {
                // Imports from some other module: its thunks cannot point at the
                // exporter's function, so only the recursive descent cares.
                if recurse {
                    patched +=
                        patch_module(view, child, exporter, old_fn, new_fn, recurse, visited)?;
                }
                continue;
            }
        }

        for slot in imports::thunk_slots(view, entry.thunk_base) {
            let slot = slot?;
            if slot.value != old_fn {
                continue;
            }

            // Keep the writable window to the single slot being rewritten.
            let previous = view.protect(slot.address, SLOT_SIZE, PageProtection::READ_WRITE)?;
            view.write_ptr(slot.address, new_fn)?;
            view.protect(slot.address, SLOT_SIZE, previous)?;

            patched += 1;
        }
    }

    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::simulated::{ModuleImageBuilder, SimulatedProcess};

    const OLD: usize = 0x6000_1000;
    const NEW: usize = 0x0040_9000;

    #[test]
    fn rejects_invalid_arguments() {
        let mut process = SimulatedProcess::new();
        let host = process.map_module("game.exe", ModuleImageBuilder::new().build());

        assert!(matches!(
            patch_import_entry(&process, ModuleHandle::new(0), "storm.dll", OLD, NEW, true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            patch_import_entry(&process, host, "", OLD, NEW, true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            patch_import_entry(&process, host, "storm.dll", 0, NEW, true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            patch_import_entry(&process, host, "storm.dll", OLD, 0, true),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_unloaded_exporter() {
        let mut process = SimulatedProcess::new();
        let host = process.map_module("game.exe", ModuleImageBuilder::new().build());

        assert!(matches!(
            patch_import_entry(&process, host, "storm.dll", OLD, NEW, true),
            Err(Error::ModuleNotLoaded(_))
        ));
    }

    #[test]
    fn shared_visited_set_skips_handled_modules() {
        let mut process = SimulatedProcess::new();
        process.map_module("storm.dll", ModuleImageBuilder::new().build());
        let host = process.map_module(
            "game.exe",
            ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
        );

        let mut visited = VisitedModules::new();
        let first =
            patch_import_entry_with(&process, host, "storm.dll", OLD, NEW, true, &mut visited)
                .unwrap();
        assert_eq!(first, 1);
        assert!(visited.contains(host));

        // The host is already recorded, so a second pass finds nothing to do.
        let second =
            patch_import_entry_with(&process, host, "storm.dll", NEW, OLD, true, &mut visited)
                .unwrap();
        assert_eq!(second, 0);
    }
}
