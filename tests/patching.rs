//! End-to-end patch-engine behavior over simulated module graphs.
//!
//! Every scenario builds a small process out of crafted images, runs the public
//! entry points against it, and checks the rewritten slots (and only those)
//! through the image layer afterwards.

use mpqscope::{prelude::*, Error};

const OLD: usize = 0x6F00_1000;
const NEW: usize = 0x0040_9000;
const OTHER: usize = 0x6F00_2000;

/// Addresses of the thunk slots one module holds for one imported name.
fn slot_addresses(
    process: &SimulatedProcess,
    module: ModuleHandle,
    imported: &str,
) -> Vec<usize> {
    let directory = locate_directory(process, module, IMPORT_DIRECTORY)
        .unwrap()
        .expect("module should have an import directory");

    import_descriptors(process, module, &directory)
        .map(|entry| entry.unwrap())
        .find(|entry| entry.module_name == imported)
        .map(|entry| {
            thunk_slots(process, entry.thunk_base)
                .map(|slot| slot.unwrap().address)
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn two_call_sites_both_rewritten() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("storm.dll", &[OLD, OTHER, OLD])
            .build(),
    );

    let slots = slot_addresses(&process, host, "storm.dll");
    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, false).unwrap();

    assert_eq!(patched, 2);
    assert_eq!(process.read_ptr(slots[0]).unwrap(), NEW);
    assert_eq!(process.read_ptr(slots[1]).unwrap(), OTHER);
    assert_eq!(process.read_ptr(slots[2]).unwrap(), NEW);
}

#[test]
fn zero_matches_is_success_not_failure() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("storm.dll", &[OTHER, 0x6F00_3000])
            .build(),
    );

    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, true).unwrap();
    assert_eq!(patched, 0);

    let slots = slot_addresses(&process, host, "storm.dll");
    assert_eq!(process.read_ptr(slots[0]).unwrap(), OTHER);
}

#[test]
fn diamond_dependency_is_visited_once() {
    // a.exe -> b.dll, c.dll; b.dll and c.dll -> d.dll; b.dll and d.dll import
    // the target function. The shared corner of the diamond must be handled
    // exactly once and the count must stay at the two distinct slots.
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let d = process.map_module(
        "d.dll",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );
    let b = process.map_module(
        "b.dll",
        ModuleImageBuilder::new()
            .import("d.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );
    let c = process.map_module(
        "c.dll",
        ModuleImageBuilder::new().import("d.dll", &[OTHER]).build(),
    );
    let a = process.map_module(
        "a.exe",
        ModuleImageBuilder::new()
            .import("b.dll", &[OTHER])
            .import("c.dll", &[OTHER])
            .build(),
    );

    let mut visited = VisitedModules::new();
    let patched =
        patch_import_entry_with(&process, a, "storm.dll", OLD, NEW, true, &mut visited).unwrap();

    assert_eq!(patched, 2);
    assert_eq!(process.read_ptr(slot_addresses(&process, b, "storm.dll")[0]).unwrap(), NEW);
    assert_eq!(process.read_ptr(slot_addresses(&process, d, "storm.dll")[0]).unwrap(), NEW);

    // a, b, c and d were processed; the exporter itself is never descended into.
    assert_eq!(visited.len(), 4);
    for module in [a, b, c, d] {
        assert!(visited.contains(module));
    }
}

#[test]
fn cyclic_imports_terminate() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());

    // x.dll and y.dll import each other; mapping order cannot satisfy both
    // references, so map both and rely on resolution at patch time.
    let x = process.map_module(
        "x.dll",
        ModuleImageBuilder::new()
            .import("y.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );
    process.map_module(
        "y.dll",
        ModuleImageBuilder::new()
            .import("x.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );

    let patched = patch_import_entry(&process, x, "storm.dll", OLD, NEW, true).unwrap();
    assert_eq!(patched, 2);
}

#[test]
fn non_recursive_scope_stops_at_the_host() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let dependent = process.map_module(
        "dependent.dll",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("dependent.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );

    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, false).unwrap();

    assert_eq!(patched, 1);
    assert_eq!(process.read_ptr(slot_addresses(&process, host, "storm.dll")[0]).unwrap(), NEW);
    // The dependent also imports the target, but nothing may touch it.
    assert_eq!(
        process.read_ptr(slot_addresses(&process, dependent, "storm.dll")[0]).unwrap(),
        OLD
    );
}

#[test]
fn corrupt_dependent_contributes_zero() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());

    let mut broken_image = ModuleImageBuilder::new().import("storm.dll", &[OLD]).build();
    broken_image[0] = 0;
    broken_image[1] = 0;
    process.map_module("broken.dll", broken_image);

    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("broken.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );

    // The zeroed header makes broken.dll unparseable; the rest of the traversal
    // still succeeds with the host's own match.
    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, true).unwrap();
    assert_eq!(patched, 1);
}

#[test]
fn page_protection_is_restored() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );

    let slot = slot_addresses(&process, host, "storm.dll")[0];
    let unusual = PageProtection::READ | PageProtection::EXECUTE;
    process.protect(slot, SLOT_SIZE, unusual).unwrap();

    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, true).unwrap();

    assert_eq!(patched, 1);
    assert_eq!(process.read_ptr(slot).unwrap(), NEW);
    // Whatever protection the page had before the call is back in place.
    assert_eq!(process.protection_at(slot), Some(unusual));
}

#[test]
fn protection_failure_aborts_the_whole_operation() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let sealed = process.map_module(
        "sealed.dll",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("sealed.dll", &[OTHER])
            .import("storm.dll", &[OLD])
            .build(),
    );
    process.seal_module(sealed);

    let result = patch_import_entry(&process, host, "storm.dll", OLD, NEW, true);
    assert!(matches!(result, Err(Error::ProtectionDenied { .. })));

    // The failure short-circuited the remaining siblings: the host's own slot,
    // ordered after the sealed dependent, was never rewritten.
    assert_eq!(process.read_ptr(slot_addresses(&process, host, "storm.dll")[0]).unwrap(), OLD);
}

#[test]
fn matching_is_by_address_not_by_name() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());

    // ghost.dll is not loaded, so its thunks are scanned rather than recursed
    // into; its slot holding the target address is patched all the same.
    let host = process.map_module(
        "game.exe",
        ModuleImageBuilder::new()
            .import("storm.dll", &[OLD, OTHER])
            .import("ghost.dll", &[OLD])
            .build(),
    );

    let patched = patch_import_entry(&process, host, "storm.dll", OLD, NEW, true).unwrap();

    assert_eq!(patched, 2);
    assert_eq!(process.read_ptr(slot_addresses(&process, host, "ghost.dll")[0]).unwrap(), NEW);
    // A slot holding any other value stays byte-for-byte untouched.
    assert_eq!(process.read_ptr(slot_addresses(&process, host, "storm.dll")[1]).unwrap(), OTHER);
}

#[test]
fn visited_set_amortizes_across_hosts() {
    let mut process = SimulatedProcess::new();
    process.map_module("storm.dll", ModuleImageBuilder::new().build());
    let first = process.map_module(
        "first.exe",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );
    let second = process.map_module(
        "second.exe",
        ModuleImageBuilder::new().import("storm.dll", &[OLD]).build(),
    );

    let mut visited = VisitedModules::new();
    let a = patch_import_entry_with(&process, first, "storm.dll", OLD, NEW, true, &mut visited)
        .unwrap();
    let b = patch_import_entry_with(&process, second, "storm.dll", OLD, NEW, true, &mut visited)
        .unwrap();
    assert_eq!(a + b, 2);

    // Re-running over an already-visited host is a no-op, not a re-walk.
    let again = patch_import_entry_with(&process, first, "storm.dll", OLD, NEW, true, &mut visited)
        .unwrap();
    assert_eq!(again, 0);
}
