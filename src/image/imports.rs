//! Walking a module's import descriptors and thunk arrays.
//!
//! The import directory is a sentinel-terminated sequence of descriptors, one per
//! imported module: the name of that module (as a relative string offset) and the
//! relative offset of its thunk array - the pointer-sized slots the importing module's
//! code indirects through. Neither sequence carries a count; both end at a zero entry.
//!
//! [`import_descriptors`] and [`thunk_slots`] expose the two levels as lazy iterators.
//! Items are `Result`-wrapped: hitting the sentinel is normal termination, while a read
//! that faults mid-walk surfaces as an error and ends the iteration. A descriptor whose
//! named module is not currently loaded is yielded with [`ImportEntry::resolved`] of
//! `None` - not loaded means nothing to patch there, never a failure.

use crate::{
    image::{headers::DataDirectory, parser::Parser},
    process::{ModuleHandle, ProcessView, SLOT_SIZE},
    Error, Result,
};

/// Byte length of one import descriptor.
pub(crate) const IMPORT_DESCRIPTOR_LEN: usize = 20;

/// Longest import-name string followed before giving up on finding its terminator.
///
/// Matches the loader's own path-length ceiling; a name that long never resolves
/// to a loaded module anyway.
const MAX_IMPORT_NAME: usize = 260;

/// One import descriptor, resolved against the currently loaded modules.
#[derive(Debug, Clone)]
pub struct ImportEntry {
    /// Name of the imported module, as recorded in the image.
    pub module_name: String,
    /// The loaded module that name currently resolves to, if any.
    pub resolved: Option<ModuleHandle>,
    /// Absolute address of this descriptor's thunk array.
    pub thunk_base: usize,
}

/// Lazy iterator over a module's import descriptors.
///
/// Produced by [`import_descriptors`]; restartable by calling that function again
/// with the same directory.
pub struct ImportDescriptors<'a, V> {
    view: &'a V,
    module: ModuleHandle,
    next: usize,
    done: bool,
}

/// Iterate the import descriptors found at a located import directory.
pub fn import_descriptors<'a, V: ProcessView>(
    view: &'a V,
    module: ModuleHandle,
    directory: &DataDirectory,
) -> ImportDescriptors<'a, V> {
    ImportDescriptors {
        view,
        module,
        next: directory.address,
        done: false,
    }
}

impl<V: ProcessView> Iterator for ImportDescriptors<'_, V> {
    type Item = Result<ImportEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut raw = [0_u8; IMPORT_DESCRIPTOR_LEN];
        if let Err(err) = self.view.read(self.next, &mut raw) {
            self.done = true;
            return Some(Err(err));
        }

        let entry = self.decode(&raw);
        match &entry {
            Ok(None) | Err(_) => self.done = true,
            Ok(Some(_)) => self.next += IMPORT_DESCRIPTOR_LEN,
        }

        entry.transpose()
    }
}

impl<V: ProcessView> ImportDescriptors<'_, V> {
    /// Decode one raw descriptor; `Ok(None)` is the sentinel.
    fn decode(&self, raw: &[u8]) -> Result<Option<ImportEntry>> {
        let mut parser = Parser::new(raw);
        parser.seek(12)?;
        let name_rva = parser.read_le::<u32>()?;
        let first_thunk_rva = parser.read_le::<u32>()?;

        if name_rva == 0 {
            return Ok(None);
        }

        let name_addr = absolute(self.module.base(), name_rva)?;
        let module_name = read_import_name(self.view, name_addr)?;
        let resolved = self.view.module_by_name(&module_name);
        let thunk_base = absolute(self.module.base(), first_thunk_rva)?;

        Ok(Some(ImportEntry {
            module_name,
            resolved,
            thunk_base,
        }))
    }
}

/// One thunk slot: a function-pointer-sized cell and its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThunkSlot {
    /// Absolute address of the cell.
    pub address: usize,
    /// The function address currently stored in it.
    pub value: usize,
}

/// Lazy iterator over the thunk slots of one import descriptor.
pub struct ThunkSlots<'a, V> {
    view: &'a V,
    next: usize,
    done: bool,
}

/// Iterate the thunk array starting at `thunk_base`, up to the zero sentinel.
pub fn thunk_slots<V: ProcessView>(view: &V, thunk_base: usize) -> ThunkSlots<'_, V> {
    ThunkSlots {
        view,
        next: thunk_base,
        done: false,
    }
}

impl<V: ProcessView> Iterator for ThunkSlots<'_, V> {
    type Item = Result<ThunkSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut raw = [0_u8; SLOT_SIZE];
        if let Err(err) = self.view.read(self.next, &mut raw) {
            self.done = true;
            return Some(Err(err));
        }

        let value = usize::from_le_bytes(raw);
        if value == 0 {
            self.done = true;
            return None;
        }

        let address = self.next;
        match self.next.checked_add(SLOT_SIZE) {
            Some(next) => self.next = next,
            None => self.done = true,
        }

        Some(Ok(ThunkSlot { address, value }))
    }
}

fn absolute(base: usize, rva: u32) -> Result<usize> {
    base.checked_add(rva as usize)
        .ok_or(Error::UnmappedMemory { addr: base })
}

/// Read a NUL-terminated import-name string, one bounds-checked byte at a time.
fn read_import_name<V: ProcessView>(view: &V, addr: usize) -> Result<String> {
    let mut bytes = Vec::new();

    for offset in 0..MAX_IMPORT_NAME {
        let at = addr
            .checked_add(offset)
            .ok_or(Error::UnmappedMemory { addr })?;

        let mut byte = [0_u8; 1];
        view.read(at, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::headers::{locate_directory, IMPORT_DIRECTORY},
        process::simulated::{ModuleImageBuilder, SimulatedProcess},
    };

    #[test]
    fn walks_descriptors_in_image_order() {
        let mut process = SimulatedProcess::new();
        let storm = process.map_module("storm.dll", ModuleImageBuilder::new().build());
        let host = process.map_module(
            "game.exe",
            ModuleImageBuilder::new()
                .import("storm.dll", &[0x10, 0x20])
                .import("battle.snp", &[0x30])
                .build(),
        );

        let directory = locate_directory(&process, host, IMPORT_DIRECTORY)
            .unwrap()
            .unwrap();

        let entries: Vec<ImportEntry> = import_descriptors(&process, host, &directory)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].module_name, "storm.dll");
        assert_eq!(entries[0].resolved, Some(storm));
        assert_eq!(entries[1].module_name, "battle.snp");
        // battle.snp is not loaded: no patchable presence, not an error.
        assert_eq!(entries[1].resolved, None);
    }

    #[test]
    fn thunk_walk_stops_at_sentinel() {
        let mut process = SimulatedProcess::new();
        let host = process.map_module(
            "game.exe",
            ModuleImageBuilder::new()
                .import("storm.dll", &[0x10, 0x20, 0x30])
                .build(),
        );

        let directory = locate_directory(&process, host, IMPORT_DIRECTORY)
            .unwrap()
            .unwrap();
        let entry = import_descriptors(&process, host, &directory)
            .next()
            .unwrap()
            .unwrap();

        let slots: Vec<ThunkSlot> = thunk_slots(&process, entry.thunk_base)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].value, 0x10);
        assert_eq!(slots[2].value, 0x30);
        assert_eq!(slots[1].address, entry.thunk_base + SLOT_SIZE);
    }

    #[test]
    fn restartable_from_the_same_directory() {
        let mut process = SimulatedProcess::new();
        let host = process.map_module(
            "game.exe",
            ModuleImageBuilder::new().import("storm.dll", &[0x10]).build(),
        );

        let directory = locate_directory(&process, host, IMPORT_DIRECTORY)
            .unwrap()
            .unwrap();

        let first: Vec<_> = import_descriptors(&process, host, &directory).collect();
        let second: Vec<_> = import_descriptors(&process, host, &directory).collect();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn read_fault_ends_iteration_with_error() {
        let mut process = SimulatedProcess::new();
        let host = process.map_module("game.exe", ModuleImageBuilder::new().build());

        // Point the walk at memory nothing owns.
        let directory = DataDirectory {
            address: host.base() + 0x40_0000,
            size: 64,
        };

        let mut walk = import_descriptors(&process, host, &directory);
        assert!(matches!(
            walk.next(),
            Some(Err(Error::UnmappedMemory { .. }))
        ));
        assert!(walk.next().is_none());
    }
}
