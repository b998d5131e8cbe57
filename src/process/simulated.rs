//! A deterministic, in-memory stand-in for a live process.
//!
//! [`SimulatedProcess`] maps crafted module images at synthetic base addresses and
//! implements [`ProcessView`](crate::process::ProcessView) over them, with page-granular
//! protection bookkeeping. Nothing here touches the real loader: thunk "addresses" are
//! arbitrary values, reads are bounds-checked against the mapped images, and a store into
//! a page that was never made writable is refused. That makes the whole patch engine
//! exercisable on any platform, including its protection-bracket behavior.
//!
//! [`ModuleImageBuilder`] produces loader-shaped images - headers the way the loader
//! would have mapped them, import descriptors, thunk arrays - from a list of
//! (module name, thunk values) pairs.
//!
//! # Examples
//!
//! ```rust
//! use mpqscope::process::{
//!     simulated::{ModuleImageBuilder, SimulatedProcess},
//!     ProcessView,
//! };
//!
//! let mut process = SimulatedProcess::new();
//! let game = process.map_module(
//!     "game.exe",
//!     ModuleImageBuilder::new()
//!         .import("storm.dll", &[0x1000_0000, 0x1000_0040])
//!         .build(),
//! );
//!
//! assert_eq!(process.module_by_name("game.exe"), Some(game));
//! ```
//!
//! Images default to read-only pages, the way mapped image sections arrive; a slot
//! rewrite only succeeds inside a protect/write/restore bracket.

pub use crate::process::ProcessView;

use std::cell::RefCell;

use crate::{
    image::descriptor_layout,
    process::{ModuleHandle, PageProtection, SLOT_SIZE},
    Error, Result,
};

/// Page granularity of the simulated address space.
pub const PAGE_SIZE: usize = 0x1000;

/// Base-address granularity; modules land on these boundaries with a guard gap between.
const BASE_GRANULARITY: usize = 0x10000;

/// Base address handed to the first mapped module.
const FIRST_BASE: usize = 0x0040_0000;

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

struct MappedModule {
    /// Lookup key, lowercased the way the loader matches names.
    key: String,
    base: usize,
    bytes: RefCell<Vec<u8>>,
    pages: RefCell<Vec<PageProtection>>,
    sealed: bool,
}

/// An in-memory address space of crafted modules.
///
/// Single-threaded by design, like the patch window it simulates; interior
/// mutability is plain [`RefCell`], not locks.
pub struct SimulatedProcess {
    modules: Vec<MappedModule>,
    next_base: usize,
}

impl Default for SimulatedProcess {
    fn default() -> SimulatedProcess {
        SimulatedProcess::new()
    }
}

impl SimulatedProcess {
    /// Create an empty simulated process.
    pub fn new() -> SimulatedProcess {
        SimulatedProcess {
            modules: Vec::new(),
            next_base: FIRST_BASE,
        }
    }

    /// Map an image under `name` and return its module handle.
    ///
    /// Bases are assigned deterministically with a guard gap between modules, so
    /// a walk that runs off the end of one image faults instead of sliding into
    /// the next. All pages start read-only.
    pub fn map_module(&mut self, name: &str, image: Vec<u8>) -> ModuleHandle {
        let base = self.next_base;
        let span = align_up(image.len().max(1), BASE_GRANULARITY);
        self.next_base = base + span + BASE_GRANULARITY;

        let page_count = image.len().div_ceil(PAGE_SIZE);
        self.modules.push(MappedModule {
            key: name.to_ascii_lowercase(),
            base,
            bytes: RefCell::new(image),
            pages: RefCell::new(vec![PageProtection::READ; page_count]),
            sealed: false,
        });

        ModuleHandle::new(base)
    }

    /// Refuse all future protection changes on `module`.
    ///
    /// Lets tests exercise the abort-on-protection-failure path of the engine.
    pub fn seal_module(&mut self, module: ModuleHandle) {
        if let Some(mapped) = self.modules.iter_mut().find(|m| m.base == module.base()) {
            mapped.sealed = true;
        }
    }

    /// The protection of the page containing `addr`, if it is mapped.
    pub fn protection_at(&self, addr: usize) -> Option<PageProtection> {
        let (module, offset) = self.module_containing(addr)?;
        module.pages.borrow().get(offset / PAGE_SIZE).copied()
    }

    /// Read one pointer-sized value, as a test convenience.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmappedMemory`] outside any mapped image.
    pub fn read_ptr(&self, addr: usize) -> Result<usize> {
        let mut buf = [0_u8; SLOT_SIZE];
        self.read(addr, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }

    fn module_containing(&self, addr: usize) -> Option<(&MappedModule, usize)> {
        self.modules.iter().find_map(|module| {
            let len = module.bytes.borrow().len();
            (addr >= module.base && addr < module.base + len)
                .then(|| (module, addr - module.base))
        })
    }
}

impl ProcessView for SimulatedProcess {
    fn module_by_name(&self, name: &str) -> Option<ModuleHandle> {
        let key = name.to_ascii_lowercase();
        self.modules
            .iter()
            .find(|module| module.key == key)
            .map(|module| ModuleHandle::new(module.base))
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let (module, offset) = self
            .module_containing(addr)
            .ok_or(Error::UnmappedMemory { addr })?;

        let bytes = module.bytes.borrow();
        let Some(end) = offset.checked_add(buf.len()) else {
            return Err(Error::UnmappedMemory { addr });
        };
        if end > bytes.len() {
            return Err(Error::UnmappedMemory {
                addr: module.base + bytes.len(),
            });
        }

        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn protect(
        &self,
        addr: usize,
        len: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let (module, offset) = self
            .module_containing(addr)
            .ok_or(Error::UnmappedMemory { addr })?;

        if module.sealed {
            return Err(Error::ProtectionDenied { addr });
        }

        let end = offset
            .checked_add(len.max(1))
            .ok_or(Error::UnmappedMemory { addr })?;
        if end > module.bytes.borrow().len() {
            return Err(Error::UnmappedMemory { addr });
        }

        let first = offset / PAGE_SIZE;
        let last = (end - 1) / PAGE_SIZE;

        let mut pages = module.pages.borrow_mut();
        let previous = pages[first];
        for page in &mut pages[first..=last] {
            *page = protection;
        }

        Ok(previous)
    }

    fn write_ptr(&self, addr: usize, value: usize) -> Result<()> {
        let (module, offset) = self
            .module_containing(addr)
            .ok_or(Error::UnmappedMemory { addr })?;

        let mut bytes = module.bytes.borrow_mut();
        let Some(end) = offset.checked_add(SLOT_SIZE) else {
            return Err(Error::UnmappedMemory { addr });
        };
        if end > bytes.len() {
            return Err(Error::UnmappedMemory { addr });
        }

        let pages = module.pages.borrow();
        let first = offset / PAGE_SIZE;
        let last = (end - 1) / PAGE_SIZE;
        if !pages[first..=last]
            .iter()
            .all(|page| page.contains(PageProtection::WRITE))
        {
            return Err(Error::WriteProtected { addr });
        }

        bytes[offset..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Builds loader-shaped module images for the simulated process.
///
/// The produced byte buffer looks the way the loader would have mapped it: legacy
/// and NT headers at the front, a full data-directory table, then import
/// descriptors, thunk arrays, and name strings. Thunk slots carry the values
/// given to [`ModuleImageBuilder::import`] verbatim - in a simulation, a
/// "function address" is whatever the test says it is.
#[derive(Default)]
pub struct ModuleImageBuilder {
    imports: Vec<(String, Vec<usize>)>,
}

impl ModuleImageBuilder {
    /// Start an image with no imports.
    pub fn new() -> ModuleImageBuilder {
        ModuleImageBuilder {
            imports: Vec::new(),
        }
    }

    /// Add one import descriptor: a named module and its thunk slot values.
    #[must_use]
    pub fn import(mut self, module: &str, thunk_values: &[usize]) -> ModuleImageBuilder {
        self.imports.push((module.to_string(), thunk_values.to_vec()));
        self
    }

    /// Produce the image bytes.
    pub fn build(self) -> Vec<u8> {
        let layout = descriptor_layout();

        let nt_offset = layout.dos_header_len;
        let dir_table_offset = nt_offset + layout.nt_prefix_len;
        let dir_count: u32 = 16;
        let headers_end = dir_table_offset + dir_count as usize * layout.data_directory_len;

        let import_offset = align_up(headers_end, 16);
        let descriptor_bytes = (self.imports.len() + 1) * layout.import_descriptor_len;

        let mut thunk_offsets = Vec::with_capacity(self.imports.len());
        let mut cursor = align_up(import_offset + descriptor_bytes, SLOT_SIZE);
        for (_, values) in &self.imports {
            thunk_offsets.push(cursor);
            cursor += (values.len() + 1) * SLOT_SIZE;
        }

        let mut name_offsets = Vec::with_capacity(self.imports.len());
        for (name, _) in &self.imports {
            name_offsets.push(cursor);
            cursor += name.len() + 1;
        }

        let mut image = vec![0_u8; cursor];

        let put_u16 = |image: &mut Vec<u8>, at: usize, value: u16| {
            image[at..at + 2].copy_from_slice(&value.to_le_bytes());
        };
        let put_u32 = |image: &mut Vec<u8>, at: usize, value: u32| {
            image[at..at + 4].copy_from_slice(&value.to_le_bytes());
        };

        // Legacy header.
        put_u16(&mut image, 0, layout.dos_signature);
        put_u32(&mut image, layout.e_lfanew_offset, nt_offset as u32);

        // NT signature and file header.
        put_u32(&mut image, nt_offset, layout.nt_signature);
        put_u16(&mut image, nt_offset + 4, layout.machine);
        put_u16(
            &mut image,
            nt_offset + 4 + 16,
            (layout.optional_fixed_len + dir_count as usize * layout.data_directory_len) as u16,
        );
        put_u16(&mut image, nt_offset + 4 + 18, 0x0002);

        // Optional header: magic up front, directory count at the tail of the fixed part.
        put_u16(&mut image, nt_offset + 4 + 20, layout.optional_magic);
        put_u32(
            &mut image,
            nt_offset + layout.nt_prefix_len - 4,
            dir_count,
        );

        if !self.imports.is_empty() {
            let entry = dir_table_offset + layout.import_directory_index * layout.data_directory_len;
            put_u32(&mut image, entry, import_offset as u32);
            put_u32(&mut image, entry + 4, descriptor_bytes as u32);
        }

        for (index, (_, values)) in self.imports.iter().enumerate() {
            let descriptor = import_offset + index * layout.import_descriptor_len;
            put_u32(&mut image, descriptor + 12, name_offsets[index] as u32);
            put_u32(&mut image, descriptor + 16, thunk_offsets[index] as u32);

            for (slot, value) in values.iter().enumerate() {
                let at = thunk_offsets[index] + slot * SLOT_SIZE;
                image[at..at + SLOT_SIZE].copy_from_slice(&value.to_le_bytes());
            }
        }

        for (index, (name, _)) in self.imports.iter().enumerate() {
            let at = name_offsets[index];
            image[at..at + name.len()].copy_from_slice(name.as_bytes());
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut process = SimulatedProcess::new();
        let storm = process.map_module("Storm.dll", ModuleImageBuilder::new().build());

        assert_eq!(process.module_by_name("storm.dll"), Some(storm));
        assert_eq!(process.module_by_name("STORM.DLL"), Some(storm));
        assert_eq!(process.module_by_name("battle.snp"), None);
    }

    #[test]
    fn distinct_bases_with_guard_gap() {
        let mut process = SimulatedProcess::new();
        let a = process.map_module("a.dll", vec![0; 0x100]);
        let b = process.map_module("b.dll", vec![0; 0x100]);

        assert!(b.base() > a.base() + 0x100);
        assert_eq!(a.base() % BASE_GRANULARITY, 0);
        assert_eq!(b.base() % BASE_GRANULARITY, 0);
    }

    #[test]
    fn read_faults_off_the_end() {
        let mut process = SimulatedProcess::new();
        let module = process.map_module("a.dll", vec![0xAA; 16]);

        let mut buf = [0_u8; 8];
        process.read(module.base() + 8, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 8]);

        assert!(matches!(
            process.read(module.base() + 12, &mut buf),
            Err(Error::UnmappedMemory { .. })
        ));
        assert!(matches!(
            process.read(0xDEAD_0000, &mut buf),
            Err(Error::UnmappedMemory { .. })
        ));
    }

    #[test]
    fn write_requires_the_protection_bracket() {
        let mut process = SimulatedProcess::new();
        let module = process.map_module("a.dll", vec![0; PAGE_SIZE]);
        let slot = module.base() + 0x20;

        assert!(matches!(
            process.write_ptr(slot, 0x1234),
            Err(Error::WriteProtected { .. })
        ));

        let previous = process
            .protect(slot, SLOT_SIZE, PageProtection::READ_WRITE)
            .unwrap();
        assert_eq!(previous, PageProtection::READ);

        process.write_ptr(slot, 0x1234).unwrap();
        assert_eq!(process.read_ptr(slot).unwrap(), 0x1234);

        process.protect(slot, SLOT_SIZE, previous).unwrap();
        assert_eq!(process.protection_at(slot), Some(PageProtection::READ));
        assert!(matches!(
            process.write_ptr(slot, 0x5678),
            Err(Error::WriteProtected { .. })
        ));
    }

    #[test]
    fn sealed_module_denies_protection_changes() {
        let mut process = SimulatedProcess::new();
        let module = process.map_module("a.dll", vec![0; 64]);
        process.seal_module(module);

        assert!(matches!(
            process.protect(module.base(), SLOT_SIZE, PageProtection::READ_WRITE),
            Err(Error::ProtectionDenied { .. })
        ));
    }

    #[test]
    fn built_image_carries_signatures() {
        let image = ModuleImageBuilder::new().import("storm.dll", &[1, 2]).build();

        assert_eq!(&image[0..2], &[b'M', b'Z']);
        let nt_offset = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        assert_eq!(&image[nt_offset..nt_offset + 2], &[b'P', b'E']);
    }
}
