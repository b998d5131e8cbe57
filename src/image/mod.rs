//! In-memory executable-image parsing.
//!
//! This module decodes the structured metadata of modules as the loader mapped them:
//! header chains, data directories, import descriptors, and thunk arrays. Everything is
//! read through a [`ProcessView`](crate::process::ProcessView), decoded with the
//! bounds-checked [`Parser`], and validated before any derived offset is followed - the
//! bytes come from arbitrary binaries and are never trusted.
//!
//! # Key Components
//!
//! - [`headers::locate_directory`] - validate a module's headers and locate a data
//!   directory (fails closed on any malformed structure)
//! - [`imports::import_descriptors`] / [`imports::thunk_slots`] - lazy, sentinel-
//!   terminated walks over the import table's two levels
//! - [`parser::Parser`] - the cursor all of the above decode through
//!
//! The patch engine in [`crate::patch`] is the primary consumer; the pieces are public
//! because inspecting import tables is useful on its own.

pub mod headers;
pub mod imports;
pub mod parser;

pub use headers::{locate_directory, DataDirectory, IMPORT_DIRECTORY};
pub use imports::{import_descriptors, thunk_slots, ImportEntry, ThunkSlot};
pub use parser::Parser;

/// Machine field written into crafted images; matches the native pointer width.
#[cfg(target_pointer_width = "64")]
pub(crate) const MACHINE_NATIVE: u16 = 0x8664;
/// Machine field written into crafted images; matches the native pointer width.
#[cfg(target_pointer_width = "32")]
pub(crate) const MACHINE_NATIVE: u16 = 0x014C;

/// The fixed offsets and signatures an image crafter needs in one place.
pub(crate) struct RawLayout {
    pub(crate) dos_signature: u16,
    pub(crate) nt_signature: u32,
    pub(crate) optional_magic: u16,
    pub(crate) machine: u16,
    pub(crate) dos_header_len: usize,
    pub(crate) e_lfanew_offset: usize,
    pub(crate) optional_fixed_len: usize,
    pub(crate) nt_prefix_len: usize,
    pub(crate) data_directory_len: usize,
    pub(crate) import_directory_index: usize,
    pub(crate) import_descriptor_len: usize,
}

/// Layout facts for crafting loader-shaped images of the native width.
pub(crate) fn descriptor_layout() -> RawLayout {
    RawLayout {
        dos_signature: headers::DOS_SIGNATURE,
        nt_signature: headers::NT_SIGNATURE,
        optional_magic: headers::OPTIONAL_MAGIC,
        machine: MACHINE_NATIVE,
        dos_header_len: headers::DOS_HEADER_LEN,
        e_lfanew_offset: headers::E_LFANEW_OFFSET,
        optional_fixed_len: headers::OPTIONAL_FIXED_LEN,
        nt_prefix_len: headers::NT_PREFIX_LEN,
        data_directory_len: headers::DATA_DIRECTORY_LEN,
        import_directory_index: headers::IMPORT_DIRECTORY,
        import_descriptor_len: imports::IMPORT_DESCRIPTOR_LEN,
    }
}
