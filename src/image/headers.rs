//! Executable-image header decoding and data-directory location.
//!
//! A loaded module starts with a fixed-layout header chain: the legacy DOS header at the
//! base address, an offset field pointing at the NT headers, and inside those a table of
//! data directories locating structured metadata (imports, exports, ...) relative to the
//! base. [`locate_directory`] walks that chain for one module and returns where a given
//! directory lives in memory.
//!
//! Every hop is validated before it is followed, and every validation failure is policy-
//! mapped to "directory not found": the headers originate from arbitrary binaries, and a
//! module that cannot be parsed must contribute nothing rather than take the process
//! down. Only a genuine memory-read fault (an address no module owns) escapes as an
//! error, mirroring the distinction between a failed signature check and an access
//! violation in the original loader-walking code.

use log::debug;

use crate::{
    image::parser::Parser,
    process::{ModuleHandle, ProcessView},
    Result,
};

/// Index of the import directory in the data-directory table.
pub const IMPORT_DIRECTORY: usize = 1;

/// Legacy (DOS) header signature, `MZ`.
pub(crate) const DOS_SIGNATURE: u16 = 0x5A4D;
/// Main (NT) header signature, `PE\0\0`.
pub(crate) const NT_SIGNATURE: u32 = 0x0000_4550;

/// Optional-header magic for images of the native pointer width.
#[cfg(target_pointer_width = "64")]
pub(crate) const OPTIONAL_MAGIC: u16 = 0x20B;
/// Optional-header magic for images of the native pointer width.
#[cfg(target_pointer_width = "32")]
pub(crate) const OPTIONAL_MAGIC: u16 = 0x10B;

/// Byte length of the legacy header.
pub(crate) const DOS_HEADER_LEN: usize = 64;
/// Offset of the NT-headers offset field within the legacy header.
pub(crate) const E_LFANEW_OFFSET: usize = 0x3C;
/// Byte length of the COFF file header following the NT signature.
pub(crate) const FILE_HEADER_LEN: usize = 20;

/// Fixed portion of the optional header, up to and including the directory count.
#[cfg(target_pointer_width = "64")]
pub(crate) const OPTIONAL_FIXED_LEN: usize = 112;
/// Fixed portion of the optional header, up to and including the directory count.
#[cfg(target_pointer_width = "32")]
pub(crate) const OPTIONAL_FIXED_LEN: usize = 96;

/// NT signature + file header + fixed optional header; the directory table follows.
pub(crate) const NT_PREFIX_LEN: usize = 4 + FILE_HEADER_LEN + OPTIONAL_FIXED_LEN;
/// Byte length of one data-directory entry.
pub(crate) const DATA_DIRECTORY_LEN: usize = 8;

/// The fields of the legacy header this engine cares about.
pub(crate) struct DosHeader {
    /// Relative offset of the NT headers.
    pub(crate) e_lfanew: u32,
}

impl DosHeader {
    /// Decode and validate a legacy header.
    ///
    /// # Errors
    /// Returns a malformed error if the signature is wrong or the NT-headers
    /// offset is zero.
    pub(crate) fn read(data: &[u8]) -> Result<DosHeader> {
        let mut parser = Parser::new(data);

        let e_magic = parser.read_le::<u16>()?;
        if e_magic != DOS_SIGNATURE {
            return Err(malformed_error!(
                "Invalid legacy header signature: {:#06x}",
                e_magic
            ));
        }

        parser.seek(E_LFANEW_OFFSET)?;
        let e_lfanew = parser.read_le::<u32>()?;
        if e_lfanew == 0 {
            return Err(malformed_error!("NT-headers offset is zero"));
        }

        Ok(DosHeader { e_lfanew })
    }
}

/// The fields of the NT headers this engine cares about.
pub(crate) struct NtHeaders {
    /// Declared number of data-directory entries.
    pub(crate) directory_count: u32,
}

impl NtHeaders {
    /// Decode and validate the NT signature and the optional header prefix.
    ///
    /// Only images of the native pointer width are accepted; an import table of a
    /// foreign width could not be patched with native-sized stores anyway.
    ///
    /// # Errors
    /// Returns a malformed error if either signature check fails.
    pub(crate) fn read(data: &[u8]) -> Result<NtHeaders> {
        let mut parser = Parser::new(data);

        let signature = parser.read_le::<u32>()?;
        if signature != NT_SIGNATURE {
            return Err(malformed_error!(
                "Invalid NT header signature: {:#010x}",
                signature
            ));
        }

        parser.skip(FILE_HEADER_LEN)?;
        let magic = parser.read_le::<u16>()?;
        if magic != OPTIONAL_MAGIC {
            return Err(malformed_error!(
                "Optional header magic {:#06x} does not match the native image width",
                magic
            ));
        }

        parser.seek(4 + FILE_HEADER_LEN + OPTIONAL_FIXED_LEN - 4)?;
        let directory_count = parser.read_le::<u32>()?;

        Ok(NtHeaders { directory_count })
    }
}

/// A located data directory: where a named table lives in the viewed address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    /// Absolute address of the table. Borrowed from loader-owned memory.
    pub address: usize,
    /// Declared byte size of the table.
    pub size: u32,
}

/// Locate a data directory of a loaded module, validating every header hop.
///
/// Returns `Ok(None)` when the module has no such directory - because a header
/// check failed, the index is outside the declared directory count, or the
/// entry is structurally present but has a zero size or offset. All of those
/// are the same thing to a caller: nothing to walk here.
///
/// # Errors
/// Returns [`crate::Error::UnmappedMemory`] if a header read faults, which
/// aborts the surrounding operation rather than this module alone.
pub fn locate_directory<V: ProcessView>(
    view: &V,
    module: ModuleHandle,
    index: usize,
) -> Result<Option<DataDirectory>> {
    let mut dos_buf = [0_u8; DOS_HEADER_LEN];
    view.read(module.base(), &mut dos_buf)?;

    let dos = match DosHeader::read(&dos_buf) {
        Ok(dos) => dos,
        Err(err) => {
            debug!("module {:#x}: {err}", module.base());
            return Ok(None);
        }
    };

    let Some(nt_addr) = module.base().checked_add(dos.e_lfanew as usize) else {
        return Ok(None);
    };

    let mut nt_buf = [0_u8; NT_PREFIX_LEN];
    view.read(nt_addr, &mut nt_buf)?;

    let nt = match NtHeaders::read(&nt_buf) {
        Ok(nt) => nt,
        Err(err) => {
            debug!("module {:#x}: {err}", module.base());
            return Ok(None);
        }
    };

    if index >= nt.directory_count as usize {
        return Ok(None);
    }

    let Some(entry_addr) = nt_addr.checked_add(NT_PREFIX_LEN + index * DATA_DIRECTORY_LEN) else {
        return Ok(None);
    };

    let mut entry_buf = [0_u8; DATA_DIRECTORY_LEN];
    view.read(entry_addr, &mut entry_buf)?;

    let mut parser = Parser::new(&entry_buf);
    let rva = parser.read_le::<u32>()?;
    let size = parser.read_le::<u32>()?;
    if rva == 0 || size == 0 {
        return Ok(None);
    }

    let Some(address) = module.base().checked_add(rva as usize) else {
        return Ok(None);
    };

    Ok(Some(DataDirectory { address, size }))
}
