//! Storm.dll entry points, by ordinal.
//!
//! Storm exports the file functions this plugin cares about by ordinal, not by name,
//! and Diablo I ships a Storm whose ordinals differ from every later game. The tables
//! here cover both layouts; [`resolve`] turns one of them into a [`StormFunctions`]
//! context of typed pointers.
//!
//! `StormFunctions` is the hook context: the resolved originals travel inside it to
//! whoever installs the hooks, instead of through process-wide statics. Forwarding to
//! the original keeps working after the import tables are patched, because ordinal
//! resolution reads Storm's export table, which patching never touches.

use std::ffi::{c_char, c_void};

use crate::config::TargetGame;

/// Win32-style boolean as Storm returns it.
pub type StormBool = i32;

/// Opaque handle to an open MPQ archive or file.
pub type StormHandle = *mut c_void;

/// `SFileOpenFile(lpFileName, phFile)`
pub type SFileOpenFileFn =
    unsafe extern "system" fn(*const c_char, *mut StormHandle) -> StormBool;

/// `SFileOpenFileEx(hMpq, szFileName, dwSearchScope, phFile)`
pub type SFileOpenFileExFn =
    unsafe extern "system" fn(StormHandle, *const c_char, u32, *mut StormHandle) -> StormBool;

/// `SFileGetFileArchive(hFile, phArchive)`
pub type SFileGetFileArchiveFn =
    unsafe extern "system" fn(StormHandle, *mut StormHandle) -> StormBool;

/// `SFileGetArchiveName(hArchive, szArchiveName, dwBufferSize)`
pub type SFileGetArchiveNameFn =
    unsafe extern "system" fn(StormHandle, *mut c_char, u32) -> StormBool;

/// The Storm export ordinals of one game generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StormOrdinals {
    /// `SFileOpenFile`
    pub open_file: u16,
    /// `SFileOpenFileEx`
    pub open_file_ex: u16,
    /// `SFileGetFileArchive`
    pub get_file_archive: u16,
    /// `SFileGetArchiveName`
    pub get_archive_name: u16,
}

/// Ordinal layout of the Storm.dll shipped with Diablo I.
pub const DIABLO_1_ORDINALS: StormOrdinals = StormOrdinals {
    open_file: 0x4E,
    open_file_ex: 0x4F,
    get_file_archive: 0x4B,
    get_archive_name: 0x56,
};

/// Ordinal layout of every later Storm.dll.
pub const LATER_ORDINALS: StormOrdinals = StormOrdinals {
    open_file: 0x10B,
    open_file_ex: 0x10C,
    get_file_archive: 0x108,
    get_archive_name: 0x113,
};

impl TargetGame {
    /// The Storm ordinal layout this game uses.
    pub fn storm_ordinals(self) -> StormOrdinals {
        match self {
            TargetGame::Diablo1 => DIABLO_1_ORDINALS,
            TargetGame::Later => LATER_ORDINALS,
        }
    }
}

/// Typed pointers to Storm's file functions, as far as they resolved.
///
/// The two open functions are hook targets; the archive pair only feeds log
/// formats that name the source archive, so either may be absent without
/// affecting the hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct StormFunctions {
    /// Resolved `SFileOpenFile`, if exported.
    pub open_file: Option<SFileOpenFileFn>,
    /// Resolved `SFileOpenFileEx`, if exported.
    pub open_file_ex: Option<SFileOpenFileExFn>,
    /// Resolved `SFileGetFileArchive`, if exported.
    pub get_file_archive: Option<SFileGetFileArchiveFn>,
    /// Resolved `SFileGetArchiveName`, if exported.
    pub get_archive_name: Option<SFileGetArchiveNameFn>,
}

impl StormFunctions {
    /// Whether at least one hookable open function resolved.
    pub fn any_open_resolved(&self) -> bool {
        self.open_file.is_some() || self.open_file_ex.is_some()
    }
}

/// Resolve Storm's file functions from a loaded Storm module by ordinal.
#[cfg(windows)]
pub fn resolve(module: crate::process::ModuleHandle, ordinals: StormOrdinals) -> StormFunctions {
    use windows::core::PCSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::GetProcAddress;

    type RawExport = unsafe extern "system" fn() -> isize;

    let handle = HMODULE(module.base() as *mut c_void);
    let by_ordinal =
        |ordinal: u16| unsafe { GetProcAddress(handle, PCSTR(ordinal as usize as *const u8)) };

    // SAFETY: the ordinals name exports with exactly these signatures; a wrong
    // ordinal table yields a wrongly typed pointer either way, which is why the
    // layout is configured per game.
    StormFunctions {
        open_file: by_ordinal(ordinals.open_file)
            .map(|f| unsafe { std::mem::transmute::<RawExport, SFileOpenFileFn>(f) }),
        open_file_ex: by_ordinal(ordinals.open_file_ex)
            .map(|f| unsafe { std::mem::transmute::<RawExport, SFileOpenFileExFn>(f) }),
        get_file_archive: by_ordinal(ordinals.get_file_archive)
            .map(|f| unsafe { std::mem::transmute::<RawExport, SFileGetFileArchiveFn>(f) }),
        get_archive_name: by_ordinal(ordinals.get_archive_name)
            .map(|f| unsafe { std::mem::transmute::<RawExport, SFileGetArchiveNameFn>(f) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_the_target_game() {
        assert_eq!(TargetGame::Diablo1.storm_ordinals(), DIABLO_1_ORDINALS);
        assert_eq!(TargetGame::Later.storm_ordinals(), LATER_ORDINALS);
        assert_eq!(DIABLO_1_ORDINALS.open_file, 0x4E);
        assert_eq!(LATER_ORDINALS.open_file_ex, 0x10C);
    }

    #[test]
    fn unresolved_functions_are_not_hookable() {
        let none = StormFunctions::default();
        assert!(!none.any_open_resolved());

        unsafe extern "system" fn stub(
            _name: *const c_char,
            _file: *mut StormHandle,
        ) -> StormBool {
            0
        }

        let some = StormFunctions {
            open_file: Some(stub),
            ..StormFunctions::default()
        };
        assert!(some.any_open_resolved());
    }
}
