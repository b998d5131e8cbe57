//! The live process, viewed through the loader and virtual-memory APIs.
//!
//! [`SystemProcess`] implements [`ProcessView`] over the process this code is running
//! in: module resolution via `GetModuleHandleA`, raw reads of loader-mapped images,
//! `VirtualProtect` brackets, and volatile pointer-width stores. Unlike the simulation
//! there is no oracle for what is mapped - reads are only ever issued against
//! structures reached from a loaded module's validated headers, which is the same
//! trust model the loader itself applies.
//!
//! Also here: the module-discovery helpers the plugin layer needs, like probing name
//! variants of Storm.dll and finding the host executable's own path.

use std::{
    ffi::{c_void, CString},
    path::PathBuf,
    ptr,
};

use widestring::U16Str;
use windows::{
    core::PCSTR,
    Win32::Foundation::HMODULE,
    Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleA},
    Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_NOCACHE, PAGE_PROTECTION_FLAGS,
        PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOMBINE, PAGE_WRITECOPY,
    },
};

use crate::{
    process::{ModuleHandle, PageProtection, ProcessView},
    Error, Result,
};

/// The current process's address space and loader state.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl SystemProcess {
    /// A view of the current process.
    pub fn new() -> SystemProcess {
        SystemProcess
    }

    /// Find a loaded module, probing the bare name and a `.dll`-suffixed variant.
    ///
    /// The loader matches names case-insensitively but not extension-insensitively;
    /// games reference Storm under both spellings.
    pub fn find_loaded_module(&self, name: &str) -> Option<ModuleHandle> {
        if let Some(module) = self.module_by_name(name) {
            return Some(module);
        }

        if !name.contains('.') {
            return self.module_by_name(&format!("{name}.dll"));
        }

        None
    }

    /// The module handle of the host executable.
    pub fn executable_module(&self) -> Option<ModuleHandle> {
        let handle = unsafe { GetModuleHandleA(PCSTR::null()) }.ok()?;
        let base = handle.0 as usize;
        (base != 0).then(|| ModuleHandle::new(base))
    }

    /// Full path of the host executable on disk.
    pub fn executable_path(&self) -> Option<PathBuf> {
        self.module_path(self.executable_module()?)
    }

    /// Full path of a loaded module on disk.
    pub fn module_path(&self, module: ModuleHandle) -> Option<PathBuf> {
        let mut buf = vec![0_u16; 1024];
        let len = unsafe {
            GetModuleFileNameW(HMODULE(module.base() as *mut c_void), &mut buf)
        } as usize;

        if len == 0 {
            return None;
        }

        Some(PathBuf::from(
            U16Str::from_slice(&buf[..len.min(buf.len())]).to_os_string(),
        ))
    }
}

impl ProcessView for SystemProcess {
    fn module_by_name(&self, name: &str) -> Option<ModuleHandle> {
        let name = CString::new(name).ok()?;
        let handle = unsafe { GetModuleHandleA(PCSTR(name.as_ptr().cast())) }.ok()?;
        let base = handle.0 as usize;
        (base != 0).then(|| ModuleHandle::new(base))
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if addr == 0 {
            return Err(Error::UnmappedMemory { addr });
        }

        unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn protect(
        &self,
        addr: usize,
        len: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(
                addr as *const c_void,
                len,
                to_native(protection),
                &mut previous,
            )
        }
        .map_err(|_| Error::ProtectionDenied { addr })?;

        Ok(from_native(previous))
    }

    fn write_ptr(&self, addr: usize, value: usize) -> Result<()> {
        if addr == 0 {
            return Err(Error::UnmappedMemory { addr });
        }

        unsafe {
            ptr::write_volatile(addr as *mut usize, value);
        }
        Ok(())
    }
}

/// Lower a portable protection to the native constant it stands for.
fn to_native(protection: PageProtection) -> PAGE_PROTECTION_FLAGS {
    let executable = protection.contains(PageProtection::EXECUTE);
    let writable = protection.contains(PageProtection::WRITE);
    let private = protection.contains(PageProtection::COPY_ON_WRITE);

    match (executable, writable, private) {
        (false, true, true) => PAGE_WRITECOPY,
        (false, true, false) => PAGE_READWRITE,
        (false, false, _) if protection.contains(PageProtection::READ) => PAGE_READONLY,
        (false, false, _) => PAGE_NOACCESS,
        (true, true, true) => PAGE_EXECUTE_WRITECOPY,
        (true, true, false) => PAGE_EXECUTE_READWRITE,
        (true, false, _) if protection.contains(PageProtection::READ) => PAGE_EXECUTE_READ,
        (true, false, _) => PAGE_EXECUTE,
    }
}

/// Lift a native protection to the portable bits; modifier bits (guard, cache
/// control) are not carried.
fn from_native(native: PAGE_PROTECTION_FLAGS) -> PageProtection {
    const MODIFIERS: u32 = PAGE_GUARD.0 | PAGE_NOCACHE.0 | PAGE_WRITECOMBINE.0;
    let base = PAGE_PROTECTION_FLAGS(native.0 & !MODIFIERS);

    let table = [
        (PAGE_READONLY, PageProtection::READ),
        (PAGE_READWRITE, PageProtection::READ_WRITE),
        (
            PAGE_WRITECOPY,
            PageProtection::READ_WRITE.union(PageProtection::COPY_ON_WRITE),
        ),
        (PAGE_EXECUTE, PageProtection::EXECUTE),
        (
            PAGE_EXECUTE_READ,
            PageProtection::EXECUTE.union(PageProtection::READ),
        ),
        (
            PAGE_EXECUTE_READWRITE,
            PageProtection::EXECUTE.union(PageProtection::READ_WRITE),
        ),
        (
            PAGE_EXECUTE_WRITECOPY,
            PageProtection::EXECUTE
                .union(PageProtection::READ_WRITE)
                .union(PageProtection::COPY_ON_WRITE),
        ),
    ];

    table
        .iter()
        .find(|(flags, _)| *flags == base)
        .map(|(_, portable)| *portable)
        .unwrap_or(PageProtection::empty())
}
