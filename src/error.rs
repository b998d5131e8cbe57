use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Two families matter to callers of the patch engine:
///
/// ## Operation-aborting conditions
/// - [`Error::InvalidArgument`] - rejected before any traversal begins
/// - [`Error::ModuleNotLoaded`] - the exporting module is not currently loaded
/// - [`Error::ProtectionDenied`] - a thunk slot could not be made writable
/// - [`Error::WriteProtected`] - a store hit a page that is not writable
/// - [`Error::UnmappedMemory`] - a walk dereferenced memory no module owns
///
/// Any of these surfacing from [`patch_import_entry`](crate::patch_import_entry) means the
/// whole operation failed and no patch count is available; the caller falls back to
/// un-hooked behavior.
///
/// ## Module-local conditions
/// - [`Error::Malformed`] and [`Error::OutOfBounds`] - produced while decoding image
///   structures. The engine absorbs these per module (a corrupt module simply contributes
///   zero patches), so they only reach callers using the image layer directly.
///
/// The remaining variants wrap I/O failures from the configuration and tracing layers.
#[derive(Error, Debug)]
pub enum Error {
    /// An out of bound access was attempted while decoding an image structure.
    ///
    /// This is a safety check to prevent reads past the end of a header buffer
    /// when the declared layout and the actual bytes disagree.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// An image structure is damaged and could not be decoded.
    ///
    /// Loaded modules originate from arbitrary binaries, so every header hop is
    /// validated; this variant records the source location where a check failed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A traversal dereferenced an address no loaded module owns.
    ///
    /// Corresponds to the access faults the original loader-walking code could
    /// only catch wholesale; here the fault is detected at the read and aborts
    /// the operation.
    #[error("No mapped memory at {addr:#x}")]
    UnmappedMemory {
        /// The faulting address
        addr: usize,
    },

    /// The page protection of a thunk slot could not be changed.
    ///
    /// Fatal for the entire patch operation. An import table that cannot be made
    /// writable indicates something structurally wrong with the mapping, not a
    /// per-slot condition worth skipping.
    #[error("Could not change page protection at {addr:#x}")]
    ProtectionDenied {
        /// Address of the slot whose protection change was denied
        addr: usize,
    },

    /// A pointer-sized store hit a page without write access.
    #[error("Write to non-writable page at {addr:#x}")]
    WriteProtected {
        /// Address of the attempted store
        addr: usize,
    },

    /// A required argument was null or empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The named module does not resolve to a currently loaded module.
    ///
    /// You cannot patch references to a module that is not loaded.
    #[error("Module is not loaded: {0}")]
    ModuleNotLoaded(String),

    /// File I/O error from the configuration or tracing layer.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
}
