//! # mpqscope Prelude
//!
//! A convenient prelude for the most commonly used types of the library: the patch
//! entry points, the process-view seam with both backends, and the tracing plugin's
//! configuration types. Import it wholesale when experimenting; production callers
//! usually pick the specific paths instead.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all mpqscope operations
pub use crate::Error;

/// The result type used throughout mpqscope
pub use crate::Result;

// ================================================================================================
// Patch Engine
// ================================================================================================

/// The patch entry points and reusable traversal state
pub use crate::patch::{patch_import_entry, patch_import_entry_with, VisitedModules};

// ================================================================================================
// Process Views
// ================================================================================================

/// The address-space seam and its vocabulary types
pub use crate::process::{ModuleHandle, PageProtection, ProcessView, SLOT_SIZE};

/// The simulated backend and its image crafter
pub use crate::process::simulated::{ModuleImageBuilder, SimulatedProcess};

/// The live-process backend
#[cfg(windows)]
pub use crate::process::system::SystemProcess;

// ================================================================================================
// Image Layer
// ================================================================================================

/// Directory location and import walking over a process view
pub use crate::image::{
    import_descriptors, locate_directory, thunk_slots, DataDirectory, ImportEntry, ThunkSlot,
    IMPORT_DIRECTORY,
};

// ================================================================================================
// Tracing Plugin
// ================================================================================================

/// Plugin configuration and its enums
pub use crate::config::{Config, LogFormat, TargetGame};

/// The file-access log the hooks write into
pub use crate::trace::FileAccessLog;

/// Storm ordinal tables and the resolved-function context
pub use crate::storm::{StormFunctions, StormOrdinals};
