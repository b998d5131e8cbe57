// Copyright 2025 the mpqscope authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
// - 'process/system.rs' reads loader-mapped images and performs the thunk stores
// - 'plugin.rs' carries the C++-vtable-compatible MPQDraft FFI surface

//! # mpqscope
//!
//! A runtime call-interception engine for loaded modules, with an MPQ file-access
//! tracer built on top. Given a function exported by one loaded module and imported by
//! others, `mpqscope` rewrites the importers' thunk slots in memory so future calls
//! resolve to a replacement function - without touching the exporting module, without
//! source access to the callers, and with the original still reachable for forwarding.
//!
//! The shipped use of that engine is the plugin layer: hook Storm.dll's file-open entry
//! points in Blizzard games and log every file the game pulls out of its MPQ archives.
//!
//! ## Features
//!
//! - **Import-graph traversal** - recursive patching across the module dependency
//!   graph, with cycle and diamond safety (every reachable module visited exactly once)
//! - **Defensive header walking** - loaded images are arbitrary binaries; every header
//!   hop is validated and a malformed module contributes nothing instead of crashing
//! - **Scoped protection changes** - each slot rewrite briefly relaxes page protection
//!   and restores it, so no page is left writable
//! - **Simulated address space** - the whole engine runs against crafted in-memory
//!   module graphs on any platform, live Windows processes behind `cfg(windows)`
//!
//! ## Quick Start
//!
//! ```rust
//! use mpqscope::prelude::*;
//!
//! let old = 0x6000_1000; // address the importers currently hold
//! let new = 0x0040_9000; // replacement to install
//!
//! let mut process = SimulatedProcess::new();
//! process.map_module("storm.dll", ModuleImageBuilder::new().build());
//! let game = process.map_module(
//!     "game.exe",
//!     ModuleImageBuilder::new()
//!         .import("storm.dll", &[old, 0x6000_2000])
//!         .build(),
//! );
//!
//! let patched = patch_import_entry(&process, game, "storm.dll", old, new, true)?;
//! assert_eq!(patched, 1);
//! # Ok::<(), mpqscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`process`] - the [`ProcessView`](process::ProcessView) seam: module resolution,
//!   reads, protection changes, pointer-width stores; simulated and live backends
//! - [`image`] - in-memory executable-image parsing: headers, data directories,
//!   import descriptors, thunk arrays
//! - [`patch`] - the traversal-and-rewrite engine and its public entry points
//! - [`config`], [`trace`], [`storm`] - the tracing plugin around the engine
//! - `plugin` (Windows) - the MPQDraft plugin boundary: exports, vtable, hook bodies
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, Error>`](Result). The patch entry points
//! distinguish "patched zero slots" (`Ok(0)`) from failure (`Err`), so a zero count is
//! never ambiguous. Malformed modules are absorbed per module by design; see [`Error`]
//! for which conditions abort a whole operation.
//!
//! ## Scope
//!
//! The engine only redirects calls that indirect through import tables. Lookups done at
//! runtime against export tables keep resolving to the original, statically linked calls
//! are untouched, and there is no unpatch: installing a hook is a one-way door held
//! open for the lifetime of the process.
#[macro_use]
pub(crate) mod error;

pub mod config;
pub mod image;
pub mod patch;
pub mod process;
pub mod storm;
pub mod trace;

#[cfg(windows)]
pub mod plugin;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use mpqscope::prelude::*;
///
/// let mut process = SimulatedProcess::new();
/// let module = process.map_module("storm.dll", ModuleImageBuilder::new().build());
/// assert!(!module.is_null());
/// ```
pub mod prelude;

/// `mpqscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]; used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `mpqscope` Error type
///
/// The main error type for all operations in this crate. See the variant documentation
/// for which conditions abort a patch operation and which stay local to one module.
pub use error::Error;

/// Redirect an imported function across the module graph.
///
/// See [`patch::patch_import_entry`] for the full contract, and
/// [`patch::patch_import_entry_with`] for reusing traversal state across calls.
pub use patch::{patch_import_entry, patch_import_entry_with, VisitedModules};

/// The address-space seam the engine operates through.
pub use process::{ModuleHandle, PageProtection, ProcessView};
