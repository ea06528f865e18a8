//! `unlayer` applies container image layer diffs onto a destination directory tree.
//!
//! # Overview
//!
//! A layer diff is a sequential tar stream describing the changes one image
//! layer makes relative to the layers below it. Applying it is more than
//! extraction: union-filesystem conventions encode deletions as reserved
//! "whiteout" marker names, directory resets as opaque markers, and (in the
//! legacy AUFS convention) hardlink targets as files staged under a reserved
//! link directory. This crate implements those semantics while defending
//! against hostile archives:
//!
//! - Whiteout files (`.wh.name`) delete the named sibling from lower layers
//! - Opaque markers (`.wh..wh..opq`) hide all pre-existing directory contents
//! - Files under `.wh..wh.plnk` are staged so later hardlinks can resolve
//! - Entry names are validated so they cannot escape the destination root
//! - Directory timestamps are finalized only after all children are written
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::fs::File;
//! use unlayer::{apply_layer, UnpackOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let layer = File::open("layer.tar.gz")?;
//!     let options = UnpackOptions::default();
//!     let bytes_applied = apply_layer("/var/lib/images/rootfs", layer, &options)?;
//!     println!("applied {} bytes", bytes_applied);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`unpack`] - The unpack orchestrator, entry materializer and apply handlers
//! - [`decompress`] - Compression sniffing and stream decoding
//! - [`idmap`] - UID/GID range mapping for isolated id namespaces
//! - [`flags`] - Persisted (immutable/append-only) file flag primitives
//! - [`utils`] - Common helpers
//!
//! # Concurrency
//!
//! Unpacking is single-threaded, synchronous and strictly sequential: later
//! entries (whiteouts, hardlinks) depend on earlier ones having been applied.
//! Calls into *different* destination roots may run concurrently; concurrent
//! unpacking into the *same* root is unsupported.
//!
//! # Platform Support
//!
//! - Linux: full support, including immutable-flag handling and device nodes
//! - Other Unix: full support; persisted file flags are best-effort no-ops
//! - Windows: not currently supported

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod decompress;
pub mod flags;
pub mod idmap;
pub mod unpack;
pub mod utils;

pub use error::*;
pub use unpack::{apply_layer, apply_uncompressed_layer, unpack_layer, UnpackOptions};
