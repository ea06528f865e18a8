//! Layer unpacking: orchestration, entry materialization and apply handlers.
//!
//! This module drives a single sequential pass over a layer tar stream and
//! applies it onto a destination directory:
//!
//! 1. [`apply_layer`] / [`apply_uncompressed_layer`] set up the environment
//!    (umask relaxation, optional decompression) around the pass
//! 2. [`unpack_layer`] walks the stream one entry at a time, coordinating
//!    path validation, whiteout translation, AUFS hardlink staging, id
//!    remapping and materialization
//! 3. directory timestamps are finalized in a second pass, after all
//!    children have been written
//!
//! Entry order in the stream is semantically significant (whiteouts and
//! hardlink resolution depend on earlier entries), so no reordering or
//! parallelism is permitted.

mod apply;
mod aufs;
mod entry;
mod layer;
mod options;
mod path;
mod whiteout;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use apply::*;
pub use aufs::*;
pub use entry::*;
pub use layer::*;
pub use options::*;
pub use path::*;
pub use whiteout::*;
