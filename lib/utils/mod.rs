//! Common utilities and helpers.

mod fs;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use fs::*;
