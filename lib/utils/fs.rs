use std::{fs, io, path::Path};

use crate::UnlayerResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Removes a filesystem object of any type, tolerating its absence.
///
/// Directories are removed recursively. A missing target is not an error:
/// whiteout processing routinely races against entries earlier in the same
/// stream that already deleted the target.
pub fn remove_all_if_exists(path: impl AsRef<Path>) -> UnlayerResult<()> {
    let path = path.as_ref();
    let metadata = match fs::symlink_metadata(path) {
        Result::Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Result::Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Formats a Unix permission mode as an `rwxr-xr-x` style string.
pub fn format_mode(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
