//! Persisted file flag primitives (immutable, append-only).
//!
//! Archives produced on BSD-style systems can carry `chflags` names in the
//! `SCHILY.fflags` PAX record. An immutable flag on a pre-existing
//! destination object also blocks removal and metadata changes, so it must be
//! reset before the object can be replaced. On Linux the equivalent state
//! lives in the `FS_IOC_GETFLAGS`/`FS_IOC_SETFLAGS` inode flags; on platforms
//! without the concept both operations are best-effort no-ops.

use std::{fs::Metadata, path::Path};

use crate::UnlayerResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Linux inode flag bit for immutable files.
const FS_IMMUTABLE_FL: i64 = 0x0000_0010;

/// Linux inode flag bit for append-only files.
const FS_APPEND_FL: i64 = 0x0000_0020;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Clears the immutable and append-only flags on `path` if they are set.
///
/// Must be called before removing or rewriting a pre-existing destination
/// object; an immutable inode rejects both. `cached_meta` avoids a second
/// stat when the caller already has one. Filesystems and file types without
/// flag support are tolerated silently.
pub fn reset_immutable(path: &Path, cached_meta: Option<&Metadata>) -> UnlayerResult<()> {
    #[cfg(target_os = "linux")]
    {
        if let Some(meta) = cached_meta {
            if meta.file_type().is_symlink() {
                return Ok(());
            }
        }
        linux::update_flags(path, |flags| flags & !(FS_IMMUTABLE_FL | FS_APPEND_FL))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (path, cached_meta);
        Ok(())
    }
}

/// Applies persisted flags named in an entry's `SCHILY.fflags` PAX record.
///
/// Recognized names are the BSD `chflags` spellings for immutable
/// (`uchg`/`schg`/`uchange`/`uimmutable`/`simmutable`) and append-only
/// (`uappnd`/`sappnd`/`uappend`/`sappend`); anything else is ignored with a
/// debug log. A `None` or empty record is a no-op.
pub fn write_flags(path: &Path, fflags: Option<&str>) -> UnlayerResult<()> {
    let Some(fflags) = fflags else {
        return Ok(());
    };

    let mut set = 0i64;
    for name in fflags.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match name {
            "uchg" | "uchange" | "uimmutable" | "schg" | "schange" | "simmutable" => {
                set |= FS_IMMUTABLE_FL;
            }
            "uappnd" | "uappend" | "sappnd" | "sappend" => {
                set |= FS_APPEND_FL;
            }
            other => {
                tracing::debug!("ignoring unsupported file flag {:?} on {}", other, path.display());
            }
        }
    }

    if set == 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        linux::update_flags(path, |flags| flags | set)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Linux Implementation
//--------------------------------------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod linux {
    use std::{fs::OpenOptions, os::fd::AsRawFd, os::unix::fs::OpenOptionsExt, path::Path};

    use nix::errno::Errno;

    use crate::UnlayerResult;

    nix::ioctl_read!(fs_ioc_getflags, b'f', 1, libc::c_long);
    nix::ioctl_write_ptr!(fs_ioc_setflags, b'f', 2, libc::c_long);

    /// Reads the inode flags of `path`, applies `update`, and writes them
    /// back if they changed. Unsupported file types and filesystems are
    /// tolerated.
    pub(super) fn update_flags(
        path: &Path,
        update: impl FnOnce(i64) -> i64,
    ) -> UnlayerResult<()> {
        // O_NOFOLLOW: symlinks have no flags of their own. O_NONBLOCK: do not
        // hang opening FIFOs.
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
            .open(path)
        {
            Result::Ok(file) => file,
            Err(e) => {
                tracing::debug!("cannot open {} for flag update: {}", path.display(), e);
                return Ok(());
            }
        };

        let mut flags: libc::c_long = 0;
        match unsafe { fs_ioc_getflags(file.as_raw_fd(), &mut flags) } {
            Result::Ok(_) => {}
            Err(e) if flags_unsupported(e) => return Ok(()),
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        let updated = update(flags as i64) as libc::c_long;
        if updated == flags {
            return Ok(());
        }

        match unsafe { fs_ioc_setflags(file.as_raw_fd(), &updated) } {
            Result::Ok(_) => Ok(()),
            Err(e) if flags_unsupported(e) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    fn flags_unsupported(errno: Errno) -> bool {
        matches!(
            errno,
            Errno::ENOTTY | Errno::EOPNOTSUPP | Errno::ENOSYS | Errno::EINVAL
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_flags_reset_immutable_plain_file() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("plain.txt");
        fs::write(&file, "contents")?;

        // No flags set; must be a clean no-op whatever the filesystem.
        let meta = fs::symlink_metadata(&file)?;
        reset_immutable(&file, Some(&meta))?;
        reset_immutable(&file, None)?;

        Ok(())
    }

    #[test]
    fn test_flags_reset_immutable_symlink() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("target.txt");
        fs::write(&target, "x")?;
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&target, &link)?;

        let meta = fs::symlink_metadata(&link)?;
        reset_immutable(&link, Some(&meta))?;

        Ok(())
    }

    #[test]
    fn test_flags_write_flags_unknown_names_ignored() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("file.txt");
        fs::write(&file, "x")?;

        write_flags(&file, None)?;
        write_flags(&file, Some(""))?;
        write_flags(&file, Some("nodump,arch"))?;

        Ok(())
    }
}
