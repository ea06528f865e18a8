use std::{io::Read, path::Path};

use nix::sys::stat::{umask, Mode};

use crate::{decompress, UnlayerResult};

use super::{layer::unpack_layer, options::UnpackOptions, path::clean};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies a possibly-compressed layer diff onto the directory tree rooted at
/// `dest`, returning the byte size of the uncompressed layer.
///
/// The destination root is lexically normalized first, so `.` and `..`
/// components never leak into joined paths or error messages. The
/// compression format is sniffed from the stream's leading bytes; plain tar
/// streams pass through untouched. The process umask is relaxed to zero for
/// the duration so declared permission bits land exactly, and restored on
/// exit even when unpacking fails.
///
/// The umask is process-global state, so concurrent layer application within
/// one process must be serialized by the caller.
pub fn apply_layer(
    dest: impl AsRef<Path>,
    layer: impl Read + 'static,
    options: &UnpackOptions,
) -> UnlayerResult<u64> {
    let dest = clean(dest.as_ref());
    let mut reader = decompress::decompress_stream(layer)?;
    with_relaxed_umask(|| unpack_layer(dest, &mut reader, options))
}

/// Like [`apply_layer`] but the stream is trusted to be an uncompressed tar;
/// no format sniffing takes place.
pub fn apply_uncompressed_layer(
    dest: impl AsRef<Path>,
    layer: impl Read,
    options: &UnpackOptions,
) -> UnlayerResult<u64> {
    let dest = clean(dest.as_ref());
    with_relaxed_umask(|| unpack_layer(dest, layer, options))
}

/// Runs `f` with the process umask cleared, restoring the previous mask
/// afterwards regardless of the outcome.
fn with_relaxed_umask<T>(f: impl FnOnce() -> UnlayerResult<T>) -> UnlayerResult<T> {
    let previous = umask(Mode::empty());
    let _restore = scopeguard::guard(previous, |previous| {
        umask(previous);
    });

    f()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::{Cursor, Write},
        os::unix::fs::PermissionsExt,
    };

    use flate2::{write::GzEncoder, Compression};
    use nix::unistd::{getegid, geteuid};
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::UnlayerError;

    fn tiny_layer() -> anyhow::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o666);
        header.set_uid(geteuid().as_raw() as u64);
        header.set_gid(getegid().as_raw() as u64);
        header.set_mtime(1_600_000_000);
        header.set_size(5);
        builder.append_data(&mut header, "file.txt", &b"hello"[..])?;
        Ok(builder.into_inner()?)
    }

    #[test]
    #[serial]
    fn test_apply_uncompressed_layer_relaxes_umask() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = tiny_layer()?;

        // A restrictive umask must not leak into the unpacked modes.
        let before = umask(Mode::from_bits_truncate(0o077));
        let result = apply_uncompressed_layer(
            temp.path(),
            Cursor::new(layer),
            &UnpackOptions::default(),
        );
        let after = umask(before);

        let size = result?;
        assert_eq!(size, 5);
        assert_eq!(after, Mode::from_bits_truncate(0o077));

        let mode = fs::metadata(temp.path().join("file.txt"))?.permissions().mode();
        assert_eq!(mode & 0o7777, 0o666);

        Ok(())
    }

    #[test]
    #[serial]
    fn test_apply_layer_sniffs_gzip() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = tiny_layer()?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&layer)?;
        let compressed = encoder.finish()?;

        let size = apply_layer(
            temp.path(),
            Cursor::new(compressed),
            &UnpackOptions::default(),
        )?;

        assert_eq!(size, 5);
        assert_eq!(fs::read(temp.path().join("file.txt"))?, b"hello");

        Ok(())
    }

    #[test]
    #[serial]
    fn test_apply_layer_passes_plain_tar_through() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = tiny_layer()?;

        let size = apply_layer(temp.path(), Cursor::new(layer), &UnpackOptions::default())?;
        assert_eq!(size, 5);

        Ok(())
    }

    #[test]
    #[serial]
    fn test_apply_normalizes_destination_root() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = tiny_layer()?;

        // `sub` never exists; the root must be cleaned lexically, not
        // resolved against the filesystem.
        let dest = temp.path().join(".").join("sub").join("..");
        let size = apply_uncompressed_layer(&dest, Cursor::new(layer), &UnpackOptions::default())?;

        assert_eq!(size, 5);
        assert_eq!(fs::read(temp.path().join("file.txt"))?, b"hello");
        assert!(!temp.path().join("sub").exists());

        Ok(())
    }

    #[test]
    #[serial]
    fn test_apply_umask_restored_on_failure() -> anyhow::Result<()> {
        let temp = tempdir()?;

        // The hostile name is written into the raw header bytes; a builder
        // refuses to produce `..` components itself.
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(geteuid().as_raw() as u64);
        header.set_gid(getegid().as_raw() as u64);
        header.set_size(4);
        let gnu = header
            .as_gnu_mut()
            .ok_or_else(|| anyhow::anyhow!("not a gnu header"))?;
        let name = b"../evil";
        gnu.name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"boom"[..])?;
        let layer = builder.into_inner()?;

        let before = umask(Mode::from_bits_truncate(0o022));
        let result = apply_uncompressed_layer(
            temp.path(),
            Cursor::new(layer),
            &UnpackOptions::default(),
        );
        let after = umask(before);

        assert!(matches!(result, Err(UnlayerError::Breakout { .. })));
        assert_eq!(after, Mode::from_bits_truncate(0o022));

        Ok(())
    }
}
