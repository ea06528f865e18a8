use std::{
    fs::{self, File, Permissions},
    io::{self, Read},
    os::unix::fs::{lchown, symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use filetime::FileTime;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tar::EntryType;

use crate::{flags, UnlayerError, UnlayerResult};

use super::{options::UnpackOptions, path::secure_join};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owned snapshot of one archive entry's metadata.
///
/// Captured up front because the entry's reader is consumed by
/// materialization, and because AUFS hardlink staging must keep metadata
/// alive long after the originating entry has been read past.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Entry type tag (regular, directory, symlink, hardlink, device, ...).
    pub kind: EntryType,

    /// Declared permission bits.
    pub mode: u32,

    /// Declared owner uid (remapped in place before materialization).
    pub uid: u32,

    /// Declared owner gid (remapped in place before materialization).
    pub gid: u32,

    /// Modification time, seconds since the epoch.
    pub mtime: i64,

    /// Access time, when the archive declares one.
    pub atime: Option<i64>,

    /// Declared content size in bytes.
    pub size: u64,

    /// Link target for symlink and hardlink entries.
    pub link_name: Option<PathBuf>,

    /// Device major number for device entries.
    pub dev_major: Option<u32>,

    /// Device minor number for device entries.
    pub dev_minor: Option<u32>,

    /// Extended attributes from `SCHILY.xattr.*` PAX records.
    pub xattrs: Vec<(String, Vec<u8>)>,

    /// BSD-style persisted file flags from the `SCHILY.fflags` PAX record.
    pub fflags: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EntryMeta {
    /// Captures the metadata of a tar entry, including its PAX records.
    ///
    /// Must be called before the entry's content is read; PAX extensions are
    /// interleaved with it in the stream.
    pub fn from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> UnlayerResult<Self> {
        let link_name = entry
            .link_name()
            .map_err(UnlayerError::Stream)?
            .map(|name| name.into_owned());

        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode().map_err(UnlayerError::Stream)?;
        let uid = header.uid().map_err(UnlayerError::Stream)? as u32;
        let gid = header.gid().map_err(UnlayerError::Stream)? as u32;
        let mtime = header.mtime().map_err(UnlayerError::Stream)? as i64;
        let mut atime = header
            .as_gnu()
            .and_then(|gnu| gnu.atime().ok())
            .map(|atime| atime as i64);
        let size = header.size().map_err(UnlayerError::Stream)?;
        let dev_major = header.device_major().map_err(UnlayerError::Stream)?;
        let dev_minor = header.device_minor().map_err(UnlayerError::Stream)?;

        let mut xattrs = Vec::new();
        let mut fflags = None;
        if let Some(extensions) = entry.pax_extensions().map_err(UnlayerError::Stream)? {
            for extension in extensions {
                let extension = extension.map_err(UnlayerError::Stream)?;
                let Result::Ok(key) = extension.key() else {
                    continue;
                };
                if let Some(attr) = key.strip_prefix("SCHILY.xattr.") {
                    xattrs.push((attr.to_string(), extension.value_bytes().to_vec()));
                } else if key == "SCHILY.fflags" {
                    fflags = std::str::from_utf8(extension.value_bytes())
                        .ok()
                        .map(str::to_string);
                } else if key == "atime" {
                    // PAX timestamps may carry a fractional part; only whole
                    // seconds are kept.
                    atime = extension
                        .value()
                        .ok()
                        .and_then(|v| v.split('.').next()?.parse::<i64>().ok())
                        .or(atime);
                }
            }
        }

        Ok(Self {
            kind,
            mode,
            uid,
            gid,
            mtime,
            atime,
            size,
            link_name,
            dev_major,
            dev_minor,
            xattrs,
            fflags,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the filesystem object for one entry at a validated destination
/// path, then applies its metadata bit-for-bit.
///
/// `root` is the containing destination root, used to re-validate hardlink
/// targets (a hostile target escaping the root is a
/// [`Breakout`](UnlayerError::Breakout)). `data` supplies the content for
/// regular-file types and is consumed fully. Device nodes are skipped inside
/// user namespaces; ownership failures are tolerated iff
/// `ignore_chown_errors` is set; `force_mode` overrides declared permission
/// bits.
pub fn create_entry(
    path: &Path,
    root: &Path,
    meta: &EntryMeta,
    data: &mut dyn Read,
    options: &UnpackOptions,
) -> UnlayerResult<()> {
    let entry_err = |e: io::Error| UnlayerError::entry(e, path.display());

    match meta.kind {
        kind if kind.is_dir() => {
            // A merged lower-layer directory may already be in place.
            let exists_as_dir = fs::symlink_metadata(path)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !exists_as_dir {
                fs::create_dir(path).map_err(entry_err)?;
            }
        }
        kind if kind.is_file() || kind.is_contiguous() || kind.is_gnu_sparse() => {
            let mut file = File::create(path).map_err(entry_err)?;
            io::copy(data, &mut file).map_err(entry_err)?;
        }
        kind if kind.is_symlink() => {
            let target = meta.link_name.as_deref().ok_or_else(|| {
                UnlayerError::Stream(io::Error::other("symlink entry without a target"))
            })?;
            // Symlink targets are written verbatim; resolution happens at
            // mount/use time, outside this crate.
            symlink(target, path).map_err(entry_err)?;
        }
        kind if kind.is_hard_link() => {
            let raw_target = meta.link_name.as_deref().ok_or_else(|| {
                UnlayerError::Stream(io::Error::other("hardlink entry without a target"))
            })?;
            let target = secure_join(root, raw_target)?;
            fs::hard_link(&target, path).map_err(entry_err)?;
            // The target inode already carries its metadata; nothing else to
            // apply through this name.
            return Ok(());
        }
        kind if kind.is_fifo() => {
            nix::unistd::mkfifo(path, Mode::from_bits_truncate(meta.mode))
                .map_err(|e| entry_err(e.into()))?;
        }
        kind if kind.is_character_special() || kind.is_block_special() => {
            if *options.get_in_user_ns() {
                tracing::debug!(
                    "skipping device node {} inside user namespace",
                    path.display()
                );
                return Ok(());
            }
            let sflag = if kind.is_character_special() {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            let dev = makedev(
                meta.dev_major.unwrap_or(0) as u64,
                meta.dev_minor.unwrap_or(0) as u64,
            );
            mknod(path, sflag, Mode::from_bits_truncate(meta.mode), dev)
                .map_err(|e| entry_err(e.into()))?;
        }
        kind => {
            tracing::debug!(
                "skipping unhandled entry type {:?} for {}",
                kind,
                path.display()
            );
            return Ok(());
        }
    }

    apply_metadata(path, meta, options)
}

/// Applies ownership, xattrs, permission bits, persisted flags and
/// timestamps to a freshly created filesystem object.
fn apply_metadata(path: &Path, meta: &EntryMeta, options: &UnpackOptions) -> UnlayerResult<()> {
    let entry_err = |e: io::Error| UnlayerError::entry(e, path.display());

    if let Err(e) = lchown(path, Some(meta.uid), Some(meta.gid)) {
        if *options.get_ignore_chown_errors() {
            tracing::debug!(
                "ignoring chown({}, {}:{}) failure: {}",
                path.display(),
                meta.uid,
                meta.gid,
                e
            );
        } else {
            return Err(entry_err(e));
        }
    }

    let is_symlink = meta.kind.is_symlink();

    if !is_symlink {
        for (name, value) in &meta.xattrs {
            if let Err(e) = xattr::set(path, name, value) {
                // Filesystems without xattr support are common (and the
                // attribute may be privileged); not worth failing the layer.
                tracing::warn!(
                    "cannot set xattr {:?} on {}: {}",
                    name,
                    path.display(),
                    e
                );
            }
        }

        let mode = options.get_force_mode().unwrap_or(meta.mode) & 0o7777;
        tracing::trace!(
            "setting mode {} on {}",
            crate::utils::format_mode(mode),
            path.display()
        );
        fs::set_permissions(path, Permissions::from_mode(mode)).map_err(entry_err)?;

        // Directory flags are deferred to the finalization pass; an
        // immutable flag set now would block writing the children.
        if !meta.kind.is_dir() {
            flags::write_flags(path, meta.fflags.as_deref())?;
        }
    }

    let mtime = FileTime::from_unix_time(meta.mtime, 0);
    let atime = FileTime::from_unix_time(meta.atime.unwrap_or(meta.mtime), 0);
    if is_symlink {
        filetime::set_symlink_file_times(path, atime, mtime).map_err(entry_err)?;
    } else {
        filetime::set_file_times(path, atime, mtime).map_err(entry_err)?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for EntryMeta {
    fn default() -> Self {
        Self {
            kind: EntryType::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
            atime: None,
            size: 0,
            link_name: None,
            dev_major: None,
            dev_minor: None,
            xattrs: Vec::new(),
            fflags: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
