use std::{
    collections::HashSet,
    fs::{self, DirBuilder},
    io::Read,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use filetime::FileTime;

use crate::{flags, idmap::IdMapper, utils, UnlayerError, UnlayerResult};

use super::{
    aufs::AufsStaging,
    entry::{create_entry, EntryMeta},
    options::UnpackOptions,
    path::{clean, secure_join},
    whiteout::{self, WhiteoutKind},
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies an uncompressed layer tar stream onto the directory tree rooted at
/// `dest`, returning the byte size of the layer as counted from its entry
/// headers.
///
/// The stream is walked exactly once, in order; whiteout markers delete
/// lower-layer state, ordinary entries replace or merge into it, and
/// directory timestamps (and persisted flags) are finalized after all
/// children have been written. Skipped entries still count toward the
/// returned size.
///
/// The caller is responsible for the umask; see
/// [`apply_uncompressed_layer`](super::apply_uncompressed_layer) for a
/// wrapper that relaxes it around this call.
///
/// # Errors
/// Fails fast on path traversal ([`Breakout`](UnlayerError::Breakout)),
/// unresolvable AUFS hardlinks
/// ([`InvalidHardlink`](UnlayerError::InvalidHardlink)), id mapping gaps and
/// filesystem errors. The destination is left partially modified; callers
/// unpack into a staging directory if atomicity matters.
pub fn unpack_layer(
    dest: impl AsRef<Path>,
    layer: impl Read,
    options: &UnpackOptions,
) -> UnlayerResult<u64> {
    let dest = dest.as_ref();
    let mapper = IdMapper::new(options.get_uid_maps().clone(), options.get_gid_maps().clone())?;

    let mut archive = tar::Archive::new(layer);
    let mut staging = AufsStaging::new();
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut pending_dirs: Vec<(PathBuf, EntryMeta)> = Vec::new();
    let mut size: u64 = 0;

    for entry in archive.entries().map_err(UnlayerError::Stream)? {
        let mut entry = entry.map_err(UnlayerError::Stream)?;

        // Every entry counts toward the layer size, skipped ones included.
        size += entry.header().size().map_err(UnlayerError::Stream)?;

        let name = clean(&entry.path().map_err(UnlayerError::Stream)?);

        if options.get_name_filter().should_skip(&name) {
            tracing::warn!("skipping entry {:?}: unrepresentable on this platform", name);
            continue;
        }

        let mut meta = EntryMeta::from_entry(&mut entry)?;

        match whiteout::classify(&name, meta.kind.is_file()) {
            WhiteoutKind::AufsLinkSource { basename } => {
                staging.stage(&basename, &meta, &mut entry, options)?;
                continue;
            }
            WhiteoutKind::AufsMetadata => continue,
            WhiteoutKind::Opaque => {
                let parent = name.parent().unwrap_or_else(|| Path::new(""));
                let dir = secure_join(dest, parent)?;
                // The marker may be the only mention of its directory in the
                // whole layer.
                ensure_dir(&dir)?;
                whiteout::remove_opaque_children(&dir, &unpacked)?;
                continue;
            }
            WhiteoutKind::Single { hidden } => {
                let parent = name.parent().unwrap_or_else(|| Path::new(""));
                let parent_dir = secure_join(dest, parent)?;
                ensure_dir(&parent_dir)?;
                let target = parent_dir.join(hidden);
                if let Result::Ok(existing) = fs::symlink_metadata(&target) {
                    flags::reset_immutable(&target, Some(&existing))?;
                    utils::remove_all_if_exists(&target)?;
                }
                continue;
            }
            WhiteoutKind::None => {}
        }

        let path = secure_join(dest, &name)?;

        // Layers routinely omit intermediate directory entries.
        if path != dest {
            if let Some(parent) = path.parent() {
                ensure_dir(parent)?;
            }
        }

        // An existing object is replaced unless both old and new are
        // directories, which merge.
        if let Result::Ok(existing) = fs::symlink_metadata(&path) {
            if !(existing.is_dir() && meta.kind.is_dir()) {
                flags::reset_immutable(&path, Some(&existing))?;
                utils::remove_all_if_exists(&path)?;
            }
        }

        let retarget = meta
            .link_name
            .as_deref()
            .filter(|link| meta.kind.is_hard_link() && whiteout::links_into_aufs(link))
            .map(|link| link.to_path_buf());

        if let Some(link) = retarget {
            // The link points into the AUFS staging tree, which never lands
            // at the destination; rewrite it as a regular file from the
            // staged content.
            let basename = link.file_name().ok_or_else(|| {
                UnlayerError::InvalidHardlink(link.to_string_lossy().into_owned())
            })?;
            let (staged_meta, mut staged_file) = staging.resolve(basename)?;
            meta = staged_meta;
            meta.kind = tar::EntryType::Regular;
            mapper.remap(&mut meta, options.get_chown_override().as_ref())?;
            create_entry(&path, dest, &meta, &mut staged_file, options)?;
        } else {
            mapper.remap(&mut meta, options.get_chown_override().as_ref())?;
            create_entry(&path, dest, &meta, &mut entry, options)?;
        }

        if meta.kind.is_dir() {
            pending_dirs.push((path.clone(), meta.clone()));
        }
        unpacked.insert(path);
    }

    finalize_dirs(&pending_dirs)?;

    Ok(size)
}

/// Creates a directory (and its ancestors) if nothing exists there yet.
fn ensure_dir(dir: &Path) -> UnlayerResult<()> {
    if fs::symlink_metadata(dir).is_err() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|e| UnlayerError::entry(e, dir.display()))?;
    }

    Ok(())
}

/// Re-applies directory timestamps (and persisted flags) after all children
/// have been written; every write into a directory bumps its mtime.
fn finalize_dirs(pending_dirs: &[(PathBuf, EntryMeta)]) -> UnlayerResult<()> {
    for (path, meta) in pending_dirs {
        let mtime = FileTime::from_unix_time(meta.mtime, 0);
        let atime = FileTime::from_unix_time(meta.atime.unwrap_or(meta.mtime), 0);
        filetime::set_file_times(path, atime, mtime)
            .map_err(|e| UnlayerError::entry(e, path.display()))?;
        flags::write_flags(path, meta.fflags.as_deref())?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
