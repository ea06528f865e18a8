use std::{
    collections::HashSet,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{flags, utils, UnlayerResult};

use super::path::clean;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix flagging a whiteout file: `.wh.name` deletes sibling `name`.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of AUFS bookkeeping entries that are never materialized directly.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Reserved directory under which AUFS stages the real targets of hardlinks
/// appearing elsewhere in the same layer.
pub const WHITEOUT_LINK_DIR: &str = ".wh..wh.plnk";

/// Base name of the opaque-directory marker: all pre-existing contents of the
/// containing directory are hidden by this layer.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The filesystem action an entry name calls for, per the reserved whiteout
/// marker conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhiteoutKind {
    /// An ordinary entry; proceed to replace/merge materialization.
    None,

    /// A regular file inside the AUFS hardlink-resolution directory: capture
    /// it into the staging area, do not materialize it at the destination.
    AufsLinkSource {
        /// Base name the staged file is keyed by.
        basename: OsString,
    },

    /// AUFS bookkeeping (the link directory itself, or a non-regular entry
    /// inside the metadata tree): skip entirely.
    AufsMetadata,

    /// Opaque-directory marker: delete all pre-existing children of the
    /// marker's parent directory.
    Opaque,

    /// Single whiteout: delete the one sibling named by the suffix.
    Single {
        /// Name of the sibling hidden by this layer.
        hidden: OsString,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Classifies a cleaned entry name against the reserved marker prefixes.
///
/// `is_regular` distinguishes stageable files from bookkeeping inside the
/// AUFS metadata tree.
pub fn classify(name: &Path, is_regular: bool) -> WhiteoutKind {
    let name_str = name.to_string_lossy();

    if name_str.starts_with(WHITEOUT_META_PREFIX) {
        // A lone opaque marker at the layer root is still a real opaque
        // marker, not bookkeeping.
        if name_str == WHITEOUT_OPAQUE_DIR {
            return WhiteoutKind::Opaque;
        }
        if is_regular && Path::new(&*name_str).starts_with(WHITEOUT_LINK_DIR) {
            if let Some(basename) = name.file_name() {
                return WhiteoutKind::AufsLinkSource {
                    basename: basename.to_os_string(),
                };
            }
        }
        return WhiteoutKind::AufsMetadata;
    }

    let Some(base) = name.file_name() else {
        return WhiteoutKind::None;
    };
    let base_str = base.to_string_lossy();

    if base_str == WHITEOUT_OPAQUE_DIR {
        WhiteoutKind::Opaque
    } else if let Some(hidden) = base_str.strip_prefix(WHITEOUT_PREFIX) {
        WhiteoutKind::Single {
            hidden: OsString::from(hidden),
        }
    } else {
        WhiteoutKind::None
    }
}

/// Whether a hardlink target points into the AUFS hardlink-resolution
/// directory and must be retargeted to staged content.
pub fn links_into_aufs(link_name: &Path) -> bool {
    clean(link_name).starts_with(WHITEOUT_LINK_DIR)
}

/// Applies an opaque-directory marker: recursively removes every child of
/// `dir` that was not materialized earlier in the current run.
///
/// Children recorded in `unpacked` came from this same layer and survive.
/// A missing `dir` (or a child vanishing mid-walk) is tolerated: an earlier
/// entry in the stream already deleted it.
pub fn remove_opaque_children(dir: &Path, unpacked: &HashSet<PathBuf>) -> UnlayerResult<()> {
    let mut walker = WalkDir::new(dir).min_depth(1).into_iter();

    while let Some(item) = walker.next() {
        let item = match item {
            Result::Ok(item) => item,
            Err(e) if is_not_found(&e) => continue,
            Err(e) => {
                return Err(e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed"))
                    .into())
            }
        };

        if unpacked.contains(item.path()) {
            continue;
        }

        flags::reset_immutable(item.path(), None)?;
        utils::remove_all_if_exists(item.path())?;
        if item.file_type().is_dir() {
            // The subtree is gone; do not try to descend into it.
            walker.skip_current_dir();
        }
    }

    Ok(())
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .map(|io| io.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
