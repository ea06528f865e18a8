use std::path::Path;

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::idmap::{ChownOverride, IdMap};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Platform policy deciding which entry names are silently skipped.
///
/// The policy is chosen once (normally via [`platform_default`]) and injected
/// through [`UnpackOptions`], so the unpack loop itself stays
/// platform-parametric and both behaviors are testable on any host.
///
/// [`platform_default`]: EntryNameFilter::platform_default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryNameFilter {
    /// Accept every entry name.
    AcceptAll,

    /// Skip names containing a colon, which the target filesystem cannot
    /// represent. Linux image layers routinely contain such names (e.g.
    /// under `/usr/share/man`), so this is a warn-and-skip, not an error.
    SkipColonNames,
}

/// Configuration for a layer unpack operation.
#[derive(Debug, Clone, Default, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct UnpackOptions {
    /// UID mapping ranges for user-namespace translation.
    #[builder(default)]
    uid_maps: Vec<IdMap>,

    /// GID mapping ranges for user-namespace translation.
    #[builder(default)]
    gid_maps: Vec<IdMap>,

    /// Explicit owner override applied to every entry, bypassing the maps.
    #[builder(default)]
    chown_override: Option<ChownOverride>,

    /// Ignore ownership-set failures instead of aborting the unpack.
    #[builder(default)]
    ignore_chown_errors: bool,

    /// Whether the process runs inside a user namespace. Device nodes cannot
    /// be created there and are skipped.
    #[builder(default)]
    in_user_ns: bool,

    /// Permission bits forced onto every materialized entry, overriding the
    /// modes declared in the archive.
    #[builder(default)]
    force_mode: Option<u32>,

    /// Entry name policy for the target platform.
    #[builder(default = EntryNameFilter::platform_default())]
    name_filter: EntryNameFilter,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EntryNameFilter {
    /// The policy appropriate for the platform this binary targets.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            EntryNameFilter::SkipColonNames
        } else {
            EntryNameFilter::AcceptAll
        }
    }

    /// Whether an entry with this (cleaned) name should be skipped.
    pub fn should_skip(&self, name: &Path) -> bool {
        match self {
            EntryNameFilter::AcceptAll => false,
            EntryNameFilter::SkipColonNames => name.to_string_lossy().contains(':'),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for EntryNameFilter {
    fn default() -> Self {
        Self::platform_default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_name_filter() {
        let accept = EntryNameFilter::AcceptAll;
        assert!(!accept.should_skip(Path::new("usr/share/man/man3/a::b.3.gz")));

        let skip = EntryNameFilter::SkipColonNames;
        assert!(skip.should_skip(Path::new("usr/share/man/man3/a::b.3.gz")));
        assert!(!skip.should_skip(Path::new("usr/bin/ls")));
    }

    #[test]
    fn test_options_builder_defaults() {
        let options = UnpackOptions::builder().build();
        assert!(options.get_uid_maps().is_empty());
        assert!(options.get_gid_maps().is_empty());
        assert!(options.get_chown_override().is_none());
        assert!(!options.get_ignore_chown_errors());
        assert!(!options.get_in_user_ns());
        assert!(options.get_force_mode().is_none());
    }
}
