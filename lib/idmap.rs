//! UID/GID range mapping for isolated id namespaces.
//!
//! Archive entries declare in-container owner ids. When unpacking for a user
//! namespace, those ids must be translated into host ids through declared
//! `(container range -> host range)` pairs before materialization.

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{unpack::EntryMeta, UnlayerError, UnlayerResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One contiguous `(container id range -> host id range)` mapping pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct IdMap {
    /// First id of the range as seen inside the container/archive.
    pub container_id: u32,

    /// First id of the range on the host.
    pub host_id: u32,

    /// Number of ids in the range.
    pub size: u32,
}

/// An explicit owner override applied to every entry unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChownOverride {
    /// Host uid to assign.
    pub uid: u32,

    /// Host gid to assign.
    pub gid: u32,
}

/// Translates entry owner/group ids according to configured mapping tables.
///
/// An empty table means identity passthrough. A non-empty table that does not
/// cover an id is a configuration error: silently leaking an unmapped id onto
/// the host would defeat the namespace isolation the mapping exists for.
#[derive(Debug, Clone, Default, Getters)]
#[getset(get = "pub with_prefix")]
pub struct IdMapper {
    /// UID mapping ranges, ordered as declared.
    uid_ranges: Vec<IdMap>,

    /// GID mapping ranges, ordered as declared.
    gid_ranges: Vec<IdMap>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IdMapper {
    /// Creates a mapper from declared uid and gid ranges, validating them.
    ///
    /// # Errors
    /// Returns [`IdMapping`](UnlayerError::IdMapping) if any range is empty
    /// or two container ranges overlap. Validation happens here, before any
    /// archive entry is processed.
    pub fn new(uid_ranges: Vec<IdMap>, gid_ranges: Vec<IdMap>) -> UnlayerResult<Self> {
        validate_ranges("uid", &uid_ranges)?;
        validate_ranges("gid", &gid_ranges)?;
        Ok(Self {
            uid_ranges,
            gid_ranges,
        })
    }

    /// Whether both tables are empty (pure identity passthrough).
    pub fn is_empty(&self) -> bool {
        self.uid_ranges.is_empty() && self.gid_ranges.is_empty()
    }

    /// Rewrites an entry's owner/group in place.
    ///
    /// When `chown_override` is supplied it wins unconditionally; otherwise
    /// the entry's declared ids are translated through the mapping tables.
    pub fn remap(
        &self,
        meta: &mut EntryMeta,
        chown_override: Option<&ChownOverride>,
    ) -> UnlayerResult<()> {
        if let Some(chown) = chown_override {
            meta.uid = chown.uid;
            meta.gid = chown.gid;
            return Ok(());
        }

        meta.uid = to_host("uid", &self.uid_ranges, meta.uid)?;
        meta.gid = to_host("gid", &self.gid_ranges, meta.gid)?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn validate_ranges(kind: &str, ranges: &[IdMap]) -> UnlayerResult<()> {
    for (i, range) in ranges.iter().enumerate() {
        if range.size == 0 {
            return Err(UnlayerError::IdMapping(format!(
                "{} range starting at {} has zero size",
                kind, range.container_id
            )));
        }
        for other in &ranges[i + 1..] {
            let end = range.container_id as u64 + range.size as u64;
            let other_end = other.container_id as u64 + other.size as u64;
            if (range.container_id as u64) < other_end && (other.container_id as u64) < end {
                return Err(UnlayerError::IdMapping(format!(
                    "{} ranges starting at {} and {} overlap",
                    kind, range.container_id, other.container_id
                )));
            }
        }
    }
    Ok(())
}

fn to_host(kind: &str, ranges: &[IdMap], id: u32) -> UnlayerResult<u32> {
    if ranges.is_empty() {
        return Ok(id);
    }

    for range in ranges {
        let offset = id.wrapping_sub(range.container_id);
        if id >= range.container_id && offset < range.size {
            return Ok(range.host_id + offset);
        }
    }

    Err(UnlayerError::IdMapping(format!(
        "no {} mapping covers id {}",
        kind, id
    )))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unpack::EntryMeta;

    fn meta_with_ids(uid: u32, gid: u32) -> EntryMeta {
        let mut meta = EntryMeta::default();
        meta.uid = uid;
        meta.gid = gid;
        meta
    }

    #[test]
    fn test_idmap_empty_is_identity() -> anyhow::Result<()> {
        let mapper = IdMapper::new(vec![], vec![])?;
        assert!(mapper.is_empty());

        let mut meta = meta_with_ids(1000, 1000);
        mapper.remap(&mut meta, None)?;
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 1000);

        Ok(())
    }

    #[test]
    fn test_idmap_range_translation() -> anyhow::Result<()> {
        let mapper = IdMapper::new(
            vec![IdMap::builder()
                .container_id(0)
                .host_id(100_000)
                .size(65_536)
                .build()],
            vec![IdMap::builder()
                .container_id(0)
                .host_id(200_000)
                .size(65_536)
                .build()],
        )?;

        let mut meta = meta_with_ids(33, 7);
        mapper.remap(&mut meta, None)?;
        assert_eq!(meta.uid, 100_033);
        assert_eq!(meta.gid, 200_007);

        Ok(())
    }

    #[test]
    fn test_idmap_uncovered_id_is_error() -> anyhow::Result<()> {
        let mapper = IdMapper::new(
            vec![IdMap::builder().container_id(0).host_id(1000).size(10).build()],
            vec![],
        )?;

        let mut meta = meta_with_ids(99, 0);
        let result = mapper.remap(&mut meta, None);
        assert!(matches!(result, Err(UnlayerError::IdMapping(_))));

        Ok(())
    }

    #[test]
    fn test_idmap_override_wins() -> anyhow::Result<()> {
        let mapper = IdMapper::new(
            vec![IdMap::builder().container_id(0).host_id(1000).size(10).build()],
            vec![],
        )?;

        // Id 99 is not covered, but the override bypasses the tables.
        let mut meta = meta_with_ids(99, 99);
        mapper.remap(&mut meta, Some(&ChownOverride { uid: 5, gid: 6 }))?;
        assert_eq!(meta.uid, 5);
        assert_eq!(meta.gid, 6);

        Ok(())
    }

    #[test]
    fn test_idmap_invalid_ranges_rejected() {
        let zero = IdMapper::new(
            vec![IdMap::builder().container_id(0).host_id(0).size(0).build()],
            vec![],
        );
        assert!(matches!(zero, Err(UnlayerError::IdMapping(_))));

        let overlapping = IdMapper::new(
            vec![
                IdMap::builder().container_id(0).host_id(1000).size(100).build(),
                IdMap::builder().container_id(50).host_id(5000).size(100).build(),
            ],
            vec![],
        );
        assert!(matches!(overlapping, Err(UnlayerError::IdMapping(_))));
    }
}
