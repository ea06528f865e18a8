use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs::File,
    io::Read,
    path::Path,
};

use tempfile::TempDir;

use crate::{UnlayerError, UnlayerResult};

use super::{
    entry::{create_entry, EntryMeta},
    options::UnpackOptions,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Scratch area for AUFS hardlink resolution.
///
/// AUFS layers stage the real content of multiply-linked files under the
/// reserved `.wh..wh.plnk` directory; later entries in the same stream are
/// hardlinks pointing into it. Staged files are materialized into a private
/// temporary directory (never the destination) and retargeted hardlinks are
/// rewritten from there as plain files.
///
/// The scratch directory is created lazily, on the first staged file, and
/// removed on drop. Most layers never pay for it.
#[derive(Debug, Default)]
pub struct AufsStaging {
    scratch: Option<TempDir>,
    sources: HashMap<OsString, EntryMeta>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AufsStaging {
    /// Creates an empty staging area. No filesystem state is touched until
    /// the first [`stage`](Self::stage) call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages one link-source entry: materializes its content into the
    /// scratch directory and records its metadata under `basename`.
    pub fn stage(
        &mut self,
        basename: &OsStr,
        meta: &EntryMeta,
        data: &mut dyn Read,
        options: &UnpackOptions,
    ) -> UnlayerResult<()> {
        let scratch = self.ensure_scratch()?;
        let staged_path = scratch.join(basename);
        create_entry(&staged_path, scratch, meta, data, options)?;
        self.sources.insert(basename.to_os_string(), meta.clone());
        Ok(())
    }

    /// Resolves a hardlink pointing into the staging area: returns the
    /// recorded metadata and an open handle on the staged content.
    ///
    /// A miss means the stream referenced a link source it never staged,
    /// which makes the layer invalid.
    pub fn resolve(&self, basename: &OsStr) -> UnlayerResult<(EntryMeta, File)> {
        let meta = self.sources.get(basename).ok_or_else(|| {
            UnlayerError::InvalidHardlink(basename.to_string_lossy().into_owned())
        })?;

        let scratch = self.scratch.as_ref().ok_or_else(|| {
            UnlayerError::InvalidHardlink(basename.to_string_lossy().into_owned())
        })?;

        let file = File::open(scratch.path().join(basename))
            .map_err(|e| UnlayerError::entry(e, basename.to_string_lossy()))?;
        Ok((meta.clone(), file))
    }

    fn ensure_scratch(&mut self) -> UnlayerResult<&Path> {
        if self.scratch.is_none() {
            let dir = tempfile::Builder::new().prefix("unlayer-plnk").tempdir()?;
            self.scratch = Some(dir);
        }

        Ok(self
            .scratch
            .as_ref()
            .map(|dir| dir.path())
            .unwrap_or_else(|| Path::new("")))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use nix::unistd::{getegid, geteuid};

    use super::*;

    fn staged_meta() -> EntryMeta {
        let mut meta = EntryMeta::default();
        meta.uid = geteuid().as_raw();
        meta.gid = getegid().as_raw();
        meta.mode = 0o600;
        meta.mtime = 1_700_000_000;
        meta
    }

    #[test]
    fn test_aufs_stage_and_resolve() -> anyhow::Result<()> {
        let mut staging = AufsStaging::new();
        let options = UnpackOptions::default();
        let meta = staged_meta();

        staging.stage(
            OsStr::new("42.1234"),
            &meta,
            &mut Cursor::new(b"linked content".to_vec()),
            &options,
        )?;

        let (resolved, mut file) = staging.resolve(OsStr::new("42.1234"))?;
        assert_eq!(resolved.mode, 0o600);
        assert_eq!(resolved.mtime, 1_700_000_000);

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        assert_eq!(content, b"linked content");

        Ok(())
    }

    #[test]
    fn test_aufs_resolve_names_missing_staged_file() -> anyhow::Result<()> {
        let mut staging = AufsStaging::new();
        let options = UnpackOptions::default();
        let meta = staged_meta();

        staging.stage(
            OsStr::new("7.42"),
            &meta,
            &mut Cursor::new(b"x".to_vec()),
            &options,
        )?;

        // Metadata is recorded but the staged content is gone; the error
        // must name the offending link source.
        let scratch = staging.scratch.as_ref().expect("scratch dir missing");
        std::fs::remove_file(scratch.path().join("7.42"))?;

        let result = staging.resolve(OsStr::new("7.42"));
        match result {
            Err(UnlayerError::EntryHandling { path, .. }) => assert_eq!(path, "7.42"),
            other => panic!("expected entry handling error, got {:?}", other.map(|_| ())),
        }

        Ok(())
    }

    #[test]
    fn test_aufs_resolve_unstaged_is_invalid() {
        let staging = AufsStaging::new();
        let result = staging.resolve(OsStr::new("99.9999"));
        assert!(matches!(result, Err(UnlayerError::InvalidHardlink(_))));
    }

    #[test]
    fn test_aufs_scratch_is_lazy() {
        let staging = AufsStaging::new();
        assert!(staging.scratch.is_none());
    }
}
