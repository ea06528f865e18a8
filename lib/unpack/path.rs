use std::path::{Component, Path, PathBuf};

use crate::{UnlayerError, UnlayerResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Lexically normalizes a path: collapses `.` segments and resolves `..`
/// against preceding components.
///
/// Unresolvable `..` segments are kept at the front for relative paths and
/// dropped for absolute ones (there is nothing above the root). An empty
/// result becomes `.`, so cleaned names are never empty.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push(component);
                }
            }
            Component::Normal(_) => out.push(component),
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Normalizes an archive entry name and joins it under the destination root,
/// proving the result cannot escape the root.
///
/// Absolute names are interpreted relative to the root (a layer entry
/// `/etc/passwd` lands at `root/etc/passwd`). A name whose normalized form
/// still begins with a parent-directory segment escapes the root and fails
/// with [`Breakout`](UnlayerError::Breakout) — fatal for the whole unpack,
/// since a traversal attempt means the archive is hostile or corrupt.
pub fn secure_join(root: &Path, name: &Path) -> UnlayerResult<PathBuf> {
    let cleaned = clean(name);

    let mut joined = root.to_path_buf();
    for component in cleaned.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(UnlayerError::Breakout {
                    name: name.display().to_string(),
                    dest: root.display().to_string(),
                });
            }
            Component::Normal(part) => joined.push(part),
        }
    }

    Ok(joined)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnlayerError;

    #[test]
    fn test_path_clean() {
        assert_eq!(clean(Path::new("a/b/../c")), PathBuf::from("a/c"));
        assert_eq!(clean(Path::new("./a/./b/")), PathBuf::from("a/b"));
        assert_eq!(clean(Path::new("a/../..")), PathBuf::from(".."));
        assert_eq!(clean(Path::new("../../x")), PathBuf::from("../../x"));
        assert_eq!(clean(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(clean(Path::new("")), PathBuf::from("."));
        assert_eq!(clean(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn test_path_secure_join_stays_within_root() -> anyhow::Result<()> {
        let root = Path::new("/dest");

        assert_eq!(
            secure_join(root, Path::new("usr/bin/ls"))?,
            PathBuf::from("/dest/usr/bin/ls")
        );
        // Internal `..` that still resolves inside the root is fine.
        assert_eq!(
            secure_join(root, Path::new("usr/../etc/passwd"))?,
            PathBuf::from("/dest/etc/passwd")
        );
        // Absolute names are relative to the root.
        assert_eq!(
            secure_join(root, Path::new("/etc/passwd"))?,
            PathBuf::from("/dest/etc/passwd")
        );
        // The root entry itself.
        assert_eq!(secure_join(root, Path::new("."))?, PathBuf::from("/dest"));

        Ok(())
    }

    #[test]
    fn test_path_secure_join_rejects_escape() {
        let root = Path::new("/dest");

        for hostile in ["../../etc/passwd", "..", "a/../../x", "a/b/../../../x"] {
            let result = secure_join(root, Path::new(hostile));
            assert!(
                matches!(result, Err(UnlayerError::Breakout { .. })),
                "{:?} must be rejected",
                hostile
            );
        }
    }
}
