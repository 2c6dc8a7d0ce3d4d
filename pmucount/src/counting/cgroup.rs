//! Cgroup name resolution
//!
//! On cgroup v2 the id the kernel reports for a cgroup (`kn->id`, and the
//! entries of `ancestor_ids`) is the inode number of its directory.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::domain::{CgroupId, CountingError};

/// Fail unless `root` is a cgroup v2 mount
///
/// # Errors
/// [`CountingError::NotCgroupV2`].
pub fn check_cgroup_v2(root: &Path) -> Result<(), CountingError> {
    if root.join("cgroup.controllers").is_file() {
        Ok(())
    } else {
        Err(CountingError::NotCgroupV2(root.to_path_buf()))
    }
}

/// Directory of cgroup `name` under `root`; `""` and `"/"` are the root
pub fn cgroup_path(root: &Path, name: &str) -> PathBuf {
    let relative = name.trim().trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Resolve `name` to the id the kernel uses for it
///
/// # Errors
/// [`CountingError::NotCgroupV2`], [`CountingError::CgroupNotFound`] or I/O.
pub fn resolve_cgroup(root: &Path, name: &str) -> Result<CgroupId, CountingError> {
    check_cgroup_v2(root)?;
    let path = cgroup_path(root, name);
    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CountingError::CgroupNotFound(path));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(CountingError::CgroupNotFound(path));
    }
    Ok(CgroupId(meta.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_mount() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory perf_event\n").unwrap();
        fs::create_dir_all(dir.path().join("g1/g2")).unwrap();
        dir
    }

    #[test]
    fn test_id_is_directory_inode() {
        let mount = fake_mount();
        let expected = fs::metadata(mount.path().join("g1/g2")).unwrap().ino();

        assert_eq!(resolve_cgroup(mount.path(), "g1/g2").unwrap(), CgroupId(expected));
        assert_eq!(resolve_cgroup(mount.path(), "/g1/g2").unwrap(), CgroupId(expected));
    }

    #[test]
    fn test_root_names() {
        let mount = fake_mount();
        let root = fs::metadata(mount.path()).unwrap().ino();
        assert_eq!(resolve_cgroup(mount.path(), "/").unwrap(), CgroupId(root));
        assert_eq!(resolve_cgroup(mount.path(), "").unwrap(), CgroupId(root));
    }

    #[test]
    fn test_missing_cgroup() {
        let mount = fake_mount();
        assert!(matches!(
            resolve_cgroup(mount.path(), "nope"),
            Err(CountingError::CgroupNotFound(p)) if p.ends_with("nope")
        ));
        assert!(matches!(
            resolve_cgroup(mount.path(), "cgroup.controllers"),
            Err(CountingError::CgroupNotFound(_))
        ));
    }

    #[test]
    fn test_v1_mount_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(resolve_cgroup(dir.path(), "x"), Err(CountingError::NotCgroupV2(_))));
    }
}
