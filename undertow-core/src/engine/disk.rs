//! Free-space probing for the low-storage guard.

use std::path::Path;

use sysinfo::Disks;

/// Reports free bytes on the disk holding a path.
pub trait DiskSpace: Send + Sync {
    /// `None` when the disk cannot be determined.
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// Queries mounted disks through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let target = existing_ancestor(path);
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Closest existing ancestor, canonicalized when possible.
fn existing_ancestor(path: &Path) -> std::path::PathBuf {
    let mut current = path;
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return canonical;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return path.to_path_buf(),
        }
    }
}

/// Fixed answer, for tests and hosts without disk information.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub Option<u64>);

impl DiskSpace for FixedDiskSpace {
    fn free_space(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_ancestor_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("a/b/c");
        let resolved = existing_ancestor(&missing);
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_fixed_disk_space() {
        assert_eq!(FixedDiskSpace(Some(5)).free_space(Path::new("/")), Some(5));
        assert_eq!(FixedDiskSpace(None).free_space(Path::new("/")), None);
    }
}
