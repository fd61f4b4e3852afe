//! In-memory mock filesystem for testing without a real `/proc`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::collector::traits::FileSystem;

/// In-memory filesystem for testing.
///
/// Stores files, directories and symlinks in memory, allowing tests to
/// simulate various `/proc` states without actual Linux access.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Map from path to symlink target.
    symlinks: HashMap<PathBuf, PathBuf>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Adds a symlink resolving to `target`.
    pub fn add_symlink(&mut self, path: impl AsRef<Path>, target: impl Into<PathBuf>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.symlinks.insert(path, target.into());
    }

    /// Removes a process directory and everything under it, simulating a
    /// process that exited between sampling ticks.
    pub fn remove_tree(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.files.retain(|p, _| !p.starts_with(path));
        self.symlinks.retain(|p, _| !p.starts_with(path));
        self.directories.retain(|p| !p.starts_with(path));
    }

    /// Adds `/proc/<pid>/stat` (and the exe symlink, if given) for a
    /// synthetic process.
    #[allow(clippy::too_many_arguments)]
    pub fn add_process(
        &mut self,
        pid: i32,
        comm: &str,
        ppid: i32,
        utime: u64,
        stime: u64,
        starttime: u64,
        vsize: u64,
        rss: i64,
        exe: Option<&str>,
    ) {
        let base = PathBuf::from(format!("/proc/{}", pid));
        self.add_dir(&base);
        self.add_file(
            base.join("stat"),
            format!(
                "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194304 0 0 0 0 \
                 {utime} {stime} 0 0 20 0 1 0 {starttime} {vsize} {rss} \
                 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0"
            ),
        );
        if let Some(exe) = exe {
            self.add_symlink(base.join("exe"), exe);
        }
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
            || self.directories.contains(path)
            || self.symlinks.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();

        for file_path in self.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }
        for dir_path in &self.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }
        for link_path in self.symlinks.keys() {
            if link_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(link_path.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.symlinks.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("symlink not found: {:?}", path),
            )
        })
    }
}

/// Clonable handle over a [`MockFs`] with interior mutability.
///
/// Lets a test hand one side to a `SnapshotSource` while mutating the fake
/// `/proc` from the other between sampling ticks.
#[derive(Debug, Clone, Default)]
pub struct SharedFs(Arc<RwLock<MockFs>>);

impl SharedFs {
    pub fn new(fs: MockFs) -> Self {
        Self(Arc::new(RwLock::new(fs)))
    }

    /// Mutates the underlying filesystem.
    pub fn update(&self, f: impl FnOnce(&mut MockFs)) {
        let mut guard = self.0.write().expect("mock filesystem lock");
        f(&mut guard);
    }

    fn read<R>(&self, f: impl FnOnce(&MockFs) -> R) -> R {
        f(&self.0.read().expect("mock filesystem lock"))
    }
}

impl FileSystem for SharedFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.read(|fs| fs.read_to_string(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.read(|fs| fs.exists(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.read(|fs| fs.read_dir(path))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.read(|fs| fs.read_link(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_files_and_dirs() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/1/stat", "1 (init) S 0");
        assert!(fs.exists(Path::new("/proc/1/stat")));
        assert!(fs.exists(Path::new("/proc/1")));
        assert!(fs.exists(Path::new("/proc")));
        assert_eq!(fs.read_to_string(Path::new("/proc/1/stat")).unwrap(), "1 (init) S 0");
        assert!(fs.read_to_string(Path::new("/proc/2/stat")).is_err());
    }

    #[test]
    fn test_mock_fs_read_dir() {
        let mut fs = MockFs::new();
        fs.add_process(1, "init", 0, 0, 0, 1, 1000, 10, None);
        fs.add_process(100, "sh", 1, 0, 0, 500, 2000, 20, None);
        let entries = fs.read_dir(Path::new("/proc")).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_mock_fs_symlink() {
        let mut fs = MockFs::new();
        fs.add_symlink("/proc/1/exe", "/sbin/init");
        assert_eq!(
            fs.read_link(Path::new("/proc/1/exe")).unwrap(),
            PathBuf::from("/sbin/init")
        );
        assert!(fs.read_link(Path::new("/proc/2/exe")).is_err());
    }

    #[test]
    fn test_remove_tree() {
        let mut fs = MockFs::new();
        fs.add_process(100, "sh", 1, 0, 0, 500, 2000, 20, Some("/bin/sh"));
        fs.remove_tree("/proc/100");
        assert!(!fs.exists(Path::new("/proc/100/stat")));
        assert!(fs.read_dir(Path::new("/proc")).unwrap().is_empty());
    }

    #[test]
    fn test_shared_fs_update_visible_to_clones() {
        let shared = SharedFs::new(MockFs::new());
        let other = shared.clone();
        shared.update(|fs| fs.add_file("/proc/stat", "btime 1700000000\n"));
        assert!(other.exists(Path::new("/proc/stat")));
    }
}
