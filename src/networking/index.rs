use anyhow::{Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A shared file name bound to the address of the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndexEntry {
    pub name: String,
    pub owner: IpAddr,
}

/// Mapping of shared file names to their owner address.
///
/// Entries come only from scanning this node's own shared directory, so the
/// owner is always the local address passed at construction. Refreshing is
/// additive: a name stays indexed even after the file behind it is deleted.
#[derive(Clone)]
pub struct FileIndex {
    shared_dir: PathBuf,
    local_addr: IpAddr,
    entries: Arc<Mutex<HashMap<String, FileIndexEntry>>>,
}

impl FileIndex {
    pub fn new(shared_dir: impl Into<PathBuf>, local_addr: IpAddr) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            local_addr,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enumerate the shared directory and index every name not seen before.
    /// Returns how many names were newly indexed.
    pub fn refresh(&self) -> Result<usize> {
        let dir = fs::read_dir(&self.shared_dir).with_context(|| {
            format!(
                "failed to read shared directory {}",
                self.shared_dir.display()
            )
        })?;

        let mut added = 0;
        let mut entries = self.entries.lock().unwrap();
        for item in dir {
            let item = item.with_context(|| {
                format!("failed to list {}", self.shared_dir.display())
            })?;
            let name = item.file_name().to_string_lossy().into_owned();
            if !entries.contains_key(&name) {
                entries.insert(
                    name.clone(),
                    FileIndexEntry {
                        name,
                        owner: self.local_addr,
                    },
                );
                added += 1;
            }
        }

        if added > 0 {
            debug!(
                "indexed {} new file(s) from {}",
                added,
                self.shared_dir.display()
            );
        }
        Ok(added)
    }

    /// The entry for a name, or None when the name is not indexed.
    pub fn lookup(&self, name: &str) -> Option<FileIndexEntry> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    /// Sorted copy of the indexed file names.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    const OWNER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn refresh_maps_every_name_to_local_address() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let index = FileIndex::new(dir.path().to_path_buf(), OWNER);
        assert_eq!(index.refresh().unwrap(), 2);

        assert_eq!(index.lookup("a.txt").unwrap().owner, OWNER);
        assert_eq!(index.lookup("b.txt").unwrap().owner, OWNER);
        assert_eq!(index.file_names(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn refresh_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let index = FileIndex::new(dir.path().to_path_buf(), OWNER);
        assert_eq!(index.refresh().unwrap(), 1);
        assert_eq!(index.refresh().unwrap(), 0);
        assert_eq!(index.file_names(), vec!["a.txt"]);
    }

    #[test]
    fn refresh_never_removes_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("gone.txt"), b"x").unwrap();

        let index = FileIndex::new(dir.path().to_path_buf(), OWNER);
        index.refresh().unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();

        assert_eq!(index.refresh().unwrap(), 0);
        // the stale entry stays
        assert!(index.lookup("gone.txt").is_some());
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let dir = tempdir().unwrap();
        let index = FileIndex::new(dir.path().to_path_buf(), OWNER);
        index.refresh().unwrap();
        assert!(index.lookup("ghost.txt").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn refresh_of_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let index = FileIndex::new(dir.path().join("nope"), OWNER);
        assert!(index.refresh().is_err());
    }
}
