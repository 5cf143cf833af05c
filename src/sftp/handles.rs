//! The per-session handle registry.
//!
//! Handles are opaque strings of the form `f:<n>` or `d:<n>` over a
//! session-local counter; they carry no process memory and mean nothing
//! outside the session that issued them. Directory handles hold the entry
//! snapshot taken at OPENDIR time plus a cursor, which is what makes
//! READDIR monotone and terminating.

use std::collections::HashMap;
use std::path::PathBuf;

/// An open file with the context its operations are logged under.
#[derive(Debug)]
pub struct FileHandle {
    pub file: tokio::fs::File,
    pub virtual_path: String,
    pub local_path: PathBuf,
    /// Opened with APPEND: client offsets are ignored and writes go to the
    /// end.
    pub append: bool,
}

/// A directory iterator: snapshot at open, cursor advanced by READDIR.
#[derive(Debug)]
pub struct DirHandle {
    pub virtual_path: String,
    pub local_path: PathBuf,
    pub entries: Vec<String>,
    pub cursor: usize,
}

/// All handles of one session. Owned exclusively by the session's handler;
/// dropping the map closes every descriptor.
#[derive(Debug, Default)]
pub struct HandleMap {
    files: HashMap<u64, FileHandle>,
    dirs: HashMap<u64, DirHandle>,
    next_id: u64,
    opened: u64,
    closed: u64,
}

impl HandleMap {
    pub fn new() -> HandleMap {
        HandleMap::default()
    }

    pub fn insert_file(&mut self, handle: FileHandle) -> String {
        self.next_id += 1;
        self.opened += 1;
        self.files.insert(self.next_id, handle);
        format!("f:{}", self.next_id)
    }

    pub fn insert_dir(&mut self, handle: DirHandle) -> String {
        self.next_id += 1;
        self.opened += 1;
        self.dirs.insert(self.next_id, handle);
        format!("d:{}", self.next_id)
    }

    pub fn file_mut(&mut self, handle: &str) -> Option<&mut FileHandle> {
        match parse(handle)? {
            (Kind::File, id) => self.files.get_mut(&id),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self, handle: &str) -> Option<&mut DirHandle> {
        match parse(handle)? {
            (Kind::Dir, id) => self.dirs.get_mut(&id),
            _ => None,
        }
    }

    /// Close a handle of either kind. Returns whether it existed.
    pub fn close(&mut self, handle: &str) -> bool {
        let existed = match parse(handle) {
            Some((Kind::File, id)) => self.files.remove(&id).is_some(),
            Some((Kind::Dir, id)) => self.dirs.remove(&id).is_some(),
            None => false,
        };
        if existed {
            self.closed += 1;
        }
        existed
    }

    /// Drop everything still open, counting the releases as closes.
    pub fn release_all(&mut self) {
        self.closed += (self.files.len() + self.dirs.len()) as u64;
        self.files.clear();
        self.dirs.clear();
    }

    pub fn open_count(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// Lifetime counters; at session close these must agree.
    pub fn totals(&self) -> (u64, u64) {
        (self.opened, self.closed)
    }
}

enum Kind {
    File,
    Dir,
}

fn parse(handle: &str) -> Option<(Kind, u64)> {
    let (prefix, id) = handle.split_at_checked(2)?;
    let id: u64 = id.parse().ok()?;
    match prefix {
        "f:" => Some((Kind::File, id)),
        "d:" => Some((Kind::Dir, id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn handle_lifecycle_is_balanced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"hi").unwrap();

        let mut map = HandleMap::new();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let fh = map.insert_file(FileHandle {
            file,
            virtual_path: "/x".to_string(),
            local_path: path.clone(),
            append: false,
        });
        let dh = map.insert_dir(DirHandle {
            virtual_path: "/".to_string(),
            local_path: dir.path().to_path_buf(),
            entries: vec!["x".to_string()],
            cursor: 0,
        });
        assert!(fh.starts_with("f:"));
        assert!(dh.starts_with("d:"));
        assert_eq!(map.open_count(), 2);
        assert!(map.file_mut(&fh).is_some());
        assert!(map.dir_mut(&dh).is_some());
        // A file handle is not addressable as a directory.
        assert!(map.dir_mut(&fh).is_none());

        assert!(map.close(&fh));
        assert!(!map.close(&fh));
        map.release_all();
        let (opened, closed) = map.totals();
        assert_eq!(opened, closed);
        assert_eq!(map.open_count(), 0);
    }

    #[test]
    fn foreign_handles_do_not_resolve() {
        let mut map = HandleMap::new();
        assert!(map.file_mut("f:7").is_none());
        assert!(map.close("nonsense") == false);
        assert!(map.close("f:abc") == false);
    }
}
