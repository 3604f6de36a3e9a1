//! Inode numbers for paths.
//!
//! The namespace is addressed by path; the kernel addresses it by inode.
//! Numbers are handed out on first lookup and dropped once the kernel
//! forgets them. The root is always [`ROOT_INODE`] with the empty path.

use std::collections::HashMap;

pub type InodeId = u64;
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: String,
    lookup_count: u64,
}

pub struct InodeTable {
    entries: HashMap<InodeId, InodeEntry>,
    by_path: HashMap<String, InodeId>,
    next_ino: InodeId,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins a directory path and an entry name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.entries.insert(
            ROOT_INODE,
            InodeEntry {
                path: String::new(),
                lookup_count: 1,
            },
        );
        table.by_path.insert(String::new(), ROOT_INODE);
        table
    }

    pub fn path(&self, ino: InodeId) -> Option<&str> {
        self.entries.get(&ino).map(|e| e.path.as_str())
    }

    pub fn child_path(&self, parent: InodeId, name: &str) -> Option<String> {
        self.path(parent).map(|p| join(p, name))
    }

    pub fn ino_of(&self, path: &str) -> Option<InodeId> {
        self.by_path.get(path).copied()
    }

    /// Inode of `path` for a directory listing. Does not count as a lookup.
    pub fn peek(&mut self, path: &str) -> InodeId {
        match self.by_path.get(path) {
            Some(&ino) => ino,
            None => self.alloc(path, 0),
        }
    }

    /// Inode of `path`, allocating one if needed, with its lookup count
    /// raised by one.
    pub fn lookup(&mut self, path: &str) -> InodeId {
        match self.by_path.get(path) {
            Some(&ino) => {
                if let Some(entry) = self.entries.get_mut(&ino) {
                    entry.lookup_count += 1;
                }
                ino
            }
            None => self.alloc(path, 1),
        }
    }

    fn alloc(&mut self, path: &str, lookup_count: u64) -> InodeId {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                lookup_count,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    pub fn forget(&mut self, ino: InodeId, n: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let should_remove = if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookup_count = entry.lookup_count.saturating_sub(n);
            entry.lookup_count == 0
        } else {
            false
        };
        if should_remove {
            if let Some(entry) = self.entries.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Moves `from` and everything below it to `to`. Inode numbers are kept.
    pub fn rename(&mut self, from: &str, to: &str) {
        self.remove(to);
        let moved: Vec<InodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| is_within(&e.path, from))
            .map(|(&ino, _)| ino)
            .collect();
        for ino in moved {
            if let Some(entry) = self.entries.get_mut(&ino) {
                self.by_path.remove(&entry.path);
                entry.path = format!("{}{}", to, &entry.path[from.len()..]);
                self.by_path.insert(entry.path.clone(), ino);
            }
        }
    }

    /// Forgets the path mappings of `path` and everything below it.
    pub fn remove(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        let gone: Vec<InodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| is_within(&e.path, path))
            .map(|(&ino, _)| ino)
            .collect();
        for ino in gone {
            if let Some(entry) = self.entries.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Drops the entries directly below `dir` that only a directory listing
    /// ever handed out. Returns the number dropped.
    pub fn prune_unreferenced(&mut self, dir: &str) -> usize {
        let unreferenced: Vec<InodeId> = self
            .entries
            .iter()
            .filter(|(&ino, e)| {
                ino != ROOT_INODE && e.lookup_count == 0 && parent_path(&e.path) == dir
            })
            .map(|(&ino, _)| ino)
            .collect();
        for ino in &unreferenced {
            if let Some(entry) = self.entries.remove(ino) {
                self.by_path.remove(&entry.path);
            }
        }
        unreferenced.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
