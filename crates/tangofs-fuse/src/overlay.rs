//! Pending filesystem operations.
//!
//! The backing store only knows whole values, while editors create, write,
//! flush and rename files in several calls. Operations that have started
//! but not yet reached the backing store are kept here, keyed by filesystem
//! path. Each path goes through the `DashMap` entry API so calls on the same
//! path are serialized; different paths do not contend.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, TangoFsError};

/// What a pending create will become once committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    Server,
    DeviceClass,
    Property,
}

impl CreateKind {
    pub fn is_dir(&self) -> bool {
        !matches!(self, CreateKind::Property)
    }
}

/// Whose content a write buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    /// A property created through the filesystem.
    Created,
    /// A property the backing store already has.
    Existing,
    /// An editor scratch file, committed only by renaming it.
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// A directory or file was created that the backing store does not
    /// know about yet.
    Create(CreateKind),
    /// Bytes written to a property file and not yet committed.
    Buffered { target: BufferTarget, data: Vec<u8> },
    /// Content computed by a metadata probe, served by the next read.
    ReadPayload(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub op: PendingOp,
    pub inserted_at: Instant,
}

impl Entry {
    fn new(op: PendingOp) -> Self {
        Self {
            op,
            inserted_at: Instant::now(),
        }
    }
}

/// Synthetic metadata of a pending path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Dir,
    File { size: u64 },
}

/// Recognizes names editors use for scratch files.
#[derive(Debug, Clone)]
pub struct TempNamePredicate {
    patterns: Vec<Regex>,
}

impl TempNamePredicate {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> std::result::Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

impl Default for TempNamePredicate {
    fn default() -> Self {
        Self {
            patterns: Regex::new(r"^sed\w{6}$").into_iter().collect(),
        }
    }
}

pub struct Overlay {
    entries: DashMap<String, Entry>,
    temp_names: TempNamePredicate,
    stale_after: Duration,
}

/// Overlay keys are filesystem paths without the leading slash.
pub fn key(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Overlay {
    pub fn new(temp_names: TempNamePredicate, stale_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            temp_names,
            stale_after,
        }
    }

    /// True when the last path segment is a scratch-file name.
    pub fn is_temporary(&self, path: &str) -> bool {
        self.temp_names.matches(base_name(path.trim_end_matches('/')))
    }

    fn is_stale(&self, entry: &Entry) -> bool {
        matches!(entry.op, PendingOp::ReadPayload(_))
            && entry.inserted_at.elapsed() > self.stale_after
    }

    pub fn begin_create(&self, path: &str, kind: CreateKind) {
        debug!("overlay: pending {:?} at {}", kind, path);
        self.entries
            .insert(key(path), Entry::new(PendingOp::Create(kind)));
    }

    /// Scratch files skip the create marker and buffer straight away.
    pub fn begin_temp(&self, path: &str) {
        debug!("overlay: temporary file {}", path);
        self.entries
            .insert(key(path), Entry::new(buffered(BufferTarget::Temporary, Vec::new())));
    }

    /// Current entry of `path`. Stale read payloads are dropped instead.
    pub fn get(&self, path: &str) -> Option<PendingOp> {
        match self.entries.entry(key(path)) {
            MapEntry::Occupied(entry) if self.is_stale(entry.get()) => {
                warn!("overlay: discarding stale read payload for {}", path);
                entry.remove();
                None
            }
            MapEntry::Occupied(entry) => Some(entry.get().op.clone()),
            MapEntry::Vacant(_) => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Metadata a pending path presents without asking the backing store.
    /// Read payloads belong to existing entities and are not probed here.
    pub fn probe(&self, path: &str) -> Option<Probe> {
        match self.get(path)? {
            PendingOp::Create(kind) if kind.is_dir() => Some(Probe::Dir),
            PendingOp::Create(_) => Some(Probe::File { size: 0 }),
            PendingOp::Buffered { data, .. } => Some(Probe::File {
                size: data.len() as u64,
            }),
            PendingOp::ReadPayload(_) => None,
        }
    }

    pub fn take(&self, path: &str) -> Option<PendingOp> {
        match self.entries.entry(key(path)) {
            MapEntry::Occupied(entry) => {
                let stale = self.is_stale(entry.get());
                let taken = entry.remove();
                if stale {
                    warn!("overlay: discarding stale read payload for {}", path);
                    return None;
                }
                Some(taken.op)
            }
            MapEntry::Vacant(_) => None,
        }
    }

    /// Puts an entry back, e.g. after a failed commit.
    pub fn restore(&self, path: &str, op: PendingOp) {
        self.entries.insert(key(path), Entry::new(op));
    }

    pub fn discard(&self, path: &str) -> bool {
        let removed = self.entries.remove(&key(path)).is_some();
        if removed {
            debug!("overlay: discarded {}", path);
        }
        removed
    }

    /// Splices `data` into the buffer of `path` at `offset`, zero-filling
    /// any gap. A pending property create turns into an empty buffer first.
    /// Returns false when `path` holds nothing that accepts writes.
    pub fn write(&self, path: &str, offset: usize, data: &[u8]) -> bool {
        match self.entries.entry(key(path)) {
            MapEntry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                match &mut entry.op {
                    PendingOp::Buffered { data: buf, .. } => splice(buf, offset, data),
                    PendingOp::Create(CreateKind::Property) => {
                        let mut buf = Vec::new();
                        splice(&mut buf, offset, data);
                        entry.op = buffered(BufferTarget::Created, buf);
                    }
                    _ => return false,
                }
                true
            }
            MapEntry::Vacant(_) => false,
        }
    }

    /// Starts buffering writes to an existing property, seeded with `seed`.
    pub fn start_buffer(&self, path: &str, seed: Vec<u8>) {
        debug!("overlay: buffering {} ({} seed bytes)", path, seed.len());
        self.entries
            .insert(key(path), Entry::new(buffered(BufferTarget::Existing, seed)));
    }

    /// Truncates or zero-extends the buffer of `path`.
    pub fn truncate(&self, path: &str, size: usize) -> bool {
        match self.entries.get_mut(&key(path)) {
            Some(mut entry) => match &mut entry.op {
                PendingOp::Buffered { data, .. } => {
                    data.resize(size, 0);
                    true
                }
                PendingOp::Create(CreateKind::Property) => {
                    entry.op = buffered(BufferTarget::Created, vec![0; size]);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    pub fn store_payload(&self, path: &str, payload: Vec<u8>) {
        self.entries
            .insert(key(path), Entry::new(PendingOp::ReadPayload(payload)));
    }

    /// Serves `size` bytes at `offset` from the precomputed payload. The
    /// payload is consumed once a read reaches its end.
    pub fn read_payload(&self, path: &str, offset: usize, size: usize) -> Option<Vec<u8>> {
        match self.entries.entry(key(path)) {
            MapEntry::Occupied(entry) => {
                if self.is_stale(entry.get()) {
                    warn!("overlay: discarding stale read payload for {}", path);
                    entry.remove();
                    return None;
                }
                let PendingOp::ReadPayload(payload) = &entry.get().op else {
                    return None;
                };
                let chunk = read_range(payload, offset, size);
                let consumed = offset + size >= payload.len();
                if consumed {
                    entry.remove();
                }
                Some(chunk)
            }
            MapEntry::Vacant(_) => None,
        }
    }

    /// Moves the entry of `from` to `to`.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (_, entry) = self.entries.remove(&key(from)).ok_or_else(|| {
            TangoFsError::StaleOverlayEntry {
                path: from.to_string(),
            }
        })?;
        self.entries.insert(key(to), entry);
        Ok(())
    }

    /// Pending names directly below `dir`.
    pub fn children_of(&self, dir: &str) -> Vec<(String, PendingOp)> {
        let prefix = key(dir);
        self.entries
            .iter()
            .filter(|e| !matches!(e.value().op, PendingOp::ReadPayload(_)))
            .filter_map(|e| {
                let rest = if prefix.is_empty() {
                    e.key().as_str()
                } else {
                    e.key().strip_prefix(prefix.as_str())?.strip_prefix('/')?
                };
                (!rest.is_empty() && !rest.contains('/'))
                    .then(|| (rest.to_string(), e.value().op.clone()))
            })
            .collect()
    }

    /// Drops every read payload older than the stale interval. Returns the
    /// number removed.
    pub fn sweep_stale(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, entry| {
            let stale = self.is_stale(entry);
            if stale {
                warn!("overlay: discarding stale read payload for {}", path);
            }
            !stale
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new(TempNamePredicate::default(), Duration::from_secs(5))
    }
}

fn buffered(target: BufferTarget, data: Vec<u8>) -> PendingOp {
    PendingOp::Buffered { target, data }
}

fn splice(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(data);
}

/// Byte range `[offset, offset + size)` of `data`, clamped.
pub fn read_range(data: &[u8], offset: usize, size: usize) -> Vec<u8> {
    if offset >= data.len() {
        return Vec::new();
    }
    let end = (offset + size).min(data.len());
    data[offset..end].to_vec()
}
