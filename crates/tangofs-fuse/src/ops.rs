//! Path-level filesystem operations.
//!
//! [`TangoFs`] answers getattr/readdir/read/write/create/mkdir/unlink/rmdir/
//! rename/flush/release for filesystem paths. Every call consults the
//! pending-operation overlay first and falls back to the namespace.
//! Paths use the configured substitute character wherever an entity name
//! contains a slash.

use std::io;
use std::sync::Arc;

use tangofs_db::convert::text_to_property;
use tangofs_db::TangoDatabase;
use tracing::{debug, warn};

use crate::attr::{
    naive_to_system_time, parse_started_date, FileAttr, FileType, DIR_MODE, FILE_MODE,
    READONLY_DIR_MODE, READONLY_FILE_MODE, SCRIPT_MODE, STOPPED_DEVICE_MODE,
};
use crate::config::TangoFsConfig;
use crate::error::{Result, TangoFsError};
use crate::namespace::Namespace;
use crate::node::{Node, NodeKind, SERVERS};
use crate::overlay::{read_range, BufferTarget, CreateKind, Overlay, PendingOp, Probe, TempNamePredicate};

/// What a filesystem path designates.
pub enum Target {
    Node(Arc<Node>),
    /// A file inside an attribute directory.
    Field { attr: Arc<Node>, field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name as shown to the filesystem, slashes substituted.
    pub name: String,
    pub kind: FileType,
}

pub struct TangoFs {
    ns: Namespace,
    overlay: Overlay,
    config: TangoFsConfig,
}

fn errno(code: i32) -> TangoFsError {
    TangoFsError::Io(io::Error::from_raw_os_error(code))
}

fn split_last(path: &[String]) -> Option<(&[String], &str)> {
    let (last, parent) = path.split_last()?;
    Some((parent, last.as_str()))
}

/// Filesystem path of the first `depth` segments of `path`.
fn prefix(path: &str, depth: usize) -> String {
    path.trim_matches('/')
        .split('/')
        .take(depth)
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

impl TangoFs {
    pub fn new(db: Arc<dyn TangoDatabase>, config: TangoFsConfig) -> Result<Self> {
        let temp_names = TempNamePredicate::new(&config.temp_name_patterns).map_err(|e| {
            TangoFsError::InvalidArgument {
                msg: format!("bad temporary-name pattern: {}", e),
            }
        })?;
        Ok(Self {
            ns: Namespace::new(db, &config),
            overlay: Overlay::new(temp_names, config.overlay_stale_after()),
            config,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn config(&self) -> &TangoFsConfig {
        &self.config
    }

    /// Finds the node or attribute field a path designates.
    pub fn locate(&self, path: &str) -> Result<Target> {
        let segments = self.ns.split_path(path);
        match self.ns.resolve(&segments) {
            Ok(node) => Ok(Target::Node(node)),
            Err(TangoFsError::NotNavigable { .. }) if !segments.is_empty() => {
                let (parent, field) = split_last(&segments)
                    .ok_or_else(|| TangoFsError::not_found(path))?;
                let attr = self.ns.resolve(parent)?;
                let Some(view) = attr.as_attribute() else {
                    return Err(TangoFsError::NotNavigable {
                        path: path.to_string(),
                    });
                };
                if !view.has_field(field)? {
                    return Err(TangoFsError::not_found(path));
                }
                let field = field.to_string();
                Ok(Target::Field { attr, field })
            }
            Err(e) => Err(e),
        }
    }

    fn is_pending_dir(&self, path: &str) -> bool {
        self.overlay.probe(path) == Some(Probe::Dir)
    }

    pub fn getattr(&self, path: &str) -> Result<FileAttr> {
        debug!("getattr {}", path);
        if let Some(probe) = self.overlay.probe(path) {
            return Ok(match probe {
                Probe::Dir => FileAttr::new_dir(DIR_MODE),
                Probe::File { size } => FileAttr::new_file(size, FILE_MODE),
            });
        }
        match self.locate(path)? {
            Target::Field { attr, field } => {
                let view = attr
                    .as_attribute()
                    .ok_or_else(|| TangoFsError::not_found(path))?;
                let text = view.field_text(&field)?;
                let perm = if view.is_field_writable(&field)? {
                    FILE_MODE
                } else {
                    READONLY_FILE_MODE
                };
                let size = text.len() as u64;
                // the read that follows is served from here
                self.overlay.store_payload(path, text.into_bytes());
                Ok(FileAttr::new_file(size, perm))
            }
            Target::Node(node) => self.node_attr(&node),
        }
    }

    fn node_attr(&self, node: &Node) -> Result<FileAttr> {
        if let Some(prop) = node.as_property() {
            let size = prop.text()?.len() as u64;
            let mtime = if self.config.property_mtime_from_history {
                prop.last_modified()?.map(naive_to_system_time)
            } else {
                None
            };
            return Ok(FileAttr::new_file(size, FILE_MODE).with_mtime(mtime));
        }
        if let Some(cmd) = node.as_command() {
            let size = cmd.script(&self.config.command_runner)?.len() as u64;
            return Ok(FileAttr::new_file(size, SCRIPT_MODE));
        }
        if let Some(attr) = node.as_attribute() {
            let perm = if attr.is_writable()? {
                DIR_MODE
            } else {
                READONLY_DIR_MODE
            };
            return Ok(FileAttr::new_dir(perm));
        }
        if let NodeKind::Device(_) = node.kind() {
            return Ok(match node.device_info() {
                Ok(Some(info)) => {
                    let perm = if info.exported {
                        DIR_MODE
                    } else {
                        STOPPED_DEVICE_MODE
                    };
                    let started = info.started_date.as_deref().and_then(parse_started_date);
                    FileAttr::new_dir(perm).with_mtime(started)
                }
                Ok(None) => FileAttr::new_dir(DIR_MODE),
                Err(e) => {
                    warn!("no device info for {}: {}", node.name(), e);
                    FileAttr::new_dir(DIR_MODE)
                }
            });
        }
        Ok(FileAttr::new_dir(DIR_MODE))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        debug!("readdir {}", path);
        let mut entries: Vec<DirEntry> = Vec::new();
        if !self.is_pending_dir(path) {
            let node = match self.locate(path)? {
                Target::Node(node) => node,
                Target::Field { .. } => {
                    return Err(TangoFsError::NotNavigable {
                        path: path.to_string(),
                    })
                }
            };
            let (names, kind) = match node.kind() {
                NodeKind::Attribute(_) => {
                    let view = node
                        .as_attribute()
                        .ok_or_else(|| TangoFsError::not_found(path))?;
                    (view.field_names()?, FileType::RegularFile)
                }
                NodeKind::Properties { .. } | NodeKind::Commands { .. } => {
                    (node.list_children()?, FileType::RegularFile)
                }
                _ => (node.list_children()?, FileType::Directory),
            };
            entries.extend(names.into_iter().map(|name| DirEntry {
                name: self.ns.encode_name(&name),
                kind,
            }));
        }
        for (name, op) in self.overlay.children_of(path) {
            if entries.iter().any(|e| e.name == name) {
                continue;
            }
            let kind = match op {
                PendingOp::Create(kind) if kind.is_dir() => FileType::Directory,
                _ => FileType::RegularFile,
            };
            entries.push(DirEntry { name, kind });
        }
        entries.sort_by_cached_key(|e| (e.name.to_lowercase(), e.name.clone()));
        Ok(entries)
    }

    pub fn read(&self, path: &str, offset: usize, size: usize) -> Result<Vec<u8>> {
        debug!("read {} offset={} size={}", path, offset, size);
        match self.overlay.get(path) {
            Some(PendingOp::Buffered { data, .. }) => return Ok(read_range(&data, offset, size)),
            Some(PendingOp::Create(CreateKind::Property)) => return Ok(Vec::new()),
            Some(PendingOp::Create(kind)) => {
                warn!("read of {} found a pending {:?}; dropping it", path, kind);
                self.overlay.discard(path);
                return Err(TangoFsError::StaleOverlayEntry {
                    path: path.to_string(),
                });
            }
            Some(PendingOp::ReadPayload(_)) => {
                if let Some(chunk) = self.overlay.read_payload(path, offset, size) {
                    return Ok(chunk);
                }
            }
            None => {}
        }
        let content = match self.locate(path)? {
            Target::Field { attr, field } => attr
                .as_attribute()
                .ok_or_else(|| TangoFsError::not_found(path))?
                .field_text(&field)?,
            Target::Node(node) => {
                if let Some(prop) = node.as_property() {
                    prop.text()?
                } else if let Some(cmd) = node.as_command() {
                    cmd.script(&self.config.command_runner)?
                } else {
                    return Err(errno(libc::EISDIR));
                }
            }
        };
        Ok(read_range(content.as_bytes(), offset, size))
    }

    pub fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize> {
        debug!("write {} offset={} len={}", path, offset, data.len());
        self.check_size(path, offset.saturating_add(data.len()))?;
        if self.overlay.write(path, offset, data) {
            return Ok(data.len());
        }
        if self.is_pending_dir(path) {
            return Err(errno(libc::EISDIR));
        }
        match self.locate(path)? {
            Target::Node(node) => {
                let Some(prop) = node.as_property() else {
                    return Err(TangoFsError::invalid_operation("write", path));
                };
                // a write at the start replaces the whole value
                let seed = if offset == 0 {
                    Vec::new()
                } else {
                    prop.text()?.into_bytes()
                };
                self.overlay.start_buffer(path, seed);
                self.overlay.write(path, offset, data);
                Ok(data.len())
            }
            Target::Field { attr, field } => {
                self.overlay.discard(path);
                let view = attr
                    .as_attribute()
                    .ok_or_else(|| TangoFsError::not_found(path))?;
                if !view.is_field_writable(&field)? {
                    return Err(TangoFsError::invalid_operation("write", path));
                }
                view.write_field(&field, &String::from_utf8_lossy(data))?;
                Ok(data.len())
            }
        }
    }

    pub fn truncate(&self, path: &str, size: usize) -> Result<()> {
        debug!("truncate {} to {}", path, size);
        self.check_size(path, size)?;
        if self.overlay.truncate(path, size) {
            return Ok(());
        }
        match self.locate(path)? {
            Target::Node(node) => {
                let Some(prop) = node.as_property() else {
                    return Err(TangoFsError::invalid_operation("truncate", path));
                };
                let seed = if size == 0 {
                    Vec::new()
                } else {
                    prop.text()?.into_bytes()
                };
                self.overlay.start_buffer(path, seed);
                self.overlay.truncate(path, size);
                Ok(())
            }
            // field files are rewritten whole by the next write
            Target::Field { .. } => Ok(()),
        }
    }

    fn check_size(&self, path: &str, size: usize) -> Result<()> {
        if size > self.config.max_property_bytes {
            warn!(
                "{}: {} bytes exceeds the {} byte limit",
                path, size, self.config.max_property_bytes
            );
            return Err(errno(libc::EFBIG));
        }
        Ok(())
    }

    /// Writes `data` to the property at `path`, creating it when missing.
    fn commit_property(&self, path: &str, data: &[u8]) -> Result<()> {
        let segments = self.ns.split_path(path);
        let (parent, name) =
            split_last(&segments).ok_or_else(|| TangoFsError::invalid_operation("write", path))?;
        let properties = self.ns.resolve(parent)?;
        if !matches!(properties.kind(), NodeKind::Properties { .. }) {
            return Err(TangoFsError::invalid_operation("write", path));
        }
        let text = String::from_utf8_lossy(data);
        match properties.child(name) {
            Ok(node) => match node.as_property() {
                Some(prop) => prop.set_text(&text)?,
                None => return Err(TangoFsError::invalid_operation("write", path)),
            },
            Err(TangoFsError::NotFound { .. }) => {
                properties.add_properties(&[(name.to_string(), text_to_property(&text))])?
            }
            Err(e) => return Err(e),
        }
        debug!("committed {} ({} bytes)", path, data.len());
        Ok(())
    }

    /// Commits a buffered write. Scratch files wait for their rename.
    pub fn flush(&self, path: &str) -> Result<()> {
        debug!("flush {}", path);
        match self.overlay.take(path) {
            Some(PendingOp::Buffered { target, data }) if target != BufferTarget::Temporary => {
                if let Err(e) = self.commit_property(path, &data) {
                    self.overlay
                        .restore(path, PendingOp::Buffered { target, data });
                    return Err(e);
                }
                Ok(())
            }
            Some(other) => {
                self.overlay.restore(path, other);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn release(&self, path: &str) -> Result<()> {
        debug!("release {}", path);
        self.flush(path)?;
        match self.overlay.get(path) {
            Some(PendingOp::Create(CreateKind::Property)) => {
                debug!("{} was created but never written", path);
                self.overlay.discard(path);
            }
            Some(PendingOp::ReadPayload(_)) => {
                self.overlay.discard(path);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn create(&self, path: &str) -> Result<FileAttr> {
        debug!("create {}", path);
        if self.overlay.is_temporary(path) {
            self.overlay.begin_temp(path);
            return Ok(FileAttr::new_file(0, FILE_MODE));
        }
        let segments = self.ns.split_path(path);
        let (parent, name) =
            split_last(&segments).ok_or_else(|| TangoFsError::invalid_operation("create", path))?;
        let properties = self.ns.resolve(parent)?;
        if !matches!(properties.kind(), NodeKind::Properties { .. }) {
            return Err(TangoFsError::invalid_operation("create", path));
        }
        if properties.contains(name)? {
            // O_CREAT on an existing property: the first write or truncate
            // starts the buffer, so a bare open-close leaves the value alone
            let node = properties.child(name)?;
            return self.node_attr(&node);
        }
        self.overlay.begin_create(path, CreateKind::Property);
        Ok(FileAttr::new_file(0, FILE_MODE))
    }

    /// True when `path` exists as a directory, pending or in the namespace,
    /// and the node satisfies `accept`.
    fn dir_exists(&self, path: &str, accept: impl Fn(&NodeKind) -> bool) -> Result<bool> {
        if self.is_pending_dir(path) {
            return Ok(true);
        }
        match self.ns.resolve_str(path) {
            Ok(node) => Ok(accept(node.kind())),
            Err(TangoFsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        if self.overlay.probe(path).is_some() {
            return Ok(true);
        }
        match self.ns.resolve_str(path) {
            Ok(_) => Ok(true),
            Err(TangoFsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Directories can only be made under `servers`: executables and
    /// instances are kept pending, classes too, and a device directory under
    /// a class registers the device with everything above it.
    pub fn mkdir(&self, path: &str) -> Result<FileAttr> {
        debug!("mkdir {}", path);
        let segments = self.ns.split_path(path);
        if segments.first().map(String::as_str) != Some(SERVERS) {
            return Err(TangoFsError::invalid_operation("mkdir", path));
        }
        if self.exists(path)? {
            return Err(errno(libc::EEXIST));
        }
        let parent = parent_of(path);
        let kind = match segments.len() {
            2 => CreateKind::Server,
            3 => {
                if !self.dir_exists(&parent, |k| matches!(k, NodeKind::Server))? {
                    return Err(TangoFsError::not_found(parent));
                }
                CreateKind::Server
            }
            4 => {
                if !self.dir_exists(&parent, |k| matches!(k, NodeKind::Instance { .. }))? {
                    return Err(TangoFsError::not_found(parent));
                }
                CreateKind::DeviceClass
            }
            5 => {
                if !self.dir_exists(&parent, |k| matches!(k, NodeKind::Class { .. }))? {
                    return Err(TangoFsError::not_found(parent));
                }
                let device = &segments[4];
                if device.split('/').count() != 3 {
                    return Err(TangoFsError::InvalidArgument {
                        msg: format!("'{}' is not a domain/family/member name", device),
                    });
                }
                self.ns
                    .create_device(&segments[1], &segments[2], &segments[3], device)?;
                for depth in 2..=4 {
                    self.overlay.discard(&prefix(path, depth));
                }
                return Ok(FileAttr::new_dir(DIR_MODE));
            }
            _ => return Err(TangoFsError::invalid_operation("mkdir", path)),
        };
        self.overlay.begin_create(path, kind);
        Ok(FileAttr::new_dir(DIR_MODE))
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink {}", path);
        match self.overlay.get(path) {
            Some(PendingOp::Create(CreateKind::Property))
            | Some(PendingOp::Buffered {
                target: BufferTarget::Created | BufferTarget::Temporary,
                ..
            }) => {
                self.overlay.discard(path);
                return Ok(());
            }
            Some(PendingOp::Create(kind)) => {
                warn!("unlink of {} found a pending {:?}; dropping it", path, kind);
                self.overlay.discard(path);
                return Err(TangoFsError::StaleOverlayEntry {
                    path: path.to_string(),
                });
            }
            Some(PendingOp::Buffered { .. }) | Some(PendingOp::ReadPayload(_)) => {
                self.overlay.discard(path);
            }
            None => {}
        }
        let node = match self.locate(path)? {
            Target::Node(node) if node.as_property().is_some() => node,
            _ => return Err(TangoFsError::invalid_operation("unlink", path)),
        };
        let properties = node
            .parent()?
            .ok_or_else(|| TangoFsError::invalid_operation("unlink", path))?;
        properties.delete_property(node.name())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir {}", path);
        match self.overlay.get(path) {
            Some(PendingOp::Create(kind)) if kind.is_dir() => {
                self.overlay.discard(path);
                return Ok(());
            }
            Some(op) => {
                warn!("rmdir of {} found {:?}; dropping it", path, op);
                self.overlay.discard(path);
                return Err(TangoFsError::StaleOverlayEntry {
                    path: path.to_string(),
                });
            }
            None => {}
        }
        let node = match self.locate(path)? {
            Target::Node(node) => node,
            Target::Field { .. } => {
                return Err(TangoFsError::NotNavigable {
                    path: path.to_string(),
                })
            }
        };
        let parent = node
            .parent()?
            .ok_or_else(|| TangoFsError::invalid_operation("rmdir", path))?;
        match node.kind() {
            NodeKind::Instance { .. } => parent.delete_instance(node.name()),
            NodeKind::Device(_) => parent.delete_device(node.name()),
            _ => Err(TangoFsError::invalid_operation("rmdir", path)),
        }
    }

    /// Renames within one directory. Scratch files renamed onto a real name
    /// commit their buffer there; pending entries just move.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("rename {} -> {}", from, to);
        match self.overlay.get(from) {
            Some(PendingOp::Buffered {
                target: BufferTarget::Temporary,
                data,
            }) if !self.overlay.is_temporary(to) => {
                self.overlay.discard(from);
                if let Err(e) = self.commit_property(to, &data) {
                    self.overlay.restore(
                        from,
                        PendingOp::Buffered {
                            target: BufferTarget::Temporary,
                            data,
                        },
                    );
                    return Err(e);
                }
                self.overlay.discard(to);
                return Ok(());
            }
            Some(PendingOp::ReadPayload(_)) => {
                self.overlay.discard(from);
            }
            Some(_) => return self.overlay.rename(from, to),
            None => {}
        }

        let from_segments = self.ns.split_path(from);
        let to_segments = self.ns.split_path(to);
        let (Some((from_parent, from_name)), Some((to_parent, to_name))) =
            (split_last(&from_segments), split_last(&to_segments))
        else {
            return Err(TangoFsError::invalid_operation("rename", from));
        };
        let node = match self.locate(from)? {
            Target::Node(node) => node,
            Target::Field { .. } => return Err(TangoFsError::invalid_operation("rename", from)),
        };
        if from_parent != to_parent {
            return Err(TangoFsError::invalid_operation("rename", from));
        }
        let parent = node
            .parent()?
            .ok_or_else(|| TangoFsError::invalid_operation("rename", from))?;
        match node.kind() {
            NodeKind::Property(_) => parent.rename_property(node.name(), to_name),
            NodeKind::Instance { .. } => parent.rename_instance(from_name, to_name),
            _ => Err(TangoFsError::invalid_operation("rename", from)),
        }
    }

    /// Drops read payloads nobody consumed.
    pub fn sweep(&self) -> usize {
        self.overlay.sweep_stale()
    }
}
