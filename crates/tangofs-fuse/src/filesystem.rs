//! FUSE adapter.
//!
//! Implements `fuser::Filesystem` by translating inode numbers to paths and
//! forwarding to [`TangoFs`]. Errors are replied as their errno.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, info};

use crate::attr::{file_type_to_fuser, FileAttr, FileType};
use crate::inode::{join, InodeTable, ROOT_INODE};
use crate::ops::TangoFs;

pub struct TangoFsFilesystem {
    fs: TangoFs,
    inodes: InodeTable,
    uid: u32,
    gid: u32,
    attr_timeout: Duration,
    entry_timeout: Duration,
}

impl TangoFsFilesystem {
    /// `uid`/`gid` own every file of the mount.
    pub fn new(fs: TangoFs, uid: u32, gid: u32) -> Self {
        let attr_timeout = fs.config().attr_timeout();
        let entry_timeout = fs.config().entry_timeout();
        Self {
            fs,
            inodes: InodeTable::new(),
            uid,
            gid,
            attr_timeout,
            entry_timeout,
        }
    }

    pub fn tangofs(&self) -> &TangoFs {
        &self.fs
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        self.inodes.child_path(parent, &name.to_string_lossy())
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.inodes.path(ino).map(str::to_string)
    }

    fn reply_entry(&mut self, path: &str, attr: FileAttr, reply: ReplyEntry) {
        let ino = self.inodes.lookup(path);
        reply.entry(
            &self.entry_timeout,
            &attr.to_fuser(ino, self.uid, self.gid),
            0,
        );
    }
}

impl Filesystem for TangoFsFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("TangoFS filesystem init");
        Ok(())
    }

    fn destroy(&mut self) {
        let dropped = self.fs.overlay().len();
        if dropped > 0 {
            info!("unmounting with {} pending operations", dropped);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup parent={} name={:?}", parent, name);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => self.reply_entry(&path, attr, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget ino={} nlookup={}", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&self.attr_timeout, &attr.to_fuser(ino, self.uid, self.gid)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino={} size={:?} mode={:?}", ino, size, mode);
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // only size changes mean anything here; ownership and mode are fixed
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&path, size as usize) {
                reply.error(e.to_errno());
                return;
            }
        }
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&self.attr_timeout, &attr.to_fuser(ino, self.uid, self.gid)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir parent={} name={:?} mode={:o}", parent, name, mode);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.mkdir(&path) {
            Ok(attr) => self.reply_entry(&path, attr, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink parent={} name={:?}", parent, name);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir parent={} name={:?}", parent, name);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename parent={} name={:?} newparent={} newname={:?}",
            parent, name, newparent, newname
        );
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino={} flags={}", ino, flags);
        if self.inodes.path(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        // contents change behind the kernel's back; never serve from page cache
        reply.opened(0, fuser::consts::FOPEN_DIRECT_IO);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} offset={} size={}", ino, offset, size);
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(&path, offset as usize, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino={} offset={} size={}", ino, offset, data.len());
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.write(&path, offset as usize, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush ino={}", ino);
        let Some(path) = self.path(ino) else {
            reply.ok();
            return;
        };
        match self.fs.flush(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release ino={}", ino);
        let Some(path) = self.path(ino) else {
            reply.ok();
            return;
        };
        match self.fs.release(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino={}", ino);
        match self.path(ino) {
            Some(_) => reply.opened(0, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino={} offset={}", ino, offset);
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset == 0 {
            let swept = self.fs.sweep();
            if swept > 0 {
                debug!("swept {} stale read payloads", swept);
            }
            self.inodes.prune_unreferenced(&path);
        }
        let listing = match self.fs.readdir(&path) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
            self.inodes.peek(parent)
        };
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in listing {
            let child = self.inodes.peek(&join(&path, &entry.name));
            entries.push((child, entry.kind, entry.name));
        }

        for (i, (child, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child, (i + 1) as i64, file_type_to_fuser(kind), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        // entries the kernel never looked up are not needed past the listing
        if let Some(path) = self.path(ino) {
            let pruned = self.inodes.prune_unreferenced(&path);
            if pruned > 0 {
                debug!("releasedir ino={}: dropped {} listed inodes", ino, pruned);
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create parent={} name={:?} mode={:o} flags={}", parent, name, mode, flags);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let created = self.fs.create(&path).and_then(|attr| {
            if flags & libc::O_TRUNC != 0 && attr.size > 0 {
                self.fs.truncate(&path, 0)?;
                return self.fs.getattr(&path);
            }
            Ok(attr)
        });
        match created {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                reply.created(
                    &self.entry_timeout,
                    &attr.to_fuser(ino, self.uid, self.gid),
                    0,
                    0,
                    fuser::consts::FOPEN_DIRECT_IO,
                );
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TangoFsConfig;
    use std::sync::Arc;
    use tangofs_db::{DeviceSpec, MemoryDatabase};

    fn filesystem() -> TangoFsFilesystem {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new("sys/tg_test/1", "TangoTest", "TangoTest/test"));
        let fs = TangoFs::new(db, TangoFsConfig::default()).unwrap();
        TangoFsFilesystem::new(fs, 1000, 1000)
    }

    #[test]
    fn test_timeouts_from_config() {
        let fs = filesystem();
        assert_eq!(fs.attr_timeout, Duration::from_millis(1000));
        assert_eq!(fs.entry_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_child_paths() {
        let mut fs = filesystem();
        assert_eq!(
            fs.child_path(ROOT_INODE, OsStr::new("servers")).unwrap(),
            "servers"
        );
        let ino = fs.inodes.lookup("servers");
        assert_eq!(
            fs.child_path(ino, OsStr::new("TangoTest")).unwrap(),
            "servers/TangoTest"
        );
        assert!(fs.child_path(9999, OsStr::new("x")).is_none());
        assert_eq!(fs.tangofs().readdir(&fs.path(ino).unwrap()).unwrap().len(), 1);
    }
}
