use chrono::{NaiveDateTime, TimeZone, Utc};
use std::time::SystemTime;

pub const DIR_MODE: u16 = 0o755;
pub const READONLY_DIR_MODE: u16 = 0o555;
/// Devices that are not running are still listed, without execute bits.
pub const STOPPED_DEVICE_MODE: u16 = 0o644;
pub const FILE_MODE: u16 = 0o644;
pub const READONLY_FILE_MODE: u16 = 0o444;
pub const SCRIPT_MODE: u16 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
}

/// Metadata of one path, before an inode number is attached.
#[derive(Clone, Debug, PartialEq)]
pub struct FileAttr {
    pub size: u64,
    pub mtime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
}

impl FileAttr {
    pub fn new_file(size: u64, perm: u16) -> Self {
        FileAttr {
            size,
            mtime: SystemTime::now(),
            kind: FileType::RegularFile,
            perm,
        }
    }

    pub fn new_dir(perm: u16) -> Self {
        FileAttr {
            size: 4096,
            mtime: SystemTime::now(),
            kind: FileType::Directory,
            perm,
        }
    }

    pub fn with_mtime(mut self, mtime: Option<SystemTime>) -> Self {
        if let Some(mtime) = mtime {
            self.mtime = mtime;
        }
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn to_fuser(&self, ino: u64, uid: u32, gid: u32) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: blocks_for_size(self.size),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: file_type_to_fuser(self.kind),
            perm: self.perm,
            nlink: if self.is_dir() { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

pub fn file_type_to_fuser(kind: FileType) -> fuser::FileType {
    match kind {
        FileType::RegularFile => fuser::FileType::RegularFile,
        FileType::Directory => fuser::FileType::Directory,
    }
}

pub fn naive_to_system_time(date: NaiveDateTime) -> SystemTime {
    SystemTime::from(Utc.from_utc_datetime(&date))
}

/// Parses a device start date such as `7th October 2015 at 10:31:42`, or a
/// history date `07/10/2015 10:31:42`.
pub fn parse_started_date(text: &str) -> Option<SystemTime> {
    let text = text.trim();
    if let Ok(date) = NaiveDateTime::parse_from_str(text, "%d/%m/%Y %H:%M:%S") {
        return Some(naive_to_system_time(date));
    }
    let (day, rest) = text.split_once(' ')?;
    let day = day.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    NaiveDateTime::parse_from_str(&format!("{} {}", day, rest), "%d %B %Y at %H:%M:%S")
        .ok()
        .map(naive_to_system_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_file_sets_kind() {
        let attr = FileAttr::new_file(1000, FILE_MODE);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 1000);
        assert!(!attr.is_dir());
    }

    #[test]
    fn test_to_fuser_fills_identity() {
        let fattr = FileAttr::new_dir(DIR_MODE).to_fuser(7, 1000, 100);
        assert_eq!(fattr.ino, 7);
        assert_eq!(fattr.kind, fuser::FileType::Directory);
        assert_eq!(fattr.nlink, 2);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.gid, 100);
        assert_eq!(fattr.perm, 0o755);
    }

    #[test]
    fn test_blocks_round_up() {
        let fattr = FileAttr::new_file(513, FILE_MODE).to_fuser(2, 0, 0);
        assert_eq!(fattr.blocks, 2);
    }

    #[test]
    fn test_with_mtime_overrides_only_when_known() {
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let attr = FileAttr::new_file(0, FILE_MODE).with_mtime(Some(epoch));
        assert_eq!(attr.mtime, epoch);
        let attr = attr.with_mtime(None);
        assert_eq!(attr.mtime, epoch);
    }

    #[test]
    fn test_parse_started_date_ordinal() {
        let t = parse_started_date("7th October 2015 at 10:31:42").unwrap();
        let secs = t.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1444213902);
        assert!(parse_started_date("1st January 2020 at 00:00:00").is_some());
        assert!(parse_started_date("22nd March 2021 at 08:00:00").is_some());
    }

    #[test]
    fn test_parse_started_date_history_format() {
        assert_eq!(
            parse_started_date("07/10/2015 10:31:42"),
            parse_started_date("7th October 2015 at 10:31:42")
        );
        assert!(parse_started_date("yesterday").is_none());
    }
}
