//! SFTP v3 file attributes
//!
//! Implements the `ATTRS` blob from draft-ietf-secsh-filexfer-02 section 5.
//! A decoded [`FileAttributes`] remembers the values it was decoded with;
//! the encoder emits only the attribute groups that have changed since, so
//! a `SETSTAT`/`FSETSTAT` round trip touches exactly the fields the caller
//! mutated. An unchanged record encodes to a four-byte zero flag word.
//!
//! Absent groups decode to sentinel defaults: `size`, `uid` and `gid` are
//! `-1`, permissions are zero, and both timestamps are the Unix epoch.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::{Error, Result};

const FLAG_SIZE: u32 = 0x00000001;
const FLAG_UIDGID: u32 = 0x00000002;
const FLAG_PERMISSIONS: u32 = 0x00000004;
const FLAG_ACMODTIME: u32 = 0x00000008;
const FLAG_EXTENDED: u32 = 0x80000000;

// POSIX permission bits inside the low 12 bits of the permissions word.
const BIT_OTHERS_EXECUTE: u32 = 0o1;
const BIT_OTHERS_WRITE: u32 = 0o2;
const BIT_OTHERS_READ: u32 = 0o4;
const BIT_GROUP_EXECUTE: u32 = 0o10;
const BIT_GROUP_WRITE: u32 = 0o20;
const BIT_GROUP_READ: u32 = 0o40;
const BIT_OWNER_EXECUTE: u32 = 0o100;
const BIT_OWNER_WRITE: u32 = 0o200;
const BIT_OWNER_READ: u32 = 0o400;
const BIT_STICKY: u32 = 0o1000;
const BIT_SET_GID: u32 = 0o2000;
const BIT_SET_UID: u32 = 0o4000;

// File-type nibble, bits 12..16 of the permissions word.
const TYPE_FIFO: u32 = 0x1;
const TYPE_CHARACTER_DEVICE: u32 = 0x2;
const TYPE_DIRECTORY: u32 = 0x4;
const TYPE_BLOCK_DEVICE: u32 = 0x6;
const TYPE_REGULAR_FILE: u32 = 0x8;
const TYPE_SYMLINK: u32 = 0xA;
const TYPE_SOCKET: u32 = 0xC;

/// Values captured at decode time, used to compute the changed-group mask.
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    size: i64,
    uid: i32,
    gid: i32,
    permissions: u32,
    atime: i64,
    mtime: i64,
    extensions: Vec<(String, String)>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            size: -1,
            uid: -1,
            gid: -1,
            permissions: 0,
            atime: 0,
            mtime: 0,
            extensions: Vec::new(),
        }
    }
}

/// Attributes of a remote file or directory.
///
/// `size` is `-1` when the server did not report one; `uid`/`gid` are `-1`
/// when absent. Timestamps are UTC with one-second resolution (the wire
/// carries seconds since the Unix epoch).
#[derive(Debug, Clone)]
pub struct FileAttributes {
    size: i64,
    uid: i32,
    gid: i32,
    permissions: u32,
    atime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    extensions: Vec<(String, String)>,
    original: Snapshot,
}

impl Default for FileAttributes {
    fn default() -> Self {
        FileAttributes {
            size: -1,
            uid: -1,
            gid: -1,
            permissions: 0,
            atime: DateTime::UNIX_EPOCH,
            mtime: DateTime::UNIX_EPOCH,
            extensions: Vec::new(),
            original: Snapshot::default(),
        }
    }
}

impl PartialEq for FileAttributes {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.uid == other.uid
            && self.gid == other.gid
            && self.permissions == other.permissions
            && self.atime.timestamp() == other.atime.timestamp()
            && self.mtime.timestamp() == other.mtime.timestamp()
            && self.extensions == other.extensions
    }
}

impl FileAttributes {
    /// File size in bytes, or `-1` when the server did not report one.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn set_size(&mut self, size: i64) {
        self.size = size;
    }

    /// Owner user id, or `-1` when absent.
    pub fn user_id(&self) -> i32 {
        self.uid
    }

    pub fn set_user_id(&mut self, uid: i32) {
        self.uid = uid;
    }

    /// Owner group id, or `-1` when absent.
    pub fn group_id(&self) -> i32 {
        self.gid
    }

    pub fn set_group_id(&mut self, gid: i32) {
        self.gid = gid;
    }

    /// The full permissions word, file-type nibble included.
    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    /// Last access time, UTC.
    pub fn last_access_time_utc(&self) -> DateTime<Utc> {
        self.atime
    }

    /// Last write time, UTC.
    pub fn last_write_time_utc(&self) -> DateTime<Utc> {
        self.mtime
    }

    /// Set the last access time; any time zone is converted to UTC.
    pub fn set_last_access_time<Tz: TimeZone>(&mut self, time: DateTime<Tz>) {
        self.atime = time.with_timezone(&Utc);
    }

    /// Set the last write time; any time zone is converted to UTC.
    pub fn set_last_write_time<Tz: TimeZone>(&mut self, time: DateTime<Tz>) {
        self.mtime = time.with_timezone(&Utc);
    }

    /// Extension pairs in the order the server sent them.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    /// Add or replace an extension pair, preserving insertion order.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.extensions.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.extensions.push((name, value));
        }
    }

    fn bit(&self, mask: u32) -> bool {
        self.permissions & mask != 0
    }

    fn set_bit(&mut self, mask: u32, value: bool) {
        if value {
            self.permissions |= mask;
        } else {
            self.permissions &= !mask;
        }
    }

    pub fn owner_can_read(&self) -> bool {
        self.bit(BIT_OWNER_READ)
    }

    pub fn set_owner_can_read(&mut self, value: bool) {
        self.set_bit(BIT_OWNER_READ, value);
    }

    pub fn owner_can_write(&self) -> bool {
        self.bit(BIT_OWNER_WRITE)
    }

    pub fn set_owner_can_write(&mut self, value: bool) {
        self.set_bit(BIT_OWNER_WRITE, value);
    }

    pub fn owner_can_execute(&self) -> bool {
        self.bit(BIT_OWNER_EXECUTE)
    }

    pub fn set_owner_can_execute(&mut self, value: bool) {
        self.set_bit(BIT_OWNER_EXECUTE, value);
    }

    pub fn group_can_read(&self) -> bool {
        self.bit(BIT_GROUP_READ)
    }

    pub fn set_group_can_read(&mut self, value: bool) {
        self.set_bit(BIT_GROUP_READ, value);
    }

    pub fn group_can_write(&self) -> bool {
        self.bit(BIT_GROUP_WRITE)
    }

    pub fn set_group_can_write(&mut self, value: bool) {
        self.set_bit(BIT_GROUP_WRITE, value);
    }

    pub fn group_can_execute(&self) -> bool {
        self.bit(BIT_GROUP_EXECUTE)
    }

    pub fn set_group_can_execute(&mut self, value: bool) {
        self.set_bit(BIT_GROUP_EXECUTE, value);
    }

    pub fn others_can_read(&self) -> bool {
        self.bit(BIT_OTHERS_READ)
    }

    pub fn set_others_can_read(&mut self, value: bool) {
        self.set_bit(BIT_OTHERS_READ, value);
    }

    pub fn others_can_write(&self) -> bool {
        self.bit(BIT_OTHERS_WRITE)
    }

    pub fn set_others_can_write(&mut self, value: bool) {
        self.set_bit(BIT_OTHERS_WRITE, value);
    }

    pub fn others_can_execute(&self) -> bool {
        self.bit(BIT_OTHERS_EXECUTE)
    }

    pub fn set_others_can_execute(&mut self, value: bool) {
        self.set_bit(BIT_OTHERS_EXECUTE, value);
    }

    pub fn is_uid_set(&self) -> bool {
        self.bit(BIT_SET_UID)
    }

    pub fn set_is_uid_set(&mut self, value: bool) {
        self.set_bit(BIT_SET_UID, value);
    }

    pub fn is_gid_set(&self) -> bool {
        self.bit(BIT_SET_GID)
    }

    pub fn set_is_gid_set(&mut self, value: bool) {
        self.set_bit(BIT_SET_GID, value);
    }

    pub fn is_sticky_bit_set(&self) -> bool {
        self.bit(BIT_STICKY)
    }

    pub fn set_is_sticky_bit_set(&mut self, value: bool) {
        self.set_bit(BIT_STICKY, value);
    }

    fn type_nibble(&self) -> u32 {
        (self.permissions >> 12) & 0xF
    }

    pub fn is_socket(&self) -> bool {
        self.type_nibble() == TYPE_SOCKET
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.type_nibble() == TYPE_SYMLINK
    }

    pub fn is_regular_file(&self) -> bool {
        self.type_nibble() == TYPE_REGULAR_FILE
    }

    pub fn is_block_device(&self) -> bool {
        self.type_nibble() == TYPE_BLOCK_DEVICE
    }

    pub fn is_directory(&self) -> bool {
        self.type_nibble() == TYPE_DIRECTORY
    }

    pub fn is_character_device(&self) -> bool {
        self.type_nibble() == TYPE_CHARACTER_DEVICE
    }

    pub fn is_named_pipe(&self) -> bool {
        self.type_nibble() == TYPE_FIFO
    }

    /// Replace the POSIX mode with `mode`, given as up to four octal digits
    /// (special, user, group, other) packed in decimal, e.g. `644` or
    /// `4755`. The file-type nibble and any higher bits are untouched.
    ///
    /// # Errors
    ///
    /// Returns an argument error on a negative value, any digit above 7,
    /// or a fifth digit.
    pub fn set_permissions(&mut self, mode: i16) -> Result<()> {
        if mode < 0 {
            return Err(Error::argument("mode", "octal mode must not be negative"));
        }

        let mode = mode as u32;
        let special = mode / 1000;
        let user = mode % 1000 / 100;
        let group = mode % 100 / 10;
        let other = mode % 10;

        if special > 7 || user > 7 || group > 7 || other > 7 {
            return Err(Error::argument(
                "mode",
                format!("{} is not a valid four-digit octal mode", mode),
            ));
        }

        let bits = special * 0o1000 + user * 0o100 + group * 0o10 + other;
        self.permissions = (self.permissions & !0xFFF) | bits;
        Ok(())
    }

    /// Decode an `ATTRS` blob, remembering the decoded values as the
    /// baseline for change tracking.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("Insufficient data for attribute flags".into()));
        }

        let flags = buf.get_u32();
        let mut attrs = FileAttributes::default();

        if flags & FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("Insufficient data for size".into()));
            }
            attrs.size = buf.get_u64() as i64;
        }

        if flags & FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("Insufficient data for uid/gid".into()));
            }
            attrs.uid = buf.get_u32() as i32;
            attrs.gid = buf.get_u32() as i32;
        }

        if flags & FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(Error::Protocol("Insufficient data for permissions".into()));
            }
            attrs.permissions = buf.get_u32();
        }

        if flags & FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("Insufficient data for atime/mtime".into()));
            }
            attrs.atime = epoch_time(buf.get_u32());
            attrs.mtime = epoch_time(buf.get_u32());
        }

        if flags & FLAG_EXTENDED != 0 {
            let count = crate::protocol::codec::get_u32(buf)?;
            for _ in 0..count {
                let name = crate::protocol::codec::get_string(buf)?;
                let value = crate::protocol::codec::get_string(buf)?;
                attrs.extensions.push((name, value));
            }
        }

        attrs.original = attrs.snapshot();
        Ok(attrs)
    }

    /// Encode the attribute groups that changed since decode (or since
    /// construction). An unchanged record is exactly four zero bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        let size_changed = self.size != self.original.size;
        let uidgid_changed = self.uid != self.original.uid || self.gid != self.original.gid;
        let permissions_changed = self.permissions != self.original.permissions;
        let times_changed = self.atime.timestamp() != self.original.atime
            || self.mtime.timestamp() != self.original.mtime;
        let extended_changed = self.extensions != self.original.extensions;

        if size_changed {
            flags |= FLAG_SIZE;
        }
        if uidgid_changed {
            flags |= FLAG_UIDGID;
        }
        if permissions_changed {
            flags |= FLAG_PERMISSIONS;
        }
        if times_changed {
            flags |= FLAG_ACMODTIME;
        }
        if extended_changed && !self.extensions.is_empty() {
            flags |= FLAG_EXTENDED;
        }

        buf.put_u32(flags);

        if flags & FLAG_SIZE != 0 {
            buf.put_u64(self.size as u64);
        }
        if flags & FLAG_UIDGID != 0 {
            buf.put_u32(self.uid as u32);
            buf.put_u32(self.gid as u32);
        }
        if flags & FLAG_PERMISSIONS != 0 {
            buf.put_u32(self.permissions);
        }
        if flags & FLAG_ACMODTIME != 0 {
            buf.put_u32(wire_time(self.atime));
            buf.put_u32(wire_time(self.mtime));
        }
        if flags & FLAG_EXTENDED != 0 {
            buf.put_u32(self.extensions.len() as u32);
            for (name, value) in &self.extensions {
                crate::protocol::codec::put_string(&mut buf, name);
                crate::protocol::codec::put_string(&mut buf, value);
            }
        }

        buf
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            size: self.size,
            uid: self.uid,
            gid: self.gid,
            permissions: self.permissions,
            atime: self.atime.timestamp(),
            mtime: self.mtime.timestamp(),
            extensions: self.extensions.clone(),
        }
    }

    fn is_default(&self) -> bool {
        self.size == -1
            && self.uid == -1
            && self.gid == -1
            && self.permissions == 0
            && self.atime == DateTime::UNIX_EPOCH
            && self.mtime == DateTime::UNIX_EPOCH
            && self.extensions.is_empty()
    }
}

fn epoch_time(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn wire_time(time: DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

impl fmt::Display for FileAttributes {
    /// `ls -l` style rendering: type character, three permission triads
    /// with setuid/setgid/sticky overlays, then `Size:` and
    /// `LastWriteTime:` for fields that are present.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            return f.write_str("FileAttributes");
        }

        let mut out = String::with_capacity(48);

        out.push(match self.type_nibble() {
            TYPE_REGULAR_FILE => '-',
            TYPE_DIRECTORY => 'd',
            TYPE_SYMLINK => 'l',
            TYPE_SOCKET => 's',
            TYPE_FIFO => 'p',
            TYPE_CHARACTER_DEVICE => 'c',
            TYPE_BLOCK_DEVICE => 'b',
            _ => '?',
        });

        out.push(if self.owner_can_read() { 'r' } else { '-' });
        out.push(if self.owner_can_write() { 'w' } else { '-' });
        out.push(execute_char(
            self.owner_can_execute(),
            self.is_uid_set(),
            's',
            'S',
        ));

        out.push(if self.group_can_read() { 'r' } else { '-' });
        out.push(if self.group_can_write() { 'w' } else { '-' });
        out.push(execute_char(
            self.group_can_execute(),
            self.is_gid_set(),
            's',
            'S',
        ));

        out.push(if self.others_can_read() { 'r' } else { '-' });
        out.push(if self.others_can_write() { 'w' } else { '-' });
        out.push(execute_char(
            self.others_can_execute(),
            self.is_sticky_bit_set(),
            't',
            'T',
        ));

        if self.size != -1 {
            out.push_str(&format!(" Size: {}", self.size));
        }
        if self.mtime != DateTime::UNIX_EPOCH {
            out.push_str(&format!(
                " LastWriteTime: {}",
                self.mtime.format("%Y-%m-%dT%H:%M:%SZ")
            ));
        }

        f.write_str(out.trim_end())
    }
}

fn execute_char(execute: bool, overlay: bool, set: char, set_no_exec: char) -> char {
    match (overlay, execute) {
        (true, true) => set,
        (true, false) => set_no_exec,
        (false, true) => 'x',
        (false, false) => '-',
    }
}
