//! SFTP wire protocol definitions
//!
//! This module implements the client side of the SSH File Transfer Protocol
//! as defined in draft-ietf-secsh-filexfer-02, plus the OpenSSH extensions
//! advertised by `sftp-server` (posix-rename, statvfs, fstatvfs, hardlink).
//!
//! Every packet on the wire is a 4-byte big-endian length followed by that
//! many payload bytes. The first payload byte is the message type; for all
//! messages except `INIT`/`VERSION` the next four bytes are the request id.

use bytes::Buf;

/// Highest SFTP protocol version this client speaks.
pub const SFTP_VERSION: u32 = 3;

/// Bytes of SFTP `DATA` response framing around the actual file data:
/// packet length (4) + type (1) + request id (4) + data length (4).
///
/// A `READ` for `min(buffer, packet) - 13` bytes keeps the whole response
/// inside one SSH channel-data message.
pub const DATA_PACKET_OVERHEAD: u32 = 13;

/// Bytes of SFTP `WRITE` request framing around the data, excluding the
/// handle: packet length (4) + type (1) + request id (4) + handle length
/// prefix (4) + offset (8) + data length prefix (4).
pub const WRITE_PACKET_OVERHEAD: u32 = 25;

/// SFTP message types (as defined in the SFTP specification)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path (do not follow symlinks)
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get canonical path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (directory listings, realpath, readlink)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// SFTP status codes carried in `STATUS` responses.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

impl StatusCode {
    /// Human-readable message used when the server sends an empty error
    /// message with a status response.
    pub fn default_message(code: u32) -> String {
        match code {
            0 => "The operation completed successfully.".to_string(),
            2 => "No such file or directory.".to_string(),
            3 => "Permission denied.".to_string(),
            4 => "The requested operation failed.".to_string(),
            5 => "The server received a badly formatted message.".to_string(),
            8 => "The requested operation is not supported.".to_string(),
            other => format!("Server returned status code {}.", other),
        }
    }
}

/// File open flags for `SSH_FXP_OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// Extension names advertised in `VERSION` and invoked via `EXTENDED`.
pub mod extensions {
    pub const POSIX_RENAME: &str = "posix-rename@openssh.com";
    pub const STATVFS: &str = "statvfs@openssh.com";
    pub const FSTATVFS: &str = "fstatvfs@openssh.com";
    pub const HARDLINK: &str = "hardlink@openssh.com";
}

/// File-system information from a `statvfs@openssh.com` reply.
///
/// All fields are 64-bit, in the order OpenSSH's `sftp-server` emits them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatVfs {
    /// File system block size
    pub bsize: u64,
    /// Fundamental file system block size
    pub frsize: u64,
    /// Number of blocks (in units of `frsize`)
    pub blocks: u64,
    /// Free blocks in the file system
    pub bfree: u64,
    /// Free blocks for the unprivileged user
    pub bavail: u64,
    /// Total file inodes
    pub files: u64,
    /// Free file inodes
    pub ffree: u64,
    /// Free file inodes for the unprivileged user
    pub favail: u64,
    /// File system id
    pub fsid: u64,
    /// Bit mask of mount flags
    pub flag: u64,
    /// Maximum filename length
    pub namemax: u64,
}

impl StatVfs {
    /// Decode a `statvfs` reply body.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        if buf.remaining() < 11 * 8 {
            return Err(crate::Error::Protocol(
                "Insufficient data for statvfs reply".into(),
            ));
        }
        Ok(StatVfs {
            bsize: buf.get_u64(),
            frsize: buf.get_u64(),
            blocks: buf.get_u64(),
            bfree: buf.get_u64(),
            bavail: buf.get_u64(),
            files: buf.get_u64(),
            ffree: buf.get_u64(),
            favail: buf.get_u64(),
            fsid: buf.get_u64(),
            flag: buf.get_u64(),
            namemax: buf.get_u64(),
        })
    }

    /// Total capacity in bytes.
    pub fn total_space(&self) -> u64 {
        self.frsize.saturating_mul(self.blocks)
    }

    /// Free bytes in the file system.
    pub fn free_space(&self) -> u64 {
        self.frsize.saturating_mul(self.bfree)
    }

    /// Bytes available to the unprivileged user.
    pub fn available_space(&self) -> u64 {
        self.frsize.saturating_mul(self.bavail)
    }
}

/// An opaque file or directory handle issued by the server.
///
/// The stream (or directory iterator) that opened it owns it and releases
/// it with `CLOSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        FileHandle(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Helper functions for encoding/decoding SFTP protocol strings
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode an SFTP string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Encode bytes as SFTP string (length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol(
                "Insufficient data for string length".into(),
            ));
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("Insufficient data for string".into()));
        }

        let bytes = &buf[..len];
        buf.advance(len);

        Ok(bytes.to_vec())
    }

    /// Decode a big-endian u32 with a bounds check.
    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("Insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    /// Decode a big-endian u64 with a bounds check.
    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::Error::Protocol("Insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }
}
