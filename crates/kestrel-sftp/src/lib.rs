//! # Kestrel SFTP
//!
//! SFTP v3 client core, riding on an already-established SSH channel.
//!
//! The crate implements the protocol as defined in
//! draft-ietf-secsh-filexfer-02, plus the OpenSSH extensions
//! `posix-rename@openssh.com`, `statvfs@openssh.com`,
//! `fstatvfs@openssh.com` and `hardlink@openssh.com`.
//!
//! ## Features
//!
//! - Full-duplex request/response multiplexing over one channel, with
//!   request-id correlation and strict framing
//! - Async/await with Tokio
//! - Seekable, buffered [`RemoteFile`] streams over remote handles
//! - Pipelined read-ahead that keeps a growing window of `READ` requests
//!   in flight
//! - Per-operation cancellation through [`CancellationToken`]; a cancelled
//!   wait keeps its request id registered and the late response is
//!   discarded
//! - Server-side path canonicalization and directory listing
//! - File attribute management with change-tracked encoding
//!
//! The SSH transport itself (key exchange, authentication, channel
//! windowing) is out of scope; the session consumes it through the
//! [`Transport`] trait, with an adapter for russh channels.

pub mod attrs;
pub mod config;
pub mod error;
pub mod file;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod transport;

pub use tokio_util::sync::CancellationToken;

pub use attrs::FileAttributes;
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use file::{FileAccess, FileMode, RemoteFile};
pub use protocol::{FileHandle, OpenFlags, StatVfs};
pub use reader::{PipelinedReader, ReadAheadPolicy};
pub use session::{DirEntry, NameEntry, SftpSession};
pub use transport::{session_over_channel, ChannelTransport, Transport};
