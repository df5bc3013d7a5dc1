//! Seekable buffered stream over a remote file handle
//!
//! A [`RemoteFile`] layers buffered writes and read-ahead over the
//! session's single-request primitives. Whether the stream supports
//! seeking is decided once, at open time: if the post-open `FSTAT` reports
//! a size, the stream is seekable and a read-ahead pipeline is seeded with
//! that size; otherwise `position`/`length`/`seek`/`set_len` are
//! unsupported but plain reads and writes still work (some servers and
//! object-store gateways legitimately refuse `FSTAT`).
//!
//! A stream is not thread-safe with respect to itself; it serializes its
//! own writes through the flush point. The write buffer and a live read
//! buffer are never simultaneously non-empty. Operations take a
//! [`CancellationToken`]; a cancelled call aborts the wait only, and the
//! stream stays usable.

use std::cmp;
use std::io::SeekFrom;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{FileHandle, OpenFlags};
use crate::reader::{PipelinedReader, ReadAheadPolicy};
use crate::session::SftpSession;
use crate::{Error, Result};

/// How an existing or missing remote file is treated at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Open an existing file; fail if it does not exist
    Open,
    /// Open an existing file or create it
    OpenOrCreate,
    /// Create the file, truncating it if it exists
    Create,
    /// Create the file; fail if it already exists
    CreateNew,
    /// Truncate an existing file
    Truncate,
    /// Open or create, positioned at end of file
    Append,
}

/// Requested stream access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

impl FileAccess {
    fn has_read(self) -> bool {
        matches!(self, FileAccess::Read | FileAccess::ReadWrite)
    }

    fn has_write(self) -> bool {
        matches!(self, FileAccess::Write | FileAccess::ReadWrite)
    }
}

/// A byte stream over a remote file handle.
#[derive(Debug)]
pub struct RemoteFile {
    session: Arc<SftpSession>,
    handle: FileHandle,
    readable: bool,
    writable: bool,
    seekable: bool,
    closed: bool,
    position: u64,
    buffer_size: usize,
    read_chunk_size: u32,
    read_buf: Bytes,
    write_buf: Vec<u8>,
    reader: Option<PipelinedReader>,
}

impl RemoteFile {
    /// Open `path` with the session's configured buffer size.
    pub async fn open(
        session: Arc<SftpSession>,
        path: &str,
        mode: FileMode,
        access: FileAccess,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let buffer_size = session.config().write_buffer_size;
        Self::open_with_buffer_size(session, path, mode, access, buffer_size, cancel).await
    }

    /// Open `path` with an explicit buffer size.
    ///
    /// # Errors
    ///
    /// Argument errors are raised before any network I/O: a zero buffer,
    /// `Append` without write-only access, or a read-only stream combined
    /// with a create-flavored mode.
    pub async fn open_with_buffer_size(
        session: Arc<SftpSession>,
        path: &str,
        mode: FileMode,
        access: FileAccess,
        buffer_size: usize,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        if buffer_size == 0 {
            return Err(Error::argument("buffer_size", "buffer size must be non-zero"));
        }
        if mode == FileMode::Append && access != FileAccess::Write {
            return Err(Error::argument(
                "access",
                "append mode requires write-only access",
            ));
        }
        if access == FileAccess::Read
            && matches!(
                mode,
                FileMode::Create | FileMode::CreateNew | FileMode::Truncate | FileMode::Append
            )
        {
            return Err(Error::argument(
                "access",
                "a read-only stream cannot create, truncate or append",
            ));
        }

        let mut flags = match access {
            FileAccess::Read => OpenFlags::READ,
            FileAccess::Write => OpenFlags::WRITE,
            FileAccess::ReadWrite => OpenFlags::READ | OpenFlags::WRITE,
        };
        flags |= match mode {
            FileMode::Open => 0,
            FileMode::OpenOrCreate => OpenFlags::CREAT,
            FileMode::Create => OpenFlags::CREAT | OpenFlags::TRUNC,
            FileMode::CreateNew => OpenFlags::CREAT | OpenFlags::EXCL,
            FileMode::Truncate => OpenFlags::TRUNC,
            FileMode::Append => OpenFlags::APPEND | OpenFlags::CREAT,
        };

        let path = session.canonical_path(path, cancel).await?;
        let handle = session.open(&path, OpenFlags(flags), cancel).await?;

        let readable = access.has_read();
        let writable = access.has_write();
        let read_chunk_size = session.calculate_optimal_read_length(buffer_size as u32);
        let max_pending = session.config().max_pending_reads;

        // Seekability is a one-shot decision made here and never re-probed.
        let (seekable, position, reader) = match session.fstat(&handle, cancel).await {
            Ok(attrs) if attrs.size() >= 0 => {
                let size = attrs.size() as u64;
                let position = if mode == FileMode::Append { size } else { 0 };
                let reader = if readable {
                    Some(PipelinedReader::new(
                        session.clone(),
                        &handle,
                        read_chunk_size,
                        max_pending,
                        position,
                        Some(size),
                        ReadAheadPolicy::Incremental,
                    )?)
                } else {
                    None
                };
                (true, position, reader)
            }
            Err(e @ Error::Cancelled(_)) => {
                // Cancelled between OPEN and FSTAT: release the handle
                // rather than leak it on the server.
                let close_cancel = CancellationToken::new();
                let _ = session.close_handle(&handle, &close_cancel).await;
                return Err(e);
            }
            _ => {
                debug!(path = %path, "No size reported for handle; stream is not seekable");
                (false, 0, None)
            }
        };

        Ok(RemoteFile {
            session,
            handle,
            readable,
            writable,
            seekable,
            closed: false,
            position,
            buffer_size,
            read_chunk_size,
            read_buf: Bytes::new(),
            write_buf: Vec::with_capacity(buffer_size),
            reader,
        })
    }

    /// The server handle backing this stream.
    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    pub fn can_read(&self) -> bool {
        self.readable
    }

    pub fn can_write(&self) -> bool {
        self.writable
    }

    pub fn can_seek(&self) -> bool {
        self.seekable
    }

    /// Caller-visible byte offset: the position of the next read or write.
    pub fn position(&self) -> Result<u64> {
        self.ensure_not_closed()?;
        if !self.seekable {
            return Err(Error::Unsupported("stream does not support seeking".into()));
        }
        Ok(self.position)
    }

    /// Current file size, from a fresh `FSTAT`.
    pub async fn length(&mut self, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_not_closed()?;
        if !self.seekable {
            return Err(Error::Unsupported("stream does not support seeking".into()));
        }
        self.flush_write_buffer(cancel).await?;
        let attrs = self.session.fstat(&self.handle, cancel).await?;
        match attrs.size() {
            size if size >= 0 => Ok(size as u64),
            _ => Err(Error::Io("the server stopped reporting a file size".into())),
        }
    }

    /// Read up to `buf.len()` bytes, returning the number copied. Zero
    /// means end of file.
    ///
    /// A cancelled call leaves the stream and its read-ahead pipeline
    /// intact; a later call continues from the same position.
    pub async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        self.ensure_not_closed()?;
        if !self.readable {
            return Err(Error::Unsupported("stream does not support reading".into()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.read_buf.is_empty() {
            self.flush_write_buffer(cancel).await?;

            let mut reader = match self.reader.take() {
                Some(reader) => reader,
                None => self.new_reader()?,
            };

            match reader.read_next(cancel).await {
                Ok(chunk) if chunk.is_empty() => {
                    // Discard the reader: a fresh one next time picks up
                    // bytes appended after this EOF.
                    return Ok(0);
                }
                Ok(chunk) => {
                    self.read_buf = chunk;
                    self.reader = Some(reader);
                }
                Err(e) => {
                    self.reader = Some(reader);
                    return Err(e);
                }
            }
        }

        let n = cmp::min(buf.len(), self.read_buf.len());
        buf[..n].copy_from_slice(&self.read_buf[..n]);
        self.read_buf.advance(n);
        self.position += n as u64;
        Ok(n)
    }

    /// Append `data` to the write buffer, flushing each time it fills.
    ///
    /// The position advances immediately; the bytes reach the server at
    /// the next flush point.
    pub async fn write(&mut self, mut data: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.ensure_not_closed()?;
        if !self.writable {
            return Err(Error::Unsupported("stream does not support writing".into()));
        }

        // Writing invalidates any buffered reads.
        self.read_buf = Bytes::new();
        self.reader = None;

        while !data.is_empty() {
            let space = self.buffer_size - self.write_buf.len();
            let n = cmp::min(space, data.len());
            self.write_buf.extend_from_slice(&data[..n]);
            self.position += n as u64;
            data = &data[n..];

            if self.write_buf.len() == self.buffer_size {
                self.flush_write_buffer(cancel).await?;
            }
        }
        Ok(())
    }

    /// Send any buffered writes to the server.
    pub async fn flush(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_not_closed()?;
        self.flush_write_buffer(cancel).await
    }

    /// Move the stream position. A position inside the current read buffer
    /// slides the buffer view without a network round trip.
    pub async fn seek(&mut self, pos: SeekFrom, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_not_closed()?;
        if !self.seekable {
            return Err(Error::Unsupported("stream does not support seeking".into()));
        }
        self.flush_write_buffer(cancel).await?;

        let target: i64 = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset)
                .map_err(|_| Error::argument("offset", "offset does not fit a signed position"))?,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => {
                let attrs = self.session.fstat(&self.handle, cancel).await?;
                attrs.size() + delta
            }
        };
        if target < 0 {
            return Err(Error::Io(
                "An attempt was made to move the position before the beginning of the stream"
                    .into(),
            ));
        }
        let target = target as u64;

        if target >= self.position && target - self.position <= self.read_buf.len() as u64 {
            // The destination is inside the buffered chunk.
            self.read_buf.advance((target - self.position) as usize);
        } else {
            self.read_buf = Bytes::new();
            self.reader = None;
        }

        self.position = target;
        Ok(target)
    }

    /// Truncate or extend the file to `value` bytes.
    pub async fn set_len(&mut self, value: u64, cancel: &CancellationToken) -> Result<()> {
        self.ensure_not_closed()?;
        if !self.writable || !self.seekable {
            return Err(Error::Unsupported(
                "set_len requires a writable, seekable stream".into(),
            ));
        }
        self.flush_write_buffer(cancel).await?;
        self.read_buf = Bytes::new();
        self.reader = None;

        let mut attrs = self.session.fstat(&self.handle, cancel).await?;
        attrs.set_size(value as i64);
        self.session.fsetstat(&self.handle, &attrs, cancel).await?;

        if self.position > value {
            self.position = value;
        }
        Ok(())
    }

    /// Flush buffered writes and release the server handle.
    ///
    /// Closing twice is a no-op; exactly one `CLOSE` is issued. After
    /// closing, every operation fails with a disposed error. The close
    /// itself is not cancellable; the handle must not leak.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader = None;

        let cancel = CancellationToken::new();

        // A failed flush must not leak the handle.
        let flushed = if self.session.is_open() {
            self.flush_write_buffer(&cancel).await
        } else {
            Ok(())
        };
        let released = if self.session.is_open() {
            self.session.close_handle(&self.handle, &cancel).await
        } else {
            Ok(())
        };
        flushed.and(released)
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn new_reader(&self) -> Result<PipelinedReader> {
        // Created on demand after writes or seeks; the size is deliberately
        // unknown so a file growing under us reads to its new end.
        PipelinedReader::new(
            self.session.clone(),
            &self.handle,
            self.read_chunk_size,
            self.session.config().max_pending_reads,
            self.position,
            None,
            ReadAheadPolicy::Incremental,
        )
    }

    async fn flush_write_buffer(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let offset = self
            .position
            .checked_sub(self.write_buf.len() as u64)
            .ok_or_else(|| {
                Error::Io("the write buffer is ahead of the stream position".into())
            })?;
        self.session
            .write(&self.handle, offset, &self.write_buf, cancel)
            .await?;
        self.write_buf.clear();
        Ok(())
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.write_buf.is_empty() {
            warn!("remote file dropped with unflushed writes; buffered data is lost");
        }
        if self.session.is_open() {
            let session = self.session.clone();
            let handle = self.handle.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move {
                        let cancel = CancellationToken::new();
                        if let Err(e) = session.close_handle(&handle, &cancel).await {
                            debug!("Background close of a dropped file failed: {}", e);
                        }
                    });
                }
                Err(_) => {
                    warn!("remote file dropped outside a runtime; the server handle leaks");
                }
            }
        }
    }
}
