//! SFTP session: packet framing and request multiplexing
//!
//! One session rides one SSH channel. Outbound requests are assigned a
//! 32-bit id from a monotonically increasing counter and registered in a
//! pending table before the packet is sent; the inbound framer reassembles
//! length-prefixed packets, decodes them, and completes the matching
//! pending entry. Responses may complete in any order; the session only
//! guarantees that each response reaches the caller that sent the request
//! with that id.
//!
//! A response carrying an id with no pending entry is a protocol violation
//! and fails the whole session, as does any framing or decode error.
//!
//! Every operation takes a [`CancellationToken`] and applies the
//! configured timeout. Neither a timeout nor a cancellation withdraws the
//! in-flight request: the pending entry stays registered, the waiter gives
//! up, and the eventual response is dispatched into an abandoned
//! completion slot and discarded. That keeps request-id accounting
//! consistent, and the session stays healthy.

use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::attrs::FileAttributes;
use crate::config::SessionConfig;
use crate::protocol::{
    codec, extensions, FileHandle, MessageType, StatVfs, StatusCode, DATA_PACKET_OVERHEAD,
    SFTP_VERSION, WRITE_PACKET_OVERHEAD,
};
use crate::transport::Transport;
use crate::{Error, Result};

/// A decoded response packet, minus its request id.
#[derive(Debug)]
pub(crate) enum Response {
    Status { code: u32, message: String },
    Handle(FileHandle),
    Data(Bytes),
    Attrs(FileAttributes),
    Name(Vec<NameEntry>),
    ExtendedReply(Bytes),
}

impl Response {
    fn kind(&self) -> &'static str {
        match self {
            Response::Status { .. } => "STATUS",
            Response::Handle(_) => "HANDLE",
            Response::Data(_) => "DATA",
            Response::Attrs(_) => "ATTRS",
            Response::Name(_) => "NAME",
            Response::ExtendedReply(_) => "EXTENDED_REPLY",
        }
    }
}

/// One `(name, longname, attrs)` triple from a `NAME` response.
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attributes: FileAttributes,
}

/// A directory listing entry with its full remote path.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Short name as the server returned it
    pub name: String,
    /// Full path: listing base + `/` + short name
    pub path: String,
    /// The server's `ls -l` style listing line
    pub longname: String,
    pub attributes: FileAttributes,
}

/// Completion slot for one in-flight request.
pub(crate) struct PendingReply {
    rx: oneshot::Receiver<Result<Response>>,
    timeout: Duration,
}

impl PendingReply {
    pub(crate) async fn wait(self, cancel: &CancellationToken) -> Result<Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(
                "the operation was cancelled while waiting for a response".into(),
            )),
            result = tokio::time::timeout(self.timeout, self.rx) => match result {
                Err(_) => Err(Error::Timeout(
                    "the operation did not complete within the configured timeout".into(),
                )),
                Ok(Err(_)) => Err(Error::ConnectionClosed(
                    "session closed while waiting for a response".into(),
                )),
                Ok(Ok(result)) => result,
            },
        }
    }
}

/// An issued `READ` whose response has not been awaited yet.
///
/// Resolves to the data bytes; an EOF status resolves to an empty slice.
/// Waiting takes `&mut self` so a cancelled or abandoned wait can be
/// retried later: the request id stays live in the session and the
/// response stays claimable.
pub(crate) struct PendingRead {
    reply: PendingReply,
}

impl PendingRead {
    pub(crate) async fn wait(&mut self, cancel: &CancellationToken) -> Result<Bytes> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("the read was cancelled".into()));
            }
            result = tokio::time::timeout(self.reply.timeout, &mut self.reply.rx) => match result {
                Err(_) => {
                    return Err(Error::Timeout(
                        "the read did not complete within the configured timeout".into(),
                    ));
                }
                Ok(Err(_)) => {
                    return Err(Error::ConnectionClosed(
                        "session closed while waiting for a read".into(),
                    ));
                }
                Ok(Ok(result)) => result?,
            },
        };

        match response {
            Response::Data(data) => Ok(data),
            Response::Status { code, .. } if code == StatusCode::Eof as u32 => Ok(Bytes::new()),
            Response::Status { code, message } => Err(Error::from_status(code, &message, None)),
            other => Err(Error::Protocol(format!(
                "Expected DATA or STATUS, got {}",
                other.kind()
            ))),
        }
    }
}

struct Negotiated {
    version: u32,
    extensions: HashMap<String, String>,
}

/// An SFTP v3 session multiplexing requests over one SSH channel.
pub struct SftpSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Response>>>>,
    recv_buf: Mutex<BytesMut>,
    version_waiter: Mutex<Option<oneshot::Sender<Result<(u32, HashMap<String, String>)>>>>,
    negotiated: Mutex<Option<Negotiated>>,
    working_dir: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpSession")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SftpSession {
    /// Create a session over `transport`. No packets are exchanged until
    /// [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Arc<Self> {
        Arc::new(SftpSession {
            transport,
            config,
            next_request_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            recv_buf: Mutex::new(BytesMut::new()),
            version_waiter: Mutex::new(None),
            negotiated: Mutex::new(None),
            working_dir: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Perform the version handshake and resolve the initial working
    /// directory.
    ///
    /// Sends `INIT` with version 3, waits for `VERSION`, then issues
    /// `REALPATH(".")`. No other request is accepted before this completes.
    ///
    /// # Errors
    ///
    /// Fails if the server responds with a version above 3, the handshake
    /// times out or is cancelled, or the channel closes.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if self.negotiated.lock().unwrap().is_some() {
            return Err(Error::Protocol("version handshake already completed".into()));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiter = self.version_waiter.lock().unwrap();
            if waiter.is_some() {
                return Err(Error::Protocol("version handshake already in progress".into()));
            }
            *waiter = Some(tx);
        }

        debug!("Initializing SFTP protocol");
        let mut packet = BytesMut::with_capacity(9);
        packet.put_u32(5);
        packet.put_u8(MessageType::Init as u8);
        packet.put_u32(SFTP_VERSION);
        self.transport.send_bytes(packet.freeze()).await?;

        let (version, extensions) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("the version handshake was cancelled".into()));
            }
            result = tokio::time::timeout(self.config.operation_timeout(), rx) => match result {
                Err(_) => {
                    return Err(Error::Timeout(
                        "timed out waiting for the server VERSION response".into(),
                    ));
                }
                Ok(Err(_)) => {
                    return Err(Error::ConnectionClosed(
                        "session closed during the version handshake".into(),
                    ));
                }
                Ok(Ok(result)) => result?,
            },
        };

        if version > SFTP_VERSION {
            let err = Error::Protocol(format!(
                "Server version {} is not supported (maximum {})",
                version, SFTP_VERSION
            ));
            self.fail_session(err.clone());
            return Err(err);
        }

        info!(version, extensions = extensions.len(), "SFTP session established");
        *self.negotiated.lock().unwrap() = Some(Negotiated {
            version,
            extensions,
        });

        let cwd = self.realpath(".", cancel).await?;
        debug!(cwd = %cwd, "Resolved initial working directory");
        *self.working_dir.lock().unwrap() = Some(cwd);
        Ok(())
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Negotiated protocol version, once [`connect`](Self::connect) has
    /// completed.
    pub fn protocol_version(&self) -> Option<u32> {
        self.negotiated.lock().unwrap().as_ref().map(|n| n.version)
    }

    /// Extensions advertised by the server in `VERSION`.
    pub fn server_extensions(&self) -> HashMap<String, String> {
        self.negotiated
            .lock()
            .unwrap()
            .as_ref()
            .map(|n| n.extensions.clone())
            .unwrap_or_default()
    }

    /// Whether the server advertised the named extension.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.negotiated
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|n| n.extensions.contains_key(name))
    }

    /// The server-resolved current working directory.
    pub fn working_directory(&self) -> Option<String> {
        self.working_dir.lock().unwrap().clone()
    }

    /// Whether the session can still issue requests.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.is_open()
    }

    /// Close the session: the channel is closed and every waiter receives a
    /// disconnection error.
    pub fn shutdown(&self) {
        self.fail_session(Error::ConnectionClosed("session disposed".into()));
    }

    // ===== inbound framing =====

    /// Feed raw SSH channel-data bytes into the session.
    ///
    /// Multiple packets may arrive per call, or a single packet may span
    /// calls. Must be driven from a single ingress task. A framing or
    /// decode error fails the session and every outstanding request.
    pub fn handle_channel_data(&self, data: &[u8]) -> Result<()> {
        let result = self.feed(data);
        if let Err(ref e) = result {
            self.fail_session(e.clone());
        }
        result
    }

    /// Tear the session down after the channel closed underneath it.
    pub fn handle_channel_closed(&self) {
        self.fail_session(Error::ConnectionClosed("the SSH channel was closed".into()));
    }

    fn feed(&self, mut data: &[u8]) -> Result<()> {
        let mut buf = self.recv_buf.lock().unwrap();
        if buf.is_empty() {
            // Fast path: decode packets straight out of the inbound slice,
            // only copying a trailing partial packet.
            while data.len() >= 4 {
                let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                check_packet_len(len)?;
                if data.len() < 4 + len {
                    break;
                }
                self.dispatch_packet(&data[4..4 + len])?;
                data = &data[4 + len..];
            }
            if !data.is_empty() {
                buf.extend_from_slice(data);
            }
        } else {
            buf.extend_from_slice(data);
            loop {
                if buf.len() < 4 {
                    break;
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                check_packet_len(len)?;
                if buf.len() < 4 + len {
                    break;
                }
                let packet = buf.split_to(4 + len);
                self.dispatch_packet(&packet[4..])?;
            }
        }
        Ok(())
    }

    fn dispatch_packet(&self, packet: &[u8]) -> Result<()> {
        let msg_type = MessageType::try_from(packet[0])?;
        let mut buf = &packet[1..];

        if msg_type == MessageType::Version {
            let version = codec::get_u32(&mut buf)?;
            let mut extensions = HashMap::new();
            while !buf.is_empty() {
                let name = codec::get_string(&mut buf)?;
                let value = codec::get_string(&mut buf)?;
                extensions.insert(name, value);
            }
            let waiter = self.version_waiter.lock().unwrap().take();
            return match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok((version, extensions)));
                    Ok(())
                }
                None => Err(Error::Protocol("unsolicited VERSION response".into())),
            };
        }

        let id = codec::get_u32(&mut buf)?;
        let response = decode_response(msg_type, buf)?;

        let sender = self.pending.lock().unwrap().remove(&id);
        match sender {
            Some(tx) => {
                // The waiter may have timed out, been cancelled, or been
                // dropped; the late response is discarded here.
                let _ = tx.send(Ok(response));
                Ok(())
            }
            None => Err(Error::Protocol(format!(
                "Invalid response: no request with id {} is pending",
                id
            ))),
        }
    }

    fn fail_session(&self, err: Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Failing SFTP session: {}", err);
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
        if let Some(tx) = self.version_waiter.lock().unwrap().take() {
            let _ = tx.send(Err(err.clone()));
        }
        self.transport.close();
    }

    // ===== request plumbing =====

    fn next_request_id(&self) -> u32 {
        // 64-bit counter truncated to the wire's 32 bits; wrapping is fine
        // because ids only need to be unique among live requests.
        self.next_request_id.fetch_add(1, Ordering::Relaxed) as u32
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed("session is closed".into()));
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        self.ensure_open()?;
        if self.negotiated.lock().unwrap().is_none() {
            return Err(Error::ConnectionClosed(
                "the version handshake has not completed".into(),
            ));
        }
        Ok(())
    }

    async fn send_request(&self, msg_type: MessageType, payload: &[u8]) -> Result<PendingReply> {
        self.ensure_connected()?;
        let id = self.next_request_id();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut packet = BytesMut::with_capacity(9 + payload.len());
        packet.put_u32((payload.len() + 5) as u32);
        packet.put_u8(msg_type as u8);
        packet.put_u32(id);
        packet.extend_from_slice(payload);

        if let Err(e) = self.transport.send_bytes(packet.freeze()).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(PendingReply {
            rx,
            timeout: self.config.operation_timeout(),
        })
    }

    async fn request(
        &self,
        msg_type: MessageType,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("the operation was cancelled".into()));
        }
        self.send_request(msg_type, payload).await?.wait(cancel).await
    }

    fn check_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::argument("path", "path must not be empty"));
        }
        Ok(())
    }

    // ===== typed operations =====

    /// Open a file and return its handle.
    pub async fn open(
        &self,
        path: &str,
        flags: crate::protocol::OpenFlags,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        payload.put_u32(flags.0);
        payload.extend_from_slice(&FileAttributes::default().encode());
        let response = self.request(MessageType::Open, &payload, cancel).await?;
        expect_handle(response, path)
    }

    /// Release a file or directory handle.
    pub async fn close_handle(
        &self,
        handle: &FileHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut payload = BytesMut::new();
        codec::put_bytes(&mut payload, handle.as_bytes());
        let response = self.request(MessageType::Close, &payload, cancel).await?;
        expect_status(response, None)
    }

    /// Read up to `len` bytes at `offset`. An empty slice means end of
    /// file.
    pub async fn read(
        &self,
        handle: &FileHandle,
        offset: u64,
        len: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("the read was cancelled".into()));
        }
        let mut pending = self.begin_read(handle, offset, len).await?;
        pending.wait(cancel).await
    }

    /// Issue a `READ` without awaiting its response, for pipelining.
    pub(crate) async fn begin_read(
        &self,
        handle: &FileHandle,
        offset: u64,
        len: u32,
    ) -> Result<PendingRead> {
        let mut payload = BytesMut::with_capacity(16 + handle.len());
        codec::put_bytes(&mut payload, handle.as_bytes());
        payload.put_u64(offset);
        payload.put_u32(len);
        let reply = self.send_request(MessageType::Read, &payload).await?;
        Ok(PendingRead { reply })
    }

    /// Write `data` at `offset`.
    pub async fn write(
        &self,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut payload = BytesMut::with_capacity(16 + handle.len() + data.len());
        codec::put_bytes(&mut payload, handle.as_bytes());
        payload.put_u64(offset);
        codec::put_bytes(&mut payload, data);
        let response = self.request(MessageType::Write, &payload, cancel).await?;
        expect_status(response, None)
    }

    /// Get attributes for `path`, without following a final symlink.
    pub async fn lstat(&self, path: &str, cancel: &CancellationToken) -> Result<FileAttributes> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Lstat, &payload, cancel).await?;
        expect_attrs(response, Some(path))
    }

    /// Get attributes for an open handle.
    pub async fn fstat(
        &self,
        handle: &FileHandle,
        cancel: &CancellationToken,
    ) -> Result<FileAttributes> {
        let mut payload = BytesMut::new();
        codec::put_bytes(&mut payload, handle.as_bytes());
        let response = self.request(MessageType::Fstat, &payload, cancel).await?;
        expect_attrs(response, None)
    }

    /// Get attributes for `path`, following symlinks.
    pub async fn stat(&self, path: &str, cancel: &CancellationToken) -> Result<FileAttributes> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Stat, &payload, cancel).await?;
        expect_attrs(response, Some(path))
    }

    /// Apply the changed attribute groups of `attrs` to `path`.
    pub async fn setstat(
        &self,
        path: &str,
        attrs: &FileAttributes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        payload.extend_from_slice(&attrs.encode());
        let response = self.request(MessageType::Setstat, &payload, cancel).await?;
        expect_status(response, Some(path))
    }

    /// Apply the changed attribute groups of `attrs` to an open handle.
    pub async fn fsetstat(
        &self,
        handle: &FileHandle,
        attrs: &FileAttributes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut payload = BytesMut::new();
        codec::put_bytes(&mut payload, handle.as_bytes());
        payload.extend_from_slice(&attrs.encode());
        let response = self.request(MessageType::Fsetstat, &payload, cancel).await?;
        expect_status(response, None)
    }

    /// Open a directory for reading.
    pub async fn opendir(&self, path: &str, cancel: &CancellationToken) -> Result<FileHandle> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Opendir, &payload, cancel).await?;
        expect_handle(response, path)
    }

    /// Read the next batch of directory entries. `None` means end of
    /// directory.
    pub async fn readdir(
        &self,
        handle: &FileHandle,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<NameEntry>>> {
        let mut payload = BytesMut::new();
        codec::put_bytes(&mut payload, handle.as_bytes());
        match self.request(MessageType::Readdir, &payload, cancel).await? {
            Response::Name(entries) => Ok(Some(entries)),
            Response::Status { code, .. } if code == StatusCode::Eof as u32 => Ok(None),
            Response::Status { code, message } => Err(Error::from_status(code, &message, None)),
            other => Err(Error::Protocol(format!(
                "Expected NAME or STATUS, got {}",
                other.kind()
            ))),
        }
    }

    /// Remove a file.
    pub async fn remove(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_path(path)?;
        debug!("Removing file: {}", path);
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Remove, &payload, cancel).await?;
        expect_status(response, Some(path))
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_path(path)?;
        debug!("Creating directory: {}", path);
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        payload.extend_from_slice(&FileAttributes::default().encode());
        let response = self.request(MessageType::Mkdir, &payload, cancel).await?;
        expect_status(response, Some(path))
    }

    /// Remove a directory.
    pub async fn rmdir(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_path(path)?;
        debug!("Removing directory: {}", path);
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Rmdir, &payload, cancel).await?;
        expect_status(response, Some(path))
    }

    /// Ask the server to canonicalize `path`.
    pub async fn realpath(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        match self.request(MessageType::Realpath, &payload, cancel).await? {
            Response::Name(mut entries) if !entries.is_empty() => {
                Ok(std::mem::take(&mut entries[0].filename))
            }
            Response::Name(_) => Err(Error::Protocol("Empty REALPATH response".into())),
            Response::Status { code, message } => {
                Err(Error::from_status(code, &message, Some(path)))
            }
            other => Err(Error::Protocol(format!(
                "Expected NAME or STATUS, got {}",
                other.kind()
            ))),
        }
    }

    /// `REALPATH` that swallows server errors and returns `None` instead.
    pub async fn realpath_or_none(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        match self.realpath(path, cancel).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(Error::PathNotFound(_))
            | Err(Error::PermissionDenied(_))
            | Err(Error::Sftp { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rename `old_path` to `new_path`.
    pub async fn rename(
        &self,
        old_path: &str,
        new_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_path(old_path)?;
        Self::check_path(new_path)?;
        debug!("Renaming {} to {}", old_path, new_path);
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, old_path);
        codec::put_string(&mut payload, new_path);
        let response = self.request(MessageType::Rename, &payload, cancel).await?;
        expect_status(response, Some(old_path))
    }

    /// Atomic rename via the `posix-rename@openssh.com` extension.
    pub async fn posix_rename(
        &self,
        old_path: &str,
        new_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_path(old_path)?;
        Self::check_path(new_path)?;
        self.require_extension(extensions::POSIX_RENAME)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, extensions::POSIX_RENAME);
        codec::put_string(&mut payload, old_path);
        codec::put_string(&mut payload, new_path);
        let response = self.request(MessageType::Extended, &payload, cancel).await?;
        expect_status(response, Some(old_path))
    }

    /// Read the target of a symbolic link.
    pub async fn readlink(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check_path(path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, path);
        match self.request(MessageType::Readlink, &payload, cancel).await? {
            Response::Name(mut entries) if !entries.is_empty() => {
                Ok(std::mem::take(&mut entries[0].filename))
            }
            Response::Name(_) => Err(Error::Protocol("Empty READLINK response".into())),
            Response::Status { code, message } => {
                Err(Error::from_status(code, &message, Some(path)))
            }
            other => Err(Error::Protocol(format!(
                "Expected NAME or STATUS, got {}",
                other.kind()
            ))),
        }
    }

    /// Create a symbolic link at `link_path` pointing to `target_path`.
    ///
    /// Arguments are sent in the order OpenSSH's `sftp-server` expects
    /// (target first), which is reversed from the filexfer draft.
    pub async fn symlink(
        &self,
        target_path: &str,
        link_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_path(target_path)?;
        Self::check_path(link_path)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, target_path);
        codec::put_string(&mut payload, link_path);
        let response = self.request(MessageType::Symlink, &payload, cancel).await?;
        expect_status(response, Some(link_path))
    }

    /// Create a hard link via the `hardlink@openssh.com` extension.
    pub async fn hardlink(
        &self,
        old_path: &str,
        new_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_path(old_path)?;
        Self::check_path(new_path)?;
        self.require_extension(extensions::HARDLINK)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, extensions::HARDLINK);
        codec::put_string(&mut payload, old_path);
        codec::put_string(&mut payload, new_path);
        let response = self.request(MessageType::Extended, &payload, cancel).await?;
        expect_status(response, Some(old_path))
    }

    /// File-system information for the file system holding `path`, via the
    /// `statvfs@openssh.com` extension.
    pub async fn statvfs(&self, path: &str, cancel: &CancellationToken) -> Result<StatVfs> {
        Self::check_path(path)?;
        self.require_extension(extensions::STATVFS)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, extensions::STATVFS);
        codec::put_string(&mut payload, path);
        let response = self.request(MessageType::Extended, &payload, cancel).await?;
        expect_statvfs(response, Some(path))
    }

    /// File-system information for the file system holding an open handle,
    /// via the `fstatvfs@openssh.com` extension.
    pub async fn fstatvfs(
        &self,
        handle: &FileHandle,
        cancel: &CancellationToken,
    ) -> Result<StatVfs> {
        self.require_extension(extensions::FSTATVFS)?;
        let mut payload = BytesMut::new();
        codec::put_string(&mut payload, extensions::FSTATVFS);
        codec::put_bytes(&mut payload, handle.as_bytes());
        let response = self.request(MessageType::Extended, &payload, cancel).await?;
        expect_statvfs(response, None)
    }

    fn require_extension(&self, name: &str) -> Result<()> {
        if !self.supports_extension(name) {
            return Err(Error::Unsupported(format!(
                "the server does not advertise the {} extension",
                name
            )));
        }
        Ok(())
    }

    // ===== path resolution and directory listing =====

    /// Resolve `path` to the server's canonical absolute form.
    ///
    /// A relative path is first anchored at the working directory. When the
    /// server refuses to resolve the full path (commonly because it does
    /// not exist yet), the parent directory is resolved instead and the
    /// final segment re-appended; failing that, the anchored path is
    /// returned as-is.
    pub async fn canonical_path(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check_path(path)?;

        let full = if path.starts_with('/') {
            path.to_string()
        } else {
            let cwd = self.working_dir.lock().unwrap().clone().unwrap_or_default();
            if cwd.ends_with('/') {
                format!("{}{}", cwd, path)
            } else {
                format!("{}/{}", cwd, path)
            }
        };

        if let Some(resolved) = self.realpath_or_none(&full, cancel).await? {
            return Ok(resolved);
        }

        if full.ends_with("/.") || full.ends_with("/..") || full == "/" || !full.contains('/') {
            return Ok(full);
        }

        let Some((parent, last)) = full.rsplit_once('/') else {
            return Ok(full);
        };
        let parent = if parent.is_empty() { "/" } else { parent };

        match self.realpath_or_none(parent, cancel).await? {
            Some(canonical_parent) if canonical_parent.ends_with('/') => {
                Ok(format!("{}{}", canonical_parent, last))
            }
            Some(canonical_parent) => Ok(format!("{}/{}", canonical_parent, last)),
            None => Ok(full),
        }
    }

    /// Change the working directory used to anchor relative paths.
    ///
    /// The path is canonicalized server-side and verified to be an openable
    /// directory.
    pub async fn change_directory(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_path(path)?;
        let canonical = self.canonical_path(path, cancel).await?;
        let handle = self.opendir(&canonical, cancel).await?;
        self.close_handle(&handle, cancel).await?;
        debug!(cwd = %canonical, "Changed working directory");
        *self.working_dir.lock().unwrap() = Some(canonical);
        Ok(())
    }

    /// List a directory, returning entries with their full paths.
    ///
    /// The directory handle is released on every exit path, including
    /// errors or cancellation part-way through the listing.
    pub async fn read_dir(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirEntry>> {
        Self::check_path(path)?;
        let base = self.canonical_path(path, cancel).await?;
        let handle = self.opendir(&base, cancel).await?;
        let entries = self.collect_dir_entries(&base, &handle, cancel).await;
        // Release the handle even when the listing failed; a cancelled
        // token must not leak it either.
        let close_cancel = CancellationToken::new();
        let closed = self.close_handle(&handle, &close_cancel).await;
        let entries = entries?;
        closed?;
        Ok(entries)
    }

    async fn collect_dir_entries(
        &self,
        base: &str,
        handle: &FileHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirEntry>> {
        let prefix = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };

        let mut out = Vec::new();
        while let Some(batch) = self.readdir(handle, cancel).await? {
            for entry in batch {
                out.push(DirEntry {
                    path: format!("{}{}", prefix, entry.filename),
                    name: entry.filename,
                    longname: entry.longname,
                    attributes: entry.attributes,
                });
            }
        }
        Ok(out)
    }

    // ===== sizing =====

    /// Largest `READ` length that keeps one `DATA` response inside one SSH
    /// channel-data message.
    pub fn calculate_optimal_read_length(&self, buffer_size: u32) -> u32 {
        cmp::min(buffer_size, self.transport.local_max_packet()) - DATA_PACKET_OVERHEAD
    }

    /// Largest `WRITE` data length that keeps one request inside one SSH
    /// channel-data message for the remote side.
    pub fn calculate_optimal_write_length(&self, buffer_size: u32, handle: &FileHandle) -> u32 {
        cmp::min(buffer_size, self.transport.remote_max_packet())
            - (WRITE_PACKET_OVERHEAD + handle.len() as u32)
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.transport.close();
        }
    }
}

fn check_packet_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::Protocol("Zero-length SFTP packet".into()));
    }
    Ok(())
}

fn decode_response(msg_type: MessageType, mut buf: &[u8]) -> Result<Response> {
    match msg_type {
        MessageType::Status => {
            let code = codec::get_u32(&mut buf)?;
            // Some servers omit the message and language fields on OK.
            let message = if buf.is_empty() {
                String::new()
            } else {
                codec::get_string(&mut buf)?
            };
            if !buf.is_empty() {
                let _language = codec::get_string(&mut buf)?;
            }
            Ok(Response::Status { code, message })
        }
        MessageType::Handle => {
            let handle = codec::get_bytes(&mut buf)?;
            Ok(Response::Handle(FileHandle::new(handle)))
        }
        MessageType::Data => {
            let data = codec::get_bytes(&mut buf)?;
            Ok(Response::Data(Bytes::from(data)))
        }
        MessageType::Attrs => {
            let attrs = FileAttributes::decode(&mut buf)?;
            Ok(Response::Attrs(attrs))
        }
        MessageType::Name => {
            let count = codec::get_u32(&mut buf)? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let filename = codec::get_string(&mut buf)?;
                let longname = codec::get_string(&mut buf)?;
                let attributes = FileAttributes::decode(&mut buf)?;
                entries.push(NameEntry {
                    filename,
                    longname,
                    attributes,
                });
            }
            Ok(Response::Name(entries))
        }
        MessageType::ExtendedReply => Ok(Response::ExtendedReply(Bytes::copy_from_slice(buf))),
        other => Err(Error::Protocol(format!(
            "Unexpected message type {:?} in a response position",
            other
        ))),
    }
}

fn expect_status(response: Response, path: Option<&str>) -> Result<()> {
    match response {
        Response::Status { code, .. } if code == StatusCode::Ok as u32 => Ok(()),
        Response::Status { code, message } => Err(Error::from_status(code, &message, path)),
        other => Err(Error::Protocol(format!(
            "Expected STATUS, got {}",
            other.kind()
        ))),
    }
}

fn expect_handle(response: Response, path: &str) -> Result<FileHandle> {
    match response {
        Response::Handle(handle) => Ok(handle),
        Response::Status { code, message } => Err(Error::from_status(code, &message, Some(path))),
        other => Err(Error::Protocol(format!(
            "Expected HANDLE, got {}",
            other.kind()
        ))),
    }
}

fn expect_attrs(response: Response, path: Option<&str>) -> Result<FileAttributes> {
    match response {
        Response::Attrs(attrs) => Ok(attrs),
        Response::Status { code, message } => Err(Error::from_status(code, &message, path)),
        other => Err(Error::Protocol(format!(
            "Expected ATTRS, got {}",
            other.kind()
        ))),
    }
}

fn expect_statvfs(response: Response, path: Option<&str>) -> Result<StatVfs> {
    match response {
        Response::ExtendedReply(data) => {
            let mut buf: &[u8] = &data;
            StatVfs::decode(&mut buf)
        }
        Response::Status { code, message } => Err(Error::from_status(code, &message, path)),
        other => Err(Error::Protocol(format!(
            "Expected EXTENDED_REPLY, got {}",
            other.kind()
        ))),
    }
}
