//! Shared test harness: a scripted transport and an in-memory SFTP server
//!
//! The transport feeds responses back into the session synchronously, so
//! tests are deterministic without a real channel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_sftp::{CancellationToken, Error, Result, SessionConfig, SftpSession, Transport};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Transport that records every sent frame and answers through a scripted
/// responder.
pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Responder>,
    session: OnceLock<Weak<SftpSession>>,
    open: AtomicBool,
    local_max: u32,
    remote_max: u32,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Arc::new(MockTransport {
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(responder)),
            session: OnceLock::new(),
            open: AtomicBool::new(true),
            local_max: 32768,
            remote_max: 32768,
        })
    }

    /// A transport that never answers; tests feed responses by hand.
    pub fn silent() -> Arc<Self> {
        Self::new(|_| Vec::new())
    }

    pub fn attach(&self, session: &Arc<SftpSession>) {
        let _ = self.session.set(Arc::downgrade(session));
    }

    /// Frames sent so far, length prefix included.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Parsed view of every sent request.
    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.sent_frames().iter().map(|f| parse_frame(f)).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_bytes(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed("mock transport closed".into()));
        }
        self.sent.lock().unwrap().push(data.to_vec());

        let packet = &data[4..];
        let frames = {
            let mut responder = self.responder.lock().unwrap();
            (*responder)(packet)
        };
        if let Some(session) = self.session.get().and_then(Weak::upgrade) {
            for frame in frames {
                session.handle_channel_data(&frame)?;
            }
        }
        Ok(())
    }

    fn local_max_packet(&self) -> u32 {
        self.local_max
    }

    fn remote_max_packet(&self) -> u32 {
        self.remote_max
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Build a session over a scripted responder. No handshake is performed.
pub fn session_with<F>(responder: F) -> (Arc<SftpSession>, Arc<MockTransport>)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let transport = MockTransport::new(responder);
    let session = SftpSession::new(transport.clone(), SessionConfig::default());
    transport.attach(&session);
    (session, transport)
}

/// Build a session driven by a [`MiniServer`] and complete the handshake.
pub async fn connected_session(
) -> (Arc<SftpSession>, Arc<MockTransport>, Arc<Mutex<MiniServer>>) {
    connected_session_with(MiniServer::new()).await
}

pub async fn connected_session_with(
    server: MiniServer,
) -> (Arc<SftpSession>, Arc<MockTransport>, Arc<Mutex<MiniServer>>) {
    let server = Arc::new(Mutex::new(server));
    let responder_server = server.clone();
    let (session, transport) =
        session_with(move |packet| responder_server.lock().unwrap().handle(packet));
    session
        .connect(&CancellationToken::new())
        .await
        .expect("handshake should succeed");
    (session, transport, server)
}

/// Responder that completes the handshake (VERSION + the initial
/// `REALPATH(".")`) and stays silent for everything else.
pub fn handshake_only_responder() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    |packet: &[u8]| match packet[0] {
        1 => vec![version_frame(3, &[])],
        16 => {
            let id = req_id(packet);
            vec![name_frame(id, &[("/home/test", "/home/test")])]
        }
        _ => Vec::new(),
    }
}

/// The request id of a packet (meaningless for INIT/VERSION).
pub fn req_id(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]])
}

// ===== wire frame builders =====

pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn version_frame(version: u32, extensions: &[(&str, &str)]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(2); // VERSION
    body.put_u32(version);
    for (name, value) in extensions {
        put_string(&mut body, name);
        put_string(&mut body, value);
    }
    frame(&body)
}

pub fn status_frame(id: u32, code: u32, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(101); // STATUS
    body.put_u32(id);
    body.put_u32(code);
    put_string(&mut body, message);
    put_string(&mut body, "en");
    frame(&body)
}

pub fn handle_frame(id: u32, handle: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(102); // HANDLE
    body.put_u32(id);
    body.put_u32(handle.len() as u32);
    body.put_slice(handle);
    frame(&body)
}

pub fn data_frame(id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(103); // DATA
    body.put_u32(id);
    body.put_u32(data.len() as u32);
    body.put_slice(data);
    frame(&body)
}

/// NAME response; every entry carries empty attributes.
pub fn name_frame(id: u32, entries: &[(&str, &str)]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(104); // NAME
    body.put_u32(id);
    body.put_u32(entries.len() as u32);
    for (filename, longname) in entries {
        put_string(&mut body, filename);
        put_string(&mut body, longname);
        body.put_u32(0); // no attribute groups
    }
    frame(&body)
}

/// ATTRS response with size and permissions groups.
pub fn attrs_frame(id: u32, size: u64, permissions: u32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(105); // ATTRS
    body.put_u32(id);
    body.put_u32(0x1 | 0x4); // SIZE | PERMISSIONS
    body.put_u64(size);
    body.put_u32(permissions);
    frame(&body)
}

/// ATTRS response with no size group.
pub fn attrs_frame_no_size(id: u32, permissions: u32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(105); // ATTRS
    body.put_u32(id);
    body.put_u32(0x4); // PERMISSIONS
    body.put_u32(permissions);
    frame(&body)
}

pub fn extended_reply_frame(id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(201); // EXTENDED_REPLY
    body.put_u32(id);
    body.put_slice(data);
    frame(&body)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

// ===== sent-frame parsing =====

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub msg_type: u8,
    /// Request id; for INIT this is the proposed version.
    pub id: u32,
    /// Payload after the request id.
    pub body: Vec<u8>,
}

pub fn parse_frame(frame: &[u8]) -> SentRequest {
    let body = &frame[4..];
    let msg_type = body[0];
    let mut rest = &body[1..];
    let id = rest.get_u32();
    SentRequest {
        msg_type,
        id,
        body: rest.to_vec(),
    }
}

pub fn take_string(buf: &mut &[u8]) -> String {
    let bytes = take_bytes(buf);
    String::from_utf8(bytes).expect("test payloads are UTF-8")
}

pub fn take_bytes(buf: &mut &[u8]) -> Vec<u8> {
    let len = buf.get_u32() as usize;
    let out = buf[..len].to_vec();
    buf.advance(len);
    out
}

/// Decode a sent READ request body into (handle, offset, length).
pub fn parse_read(request: &SentRequest) -> (Vec<u8>, u64, u32) {
    assert_eq!(request.msg_type, 5, "expected a READ request");
    let mut buf: &[u8] = &request.body;
    let handle = take_bytes(&mut buf);
    let offset = buf.get_u64();
    let len = buf.get_u32();
    (handle, offset, len)
}

/// Decode a sent WRITE request body into (handle, offset, data).
pub fn parse_write(request: &SentRequest) -> (Vec<u8>, u64, Vec<u8>) {
    assert_eq!(request.msg_type, 6, "expected a WRITE request");
    let mut buf: &[u8] = &request.body;
    let handle = take_bytes(&mut buf);
    let offset = buf.get_u64();
    let data = take_bytes(&mut buf);
    (handle, offset, data)
}

// ===== in-memory server =====

const FX_OK: u32 = 0;
const FX_EOF: u32 = 1;
const FX_NO_SUCH_FILE: u32 = 2;
const FX_PERMISSION_DENIED: u32 = 3;
const FX_FAILURE: u32 = 4;
const FX_OP_UNSUPPORTED: u32 = 8;

#[derive(Debug, Clone)]
enum OpenHandle {
    File { path: String },
    Dir { path: String, served: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FstatMode {
    /// Report size and permissions
    Normal,
    /// Report permissions only, no size group
    NoSize,
    /// Fail with FAILURE
    Fail,
}

/// A small stateful SFTP v3 server answering one request per call.
pub struct MiniServer {
    pub cwd: String,
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: Vec<String>,
    pub links: HashMap<String, String>,
    pub extensions: Vec<(String, String)>,
    pub fstat_mode: FstatMode,
    /// Paths REALPATH refuses to resolve
    pub realpath_fail_for: Vec<String>,
    /// offset -> byte count actually returned for a READ at that offset
    pub short_read_at: HashMap<u64, usize>,
    /// READs at these offsets get no response at all; the test answers
    /// them by hand later
    pub unanswered_read_offsets: Vec<u64>,
    /// (1-based write ordinal, status code) for an injected WRITE failure
    pub fail_write_at: Option<(usize, u32)>,
    /// Status code READDIR fails with instead of listing
    pub fail_readdir_with: Option<u32>,

    pub read_log: Vec<(u64, u32)>,
    pub write_log: Vec<(u64, usize)>,
    pub closes: Vec<Vec<u8>>,
    pub symlinks: Vec<(String, String)>,

    handles: HashMap<u32, OpenHandle>,
    next_handle: u32,
    write_count: usize,
}

impl MiniServer {
    pub fn new() -> Self {
        MiniServer {
            cwd: "/home/test".to_string(),
            files: HashMap::new(),
            dirs: vec!["/".to_string(), "/home".to_string(), "/home/test".to_string()],
            links: HashMap::new(),
            extensions: vec![
                ("posix-rename@openssh.com".to_string(), "1".to_string()),
                ("statvfs@openssh.com".to_string(), "2".to_string()),
                ("fstatvfs@openssh.com".to_string(), "2".to_string()),
                ("hardlink@openssh.com".to_string(), "1".to_string()),
            ],
            fstat_mode: FstatMode::Normal,
            realpath_fail_for: Vec::new(),
            short_read_at: HashMap::new(),
            unanswered_read_offsets: Vec::new(),
            fail_write_at: None,
            fail_readdir_with: None,
            read_log: Vec::new(),
            write_log: Vec::new(),
            closes: Vec::new(),
            symlinks: Vec::new(),
            handles: HashMap::new(),
            next_handle: 1,
            write_count: 0,
        }
    }

    /// Answer one request packet (without length prefix).
    pub fn handle(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let msg_type = packet[0];
        let mut buf = &packet[1..];

        if msg_type == 1 {
            // INIT: the u32 is the client's version, not a request id.
            let _version = buf.get_u32();
            let exts: Vec<(&str, &str)> = self
                .extensions
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str()))
                .collect();
            return vec![version_frame(3, &exts)];
        }

        let id = buf.get_u32();
        match msg_type {
            3 => self.open(id, buf),
            4 => self.close(id, buf),
            5 => self.read(id, buf),
            6 => self.write(id, buf),
            7 | 17 => self.stat(id, buf),
            8 => self.fstat(id, buf),
            9 | 10 => self.setstat(id, buf, msg_type == 10),
            11 => self.opendir(id, buf),
            12 => self.readdir(id, buf),
            13 => self.remove(id, buf),
            14 => self.mkdir(id, buf),
            15 => self.rmdir(id, buf),
            16 => self.realpath(id, buf),
            18 => self.rename(id, buf),
            19 => self.readlink(id, buf),
            20 => self.symlink(id, buf),
            200 => self.extended(id, buf),
            other => vec![status_frame(
                id,
                FX_OP_UNSUPPORTED,
                &format!("unsupported request type {}", other),
            )],
        }
    }

    fn resolve(&self, path: &str) -> String {
        if path == "." {
            self.cwd.clone()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd, path)
        }
    }

    fn new_handle(&mut self, handle: OpenHandle) -> Vec<u8> {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, handle);
        id.to_be_bytes().to_vec()
    }

    fn lookup(&self, handle: &[u8]) -> Option<&OpenHandle> {
        let id = u32::from_be_bytes(handle.try_into().ok()?);
        self.handles.get(&id)
    }

    fn open(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        let pflags = buf.get_u32();
        let exists = self.files.contains_key(&path);

        const CREAT: u32 = 0x08;
        const TRUNC: u32 = 0x10;
        const EXCL: u32 = 0x20;

        if pflags & EXCL != 0 && exists {
            return vec![status_frame(id, FX_FAILURE, "file already exists")];
        }
        if pflags & CREAT == 0 && !exists {
            return vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")];
        }
        if pflags & TRUNC != 0 || !exists {
            self.files.insert(path.clone(), Vec::new());
        }
        let handle = self.new_handle(OpenHandle::File { path });
        vec![handle_frame(id, &handle)]
    }

    fn close(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let handle = take_bytes(&mut buf);
        self.closes.push(handle.clone());
        if let Ok(bytes) = <[u8; 4]>::try_from(handle.as_slice()) {
            self.handles.remove(&u32::from_be_bytes(bytes));
        }
        vec![status_frame(id, FX_OK, "")]
    }

    fn read(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let handle = take_bytes(&mut buf);
        let offset = buf.get_u64();
        let len = buf.get_u32();
        self.read_log.push((offset, len));

        if self.unanswered_read_offsets.contains(&offset) {
            return Vec::new();
        }

        let Some(OpenHandle::File { path }) = self.lookup(&handle) else {
            return vec![status_frame(id, FX_FAILURE, "bad handle")];
        };
        let Some(data) = self.files.get(path) else {
            return vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")];
        };

        let offset_usize = offset as usize;
        if offset_usize >= data.len() {
            return vec![status_frame(id, FX_EOF, "end of file")];
        }
        let mut n = std::cmp::min(len as usize, data.len() - offset_usize);
        if let Some(&short) = self.short_read_at.get(&offset) {
            n = std::cmp::min(n, short);
        }
        vec![data_frame(id, &data[offset_usize..offset_usize + n])]
    }

    fn write(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let handle = take_bytes(&mut buf);
        let offset = buf.get_u64() as usize;
        let data = take_bytes(&mut buf);

        self.write_count += 1;
        self.write_log.push((offset as u64, data.len()));
        if let Some((ordinal, code)) = self.fail_write_at {
            if self.write_count == ordinal {
                return vec![status_frame(id, code, "injected write failure")];
            }
        }

        let Some(OpenHandle::File { path }) = self.lookup(&handle) else {
            return vec![status_frame(id, FX_FAILURE, "bad handle")];
        };
        let path = path.clone();
        let file = self.files.entry(path).or_default();
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(&data);
        vec![status_frame(id, FX_OK, "")]
    }

    fn stat(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        if let Some(data) = self.files.get(&path) {
            vec![attrs_frame(id, data.len() as u64, 0o100644)]
        } else if self.dirs.contains(&path) {
            vec![attrs_frame(id, 0, 0o040755)]
        } else {
            vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")]
        }
    }

    fn fstat(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let handle = take_bytes(&mut buf);
        match self.fstat_mode {
            FstatMode::Fail => return vec![status_frame(id, FX_FAILURE, "fstat refused")],
            FstatMode::NoSize => return vec![attrs_frame_no_size(id, 0o100644)],
            FstatMode::Normal => {}
        }
        let Some(OpenHandle::File { path }) = self.lookup(&handle) else {
            return vec![status_frame(id, FX_FAILURE, "bad handle")];
        };
        match self.files.get(path) {
            Some(data) => vec![attrs_frame(id, data.len() as u64, 0o100644)],
            None => vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")],
        }
    }

    fn setstat(&mut self, id: u32, mut buf: &[u8], by_handle: bool) -> Vec<Vec<u8>> {
        let path = if by_handle {
            let handle = take_bytes(&mut buf);
            match self.lookup(&handle) {
                Some(OpenHandle::File { path }) => path.clone(),
                _ => return vec![status_frame(id, FX_FAILURE, "bad handle")],
            }
        } else {
            self.resolve(&take_string(&mut buf))
        };

        let flags = buf.get_u32();
        if flags & 0x1 != 0 {
            let new_size = buf.get_u64() as usize;
            if let Some(file) = self.files.get_mut(&path) {
                file.resize(new_size, 0);
            }
        }
        vec![status_frame(id, FX_OK, "")]
    }

    fn opendir(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        if !self.dirs.contains(&path) {
            return vec![status_frame(id, FX_NO_SUCH_FILE, "no such directory")];
        }
        let handle = self.new_handle(OpenHandle::Dir {
            path,
            served: false,
        });
        vec![handle_frame(id, &handle)]
    }

    fn readdir(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        if let Some(code) = self.fail_readdir_with {
            return vec![status_frame(id, code, "injected readdir failure")];
        }

        let handle = take_bytes(&mut buf);
        let Ok(bytes) = <[u8; 4]>::try_from(handle.as_slice()) else {
            return vec![status_frame(id, FX_FAILURE, "bad handle")];
        };
        let key = u32::from_be_bytes(bytes);
        let Some(OpenHandle::Dir { path, served }) = self.handles.get_mut(&key) else {
            return vec![status_frame(id, FX_FAILURE, "bad handle")];
        };
        if *served {
            return vec![status_frame(id, FX_EOF, "end of directory")];
        }
        *served = true;
        let base = if path.ends_with('/') {
            path.clone()
        } else {
            format!("{}/", path)
        };

        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|p| p.strip_prefix(&base))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();

        let mut body = BytesMut::new();
        body.put_u8(104); // NAME
        body.put_u32(id);
        body.put_u32(names.len() as u32);
        for name in &names {
            let full = format!("{}{}", base, name);
            let size = self.files.get(&full).map(|d| d.len()).unwrap_or(0) as u64;
            put_string(&mut body, name);
            put_string(&mut body, &format!("-rw-r--r-- 1 test test {} {}", size, name));
            body.put_u32(0x1 | 0x4);
            body.put_u64(size);
            body.put_u32(0o100644);
        }
        vec![frame(&body)]
    }

    fn remove(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        match self.files.remove(&path) {
            Some(_) => vec![status_frame(id, FX_OK, "")],
            None => vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")],
        }
    }

    fn mkdir(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        if self.dirs.contains(&path) {
            return vec![status_frame(id, FX_FAILURE, "directory exists")];
        }
        self.dirs.push(path);
        vec![status_frame(id, FX_OK, "")]
    }

    fn rmdir(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        let before = self.dirs.len();
        self.dirs.retain(|d| d != &path);
        if self.dirs.len() == before {
            return vec![status_frame(id, FX_NO_SUCH_FILE, "no such directory")];
        }
        vec![status_frame(id, FX_OK, "")]
    }

    fn realpath(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let raw = take_string(&mut buf);
        let resolved = self.resolve(&raw);
        if self.realpath_fail_for.contains(&resolved) {
            return vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")];
        }
        vec![name_frame(id, &[(resolved.as_str(), resolved.as_str())])]
    }

    fn rename(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let old = self.resolve(&take_string(&mut buf));
        let new = self.resolve(&take_string(&mut buf));
        match self.files.remove(&old) {
            Some(data) => {
                self.files.insert(new, data);
                vec![status_frame(id, FX_OK, "")]
            }
            None => vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")],
        }
    }

    fn readlink(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let path = self.resolve(&take_string(&mut buf));
        match self.links.get(&path) {
            Some(target) => vec![name_frame(id, &[(target.as_str(), target.as_str())])],
            None => vec![status_frame(id, FX_NO_SUCH_FILE, "no such link")],
        }
    }

    fn symlink(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        // OpenSSH order: target path first, then link path.
        let target = take_string(&mut buf);
        let link = self.resolve(&take_string(&mut buf));
        self.links.insert(link.clone(), target.clone());
        self.symlinks.push((target, link));
        vec![status_frame(id, FX_OK, "")]
    }

    fn extended(&mut self, id: u32, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let name = take_string(&mut buf);
        match name.as_str() {
            "posix-rename@openssh.com" => self.rename(id, buf),
            "hardlink@openssh.com" => {
                let old = self.resolve(&take_string(&mut buf));
                let new = self.resolve(&take_string(&mut buf));
                match self.files.get(&old).cloned() {
                    Some(data) => {
                        self.files.insert(new, data);
                        vec![status_frame(id, FX_OK, "")]
                    }
                    None => vec![status_frame(id, FX_NO_SUCH_FILE, "no such file")],
                }
            }
            "statvfs@openssh.com" | "fstatvfs@openssh.com" => {
                let mut body = BytesMut::new();
                for value in [4096u64, 4096, 1000, 600, 500, 65536, 60000, 50000, 7, 0, 255] {
                    body.put_u64(value);
                }
                vec![extended_reply_frame(id, &body)]
            }
            _ => vec![status_frame(id, FX_OP_UNSUPPORTED, "unknown extension")],
        }
    }
}
