//! Pipelined read-ahead
//!
//! Turns a sequential byte consumer into a pipelined requester: a bounded,
//! growing window of `READ` requests is kept in flight so that latency
//! hides behind bandwidth on high-latency links.
//!
//! The window starts at one request (or, for sized whole-file downloads,
//! wide enough to cover the file) and grows by one per successful chunk up
//! to the configured maximum. A short read is repaired with a gap-filling
//! request and taken as the server telling us its preferred transfer size;
//! the chunk size shrinks to match, never below 512 bytes. End of file
//! collapses the window permanently, as does any error, which is latched
//! and returned from every subsequent call.
//!
//! Cancellation is per call and non-destructive: an in-flight request
//! stays in the window until its response has actually been consumed, so
//! a [`read_next`](PipelinedReader::read_next) call that is cancelled
//! through its token, or simply dropped mid-await, leaves the pipeline
//! intact and the next call picks up where it left off. Only EOF and real
//! failures latch.

use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::FileHandle;
use crate::session::{PendingRead, SftpSession};
use crate::{Error, Result};

/// Floor for the dynamic chunk size.
const MIN_CHUNK_SIZE: u32 = 512;

/// How wide the read-ahead window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAheadPolicy {
    /// Start with one request in flight and let the window grow. Used for
    /// generic stream reads where the consumption rate is unknown.
    Incremental,
    /// When the file size is known, start with the whole file in flight
    /// (bounded by the maximum), so small files complete in one round
    /// trip's worth of latency.
    WholeFile,
}

enum ReadState {
    Pending(PendingRead),
    Ready(Bytes),
}

struct InflightRead {
    count: u32,
    state: ReadState,
}

/// A bounded pipeline of `READ` requests over one file handle.
///
/// Not a shared object: one reader serves one sequential consumer. Dropping
/// the reader abandons its in-flight requests; the session keeps their ids
/// registered and discards the late responses.
pub struct PipelinedReader {
    session: Arc<SftpSession>,
    handle: FileHandle,
    chunk_size: u32,
    current_offset: u64,
    read_ahead_offset: u64,
    inflight: HashMap<u64, InflightRead>,
    max_pending: usize,
    window: usize,
    file_size: Option<u64>,
    error: Option<Error>,
}

impl std::fmt::Debug for PipelinedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinedReader")
            .field("handle", &self.handle)
            .field("chunk_size", &self.chunk_size)
            .field("current_offset", &self.current_offset)
            .field("read_ahead_offset", &self.read_ahead_offset)
            .field("max_pending", &self.max_pending)
            .field("window", &self.window)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

impl PipelinedReader {
    /// Create a reader starting at `offset`.
    ///
    /// `file_size` enables the end-of-file short circuit and the
    /// [`WholeFile`](ReadAheadPolicy::WholeFile) seed; pass `None` when the
    /// size is unknown or the file may grow.
    pub fn new(
        session: Arc<SftpSession>,
        handle: &FileHandle,
        chunk_size: u32,
        max_pending: usize,
        offset: u64,
        file_size: Option<u64>,
        policy: ReadAheadPolicy,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::argument("chunk_size", "chunk size must be non-zero"));
        }
        if max_pending == 0 {
            return Err(Error::argument(
                "max_pending",
                "at least one in-flight read is required",
            ));
        }

        let window = match (policy, file_size) {
            (ReadAheadPolicy::WholeFile, Some(size)) => {
                let chunks = size.div_ceil(u64::from(chunk_size));
                cmp::min(max_pending as u64, cmp::max(1, 2 + chunks)) as usize
            }
            _ => 1,
        };

        Ok(PipelinedReader {
            session,
            handle: handle.clone(),
            chunk_size,
            current_offset: offset,
            read_ahead_offset: offset,
            inflight: HashMap::new(),
            max_pending,
            window,
            file_size,
            error: None,
        })
    }

    /// Current ceiling on in-flight requests; zero once end of file or an
    /// error has been reached.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// The per-request byte count currently in use.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Return the next sequential chunk of the file.
    ///
    /// An empty slice means end of file; every call after that returns an
    /// empty slice without issuing further requests. A failed call latches
    /// its error and every subsequent call returns the same error.
    ///
    /// Cancellation through `cancel` aborts only this call: the error is
    /// not latched, the in-flight requests stay live, and a later call
    /// with a fresh token proceeds normally.
    pub async fn read_next(&mut self, cancel: &CancellationToken) -> Result<Bytes> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("the read was cancelled".into()));
        }
        if self.window == 0 {
            return Ok(Bytes::new());
        }

        // Fill the window with speculative reads.
        while self.inflight.len() < self.window {
            let offset = self.read_ahead_offset;
            let chunk = self.chunk_size;
            self.issue(offset, chunk).await?;
            self.read_ahead_offset = offset + u64::from(chunk);
        }

        let head_offset = self.current_offset;
        if !self.inflight.contains_key(&head_offset) {
            // A dropped or cancelled call can leave a hole at the head of
            // the line (a gap-filling request that never went out); refetch
            // instead of failing the pipeline.
            self.issue(head_offset, self.chunk_size).await?;
        }

        // Resolve the head in place. The entry is only removed once its
        // bytes are in hand, so a call that is cancelled or dropped while
        // waiting leaves the request claimable by the next call.
        let (requested, resolved) = {
            let Some(head) = self.inflight.get_mut(&head_offset) else {
                let err = Error::Protocol("read-ahead pipeline lost its head request".into());
                self.latch(err.clone());
                return Err(err);
            };
            let requested = head.count;
            let resolved = match &mut head.state {
                ReadState::Ready(data) => Ok(std::mem::take(data)),
                ReadState::Pending(pending) => pending.wait(cancel).await,
            };
            (requested, resolved)
        };

        let data = match resolved {
            Ok(data) => data,
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                self.latch(e.clone());
                return Err(e);
            }
        };
        self.inflight.remove(&head_offset);

        if data.is_empty() {
            self.latch_eof();
            return Ok(data);
        }

        self.current_offset += data.len() as u64;

        if (data.len() as u32) < requested {
            let request_end = head_offset + u64::from(requested);

            if self.file_size == Some(self.current_offset)
                && self.inflight.contains_key(&request_end)
            {
                // The file is exactly consumed. The speculative read just
                // past it is already in flight; its empty answer confirms
                // EOF without spending another round trip on the gap.
                match self.confirm_eof(request_end, cancel).await {
                    Ok(true) => {
                        self.current_offset = request_end;
                        self.latch_eof();
                        return Ok(data);
                    }
                    Ok(false) => {}
                    Err(e @ Error::Cancelled(_)) => {
                        // The caller stopped waiting for the confirmation;
                        // the request stays in flight and the gap below is
                        // still repaired, so the bytes in hand are not
                        // lost.
                        debug!("EOF confirmation abandoned: {}", e);
                    }
                    Err(e) => {
                        self.latch(e.clone());
                        return Err(e);
                    }
                }
            }

            // Repair the gap the short read left behind.
            let missing = requested - data.len() as u32;
            self.issue(self.current_offset, missing).await?;

            if (data.len() as u32) < self.chunk_size {
                // The server is telling us its preferred size; respect it.
                let reduced = cmp::max(MIN_CHUNK_SIZE, data.len() as u32);
                debug!(from = self.chunk_size, to = reduced, "Reducing read chunk size");
                self.chunk_size = reduced;
            }
        }

        self.grow_window();
        Ok(data)
    }

    /// Await the in-flight request at `offset`; `Ok(true)` means it came
    /// back empty and the file ends there. A non-empty answer (the file
    /// grew) is kept for later consumption.
    async fn confirm_eof(&mut self, offset: u64, cancel: &CancellationToken) -> Result<bool> {
        let resolved = {
            let Some(next) = self.inflight.get_mut(&offset) else {
                return Ok(false);
            };
            match &mut next.state {
                ReadState::Ready(data) => Ok(std::mem::take(data)),
                ReadState::Pending(pending) => pending.wait(cancel).await,
            }
        };

        match resolved {
            Ok(next_data) if next_data.is_empty() => {
                self.inflight.remove(&offset);
                Ok(true)
            }
            Ok(next_data) => {
                if let Some(next) = self.inflight.get_mut(&offset) {
                    next.state = ReadState::Ready(next_data);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn issue(&mut self, offset: u64, count: u32) -> Result<()> {
        match self.session.begin_read(&self.handle, offset, count).await {
            Ok(pending) => {
                self.inflight.insert(
                    offset,
                    InflightRead {
                        count,
                        state: ReadState::Pending(pending),
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.latch(e.clone());
                Err(e)
            }
        }
    }

    fn grow_window(&mut self) {
        if self.window == 0 {
            return;
        }
        if let Some(size) = self.file_size {
            if self.read_ahead_offset > size + u64::from(self.chunk_size) {
                // Requests already went past end of file; stop widening so
                // we do not burn round trips on guaranteed-empty reads.
                self.window = 1;
                return;
            }
        }
        if self.window < self.max_pending {
            self.window += 1;
        }
    }

    fn latch(&mut self, err: Error) {
        self.error = Some(err);
        self.latch_eof();
    }

    fn latch_eof(&mut self) {
        self.window = 0;
        self.inflight.clear();
    }
}
