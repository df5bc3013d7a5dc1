//! Channel transport seam
//!
//! The session does not know anything about SSH beyond reliable, ordered,
//! framed byte delivery inside one channel. [`Transport`] is that seam: the
//! session sends opaque frames through it and receives inbound bytes via
//! [`SftpSession::handle_channel_data`](crate::SftpSession::handle_channel_data).
//!
//! [`ChannelTransport`] adapts a russh channel on which the `sftp`
//! subsystem has already been requested. A single pump task owns the
//! channel: it drains an egress queue and feeds `ChannelMsg::Data` into the
//! session, so the send path never contends with the receive path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::session::SftpSession;
use crate::{Error, Result};

/// Byte transport for one SFTP session.
///
/// Implementations must deliver frames reliably and in order; the SSH layer
/// serializes concurrent sends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one outbound frame (length prefix included).
    async fn send_bytes(&self, data: Bytes) -> Result<()>;

    /// Maximum packet size we accept on the channel.
    fn local_max_packet(&self) -> u32;

    /// Maximum packet size the remote side accepts.
    fn remote_max_packet(&self) -> u32;

    /// Whether the channel is still open.
    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    fn close(&self);
}

enum Frame {
    Data(Bytes),
    Shutdown,
}

/// [`Transport`] over a russh client channel.
pub struct ChannelTransport {
    outgoing: mpsc::UnboundedSender<Frame>,
    local_max_packet: u32,
    remote_max_packet: u32,
    open: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Wrap an open channel. The returned [`ChannelPump`] must be spawned
    /// with the session once the session exists.
    pub fn new(channel: Channel<Msg>, config: &SessionConfig) -> (Arc<Self>, ChannelPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let transport = Arc::new(ChannelTransport {
            outgoing: tx,
            local_max_packet: config.local_max_packet_size,
            remote_max_packet: config.remote_max_packet_size,
            open: open.clone(),
        });
        let pump = ChannelPump {
            channel,
            outgoing: rx,
            open,
        };
        (transport, pump)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_bytes(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed("channel is closed".into()));
        }
        self.outgoing
            .send(Frame::Data(data))
            .map_err(|_| Error::ConnectionClosed("channel is closed".into()))
    }

    fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outgoing.send(Frame::Shutdown);
        }
    }
}

/// Owns the russh channel and moves bytes in both directions.
pub struct ChannelPump {
    channel: Channel<Msg>,
    outgoing: mpsc::UnboundedReceiver<Frame>,
    open: Arc<AtomicBool>,
}

impl ChannelPump {
    /// Spawn the pump task feeding `session`.
    pub fn spawn(self, session: Arc<SftpSession>) {
        tokio::spawn(self.run(session));
    }

    async fn run(mut self, session: Arc<SftpSession>) {
        enum Event {
            Incoming(Option<ChannelMsg>),
            Outgoing(Option<Frame>),
        }

        loop {
            let event = tokio::select! {
                incoming = self.channel.wait() => Event::Incoming(incoming),
                frame = self.outgoing.recv() => Event::Outgoing(frame),
            };

            match event {
                Event::Incoming(Some(ChannelMsg::Data { data })) => {
                    if let Err(e) = session.handle_channel_data(&data) {
                        warn!("SFTP session failed: {}", e);
                        break;
                    }
                }
                Event::Incoming(Some(ChannelMsg::Eof)) | Event::Incoming(Some(ChannelMsg::Close)) => {
                    debug!("SFTP channel closed by peer");
                    break;
                }
                Event::Incoming(Some(_)) => {
                    // Window adjustments and extended data are not ours.
                }
                Event::Incoming(None) => {
                    debug!("SFTP channel stream ended");
                    break;
                }
                Event::Outgoing(Some(Frame::Data(bytes))) => {
                    if let Err(e) = self.channel.data(&bytes[..]).await {
                        warn!("Failed to send on SFTP channel: {}", e);
                        break;
                    }
                }
                Event::Outgoing(Some(Frame::Shutdown)) | Event::Outgoing(None) => {
                    let _ = self.channel.eof().await;
                    break;
                }
            }
        }

        self.open.store(false, Ordering::Release);
        session.handle_channel_closed();
    }
}

/// Build a session over an open channel on which the `sftp` subsystem has
/// been requested, and perform the version handshake.
pub async fn session_over_channel(
    channel: Channel<Msg>,
    config: SessionConfig,
) -> Result<Arc<SftpSession>> {
    config.validate()?;
    let (transport, pump) = ChannelTransport::new(channel, &config);
    let session = SftpSession::new(transport, config);
    pump.spawn(session.clone());
    let cancel = tokio_util::sync::CancellationToken::new();
    session.connect(&cancel).await?;
    Ok(session)
}
