//! Producer session controller.
//!
//! ```text
//!  Idle ──advertise ok──► Listening ──accept──► Connected
//!                            ▲                     │
//!                            └── peer gone / error ┘
//!  any ──stop / drop──► Closed   (unadvertise, close listener and socket)
//! ```
//!
//! One session at a time. A connection that arrives while a session is active
//! is closed straight away and the active session carries on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camstream_core::{CameraStreamConfig, CameraStreamError, ProducerState, ServiceAdvertisement};
use camstream_discovery::{AdvertisementHandle, Advertiser};
use camstream_transport::{codec_for, DeliveryStats, FrameCodec, FrameListener, LatestFrameSender};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tap::FrameTap;

// ── ProducerHandle ────────────────────────────────────────────────────────────

/// Handle to a running producer. Dropping it stops the producer.
pub struct ProducerHandle {
    port: u16,
    state: watch::Receiver<ProducerState>,
    tap: Arc<FrameTap>,
    stats: Arc<DeliveryStats>,
    stop_tx: watch::Sender<bool>,
}

impl ProducerHandle {
    pub fn state(&self) -> ProducerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProducerState> {
        self.state.clone()
    }

    /// Port the listener was given by the OS, as advertised.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Where the camera callback delivers sampled frames.
    pub fn frame_tap(&self) -> Arc<FrameTap> {
        Arc::clone(&self.tap)
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        Arc::clone(&self.stats)
    }

    /// Request shutdown (non-blocking).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait until the producer reaches `Closed`.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == ProducerState::Closed).await;
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

pub struct Producer;

impl Producer {
    /// Bind the listener, advertise it, and start accepting consumers.
    ///
    /// Fails with [`CameraStreamError::Registration`] when the advertisement
    /// is refused; the listener is closed before returning.
    pub async fn start(
        config: &CameraStreamConfig,
        advertiser: Arc<dyn Advertiser>,
    ) -> Result<ProducerHandle, CameraStreamError> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ProducerState::Idle);
        let listener = FrameListener::bind(config.bind_addr).await?;
        let port = listener.port();

        let ad = ServiceAdvertisement::new(&config.service_name, &config.service_type, port)
            .with_stream_txt(config.grid, config.framing);
        let advertisement = match advertiser.advertise(&ad).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[Producer] registration failed: {}", e);
                drop(listener);
                state_tx.send_replace(ProducerState::Closed);
                return Err(e.into());
            }
        };

        state_tx.send_replace(ProducerState::Listening { port });
        info!("[Producer] '{}' listening on port {}", config.service_name, port);

        let tap = FrameTap::new();
        let stats = DeliveryStats::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = ProducerTask {
            port,
            listener: Some(listener),
            advertiser,
            advertisement,
            tap: Arc::clone(&tap),
            stats: Arc::clone(&stats),
            codec: codec_for(config.framing, config.grid),
            state: state_tx,
        };
        tokio::spawn(task.run(stop_rx));

        Ok(ProducerHandle { port, state: state_rx, tap, stats, stop_tx })
    }
}

// ── Run loop ──────────────────────────────────────────────────────────────────

/// Owns everything that must be released on `Closed`. Teardown lives in
/// `Drop` so it also runs when the task is cancelled.
struct ProducerTask {
    port: u16,
    listener: Option<FrameListener>,
    advertiser: Arc<dyn Advertiser>,
    advertisement: AdvertisementHandle,
    tap: Arc<FrameTap>,
    stats: Arc<DeliveryStats>,
    codec: Arc<dyn FrameCodec>,
    state: watch::Sender<ProducerState>,
}

impl ProducerTask {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let Some(listener) = self.listener.take() else { return };
        let mut session: Option<Session> = None;

        loop {
            tokio::select! {
                _ = stop.changed() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("[Producer] accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    if let Some(active) = &session {
                        warn!("[Producer] rejecting {}: session {} with {} is active", peer, active.id, active.peer);
                        drop(stream);
                        continue;
                    }
                    match Session::start(stream, peer, &self.tap, &self.codec, &self.stats) {
                        Some(s) => {
                            info!("[Producer] session {} with {}", s.id, peer);
                            self.state.send_replace(ProducerState::Connected {
                                port: self.port,
                                session_id: s.id.clone(),
                                peer,
                            });
                            session = Some(s);
                        }
                        None => warn!("[Producer] frame tap busy, dropping {}", peer),
                    }
                }

                end = session_end(&mut session) => {
                    if let Some(s) = session.take() {
                        info!("[Producer] session {} ended: {}", s.id, end);
                    }
                    self.state.send_replace(ProducerState::Listening { port: self.port });
                }
            }
        }

        drop(session);
        drop(listener);
    }
}

impl Drop for ProducerTask {
    fn drop(&mut self) {
        self.advertiser.unadvertise(&self.advertisement);
        drop(self.tap.unbind());
        self.listener.take();
        self.state.send_replace(ProducerState::Closed);
        info!(
            "[Producer] closed (captured={} written={} dropped={})",
            self.stats.captured(),
            self.stats.written(),
            self.stats.dropped()
        );
    }
}

async fn session_end(session: &mut Option<Session>) -> SessionEnd {
    match session {
        Some(s) => s.ended().await,
        None => std::future::pending().await,
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum SessionEnd {
    PeerClosed,
    Failed(String),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// One accepted consumer: the write half lives in the sender's writer task,
/// the read half only watches for the peer going away.
struct Session {
    id: String,
    peer: SocketAddr,
    read_half: OwnedReadHalf,
    writer: JoinHandle<Result<(), camstream_core::TransportError>>,
    tap: Arc<FrameTap>,
}

impl Session {
    fn start(
        stream: TcpStream,
        peer: SocketAddr,
        tap: &Arc<FrameTap>,
        codec: &Arc<dyn FrameCodec>,
        stats: &Arc<DeliveryStats>,
    ) -> Option<Self> {
        let (read_half, write_half) = stream.into_split();
        let (sender, writer) = LatestFrameSender::spawn(write_half, Arc::clone(codec), Arc::clone(stats));
        if tap.bind(sender).is_err() {
            writer.abort();
            return None;
        }
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            read_half,
            writer,
            tap: Arc::clone(tap),
        })
    }

    async fn ended(&mut self) -> SessionEnd {
        let mut scratch = [0u8; 256];
        loop {
            tokio::select! {
                res = &mut self.writer => {
                    return match res {
                        Ok(Ok(())) => SessionEnd::Failed("writer stopped".into()),
                        Ok(Err(e)) => SessionEnd::Failed(e.to_string()),
                        Err(e) => SessionEnd::Failed(e.to_string()),
                    };
                }
                read = self.read_half.read(&mut scratch) => match read {
                    Ok(0) => return SessionEnd::PeerClosed,
                    // consumers never send; anything that arrives is ignored
                    Ok(n) => debug!("[Producer] ignoring {} bytes from {}", n, self.peer),
                    Err(e) => return SessionEnd::Failed(e.to_string()),
                },
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.tap.unbind());
        self.writer.abort();
        debug!("[Producer] session {} torn down", self.id);
    }
}
