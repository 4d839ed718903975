//! Consumer session controller.
//!
//! ```text
//!  Idle ─► Discovering ─Found─► Resolving ─ok─► Connecting ─ok─► Connected ─► Closed
//!              ▲                    │                │
//!              └──── error ─────────┴────────────────┘   (after retry_backoff)
//! ```
//!
//! A failed advertisement cools down for `retry_cooldown` while other matches
//! are tried. Browsing stops once the socket is up. When the stream ends the
//! consumer goes to `Closed`; reconnecting is the caller's decision.

use std::sync::Arc;
use std::time::Duration;

use camstream_core::{
    CameraStreamConfig, ConsumerState, Frame, RawAdvertisement, ResolutionError, ResolvedEndpoint, ServiceEvent,
};
use camstream_discovery::{Browser, Resolver, ServiceFilter};
use camstream_transport::{codec_for, connect, FrameCodec, FrameReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::candidates::Candidates;

const FRAME_QUEUE: usize = 8;

// ── ConsumerHandle ────────────────────────────────────────────────────────────

/// Handle to a running consumer. Dropping it stops the consumer.
pub struct ConsumerHandle {
    state: watch::Receiver<ConsumerState>,
    frames: mpsc::Receiver<Frame>,
    stop_tx: watch::Sender<bool>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Next received frame. `None` once the consumer is closed and drained.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Request shutdown from any state. Does not wait for an in-flight
    /// resolution or connect; those are cancelled.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait until the consumer reaches `Closed`.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == ConsumerState::Closed).await;
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

pub struct Consumer;

impl Consumer {
    /// Start discovering with `browser` and connect to the first producer
    /// whose name and type match `config`.
    pub fn start<B>(config: &CameraStreamConfig, browser: B) -> ConsumerHandle
    where
        B: Browser + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let filter = ServiceFilter::new(&config.service_type, &config.service_name, config.name_match);
        let resolver = Resolver::new(browser, filter, config.resolve_timeout()).with_expected_grid(config.grid);
        let task = ConsumerTask {
            resolver,
            codec: codec_for(config.framing, config.grid),
            connect_timeout: config.connect_timeout(),
            retry_backoff: config.retry_backoff(),
            retry_cooldown: config.retry_cooldown(),
            stall_timeout: config.stall_timeout(),
            state: state_tx,
            frames: frames_tx,
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx.changed() => info!("[Consumer] stop requested"),
                _ = task.run() => {}
            }
            // dropping `task` publishes Closed
        });

        ConsumerHandle { state: state_rx, frames: frames_rx, stop_tx }
    }
}

// ── Run loop ──────────────────────────────────────────────────────────────────

struct ConsumerTask<B: Browser> {
    resolver: Resolver<B>,
    codec: Arc<dyn FrameCodec>,
    connect_timeout: Duration,
    retry_backoff: Duration,
    retry_cooldown: Duration,
    stall_timeout: Option<Duration>,
    state: watch::Sender<ConsumerState>,
    frames: mpsc::Sender<Frame>,
}

impl<B: Browser> ConsumerTask<B> {
    fn set_state(&self, next: ConsumerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("[Consumer] {} -> {}", current.label(), next.label());
            *current = next;
            true
        });
    }

    async fn run(&self) {
        let stream = self.establish().await;
        self.resolver.stop_browsing();
        self.stream_frames(stream).await;
    }

    /// Discovering → Resolving → Connecting, retrying until a socket is up.
    ///
    /// The browse stream stays open across failed attempts; an advertisement
    /// that failed is skipped for `retry_cooldown` so other matches get tried.
    async fn establish(&self) -> (TcpStream, ResolvedEndpoint) {
        let mut candidates = Candidates::new(self.retry_cooldown);
        loop {
            self.set_state(ConsumerState::Discovering);

            let mut events = match self.resolver.start_browsing().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("[Consumer] browse failed: {}", e);
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
            };
            candidates.forget_records();

            while let Some(raw) = next_candidate(&mut candidates, &mut events).await {
                if let Some(connected) = self.attempt(&raw, &mut candidates, &mut events).await {
                    return connected;
                }
                candidates.mark_failed(&raw.fullname, Instant::now());
                self.set_state(ConsumerState::Discovering);
                tokio::time::sleep(self.retry_backoff).await;
            }

            warn!("[Consumer] browse ended, restarting");
            tokio::time::sleep(self.retry_backoff).await;
        }
    }

    /// Resolve and connect to one advertisement.
    async fn attempt(
        &self,
        raw: &RawAdvertisement,
        candidates: &mut Candidates,
        events: &mut mpsc::Receiver<ServiceEvent>,
    ) -> Option<(TcpStream, ResolvedEndpoint)> {
        self.set_state(ConsumerState::Resolving { name: raw.name.clone() });
        let endpoint = match self.resolve_watching(raw, candidates, events).await {
            Ok(ep) => ep,
            Err(e) => {
                warn!("[Consumer] {}", e);
                return None;
            }
        };

        self.set_state(ConsumerState::Connecting { endpoint: endpoint.clone() });
        match connect(&endpoint, self.connect_timeout).await {
            Ok(stream) => {
                self.set_state(ConsumerState::Connected { endpoint: endpoint.clone() });
                Some((stream, endpoint))
            }
            Err(e) => {
                warn!("[Consumer] connect to {} failed: {}", endpoint, e);
                None
            }
        }
    }

    /// Resolve `raw` while still draining the browse stream, so events that
    /// arrive meanwhile are not lost.
    async fn resolve_watching(
        &self,
        raw: &RawAdvertisement,
        candidates: &mut Candidates,
        events: &mut mpsc::Receiver<ServiceEvent>,
    ) -> Result<ResolvedEndpoint, ResolutionError> {
        let resolve = self.resolver.resolve(raw);
        tokio::pin!(resolve);
        loop {
            tokio::select! {
                result = &mut resolve => return result,
                Some(event) = events.recv() => {
                    if let ServiceEvent::Lost { name, .. } = &event {
                        if *name == raw.name {
                            info!("[Consumer] '{}' withdrawn while resolving", name);
                        }
                    }
                    candidates.observe(event);
                }
            }
        }
    }

    async fn stream_frames(&self, (stream, endpoint): (TcpStream, ResolvedEndpoint)) {
        info!("[Consumer] streaming from {}", endpoint);
        let mut reader = FrameReader::new(stream, Arc::clone(&self.codec))
            .with_stall_timeout(self.stall_timeout);

        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => {
                    if self.frames.send(frame).await.is_err() {
                        debug!("[Consumer] frame receiver dropped");
                        break;
                    }
                }
                Ok(None) => {
                    info!("[Consumer] {} closed the stream", endpoint);
                    break;
                }
                Err(e) => {
                    warn!("[Consumer] stream from {} failed: {}", endpoint, e);
                    break;
                }
            }
        }
        info!("[Consumer] {} frames received", reader.frames_read());
    }
}

impl<B: Browser> Drop for ConsumerTask<B> {
    fn drop(&mut self) {
        self.resolver.stop_browsing();
        self.state.send_replace(ConsumerState::Closed);
    }
}

/// Wait until some advertisement is worth trying. `None` once the browse
/// stream ends.
async fn next_candidate(
    candidates: &mut Candidates,
    events: &mut mpsc::Receiver<ServiceEvent>,
) -> Option<RawAdvertisement> {
    loop {
        while let Ok(event) = events.try_recv() {
            candidates.observe(event);
        }
        if let Some(raw) = candidates.pick(Instant::now()) {
            return Some(raw);
        }

        let retry_at = candidates.next_retry();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => candidates.observe(event),
                None => return None,
            },
            _ = sleep_until(retry_at) => {}
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use camstream_core::{ServiceAdvertisement, SERVICE_NAME, SERVICE_TYPE};
    use camstream_discovery::{Advertiser, LocalRegistry};

    use super::*;

    fn config() -> CameraStreamConfig {
        CameraStreamConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            retry_backoff_ms: 20,
            resolve_timeout_ms: 200,
            ..CameraStreamConfig::default()
        }
    }

    async fn wait(rx: &mut watch::Receiver<ConsumerState>, label: &str) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.label() == label))
            .await
            .unwrap_or_else(|_| panic!("never reached {label}"))
            .unwrap();
    }

    #[tokio::test]
    async fn stays_discovering_with_nothing_advertised() {
        let registry = LocalRegistry::new();
        let mut consumer = Consumer::start(&config(), registry.browser());
        let mut states = consumer.subscribe();
        wait(&mut states, "discovering").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(consumer.state(), ConsumerState::Discovering);

        consumer.stop();
        consumer.closed().await;
        assert!(consumer.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_resolution() {
        let registry = LocalRegistry::new();
        registry.set_resolve_delay(Duration::from_secs(30));
        registry
            .advertise(&ServiceAdvertisement::new(SERVICE_NAME, SERVICE_TYPE, 6553))
            .await
            .unwrap();

        let mut consumer = Consumer::start(
            &CameraStreamConfig { resolve_timeout_ms: 60_000, ..config() },
            registry.browser(),
        );
        let mut states = consumer.subscribe();
        wait(&mut states, "resolving").await;

        consumer.stop();
        tokio::time::timeout(Duration::from_millis(500), consumer.closed())
            .await
            .expect("stop waited on the resolution");
    }

    #[tokio::test]
    async fn failed_connect_retries_until_a_producer_is_reachable() {
        let registry = LocalRegistry::new();
        // nothing listens on this port once the listener is dropped
        let dead_port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let dead = registry
            .advertise(&ServiceAdvertisement::new(SERVICE_NAME, SERVICE_TYPE, dead_port))
            .await
            .unwrap();

        let consumer = Consumer::start(&config(), registry.browser());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!matches!(consumer.state(), ConsumerState::Connected { .. } | ConsumerState::Closed));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        registry.unadvertise(&dead);
        registry
            .advertise(&ServiceAdvertisement::new(SERVICE_NAME, SERVICE_TYPE, listener.local_addr().unwrap().port()))
            .await
            .unwrap();

        let _peer = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await.unwrap().unwrap();
        let mut states = consumer.subscribe();
        wait(&mut states, "connected").await;
    }

    #[tokio::test]
    async fn connects_to_a_raw_listener_and_reads_frames() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = LocalRegistry::new();
        registry
            .advertise(&ServiceAdvertisement::new(SERVICE_NAME, SERVICE_TYPE, listener.local_addr().unwrap().port()))
            .await
            .unwrap();

        let mut consumer = Consumer::start(&config(), Arc::new(registry.browser()));
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(&[7u8; 100]).await.unwrap();

        let frame = consumer.next_frame().await.unwrap();
        assert_eq!(frame.data().as_ref(), &[7u8; 100][..]);
        assert!(matches!(consumer.state(), ConsumerState::Connected { .. }));

        drop(peer);
        consumer.closed().await;
        assert!(consumer.next_frame().await.is_none());
    }
}
