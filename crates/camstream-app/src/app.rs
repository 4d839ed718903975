use std::sync::Arc;

use anyhow::{Context, Result};
use camstream_capture::{run_capture, FrameSampler, SyntheticSource};
use camstream_core::CameraStreamConfig;
use camstream_discovery::{Advertiser, LocalRegistry, MdnsAdvertiser, MdnsBrowser};
use camstream_session::{Consumer, ConsumerHandle, Producer, ProducerHandle};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Resolução da fonte sintética usada no lugar da câmera.
const SOURCE_WIDTH: u32 = 640;
const SOURCE_HEIGHT: u32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RegistryKind {
    /// In-process registry; producer and consumer share this process.
    Local,
    /// Multicast DNS on the local segment.
    Mdns,
}

/// Producer loop
///
/// 1. Bind an ephemeral TCP port and advertise it
/// 2. Feed the synthetic source through the sampler into the frame tap
/// 3. Stream to whichever consumer connects until Ctrl-C
pub async fn produce(config: CameraStreamConfig, registry: RegistryKind) -> Result<()> {
    match registry {
        RegistryKind::Mdns => {
            let mut advertiser = MdnsAdvertiser::new(config.registration_probe());
            if !config.bind_addr.is_unspecified() {
                advertiser = advertiser.with_host_ip(config.bind_addr);
            }
            let advertiser = Arc::new(advertiser);
            let producer = start_producer(&config, advertiser).await?;
            let capture = spawn_capture(&config, &producer);
            wait_for_ctrl_c().await;
            shutdown_producer(producer, capture).await;
        }
        RegistryKind::Local => run_local(config).await?,
    }
    Ok(())
}

/// Consumer loop: discover → resolve → connect, then log every frame until the
/// stream ends or Ctrl-C.
pub async fn consume(config: CameraStreamConfig, registry: RegistryKind) -> Result<()> {
    match registry {
        RegistryKind::Mdns => {
            let consumer = Consumer::start(&config, MdnsBrowser::new());
            log_frames(consumer).await;
        }
        RegistryKind::Local => run_local(config).await?,
    }
    Ok(())
}

/// Both ends in one process, discovered through a [`LocalRegistry`].
async fn run_local(config: CameraStreamConfig) -> Result<()> {
    info!("Local registry: producer and consumer run in this process");
    let registry = LocalRegistry::new();

    let producer = start_producer(&config, Arc::new(registry.clone())).await?;
    let capture = spawn_capture(&config, &producer);
    let consumer = Consumer::start(&config, registry.browser());

    log_frames(consumer).await;
    shutdown_producer(producer, capture).await;
    Ok(())
}

// ── Producer side ─────────────────────────────────────────────────────────────

async fn start_producer(config: &CameraStreamConfig, advertiser: Arc<dyn Advertiser>) -> Result<ProducerHandle> {
    let producer = Producer::start(config, advertiser)
        .await
        .context("starting producer")?;
    info!(
        "Advertising '{}' ({}) on port {}, grid {}, framing {}",
        config.service_name,
        config.service_type,
        producer.port(),
        config.grid,
        config.framing
    );
    Ok(producer)
}

fn spawn_capture(config: &CameraStreamConfig, producer: &ProducerHandle) -> JoinHandle<()> {
    let sampler = FrameSampler::new(config.grid, config.sample_mode);
    let fps = config.capture_fps;
    let tap = producer.frame_tap();

    tokio::spawn(async move {
        let mut source = SyntheticSource::new(SOURCE_WIDTH, SOURCE_HEIGHT, fps);
        let stats = run_capture(&mut source, &sampler, &*tap).await;
        info!("Capture ended after {} images", stats.images());
    })
}

async fn shutdown_producer(mut producer: ProducerHandle, capture: JoinHandle<()>) {
    capture.abort();
    producer.stop();
    producer.closed().await;

    let stats = producer.stats();
    info!(
        "Producer stopped: captured={} written={} dropped={} (idle frames: {})",
        stats.captured(),
        stats.written(),
        stats.dropped(),
        producer.frame_tap().unbound_frames()
    );
}

// ── Consumer side ─────────────────────────────────────────────────────────────

async fn log_frames(mut consumer: ConsumerHandle) {
    let mut count: u64 = 0;
    loop {
        tokio::select! {
            frame = consumer.next_frame() => {
                let Some(frame) = frame else {
                    info!("Stream ended after {} frames", count);
                    break;
                };
                count += 1;
                info!("Frame #{} ({}): mean {:.1}", count, frame.format(), frame.mean());
            }
            _ = wait_for_ctrl_c() => {
                consumer.stop();
                consumer.closed().await;
                info!("Stopped after {} frames", count);
                break;
            }
        }
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
