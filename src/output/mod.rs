//! Output process
//!
//! Wires the pieces together for one deployment: one encoder and relay per
//! camera plus `birdseye`, the live-view server, and the coordinator loop.
//!
//! Teardown runs in a fixed order once the loop ends: release queued and
//! retained frames, stop every encoder, join every relay, then close the
//! viewers and stop the server.

pub mod coordinator;
pub mod metadata;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::birdseye::{Compositor, BIRDSEYE_CHANNEL};
use crate::config::OutputConfig;
use crate::encoder::{EncoderSettings, ProcessEncoder};
use crate::error::Result;
use crate::frame::{FrameShape, ShmFrameStore};
use crate::registry::SubscriberRegistry;
use crate::relay::BroadcastRelay;
use crate::server::LiveViewServer;
use crate::stats::RelayStats;

pub use coordinator::Coordinator;
pub use metadata::{forward_records, FrameMetadata};

/// Run the output side until `shutdown` is set or `queue` closes.
///
/// Fails at startup if the server cannot bind or any encoder cannot be
/// started. After startup the only error returned is an encoder that could
/// not be killed; teardown still runs to completion in that case.
pub async fn run(
    config: OutputConfig,
    mut queue: mpsc::Receiver<FrameMetadata>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    config.validate()?;

    let channels: Vec<(String, FrameShape)> = config
        .cameras
        .iter()
        .map(|(name, camera)| (name.clone(), camera.shape()))
        .chain(std::iter::once((
            BIRDSEYE_CHANNEL.to_string(),
            config.birdseye.shape(),
        )))
        .collect();

    let registry = Arc::new(SubscriberRegistry::new(
        channels.iter().map(|(name, _)| name.clone()),
        config.server.subscriber_buffer,
    ));
    let server = LiveViewServer::bind(config.server.clone(), Arc::clone(&registry))
        .await?
        .spawn()?;

    let (encoders, relays) = match start_channels(&config, &channels, &registry) {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "Output failed to start");
            if let Err(e) = server.shutdown().await {
                tracing::warn!(error = %e, "Server shutdown failed");
            }
            return Err(e);
        }
    };

    let compositor = Compositor::new(
        config.birdseye.shape(),
        Duration::from_secs_f64(config.birdseye.activity_window_secs),
    );
    let mut coordinator = Coordinator::new(
        ShmFrameStore::new(&config.frame_store.root),
        Arc::clone(&registry),
        compositor,
    )
    .queue_timeout(config.queue.timeout());
    for (camera, camera_config) in &config.cameras {
        coordinator = coordinator.camera(camera.clone(), camera_config.shape());
    }
    for (channel, encoder) in encoders {
        coordinator = coordinator.encoder(channel, encoder);
    }

    tracing::info!(channels = channels.len(), "Output running");
    coordinator.run(&mut queue, &mut shutdown).await;

    // Teardown
    coordinator.drain(&mut queue);
    let exited = coordinator.exit_encoders().await;

    if exited.is_ok() {
        join_relays(relays).await;
    } else {
        // A surviving encoder keeps its pipe open, so its relay would never end
        for relay in &relays {
            relay.abort();
        }
    }

    if let Err(e) = server.shutdown().await {
        tracing::warn!(error = %e, "Server shutdown failed");
    }

    let stats = coordinator.stats();
    tracing::info!(
        frames = stats.frames,
        missing = stats.missing_frames,
        unknown_cameras = stats.unknown_cameras,
        encoder_writes = stats.encoder_writes,
        birdseye_updates = stats.birdseye_updates,
        released = stats.released,
        release_errors = stats.release_errors,
        "Output stopped"
    );
    exited
}

type Channels = (BTreeMap<String, ProcessEncoder>, Vec<JoinHandle<RelayStats>>);

/// Spawn every encoder and its relay. On failure the encoders already
/// started are dropped, which kills them and ends their relays.
fn start_channels(
    config: &OutputConfig,
    channels: &[(String, FrameShape)],
    registry: &Arc<SubscriberRegistry>,
) -> Result<Channels> {
    let mut encoders = BTreeMap::new();
    let mut relays = Vec::with_capacity(channels.len());

    for (channel, shape) in channels {
        let command = EncoderSettings::from_config(&config.encoder, *shape).command();
        let (encoder, output) =
            ProcessEncoder::spawn(channel.clone(), &command, config.encoder.shutdown_timeout())?;

        let relay = BroadcastRelay::new(channel.clone(), output, Arc::clone(registry))
            .chunk_size(config.encoder.read_chunk_size)
            .spawn();
        encoders.insert(channel.clone(), encoder);
        relays.push(relay);
    }

    Ok((encoders, relays))
}

async fn join_relays(relays: Vec<JoinHandle<RelayStats>>) {
    for relay in relays {
        match relay.await {
            Ok(stats) => tracing::info!(
                channel = %stats.channel,
                bytes = stats.bytes,
                deliveries = stats.deliveries,
                bitrate = stats.bitrate(),
                "Relay joined"
            ),
            Err(e) => tracing::warn!(error = %e, "Relay task failed"),
        }
    }
}
