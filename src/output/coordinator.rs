//! Output coordinator
//!
//! The single control loop of the output side. For every frame announcement
//! it attaches the frame, feeds the camera's encoder and the birdseye
//! compositor when someone is watching, and releases the camera's previous
//! frame. Nothing is encoded for a channel without viewers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::metadata::FrameMetadata;
use crate::birdseye::{Compositor, BIRDSEYE_CHANNEL};
use crate::encoder::{EncoderInput, ExitOutcome};
use crate::error::{Error, Result};
use crate::frame::{FrameId, FrameShape, FrameStore};
use crate::registry::SubscriberRegistry;
use crate::stats::CoordinatorStats;

/// Default wait per dequeue before re-checking for shutdown
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoders by channel, minus the ones that stopped accepting input
struct EncoderSet<E> {
    encoders: BTreeMap<String, E>,
    dead: HashSet<String>,
}

impl<E: EncoderInput> EncoderSet<E> {
    /// Write one frame to `channel`'s encoder. A failed write retires the
    /// channel for good.
    async fn feed(&mut self, channel: &str, frame: &[u8]) -> bool {
        if self.dead.contains(channel) {
            return false;
        }
        let Some(encoder) = self.encoders.get_mut(channel) else {
            return false;
        };

        match encoder.write(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    error = %e,
                    "Encoder unusable, no longer feeding channel"
                );
                self.dead.insert(channel.to_string());
                false
            }
        }
    }
}

/// Drives the frame store, encoders and compositor from the metadata queue
pub struct Coordinator<S, E> {
    store: S,
    registry: Arc<SubscriberRegistry>,
    encoders: EncoderSet<E>,
    compositor: Compositor,

    /// Input frame shape per configured camera
    shapes: HashMap<String, FrameShape>,

    /// Last attached frame per camera, released once its successor is used
    previous: HashMap<String, FrameId>,

    queue_timeout: Duration,
    stats: CoordinatorStats,
}

impl<S: FrameStore, E: EncoderInput> Coordinator<S, E> {
    pub fn new(store: S, registry: Arc<SubscriberRegistry>, compositor: Compositor) -> Self {
        Self {
            store,
            registry,
            encoders: EncoderSet {
                encoders: BTreeMap::new(),
                dead: HashSet::new(),
            },
            compositor,
            shapes: HashMap::new(),
            previous: HashMap::new(),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            stats: CoordinatorStats::new(),
        }
    }

    /// Accept frames from `camera`, laid out as `shape`
    pub fn camera(mut self, camera: impl Into<String>, shape: FrameShape) -> Self {
        self.shapes.insert(camera.into(), shape);
        self
    }

    /// Attach the encoder serving `channel`
    pub fn encoder(mut self, channel: impl Into<String>, encoder: E) -> Self {
        self.encoders.encoders.insert(channel.into(), encoder);
        self
    }

    /// Set the wait per dequeue
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Whether writes to `channel` have stopped after an encoder failure
    pub fn is_dead(&self, channel: &str) -> bool {
        self.encoders.dead.contains(channel)
    }

    /// Process announcements until shutdown is requested or the queue closes.
    ///
    /// The shutdown flag is checked between items and after every dequeue
    /// timeout, so it is noticed within one timeout period.
    pub async fn run(
        &mut self,
        queue: &mut mpsc::Receiver<FrameMetadata>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested, leaving frame loop");
                break;
            }

            match tokio::time::timeout(self.queue_timeout, queue.recv()).await {
                Ok(Some(metadata)) => self.process(metadata).await,
                Ok(None) => {
                    tracing::info!("Metadata queue closed, leaving frame loop");
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    /// Handle one frame announcement
    pub async fn process(&mut self, metadata: FrameMetadata) {
        self.stats.frames += 1;

        let Some(&shape) = self.shapes.get(&metadata.camera) else {
            self.stats.unknown_cameras += 1;
            tracing::warn!(camera = %metadata.camera, "Frame from unconfigured camera, skipping");
            return;
        };

        let id = metadata.frame_id();
        let frame = match self.store.get(&id, shape) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.missing_frames += 1;
                tracing::warn!(frame = %id, error = %e, "Frame unavailable, skipping");
                return;
            }
        };

        if self.registry.has_subscribers(&metadata.camera)
            && self.encoders.feed(&metadata.camera, frame.as_bytes()).await
        {
            self.stats.encoder_writes += 1;
        }

        if self.registry.has_subscribers(BIRDSEYE_CHANNEL)
            && self.compositor.update(
                &metadata.camera,
                metadata.object_count,
                metadata.motion_count,
                metadata.frame_time,
                &frame,
            )
        {
            self.stats.birdseye_updates += 1;
            if self
                .encoders
                .feed(BIRDSEYE_CHANNEL, self.compositor.frame())
                .await
            {
                self.stats.encoder_writes += 1;
            }
        }

        if let Some(previous) = self.previous.insert(metadata.camera, id) {
            self.release(&previous);
        }
    }

    /// Release the buffers of everything still queued, without encoding,
    /// then the retained previous frame of every camera.
    pub fn drain(&mut self, queue: &mut mpsc::Receiver<FrameMetadata>) {
        let mut drained = 0;
        while let Ok(metadata) = queue.try_recv() {
            drained += 1;
            let Some(&shape) = self.shapes.get(&metadata.camera) else {
                self.stats.unknown_cameras += 1;
                continue;
            };
            let id = metadata.frame_id();
            match self.store.get(&id, shape) {
                Ok(_) => self.release(&id),
                Err(e) => {
                    self.stats.missing_frames += 1;
                    tracing::warn!(frame = %id, error = %e, "Queued frame unavailable");
                }
            }
        }

        let retained: Vec<FrameId> = self.previous.drain().map(|(_, id)| id).collect();
        for id in &retained {
            self.release(id);
        }

        tracing::info!(
            drained = drained,
            retained = retained.len(),
            "Released remaining frame buffers"
        );
    }

    /// Stop every encoder, live or dead.
    ///
    /// All encoders are stopped even when one fails; a failed kill is
    /// returned since it leaves a process behind.
    pub async fn exit_encoders(&mut self) -> Result<()> {
        let mut fatal = None;

        for (channel, encoder) in self.encoders.encoders.iter_mut() {
            match encoder.exit().await {
                Ok(ExitOutcome::Graceful) => {}
                Ok(ExitOutcome::Killed) => {
                    tracing::warn!(channel = %channel, "Encoder had to be killed");
                }
                Err(e @ Error::KillFailed { .. }) => {
                    tracing::error!(channel = %channel, error = %e, "Encoder could not be killed");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Encoder exited with error");
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&mut self, id: &FrameId) {
        match self.store.delete(id) {
            Ok(()) => self.stats.released += 1,
            Err(e) => {
                self.stats.release_errors += 1;
                tracing::warn!(frame = %id, error = %e, "Failed to release frame buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::birdseye::compositor::DEFAULT_ACTIVITY_WINDOW;
    use crate::frame::ShmFrameStore;

    const CAMERA: FrameShape = FrameShape {
        width: 4,
        height: 2,
    };
    const CANVAS: FrameShape = FrameShape {
        width: 8,
        height: 4,
    };

    /// What the fake encoders saw: (channel, bytes written) per write, and
    /// channels that were stopped
    #[derive(Default)]
    struct Log {
        writes: Vec<(String, usize)>,
        attempts: usize,
        exits: Vec<String>,
    }

    struct FakeEncoder {
        channel: String,
        log: Arc<Mutex<Log>>,
        broken: bool,
        exit_result: Option<Error>,
    }

    impl FakeEncoder {
        fn new(channel: &str, log: &Arc<Mutex<Log>>) -> Self {
            Self {
                channel: channel.to_string(),
                log: log.clone(),
                broken: false,
                exit_result: None,
            }
        }
    }

    impl EncoderInput for FakeEncoder {
        async fn write(&mut self, frame: &[u8]) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            log.attempts += 1;
            if self.broken {
                return Err(Error::EncoderDead(self.channel.clone()));
            }
            log.writes.push((self.channel.clone(), frame.len()));
            Ok(())
        }

        async fn exit(&mut self) -> Result<ExitOutcome> {
            self.log.lock().unwrap().exits.push(self.channel.clone());
            match self.exit_result.take() {
                Some(e) => Err(e),
                None => Ok(ExitOutcome::Graceful),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        registry: Arc<SubscriberRegistry>,
        log: Arc<Mutex<Log>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                registry: Arc::new(SubscriberRegistry::new(["front", "back", BIRDSEYE_CHANNEL], 64)),
                log: Arc::new(Mutex::new(Log::default())),
            }
        }

        fn coordinator(&self) -> Coordinator<ShmFrameStore, FakeEncoder> {
            Coordinator::new(
                ShmFrameStore::new(self.dir.path()),
                self.registry.clone(),
                Compositor::new(CANVAS, DEFAULT_ACTIVITY_WINDOW),
            )
            .camera("front", CAMERA)
            .camera("back", CAMERA)
            .encoder("front", FakeEncoder::new("front", &self.log))
            .encoder("back", FakeEncoder::new("back", &self.log))
            .encoder(BIRDSEYE_CHANNEL, FakeEncoder::new(BIRDSEYE_CHANNEL, &self.log))
            .queue_timeout(Duration::from_millis(20))
        }

        /// Produce a frame the way the capture side does
        fn produce(&self, camera: &str, frame_time: f64) -> FrameMetadata {
            let metadata = FrameMetadata::new(camera, frame_time);
            let producer = ShmFrameStore::new(self.dir.path());
            let mut map = producer.create(&metadata.frame_id(), CAMERA).unwrap();
            map.fill(128);
            metadata
        }

        fn exists(&self, metadata: &FrameMetadata) -> bool {
            buffer_path(self.dir.path(), metadata).exists()
        }

        fn writes(&self, channel: &str) -> usize {
            self.log
                .lock()
                .unwrap()
                .writes
                .iter()
                .filter(|(name, _)| name == channel)
                .count()
        }
    }

    fn buffer_path(root: &Path, metadata: &FrameMetadata) -> std::path::PathBuf {
        root.join(metadata.frame_id().name())
    }

    fn unix_now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    }

    #[tokio::test]
    async fn test_unwatched_camera_never_encoded() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        // 60 seconds at 10 fps, with objects, nobody watching anything
        for i in 0..600 {
            let metadata = fixture.produce("front", i as f64 / 10.0).objects(1);
            coordinator.process(metadata).await;
        }

        assert_eq!(fixture.log.lock().unwrap().attempts, 0);
        assert_eq!(coordinator.stats().frames, 600);
        assert_eq!(coordinator.stats().encoder_writes, 0);
        // Everything but the latest frame was released along the way
        assert_eq!(coordinator.stats().released, 599);
        assert_eq!(coordinator.store().attached_count(), 1);
    }

    #[tokio::test]
    async fn test_watched_camera_is_encoded() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let _viewer = fixture.registry.subscribe("front").await.unwrap();

        for i in 0..3 {
            coordinator.process(fixture.produce("front", i as f64)).await;
            coordinator.process(fixture.produce("back", i as f64)).await;
        }

        assert_eq!(fixture.writes("front"), 3);
        assert_eq!(fixture.writes("back"), 0);
        assert_eq!(fixture.writes(BIRDSEYE_CHANNEL), 0);
        let log = fixture.log.lock().unwrap();
        assert!(log.writes.iter().all(|&(_, len)| len == CAMERA.len()));
    }

    #[tokio::test]
    async fn test_previous_frame_released_after_successor() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let first = fixture.produce("front", 1.0);
        let other = fixture.produce("back", 1.0);
        let second = fixture.produce("front", 2.0);

        coordinator.process(first.clone()).await;
        assert!(fixture.exists(&first));

        // Another camera's frame does not release this camera's buffer
        coordinator.process(other.clone()).await;
        assert!(fixture.exists(&first));

        coordinator.process(second.clone()).await;
        assert!(!fixture.exists(&first));
        assert!(fixture.exists(&second));
        assert!(fixture.exists(&other));
        assert_eq!(coordinator.stats().release_errors, 0);
    }

    #[tokio::test]
    async fn test_missing_frame_skipped() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let _viewer = fixture.registry.subscribe("front").await.unwrap();

        coordinator.process(FrameMetadata::new("front", 5.0)).await;
        coordinator.process(fixture.produce("front", 6.0)).await;

        assert_eq!(coordinator.stats().missing_frames, 1);
        assert_eq!(fixture.writes("front"), 1);
        assert_eq!(coordinator.stats().release_errors, 0);
    }

    #[tokio::test]
    async fn test_unknown_camera_skipped() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        coordinator.process(FrameMetadata::new("garage", 1.0)).await;

        assert_eq!(coordinator.stats().unknown_cameras, 1);
        assert_eq!(coordinator.store().attached_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_encoder_no_longer_fed() {
        let fixture = Fixture::new();
        let mut broken = FakeEncoder::new("front", &fixture.log);
        broken.broken = true;
        let mut coordinator = fixture.coordinator().encoder("front", broken);
        let _front = fixture.registry.subscribe("front").await.unwrap();
        let _back = fixture.registry.subscribe("back").await.unwrap();

        for i in 0..5 {
            coordinator.process(fixture.produce("front", i as f64)).await;
            coordinator.process(fixture.produce("back", i as f64)).await;
        }

        assert!(coordinator.is_dead("front"));
        assert!(!coordinator.is_dead("back"));
        // One failed attempt on front, then only back is written
        assert_eq!(fixture.log.lock().unwrap().attempts, 6);
        assert_eq!(fixture.writes("back"), 5);
        assert_eq!(coordinator.stats().frames, 10);
    }

    #[tokio::test]
    async fn test_birdseye_fed_only_when_watched() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let now = unix_now();

        coordinator
            .process(fixture.produce("front", now).objects(2))
            .await;
        assert_eq!(fixture.writes(BIRDSEYE_CHANNEL), 0);

        let _viewer = fixture.registry.subscribe(BIRDSEYE_CHANNEL).await.unwrap();
        coordinator
            .process(fixture.produce("front", now + 0.1).objects(2))
            .await;

        assert_eq!(fixture.writes(BIRDSEYE_CHANNEL), 1);
        assert_eq!(fixture.writes("front"), 0);
        assert_eq!(coordinator.stats().birdseye_updates, 1);
        let log = fixture.log.lock().unwrap();
        assert_eq!(log.writes[0], (BIRDSEYE_CHANNEL.to_string(), CANVAS.len()));
    }

    #[tokio::test]
    async fn test_birdseye_idle_not_written() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let _viewer = fixture.registry.subscribe(BIRDSEYE_CHANNEL).await.unwrap();

        // No objects anywhere: nothing to composite
        coordinator.process(fixture.produce("front", unix_now())).await;

        assert_eq!(fixture.writes(BIRDSEYE_CHANNEL), 0);
        assert_eq!(coordinator.stats().birdseye_updates, 0);
    }

    #[tokio::test]
    async fn test_drain_releases_without_encoding() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let _viewer = fixture.registry.subscribe("front").await.unwrap();
        let processed = fixture.produce("front", 1.0);
        coordinator.process(processed.clone()).await;

        let (tx, mut rx) = mpsc::channel(8);
        let queued: Vec<FrameMetadata> = (2..5)
            .map(|i| fixture.produce("front", i as f64))
            .collect();
        for metadata in &queued {
            tx.send(metadata.clone()).await.unwrap();
        }
        tx.send(FrameMetadata::new("front", 9.0)).await.unwrap();

        coordinator.drain(&mut rx);

        assert_eq!(fixture.writes("front"), 1);
        assert!(!fixture.exists(&processed));
        for metadata in &queued {
            assert!(!fixture.exists(metadata));
        }
        assert_eq!(coordinator.store().attached_count(), 0);
        assert_eq!(coordinator.stats().released, 4);
        assert_eq!(coordinator.stats().missing_frames, 1);
    }

    #[tokio::test]
    async fn test_run_until_queue_closed() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tx.send(fixture.produce("front", 1.0)).await.unwrap();
        tx.send(fixture.produce("back", 1.0)).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), coordinator.run(&mut rx, &mut shutdown_rx))
            .await
            .unwrap();

        assert_eq!(coordinator.stats().frames, 2);
    }

    #[tokio::test]
    async fn test_run_observes_shutdown_after_timeout() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        let (_tx, mut rx) = mpsc::channel::<FrameMetadata>(8);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_tx.send(true).unwrap();
            shutdown_tx
        });

        tokio::time::timeout(Duration::from_secs(5), coordinator.run(&mut rx, &mut shutdown_rx))
            .await
            .unwrap();
        drop(stopper.await.unwrap());

        assert_eq!(coordinator.stats().frames, 0);
    }

    #[tokio::test]
    async fn test_exit_encoders_continues_past_kill_failure() {
        let fixture = Fixture::new();
        let mut stuck = FakeEncoder::new("back", &fixture.log);
        stuck.exit_result = Some(Error::KillFailed {
            channel: "back".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        });
        let mut coordinator = fixture.coordinator().encoder("back", stuck);

        let result = coordinator.exit_encoders().await;

        assert!(matches!(assert_err!(result), Error::KillFailed { channel, .. } if channel == "back"));
        let exits = fixture.log.lock().unwrap().exits.clone();
        assert_eq!(exits, vec!["back", BIRDSEYE_CHANNEL, "front"]);
    }

    #[tokio::test]
    async fn test_exit_encoders_ok() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        assert_ok!(coordinator.exit_encoders().await);
        assert_eq!(fixture.log.lock().unwrap().exits.len(), 3);
    }
}
