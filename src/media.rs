//! Local media capture as a capability selected once at startup.
//!
//! [`MediaCapability`] abstracts the platform's capture devices and peer
//! connection factory. [`NullMediaCapability`] is the stand-in for platforms
//! without either; sessions built on it run text-only and never negotiate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{PairChatError, Result};
use crate::peer::{PeerConfig, PeerConnection, PeerSignalSink};

/// Which camera to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// What to capture. `video: None` requests audio only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

/// An acquired local capture stream.
///
/// Exclusively owned by one negotiation context; it is stopped before the next
/// one is acquired.
pub trait LocalMedia: Send + Sync + std::fmt::Debug + 'static {
    fn id(&self) -> &str;

    /// Enable or mute the audio tracks.
    fn set_audio_enabled(&self, enabled: bool);

    /// Enable or blank the video tracks.
    fn set_video_enabled(&self, enabled: bool);

    /// Stop every track and release the capture devices.
    fn stop(&self);
}

/// Wraps an acquired stream and reports when it has been stopped, so the next
/// acquisition can wait until the devices are free.
#[derive(Debug)]
pub(crate) struct CaptureLease {
    inner: Arc<dyn LocalMedia>,
    released: watch::Sender<bool>,
}

impl CaptureLease {
    pub(crate) fn new(inner: Arc<dyn LocalMedia>, released: watch::Sender<bool>) -> Self {
        Self { inner, released }
    }
}

impl LocalMedia for CaptureLease {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.inner.set_audio_enabled(enabled);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.inner.set_video_enabled(enabled);
    }

    fn stop(&self) {
        self.inner.stop();
        self.released.send_replace(true);
    }
}

/// Resolve once the previous capture has been stopped, or once its lease is
/// gone (dropped or never granted).
pub(crate) async fn capture_released(mut previous: watch::Receiver<bool>) {
    loop {
        let stopped = *previous.borrow_and_update();
        if stopped || previous.changed().await.is_err() {
            return;
        }
    }
}

/// Platform media support.
#[async_trait]
pub trait MediaCapability: Send + Sync + 'static {
    /// `false` means no peer connection can be created and the session runs
    /// text-only.
    fn is_available(&self) -> bool {
        true
    }

    /// Open the capture devices.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::MediaAcquisition`] when devices are missing or
    /// permission is denied.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>>;

    /// Build the peer connection for one session. Callbacks must be delivered
    /// through `signals`.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::PeerConnection`] if the platform cannot build one.
    fn create_peer_connection(
        &self,
        config: &PeerConfig,
        signals: PeerSignalSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Media support for platforms without capture devices or a WebRTC stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMediaCapability;

#[async_trait]
impl MediaCapability for NullMediaCapability {
    fn is_available(&self) -> bool {
        false
    }

    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>> {
        Err(PairChatError::MediaAcquisition(
            "media capture is not available on this platform".into(),
        ))
    }

    fn create_peer_connection(
        &self,
        _config: &PeerConfig,
        _signals: PeerSignalSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        Err(PairChatError::PeerConnection(
            "peer connections are not available on this platform".into(),
        ))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::negotiation::Generation;

    #[test]
    fn default_constraints_match_front_camera_vga() {
        let c = MediaConstraints::default();
        assert!(c.audio);
        let video = c.video.unwrap();
        assert_eq!(video.facing, FacingMode::User);
        assert_eq!((video.width, video.height, video.frame_rate), (640, 480, 30));
    }

    #[derive(Debug, Default)]
    struct Stream {
        stopped: std::sync::atomic::AtomicBool,
    }

    impl LocalMedia for Stream {
        fn id(&self) -> &str {
            "cam"
        }

        fn set_audio_enabled(&self, _enabled: bool) {}

        fn set_video_enabled(&self, _enabled: bool) {}

        fn stop(&self) {
            self.stopped.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn lease_reports_release_only_after_stop() {
        let stream = Arc::new(Stream::default());
        let (tx, rx) = watch::channel(false);
        let lease = CaptureLease::new(Arc::clone(&stream) as Arc<dyn LocalMedia>, tx);
        assert_eq!(lease.id(), "cam");

        let waiter = tokio::spawn(capture_released(rx));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        lease.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stream.stopped.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[tokio::test]
    async fn failed_acquisition_releases_immediately() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), capture_released(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn null_capability_is_unavailable() {
        let media = NullMediaCapability;
        assert!(!media.is_available());

        let err = media.acquire(&MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, PairChatError::MediaAcquisition(_)));

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = PeerSignalSink::new(Generation::default(), tx);
        let err = media
            .create_peer_connection(&PeerConfig::default(), sink)
            .err()
            .unwrap();
        assert!(matches!(err, PairChatError::PeerConnection(_)));
    }
}
