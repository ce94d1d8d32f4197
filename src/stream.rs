//! Background streaming of fragmented frames over UDP.
//!
//! [`Streamer`] owns the start/stop transition: at most one worker runs at a
//! time, and its lock is held only while a worker is being spawned or joined,
//! never across the worker's own loop.

use crate::{
    camera::{EncodeError, Encoding, FrameSource},
    protocol::{fragment, DetectorId},
};

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use thiserror::Error;
use tokio::{net::UdpSocket, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub(crate) enum StreamError {
    #[error("camera error: {0}")]
    Camera(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn camera_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> StreamError {
    StreamError::Camera(Box::new(err))
}

#[derive(Clone, Debug)]
pub(crate) struct StreamConfig {
    pub dest: SocketAddr,
    pub stride: usize,
    pub quality: u8,
    /// Count and log datagrams the OS refused to send.
    pub report_send_errors: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            dest: SocketAddr::from((Ipv4Addr::LOCALHOST, 9697)),
            stride: fragment::STRIDE,
            quality: 60,
            report_send_errors: false,
        }
    }
}

/// Counters reported when a worker stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct StreamStats {
    pub frames: u64,
    pub fragments: u64,
    pub failed_sends: u64,
}

struct Worker<F> {
    source: Arc<F>,
    detector_id: DetectorId,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl<F: FrameSource> Worker<F> {
    async fn run(self) -> Result<StreamStats, StreamError> {
        let result = self.open_and_stream().await;
        if let Err(e) = &result {
            error!(detector_id = %self.detector_id, "streaming worker failed: {e}");
        }
        result
    }

    async fn open_and_stream(&self) -> Result<StreamStats, StreamError> {
        let bind = match self.config.dest {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind).await?;

        self.source.start().map_err(camera_error)?;
        let result = self.stream(&socket).await;
        if let Err(e) = self.source.stop() {
            warn!("failed to release camera: {e}");
        }
        result
    }

    async fn stream(&self, socket: &UdpSocket) -> Result<StreamStats, StreamError> {
        let encoding = Encoding::Jpeg {
            quality: self.config.quality,
        };
        let mut stats = StreamStats::default();

        // Stop is only observed between frames
        while !self.cancel.is_cancelled() {
            // The capture is held until the whole frame is on the wire
            let capture = self.source.acquire().await.map_err(camera_error)?;
            let image = capture.encode(encoding)?;

            for packet in fragment::encode(self.detector_id, image.as_ref(), self.config.stride) {
                stats.fragments += 1;
                if let Err(e) = socket.send_to(&packet, self.config.dest).await {
                    if self.config.report_send_errors {
                        stats.failed_sends += 1;
                        warn!("failed to send fragment to {}: {e}", self.config.dest);
                    }
                }
            }
            stats.frames += 1;
            drop(capture);
        }

        Ok(stats)
    }
}

struct ActiveStream {
    detector_id: DetectorId,
    cancel: CancellationToken,
    handle: JoinHandle<Result<StreamStats, StreamError>>,
}

impl ActiveStream {
    async fn finish(self) -> Option<StreamStats> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(Ok(stats)) => {
                info!(
                    detector_id = %self.detector_id,
                    frames = stats.frames,
                    fragments = stats.fragments,
                    failed_sends = stats.failed_sends,
                    "streaming stopped"
                );
                Some(stats)
            }
            Ok(Err(_)) => None,
            Err(e) => {
                error!("streaming worker did not finish cleanly: {e}");
                None
            }
        }
    }
}

/// Starts and stops the single streaming worker of a session.
pub(crate) struct Streamer<F> {
    source: Arc<F>,
    config: StreamConfig,
    active: Mutex<Option<ActiveStream>>,
}

impl<F: FrameSource + 'static> Streamer<F> {
    pub fn new(source: Arc<F>, config: StreamConfig) -> Self {
        Self {
            source,
            config,
            active: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Spawn a worker unless one is already running. Returns whether one was spawned.
    ///
    /// Worker failures (socket, camera, encoding) end only that worker.
    pub async fn start(&self, detector_id: DetectorId) -> bool {
        let mut active = self.active.lock().await;

        // A worker that died on its own no longer counts as running
        if active.as_ref().map_or(false, |s| s.handle.is_finished()) {
            if let Some(stream) = active.take() {
                stream.finish().await;
            }
        }

        if active.is_some() {
            debug!("streaming already active");
            return false;
        }

        *active = Some(self.spawn(detector_id));
        true
    }

    /// Signal the worker and wait for it to exit. No-op when idle.
    pub async fn stop(&self) -> Option<StreamStats> {
        let mut active = self.active.lock().await;
        let stream = active.take()?;
        stream.finish().await
    }

    /// Restart a running worker under a new detector id. Returns whether one was running.
    pub async fn retarget(&self, detector_id: DetectorId) -> bool {
        let mut active = self.active.lock().await;
        let Some(stream) = active.take() else {
            return false;
        };

        stream.finish().await;
        *active = Some(self.spawn(detector_id));
        true
    }

    fn spawn(&self, detector_id: DetectorId) -> ActiveStream {
        let cancel = CancellationToken::new();
        let worker = Worker {
            source: Arc::clone(&self.source),
            detector_id,
            config: self.config.clone(),
            cancel: cancel.clone(),
        };

        info!(%detector_id, dest = %self.config.dest, "streaming started");
        ActiveStream {
            detector_id,
            cancel,
            handle: tokio::spawn(worker.run()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Capture, SyntheticCamera};

    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use image::ImageFormat;

    async fn receiver() -> (UdpSocket, StreamConfig) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = StreamConfig {
            dest: socket.local_addr().unwrap(),
            ..StreamConfig::default()
        };
        (socket, config)
    }

    async fn next_frame(socket: &UdpSocket, want: DetectorId) -> Bytes {
        let mut reassembler = fragment::Reassembler::new();
        let mut buf = vec![0u8; 2048];
        let read = async {
            loop {
                let len = socket.recv(&mut buf).await.unwrap();
                if let Some((id, frame)) = reassembler.push(&buf[..len]).unwrap() {
                    if id == want {
                        return frame;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("no frame received")
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_a_no_op_when_idle() {
        let camera = Arc::new(SyntheticCamera::new(16, 16, 200));
        let (_socket, config) = receiver().await;
        let streamer = Streamer::new(Arc::clone(&camera), config);

        assert!(streamer.stop().await.is_none());

        assert!(streamer.start(DetectorId(1)).await);
        assert!(!streamer.start(DetectorId(1)).await);
        assert!(streamer.is_active().await);

        assert!(streamer.stop().await.is_some());
        assert!(!streamer.is_active().await);
        assert!(!camera.is_running());
        assert!(streamer.stop().await.is_none());
    }

    #[tokio::test]
    async fn datagrams_reassemble_into_jpeg_frames() {
        let camera = Arc::new(SyntheticCamera::new(64, 48, 200));
        let (socket, config) = receiver().await;
        let streamer = Streamer::new(camera, config);

        streamer.start(DetectorId(42)).await;
        let frame = next_frame(&socket, DetectorId(42)).await;
        let stats = streamer.stop().await.unwrap();

        let image = image::load_from_memory_with_format(&frame, ImageFormat::Jpeg).unwrap();
        assert_eq!((image.width(), image.height()), (64, 48));
        assert!(stats.frames >= 1);
        assert!(stats.fragments > stats.frames);
        assert_eq!(stats.failed_sends, 0);
    }

    #[tokio::test]
    async fn retarget_switches_the_prefix() {
        let camera = Arc::new(SyntheticCamera::new(16, 16, 200));
        let (socket, config) = receiver().await;
        let streamer = Streamer::new(camera, config);

        assert!(!streamer.retarget(DetectorId(2)).await);
        assert!(!streamer.is_active().await);

        streamer.start(DetectorId(1)).await;
        next_frame(&socket, DetectorId(1)).await;

        assert!(streamer.retarget(DetectorId(2)).await);
        next_frame(&socket, DetectorId(2)).await;
        streamer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn small_stride_yields_more_fragments() {
        let camera = Arc::new(SyntheticCamera::new(32, 32, 200));
        let (socket, config) = receiver().await;
        let streamer = Streamer::new(
            camera,
            StreamConfig {
                stride: 16,
                ..config
            },
        );

        streamer.start(DetectorId(9)).await;
        let frame = next_frame(&socket, DetectorId(9)).await;
        streamer.stop().await.unwrap();

        assert!(frame.len() > 16);
        assert!(image::load_from_memory_with_format(&frame, ImageFormat::Jpeg).is_ok());
    }

    /// Counts the terminators that reached `socket` by the time each capture is released.
    struct Release {
        socket: Arc<std::net::UdpSocket>,
        log: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl Drop for Release {
        fn drop(&mut self) {
            let mut buf = [0u8; 2048];
            let mut terminators = 0;
            while let Ok(len) = self.socket.recv(&mut buf) {
                if len == fragment::PREFIX_LEN {
                    terminators += 1;
                }
            }
            self.log.lock().unwrap().push(terminators);
        }
    }

    struct WatchedCamera {
        inner: SyntheticCamera,
        socket: Arc<std::net::UdpSocket>,
        log: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl FrameSource for WatchedCamera {
        type Error = <SyntheticCamera as FrameSource>::Error;

        fn start(&self) -> Result<(), Self::Error> {
            self.inner.start()
        }

        fn stop(&self) -> Result<(), Self::Error> {
            self.inner.stop()
        }

        async fn acquire<'a>(&'a self) -> Result<Capture<'a>, Self::Error> {
            let capture = self.inner.acquire().await?;
            let frame = (*capture).clone();
            let release = Release {
                socket: Arc::clone(&self.socket),
                log: Arc::clone(&self.log),
            };
            Ok(Capture::new(frame, (capture, release)))
        }
    }

    #[tokio::test]
    async fn capture_is_held_until_the_frame_is_sent() {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_nonblocking(true).unwrap();
        let config = StreamConfig {
            dest: socket.local_addr().unwrap(),
            stride: 64,
            ..StreamConfig::default()
        };
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let camera = Arc::new(WatchedCamera {
            inner: SyntheticCamera::new(32, 32, 200),
            socket: Arc::new(socket),
            log: Arc::clone(&log),
        });
        let streamer = Streamer::new(camera, config);

        streamer.start(DetectorId(4)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker produced no frames");
        streamer.stop().await.unwrap();

        // Every release follows the terminator of the frame it covered
        let released = log.lock().unwrap().clone();
        let mut sent = 0;
        for (frames, terminators) in released.iter().enumerate() {
            sent += terminators;
            assert!(sent > frames, "capture {frames} released before its frame was sent");
        }
    }

    struct BrokenCamera;

    #[async_trait]
    impl FrameSource for BrokenCamera {
        type Error = io::Error;

        fn start(&self) -> Result<(), Self::Error> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no capture device"))
        }

        fn stop(&self) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn acquire<'a>(&'a self) -> Result<Capture<'a>, Self::Error> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no capture device"))
        }
    }

    #[tokio::test]
    async fn failed_worker_is_replaced_on_next_start() {
        let (_socket, config) = receiver().await;
        let streamer = Streamer::new(Arc::new(BrokenCamera), config);

        assert!(streamer.start(DetectorId(1)).await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !streamer.active.lock().await.as_ref().unwrap().handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not exit");

        assert!(streamer.start(DetectorId(1)).await);
        assert!(streamer.stop().await.is_none());
        assert!(!streamer.is_active().await);
    }
}
