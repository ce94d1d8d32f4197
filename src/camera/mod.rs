mod frame;
pub(crate) use frame::{EncodeError, EncodedImage, Encoding, Frame};

mod synthetic;
pub(crate) use synthetic::SyntheticCamera;

use std::ops::Deref;

use async_trait::async_trait;

/// Exclusive access to one captured frame.
///
/// The capture device stays locked until the guard is dropped, so a snapshot
/// and the streaming worker never read the device at the same time.
pub(crate) struct Capture<'a> {
    frame: Frame,
    _lease: Box<dyn Send + 'a>,
}

impl<'a> Capture<'a> {
    pub fn new(frame: Frame, lease: impl Send + 'a) -> Self {
        Self {
            frame,
            _lease: Box::new(lease),
        }
    }
}

impl Deref for Capture<'_> {
    type Target = Frame;

    fn deref(&self) -> &Self::Target {
        &self.frame
    }
}

/// Something that produces frames: a camera, a file replay, a test pattern.
///
/// `start` and `stop` calls are paired per user; the device is released only
/// once every user has stopped.
#[async_trait]
pub(crate) trait FrameSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn start(&self) -> Result<(), Self::Error>;
    fn stop(&self) -> Result<(), Self::Error>;

    /// Wait for the next frame and hold the device until the capture is dropped.
    async fn acquire<'a>(&'a self) -> Result<Capture<'a>, Self::Error>;
}
