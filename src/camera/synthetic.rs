use super::{Capture, Frame, FrameSource};

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{sleep_until, Instant},
};
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum CameraError {
    #[error("camera is not started")]
    Stopped,
    #[error("camera stopped more often than started")]
    Unbalanced,
}

struct Sensor {
    next_frame: Option<Instant>,
    sequence: u64,
}

/// Test-pattern camera paced at a fixed frame rate.
pub(crate) struct SyntheticCamera {
    width: u32,
    height: u32,
    period: Duration,
    users: AtomicUsize,
    sensor: Mutex<Sensor>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            period: Duration::from_secs(1) / fps.max(1),
            users: AtomicUsize::new(0),
            sensor: Mutex::new(Sensor {
                next_frame: None,
                sequence: 0,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.users.load(Ordering::Acquire) > 0
    }

    fn render(&self, sequence: u64) -> RgbImage {
        let shift = (sequence % 256) as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                x.wrapping_add(shift) as u8,
                y.wrapping_add(shift * 2) as u8,
                ((x ^ y) >> 1) as u8,
            ])
        })
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    type Error = CameraError;

    fn start(&self) -> Result<(), Self::Error> {
        if self.users.fetch_add(1, Ordering::AcqRel) == 0 {
            info!("opening synthetic camera {}x{}", self.width, self.height);
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), Self::Error> {
        let previous = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| CameraError::Unbalanced)?;
        if previous == 1 {
            info!("releasing synthetic camera");
        }
        Ok(())
    }

    async fn acquire<'a>(&'a self) -> Result<Capture<'a>, Self::Error> {
        if !self.is_running() {
            return Err(CameraError::Stopped);
        }

        let mut sensor = self.sensor.lock().await;
        if let Some(next_frame) = sensor.next_frame {
            sleep_until(next_frame).await;
        }
        sensor.next_frame = Some(Instant::now() + self.period);
        sensor.sequence += 1;

        let sequence = sensor.sequence;
        debug!(sequence, "captured synthetic frame");
        let frame = Frame::new(self.render(sequence), SystemTime::now());
        Ok(Capture::new(frame, sensor))
    }
}
