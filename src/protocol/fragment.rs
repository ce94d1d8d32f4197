//! Datagram framing for streamed images.
//!
//! An encoded image is cut into chunks of at most `stride` bytes. Each chunk is
//! sent as its own datagram, prefixed with the 4-byte little-endian detector id.
//! A datagram holding nothing but the prefix terminates the frame.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ detector id (4, LE)  │ image chunk (0..=stride) │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! There are no sequence numbers: a receiver relies on one frame's fragments
//! arriving contiguously and in order.

use super::DetectorId;

use std::{collections::HashMap, slice::Chunks};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default payload bytes per fragment.
pub(crate) const STRIDE: usize = 508;

/// Length of the detector id prefix.
pub(crate) const PREFIX_LEN: usize = 4;

// Receiver side; the device itself only encodes
#[allow(dead_code)]
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FragmentError {
    #[error("packet of {0} bytes is too short to carry a detector id")]
    Truncated(usize),
    #[error("no terminator fragment was seen")]
    Incomplete,
}

/// Split `image` into wire fragments for `id`, followed by one terminator.
///
/// # Panics
///
/// Panics if `stride` is zero.
pub(crate) fn encode(id: DetectorId, image: &[u8], stride: usize) -> Fragments<'_> {
    assert!(stride > 0, "fragment stride must be non-zero");
    Fragments {
        prefix: id.prefix(),
        chunks: image.chunks(stride),
        terminated: false,
    }
}

/// Iterator returned by [`encode`].
pub(crate) struct Fragments<'a> {
    prefix: [u8; PREFIX_LEN],
    chunks: Chunks<'a, u8>,
    terminated: bool,
}

impl<'a> Fragments<'a> {
    fn packet(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
        buf.put_slice(&self.prefix);
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.chunks.next() {
            return Some(self.packet(chunk));
        }

        if self.terminated {
            return None;
        }
        self.terminated = true;
        Some(self.packet(&[]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.chunks.len() + usize::from(!self.terminated);
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for Fragments<'a> {}

#[allow(dead_code)]
fn split(packet: &[u8]) -> Result<(DetectorId, &[u8]), FragmentError> {
    let prefix: [u8; PREFIX_LEN] = packet
        .get(..PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or(FragmentError::Truncated(packet.len()))?;
    Ok((DetectorId::from_prefix(prefix), &packet[PREFIX_LEN..]))
}

/// Receiver-side reassembly, demultiplexed by detector id.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    partial: HashMap<DetectorId, BytesMut>,
}

#[allow(dead_code)]
impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram; returns a frame once its terminator arrives.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<(DetectorId, Bytes)>, FragmentError> {
        let (id, payload) = split(packet)?;

        if payload.is_empty() {
            let frame = self.partial.remove(&id).unwrap_or_default();
            return Ok(Some((id, frame.freeze())));
        }

        self.partial.entry(id).or_default().put_slice(payload);
        Ok(None)
    }

    /// Number of ids with a frame in flight.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

/// Reassemble the first complete frame found in `fragments`.
#[allow(dead_code)]
pub(crate) fn decode<I, B>(fragments: I) -> Result<(DetectorId, Bytes), FragmentError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut reassembler = Reassembler::new();
    for fragment in fragments {
        if let Some(frame) = reassembler.push(fragment.as_ref())? {
            return Ok(frame);
        }
    }
    Err(FragmentError::Incomplete)
}
