// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame compression.
//!
//! Outgoing frames flagged compressible are deflated when they clear the
//! minimum-size threshold and the result is actually smaller. The header
//! stays uncompressed; the compressed body is preceded by the original
//! frame size so the receiver can pre-allocate and verify:
//!
//! ```text
//! +-------------+----------------------+------------------------+
//! | Header (14) | Uncompressed size 4B | Deflated body          |
//! +-------------+----------------------+------------------------+
//! ```
//!
//! The caller rewrites the header's compress-flag byte and size field
//! after a successful compression.

use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use super::{ProtocolError, FRAME_SIZE_OFFSET, HEADER_SIZE};

/// Attempt to compress a complete frame (header included).
///
/// Returns `None` when the frame is below `min_size` or compression does
/// not shrink it; the caller sends the original frame with the compress
/// flag downgraded to "negotiated".
pub fn compress_frame(frame: &[u8], level: u32, min_size: usize) -> Option<Vec<u8>> {
    if frame.len() < min_size.max(HEADER_SIZE) {
        return None;
    }

    let body = &frame[HEADER_SIZE..];
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(frame.len() / 2),
        Compression::new(level),
    );
    if encoder.write_all(body).is_err() {
        return None;
    }
    let deflated = encoder.finish().ok()?;

    let total = HEADER_SIZE + 4 + deflated.len();
    if total >= frame.len() {
        return None;
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&frame[..HEADER_SIZE]);
    out.extend_from_slice(&(frame.len() as i32).to_le_bytes());
    out.extend_from_slice(&deflated);
    Some(out)
}

/// Decompress a frame whose header carries compress status 2.
///
/// The returned frame has the original uncompressed layout with the
/// header's size field rewritten and the compress flag downgraded.
pub fn decompress_frame(frame: &[u8], max_size: usize) -> Result<Vec<u8>, ProtocolError> {
    if frame.len() < HEADER_SIZE + 4 {
        return Err(ProtocolError::CorruptCompressedFrame);
    }

    let declared = i32::from_le_bytes([
        frame[HEADER_SIZE],
        frame[HEADER_SIZE + 1],
        frame[HEADER_SIZE + 2],
        frame[HEADER_SIZE + 3],
    ]);
    if declared < HEADER_SIZE as i32 {
        return Err(ProtocolError::CorruptCompressedFrame);
    }
    let declared = declared as usize;
    if declared > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: declared,
            max: max_size,
        });
    }

    let mut decoder = DeflateDecoder::new(Vec::with_capacity(declared));
    decoder
        .write_all(&frame[HEADER_SIZE + 4..])
        .map_err(|_| ProtocolError::CorruptCompressedFrame)?;
    let body = decoder
        .finish()
        .map_err(|_| ProtocolError::CorruptCompressedFrame)?;

    if HEADER_SIZE + body.len() != declared {
        return Err(ProtocolError::CorruptCompressedFrame);
    }

    let mut out = Vec::with_capacity(declared);
    out.extend_from_slice(&frame[..HEADER_SIZE]);
    out.extend_from_slice(&body);
    out[super::COMPRESS_FLAG_OFFSET] = super::CompressFlag::Negotiated as u8;
    out[FRAME_SIZE_OFFSET..FRAME_SIZE_OFFSET + 4].copy_from_slice(&(declared as i32).to_le_bytes());
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
