//! Wire framing for the dongle serial link.
//!
//! The wire format is:
//! ```text
//! ┌──────────┬──────────────┬─────────────────┬──────────────┐
//! │  0xAA    │  size (LE)   │    payload      │  CRC16 (LE)  │
//! │  1 byte  │   2 bytes    │   size bytes    │   2 bytes    │
//! └──────────┴──────────────┴─────────────────┴──────────────┘
//! ```
//!
//! The CRC is [`crc16_wire`] over the payload only.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::protocol::crc::crc16_wire;

/// Sync byte marking the start of a frame.
pub const SYNC_BYTE: u8 = 0xAA;

/// Maximum frame payload size.
pub const MAX_PAYLOAD_SIZE: usize = 571;

/// Sync byte, length and CRC.
pub const FRAME_OVERHEAD: usize = 5;

/// Encodes a payload into a framed message.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u8(SYNC_BYTE);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.put_u16_le(crc16_wire(payload));
    Ok(buf.freeze())
}

/// Receiver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    /// Waiting for the sync byte.
    #[default]
    Idle,
    /// Reading the low byte of the length.
    HeaderLow,
    /// Reading the high byte of the length.
    HeaderHigh,
    /// Reading payload bytes.
    Payload,
    /// Reading the low byte of the CRC.
    ChecksumLow,
    /// Reading the high byte of the CRC.
    ChecksumHigh,
}

/// Byte-at-a-time frame receiver.
///
/// Never blocks and never buffers more than one frame. Noise outside a
/// frame is skipped until the next sync byte; a bad length or CRC drops
/// the frame and returns to [`FrameState::Idle`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: FrameState,
    length: usize,
    checksum: u16,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            length: 0,
            checksum: 0,
            buffer: BytesMut::with_capacity(MAX_PAYLOAD_SIZE),
        }
    }

    /// Current receiver state.
    #[must_use]
    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Processes one byte.
    ///
    /// Returns `Some(Ok(payload))` when a frame completes with a valid CRC,
    /// `Some(Err(_))` when a frame is rejected, `None` otherwise.
    pub fn push(&mut self, byte: u8) -> Option<Result<Bytes, FrameError>> {
        match self.state {
            FrameState::Idle => {
                if byte == SYNC_BYTE {
                    self.state = FrameState::HeaderLow;
                    self.buffer.clear();
                }
                None
            }
            FrameState::HeaderLow => {
                self.length = usize::from(byte);
                self.state = FrameState::HeaderHigh;
                None
            }
            FrameState::HeaderHigh => {
                self.length |= usize::from(byte) << 8;
                if self.length > MAX_PAYLOAD_SIZE {
                    self.state = FrameState::Idle;
                    return Some(Err(FrameError::InvalidLength {
                        length: self.length,
                        max: MAX_PAYLOAD_SIZE,
                    }));
                }
                self.state = if self.length == 0 {
                    FrameState::ChecksumLow
                } else {
                    FrameState::Payload
                };
                None
            }
            FrameState::Payload => {
                self.buffer.put_u8(byte);
                if self.buffer.len() == self.length {
                    self.state = FrameState::ChecksumLow;
                }
                None
            }
            FrameState::ChecksumLow => {
                self.checksum = u16::from(byte);
                self.state = FrameState::ChecksumHigh;
                None
            }
            FrameState::ChecksumHigh => {
                self.checksum |= u16::from(byte) << 8;
                self.state = FrameState::Idle;

                let computed = crc16_wire(&self.buffer);
                if computed == self.checksum {
                    Some(Ok(self.buffer.split().freeze()))
                } else {
                    Some(Err(FrameError::CrcFailure {
                        received: self.checksum,
                        computed,
                        payload: self.buffer.split().to_vec(),
                    }))
                }
            }
        }
    }

    /// Feeds a chunk of received bytes, returning every frame outcome in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Bytes, FrameError>> {
        data.iter().filter_map(|&byte| self.push(byte)).collect()
    }

    /// Drops any partial frame.
    pub fn clear(&mut self) {
        self.state = FrameState::Idle;
        self.length = 0;
        self.checksum = 0;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(results: Vec<Result<Bytes, FrameError>>) -> Vec<Bytes> {
        results.into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn test_encode_simple() {
        let frame = encode(b"hello").unwrap();

        assert_eq!(frame[0], SYNC_BYTE);
        assert_eq!(frame[1], 5); // length low byte
        assert_eq!(frame[2], 0); // length high byte
        assert_eq!(&frame[3..8], b"hello");
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), crc16_wire(b"hello"));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            encode(&payload),
            Err(FrameError::PayloadTooLarge {
                size: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            })
        );
    }

    #[test]
    fn test_round_trip_all_lengths() {
        let mut decoder = FrameDecoder::new();
        for len in 0..=MAX_PAYLOAD_SIZE {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let frame = encode(&payload).unwrap();
            let results = decoder.feed(&frame);
            assert_eq!(results.len(), 1, "length {len}");
            assert_eq!(results[0].as_deref(), Ok(payload.as_slice()), "length {len}");
            assert_eq!(decoder.state(), FrameState::Idle);
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut decoder = FrameDecoder::new();
        let frame = encode(b"hello").unwrap();

        assert!(decoder.feed(&frame[..4]).is_empty());
        assert_eq!(decoder.state(), FrameState::Payload);

        let results = decoder.feed(&frame[4..]);
        assert_eq!(frames(results), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_skips_noise_before_sync() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![0x00, 0x13, 0x37, 0xFF];
        stream.extend_from_slice(&encode(b"ok").unwrap());

        let results = decoder.feed(&stream);
        assert_eq!(frames(results), vec![Bytes::from_static(b"ok")]);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        let mut stream = encode(b"hi").unwrap().to_vec();
        stream.extend_from_slice(&encode(b"bye").unwrap());

        let results = decoder.feed(&stream);
        assert_eq!(
            frames(results),
            vec![Bytes::from_static(b"hi"), Bytes::from_static(b"bye")]
        );
    }

    #[test]
    fn test_single_bit_flip_fails_crc() {
        let payload = [0x10, 0x20, 0x30, 0x40];
        let frame = encode(&payload).unwrap();

        // Payload and CRC region only; the length field stays valid.
        for index in 3..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.to_vec();
                corrupted[index] ^= 1 << bit;

                let mut decoder = FrameDecoder::new();
                let results = decoder.feed(&corrupted);
                assert_eq!(results.len(), 1, "byte {index} bit {bit}");
                assert!(
                    matches!(results[0], Err(FrameError::CrcFailure { .. })),
                    "byte {index} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_crc_failure_keeps_payload() {
        let mut frame = encode(&[0xDE, 0xAD]).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        let results = decoder.feed(&frame);
        let Err(error) = &results[0] else {
            panic!("corrupted frame decoded: {results:?}");
        };
        assert!(matches!(
            error,
            FrameError::CrcFailure { payload, .. } if payload == &[0xDE, 0xAD]
        ));
        assert!(error.to_string().ends_with("(payload: dead)"));
        assert_eq!(decoder.state(), FrameState::Idle);
    }

    #[test]
    fn test_invalid_length_returns_to_idle() {
        let mut decoder = FrameDecoder::new();
        // Length 572, followed by bytes that would otherwise look like payload.
        let results = decoder.feed(&[SYNC_BYTE, 0x3C, 0x02]);
        assert_eq!(
            results,
            vec![Err(FrameError::InvalidLength {
                length: 572,
                max: MAX_PAYLOAD_SIZE
            })]
        );
        assert_eq!(decoder.state(), FrameState::Idle);

        // Non-sync garbage is ignored, the next real frame decodes.
        let mut stream = vec![0x01, 0x02, 0x03];
        stream.extend_from_slice(&encode(b"next").unwrap());
        let results = decoder.feed(&stream);
        assert_eq!(frames(results), vec![Bytes::from_static(b"next")]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut decoder = FrameDecoder::new();
        let frame = encode(&[]).unwrap();
        assert_eq!(frame.as_ref(), &[SYNC_BYTE, 0x00, 0x00, 0xFF, 0xFF]);

        let results = decoder.feed(&frame);
        assert_eq!(frames(results), vec![Bytes::new()]);
    }
}
