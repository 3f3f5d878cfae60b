// src/io/decoder.rs
//
// Frame-synchronization state machine over the receive ring buffer. The wire
// format is [4-byte big-endian device timestamp][1-2 length bytes][payload];
// a length byte of zero is a null frame used for resynchronization and
// keep-alive. The decoder is re-entrant across partial reads: when the
// current state cannot be satisfied it consumes nothing and reports
// NeedMoreData.

use crate::error::CaptureError;
use crate::io::Frame;
use crate::ring_buffer::RingBuffer;

/// Largest payload any supported link type can produce. Anything above it is
/// a malformed frame and fatal for the stream.
pub const DEFAULT_MAX_PAYLOAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Timestamp,
    Length { device_micros: u32 },
    Content { device_micros: u32, length: usize },
}

/// Outcome of one decoder poll.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// The current state needs more bytes; nothing was consumed.
    NeedMoreData,
    /// The device timestamp counter wrapped; advance the timebase before the
    /// next frame is stamped.
    Wrapped,
    /// Null frame consumed; no payload follows.
    NullFrame,
    Frame(Frame),
}

pub struct FrameDecoder {
    state: State,
    previous_micros: u32,
    previous_null_was_zero: bool,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// The payload ceiling is a device policy, not part of the wire format,
    /// so it stays configurable.
    pub fn with_max_payload(max_payload: usize) -> Self {
        FrameDecoder {
            state: State::Timestamp,
            previous_micros: 0,
            previous_null_was_zero: false,
            max_payload,
        }
    }

    /// Advance the state machine as far as the buffered bytes allow and
    /// report the first event encountered.
    pub fn poll(&mut self, ring: &RingBuffer) -> Result<DecodeEvent, CaptureError> {
        loop {
            match self.state {
                State::Timestamp => {
                    if ring.count() < 4 {
                        return Ok(DecodeEvent::NeedMoreData);
                    }
                    let mut micros: u32 = 0;
                    for i in 0..4 {
                        micros = (micros << 8) | ring.peek_at(i) as u32;
                    }
                    ring.advance_tail(4);

                    let wrapped = micros < self.previous_micros;
                    self.previous_micros = micros;
                    self.state = State::Length {
                        device_micros: micros,
                    };
                    if wrapped {
                        return Ok(DecodeEvent::Wrapped);
                    }
                }

                State::Length { device_micros } => {
                    if ring.count() < 1 {
                        return Ok(DecodeEvent::NeedMoreData);
                    }
                    let byte0 = ring.peek_at(0);
                    if byte0 >= 0x80 {
                        // Extended length: 15 bits across two bytes.
                        if ring.count() < 2 {
                            return Ok(DecodeEvent::NeedMoreData);
                        }
                        let length = (((byte0 & 0x7F) as usize) << 8) | ring.peek_at(1) as usize;
                        ring.advance_tail(2);
                        self.enter_content(device_micros, length)?;
                    } else if byte0 > 0 {
                        ring.advance_tail(1);
                        self.enter_content(device_micros, byte0 as usize)?;
                    } else {
                        // Null frame.
                        ring.advance_tail(1);
                        self.state = State::Timestamp;
                        if device_micros == 0 {
                            if self.previous_null_was_zero {
                                return Err(CaptureError::DeviceInternal);
                            }
                            self.previous_null_was_zero = true;
                        } else {
                            self.previous_null_was_zero = false;
                        }
                        return Ok(DecodeEvent::NullFrame);
                    }
                }

                State::Content {
                    device_micros,
                    length,
                } => {
                    if ring.count() < length {
                        return Ok(DecodeEvent::NeedMoreData);
                    }
                    let mut payload = vec![0u8; length];
                    ring.read_into(&mut payload);
                    self.state = State::Timestamp;
                    return Ok(DecodeEvent::Frame(Frame {
                        device_micros,
                        payload,
                    }));
                }
            }
        }
    }

    fn enter_content(&mut self, device_micros: u32, length: usize) -> Result<(), CaptureError> {
        if length > self.max_payload {
            return Err(CaptureError::MalformedFrame {
                declared: length,
                limit: self.max_payload,
            });
        }
        self.previous_null_was_zero = false;
        self.state = State::Content {
            device_micros,
            length,
        };
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}
