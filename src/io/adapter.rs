// src/io/adapter.rs
//
// Turns a decoded frame payload into the packet body for the active link
// type. UART payloads pass through unchanged; CAN payloads arrive in the
// device's compacted form and are expanded to the 8-byte-header CAN layout
// the capture format expects; debug records are host-generated.

use crate::error::CaptureError;
use crate::io::LinkType;

/// Classic CAN carries at most 8 data bytes.
const CAN_MAX_DATA: usize = 8;

/// Build the packet body for one decoded frame.
pub fn adapt(link_type: LinkType, payload: &[u8]) -> Result<Vec<u8>, CaptureError> {
    match link_type {
        LinkType::UartRaw => Ok(payload.to_vec()),
        LinkType::Can => adapt_can(payload),
        // Diagnostic sessions report decoded frames as debug text records.
        LinkType::DebugLog => Ok(debug_record(
            0,
            &format!("Frame received with {} bytes", payload.len()),
        )),
    }
}

/// Expand a compacted CAN payload.
///
/// Wire form: extended frames (high bit of byte0 set) carry the full 4-byte
/// identifier; standard frames drop the two always-zero identifier bytes and
/// are reconstructed here. Both forms continue with a DLC byte and the data
/// bytes; the FD-flags byte and the two reserved bytes are zero on this
/// device and re-inserted.
fn adapt_can(payload: &[u8]) -> Result<Vec<u8>, CaptureError> {
    if payload.len() < 3 {
        return Err(CaptureError::protocol(
            "can-adapter",
            format!(
                "CAN payload shorter than the 3-byte minimum (raw bytes: {})",
                hex::encode(payload)
            ),
        ));
    }

    let mut body = Vec::with_capacity(8 + CAN_MAX_DATA);
    let consumed;
    if payload[0] & 0x80 != 0 {
        if payload.len() < 5 {
            return Err(CaptureError::protocol(
                "can-adapter",
                format!(
                    "extended CAN payload too short for its identifier (raw bytes: {})",
                    hex::encode(payload)
                ),
            ));
        }
        body.extend_from_slice(&payload[0..4]);
        consumed = 4;
    } else {
        body.push(payload[0] & 0xE0);
        body.push(0x00);
        body.push(payload[0] & 0x1F);
        body.push(payload[1]);
        consumed = 2;
    }

    // DLC, FD flags, two reserved bytes.
    body.push(payload[consumed]);
    body.extend_from_slice(&[0x00, 0x00, 0x00]);

    let data = &payload[consumed + 1..];
    let take = std::cmp::min(data.len(), CAN_MAX_DATA);
    body.extend_from_slice(&data[..take]);
    Ok(body)
}

/// Host-generated diagnostic record: a state word, the message length
/// (including the terminating NUL) and the message text.
pub fn debug_record(state: u32, message: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + message.len() + 1);
    body.extend_from_slice(&state.to_le_bytes());
    body.extend_from_slice(&((message.len() as u32 + 1).to_le_bytes()));
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body
}
