// src/io/mod.rs
//
// Device-facing modules: link types, the decoded frame type, the serial
// session and the wire-format decoder/adapter.

pub mod adapter;
pub mod decoder;
pub mod device;

use serde::{Deserialize, Serialize};

/// Link types the device can stream, keyed by their pcap DLT value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Host-generated diagnostic records.
    DebugLog,
    /// Raw UART bytes, passed through unchanged.
    UartRaw,
    /// CAN frames in the device's compacted on-wire form.
    Can,
}

impl LinkType {
    pub fn dlt(self) -> u32 {
        match self {
            LinkType::DebugLog => 147,
            LinkType::UartRaw => 148,
            LinkType::Can => 227,
        }
    }

    /// Unknown values are rejected here, at session setup, never later.
    pub fn from_dlt(value: u32) -> Option<LinkType> {
        match value {
            147 => Some(LinkType::DebugLog),
            148 => Some(LinkType::UartRaw),
            227 => Some(LinkType::Can),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            LinkType::DebugLog => "Debug log",
            LinkType::UartRaw => "UART",
            LinkType::Can => "CAN (ISO 11898-1)",
        }
    }
}

/// One decoded unit of device output. Lives for a single capture-loop
/// iteration; the adapter consumes it immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub device_micros: u32,
    pub payload: Vec<u8>,
}

/// Physical-layer name for a board identifier, shown in the interface
/// configuration dialogue.
pub fn phy_layer_name(board_id: u32) -> Option<&'static str> {
    match board_id {
        0x8000_0001 => Some("CAN (ISO 11898-2)"),
        0x0000_0001 => Some("RS-485"),
        _ => None,
    }
}
