// src/lib.rs
//
// CAPTURino extcap bridge: decodes the device's framed serial protocol and
// streams pcap records to the host capture tool.

#[macro_use]
pub mod logging;

pub mod capture;
pub mod clock;
pub mod error;
pub mod extcap;
pub mod io;
pub mod pcap;
pub mod pipe;
pub mod ring_buffer;
pub mod timebase;
