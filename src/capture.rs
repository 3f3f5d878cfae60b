// src/capture.rs
//
// Drives one capture session end to end: session handshake, timebase
// negotiation, capture command, then the decode/adapt/encode loop until the
// cancel flag is raised or a fatal protocol error occurs. The stop command
// runs on every exit path.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::CaptureError;
use crate::io::adapter;
use crate::io::decoder::{DecodeEvent, FrameDecoder, DEFAULT_MAX_PAYLOAD};
use crate::io::device::{DeviceSession, SerialLink};
use crate::io::{phy_layer_name, LinkType};
use crate::pcap::PcapWriter;
use crate::ring_buffer::RingBuffer;
use crate::timebase::Timebase;

pub const DEFAULT_SNAP_LEN: u32 = 512;
pub const DEFAULT_RING_CAPACITY: usize = 512;

const INITIATE_TIMEOUT_MS: u32 = 5_000;
const TIME_TIMEOUT_MS: u32 = 500;
const CAPTURE_CMD_TIMEOUT_MS: u32 = 200;
const ACK_TIMEOUT_MS: u32 = 1_000;
const STOP_TIMEOUT_MS: u32 = 50;
const READ_CHUNK: usize = 256;

/// What to do when the serial port cannot be opened. The primary interface
/// fails fast; the diagnostic one keeps retrying so a device can be plugged
/// in while the capture is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenRetry {
    FailFast,
    Forever { backoff_ms: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialParams {
    #[serde(default = "default_serial_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// "none", "odd" or "even"; passed through to the device.
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Inter-character timeout the device applies on the tapped line.
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u32,
}

fn default_serial_baud() -> u32 { 115_200 }
fn default_data_bits() -> u8 { 8 }
fn default_parity() -> String { "none".to_string() }
fn default_stop_bits() -> u8 { 1 }
fn default_serial_timeout() -> u32 { 1_000 }

impl Default for SerialParams {
    fn default() -> Self {
        SerialParams {
            baud_rate: default_serial_baud(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_serial_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanParams {
    #[serde(default = "default_can_bitrate")]
    pub bitrate: u32,
    /// Sample point in per-mille (875 = 87.5%).
    #[serde(default = "default_sample_point")]
    pub sample_point: u32,
}

fn default_can_bitrate() -> u32 { 500_000 }
fn default_sample_point() -> u32 { 875 }

impl Default for CanParams {
    fn default() -> Self {
        CanParams {
            bitrate: default_can_bitrate(),
            sample_point: default_sample_point(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Serial port path of the device's control channel.
    pub port: String,
    /// Baud rate of the control channel (USB CDC, so largely nominal).
    pub control_baud_rate: u32,
    pub link_type: LinkType,
    pub serial: SerialParams,
    pub can: CanParams,
    pub snap_len: u32,
    /// Frame payload sanity ceiling; device policy, not wire format.
    pub max_payload: usize,
    pub ring_capacity: usize,
    pub open_retry: OpenRetry,
    /// Sleep between polls when the serial line is idle.
    pub idle_sleep_ms: u64,
}

impl CaptureConfig {
    pub fn new(port: &str, link_type: LinkType) -> Self {
        CaptureConfig {
            port: port.to_string(),
            control_baud_rate: 115_200,
            link_type,
            serial: SerialParams::default(),
            can: CanParams::default(),
            snap_len: DEFAULT_SNAP_LEN,
            max_payload: DEFAULT_MAX_PAYLOAD,
            ring_capacity: DEFAULT_RING_CAPACITY,
            open_retry: OpenRetry::FailFast,
            idle_sleep_ms: 1,
        }
    }
}

/// Build the capture-start command for the configured link type. Diagnostic
/// sessions exercise the UART path on the device.
pub fn capture_command(cfg: &CaptureConfig) -> Vec<u8> {
    match cfg.link_type {
        LinkType::UartRaw | LinkType::DebugLog => format!(
            "capture 148 -b={} -d={} -p={} -s={} -t={}\n",
            cfg.serial.baud_rate,
            cfg.serial.data_bits,
            cfg.serial.parity,
            cfg.serial.stop_bits,
            cfg.serial.timeout_ms
        )
        .into_bytes(),
        LinkType::Can => format!(
            "capture 227 -b={} -s={}\n",
            cfg.can.bitrate, cfg.can.sample_point
        )
        .into_bytes(),
    }
}

/// Run a full capture session against the configured serial port, writing
/// pcap output to `sink`.
pub fn run_capture<W: Write>(
    cfg: &CaptureConfig,
    sink: W,
    cancel: Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    let mut pcap = PcapWriter::new(sink);
    pcap.write_global_header(false, cfg.snap_len, cfg.link_type, 0, 0, 0)?;

    let mut session = loop {
        match DeviceSession::open(&cfg.port, cfg.control_baud_rate, cancel.clone()) {
            Ok(s) => break s,
            Err(e) => match cfg.open_retry {
                OpenRetry::FailFast => return Err(e),
                OpenRetry::Forever { backoff_ms } => {
                    tlog!(
                        crate::logging::Severity::Warning,
                        "capture",
                        "open failed ({}), retrying in {} ms",
                        e,
                        backoff_ms
                    );
                    if cfg.link_type == LinkType::DebugLog {
                        debug_milestone(
                            &mut pcap,
                            &format!("Serial port open failed, retrying: {}", e),
                        )?;
                    }
                    if clock::wait(backoff_ms, &cancel) {
                        return Err(CaptureError::Cancelled);
                    }
                }
            },
        }
    };

    let result = run_session(cfg, &mut pcap, &mut session, &cancel);

    // Terminate a possibly running capture command on the device; failures
    // on this path are expected when the link already died.
    if let Err(e) = session.stop_capture(STOP_TIMEOUT_MS) {
        tlog!(
            crate::logging::Severity::Debug,
            "capture",
            "stop command failed during teardown: {}",
            e
        );
    }
    let _ = pcap.flush();
    result
}

/// The session body, split out so tests can drive it with a scripted link.
pub fn run_session<W: Write, L: SerialLink>(
    cfg: &CaptureConfig,
    pcap: &mut PcapWriter<W>,
    session: &mut DeviceSession<L>,
    cancel: &Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    let diagnostic = cfg.link_type == LinkType::DebugLog;

    session.initiate(INITIATE_TIMEOUT_MS)?;
    if diagnostic {
        let board_id = session.board_id(TIME_TIMEOUT_MS)?;
        debug_milestone(
            pcap,
            &format!(
                "Session initiated with board 0x{:08X} ({})",
                board_id,
                phy_layer_name(board_id).unwrap_or("unknown physical layer")
            ),
        )?;
    } else {
        // Reject a link type the attached board cannot stream before the
        // capture command goes out.
        let dlts = session.supported_dlts(TIME_TIMEOUT_MS)?;
        if !dlts.contains(&cfg.link_type.dlt()) {
            return Err(CaptureError::configuration(format!(
                "device does not support link type {} (offers: {:?})",
                cfg.link_type.dlt(),
                dlts
            )));
        }
    }

    let device_micros = session.board_micros(TIME_TIMEOUT_MS)?;
    let (host_seconds, host_micros) = clock::unix_time();
    let mut timebase = Timebase::set(host_seconds, host_micros, device_micros);
    tlog!(
        crate::logging::Severity::Info,
        "capture",
        "timebase set from device micros {}",
        device_micros
    );

    let cmd = capture_command(cfg);
    session.exec(&cmd, CAPTURE_CMD_TIMEOUT_MS)?;
    session.await_capture_ack(ACK_TIMEOUT_MS)?;
    if diagnostic {
        debug_milestone(pcap, "Capture started")?;
    }

    let ring = RingBuffer::new(cfg.ring_capacity);
    let mut decoder = FrameDecoder::with_max_payload(cfg.max_payload);
    let mut chunk = [0u8; READ_CHUNK];

    while !cancel.load(Ordering::SeqCst) {
        let want = std::cmp::min(chunk.len(), ring.free());
        let read = if want > 0 {
            session.read(&mut chunk[..want])?
        } else {
            0
        };
        if read > 0 {
            ring.write(&chunk[..read]);
        }

        loop {
            match decoder.poll(&ring)? {
                DecodeEvent::NeedMoreData => break,
                DecodeEvent::Wrapped => {
                    tlog!(
                        crate::logging::Severity::Info,
                        "capture",
                        "device timestamp wrapped, timebase advanced"
                    );
                    timebase.advance_wrap();
                }
                DecodeEvent::NullFrame => {}
                DecodeEvent::Frame(frame) => {
                    let body = adapter::adapt(cfg.link_type, &frame.payload)?;
                    let (seconds, micros) = if diagnostic {
                        clock::unix_time()
                    } else {
                        timebase.timestamp(frame.device_micros)
                    };
                    pcap.write_record(seconds as u32, micros, body.len() as u32, &body)?;
                }
            }
        }

        if read == 0 {
            std::thread::sleep(Duration::from_millis(cfg.idle_sleep_ms));
        }
    }

    Ok(())
}

fn debug_milestone<W: Write>(
    pcap: &mut PcapWriter<W>,
    message: &str,
) -> Result<(), CaptureError> {
    let body = adapter::debug_record(0, message);
    let (seconds, micros) = clock::unix_time();
    pcap.write_record(seconds as u32, micros, body.len() as u32, &body)
}
