// src/extcap.rs
//
// Wireshark extcap dispatch: the command-line surface the host tool drives,
// the registry of capture interfaces and their configuration dialogues.
// Dialogue lines follow the extcap format documented in the Wireshark
// developer guide, chapter "Adding Capture Interfaces".

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use crate::capture::{self, CanParams, CaptureConfig, OpenRetry, SerialParams};
use crate::error::CaptureError;
use crate::io::LinkType;
use crate::pipe::ThreadedWriter;

/// Buffer between the capture loop and the pipe thread in threaded-writer
/// mode.
const PIPE_BUFFER_BYTES: usize = 64 * 1024;

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "capturino-extcap",
    version,
    about = "CAPTURino interface for Wireshark"
)]
pub struct ExtcapArgs {
    /// List the capture interfaces this executable provides.
    #[arg(long)]
    pub extcap_interfaces: bool,

    /// Interface the remaining extcap command applies to.
    #[arg(long)]
    pub extcap_interface: Option<String>,

    /// Print the link types of the selected interface.
    #[arg(long)]
    pub extcap_dlts: bool,

    /// Print the configuration dialogue of the selected interface.
    #[arg(long)]
    pub extcap_config: bool,

    /// Wireshark version, sent for compatibility checks.
    #[arg(long)]
    pub extcap_version: Option<String>,

    /// Option whose values should be re-listed.
    #[arg(long)]
    pub extcap_reload_option: Option<String>,

    /// Capture filter validation string (unused, accepted for protocol
    /// completeness).
    #[arg(long)]
    pub extcap_capture_filter: Option<String>,

    /// Start capturing on the selected interface.
    #[arg(long)]
    pub capture: bool,

    /// Named pipe the pcap stream is written to.
    #[arg(long)]
    pub fifo: Option<PathBuf>,

    /// Serial port the CAPTURino device is attached to.
    #[arg(long)]
    pub port: Option<String>,

    /// Selected link type (pcap DLT value).
    #[arg(long)]
    pub dlts: Option<u32>,

    #[arg(long, default_value_t = 115_200)]
    pub serialbaudrate: u32,
    #[arg(long, default_value_t = 8)]
    pub serialdatabits: u8,
    #[arg(long, default_value = "none")]
    pub serialparity: String,
    #[arg(long, default_value_t = 1)]
    pub serialstopbits: u8,
    #[arg(long, default_value_t = 1_000)]
    pub serialtimeout: u32,

    #[arg(long, default_value_t = 500_000)]
    pub canbaudrate: u32,
    /// CAN sample point in per-mille.
    #[arg(long, default_value_t = 875)]
    pub cansamplepoint: u32,

    /// Duplicate log output into this file.
    #[arg(long)]
    pub logfile: Option<PathBuf>,
    /// 0=verbose, 1=debug, 2=info, 3=warning, 4=error, 5=failure.
    #[arg(long, default_value_t = 2)]
    pub loglevel: u8,

    /// Hand pipe writes to a dedicated thread.
    #[arg(long)]
    pub threaded_writer: bool,
}

// ============================================================================
// Interface registry
// ============================================================================

/// One capture interface exposed to the host tool. Termination is not a
/// method here: the host signals the process and the shared cancel flag
/// stops the capture loop.
pub trait ExtcapInterface {
    fn value(&self) -> &'static str;
    fn display(&self) -> &'static str;
    fn dlts_dialogue(&self) -> Vec<String>;
    fn config_dialogue(&self) -> Vec<String>;
    fn capture(&self, args: &ExtcapArgs, cancel: Arc<AtomicBool>) -> Result<(), CaptureError>;
}

pub fn interfaces() -> Vec<Box<dyn ExtcapInterface>> {
    vec![Box::new(CapturinoInterface), Box::new(CapturinoTestInterface)]
}

/// Dispatch one extcap invocation.
pub fn run(args: &ExtcapArgs, cancel: Arc<AtomicBool>) -> Result<(), CaptureError> {
    if args.extcap_interfaces {
        println!(
            "extcap {{version={}}}{{help=no online help available}}",
            env!("CARGO_PKG_VERSION")
        );
        for intfc in interfaces() {
            println!(
                "interface {{value={}}}{{display={}}}",
                intfc.value(),
                intfc.display()
            );
        }
        return Ok(());
    }

    let name = args
        .extcap_interface
        .as_deref()
        .ok_or_else(|| CaptureError::configuration("no --extcap-interface given"))?;
    let intfc = interfaces()
        .into_iter()
        .find(|i| i.value() == name)
        .ok_or_else(|| CaptureError::configuration(format!("unknown interface '{}'", name)))?;

    if args.extcap_dlts {
        for line in intfc.dlts_dialogue() {
            println!("{}", line);
        }
        Ok(())
    } else if args.extcap_config {
        for line in intfc.config_dialogue() {
            println!("{}", line);
        }
        Ok(())
    } else if args.capture {
        intfc.capture(args, cancel)
    } else {
        Err(CaptureError::configuration("no extcap command given"))
    }
}

// ============================================================================
// Primary interface
// ============================================================================

pub struct CapturinoInterface;

impl ExtcapInterface for CapturinoInterface {
    fn value(&self) -> &'static str {
        "capturino"
    }

    fn display(&self) -> &'static str {
        "CAPTURino interface"
    }

    fn dlts_dialogue(&self) -> Vec<String> {
        vec![
            dlt_line(LinkType::UartRaw, "UART"),
            dlt_line(LinkType::Can, "CAN"),
        ]
    }

    fn config_dialogue(&self) -> Vec<String> {
        vec![
            "arg {number=0}{call=--port}{display=Serial port}\
             {tooltip=Serial port the CAPTURino device is attached to}\
             {type=string}{required=true}"
                .to_string(),
            "arg {number=1}{call=--dlts}{display=Link type}\
             {tooltip=Protocol captured on the tapped line}{type=selector}"
                .to_string(),
            format!(
                "value {{arg=1}}{{value={}}}{{display={}}}{{default=true}}",
                LinkType::UartRaw.dlt(),
                LinkType::UartRaw.display_name()
            ),
            format!(
                "value {{arg=1}}{{value={}}}{{display={}}}",
                LinkType::Can.dlt(),
                LinkType::Can.display_name()
            ),
            "arg {number=2}{call=--serialbaudrate}{display=UART baud rate}\
             {type=integer}{default=115200}{group=UART}"
                .to_string(),
            "arg {number=3}{call=--serialdatabits}{display=UART data bits}\
             {type=integer}{range=5,9}{default=8}{group=UART}"
                .to_string(),
            "arg {number=4}{call=--serialparity}{display=UART parity}\
             {type=selector}{group=UART}"
                .to_string(),
            "value {arg=4}{value=none}{display=None}{default=true}".to_string(),
            "value {arg=4}{value=odd}{display=Odd}".to_string(),
            "value {arg=4}{value=even}{display=Even}".to_string(),
            "arg {number=5}{call=--serialstopbits}{display=UART stop bits}\
             {type=integer}{range=1,2}{default=1}{group=UART}"
                .to_string(),
            "arg {number=6}{call=--serialtimeout}{display=UART frame timeout (ms)}\
             {type=integer}{default=1000}{group=UART}"
                .to_string(),
            "arg {number=7}{call=--canbaudrate}{display=CAN bit rate}\
             {type=integer}{default=500000}{group=CAN}"
                .to_string(),
            "arg {number=8}{call=--cansamplepoint}{display=CAN sample point (per-mille)}\
             {type=integer}{range=500,950}{default=875}{group=CAN}"
                .to_string(),
            "arg {number=9}{call=--logfile}{display=Log file}\
             {type=fileselect}{group=Logging}"
                .to_string(),
            "arg {number=10}{call=--loglevel}{display=Log level}\
             {type=integer}{range=0,5}{default=2}{group=Logging}"
                .to_string(),
        ]
    }

    fn capture(&self, args: &ExtcapArgs, cancel: Arc<AtomicBool>) -> Result<(), CaptureError> {
        let link_type = LinkType::from_dlt(args.dlts.unwrap_or(148)).ok_or_else(|| {
            CaptureError::configuration(format!(
                "unsupported link type {}",
                args.dlts.unwrap_or(148)
            ))
        })?;
        if link_type == LinkType::DebugLog {
            return Err(CaptureError::configuration(
                "the debug link type is served by the test interface",
            ));
        }

        let mut cfg = capture_config_from_args(args, link_type)?;
        cfg.open_retry = OpenRetry::FailFast;
        start_capture(&cfg, args, cancel)
    }
}

// ============================================================================
// Diagnostic interface
// ============================================================================

pub struct CapturinoTestInterface;

impl ExtcapInterface for CapturinoTestInterface {
    fn value(&self) -> &'static str {
        "capturino-test"
    }

    fn display(&self) -> &'static str {
        "CAPTURino test interface"
    }

    fn dlts_dialogue(&self) -> Vec<String> {
        vec![dlt_line(LinkType::DebugLog, "DEBUG")]
    }

    fn config_dialogue(&self) -> Vec<String> {
        vec![
            "arg {number=0}{call=--port}{display=Serial port}\
             {tooltip=Serial port the CAPTURino device is attached to}\
             {type=string}{required=true}"
                .to_string(),
            "arg {number=1}{call=--logfile}{display=Log file}\
             {type=fileselect}{group=Logging}"
                .to_string(),
            "arg {number=2}{call=--loglevel}{display=Log level}\
             {type=integer}{range=0,5}{default=2}{group=Logging}"
                .to_string(),
        ]
    }

    fn capture(&self, args: &ExtcapArgs, cancel: Arc<AtomicBool>) -> Result<(), CaptureError> {
        let mut cfg = capture_config_from_args(args, LinkType::DebugLog)?;
        // The diagnostic capture keeps retrying so the device can be plugged
        // in after the capture already started.
        cfg.open_retry = OpenRetry::Forever { backoff_ms: 5_000 };
        start_capture(&cfg, args, cancel)
    }
}

// ============================================================================
// Shared capture plumbing
// ============================================================================

/// The short `name` token must not contain spaces; the display string may.
fn dlt_line(link_type: LinkType, name: &str) -> String {
    format!(
        "dlt {{number={}}}{{name={}}}{{display={}}}",
        link_type.dlt(),
        name,
        link_type.display_name()
    )
}

fn capture_config_from_args(
    args: &ExtcapArgs,
    link_type: LinkType,
) -> Result<CaptureConfig, CaptureError> {
    let port = args
        .port
        .as_deref()
        .ok_or_else(|| CaptureError::configuration("--port is required for capture"))?;

    let mut cfg = CaptureConfig::new(port, link_type);
    cfg.serial = SerialParams {
        baud_rate: args.serialbaudrate,
        data_bits: args.serialdatabits,
        parity: args.serialparity.clone(),
        stop_bits: args.serialstopbits,
        timeout_ms: args.serialtimeout,
    };
    cfg.can = CanParams {
        bitrate: args.canbaudrate,
        sample_point: args.cansamplepoint,
    };
    Ok(cfg)
}

fn start_capture(
    cfg: &CaptureConfig,
    args: &ExtcapArgs,
    cancel: Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    let fifo = args
        .fifo
        .as_ref()
        .ok_or_else(|| CaptureError::configuration("--fifo is required for capture"))?;
    let sink = std::fs::OpenOptions::new().write(true).open(fifo)?;

    tlog!(
        crate::logging::Severity::Info,
        "extcap",
        "starting capture on {} (link type {}) to {}",
        cfg.port,
        cfg.link_type.dlt(),
        fifo.display()
    );

    if args.threaded_writer {
        let writer = ThreadedWriter::new(sink, PIPE_BUFFER_BYTES);
        capture::run_capture(cfg, writer, cancel)
    } else {
        capture::run_capture(cfg, sink, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_both_interfaces() {
        let names: Vec<&str> = interfaces().iter().map(|i| i.value()).collect();
        assert_eq!(names, vec!["capturino", "capturino-test"]);
    }

    #[test]
    fn primary_dlts_dialogue() {
        let lines = CapturinoInterface.dlts_dialogue();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("{number=148}"));
        assert!(lines[1].contains("{number=227}"));
    }

    #[test]
    fn test_interface_serves_the_debug_dlt() {
        let lines = CapturinoTestInterface.dlts_dialogue();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("{number=147}"));
    }

    #[test]
    fn config_dialogue_offers_port_and_link_selector() {
        let lines = CapturinoInterface.config_dialogue();
        assert!(lines.iter().any(|l| l.contains("{call=--port}")));
        assert!(lines.iter().any(|l| l.contains("{call=--dlts}")));
        assert!(lines.iter().any(|l| l.contains("{value=148}")));
        assert!(lines.iter().any(|l| l.contains("{value=227}")));
    }

    #[test]
    fn args_parse_a_capture_invocation() {
        let args = ExtcapArgs::parse_from([
            "capturino-extcap",
            "--extcap-interface",
            "capturino",
            "--capture",
            "--fifo",
            "/tmp/fifo",
            "--port",
            "/dev/ttyACM0",
            "--dlts",
            "227",
            "--canbaudrate",
            "250000",
        ]);
        assert!(args.capture);
        assert_eq!(args.extcap_interface.as_deref(), Some("capturino"));
        assert_eq!(args.dlts, Some(227));
        assert_eq!(args.canbaudrate, 250_000);
        // Defaults fill the rest.
        assert_eq!(args.serialbaudrate, 115_200);
        assert_eq!(args.cansamplepoint, 875);
    }

    #[test]
    fn capture_without_port_is_a_configuration_error() {
        let args = ExtcapArgs::parse_from([
            "capturino-extcap",
            "--extcap-interface",
            "capturino",
            "--capture",
            "--fifo",
            "/tmp/fifo",
        ]);
        let cancel = Arc::new(AtomicBool::new(false));
        let err = CapturinoInterface.capture(&args, cancel).unwrap_err();
        assert!(matches!(err, CaptureError::Configuration(_)));
    }
}
