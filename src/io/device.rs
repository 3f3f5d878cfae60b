// src/io/device.rs
//
// Command/response session with a CAPTURino device. Commands are
// newline-terminated ASCII; the device echoes every command, answers with a
// structured text reply and terminates each reply with its prompt string.
// All waits are deadline-bounded poll loops so the cancel flag stays live.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serialport::ClearBuffer;

use crate::clock::{deadline_reached, now_ms};
use crate::error::CaptureError;

// ============================================================================
// Protocol constants
// ============================================================================

/// Prompt string terminating every command response.
pub const PROMPT: &[u8] = b"CAPTURino>";
/// Interrupt/stop control byte.
pub const INTERRUPT: u8 = 0x03;
/// Acknowledgement byte sent after a capture command is accepted.
pub const ACK: u8 = 0x06;

const CMD_BOARD_ID: &[u8] = b"idfcn\n";
const CMD_BOARD_MICROS: &[u8] = b"time\n";
const CMD_DLTS: &[u8] = b"dlts\n";

/// Responses carry two header characters (CR LF) before the payload text.
const RESPONSE_HEADER_LEN: usize = 2;
/// Hard cap on accumulated response bytes; a reply this long means the
/// terminator was missed.
const RESPONSE_LIMIT: usize = 512;
const RESPONSE_POLL_MS: u64 = 5;
const READ_CHUNK: usize = 64;

// ============================================================================
// Serial link seam
// ============================================================================

/// Minimal serial transport the session needs. The real implementation wraps
/// the serialport crate; tests substitute a scripted mock.
pub trait SerialLink: Send {
    /// Non-blocking-style read: returns 0 when no data is pending.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError>;
    fn write_all(&mut self, buf: &[u8]) -> Result<(), CaptureError>;
    fn flush_input(&mut self) -> Result<(), CaptureError>;
}

pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
    device: String,
}

impl SerialPortLink {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, CaptureError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| CaptureError::connection(path, format!("failed to open: {}", e)))?;
        tlog!(
            crate::logging::Severity::Debug,
            "device",
            "opened {} at {} baud",
            path,
            baud_rate
        );
        Ok(SerialPortLink {
            port,
            device: path.to_string(),
        })
    }
}

impl SerialLink for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(CaptureError::connection(
                &self.device,
                format!("read failed: {}", e),
            )),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), CaptureError> {
        self.port
            .write_all(buf)
            .map_err(|e| CaptureError::connection(&self.device, format!("write failed: {}", e)))
    }

    fn flush_input(&mut self) -> Result<(), CaptureError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| CaptureError::connection(&self.device, format!("flush failed: {}", e)))
    }
}

// ============================================================================
// Session
// ============================================================================

/// Only one session may exist per process; the device cannot multiplex.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Serializes tests that construct sessions, since the single-session guard
/// is process-wide.
#[cfg(test)]
pub(crate) static TEST_SESSION_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub struct DeviceSession<L: SerialLink> {
    link: L,
    device: String,
    cancel: Arc<AtomicBool>,
}

impl DeviceSession<SerialPortLink> {
    pub fn open(
        path: &str,
        baud_rate: u32,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, CaptureError> {
        let link = SerialPortLink::open(path, baud_rate)?;
        DeviceSession::new(link, path, cancel)
    }
}

impl<L: SerialLink> DeviceSession<L> {
    pub fn new(link: L, device: &str, cancel: Arc<AtomicBool>) -> Result<Self, CaptureError> {
        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::configuration(
                "another device session is already open",
            ));
        }
        Ok(DeviceSession {
            link,
            device: device.to_string(),
            cancel,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Interrupt whatever the device is doing and wait for its prompt.
    /// Half the budget per attempt; one retry on timeout.
    pub fn initiate(&mut self, timeout_ms: u32) -> Result<(), CaptureError> {
        match self.request_prompt(timeout_ms / 2) {
            Err(e) if e.is_timeout() => {
                tlog!(
                    crate::logging::Severity::Warning,
                    "device",
                    "{}: no prompt after interrupt, retrying",
                    self.device
                );
                self.request_prompt(timeout_ms / 2)
            }
            other => other,
        }
    }

    fn request_prompt(&mut self, budget_ms: u32) -> Result<(), CaptureError> {
        self.link.flush_input()?;
        self.link.write_all(&[INTERRUPT])?;
        self.collect_until(PROMPT, budget_ms).map(|_| ())
    }

    /// Send a command and verify the device echoes it (minus the trailing
    /// newline). An echo mismatch means we are not talking to a capture
    /// firmware in command mode.
    pub fn exec(&mut self, cmd: &[u8], timeout_ms: u32) -> Result<(), CaptureError> {
        self.link.flush_input()?;
        self.link.write_all(cmd)?;

        let expected = &cmd[..cmd.len().saturating_sub(1)];
        let echo = self.collect_exact(expected.len(), timeout_ms)?;
        if echo != expected {
            return Err(CaptureError::protocol(
                &self.device,
                format!(
                    "echo mismatch: sent {} received {}",
                    hex::encode(expected),
                    hex::encode(&echo)
                ),
            ));
        }
        Ok(())
    }

    /// `exec`, then accumulate the reply until `terminator` appears as a
    /// suffix. The echo phase spends part of the budget; the reply phase
    /// gets the remainder.
    pub fn exec_with_response(
        &mut self,
        cmd: &[u8],
        timeout_ms: u32,
        terminator: &[u8],
    ) -> Result<Vec<u8>, CaptureError> {
        let start = now_ms();
        self.exec(cmd, timeout_ms)?;
        let elapsed = now_ms().wrapping_sub(start);
        let remaining = timeout_ms.saturating_sub(elapsed);
        self.collect_until(terminator, remaining)
    }

    /// `idfcn` reply: two header characters, then eight hex digits.
    pub fn board_id(&mut self, timeout_ms: u32) -> Result<u32, CaptureError> {
        let resp = self.exec_with_response(CMD_BOARD_ID, timeout_ms, PROMPT)?;
        if resp.len() < RESPONSE_HEADER_LEN + 8 {
            return Err(self.parse_error("board id reply too short", &resp));
        }
        let digits = &resp[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + 8];
        let text = std::str::from_utf8(digits)
            .map_err(|_| self.parse_error("board id is not ASCII hex", &resp))?;
        u32::from_str_radix(text, 16)
            .map_err(|_| self.parse_error("board id is not ASCII hex", &resp))
    }

    /// `time` reply: two header characters, then a decimal microsecond count.
    pub fn board_micros(&mut self, timeout_ms: u32) -> Result<u32, CaptureError> {
        let resp = self.exec_with_response(CMD_BOARD_MICROS, timeout_ms, PROMPT)?;
        let body = resp.get(RESPONSE_HEADER_LEN..).unwrap_or(&[]);
        let digits: Vec<u8> = body
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .copied()
            .collect();
        if digits.is_empty() {
            return Err(self.parse_error("no digits in time reply", &resp));
        }
        let text = std::str::from_utf8(&digits)
            .map_err(|_| self.parse_error("time reply is not ASCII", &resp))?;
        text.parse::<u32>()
            .map_err(|_| self.parse_error("microsecond count out of range", &resp))
    }

    /// `dlts` reply: newline-separated decimal link-type values. A line that
    /// fails to parse is skipped with a warning; an empty result is an error.
    pub fn supported_dlts(&mut self, timeout_ms: u32) -> Result<Vec<u32>, CaptureError> {
        let resp = self.exec_with_response(CMD_DLTS, timeout_ms, PROMPT)?;
        let body = &resp[..resp.len() - PROMPT.len()];

        let mut dlts = Vec::new();
        for line in body.split(|b| *b == b'\n') {
            let line: Vec<u8> = line
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            if line.is_empty() {
                continue;
            }
            match std::str::from_utf8(&line).ok().and_then(|s| s.parse::<u32>().ok()) {
                Some(v) => dlts.push(v),
                None => {
                    tlog!(
                        crate::logging::Severity::Warning,
                        "device",
                        "{}: skipping unparseable dlts line: {}",
                        self.device,
                        hex::encode(&line)
                    );
                }
            }
        }
        if dlts.is_empty() {
            return Err(self.parse_error("dlts reply contained no link types", &resp));
        }
        Ok(dlts)
    }

    /// Wait for the single ACK byte the device emits after accepting a
    /// capture command. CR/LF noise between echo and ACK is skipped.
    pub fn await_capture_ack(&mut self, timeout_ms: u32) -> Result<(), CaptureError> {
        let start = now_ms();
        let mut byte = [0u8; 1];
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(CaptureError::Cancelled);
            }
            if deadline_reached(start, timeout_ms, now_ms()) {
                return Err(CaptureError::Timeout(timeout_ms));
            }
            let n = self.link.read(&mut byte)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(RESPONSE_POLL_MS));
                continue;
            }
            match byte[0] {
                ACK => return Ok(()),
                b'\r' | b'\n' => continue,
                // 'R' starts the "Ready" banner of the interactive console
                // firmware, which cannot stream captures.
                b'R' => {
                    return Err(CaptureError::protocol(
                        &self.device,
                        "device answered like an interactive console; \
                         its firmware supports human CLI use only, not capture streaming",
                    ))
                }
                other => {
                    return Err(CaptureError::protocol(
                        &self.device,
                        format!("unexpected byte 0x{:02X} instead of capture ACK", other),
                    ))
                }
            }
        }
    }

    /// Non-blocking read used by the capture loop.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        self.link.read(buf)
    }

    /// Best-effort stop: interrupt byte with a short budget, errors ignored
    /// by callers on teardown paths.
    pub fn stop_capture(&mut self, timeout_ms: u32) -> Result<(), CaptureError> {
        self.exec(&[INTERRUPT], timeout_ms)
    }

    fn parse_error(&self, what: &str, raw: &[u8]) -> CaptureError {
        CaptureError::protocol(
            &self.device,
            format!("{} (raw bytes: {})", what, hex::encode(raw)),
        )
    }

    fn collect_exact(&mut self, want: usize, budget_ms: u32) -> Result<Vec<u8>, CaptureError> {
        let start = now_ms();
        let mut acc = vec![0u8; want];
        let mut got = 0;
        while got < want {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(CaptureError::Cancelled);
            }
            if deadline_reached(start, budget_ms, now_ms()) {
                return Err(CaptureError::Timeout(budget_ms));
            }
            let n = self.link.read(&mut acc[got..])?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(RESPONSE_POLL_MS));
            } else {
                got += n;
            }
        }
        Ok(acc)
    }

    fn collect_until(
        &mut self,
        terminator: &[u8],
        budget_ms: u32,
    ) -> Result<Vec<u8>, CaptureError> {
        let start = now_ms();
        let mut acc = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(CaptureError::Cancelled);
            }
            if deadline_reached(start, budget_ms, now_ms()) {
                return Err(CaptureError::Timeout(budget_ms));
            }
            let n = self.link.read(&mut chunk)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(RESPONSE_POLL_MS));
                continue;
            }
            acc.extend_from_slice(&chunk[..n]);
            if acc.len() > RESPONSE_LIMIT {
                return Err(self.parse_error("response exceeded limit without terminator", &acc));
            }
            if acc.ends_with(terminator) {
                return Ok(acc);
            }
        }
    }
}

impl<L: SerialLink> Drop for DeviceSession<L> {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use super::TEST_SESSION_LOCK as SESSION_LOCK;

    #[derive(Default)]
    struct MockLink {
        /// Successive chunks handed out by read(); an empty queue reads 0.
        script: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        flushes: usize,
    }

    impl MockLink {
        fn scripted(chunks: &[&[u8]]) -> Self {
            MockLink {
                script: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl SerialLink for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
            match self.script.pop_front() {
                Some(mut chunk) => {
                    let n = std::cmp::min(buf.len(), chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.script.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<(), CaptureError> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        fn flush_input(&mut self) -> Result<(), CaptureError> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn session(link: MockLink) -> DeviceSession<MockLink> {
        let cancel = Arc::new(AtomicBool::new(false));
        DeviceSession::new(link, "mock", cancel).unwrap()
    }

    #[test]
    fn initiate_finds_prompt() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"\r\nCAPTU", b"Rino>"]);
        let mut s = session(link);
        s.initiate(100).unwrap();
        assert_eq!(s.link.written, vec![INTERRUPT]);
        assert_eq!(s.link.flushes, 1);
    }

    #[test]
    fn initiate_retries_once_then_times_out() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[]);
        let mut s = session(link);
        let err = s.initiate(60).unwrap_err();
        assert!(err.is_timeout());
        // One interrupt byte per attempt.
        assert_eq!(s.link.written, vec![INTERRUPT, INTERRUPT]);
        assert_eq!(s.link.flushes, 2);
    }

    #[test]
    fn exec_accepts_matching_echo() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"time"]);
        let mut s = session(link);
        s.exec(b"time\n", 100).unwrap();
        assert_eq!(s.link.written, b"time\n".to_vec());
    }

    #[test]
    fn exec_rejects_echo_mismatch() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"tXme"]);
        let mut s = session(link);
        let err = s.exec(b"time\n", 100).unwrap_err();
        assert!(matches!(err, CaptureError::Protocol { .. }));
    }

    #[test]
    fn board_id_parses_hex_after_header() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"idfcn", b"\r\n80000001\r\nCAPTURino>"]);
        let mut s = session(link);
        assert_eq!(s.board_id(100).unwrap(), 0x8000_0001);
    }

    #[test]
    fn board_micros_parses_decimal() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"time", b"\r\n123456\r\nCAPTURino>"]);
        let mut s = session(link);
        assert_eq!(s.board_micros(100).unwrap(), 123_456);
    }

    #[test]
    fn dlts_skips_bad_lines() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"dlts", b"\r\n148\nxyz\n227\nCAPTURino>"]);
        let mut s = session(link);
        assert_eq!(s.supported_dlts(100).unwrap(), vec![148, 227]);
    }

    #[test]
    fn dlts_all_bad_is_an_error() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"dlts", b"\r\nxyz\nCAPTURino>"]);
        let mut s = session(link);
        assert!(matches!(
            s.supported_dlts(100).unwrap_err(),
            CaptureError::Protocol { .. }
        ));
    }

    #[test]
    fn ack_skips_line_noise() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"\r\n", &[ACK]]);
        let mut s = session(link);
        s.await_capture_ack(100).unwrap();
    }

    #[test]
    fn ack_rejects_console_banner() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let link = MockLink::scripted(&[b"Ready"]);
        let mut s = session(link);
        assert!(matches!(
            s.await_capture_ack(100).unwrap_err(),
            CaptureError::Protocol { .. }
        ));
    }

    #[test]
    fn second_session_is_rejected_while_first_lives() {
        let _guard = SESSION_LOCK.lock().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let first = DeviceSession::new(MockLink::default(), "a", cancel.clone()).unwrap();
        let second = DeviceSession::new(MockLink::default(), "b", cancel.clone());
        assert!(second.is_err());
        drop(first);
        assert!(DeviceSession::new(MockLink::default(), "c", cancel).is_ok());
    }
}
