// src/pcap.rs
//
// Classic pcap encoder: one 24-byte global header, then 16-byte-header
// records. Every record is assembled into a single buffer and handed to the
// sink in one write call so record boundaries survive the threaded pipe
// writer.

use std::io::Write;

use crate::error::CaptureError;
use crate::io::LinkType;

/// Magic number for microsecond-resolution timestamps.
pub const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
/// Magic number for nanosecond-resolution timestamps.
pub const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

pub struct PcapWriter<W: Write> {
    sink: W,
    /// Snapshot length, set by write_global_header and applied to every
    /// subsequent record.
    snap_len: u32,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(sink: W) -> Self {
        PcapWriter { sink, snap_len: 0 }
    }

    /// Emit the 24-byte global header. `p_flag` and `r_flag` are the
    /// single-bit fields of the packed link-type word, `fcs_len` its 4-bit
    /// FCS length.
    pub fn write_global_header(
        &mut self,
        nanos: bool,
        snap_len: u32,
        link_type: LinkType,
        p_flag: u8,
        r_flag: u8,
        fcs_len: u8,
    ) -> Result<(), CaptureError> {
        self.snap_len = snap_len;

        let magic = if nanos { MAGIC_NANOS } else { MAGIC_MICROS };
        let packed = ((fcs_len as u32 & 0xF) << 28)
            | ((r_flag as u32 & 0x1) << 27)
            | ((p_flag as u32 & 0x1) << 26)
            | (link_type.dlt() & 0xFFFF);

        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&magic.to_le_bytes());
        header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        // Bytes 8..16 are the reserved thiszone/sigfigs words, kept zero.
        header[16..20].copy_from_slice(&snap_len.to_le_bytes());
        header[20..24].copy_from_slice(&packed.to_le_bytes());

        self.sink.write_all(&header)?;
        Ok(())
    }

    /// Emit one record. The body is truncated to the snapshot length;
    /// `orig_len` still reports the untruncated size.
    pub fn write_record(
        &mut self,
        ts_seconds: u32,
        ts_subseconds: u32,
        orig_len: u32,
        body: &[u8],
    ) -> Result<(), CaptureError> {
        let captured = std::cmp::min(orig_len, self.snap_len).min(body.len() as u32);

        let mut record = Vec::with_capacity(16 + captured as usize);
        record.extend_from_slice(&ts_seconds.to_le_bytes());
        record.extend_from_slice(&ts_subseconds.to_le_bytes());
        record.extend_from_slice(&captured.to_le_bytes());
        record.extend_from_slice(&orig_len.to_le_bytes());
        record.extend_from_slice(&body[..captured as usize]);

        self.sink.write_all(&record)?;
        Ok(())
    }

    /// Flush the sink; called once per session on teardown.
    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_header_layout() {
        let mut writer = PcapWriter::new(Vec::new());
        writer
            .write_global_header(false, 512, LinkType::Can, 0, 0, 0)
            .unwrap();
        let buf = writer.into_inner();

        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..4], &MAGIC_MICROS.to_le_bytes());
        assert_eq!(&buf[4..8], &[0x02, 0x00, 0x04, 0x00]);
        assert_eq!(&buf[8..16], &[0u8; 8]);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), 512);
        // Link type 227 in the low 16 bits, flag/FCS bits all zero.
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 227);
    }

    #[test]
    fn nanos_magic_and_packed_flags() {
        let mut writer = PcapWriter::new(Vec::new());
        writer
            .write_global_header(true, 64, LinkType::UartRaw, 1, 1, 4)
            .unwrap();
        let buf = writer.into_inner();

        assert_eq!(&buf[0..4], &MAGIC_NANOS.to_le_bytes());
        let packed = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        assert_eq!(packed & 0xFFFF, 148);
        assert_eq!((packed >> 26) & 1, 1); // p flag
        assert_eq!((packed >> 27) & 1, 1); // r flag
        assert_eq!((packed >> 28) & 0xF, 4); // fcs length
    }

    #[test]
    fn record_truncates_to_snap_length() {
        let mut writer = PcapWriter::new(Vec::new());
        writer
            .write_global_header(false, 4, LinkType::UartRaw, 0, 0, 0)
            .unwrap();
        writer
            .write_record(10, 20, 6, &[1, 2, 3, 4, 5, 6])
            .unwrap();
        let buf = writer.into_inner();

        let record = &buf[24..];
        assert_eq!(record.len(), 16 + 4);
        assert_eq!(u32::from_le_bytes(record[0..4].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(record[4..8].try_into().unwrap()), 20);
        assert_eq!(u32::from_le_bytes(record[8..12].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(record[12..16].try_into().unwrap()), 6);
        assert_eq!(&record[16..], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_body_is_not_padded() {
        let mut writer = PcapWriter::new(Vec::new());
        writer
            .write_global_header(false, 512, LinkType::UartRaw, 0, 0, 0)
            .unwrap();
        writer.write_record(0, 0, 3, &[0xAA, 0xBB, 0xCC]).unwrap();
        let buf = writer.into_inner();
        assert_eq!(buf.len(), 24 + 16 + 3);
    }
}
