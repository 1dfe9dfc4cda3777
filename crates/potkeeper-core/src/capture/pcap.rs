//! Classic libpcap file format.
//!
//! Writing always produces microsecond-resolution, native little-endian
//! files. Reading accepts both byte orders and the nanosecond variant, which
//! is what capture backends may emit on their stdout.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CaptureError;

pub const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
pub const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Records larger than this are treated as stream corruption.
const MAX_RECORD_LEN: u32 = 256 * 1024;

/// One captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub ts_sec: u32,
    pub ts_usec: u32,
    /// Length on the wire; `data` may be shorter when truncated to the snap length
    pub orig_len: u32,
    pub data: Vec<u8>,
}

/// Global header for a new capture file.
#[must_use]
pub fn global_header(snap_len: u32, link_type: u32) -> [u8; GLOBAL_HEADER_LEN] {
    let mut header = [0u8; GLOBAL_HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC_MICROS.to_le_bytes());
    header[4..6].copy_from_slice(&2u16.to_le_bytes());
    header[6..8].copy_from_slice(&4u16.to_le_bytes());
    // thiszone and sigfigs stay zero
    header[16..20].copy_from_slice(&snap_len.to_le_bytes());
    header[20..24].copy_from_slice(&link_type.to_le_bytes());
    header
}

/// Record header for `packet`, with the captured length clamped to `snap_len`.
#[must_use]
pub fn record_header(packet: &CapturedPacket, snap_len: u32) -> [u8; RECORD_HEADER_LEN] {
    let incl_len = (packet.data.len() as u32).min(snap_len);
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0..4].copy_from_slice(&packet.ts_sec.to_le_bytes());
    header[4..8].copy_from_slice(&packet.ts_usec.to_le_bytes());
    header[8..12].copy_from_slice(&incl_len.to_le_bytes());
    header[12..16].copy_from_slice(&packet.orig_len.max(incl_len).to_le_bytes());
    header
}

/// Header fields needed to decode the rest of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub big_endian: bool,
    pub nanos: bool,
    pub snap_len: u32,
    pub link_type: u32,
}

impl StreamHeader {
    fn u32_at(self, bytes: &[u8], at: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[at..at + 4]);
        if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }
}

/// Parse a 24-byte global header.
pub fn parse_global_header(bytes: &[u8; GLOBAL_HEADER_LEN]) -> Result<StreamHeader, CaptureError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    let (big_endian, nanos) = match (u32::from_le_bytes(magic), u32::from_be_bytes(magic)) {
        (MAGIC_MICROS, _) => (false, false),
        (MAGIC_NANOS, _) => (false, true),
        (_, MAGIC_MICROS) => (true, false),
        (_, MAGIC_NANOS) => (true, true),
        _ => {
            return Err(CaptureError::MalformedStream(format!(
                "bad magic {:02x?}",
                magic
            )));
        }
    };
    let mut header = StreamHeader {
        big_endian,
        nanos,
        snap_len: 0,
        link_type: 0,
    };
    header.snap_len = header.u32_at(bytes, 16);
    header.link_type = header.u32_at(bytes, 20);
    Ok(header)
}

/// Incremental pcap reader over any async byte stream
pub struct PcapReader<R> {
    inner: R,
    header: StreamHeader,
}

impl<R: AsyncRead + Unpin> PcapReader<R> {
    /// Read the global header. Fails if the stream ends before it.
    pub async fn open(mut inner: R) -> Result<Self, CaptureError> {
        let mut raw = [0u8; GLOBAL_HEADER_LEN];
        inner.read_exact(&mut raw).await.map_err(|e| {
            CaptureError::MalformedStream(format!("missing global header: {e}"))
        })?;
        let header = parse_global_header(&raw)?;
        Ok(Self { inner, header })
    }

    #[must_use]
    pub fn header(&self) -> StreamHeader {
        self.header
    }

    /// Next packet, or `None` at a clean end of stream.
    ///
    /// Not cancel-safe: a partially read record is lost if the future is
    /// dropped.
    pub async fn next_packet(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        let mut filled = 0;
        while filled < RECORD_HEADER_LEN {
            let n = self
                .inner
                .read(&mut raw[filled..])
                .await
                .map_err(|e| CaptureError::MalformedStream(e.to_string()))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(CaptureError::MalformedStream(
                    "stream ended inside a record header".to_string(),
                ));
            }
            filled += n;
        }

        let ts_sec = self.header.u32_at(&raw, 0);
        let frac = self.header.u32_at(&raw, 4);
        let incl_len = self.header.u32_at(&raw, 8);
        let orig_len = self.header.u32_at(&raw, 12);
        if incl_len > MAX_RECORD_LEN {
            return Err(CaptureError::MalformedStream(format!(
                "record length {incl_len} exceeds limit"
            )));
        }

        let mut data = vec![0u8; incl_len as usize];
        self.inner
            .read_exact(&mut data)
            .await
            .map_err(|e| CaptureError::MalformedStream(format!("truncated record: {e}")))?;

        Ok(Some(CapturedPacket {
            ts_sec,
            ts_usec: if self.header.nanos { frac / 1000 } else { frac },
            orig_len,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize) -> CapturedPacket {
        CapturedPacket {
            ts_sec: 1_700_000_000,
            ts_usec: 123_456,
            orig_len: len as u32,
            data: (0..len).map(|i| i as u8).collect(),
        }
    }

    fn file_with(packets: &[CapturedPacket], snap_len: u32) -> Vec<u8> {
        let mut out = global_header(snap_len, LINKTYPE_ETHERNET).to_vec();
        for p in packets {
            out.extend_from_slice(&record_header(p, snap_len));
            let incl = p.data.len().min(snap_len as usize);
            out.extend_from_slice(&p.data[..incl]);
        }
        out
    }

    #[test]
    fn global_header_layout() {
        let header = global_header(1024, LINKTYPE_ETHERNET);
        assert_eq!(&header[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(u16::from_le_bytes([header[4], header[5]]), 2);
        assert_eq!(u16::from_le_bytes([header[6], header[7]]), 4);
        let parsed = parse_global_header(&header).unwrap();
        assert!(!parsed.big_endian);
        assert!(!parsed.nanos);
        assert_eq!(parsed.snap_len, 1024);
        assert_eq!(parsed.link_type, LINKTYPE_ETHERNET);
    }

    #[test]
    fn record_header_clamps_to_snap_len() {
        let p = packet(1500);
        let header = record_header(&p, 1024);
        assert_eq!(u32::from_le_bytes(header[8..12].try_into().unwrap()), 1024);
        assert_eq!(u32::from_le_bytes(header[12..16].try_into().unwrap()), 1500);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut header = global_header(64, 1);
        header[0] = 0;
        assert!(parse_global_header(&header).is_err());
    }

    #[test]
    fn big_endian_nanosecond_header() {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC_NANOS.to_be_bytes());
        header[16..20].copy_from_slice(&262_144u32.to_be_bytes());
        header[20..24].copy_from_slice(&1u32.to_be_bytes());
        let parsed = parse_global_header(&header).unwrap();
        assert!(parsed.big_endian);
        assert!(parsed.nanos);
        assert_eq!(parsed.snap_len, 262_144);
    }

    #[tokio::test]
    async fn reads_back_written_records() {
        let packets = vec![packet(60), packet(2000), packet(0)];
        let bytes = file_with(&packets, 1024);
        let mut reader = PcapReader::open(&bytes[..]).await.unwrap();
        assert_eq!(reader.header().snap_len, 1024);

        let first = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(first, packets[0]);
        let second = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(second.data.len(), 1024);
        assert_eq!(second.orig_len, 2000);
        let third = reader.next_packet().await.unwrap().unwrap();
        assert!(third.data.is_empty());
        assert!(reader.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nanosecond_timestamps_are_scaled() {
        let mut bytes = global_header(128, 1).to_vec();
        bytes[0..4].copy_from_slice(&MAGIC_NANOS.to_le_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&999_999_999u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0xff);
        let mut reader = PcapReader::open(&bytes[..]).await.unwrap();
        let p = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(p.ts_sec, 5);
        assert_eq!(p.ts_usec, 999_999);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let mut bytes = file_with(&[packet(40)], 1024);
        bytes.truncate(bytes.len() - 3);
        let mut reader = PcapReader::open(&bytes[..]).await.unwrap();
        assert!(reader.next_packet().await.is_err());
    }

    #[tokio::test]
    async fn empty_stream_has_no_header() {
        let empty: &[u8] = &[];
        assert!(PcapReader::open(empty).await.is_err());
    }
}
