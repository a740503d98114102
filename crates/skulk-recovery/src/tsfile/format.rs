//! Byte layout of Skulk data files.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (8 bytes)                                       │
//! │  - Magic: "SKTF" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Records (repeated, each starts with a marker byte)          │
//! │  - 0x01 chunk group: len u32, body, crc32                    │
//! │  - 0x02 version watermark: version u64, crc32                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (sealed files only)                                  │
//! │  - 0x03, len u32, body, crc32, len u32, tail magic "FTKS"    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every record describes its own length, so a reader can tell a complete
//! record from a torn one without looking at the values inside.

use crate::error::{Result, TsFileError};
use crate::tsfile::{Chunk, ChunkGroup, DeviceId, TimeRange};
use std::io::{Read, Write};

/// Magic bytes for the data file header: "SKTF"
pub const FILE_MAGIC: [u8; 4] = *b"SKTF";

/// Magic bytes closing a sealed file: "FTKS"
pub const TAIL_MAGIC: [u8; 4] = *b"FTKS";

/// Current data file format version.
pub const FILE_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Extension used for data files.
pub const DATA_FILE_EXTENSION: &str = "tsfile";

/// Marker byte of a chunk group record.
pub const MARKER_CHUNK_GROUP: u8 = 0x01;

/// Marker byte of a version watermark record.
pub const MARKER_VERSION: u8 = 0x02;

/// Marker byte opening the footer.
pub const MARKER_FOOTER: u8 = 0x03;

/// Serialized size of a version watermark record.
pub const VERSION_RECORD_SIZE: usize = 1 + 8 + 4;

/// Bytes following the footer body: crc (4) + repeated length (4) + tail magic (4).
pub const FOOTER_TRAILER_SIZE: usize = 12;

/// Bytes preceding the footer body: marker (1) + length (4).
pub const FOOTER_PREFIX_SIZE: usize = 5;

/// Data file header (8 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic bytes: "SKTF"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
        }
    }
}

impl FileHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        // Reserved (2 bytes)
        writer.write_all(&[0u8; 2])?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidMagic` if the magic bytes don't match and
    /// `TsFileError::UnsupportedVersion` for a newer format.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != FILE_MAGIC {
            return Err(TsFileError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > FILE_VERSION {
            return Err(TsFileError::UnsupportedVersion(version));
        }

        Ok(Self { magic, version })
    }
}

/// Per-device entry stored in the footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    /// Device identifier.
    pub device: DeviceId,
    /// Time range covered by the device in this file.
    pub range: TimeRange,
    /// Number of chunk groups the device has in this file.
    pub chunk_group_count: u32,
}

/// Footer written when a file is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileFooter {
    /// Highest version flushed into the file.
    pub flushed_version: u64,
    /// Offset where the data records end and the footer begins.
    pub data_end: u64,
    /// Device metadata sorted by device.
    pub devices: Vec<DeviceMeta>,
}

impl FileFooter {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flushed_version.to_le_bytes());
        body.extend_from_slice(&self.data_end.to_le_bytes());
        body.extend_from_slice(&checked_len::<u32>(self.devices.len(), "device count")?.to_le_bytes());
        for meta in &self.devices {
            put_str(&mut body, &meta.device)?;
            body.extend_from_slice(&meta.range.start.to_le_bytes());
            body.extend_from_slice(&meta.range.end.to_le_bytes());
            body.extend_from_slice(&meta.chunk_group_count.to_le_bytes());
        }
        Ok(body)
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cursor = SliceReader::new(body);
        let flushed_version = cursor.u64()?;
        let data_end = cursor.u64()?;
        let device_count = cursor.u32()? as usize;
        let mut devices = Vec::with_capacity(device_count.min(4096));
        for _ in 0..device_count {
            let device = cursor.string()?;
            let start = cursor.i64()?;
            let end = cursor.i64()?;
            let chunk_group_count = cursor.u32()?;
            devices.push(DeviceMeta {
                device,
                range: TimeRange::new(start, end),
                chunk_group_count,
            });
        }
        cursor.finish("footer")?;
        Ok(Self {
            flushed_version,
            data_end,
            devices,
        })
    }

    /// Encodes the full footer including marker, checksum and tail magic.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidInput` if a device name or count does
    /// not fit its length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let body_len = checked_len::<u32>(body.len(), "footer body")?;
        let mut bytes = Vec::with_capacity(FOOTER_PREFIX_SIZE + body.len() + FOOTER_TRAILER_SIZE);
        bytes.push(MARKER_FOOTER);
        bytes.extend_from_slice(&body_len.to_le_bytes());
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body_len.to_le_bytes());
        bytes.extend_from_slice(&TAIL_MAGIC);
        Ok(bytes)
    }

    /// Decodes a footer from the complete bytes produced by [`FileFooter::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_PREFIX_SIZE + FOOTER_TRAILER_SIZE {
            return Err(TsFileError::Corrupted("footer too short".to_string()));
        }
        if bytes[0] != MARKER_FOOTER {
            return Err(TsFileError::Corrupted(format!(
                "expected footer marker, got {:#04x}",
                bytes[0]
            )));
        }
        let body_len = le_u32(&bytes[1..5]) as usize;
        if bytes.len() != FOOTER_PREFIX_SIZE + body_len + FOOTER_TRAILER_SIZE {
            return Err(TsFileError::Corrupted("footer length mismatch".to_string()));
        }
        let body = &bytes[FOOTER_PREFIX_SIZE..FOOTER_PREFIX_SIZE + body_len];
        let trailer = &bytes[FOOTER_PREFIX_SIZE + body_len..];

        let expected = le_u32(&trailer[0..4]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TsFileError::ChecksumMismatch { expected, actual });
        }
        if le_u32(&trailer[4..8]) as usize != body_len {
            return Err(TsFileError::Corrupted("footer length mismatch".to_string()));
        }
        let magic = [trailer[8], trailer[9], trailer[10], trailer[11]];
        if magic != TAIL_MAGIC {
            return Err(TsFileError::InvalidMagic(magic));
        }

        Self::decode_body(body)
    }

    /// Total serialized size of a footer whose body is `body_len` bytes.
    pub fn total_size(body_len: usize) -> usize {
        FOOTER_PREFIX_SIZE + body_len + FOOTER_TRAILER_SIZE
    }
}

/// A complete record found between the header and the footer.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Chunks of one device.
    ChunkGroup(ChunkGroup),
    /// Flush watermark: every log entry up to this version is in the file.
    Version(u64),
}

impl Record {
    /// Encodes the record including marker and checksum.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidInput` if a name or count of a chunk
    /// group does not fit its length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Record::ChunkGroup(group) => encode_chunk_group(group),
            Record::Version(version) => {
                let mut bytes = Vec::with_capacity(VERSION_RECORD_SIZE);
                bytes.push(MARKER_VERSION);
                let payload = version.to_le_bytes();
                bytes.extend_from_slice(&payload);
                bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
                Ok(bytes)
            }
        }
    }
}

fn encode_chunk_group(group: &ChunkGroup) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    put_str(&mut body, &group.device)?;
    body.extend_from_slice(&checked_len::<u16>(group.chunks.len(), "chunk count")?.to_le_bytes());
    for chunk in &group.chunks {
        put_str(&mut body, &chunk.measurement)?;
        let range = chunk.time_range().unwrap_or(TimeRange::new(0, 0));
        body.extend_from_slice(&checked_len::<u32>(chunk.points.len(), "point count")?.to_le_bytes());
        body.extend_from_slice(&range.start.to_le_bytes());
        body.extend_from_slice(&range.end.to_le_bytes());
        for (ts, _) in &chunk.points {
            body.extend_from_slice(&ts.to_le_bytes());
        }
        for (_, value) in &chunk.points {
            body.extend_from_slice(&value.to_le_bytes());
        }
    }

    let body_len = checked_len::<u32>(body.len(), "chunk group body")?;
    let mut bytes = Vec::with_capacity(1 + 4 + body.len() + 4);
    bytes.push(MARKER_CHUNK_GROUP);
    bytes.extend_from_slice(&body_len.to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(bytes)
}

/// Decodes a chunk group body (without marker, length and checksum).
pub fn decode_chunk_group(body: &[u8]) -> Result<ChunkGroup> {
    let mut cursor = SliceReader::new(body);
    let device = cursor.string()?;
    let chunk_count = cursor.u16()? as usize;
    let mut chunks = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        let measurement = cursor.string()?;
        let point_count = cursor.u32()? as usize;
        // min/max are derivable from the points and are not trusted here
        let _min_ts = cursor.i64()?;
        let _max_ts = cursor.i64()?;
        if cursor.remaining() < point_count.saturating_mul(16) {
            return Err(TsFileError::Corrupted(format!(
                "chunk {} declares {} points beyond the group body",
                measurement, point_count
            )));
        }
        let mut timestamps = Vec::with_capacity(point_count);
        for _ in 0..point_count {
            timestamps.push(cursor.i64()?);
        }
        let mut points = Vec::with_capacity(point_count);
        for ts in timestamps {
            points.push((ts, cursor.f64()?));
        }
        chunks.push(Chunk {
            measurement,
            points,
        });
    }
    cursor.finish("chunk group")?;
    Ok(ChunkGroup { device, chunks })
}

/// Narrows `len` to the width of its on-disk length field.
pub(crate) fn checked_len<T: TryFrom<usize>>(len: usize, what: &str) -> Result<T> {
    T::try_from(len).map_err(|_| {
        TsFileError::InvalidInput(format!("{} of {} does not fit its length field", what, len))
    })
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    let len = checked_len::<u16>(bytes.len(), "name length")?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Bounds-checked little-endian reader over a byte slice.
pub(crate) struct SliceReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TsFileError::Corrupted(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TsFileError::Corrupted(format!("Invalid UTF-8: {}", e)))
    }

    /// Fails if any bytes are left unread.
    pub(crate) fn finish(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(TsFileError::Corrupted(format!(
                "{} has {} trailing bytes",
                what,
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_group() -> ChunkGroup {
        ChunkGroup::new(
            "root.sg.device99",
            vec![
                Chunk::new("sensor4", vec![(100, 0.0)]),
                Chunk::new("sensor1", vec![(2, 0.0), (3, 1.5)]),
            ],
        )
    }

    #[test]
    fn test_header_size() {
        let mut buf = Vec::new();
        FileHeader::default().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"XXXX");
        let result = FileHeader::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(TsFileError::InvalidMagic(_))));
    }

    #[test]
    fn test_chunk_group_layout() {
        let bytes = Record::ChunkGroup(sample_group()).to_bytes().unwrap();
        assert_eq!(bytes[0], MARKER_CHUNK_GROUP);
        let body_len = le_u32(&bytes[1..5]) as usize;
        assert_eq!(bytes.len(), 1 + 4 + body_len + 4);

        let body = &bytes[5..5 + body_len];
        let crc = le_u32(&bytes[5 + body_len..]);
        assert_eq!(crc, crc32fast::hash(body));
        assert_eq!(decode_chunk_group(body).unwrap(), sample_group());
    }

    #[test]
    fn test_chunk_group_rejects_overlong_point_count() {
        let bytes = Record::ChunkGroup(sample_group()).to_bytes().unwrap();
        let body_len = le_u32(&bytes[1..5]) as usize;
        let mut body = bytes[5..5 + body_len].to_vec();
        // device(2 + 16) + chunk_count(2) + name(2 + 7) -> point_count of the first chunk
        let offset = 2 + "root.sg.device99".len() + 2 + 2 + "sensor4".len();
        body[offset..offset + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            decode_chunk_group(&body),
            Err(TsFileError::Corrupted(_))
        ));
    }

    #[test]
    fn test_version_record_size() {
        assert_eq!(Record::Version(7).to_bytes().unwrap().len(), VERSION_RECORD_SIZE);
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = FileFooter {
            flushed_version: 42,
            data_end: 1234,
            devices: vec![DeviceMeta {
                device: "root.sg.d1".to_string(),
                range: TimeRange::new(0, 9),
                chunk_group_count: 3,
            }],
        };
        let bytes = footer.to_bytes().unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &TAIL_MAGIC);
        assert_eq!(FileFooter::from_bytes(&bytes).unwrap(), footer);
    }

    #[test]
    fn test_footer_corrupted_crc() {
        let mut bytes = FileFooter::default().to_bytes().unwrap();
        bytes[FOOTER_PREFIX_SIZE] ^= 0xFF;
        assert!(matches!(
            FileFooter::from_bytes(&bytes),
            Err(TsFileError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_overlong_names_rejected() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let group = ChunkGroup::new(long.clone(), vec![Chunk::new("s1", vec![(1, 1.0)])]);
        assert!(matches!(
            Record::ChunkGroup(group).to_bytes(),
            Err(TsFileError::InvalidInput(_))
        ));

        let group = ChunkGroup::new("root.sg.d1", vec![Chunk::new(long, vec![(1, 1.0)])]);
        assert!(matches!(
            Record::ChunkGroup(group).to_bytes(),
            Err(TsFileError::InvalidInput(_))
        ));

        // the longest name that fits is still accepted
        let longest = "y".repeat(u16::MAX as usize);
        let group = ChunkGroup::new(longest, vec![Chunk::new("s1", vec![(1, 1.0)])]);
        let bytes = Record::ChunkGroup(group.clone()).to_bytes().unwrap();
        let body_len = le_u32(&bytes[1..5]) as usize;
        assert_eq!(decode_chunk_group(&bytes[5..5 + body_len]).unwrap(), group);
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        let chunks = (0..=u16::MAX as usize)
            .map(|i| Chunk::new(format!("s{}", i), vec![(1, 1.0)]))
            .collect();
        assert!(matches!(
            Record::ChunkGroup(ChunkGroup::new("root.sg.d1", chunks)).to_bytes(),
            Err(TsFileError::InvalidInput(_))
        ));
    }
}
