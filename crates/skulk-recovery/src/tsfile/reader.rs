//! Sequential record reader for data files.
//!
//! Used by the restorable writer to find the last complete record and by
//! recovery to re-read stored chunks when rebuilding the resource index.

use crate::error::{Result, TsFileError};
use crate::tsfile::format::{
    decode_chunk_group, FileHeader, Record, HEADER_SIZE, MARKER_CHUNK_GROUP, MARKER_FOOTER,
    MARKER_VERSION,
};
use crate::tsfile::ChunkGroup;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Read-only view of a data file.
#[derive(Debug)]
pub struct DataFileReader {
    path: PathBuf,
    header: FileHeader,
    file_len: u64,
}

impl DataFileReader {
    /// Opens a data file and validates its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the header is invalid.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = FileHeader::read_from(&mut reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            file_len,
        })
    }

    /// Returns the file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Returns the file length at open time.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Iterates the records between the header and `limit`.
    ///
    /// Iteration stops at `limit`, at a footer marker, or after the first
    /// error (a torn or damaged record), whichever comes first.
    pub fn records(&self, limit: u64) -> Result<RecordIter> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(RecordIter {
            reader: BufReader::new(file),
            offset: HEADER_SIZE as u64,
            limit: limit.min(self.file_len),
            footer_at: None,
            done: false,
        })
    }

    /// Iterates only the chunk groups between the header and `limit`.
    pub fn chunk_groups(&self, limit: u64) -> Result<impl Iterator<Item = Result<ChunkGroup>>> {
        Ok(self.records(limit)?.filter_map(|record| match record {
            Ok((_, Record::ChunkGroup(group))) => Some(Ok(group)),
            Ok((_, Record::Version(_))) => None,
            Err(e) => Some(Err(e)),
        }))
    }
}

/// Iterator over `(offset, record)` pairs.
pub struct RecordIter {
    reader: BufReader<File>,
    /// Offset of the next record to read.
    offset: u64,
    limit: u64,
    footer_at: Option<u64>,
    done: bool,
}

impl RecordIter {
    /// Offset just past the last record returned successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the footer marker, if iteration stopped on one.
    pub fn footer_at(&self) -> Option<u64> {
        self.footer_at
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.offset)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                TsFileError::Corrupted(format!("torn record at offset {}", self.offset))
            } else {
                e.into()
            }
        })
    }

    fn read_record(&mut self, marker: u8) -> Result<(Record, u64)> {
        match marker {
            MARKER_CHUNK_GROUP => {
                let mut len_buf = [0u8; 4];
                self.read_exact(&mut len_buf)?;
                let body_len = u32::from_le_bytes(len_buf) as u64;
                let total = 1 + 4 + body_len + 4;
                if total > self.remaining() {
                    return Err(TsFileError::Corrupted(format!(
                        "chunk group at offset {} declares {} bytes, {} available",
                        self.offset,
                        total,
                        self.remaining()
                    )));
                }

                let mut body = vec![0u8; body_len as usize];
                self.read_exact(&mut body)?;
                let mut crc_buf = [0u8; 4];
                self.read_exact(&mut crc_buf)?;

                let expected = u32::from_le_bytes(crc_buf);
                let actual = crc32fast::hash(&body);
                if expected != actual {
                    return Err(TsFileError::ChecksumMismatch { expected, actual });
                }
                Ok((Record::ChunkGroup(decode_chunk_group(&body)?), total))
            }
            MARKER_VERSION => {
                let total = 1 + 8 + 4;
                if total > self.remaining() {
                    return Err(TsFileError::Corrupted(format!(
                        "torn version record at offset {}",
                        self.offset
                    )));
                }
                let mut payload = [0u8; 8];
                self.read_exact(&mut payload)?;
                let mut crc_buf = [0u8; 4];
                self.read_exact(&mut crc_buf)?;

                let expected = u32::from_le_bytes(crc_buf);
                let actual = crc32fast::hash(&payload);
                if expected != actual {
                    return Err(TsFileError::ChecksumMismatch { expected, actual });
                }
                Ok((Record::Version(u64::from_le_bytes(payload)), total))
            }
            other => Err(TsFileError::Corrupted(format!(
                "unknown marker {:#04x} at offset {}",
                other, self.offset
            ))),
        }
    }
}

impl Iterator for RecordIter {
    type Item = Result<(u64, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining() == 0 {
            return None;
        }

        let mut marker = [0u8; 1];
        if let Err(e) = self.read_exact(&mut marker) {
            self.done = true;
            return Some(Err(e));
        }

        if marker[0] == MARKER_FOOTER {
            self.footer_at = Some(self.offset);
            self.done = true;
            return None;
        }

        match self.read_record(marker[0]) {
            Ok((record, size)) => {
                let start = self.offset;
                self.offset += size;
                Some(Ok((start, record)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
