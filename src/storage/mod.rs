//! Storage layer
//!
//! A single append-only file holding a fixed header, a memory-mapped
//! position index and a region of variable-size records:
//!
//! ```text
//! [magic "ASOC" | version u32 | record tag u32 | meta slots u32 | meta u64 * slots]
//! [capacity u32 | max key u32 | offset u64 * capacity]
//! [record region, append-only]
//! ```
//!
//! All integers are little-endian. An offset of 0 marks an absent key.

use bytes::BytesMut;
use std::fs::File;
use std::io;

use crate::Result;

pub mod mmap;
pub mod position;

pub use position::{PositionStore, StoreStats};

/// Serializer contract for records kept in a [`PositionStore`].
///
/// Every record format must be self-describing: the on-disk length of a
/// record has to be derivable from its first `LEN_PREFIX` bytes.
pub trait RecordCodec: Send + Sync {
    type Record;

    /// Persisted in the header; reopening a file with another codec fails.
    const TYPE_TAG: u32;

    /// Number of u64 metadata slots the codec owns in the header.
    const META_SLOTS: usize;

    /// Bytes needed to determine the length of a stored record.
    const LEN_PREFIX: usize;

    /// Serialized length of `record`.
    fn encoded_len(&self, record: &Self::Record) -> usize;

    /// On-disk length of the record starting with `prefix`.
    fn stored_len(&self, prefix: &[u8]) -> Result<usize>;

    fn encode(&self, record: &Self::Record, buf: &mut BytesMut);

    fn decode(&self, bytes: &[u8]) -> Result<Self::Record>;
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
