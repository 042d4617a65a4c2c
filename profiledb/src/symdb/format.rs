// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format of `symbols.symdb`.
//!
//! ```text
//! | header (32) | TOC (48) | chunk headers (64 each) | chunk data |
//! ```
//!
//! All integers are big-endian and all offsets are absolute. Every section
//! carries a CRC32 (IEEE) checksum. The header CRC is checked before the
//! magic, so any damage to the header reads as [`Error::InvalidCrc`].

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

pub const MAGIC: [u8; 4] = *b"sym1";
pub const FORMAT_V1: u32 = 1;

pub const HEADER_SIZE: usize = 32;
pub const TOC_ENTRY_SIZE: usize = 16;
pub const TOC_ENTRIES: usize = 2;
/// 12 reserved bytes and the CRC.
const TOC_TRAILER_SIZE: usize = 16;
pub const TOC_SIZE: usize = TOC_ENTRIES * TOC_ENTRY_SIZE + TOC_TRAILER_SIZE;
pub const CHUNK_HEADER_SIZE: usize = 64;

pub const TOC_STACKTRACE_CHUNK_HEADERS: usize = 0;
pub const TOC_STACKTRACE_CHUNK_DATA: usize = 1;

fn checked_crc(b: &[u8]) -> Result<()> {
    let (body, crc) = b.split_at(b.len() - 4);
    if BigEndian::read_u32(crc) != crc32fast::hash(body) {
        return Err(Error::InvalidCrc);
    }
    Ok(())
}

fn put_crc(b: &mut [u8]) {
    let n = b.len() - 4;
    let crc = crc32fast::hash(&b[..n]);
    BigEndian::write_u32(&mut b[n..], crc);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_V1,
        }
    }
}

impl Header {
    pub fn marshal(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..4].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut b[4..8], self.version);
        put_crc(&mut b);
        b
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() != HEADER_SIZE {
            return Err(Error::InvalidSize);
        }
        checked_crc(b)?;
        if b[0..4] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = BigEndian::read_u32(&b[4..8]);
        if version != FORMAT_V1 {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self {
            magic: MAGIC,
            version,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TocEntry {
    pub offset: u64,
    pub size: u64,
}

impl TocEntry {
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// Table of contents: where the chunk headers and the chunk data live.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Toc {
    pub entries: [TocEntry; TOC_ENTRIES],
}

impl Toc {
    pub fn marshal(&self) -> [u8; TOC_SIZE] {
        let mut b = [0u8; TOC_SIZE];
        for (i, e) in self.entries.iter().enumerate() {
            let off = i * TOC_ENTRY_SIZE;
            BigEndian::write_u64(&mut b[off..off + 8], e.offset);
            BigEndian::write_u64(&mut b[off + 8..off + 16], e.size);
        }
        put_crc(&mut b);
        b
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() != TOC_SIZE {
            return Err(Error::InvalidSize);
        }
        checked_crc(b)?;
        let mut toc = Toc::default();
        for (i, e) in toc.entries.iter_mut().enumerate() {
            let off = i * TOC_ENTRY_SIZE;
            e.offset = BigEndian::read_u64(&b[off..off + 8]);
            e.size = BigEndian::read_u64(&b[off + 8..off + 16]);
        }
        Ok(toc)
    }
}

/// Describes one stack trace chunk of one mapping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Absolute offset of the payload.
    pub offset: u64,
    pub size: u64,
    pub mapping: u64,
    /// Id of the first node of the chunk.
    pub stid: u32,
    pub nodes: u32,
    pub max_nodes: u32,
    pub stacktraces: u32,
    pub max_depth: u32,
    /// CRC32 of the payload.
    pub crc: u32,
}

impl ChunkHeader {
    pub fn marshal(&self, b: &mut [u8]) {
        b[0..CHUNK_HEADER_SIZE].fill(0);
        BigEndian::write_u64(&mut b[0..8], self.offset);
        BigEndian::write_u64(&mut b[8..16], self.size);
        BigEndian::write_u64(&mut b[16..24], self.mapping);
        BigEndian::write_u32(&mut b[24..28], self.stid);
        BigEndian::write_u32(&mut b[28..32], self.nodes);
        BigEndian::write_u32(&mut b[32..36], self.max_nodes);
        BigEndian::write_u32(&mut b[36..40], self.stacktraces);
        BigEndian::write_u32(&mut b[40..44], self.max_depth);
        // 44..56 reserved.
        BigEndian::write_u32(&mut b[56..60], self.crc);
        put_crc(&mut b[0..CHUNK_HEADER_SIZE]);
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() != CHUNK_HEADER_SIZE {
            return Err(Error::InvalidSize);
        }
        checked_crc(b)?;
        Ok(Self {
            offset: BigEndian::read_u64(&b[0..8]),
            size: BigEndian::read_u64(&b[8..16]),
            mapping: BigEndian::read_u64(&b[16..24]),
            stid: BigEndian::read_u32(&b[24..28]),
            nodes: BigEndian::read_u32(&b[28..32]),
            max_nodes: BigEndian::read_u32(&b[32..36]),
            stacktraces: BigEndian::read_u32(&b[36..40]),
            max_depth: BigEndian::read_u32(&b[40..44]),
            crc: BigEndian::read_u32(&b[56..60]),
        })
    }

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

pub fn marshal_chunk_headers(headers: &[ChunkHeader]) -> Vec<u8> {
    let mut b = vec![0u8; headers.len() * CHUNK_HEADER_SIZE];
    for (h, dst) in headers.iter().zip(b.chunks_exact_mut(CHUNK_HEADER_SIZE)) {
        h.marshal(dst);
    }
    b
}

pub fn unmarshal_chunk_headers(b: &[u8]) -> Result<Vec<ChunkHeader>> {
    if b.len() % CHUNK_HEADER_SIZE != 0 {
        return Err(Error::InvalidSize);
    }
    b.chunks_exact(CHUNK_HEADER_SIZE)
        .map(ChunkHeader::unmarshal)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_errors_are_distinct() {
        let b = Header::default().marshal();
        assert_eq!(Header::unmarshal(&b).unwrap(), Header::default());
        assert!(matches!(Header::unmarshal(&b[..31]), Err(Error::InvalidSize)));

        let mut flipped = b;
        flipped[0] ^= 0xff;
        assert!(matches!(Header::unmarshal(&flipped), Err(Error::InvalidCrc)));

        // A well-formed header of some other file type.
        let other = Header {
            magic: *b"sym0",
            version: FORMAT_V1,
        };
        assert!(matches!(
            Header::unmarshal(&other.marshal()),
            Err(Error::InvalidMagic)
        ));

        let future = Header {
            magic: MAGIC,
            version: 2,
        };
        assert!(matches!(
            Header::unmarshal(&future.marshal()),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn toc_round_trip() {
        let toc = Toc {
            entries: [
                TocEntry {
                    offset: 80,
                    size: 128,
                },
                TocEntry {
                    offset: 208,
                    size: 12,
                },
            ],
        };
        let b = toc.marshal();
        assert_eq!(b.len(), 48);
        assert_eq!(Toc::unmarshal(&b).unwrap(), toc);
        assert!(matches!(Toc::unmarshal(&b[1..]), Err(Error::InvalidSize)));
        for i in 0..b.len() {
            let mut flipped = b;
            flipped[i] ^= 0x01;
            assert!(matches!(Toc::unmarshal(&flipped), Err(Error::InvalidCrc)));
        }
    }

    #[test]
    fn chunk_headers_round_trip() {
        let headers = vec![
            ChunkHeader {
                offset: 208,
                size: 10,
                mapping: 7,
                stid: 0,
                nodes: 5,
                max_nodes: 5,
                stacktraces: 3,
                max_depth: 4,
                crc: 0xdead_beef,
            },
            ChunkHeader {
                offset: 218,
                stid: 5,
                ..Default::default()
            },
        ];
        let b = marshal_chunk_headers(&headers);
        assert_eq!(b.len(), 128);
        assert_eq!(unmarshal_chunk_headers(&b).unwrap(), headers);
        assert!(matches!(
            unmarshal_chunk_headers(&b[..100]),
            Err(Error::InvalidSize)
        ));
        let mut flipped = b.clone();
        flipped[70] ^= 0x10;
        assert!(matches!(
            unmarshal_chunk_headers(&flipped),
            Err(Error::InvalidCrc)
        ));
    }
}
