use bytemuck::{Pod, Zeroable};

use crate::common::PhysPage;

/// Size of the chunk header prefixed to every chunk.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Magic stored in the directory chunk's data word (chunk 0 only).
pub const DIR_CHUNK_MAGIC: u32 = super::header::DB_MAGIC;

/// What a chunk holds. The value is stored in 4 bits of the chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Free,
    Data,
    Dir,
    Lob,
}

impl ChunkType {
    pub fn from_bits(v: u32) -> Option<ChunkType> {
        match v {
            0 => Some(ChunkType::Free),
            1 => Some(ChunkType::Data),
            2 => Some(ChunkType::Dir),
            3 => Some(ChunkType::Lob),
            _ => None,
        }
    }

    pub fn as_bits(self) -> u32 {
        match self {
            ChunkType::Free => 0,
            ChunkType::Data => 1,
            ChunkType::Dir => 2,
            ChunkType::Lob => 3,
        }
    }
}

/// 16-byte header at the start of every chunk.
///
/// `data` is type-dependent: entry count for DATA, next free chunk for
/// FREE, value length for LOB, and the magic for the directory chunk.
/// The remaining words pack 24-bit fields with 8 bits of padding each:
/// the owning logical page, the chunk length in pages, and the previous
/// chunk's length (chunks chain by adjacency, not by pointer).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkHeader {
    pub data: u32,
    num_type: u32,
    pages_r0: u32,
    prev_r1: u32,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

impl ChunkHeader {
    /// Logical page this chunk serves (DATA), or the owning data page (LOB).
    #[inline]
    pub fn num(&self) -> u32 {
        self.num_type & 0x00ff_ffff
    }

    #[inline]
    pub fn set_num(&mut self, num: u32) {
        debug_assert!(num <= 0x00ff_ffff);
        self.num_type = (self.num_type & 0xff00_0000) | num;
    }

    #[inline]
    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_bits((self.num_type >> 24) & 0xf)
    }

    #[inline]
    pub fn set_chunk_type(&mut self, t: ChunkType) {
        self.num_type = (self.num_type & 0x00ff_ffff) | (t.as_bits() << 24);
    }

    #[inline]
    pub fn is_type(&self, t: ChunkType) -> bool {
        self.chunk_type() == Some(t)
    }

    /// Chunk length in DB pages.
    #[inline]
    pub fn num_pages(&self) -> u32 {
        self.pages_r0 & 0x00ff_ffff
    }

    #[inline]
    pub fn set_num_pages(&mut self, n: u32) {
        debug_assert!(n <= 0x00ff_ffff);
        self.pages_r0 = n;
    }

    /// Length of the physically preceding chunk, in DB pages.
    #[inline]
    pub fn prev_num_pages(&self) -> u32 {
        self.prev_r1 & 0x00ff_ffff
    }

    #[inline]
    pub fn set_prev_num_pages(&mut self, n: u32) {
        debug_assert!(n <= 0x00ff_ffff);
        self.prev_r1 = n;
    }

    /// Entry count (DATA chunks).
    #[inline]
    pub fn num_entries(&self) -> u32 {
        self.data
    }

    /// Next free chunk index (FREE chunks); 0 terminates the list.
    #[inline]
    pub fn next_free(&self) -> PhysPage {
        self.data
    }

    /// Stored value length (LOB chunks).
    #[inline]
    pub fn vallen(&self) -> u32 {
        self.data
    }

    /// Reinitialize in place for a fresh allocation.
    pub fn init(&mut self, t: ChunkType, num: u32, num_pages: u32, prev_num_pages: u32) {
        self.data = 0;
        self.num_type = 0;
        self.set_num(num);
        self.set_chunk_type(t);
        self.pages_r0 = 0;
        self.set_num_pages(num_pages);
        self.prev_r1 = 0;
        self.set_prev_num_pages(prev_num_pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_fields() {
        let mut h = ChunkHeader::zeroed();
        h.init(ChunkType::Data, 7, 3, 2);
        assert_eq!(h.num(), 7);
        assert_eq!(h.chunk_type(), Some(ChunkType::Data));
        assert_eq!(h.num_pages(), 3);
        assert_eq!(h.prev_num_pages(), 2);
        assert_eq!(h.num_entries(), 0);

        h.set_num(0x00ab_cdef);
        assert_eq!(h.num(), 0x00ab_cdef);
        assert_eq!(h.chunk_type(), Some(ChunkType::Data));
    }

    #[test]
    fn test_type_roundtrip() {
        for t in [
            ChunkType::Free,
            ChunkType::Data,
            ChunkType::Dir,
            ChunkType::Lob,
        ] {
            assert_eq!(ChunkType::from_bits(t.as_bits()), Some(t));
        }
        assert_eq!(ChunkType::from_bits(9), None);
    }
}
