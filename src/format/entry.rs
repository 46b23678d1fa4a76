use bytemuck::{Pod, Zeroable};

pub const ENTRY_SIZE: usize = 8;
pub const LOB_RECORD_SIZE: usize = 8;
pub const CACHE_META_SIZE: usize = 8;
pub const PT_ENTRY_SIZE: usize = 4;

/// Entry flag bits. The low three bits store the value's alignment pad.
pub const EFLAG_PAD_MASK: u8 = 0x07;
pub const EFLAG_LARGEOBJ: u8 = 0x08;
pub const EFLAG_DIRTY: u8 = 0x10;
pub const EFLAG_SYNC_ERROR: u8 = 0x20;

/// Match word of the sentinel descriptor terminating a page's entry array.
pub const TOP_OF_PAGE_MARKER: u32 = 0xffff_0000;

/// 8-byte entry descriptor.
///
/// `match_word` bundles the 16-bit key length with the high 16 bits of the
/// key's hash, allowing a single-word compare before touching key bytes.
/// A zero match word is a tombstone. `off_flags` packs the 24-bit offset
/// where this entry's key bytes end plus 8 flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct EntryDesc {
    pub match_word: u32,
    off_flags: u32,
}

const _: () = assert!(std::mem::size_of::<EntryDesc>() == ENTRY_SIZE);

impl EntryDesc {
    #[inline]
    pub fn make_match(key_len: u16, hash: u32) -> u32 {
        (key_len as u32) | (hash & 0xffff_0000)
    }

    #[inline]
    pub fn key_len(&self) -> u32 {
        self.match_word & 0xffff
    }

    #[inline]
    pub fn set_key(&mut self, key_len: u16, hash: u32) {
        self.match_word = Self::make_match(key_len, hash);
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.match_word == 0
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.match_word == TOP_OF_PAGE_MARKER
    }

    /// Byte offset (from the chunk start) where this entry's key ends.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.off_flags & 0x00ff_ffff
    }

    #[inline]
    pub fn set_offset(&mut self, off: u32) {
        debug_assert!(off <= 0x00ff_ffff);
        self.off_flags = (self.off_flags & 0xff00_0000) | off;
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.off_flags >> 24) as u8
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) {
        self.off_flags = (self.off_flags & 0x00ff_ffff) | ((flags as u32) << 24);
    }

    #[inline]
    pub fn flag_set(&mut self, bit: u8) {
        self.set_flags(self.flags() | bit);
    }

    #[inline]
    pub fn flag_clear(&mut self, bit: u8) {
        self.set_flags(self.flags() & !bit);
    }

    #[inline]
    pub fn is_large_obj(&self) -> bool {
        self.flags() & EFLAG_LARGEOBJ != 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags() & EFLAG_DIRTY != 0
    }

    #[inline]
    pub fn pad_bytes(&self) -> u32 {
        (self.flags() & EFLAG_PAD_MASK) as u32
    }

    #[inline]
    pub fn set_pad_bytes(&mut self, pad: u8) {
        self.set_flags((self.flags() & !EFLAG_PAD_MASK) | (pad & EFLAG_PAD_MASK));
    }

    /// Reinitialize as the top-of-page sentinel pointing at `offset`.
    #[inline]
    pub fn init_sentinel(&mut self, offset: u32) {
        self.match_word = TOP_OF_PAGE_MARKER;
        self.off_flags = 0;
        self.set_offset(offset);
    }
}

/// In-page record for a large object: the chunk holding the value plus the
/// value length. Stored where a normal entry's value bytes would be.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LobRecord {
    pagenum_flags: u32,
    pub vallen: u32,
}

const _: () = assert!(std::mem::size_of::<LobRecord>() == LOB_RECORD_SIZE);

impl LobRecord {
    pub fn new(pagenum: u32, vallen: u32) -> LobRecord {
        debug_assert!(pagenum <= 0x00ff_ffff);
        LobRecord {
            pagenum_flags: pagenum,
            vallen,
        }
    }

    #[inline]
    pub fn pagenum(&self) -> u32 {
        self.pagenum_flags & 0x00ff_ffff
    }

    #[inline]
    pub fn set_pagenum(&mut self, pagenum: u32) {
        debug_assert!(pagenum <= 0x00ff_ffff);
        self.pagenum_flags = (self.pagenum_flags & 0xff00_0000) | pagenum;
    }
}

/// 8-byte cache metadata prefixed to each value in cache mode. The second
/// word is an access timestamp for LFU/LRU and an f32 priority for GDSF.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CacheMeta {
    pub num_accesses: u32,
    dat: u32,
}

const _: () = assert!(std::mem::size_of::<CacheMeta>() == CACHE_META_SIZE);

impl CacheMeta {
    #[inline]
    pub fn access_time(&self) -> u32 {
        self.dat
    }

    #[inline]
    pub fn set_access_time(&mut self, t: u32) {
        self.dat = t;
    }

    #[inline]
    pub fn priority(&self) -> f32 {
        f32::from_bits(self.dat)
    }

    #[inline]
    pub fn set_priority(&mut self, p: f32) {
        self.dat = p.to_bits();
    }
}

/// Page-table slot: 24-bit physical chunk index, 8 bits of padding.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PtEntry(u32);

const _: () = assert!(std::mem::size_of::<PtEntry>() == PT_ENTRY_SIZE);

impl PtEntry {
    #[inline]
    pub fn pagenum(&self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    #[inline]
    pub fn set_pagenum(&mut self, p: u32) {
        debug_assert!(p <= 0x00ff_ffff);
        self.0 = p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_match_word() {
        let mut e = EntryDesc::zeroed();
        e.set_key(12, 0xabcd_1234);
        assert_eq!(e.key_len(), 12);
        assert_eq!(e.match_word, 0xabcd_000c);
        assert!(!e.is_tombstone());
        assert!(!e.is_sentinel());
    }

    #[test]
    fn test_entry_offset_and_flags() {
        let mut e = EntryDesc::zeroed();
        e.set_offset(0x12_3456);
        e.flag_set(EFLAG_DIRTY);
        e.set_pad_bytes(3);
        assert_eq!(e.offset(), 0x12_3456);
        assert!(e.is_dirty());
        assert_eq!(e.pad_bytes(), 3);
        e.flag_clear(EFLAG_DIRTY);
        assert!(!e.is_dirty());
        assert_eq!(e.offset(), 0x12_3456);
    }

    #[test]
    fn test_sentinel() {
        let mut e = EntryDesc::zeroed();
        e.init_sentinel(4096);
        assert!(e.is_sentinel());
        assert_eq!(e.offset(), 4096);
        assert_eq!(e.flags() & !EFLAG_PAD_MASK, 0);
    }

    #[test]
    fn test_cache_meta_priority_bits() {
        let mut c = CacheMeta::zeroed();
        c.set_priority(0.5);
        assert_eq!(c.priority(), 0.5);
        c.set_access_time(12345);
        assert_eq!(c.access_time(), 12345);
    }

    #[test]
    fn test_lob_record() {
        let mut l = LobRecord::new(42, 1500);
        assert_eq!(l.pagenum(), 42);
        assert_eq!(l.vallen, 1500);
        l.set_pagenum(99);
        assert_eq!(l.pagenum(), 99);
    }
}
