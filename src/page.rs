// Data-page layout and the in-page algorithms. A data chunk holds a
// descriptor array growing from the front and key/value bytes packed from
// the back; descriptor N is a sentinel whose offset marks the bottom of
// used space. Deletes leave tombstones that later inserts reuse and
// `wring` compacts away.

use bytemuck::Zeroable;

use crate::common::{align_len, LogicalPage};
use crate::db::Db;
use crate::dir::PageAlloc;
use crate::error::{DbError, Result};
use crate::format::{
    CacheModeKind, ChunkHeader, ChunkType, EntryDesc, LobRecord, CACHE_META_SIZE,
    CHUNK_HEADER_SIZE, ENTRY_SIZE, LOB_RECORD_SIZE,
};

/// Typed view over a mapped data chunk.
///
/// Invariant: `p` points at a mapped DATA chunk valid for
/// `num_pages * pagesize` bytes, and stays valid for the view's lifetime
/// (no remap between creation and last use).
#[derive(Clone, Copy)]
pub(crate) struct PageView {
    p: *mut ChunkHeader,
    align_mask: u32,
}

impl PageView {
    /// See the type-level invariant.
    pub unsafe fn new(p: *mut ChunkHeader, align_mask: u32) -> PageView {
        PageView { p, align_mask }
    }

    #[inline]
    pub fn raw(&self) -> *mut ChunkHeader {
        self.p
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.p as *mut u8
    }

    #[inline]
    pub fn num_entries(&self) -> u32 {
        // SAFETY: view invariant.
        unsafe { (*self.p).num_entries() }
    }

    #[inline]
    pub fn set_num_entries(&self, n: u32) {
        // SAFETY: view invariant.
        unsafe { (*self.p).data = n }
    }

    #[inline]
    pub fn page_num(&self) -> u32 {
        // SAFETY: view invariant.
        unsafe { (*self.p).num() }
    }

    #[inline]
    pub fn num_pages(&self) -> u32 {
        // SAFETY: view invariant.
        unsafe { (*self.p).num_pages() }
    }

    #[inline]
    pub fn entry_ptr(&self, i: u32) -> *mut EntryDesc {
        // SAFETY: descriptors live right after the chunk header; callers
        // index at most the sentinel.
        unsafe { (self.base().add(CHUNK_HEADER_SIZE) as *mut EntryDesc).add(i as usize) }
    }

    #[inline]
    pub fn entry(&self, i: u32) -> EntryDesc {
        // SAFETY: as entry_ptr.
        unsafe { *self.entry_ptr(i) }
    }

    #[inline]
    pub fn set_entry(&self, i: u32, e: EntryDesc) {
        // SAFETY: as entry_ptr.
        unsafe { *self.entry_ptr(i) = e }
    }

    /// Offset of the lowest used key/value byte (the sentinel's offset).
    #[inline]
    pub fn bottom_of_data(&self) -> u32 {
        self.entry(self.num_entries()).offset()
    }

    /// Unused bytes between the descriptor array and the data.
    #[inline]
    pub fn free_bytes(&self) -> i64 {
        self.bottom_of_data() as i64
            - CHUNK_HEADER_SIZE as i64
            - (self.num_entries() as i64 + 1) * ENTRY_SIZE as i64
    }

    #[inline]
    pub fn bytes(&self, off: u32, len: u32) -> &[u8] {
        // SAFETY: view invariant; callers pass in-page ranges.
        unsafe { std::slice::from_raw_parts(self.base().add(off as usize), len as usize) }
    }

    #[inline]
    pub fn bytes_mut(&self, off: u32, len: u32) -> &mut [u8] {
        // SAFETY: as bytes.
        unsafe { std::slice::from_raw_parts_mut(self.base().add(off as usize), len as usize) }
    }

    #[inline]
    pub fn key_bytes(&self, i: u32) -> &[u8] {
        let e = self.entry(i);
        self.bytes(e.offset(), e.key_len())
    }

    /// Start of entry `i`'s value area (cache metadata included).
    #[inline]
    pub fn val_offset(&self, i: u32) -> u32 {
        let next = self.entry(i + 1);
        next.offset() + align_len(self.align_mask, next.key_len())
    }

    /// Length of entry `i`'s value area minus alignment pad (cache
    /// metadata still included).
    #[inline]
    pub fn val_len(&self, i: u32) -> u32 {
        let e = self.entry(i);
        e.offset() - self.val_offset(i) - e.pad_bytes()
    }

    /// Key + value bytes of entry `i`, aligned.
    #[inline]
    pub fn kvsize(&self, i: u32) -> u32 {
        let e = self.entry(i);
        let next = self.entry(i + 1);
        e.offset() - next.offset() - align_len(self.align_mask, next.key_len())
            + align_len(self.align_mask, e.key_len())
    }

    /// Bytes entry `i` occupies including its descriptor. For a tombstone
    /// this is the reclaimable hole size plus the descriptor.
    #[inline]
    pub fn entry_size(&self, i: u32) -> u32 {
        self.kvsize(i) + ENTRY_SIZE as u32
    }

    #[inline]
    pub fn init_sentinel(&self, index: u32, offset: u32) {
        // SAFETY: as entry_ptr.
        unsafe { (*self.entry_ptr(index)).init_sentinel(offset) };
    }

    /// Compact tombstones: slide live key/value runs toward the top of
    /// the page and rebuild the descriptor array. Requires the page's
    /// write lock.
    pub fn wring(&self) {
        let mut write_index: u32 = 0;
        let mut offset: u32 = 0;
        let mut live: u32 = 0;

        let n = self.num_entries();
        for i in 0..n {
            let e = self.entry(i);
            if !e.is_tombstone() {
                live += 1;
                if offset != 0 {
                    let ksize = align_len(self.align_mask, e.key_len());
                    let next = self.entry(i + 1);
                    let vsize =
                        e.offset() - next.offset() - align_len(self.align_mask, next.key_len());
                    let kvsize = ksize + vsize;

                    offset -= kvsize;
                    let src = self.val_offset(i);
                    // SAFETY: both runs are inside the page; ranges may
                    // overlap, copy handles that.
                    unsafe {
                        std::ptr::copy(
                            self.base().add(src as usize),
                            self.base().add(offset as usize),
                            kvsize as usize,
                        );
                    }
                    let mut moved = EntryDesc::zeroed();
                    moved.match_word = e.match_word;
                    moved.set_flags(e.flags());
                    moved.set_offset(offset + vsize);
                    self.set_entry(write_index, moved);
                    write_index += 1;
                }
            } else if offset == 0 {
                // First tombstone: compaction starts here.
                write_index = i;
                offset = e.offset();
            }
        }
        if offset != 0 {
            self.init_sentinel(live, offset);
            self.set_num_entries(live);
        }
    }
}

impl Db {
    #[inline]
    pub(crate) fn view(&self, p: *mut ChunkHeader) -> PageView {
        // SAFETY: p comes from map_chunk/pagenum_to_page, valid for the
        // whole chunk until the next remap.
        unsafe { PageView::new(p, self.align_mask) }
    }

    /// Linear scan for `key` on a page: single-word match compare, then
    /// full key compare. Returns the entry index.
    pub(crate) fn find_entry(
        &self,
        view: &PageView,
        key: &[u8],
        hashval: u32,
    ) -> Option<u32> {
        let want = EntryDesc::make_match(key.len() as u16, hashval);
        let n = view.num_entries();
        for i in 0..n {
            if view.entry(i).match_word != want {
                continue;
            }
            if view.key_bytes(i) == key {
                return Some(i);
            }
        }
        None
    }

    /// The LOB record stored in entry `i`'s value area.
    pub(crate) fn lob_record(&self, view: &PageView, i: u32) -> LobRecord {
        let mut off = view.val_offset(i);
        if self.cache_policy != CacheModeKind::None {
            off += CACHE_META_SIZE as u32;
        }
        let bytes = view.bytes(off, LOB_RECORD_SIZE as u32);
        *bytemuck::from_bytes(bytes)
    }

    pub(crate) fn set_lob_record(&self, view: &PageView, i: u32, rec: LobRecord) {
        let mut off = view.val_offset(i);
        if self.cache_policy != CacheModeKind::None {
            off += CACHE_META_SIZE as u32;
        }
        view.bytes_mut(off, LOB_RECORD_SIZE as u32)
            .copy_from_slice(bytemuck::bytes_of(&rec));
    }

    /// Value length and allocated chunk length of entry `i`'s LOB. Falls
    /// back to the LOB chunk header when the in-page record is truncated
    /// below a full record (compatibility with existing files).
    pub(crate) fn lob_alloc_len(&mut self, view: &PageView, i: u32) -> Result<(u32, u32)> {
        let mut vallen = view.val_len(i);
        if self.cache_policy != CacheModeKind::None {
            vallen -= CACHE_META_SIZE as u32;
        }
        let lob_vallen = if vallen >= LOB_RECORD_SIZE as u32 {
            self.lob_record(view, i).vallen
        } else {
            let rec = self.lob_record(view, i);
            self.chunk_hdr(rec.pagenum())?.vallen()
        };
        let pages = crate::common::pages_rounded_up(
            self.pagesize,
            lob_vallen as u64 + CHUNK_HEADER_SIZE as u64,
        );
        Ok((lob_vallen, pages * self.pagesize))
    }

    /// Remove entry `index`: write the tombstone, absorb the hole into
    /// the neighboring run, pop trailing tombstones, free a LOB chunk,
    /// and shrink an emptied oversized page back to one page.
    pub(crate) fn del_entry(&mut self, page: *mut ChunkHeader, index: u32) -> Result<()> {
        let view = self.view(page);
        let e = view.entry(index);

        if e.is_large_obj() {
            let rec = self.lob_record(&view, index);
            self.lock_internal()?;
            let r = self.free_chunk(rec.pagenum(), None);
            self.unlock_internal();
            r?;
        }

        let offset = e.offset() + align_len(self.align_mask, e.key_len());
        let mut tomb = e;
        tomb.match_word = 0;
        tomb.set_offset(offset);
        view.set_entry(index, tomb);

        let n = view.num_entries();
        if index == n - 1 {
            // Pop this and any preceding tombstones off the end.
            let mut i = index;
            while i > 0 && view.entry(i - 1).is_tombstone() {
                i -= 1;
            }
            let off = view.entry(i).offset();
            view.set_num_entries(i);
            view.init_sentinel(i, off);
            if i == 0 && view.num_pages() > 1 {
                // Oversized page is empty now; give the extra pages back.
                let logical = view.page_num();
                self.lock_internal()?;
                let r = self.shrink_page(logical);
                self.unlock_internal();
                r?;
            }
        } else {
            let mut off = offset;
            if index > 0 && view.entry(index - 1).is_tombstone() {
                off = view.entry(index - 1).offset();
            }
            // Propagate the merged hole top through the tombstone run.
            let mut i = index;
            while view.entry(i).is_tombstone() {
                let mut t = view.entry(i);
                t.set_offset(off);
                view.set_entry(i, t);
                i += 1;
            }
        }
        Ok(())
    }

    /// Replace the oversized chunk serving `logical` with a fresh
    /// one-page chunk. Requires the internal lock.
    pub(crate) fn shrink_page(&mut self, logical: LogicalPage) -> Result<()> {
        let p = self.pt_get(logical);
        self.pt_set(logical, 0);
        self.free_chunk(p, None)?;
        // Reallocate eagerly so the logical page keeps a chunk.
        let chunk = self.alloc_chunk(ChunkType::Data, 1, None)?;
        let page = self.map_chunk_fresh(chunk, 1)?;
        let view = self.view(page);
        // SAFETY: fresh chunk mapped above.
        unsafe { (*page).set_num(logical) };
        view.init_sentinel(0, self.pagesize);
        view.set_num_entries(0);
        self.pt_set(logical, chunk);
        self.release_chunk(page);
        Ok(())
    }

    /// Move `logical`'s page into a chunk one page larger: data bytes
    /// shift down a page, descriptor offsets shift up by the page size.
    /// Acquires the internal lock.
    pub(crate) fn expand_page(&mut self, logical: LogicalPage) -> Result<()> {
        self.lock_internal()?;

        let old_phys = self.pt_get(logical);
        let old_npages = self.chunk_hdr(old_phys)?.num_pages();

        // alloc_chunk releases the internal lock on failure.
        let new_phys = self.alloc_chunk_can_unlock(ChunkType::Data, old_npages + 1, None)?;
        let new_prev = self.chunk_hdr(new_phys)?.prev_num_pages();

        let old_ptr = self.map_chunk(old_phys)?;
        let old_view = self.view(old_ptr);
        let tod = old_view.bottom_of_data();
        let nentries = old_view.num_entries();

        let new_ptr = self.map_chunk_fresh(new_phys, old_npages + 1)?;
        // SAFETY: both chunks are mapped for their full length; they are
        // distinct chunks so the ranges do not overlap.
        unsafe {
            let head = CHUNK_HEADER_SIZE + (nentries as usize + 1) * ENTRY_SIZE;
            std::ptr::copy_nonoverlapping(old_ptr as *const u8, new_ptr as *mut u8, head);
            let data_len = old_npages as usize * self.pagesize as usize - tod as usize;
            std::ptr::copy_nonoverlapping(
                (old_ptr as *const u8).add(tod as usize),
                (new_ptr as *mut u8).add(tod as usize + self.pagesize as usize),
                data_len,
            );
        }
        let new_view = self.view(new_ptr);
        for i in 0..=nentries {
            let mut e = new_view.entry(i);
            e.set_offset(e.offset() + self.pagesize);
            new_view.set_entry(i, e);
        }
        // SAFETY: new chunk header mapped above.
        unsafe {
            (*new_ptr).set_num(logical);
            (*new_ptr).set_num_pages(old_npages + 1);
            (*new_ptr).set_prev_num_pages(new_prev);
        }
        self.release_chunk(old_ptr);
        self.release_chunk(new_ptr);

        self.pt_set(logical, new_phys);
        self.free_chunk(old_phys, None)?;
        self.unlock_internal();
        Ok(())
    }

    /// Resolve the data page for `logical`, allocating when asked.
    pub(crate) fn data_page(
        &mut self,
        logical: LogicalPage,
        alloc: PageAlloc,
    ) -> Result<Option<PageView>> {
        Ok(self
            .pagenum_to_page(logical, alloc)?
            .map(|p| self.view(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    // Build a fake one-page data chunk in a Vec and view it.
    fn test_page(pagesize: u32) -> (Vec<u8>, PageView) {
        let mut buf = vec![0u8; pagesize as usize];
        let hdr: &mut ChunkHeader = bytemuck::from_bytes_mut(&mut buf[..CHUNK_HEADER_SIZE]);
        hdr.init(ChunkType::Data, 0, 1, 0);
        let ptr = buf.as_mut_ptr() as *mut ChunkHeader;
        // SAFETY: buf outlives the view in each test.
        let view = unsafe { PageView::new(ptr, 0) };
        view.init_sentinel(0, pagesize);
        (buf, view)
    }

    // Minimal insert helper mirroring the store layout math.
    fn push_entry(view: &PageView, key: &[u8], val: &[u8], hash: u32) {
        let kvsize = (key.len() + val.len()) as u32;
        let i = view.num_entries();
        let bottom = view.bottom_of_data();
        view.set_num_entries(i + 1);
        view.init_sentinel(i + 1, bottom - kvsize);
        let mut e = view.entry(i);
        e.set_key(key.len() as u16, hash);
        e.set_offset(bottom - key.len() as u32);
        e.set_flags(0);
        view.set_entry(i, e);
        view.bytes_mut(bottom - key.len() as u32, key.len() as u32)
            .copy_from_slice(key);
        view.bytes_mut(bottom - kvsize, val.len() as u32)
            .copy_from_slice(val);
    }

    #[test]
    fn test_page_layout_roundtrip() {
        let (_buf, view) = test_page(1024);
        assert_eq!(view.num_entries(), 0);
        assert_eq!(view.bottom_of_data(), 1024);
        assert_eq!(view.free_bytes(), 1024 - 16 - 8);

        push_entry(&view, b"hello", b"world!", 0xabcd_0000);
        assert_eq!(view.num_entries(), 1);
        assert_eq!(view.key_bytes(0), b"hello");
        assert_eq!(view.val_len(0), 6);
        let off = view.val_offset(0);
        assert_eq!(view.bytes(off, 6), b"world!");
        assert_eq!(view.kvsize(0), 11);
        assert_eq!(view.entry_size(0), 19);
    }

    #[test]
    fn test_wring_compacts_tombstones() {
        let (_buf, view) = test_page(1024);
        push_entry(&view, b"aa", b"11", 0x1111_0000);
        push_entry(&view, b"bb", b"2222", 0x2222_0000);
        push_entry(&view, b"cc", b"333333", 0x3333_0000);
        let before_free = view.free_bytes();

        // Tombstone the middle entry the way del_entry does.
        let mut t = view.entry(1);
        let hole_top = t.offset() + t.key_len();
        t.match_word = 0;
        t.set_offset(hole_top);
        view.set_entry(1, t);

        view.wring();
        assert_eq!(view.num_entries(), 2);
        assert_eq!(view.key_bytes(0), b"aa");
        assert_eq!(view.key_bytes(1), b"cc");
        let off = view.val_offset(1);
        assert_eq!(view.bytes(off, 6), b"333333");
        // The hole (2+4 bytes) and its descriptor came back.
        assert_eq!(view.free_bytes(), before_free + 2 + 4 + 8);
    }

    #[test]
    fn test_wring_no_tombstones_is_noop() {
        let (_buf, view) = test_page(1024);
        push_entry(&view, b"k1", b"v1", 0xaaaa_0000);
        let free = view.free_bytes();
        view.wring();
        assert_eq!(view.num_entries(), 1);
        assert_eq!(view.free_bytes(), free);
        assert_eq!(view.key_bytes(0), b"k1");
    }

    #[test]
    fn test_entry_desc_helpers() {
        let mut e = EntryDesc::zeroed();
        e.set_key(3, 0xffff_0000);
        assert!(!e.is_tombstone());
        e.match_word = 0;
        assert!(e.is_tombstone());
    }
}
