// Extendible-hash directory: the bit vector describing the trie of page
// splits, the dense page table, and the walk from a key hash to a logical
// page. The handle keeps a private copy of the directory bits so a
// concurrent split in another handle cannot tear a walk in progress.

use tracing::debug;

use crate::common::{
    dir_bytes, dir_width, hash_mask, HashVal, LogicalPage, PhysPage, MAX_NUM_PAGES,
};
use crate::db::{num_dir_pages, Db};
use crate::error::{DbError, Result};
use crate::format::{
    ChunkHeader, ChunkType, EntryDesc, CHUNK_HEADER_SIZE, HFLAG_PERFECT, PT_ENTRY_SIZE,
};

/// Allocation behavior of `pagenum_to_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageAlloc {
    /// Return None when the logical page has no chunk.
    NoAlloc,
    /// Allocate a chunk on demand.
    Alloc,
    /// The chunk must exist; anything else is a programmer error.
    Exists,
}

impl Db {
    #[inline]
    pub(crate) fn dir_bit(&self, bit: u32) -> bool {
        self.dir_copy[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
    }

    pub(crate) fn set_dir_bit(&mut self, bit: u32) {
        // SAFETY: bit < dir width; the directory bits are always mapped.
        unsafe {
            let p = self.dir_bits_ptr().add((bit >> 3) as usize);
            *p |= 1 << (bit & 7);
        }
        self.dir_copy[(bit >> 3) as usize] |= 1 << (bit & 7);
    }

    pub(crate) fn clear_dir_bit(&mut self, bit: u32) {
        // SAFETY: as in set_dir_bit.
        unsafe {
            let p = self.dir_bits_ptr().add((bit >> 3) as usize);
            *p &= !(1 << (bit & 7));
        }
        self.dir_copy[(bit >> 3) as usize] &= !(1 << (bit & 7));
    }

    /// Walk the trie from a key hash to its logical page.
    pub(crate) fn hash_to_logical_page(&self, hashval: HashVal) -> LogicalPage {
        let hashbit = if self.dir_perfect {
            self.dir_shift as u32
        } else {
            let mut hv = hashval;
            let mut dirbit = 0u32;
            let mut hashbit = 0u32;
            while dirbit < self.max_dirbit && self.dir_bit(dirbit) {
                dirbit = (dirbit << 1) + (hv & 1) + 1;
                hashbit += 1;
                hv >>= 1;
            }
            hashbit
        };
        hash_mask(hashbit) & hashval
    }

    /// Refresh the private directory copy (and the geometry derived from
    /// the header) after any directory mutation or generation change.
    pub(crate) fn sync_dir(&mut self) {
        let hdr = *self.hdr();
        self.dir_shift = hdr.dir_shift;
        self.max_dirbit = hash_mask(hdr.dir_shift as u32);
        self.num_pages = hdr.num_pages;
        self.dir_gen = hdr.dir_gen;
        self.dir_perfect = hdr.dbflags & HFLAG_PERFECT != 0;
        let nbytes = dir_bytes(hdr.dir_shift);
        self.dir_copy.resize(nbytes, 0);
        // SAFETY: nbytes of directory bits are mapped after the header.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.dir_bits_ptr() as *const u8,
                self.dir_copy.as_mut_ptr(),
                nbytes,
            );
        }
    }

    /// Resolve a logical page to its data chunk. Requires the caller to
    /// hold a lock covering `logical`.
    pub(crate) fn pagenum_to_page(
        &mut self,
        logical: LogicalPage,
        alloc: PageAlloc,
    ) -> Result<Option<*mut ChunkHeader>> {
        if logical > self.max_dirbit {
            return Err(DbError::Corrupt(format!(
                "logical page {logical} out of range ({})",
                self.max_dirbit
            )));
        }
        let p = self.pt_get(logical);
        if p != 0 {
            let page = self.map_chunk(p)?;
            // SAFETY: map_chunk returned a live chunk mapping.
            let ok = unsafe { (*page).is_type(ChunkType::Data) };
            if p > self.num_pages || !ok {
                return Err(DbError::Corrupt(format!(
                    "page table slot {logical} points at bad chunk {p}"
                )));
            }
            return Ok(Some(page));
        }

        match alloc {
            PageAlloc::NoAlloc => return Ok(None),
            PageAlloc::Exists => {
                panic!("pagenum_to_page: chunk for logical page {logical} must exist");
            }
            PageAlloc::Alloc => {}
        }

        self.lock_internal()?;
        // alloc_chunk releases the internal lock itself on failure.
        let chunk = self.alloc_chunk_can_unlock(ChunkType::Data, 1, None)?;
        let page = self.map_chunk_fresh(chunk, 1)?;
        // SAFETY: freshly allocated chunk, mapped above.
        unsafe {
            let sentinel = (page as *mut u8).add(CHUNK_HEADER_SIZE) as *mut EntryDesc;
            (*sentinel).init_sentinel(self.pagesize);
            (*page).set_num(logical);
        }
        self.pt_set(logical, chunk);
        self.unlock_internal();
        Ok(Some(page))
    }

    /// Like `map_chunk` but for a chunk whose header is not yet written;
    /// maps `npages` without trusting on-disk state.
    pub(crate) fn map_chunk_fresh(&mut self, p: PhysPage, npages: u32) -> Result<*mut ChunkHeader> {
        if !self.windowed {
            return Ok(self.chunk_ptr(p));
        }
        let file = self.file.as_ref().cloned().expect("windowed DB has a file");
        let w = self.window.as_mut().expect("windowed DB has a window");
        Ok(w.get(&file, p, npages, 0, 0)? as *mut ChunkHeader)
    }

    /// Grow the directory to `new_dirshift`, and/or the file to
    /// `new_num_pages`. Zero arguments keep the current values. Requires
    /// the DB lock.
    pub(crate) fn resize(&mut self, new_dirshift: u8, new_num_pages: u32) -> Result<()> {
        let old_num_pages = self.num_pages;
        let old_dirshift = self.dir_shift;

        let new_dirshift = if new_dirshift == 0 {
            old_dirshift
        } else {
            new_dirshift
        };
        let mut new_num_pages = if new_num_pages == 0 {
            old_num_pages + num_dir_pages(self.pagesize, new_dirshift)
        } else {
            new_num_pages
        };
        let new_dirwidth = dir_width(new_dirshift);
        if new_dirwidth > new_num_pages {
            new_num_pages = new_dirwidth;
        }
        if new_dirshift <= old_dirshift && new_num_pages <= old_num_pages {
            return Ok(());
        }
        if new_num_pages > old_num_pages {
            let max_pages = self.hdr().max_pages;
            if max_pages != 0 && new_num_pages > max_pages {
                return Err(DbError::NoMemory(format!(
                    "resize to {new_num_pages} pages exceeds limit {max_pages}"
                )));
            }
            self.resize_db(new_num_pages)?;
            new_num_pages = self.num_pages;
        }
        if new_dirshift == old_dirshift {
            return Ok(());
        }
        debug!(
            old_shift = old_dirshift,
            new_shift = new_dirshift,
            num_pages = new_num_pages,
            "growing directory"
        );

        let old_dirpages = num_dir_pages(self.pagesize, old_dirshift);
        let old_dirsize = dir_bytes(old_dirshift);
        let old_ptsize = dir_width(old_dirshift) as usize * PT_ENTRY_SIZE;

        let new_dirpages = num_dir_pages(self.pagesize, new_dirshift);
        let new_dirsize = dir_bytes(new_dirshift);
        let new_ptsize = dir_width(new_dirshift) as usize * PT_ENTRY_SIZE;

        self.protect_dir(false)?;

        if new_dirpages > old_dirpages {
            if let Err(e) = self.grow_chunk(0, new_dirpages) {
                self.protect_dir(true)?;
                return Err(e);
            }
        }

        // A windowed handle pins only the directory region; widen the
        // pinned mapping before sliding structures into the new space.
        if self.windowed {
            let needed = CHUNK_HEADER_SIZE + crate::format::HDR_SIZE + new_dirsize + new_ptsize;
            if needed > self.region.len() {
                let file = self.file.as_ref().cloned().expect("windowed DB has a file");
                let syspg = crate::map::sys_page_size();
                let mapsz = (needed + syspg - 1) & !(syspg - 1);
                self.region =
                    std::sync::Arc::new(crate::map::MappedRegion::map_rw(&file, mapsz)?);
                self.publish_map();
            }
        }

        if new_dirsize > old_dirsize {
            // Slide the page table up past the widened directory, then
            // zero the added directory bits.
            let old_pt = self.ptable_ptr_for_shift(old_dirshift) as *mut u8;
            let new_pt = self.ptable_ptr_for_shift(new_dirshift) as *mut u8;
            // SAFETY: both ranges are inside the (grown) directory chunk;
            // copy handles the overlap.
            unsafe {
                std::ptr::copy(old_pt, new_pt, old_ptsize);
                std::ptr::write_bytes(self.dir_bits_ptr().add(old_dirsize), 0, new_dirsize - old_dirsize);
            }
        }
        // Zero the added portion of the page table.
        // SAFETY: the new page table span is inside the directory chunk.
        unsafe {
            let pt = self.ptable_ptr_for_shift(new_dirshift) as *mut u8;
            std::ptr::write_bytes(pt.add(old_ptsize), 0, new_ptsize - old_ptsize);
        }

        self.hdr_mut().dir_shift = new_dirshift;
        self.dir_shift = new_dirshift;
        self.max_dirbit = hash_mask(new_dirshift as u32);
        self.sync_dir();

        self.protect_dir(true)?;
        Ok(())
    }

    /// Pre-create `pages` logical pages on an empty DB, marking the
    /// directory perfect so initial load takes no splits.
    pub fn pre_split(&mut self, pages: u32) -> Result<()> {
        self.enter_op()?;
        if pages < 1 || pages > MAX_NUM_PAGES {
            return Err(DbError::InvalidArg(format!("bad page count {pages}")));
        }
        if self.count_records()? > 0 {
            return Err(DbError::InvalidArg("pre_split requires an empty DB".into()));
        }

        self.lock_db()?;
        let r = self.pre_split_locked(pages);
        self.unlock_db();
        r
    }

    fn pre_split_locked(&mut self, pages: u32) -> Result<()> {
        let mut dir_shift: u8 = 0;
        let mut n: u32 = 1;
        while n <= pages {
            dir_shift += 1;
            n <<= 1;
        }
        dir_shift = dir_shift.saturating_sub(1);

        let extra = num_dir_pages(self.pagesize, dir_shift);
        self.resize(dir_shift, pages + extra)?;

        // All parent nodes of the now-full trie are split.
        let init_bytes = (self.max_dirbit / 8) as usize;
        let init_bits = self.max_dirbit % 8;
        // SAFETY: the directory bits are mapped and sized for dir_shift.
        unsafe {
            let dir = self.dir_bits_ptr();
            if init_bytes > 0 {
                std::ptr::write_bytes(dir, 0xff, init_bytes);
            }
            if init_bits > 0 {
                let mut b: u8 = 0;
                for i in 0..init_bits {
                    b |= 1 << i;
                }
                *dir.add(init_bytes) = b;
            }
        }
        self.hdr_mut().dbflags |= HFLAG_PERFECT;
        self.hdr_mut().dir_gen += 1;
        self.sync_dir();

        // Lay out one data chunk per unassigned logical page.
        let last = self.hdr().last_chunk;
        let last_ptr = self.map_chunk(last)?;
        // SAFETY: map_chunk returned a live chunk mapping.
        let mut prev_npages = unsafe { (*last_ptr).num_pages() };
        self.release_chunk(last_ptr);
        let mut p = last + prev_npages;
        for logical in 0..=self.max_dirbit {
            if self.pt_get(logical) != 0 {
                continue;
            }
            let page = self.map_chunk_fresh(p, 1)?;
            // SAFETY: p is inside the resized file; one page mapped.
            unsafe {
                (*page).init(ChunkType::Data, logical, 1, prev_npages);
                let sentinel = (page as *mut u8).add(CHUNK_HEADER_SIZE) as *mut EntryDesc;
                (*sentinel).init_sentinel(self.pagesize);
            }
            self.pt_set(logical, p);
            self.release_chunk(page);
            prev_npages = 1;
            p += 1;
        }
        self.hdr_mut().last_chunk = p - 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::DbOptions;

    #[test]
    fn test_perfect_hash_uses_low_bits() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbOptions::new()
            .create(true)
            .initial_size(8 * 4096)
            .open(dir.path().join("t.db"))
            .unwrap();
        // Freshly pre-split DB is perfect with 8 leaves.
        let info = db.info();
        assert_eq!(info.dir_shift, 3);
        for h in [0u32, 1, 5, 7, 0xffff_fff8] {
            assert_eq!(db.hash_to_logical_page(h), h & 7);
        }
    }

    #[test]
    fn test_single_page_db_maps_everything_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbOptions::new()
            .create(true)
            .open(dir.path().join("t.db"))
            .unwrap();
        assert_eq!(db.info().dir_shift, 0);
        for h in [0u32, 1, 0xdead_beef] {
            assert_eq!(db.hash_to_logical_page(h), 0);
        }
    }
}
