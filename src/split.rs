// Directory split: when a store cannot fit on its page, grow the hash by
// one bit for that subtree and move the entries whose split bit is set
// into a fresh sibling page. The inverse, tree compression, folds sibling
// pairs back together and halves the directory.

use tracing::{debug, warn};

use crate::common::{align_len, hash_mask, HashVal, LogicalPage};
use crate::db::Db;
use crate::dir::PageAlloc;
use crate::error::{DbError, Result};
use crate::format::{EntryDesc, HFLAG_PERFECT};
use crate::page::PageView;

impl Db {
    /// Split the page `hashval` currently lands on. Requires whole-DB
    /// ownership; returns `WouldBlock` when the caller holds less (store
    /// upgrades and retries). On success returns the logical page the
    /// hash now maps to.
    pub(crate) fn split_page(&mut self, hashval: HashVal) -> Result<LogicalPage> {
        // Find the hash's current depth.
        let mut hv = hashval;
        let mut dirbit = 0u32;
        let mut hashbit = 0u32;
        while dirbit < self.max_dirbit && self.dir_bit(dirbit) {
            dirbit = (dirbit << 1) + (hv & 1) + 1;
            hashbit += 1;
            hv >>= 1;
        }

        let pagenum = hashval & hash_mask(hashbit);
        let newpagenum = pagenum | (1 << hashbit);

        if newpagenum > self.max_dirbit
            && self.max_dir_shift != 0
            && self.dir_shift >= self.max_dir_shift
        {
            return Err(DbError::NoMemory(format!(
                "directory capped at shift {}",
                self.max_dir_shift
            )));
        }
        if !self.is_owned() {
            // Splits mutate a sibling page that is almost always in a
            // different partition.
            return Err(DbError::WouldBlock);
        }

        debug!(pagenum, newpagenum, "splitting page");

        if newpagenum > self.max_dirbit {
            if self.max_dir_shift != 0 && self.dir_shift >= self.max_dir_shift {
                return Err(DbError::NoMemory("directory at maximum shift".into()));
            }
            if let Err(e) = self.resize(self.dir_shift + 1, 0) {
                self.max_dir_shift = self.dir_shift;
                return Err(e);
            }
        }

        // Allocate the sibling first: allocation may remap, which would
        // invalidate a pointer to the source page.
        let newpage = self
            .pagenum_to_page(newpagenum, PageAlloc::Alloc)?
            .ok_or_else(|| DbError::NoMemory("cannot allocate sibling page".into()))?;
        let page = self
            .pagenum_to_page(pagenum, PageAlloc::Exists)?
            .expect("Exists always yields a page");

        let view = self.view(page);
        let new_view = self.view(newpage);
        if view.num_pages() > 1 {
            // Oversized source pages do not split.
            return Err(DbError::NoMemory("oversized page cannot split".into()));
        }

        let hvbit = 1u32 << hashbit;
        let mut moved = 0u32;
        let mut i = 0u32;
        while i < view.num_entries() {
            let e = view.entry(i);
            if !e.is_tombstone() {
                let h = (self.hash_fn)(view.key_bytes(i));
                if h & hvbit != 0 {
                    self.copy_entry_raw(&view, i, &new_view)?;
                    if e.is_large_obj() {
                        let rec = self.lob_record(&view, i);
                        self.chunk_update(rec.pagenum(), |h| h.set_num(newpagenum))?;
                        // Clear the flag so deleting the source entry
                        // does not free the moved LOB chunk.
                        let mut cleared = view.entry(i);
                        cleared.flag_clear(crate::format::EFLAG_LARGEOBJ);
                        view.set_entry(i, cleared);
                    }
                    self.del_entry(page, i)?;
                    moved += 1;
                }
            }
            i += 1;
        }
        debug!(pagenum, newpagenum, moved, "split moved entries");

        self.set_dir_bit(dirbit);
        self.hdr_mut().dbflags &= !HFLAG_PERFECT;
        self.hdr_mut().dir_gen += 1;
        self.sync_dir();
        self.release_chunk(page);
        self.release_chunk(newpage);

        Ok(if hashval & hvbit != 0 {
            newpagenum
        } else {
            pagenum
        })
    }

    /// Append a raw copy of `src[i]` (descriptor flags, key, value bytes,
    /// cache metadata and padding included) to `dst`.
    pub(crate) fn copy_entry_raw(
        &self,
        src: &PageView,
        i: u32,
        dst: &PageView,
    ) -> Result<()> {
        let e = src.entry(i);
        let kvsize = src.kvsize(i);
        let esize = kvsize + crate::format::ENTRY_SIZE as u32;
        if (esize as i64) > dst.free_bytes() {
            return Err(DbError::NoMemory(format!(
                "entry of {esize} bytes does not fit the destination page"
            )));
        }
        let ksize = align_len(self.align_mask, e.key_len());
        let idx = dst.num_entries();
        let bottom = dst.bottom_of_data();

        let mut new_e = EntryDesc::zeroed_entry();
        new_e.match_word = e.match_word;
        new_e.set_flags(e.flags());
        new_e.set_offset(bottom - ksize);
        dst.set_entry(idx, new_e);

        dst.bytes_mut(bottom - kvsize, kvsize)
            .copy_from_slice(src.bytes(src.val_offset(i), kvsize));

        dst.set_num_entries(idx + 1);
        dst.init_sentinel(idx + 1, bottom - kvsize);
        Ok(())
    }

    /// Fold sibling page pairs together and halve the directory wherever
    /// every pair fits in one page; then compact the file.
    pub fn compress_tree(&mut self) -> Result<()> {
        self.enter_op()?;
        if self.memory_only || self.windowed {
            return Err(DbError::InvalidArg(
                "tree compression is unsupported for memory-only and windowed handles".into(),
            ));
        }
        self.lock_db()?;
        let r = self.merge_all_pages();
        self.unlock_db();
        if r? {
            self.compact_db()?;
        }
        Ok(())
    }

    /// Returns whether any level folded (and compaction is worthwhile).
    fn merge_all_pages(&mut self) -> Result<bool> {
        let bits = self.max_dirbit;
        let mut lvl: u32 = 1;
        while lvl <= bits >> 1 {
            lvl <<= 1;
        }

        let mut do_sync = false;
        let mut do_compact = false;

        while lvl >= 1 {
            let halfpages = lvl;
            // Verify every pair on this level can fold before moving
            // anything.
            let mut can_fold = true;
            for left in 0..halfpages {
                let right = left + halfpages;
                if right > self.max_dirbit {
                    can_fold = false;
                    break;
                }
                let lp = self.pt_get(left);
                let rp = self.pt_get(right);
                if lp == 0 || rp == 0 {
                    can_fold = false;
                    break;
                }
                let src = self.view_of(rp)?;
                let dst = self.view_of(lp)?;
                if src.num_pages() != 1 || dst.num_pages() != 1 {
                    // Oversized pages do not fold.
                    can_fold = false;
                    break;
                }
                src.wring();
                dst.wring();
                let avail = dst.free_bytes();
                let need = self.pagesize as i64 - src.free_bytes();
                if need >= avail || need < 0 || avail < 0 {
                    can_fold = false;
                    break;
                }
            }
            if !can_fold {
                break;
            }

            let mut failed = false;
            for left in 0..halfpages {
                let right = left + halfpages;
                let lp = self.pt_get(left);
                let rp = self.pt_get(right);
                if lp == rp {
                    continue;
                }
                if rp >= self.num_pages || right > self.max_dirbit {
                    continue;
                }
                match self.merge_page(left, right) {
                    Ok(()) => {
                        do_sync = true;
                        self.pt_set(right, lp);
                        self.clear_dir_bit(right);
                        self.dir_perfect = false;
                        self.lock_internal()?;
                        let fr = self.free_chunk(rp, None);
                        self.unlock_internal();
                        fr?;
                        debug_assert!(self.dir_bit(left) || self.max_dirbit == 1);
                    }
                    Err(e) => {
                        warn!(left, right, error = %e, "page merge failed");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                break;
            }

            // Drop one directory level: shift down, slide the page table
            // into place.
            do_compact = true;
            let old_shift = self.dir_shift;
            let new_shift = old_shift - 1;
            let new_ptsize =
                crate::common::dir_width(new_shift) as usize * crate::format::PT_ENTRY_SIZE;
            let old_pt = self.ptable_ptr_for_shift(old_shift) as *mut u8;
            let new_pt = self.ptable_ptr_for_shift(new_shift) as *mut u8;
            // SAFETY: both ranges are inside the directory chunk; the
            // move is downward and may overlap.
            unsafe {
                std::ptr::copy(old_pt, new_pt, new_ptsize);
            }
            self.dir_shift = new_shift;
            self.max_dirbit >>= 1;
            self.hdr_mut().dir_shift = new_shift;
            self.hdr_mut().dir_gen += 1;
            self.sync_dir();
            // While folding further levels the halved directory is full.
            self.dir_perfect = true;

            if lvl == 1 {
                break;
            }
            lvl >>= 1;
        }

        if do_sync {
            self.hdr_mut().dir_gen += 1;
            self.sync_dir();
        }
        Ok(do_compact)
    }

    fn view_of(&mut self, phys: u32) -> Result<PageView> {
        let ptr = self.map_chunk(phys)?;
        Ok(self.view(ptr))
    }

    /// Move every live entry of logical page `src_index` onto
    /// `dest_index`'s page. The destination was pre-checked to fit.
    fn merge_page(&mut self, dest_index: LogicalPage, src_index: LogicalPage) -> Result<()> {
        let sp = self.pt_get(src_index);
        let dp = self.pt_get(dest_index);
        let src = self.view_of(sp)?;
        let dst = self.view_of(dp)?;
        if src.raw() == dst.raw() {
            return Ok(());
        }

        let old_count = dst.num_entries();
        let old_bottom = dst.bottom_of_data();
        let mut i = 0u32;
        let r = loop {
            if i >= src.num_entries() {
                break Ok(());
            }
            let e = src.entry(i);
            if !e.is_tombstone() {
                if let Err(e2) = self.copy_entry_raw(&src, i, &dst) {
                    break Err(e2);
                }
                if e.is_large_obj() {
                    let rec = self.lob_record(&src, i);
                    self.chunk_update(rec.pagenum(), |h| h.set_num(dest_index))?;
                }
            }
            i += 1;
        };
        if r.is_err() {
            // Unroll: drop the entries appended so far.
            dst.set_num_entries(old_count);
            dst.init_sentinel(old_count, old_bottom);
        }
        r
    }
}

impl EntryDesc {
    fn zeroed_entry() -> EntryDesc {
        bytemuck::Zeroable::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use crate::db::DbOptions;
    use crate::ops::{StoreMode, StoreOptions};

    #[test]
    fn test_compress_tree_after_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut db = DbOptions::new()
            .create(true)
            .pagesize(1024)
            .open(&path)
            .unwrap();

        // Force splits by filling, then delete down to a handful.
        let mut keys = Vec::new();
        for i in 0u64..200 {
            let k = i.to_le_bytes();
            db.store(&k, &[7u8; 32], &StoreOptions::mode(StoreMode::Insert))
                .unwrap();
            keys.push(k);
        }
        assert!(db.info().dir_shift > 0);
        for k in &keys[5..] {
            db.delete(k).unwrap();
        }

        db.compress_tree().unwrap();
        let info = db.info();
        assert_eq!(info.dir_shift, 0);
        // Survivors still fetch to the same values.
        for k in &keys[..5] {
            assert_eq!(db.fetch(k).unwrap(), vec![7u8; 32]);
        }
    }
}
