// Defragmentation: clearing a window of chunks by relocating them, the
// search for the cheapest window to clear, and whole-file compaction
// toward the low end. The directory chunk never moves.

use tracing::{debug, warn};

use crate::common::{pages_rounded_up, LogicalPage, PhysPage};
use crate::db::Db;
use crate::dir::PageAlloc;
use crate::error::{DbError, Result};
use crate::format::{ChunkHeader, ChunkType};

impl Db {
    /// Re-point the in-page LOB record on `data_page` from `lob_page` to
    /// `new_lob_page` after a LOB chunk moved.
    pub(crate) fn fixup_lob_pointer(
        &mut self,
        data_page: LogicalPage,
        lob_page: PhysPage,
        new_lob_page: PhysPage,
    ) -> Result<()> {
        let page = self
            .pagenum_to_page(data_page, PageAlloc::Exists)?
            .expect("Exists always yields a page");
        let view = self.view(page);
        for i in 0..view.num_entries() {
            let e = view.entry(i);
            if !e.is_tombstone() && e.is_large_obj() {
                let mut rec = self.lob_record(&view, i);
                if rec.pagenum() == lob_page {
                    rec.set_pagenum(new_lob_page);
                    self.set_lob_record(&view, i, rec);
                    self.release_chunk(page);
                    return Ok(());
                }
            }
        }
        self.release_chunk(page);
        Err(DbError::Corrupt(format!(
            "no LOB record on page {data_page} points at chunk {lob_page}"
        )))
    }

    /// Clear `[p0, p0+npages)` by relocating every live chunk inside it,
    /// then claim the window as a single placeholder chunk. Returns the
    /// (possibly lower, after coalescing) start of the cleared window.
    pub(crate) fn clear_pages(&mut self, p0: PhysPage, npages: u32) -> Result<PhysPage> {
        let mut p0 = p0;
        let p1 = p0 + npages - 1;
        let mut prev: PhysPage = 0;

        if p1 >= self.num_pages {
            return Err(DbError::NoMemory(format!(
                "clear window [{p0}, {p1}] beyond {} pages",
                self.num_pages
            )));
        }

        let mut n = p0;
        while n <= p1 && n <= self.hdr().last_chunk {
            let hdr = self.chunk_hdr(n)?;
            if hdr.num_pages() == 0 {
                panic!("chunk walk hit zero-length chunk at {n}");
            }
            let mut step = hdr.num_pages();
            if !hdr.is_type(ChunkType::Free) {
                let ctype = hdr.chunk_type().ok_or_else(|| {
                    DbError::Corrupt(format!("chunk {n} has an invalid type"))
                })?;
                if ctype == ChunkType::Dir {
                    return Err(DbError::Corrupt(
                        "defrag window includes the directory chunk".into(),
                    ));
                }
                let new = self.alloc_chunk(ctype, hdr.num_pages(), Some((p0, p1)))?;
                self.relocate_chunk(n, new, hdr.num_pages())?;
                match ctype {
                    ChunkType::Data => self.pt_set(hdr.num(), new),
                    ChunkType::Lob => self.fixup_lob_pointer(hdr.num(), n, new)?,
                    _ => {}
                }
                let merged = self.free_chunk(n, Some(&mut prev))?;
                n = merged;
                if n < p0 {
                    p0 = n;
                }
                step = self.chunk_hdr(n)?.num_pages();
            }
            n += step;
        }

        if p0 > self.hdr().last_chunk {
            // The window is past every chunk: claim it off the tail.
            let last = self.hdr().last_chunk;
            let last_pages = self.chunk_hdr(last)?.num_pages();
            debug_assert_eq!(p0, last + last_pages);
            self.chunk_update(p0, |h| h.init(ChunkType::Data, 0, npages, last_pages))?;
            self.hdr_mut().last_chunk = p0;
        } else {
            self.alloc_free_chunk(npages, p0, None)?;
            self.chunk_update(p0, |h| {
                h.set_chunk_type(ChunkType::Data);
                h.set_num_pages(npages);
            })?;
        }
        Ok(p0)
    }

    /// Byte-copy a chunk's contents to its replacement, preserving the
    /// replacement's backlink.
    fn relocate_chunk(&mut self, from: PhysPage, to: PhysPage, npages: u32) -> Result<()> {
        let len = npages as usize * self.pagesize as usize;
        let src = self.map_chunk(from)?;
        let dst = self.map_chunk_fresh(to, npages)?;
        let new_prev = self.chunk_hdr(to)?.prev_num_pages();
        // SAFETY: both chunks are mapped for npages; distinct chunks, so
        // the ranges do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
            (*dst).set_prev_num_pages(new_prev);
        }
        self.release_chunk(src);
        self.release_chunk(dst);
        debug!(from, to, npages, "relocated chunk");
        Ok(())
    }

    /// Find and clear the cheapest window of `npages` adjacent pages:
    /// first any run of free and single-page chunks, then windows around
    /// free chunks minimizing the largest and total moved chunk sizes.
    pub(crate) fn find_defrag_free_chunk(&mut self, npages: u32) -> Result<PhysPage> {
        // Cheap pass: a run of free/one-page chunks low in the file.
        {
            let mut got = 0u32;
            let mut start: PhysPage = 0;
            let mut n = self.chunk_hdr(0)?.num_pages();
            while got < npages && n <= self.hdr().last_chunk {
                let h = self.chunk_hdr(n)?;
                let num = h.num_pages().max(1);
                if (!h.is_type(ChunkType::Free) && num > 1) || h.is_type(ChunkType::Dir) {
                    got = 0;
                } else {
                    if got == 0 {
                        start = n;
                    }
                    got += num;
                }
                n += num;
            }
            if got >= npages {
                if let Ok(p) = self.clear_pages(start, npages) {
                    return Ok(p);
                }
            }
        }

        // Costed pass: grow a window around each free chunk, preferring
        // windows that move the least data.
        let mut best_moved = self.num_pages;
        let mut best_maxmove = self.num_pages;
        let mut best_n0: PhysPage = 0;

        let mut n = self.hdr().first_free;
        while n > 0 {
            let mut got = 0u32;
            let mut n0 = n;
            let mut n1 = n;
            let mut n0p: Option<ChunkHeader> = Some(self.chunk_hdr(n)?);
            let mut moved = 0u32;
            let mut maxmove = 0u32;

            while got < npages {
                let n0pnew = match &n0p {
                    Some(h) if !h.is_type(ChunkType::Dir) && h.prev_num_pages() > 0 => {
                        Some(self.chunk_hdr(n0 - h.prev_num_pages())?)
                    }
                    _ => None,
                };
                let n1pnew = if n1 <= self.hdr().last_chunk {
                    Some(self.chunk_hdr(n1)?)
                } else {
                    if n1 < self.num_pages {
                        got += self.num_pages - n1;
                        n1 = self.num_pages;
                        if got >= npages {
                            break;
                        }
                    }
                    None
                };

                let take_lower = match (&n0pnew, &n1pnew) {
                    (Some(_), None) => true,
                    (Some(lo), Some(hi)) => {
                        lo.is_type(ChunkType::Free)
                            || (got + hi.num_pages() > npages
                                && lo.num_pages() < hi.num_pages())
                            || lo.num_pages() >= hi.num_pages()
                    }
                    _ => false,
                };

                if take_lower {
                    let lo = n0pnew.expect("checked above");
                    n0 -= lo.num_pages();
                    got += lo.num_pages();
                    if !lo.is_type(ChunkType::Free) {
                        maxmove = maxmove.max(lo.num_pages());
                        moved += lo.num_pages();
                    }
                    n0p = Some(lo);
                } else if let Some(hi) = n1pnew {
                    got += hi.num_pages();
                    n1 += hi.num_pages();
                    if !hi.is_type(ChunkType::Free) {
                        maxmove = maxmove.max(hi.num_pages());
                        moved += hi.num_pages();
                    }
                } else {
                    break;
                }
            }

            if got >= npages
                && (maxmove < best_maxmove || (maxmove == best_maxmove && moved < best_moved))
            {
                best_moved = moved;
                best_maxmove = maxmove;
                best_n0 = n0;
                if moved == 1 || got == npages {
                    break;
                }
            }
            let next = self.chunk_hdr(n)?.next_free();
            debug_assert!(next > n || next == 0);
            n = next;
        }

        if best_n0 == 0 {
            return Err(DbError::NoMemory(format!(
                "no defraggable window of {npages} pages"
            )));
        }
        debug!(start = best_n0, npages, moved = best_moved, "defragmenting");
        self.clear_pages(best_n0, npages)
    }

    /// Slide every live chunk toward the low end of the file, truncate
    /// the resulting free tail, and shrink the mapping. Requires nothing
    /// held; takes the DB lock itself.
    pub fn compact_db(&mut self) -> Result<()> {
        self.enter_op()?;
        if self.memory_only || self.windowed {
            return Err(DbError::InvalidArg(
                "compaction is unsupported for memory-only and windowed handles".into(),
            ));
        }
        self.lock_db()?;
        let r = self.compact_locked();
        self.unlock_db();
        r
    }

    fn compact_locked(&mut self) -> Result<()> {
        let mut merge = false;
        let mut compacted = false;

        loop {
            let cur = self.hdr().first_free;
            if cur == 0 {
                break;
            }
            let curp = self.chunk_hdr(cur)?;
            let cur_pages = curp.num_pages();
            if cur + cur_pages >= self.num_pages {
                compacted = true;
                break;
            }
            let next = cur + cur_pages;
            let nextp = self.chunk_hdr(next)?;

            match nextp.chunk_type() {
                Some(ChunkType::Free) => {
                    if next > self.hdr().last_chunk && nextp.num_pages() == 0 {
                        // Zero-length free region past the last chunk, as
                        // written by some other implementations. Tolerate.
                        compacted = true;
                        break;
                    }
                    if !merge {
                        return Err(DbError::Corrupt(format!(
                            "uncoalesced free chunk at {next}"
                        )));
                    }
                    let merged = cur_pages + nextp.num_pages();
                    let next_next_free = nextp.next_free();
                    self.chunk_update(cur, |h| {
                        h.set_num_pages(merged);
                        h.data = next_next_free;
                    })?;
                    let nextnext = next + nextp.num_pages();
                    if nextnext >= self.num_pages {
                        compacted = true;
                        break;
                    }
                    self.chunk_update(nextnext, |h| h.set_prev_num_pages(merged))?;
                    merge = false;
                }
                Some(ChunkType::Data) | Some(ChunkType::Lob) => {
                    let is_lob = nextp.is_type(ChunkType::Lob);
                    let next_count = nextp.num_pages();
                    let next_sz = next_count as usize * self.pagesize as usize;
                    let nextnext = next + next_count;

                    let old_free = curp;
                    let old_data = nextp;
                    // Where the free chunk lands after the swap.
                    let nu = cur + next_count;

                    // SAFETY: whole-file mapping (windowed mode was
                    // rejected); both ranges are in bounds and may
                    // overlap, copy handles that.
                    unsafe {
                        let base = self.base();
                        std::ptr::copy(
                            base.add(next as usize * self.pagesize as usize),
                            base.add(cur as usize * self.pagesize as usize),
                            next_sz,
                        );
                    }
                    self.chunk_update(nu, |h| {
                        *h = old_free;
                        h.set_num(nu & 0x00ff_ffff);
                        h.set_prev_num_pages(old_data.num_pages());
                    })?;
                    if self.hdr().first_free == cur {
                        self.hdr_mut().first_free = nu;
                    }
                    self.chunk_update(cur, |h| h.set_prev_num_pages(old_free.prev_num_pages()))?;
                    if nextnext < self.num_pages {
                        let nn = self.chunk_hdr(nextnext)?;
                        if nn.num_pages() != 0 {
                            self.chunk_update(nextnext, |h| {
                                h.set_prev_num_pages(old_free.num_pages())
                            })?;
                        }
                    }
                    if is_lob {
                        self.fixup_lob_pointer(old_data.num(), next, cur)?;
                    } else {
                        self.pt_set(old_data.num(), cur);
                    }
                    if self.hdr().last_chunk == next {
                        self.hdr_mut().last_chunk = nu;
                    }
                    merge = true;
                }
                Some(ChunkType::Dir) | None => {
                    return Err(DbError::Corrupt(format!(
                        "unexpected chunk type after free chunk at {next}"
                    )));
                }
            }
        }

        if compacted && self.hdr().first_free != 0 {
            // A single free tail remains; give the pages back.
            let last_page = self.hdr().first_free;
            let back = self.chunk_hdr(last_page)?.prev_num_pages();
            let last_unfree = last_page - back;

            {
                let hdr = self.hdr_mut();
                hdr.num_pages = last_page;
                hdr.first_free = 0;
                hdr.last_chunk = last_unfree;
                hdr.dir_gen += 1;
            }
            let file = self.file.as_ref().cloned().expect("file-backed");
            let syspg = crate::map::sys_page_size() as u32;
            let new_len = pages_rounded_up(syspg, last_page as u64 * self.pagesize as u64)
                as u64
                * syspg as u64;
            if let Err(e) = file.set_len(new_len) {
                warn!(error = %e, "truncate failed after compaction");
                return Err(e.into());
            }
            self.num_pages = last_page;
            self.internal_remap(new_len)?;
            self.publish_map();
        }
        Ok(())
    }
}
