// Chunk allocator. The file is a sequence of variable-length chunks
// chained by adjacency; free chunks form a singly linked list in
// ascending physical order, coalesced on free. Allocation walks the free
// list (exact fit first, then best fit), extends the tail, grows the
// file, and as a last resort defragments.
//
// Callers hold the internal allocator lock across every mutation here.

mod defrag;

use bytemuck::Zeroable;
use tracing::{debug, warn};

use crate::common::PhysPage;
use crate::db::Db;
use crate::error::{DbError, Result};
use crate::format::{ChunkHeader, ChunkType};

impl Db {
    /// Copy out the chunk header at `p`.
    pub(crate) fn chunk_hdr(&mut self, p: PhysPage) -> Result<ChunkHeader> {
        let ptr = self.map_chunk_fresh(p, 1)?;
        // SAFETY: one page including the header is mapped.
        let h = unsafe { *ptr };
        self.release_chunk(ptr);
        Ok(h)
    }

    /// Update the chunk header at `p` in place.
    pub(crate) fn chunk_update<F: FnOnce(&mut ChunkHeader)>(
        &mut self,
        p: PhysPage,
        f: F,
    ) -> Result<()> {
        let ptr = self.map_chunk_fresh(p, 1)?;
        // SAFETY: one page including the header is mapped.
        unsafe { f(&mut *ptr) };
        self.release_chunk(ptr);
        Ok(())
    }

    /// Carve `npages` off the free chunk at `n` and unlink it from the
    /// free list. `prev` is the free-list predecessor (0 for the head);
    /// None makes this function find it.
    fn alloc_free_chunk(&mut self, npages: u32, n: PhysPage, prev: Option<PhysPage>) -> Result<()> {
        debug_assert!(n <= self.hdr().last_chunk);
        let prev = match prev {
            Some(p) => p,
            None => {
                let mut prev = 0;
                let mut p = self.hdr().first_free;
                while p != 0 && p != n {
                    prev = p;
                    p = self.chunk_hdr(p)?.next_free();
                }
                prev
            }
        };

        let page = self.chunk_hdr(n)?;
        debug_assert!(page.is_type(ChunkType::Free));
        if page.num_pages() > npages {
            // Split: the tail stays free, spliced in at the same position.
            let n1 = n + npages;
            let n1pages = page.num_pages() - npages;
            self.chunk_update(n1, |h| {
                h.init(ChunkType::Free, 0, n1pages, npages);
                h.data = page.next_free();
            })?;
            self.chunk_update(n, |h| {
                h.data = n1;
                h.set_num_pages(npages);
            })?;
            if n == self.hdr().last_chunk {
                self.hdr_mut().last_chunk = n + npages;
            } else {
                self.chunk_update(n1 + n1pages, |h| h.set_prev_num_pages(n1pages))?;
            }
        }
        let next = self.chunk_hdr(n)?.next_free();
        if prev != 0 {
            self.chunk_update(prev, |h| h.data = next)?;
        } else {
            self.hdr_mut().first_free = next;
        }
        Ok(())
    }

    /// First pass of allocation: walk the ascending free list for an
    /// exact fit, falling back to the smallest larger chunk. Returns the
    /// claimed chunk (0 = none) and the total free pages seen.
    fn find_free_chunk(
        &mut self,
        npages: u32,
        avoid: Option<(PhysPage, PhysPage)>,
    ) -> Result<(PhysPage, u32)> {
        let mut best: PhysPage = 0;
        let mut best_prev: PhysPage = 0;
        let mut best_pages = self.num_pages;
        let mut num_free = 0u32;
        let mut prev: PhysPage = 0;

        let mut n = self.hdr().first_free;
        while n > 0 {
            let page = self.chunk_hdr(n)?;
            if page.num_pages() == 0 {
                panic!("chunk walk hit zero-length chunk at {n}");
            }
            let eligible = match avoid {
                None => true,
                Some((n0, n1)) => n + page.num_pages() <= n0 || n > n1,
            };
            if eligible {
                if page.num_pages() == npages {
                    self.alloc_free_chunk(npages, n, Some(prev))?;
                    return Ok((n, num_free));
                }
                num_free += page.num_pages();
                if page.num_pages() > npages && page.num_pages() < best_pages {
                    best_prev = prev;
                    best = n;
                    best_pages = page.num_pages();
                }
            }
            if page.next_free() == n {
                return Err(DbError::Corrupt(format!(
                    "free list loops at chunk {n}"
                )));
            }
            prev = n;
            n = page.next_free();
        }
        if best != 0 {
            self.alloc_free_chunk(npages, best, Some(best_prev))?;
            return Ok((best, num_free));
        }
        Ok((0, num_free))
    }

    /// Allocate a zeroed-header chunk of `npages` pages. The caller holds
    /// the internal lock and keeps it on success.
    pub(crate) fn alloc_chunk(
        &mut self,
        t: ChunkType,
        npages: u32,
        avoid: Option<(PhysPage, PhysPage)>,
    ) -> Result<PhysPage> {
        self.alloc_chunk_inner(t, npages, avoid, false)
    }

    /// Like `alloc_chunk`, but on failure the internal lock is released
    /// (and a transient upgrade to the whole-DB lock is allowed for
    /// defragmentation).
    pub(crate) fn alloc_chunk_can_unlock(
        &mut self,
        t: ChunkType,
        npages: u32,
        avoid: Option<(PhysPage, PhysPage)>,
    ) -> Result<PhysPage> {
        self.alloc_chunk_inner(t, npages, avoid, true)
    }

    fn alloc_chunk_inner(
        &mut self,
        t: ChunkType,
        npages: u32,
        avoid: Option<(PhysPage, PhysPage)>,
        can_unlock: bool,
    ) -> Result<PhysPage> {
        let mut lock_upgraded = false;
        let n = loop {
            let (n, tot_free) = self.find_free_chunk(npages, avoid)?;
            if n != 0 {
                break n;
            }

            // Nothing on the free list; try the unused tail.
            let last = self.hdr().last_chunk;
            let last_pages = self.chunk_hdr(last)?.num_pages();
            if last + last_pages + npages <= self.hdr().num_pages {
                let n = last + last_pages;
                self.chunk_update(n, |h| {
                    *h = ChunkHeader::zeroed();
                    h.set_prev_num_pages(last_pages);
                })?;
                self.hdr_mut().last_chunk = n;
                break n;
            }

            if avoid.is_some() {
                // Relocation allocations must not recurse into resize.
                return self.alloc_fail(can_unlock, lock_upgraded, npages);
            }

            match self.resize(0, last + last_pages + npages) {
                Ok(()) => continue,
                Err(_) if tot_free >= npages => {
                    // The free space exists but is fragmented. Defrag
                    // needs the whole DB.
                    if !self.is_owned() {
                        if !can_unlock {
                            return self.alloc_fail(can_unlock, lock_upgraded, npages);
                        }
                        self.unlock_internal();
                        self.lock_db()?;
                        if let Err(e) = self.lock_internal() {
                            self.unlock_db();
                            return Err(e);
                        }
                        lock_upgraded = true;
                    }
                    match self.find_defrag_free_chunk(npages) {
                        Ok(n) => break n,
                        Err(_) => return self.alloc_fail(can_unlock, lock_upgraded, npages),
                    }
                }
                Err(_) => return self.alloc_fail(can_unlock, lock_upgraded, npages),
            }
        };

        let prev_pages = self.chunk_hdr(n)?.prev_num_pages();
        self.chunk_update(n, |h| h.init(t, n, npages, prev_pages))?;
        debug!(chunk = n, npages, ?t, "allocated chunk");

        if lock_upgraded {
            self.unlock_db();
        }
        Ok(n)
    }

    fn alloc_fail(
        &mut self,
        can_unlock: bool,
        lock_upgraded: bool,
        npages: u32,
    ) -> Result<PhysPage> {
        if can_unlock {
            self.unlock_internal();
        }
        if lock_upgraded {
            self.unlock_db();
        }
        Err(DbError::NoMemory(format!(
            "no room for a {npages}-page chunk"
        )))
    }

    /// Free the chunk at `pagenum`: mark FREE, insert into the ascending
    /// free list, coalesce with adjacent free chunks, and keep the last
    /// chunk non-free. Returns the head of the (possibly merged) free
    /// chunk. `prev_hint` carries the free-list predecessor across
    /// repeated frees in ascending order.
    pub(crate) fn free_chunk(
        &mut self,
        pagenum: PhysPage,
        prev_hint: Option<&mut PhysPage>,
    ) -> Result<PhysPage> {
        assert!(pagenum != 0, "attempt to free the directory chunk");

        let mut npages = self.chunk_hdr(pagenum)?.num_pages();
        if npages == 0 {
            panic!("freeing zero-length chunk {pagenum}");
        }
        self.chunk_update(pagenum, |h| {
            h.set_chunk_type(ChunkType::Free);
            h.set_num(pagenum & 0x00ff_ffff);
        })?;

        // Locate the two preceding free chunks and the following one.
        let mut prevprev: PhysPage = 0;
        let mut prev: PhysPage = 0;
        let mut next = self.hdr().first_free;
        let hint_val = prev_hint.as_deref().copied().unwrap_or(0);
        if hint_val != 0 {
            prevprev = hint_val;
            prev = self.chunk_hdr(prevprev)?.next_free();
            next = self.chunk_hdr(prev)?.next_free();
        }
        while next != 0 && next < pagenum {
            prevprev = prev;
            prev = next;
            next = self.chunk_hdr(next)?.next_free();
        }
        assert!(next != pagenum, "chunk {pagenum} is already on the free list");

        let mut p1 = pagenum;
        if prev != 0 {
            let pprev = self.chunk_hdr(prev)?;
            if prev + pprev.num_pages() == pagenum {
                // Preceding free chunk adjoins: merge.
                let merged = pprev.num_pages() + npages;
                self.chunk_update(prev, |h| h.set_num_pages(merged))?;
                npages = 0;
                if pagenum < self.hdr().last_chunk {
                    self.chunk_update(prev + merged, |h| h.set_prev_num_pages(merged))?;
                } else {
                    debug_assert_eq!(pagenum, self.hdr().last_chunk);
                    self.hdr_mut().last_chunk = prev;
                }
                p1 = prev;
                prev = prevprev;
            }
        }
        if next != 0 {
            let pp1 = self.chunk_hdr(p1)?;
            debug_assert!(pp1.is_type(ChunkType::Free));
            if p1 + pp1.num_pages() == next {
                // Following free chunk adjoins: merge.
                let pnext = self.chunk_hdr(next)?;
                let merged = pp1.num_pages() + pnext.num_pages();
                let next_next = pnext.next_free();
                self.chunk_update(p1, |h| {
                    h.set_num_pages(merged);
                    h.data = next_next;
                })?;
                npages = 0;
                if self.hdr().first_free == next {
                    debug_assert_eq!(prev, 0);
                    self.hdr_mut().first_free = p1;
                } else if prev != 0 {
                    self.chunk_update(prev, |h| h.data = p1)?;
                }
                // The last chunk is never free, so `next` was not last.
                debug_assert!(self.hdr().last_chunk != next);
                self.chunk_update(p1 + merged, |h| h.set_prev_num_pages(merged))?;
            }
        }
        if npages != 0 {
            // Not merged: link into the list.
            if prev != 0 {
                let after = self.chunk_hdr(prev)?.next_free();
                self.chunk_update(pagenum, |h| h.data = after)?;
                self.chunk_update(prev, |h| h.data = pagenum)?;
            } else {
                let head = self.hdr().first_free;
                self.chunk_update(pagenum, |h| h.data = head)?;
                self.hdr_mut().first_free = pagenum;
            }
        }
        if p1 == self.hdr().last_chunk {
            // The last chunk must not be free; retreat it.
            if self.hdr().first_free == p1 {
                debug_assert_eq!(prev, 0);
                self.hdr_mut().first_free = 0;
            } else {
                debug_assert!(prev != 0);
                self.chunk_update(prev, |h| h.data = 0)?;
            }
            let back = self.chunk_hdr(p1)?.prev_num_pages();
            self.hdr_mut().last_chunk = p1 - back;
        }

        if let Some(hint) = prev_hint {
            *hint = prevprev;
        }
        Ok(p1)
    }

    /// Extend the chunk at `pagenum` in place to `npages` total pages.
    pub(crate) fn grow_chunk(&mut self, pagenum: PhysPage, npages: u32) -> Result<()> {
        if pagenum + npages > self.num_pages {
            return Err(DbError::NoMemory(format!(
                "cannot grow chunk {pagenum} to {npages} pages"
            )));
        }
        let cur = self.chunk_hdr(pagenum)?.num_pages();
        if cur >= npages {
            warn!(pagenum, npages, cur, "redundant grow_chunk");
            return Ok(());
        }
        if pagenum == self.hdr().last_chunk {
            self.chunk_update(pagenum, |h| h.set_num_pages(npages))?;
        } else {
            self.clear_pages(pagenum + cur, npages - cur)?;
            self.chunk_update(pagenum, |h| h.set_num_pages(npages))?;
            self.chunk_update(pagenum + npages, |h| h.set_prev_num_pages(npages))?;
        }
        Ok(())
    }

    /// Free every LOB chunk (purge support).
    pub(crate) fn free_large_object_chunks(&mut self) {
        let mut pno: PhysPage = 0;
        let mut prev: PhysPage = 0;
        while pno <= self.hdr().last_chunk {
            let Ok(page) = self.chunk_hdr(pno) else { break };
            let step = page.num_pages().max(1);
            if page.is_type(ChunkType::Lob) {
                let _ = self.free_chunk(pno, Some(&mut prev));
            }
            pno += step;
        }
    }
}
