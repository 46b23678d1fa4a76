use std::fs::File;
use std::os::fd::AsRawFd;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, error};

use crate::common::pages_rounded_up;
use crate::error::{DbError, Result};
use crate::map::sys_page_size;

const FREE_SLOT: i64 = -1;

#[derive(Clone, Copy, Default)]
struct WinSlot {
    /// Physical chunk index mapped at this slot, or FREE_SLOT.
    pagenum: i64,
    /// Slot run length for a head slot; 0 marks a continuation slot.
    num_pages: u32,
    /// Mapped byte range within the chunk (multiples of the system page).
    mapped_off: u32,
    mapped_len: u32,
    /// Operation epoch of the last use; stale slots are reclaimable.
    epoch: u64,
}

/// Rolling window over a file too large to pin whole. A fixed region is
/// mapped at open; chunk requests land in slots whose file backing is
/// switched by fixed-address remapping. Slots for a multi-page chunk are
/// contiguous.
pub struct WindowData {
    base: MmapRaw,
    pagesize: u32,
    num_pages: usize,
    first_free: usize,
    max_first_free: usize,
    epoch: u64,
    slots: Vec<WinSlot>,
    buckets: Vec<Vec<usize>>,
    pub num_reused: u64,
    pub num_remapped: u64,
}

// SAFETY: raw mapping; synchronization is the engine's lock collaborator.
unsafe impl Send for WindowData {}

fn match_mapped(slot: &WinSlot, off: u32, len: u32) -> bool {
    slot.mapped_off <= off && slot.mapped_off + slot.mapped_len >= off + len
}

impl WindowData {
    /// Create a window of at least `wsize` bytes (rounded to a multiple of
    /// both the DB page size and the system page size, minimum two pages).
    pub fn new(file: &File, wsize: usize, pagesize: u32) -> Result<WindowData> {
        let syspg = sys_page_size() as u32;
        let mut wsize = pages_rounded_up(pagesize, wsize as u64) as usize * pagesize as usize;
        wsize = pages_rounded_up(syspg, wsize as u64) as usize * syspg as usize;
        if wsize / (pagesize as usize) < 2 {
            wsize = pagesize as usize * 2;
        }

        let base = MmapOptions::new().len(wsize).map_raw(file)?;
        let num_pages = wsize / pagesize as usize;
        let num_buckets = if num_pages < 16 { 4 } else { num_pages / 4 };
        debug!(window_bytes = wsize, num_pages, "window mapped");
        Ok(WindowData {
            base,
            pagesize,
            num_pages,
            first_free: 0,
            max_first_free: 0,
            epoch: 0,
            slots: vec![
                WinSlot {
                    pagenum: FREE_SLOT,
                    num_pages: 1,
                    ..WinSlot::default()
                };
                num_pages
            ],
            buckets: vec![Vec::new(); num_buckets],
            num_reused: 0,
            num_remapped: 0,
        })
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Start a new operation epoch. Slots from earlier epochs become
    /// reclaimable when the window runs out of free slots.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn max_used_bytes(&self) -> usize {
        self.max_first_free * self.pagesize as usize
    }

    pub fn contains(&self, p: *const u8) -> bool {
        let base = self.base.as_mut_ptr() as usize;
        let addr = p as usize;
        addr >= base && addr < base + self.base.len()
    }

    fn slot_ptr(&self, wi: usize) -> *mut u8 {
        // SAFETY: wi < num_pages, so the offset stays inside the window.
        unsafe { self.base.as_mut_ptr().add(wi * self.pagesize as usize) }
    }

    /// Bring chunk `pnum` (of `npages` DB pages) into the window and
    /// return a pointer to its start. With a nonzero `len`, only the byte
    /// range `[off, off+len)` within the chunk is guaranteed mapped.
    pub fn get(
        &mut self,
        file: &File,
        pnum: u32,
        npages: u32,
        off: u32,
        len: u32,
    ) -> Result<*mut u8> {
        let npages = npages.max(1) as usize;
        if npages > self.num_pages {
            return Err(DbError::NoMemory(format!(
                "window too small: need at least {} bytes",
                (2 + npages) * self.pagesize as usize
            )));
        }
        let ulen = if len != 0 {
            len
        } else {
            npages as u32 * self.pagesize
        };

        // Already mapped?
        let h = pnum as usize % self.buckets.len();
        let mut hit = None;
        for &wi in &self.buckets[h] {
            let slot = &self.slots[wi];
            if slot.pagenum == pnum as i64 && match_mapped(slot, off, ulen) {
                hit = Some(wi);
                break;
            }
        }
        if let Some(wi) = hit {
            self.num_reused += 1;
            self.slots[wi].epoch = self.epoch;
            return Ok(self.slot_ptr(wi));
        }

        // Claim a run of free slots, reclaiming slots from earlier
        // operations when nothing is free outright.
        let wi = match self.claim_run(npages) {
            Some(wi) => wi,
            None => {
                self.sweep_stale();
                match self.claim_run(npages) {
                    Some(wi) => wi,
                    None => {
                        error!(pnum, npages, "window slots exhausted");
                        return Err(DbError::NoMemory(format!(
                            "unable to allocate {npages} window page(s): need a larger window"
                        )));
                    }
                }
            }
        };

        self.slots[wi] = WinSlot {
            pagenum: pnum as i64,
            num_pages: npages as u32,
            epoch: self.epoch,
            ..WinSlot::default()
        };
        for s in &mut self.slots[wi + 1..wi + npages] {
            s.pagenum = pnum as i64;
            s.num_pages = 0;
        }
        self.buckets[h].push(wi);
        if self.first_free > self.max_first_free {
            self.max_first_free = self.first_free;
        }

        // Remap the file range under the claimed slots.
        let syspg = sys_page_size() as u32;
        let foff = pnum as u64 * self.pagesize as u64;
        let (pgoff, flen) = if len > 0 {
            let pgoff = off & !(syspg - 1);
            let flen = ((off + len + syspg - 1) & !(syspg - 1)) - pgoff;
            (pgoff, flen)
        } else {
            let nsys = pages_rounded_up(syspg, npages as u64 * self.pagesize as u64);
            (0, nsys * syspg)
        };
        {
            let slot = &mut self.slots[wi];
            slot.mapped_off = pgoff;
            slot.mapped_len = flen;
        }

        let p = self.slot_ptr(wi);
        // SAFETY: the target range lies inside the window mapping; MAP_FIXED
        // replaces those pages with the requested file range atomically.
        let mapped = unsafe {
            libc::mmap(
                p.add(pgoff as usize) as *mut libc::c_void,
                flen as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                (foff + pgoff as u64) as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            let e = std::io::Error::last_os_error();
            error!(pnum, npages, error = %e, "window remap failed");
            return Err(DbError::NoMemory(format!("window remap failed: {e}")));
        }
        self.num_remapped += 1;
        Ok(p)
    }

    fn claim_run(&mut self, npages: usize) -> Option<usize> {
        if self.num_pages - self.first_free >= npages {
            let wi = self.first_free;
            self.first_free += npages;
            return Some(wi);
        }
        let mut wi = 0;
        let mut nfree = 0;
        let mut i = 0;
        while i < self.first_free {
            if self.slots[i].pagenum == FREE_SLOT {
                if nfree == 0 {
                    wi = i;
                }
                nfree += 1;
                if nfree == npages {
                    return Some(wi);
                }
                i += 1;
            } else {
                nfree = 0;
                i += self.slots[i].num_pages.max(1) as usize;
            }
        }
        // A trailing run can extend into the untouched tail.
        if nfree > 0 && wi + nfree == self.first_free
            && nfree + (self.num_pages - self.first_free) >= npages
        {
            self.first_free = wi + npages;
            return Some(wi);
        }
        None
    }

    /// Free every slot last used before the current epoch.
    fn sweep_stale(&mut self) {
        let mut i = 0;
        while i < self.first_free {
            let slot = self.slots[i];
            if slot.pagenum != FREE_SLOT && slot.num_pages > 0 && slot.epoch < self.epoch {
                self.release_index(i);
                i += slot.num_pages as usize;
            } else {
                i += slot.num_pages.max(1) as usize;
            }
        }
    }

    fn release_index(&mut self, wi: usize) {
        let pnum = self.slots[wi].pagenum;
        if pnum == FREE_SLOT {
            return;
        }
        let npages = self.slots[wi].num_pages as usize;
        for s in &mut self.slots[wi..wi + npages] {
            s.pagenum = FREE_SLOT;
            s.num_pages = 1;
        }
        let h = pnum as usize % self.buckets.len();
        self.buckets[h].retain(|&i| i != wi);
        if wi + npages == self.first_free {
            self.first_free = wi;
        }
    }

    /// Release the slot run holding the chunk `p` points into. No-op for
    /// pointers outside the window.
    pub fn release(&mut self, p: *const u8) {
        if !self.contains(p) {
            return;
        }
        let base = self.base.as_mut_ptr() as usize;
        let mut wi = (p as usize - base) / self.pagesize as usize;
        while self.slots[wi].num_pages == 0 {
            assert!(wi > 0, "continuation slot with no head");
            wi -= 1;
        }
        self.release_index(wi);
    }

    /// Drop every slot assignment (used after remaps of the main region).
    pub fn release_all(&mut self) {
        self.first_free = 0;
        for b in &mut self.buckets {
            b.clear();
        }
        for s in &mut self.slots {
            s.pagenum = FREE_SLOT;
            s.num_pages = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with_pages(npages: usize, pagesize: usize) -> File {
        let mut f = tempfile::tempfile().unwrap();
        for i in 0..npages {
            let buf = vec![i as u8; pagesize];
            f.write_all(&buf).unwrap();
        }
        f
    }

    #[test]
    fn test_window_maps_requested_chunk() {
        let pagesize = sys_page_size();
        let f = file_with_pages(16, pagesize);
        let mut w = WindowData::new(&f, pagesize * 4, pagesize as u32).unwrap();

        let p = w.get(&f, 7, 1, 0, 0).unwrap();
        // SAFETY: slot was just mapped.
        assert_eq!(unsafe { *p }, 7);
        assert_eq!(w.num_remapped, 1);

        // Second request for the same chunk reuses the slot.
        let q = w.get(&f, 7, 1, 0, 0).unwrap();
        assert_eq!(p, q);
        assert_eq!(w.num_reused, 1);
    }

    #[test]
    fn test_window_evicts_released_slots() {
        let pagesize = sys_page_size();
        let f = file_with_pages(16, pagesize);
        let mut w = WindowData::new(&f, pagesize * 2, pagesize as u32).unwrap();

        let p0 = w.get(&f, 1, 1, 0, 0).unwrap();
        let _p1 = w.get(&f, 2, 1, 0, 0).unwrap();
        // Window is full now; releasing lets a third chunk in.
        w.release(p0);
        let p2 = w.get(&f, 3, 1, 0, 0).unwrap();
        // SAFETY: mapped above.
        assert_eq!(unsafe { *p2 }, 3);
    }

    #[test]
    fn test_window_multipage_chunk() {
        let pagesize = sys_page_size();
        let f = file_with_pages(16, pagesize);
        let mut w = WindowData::new(&f, pagesize * 4, pagesize as u32).unwrap();

        let p = w.get(&f, 5, 3, 0, 0).unwrap();
        // All three pages must be visible at consecutive addresses.
        for i in 0..3usize {
            // SAFETY: three pages were mapped at p.
            assert_eq!(unsafe { *p.add(i * pagesize) }, 5 + i as u8);
        }

        // An oversized request must fail cleanly.
        assert!(w.get(&f, 1, 9, 0, 0).is_err());
    }

    #[test]
    fn test_window_reclaims_stale_slots() {
        let pagesize = sys_page_size();
        let f = file_with_pages(16, pagesize);
        let mut w = WindowData::new(&f, pagesize * 2, pagesize as u32).unwrap();

        // Fill the window without releasing anything.
        w.get(&f, 1, 1, 0, 0).unwrap();
        w.get(&f, 2, 1, 0, 0).unwrap();

        // A new operation may cannibalize the stale slots.
        w.new_epoch();
        let p = w.get(&f, 3, 1, 0, 0).unwrap();
        // SAFETY: mapped above.
        assert_eq!(unsafe { *p }, 3);
    }

    #[test]
    fn test_release_all_resets() {
        let pagesize = sys_page_size();
        let f = file_with_pages(8, pagesize);
        let mut w = WindowData::new(&f, pagesize * 2, pagesize as u32).unwrap();
        w.get(&f, 1, 1, 0, 0).unwrap();
        w.get(&f, 2, 1, 0, 0).unwrap();
        w.release_all();
        let p = w.get(&f, 4, 2, 0, 0).unwrap();
        // SAFETY: mapped above.
        assert_eq!(unsafe { *p }, 4);
    }
}
