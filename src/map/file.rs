use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions, MmapRaw};
use once_cell::sync::Lazy;

use crate::error::Result;

/// System page size, fetched once.
pub fn sys_page_size() -> usize {
    static SIZE: Lazy<usize> = Lazy::new(|| {
        // SAFETY: sysconf is always safe to call.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            n as usize
        } else {
            4096
        }
    });
    *SIZE
}

enum Backing {
    Rw(#[allow(dead_code)] MmapRaw),
    Ro(#[allow(dead_code)] Mmap),
    Anon(#[allow(dead_code)] MmapMut),
}

/// One mapped region of the database file (or an anonymous region in
/// memory-only mode). The base pointer is captured at creation so shared
/// (`Arc`) owners can hand it out without re-borrowing the backing map.
/// The backing mapping is released when the last owner drops the region.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    _backing: Backing,
}

// SAFETY: the region is plain shared memory; all access synchronization is
// the caller's responsibility (the engine's lock collaborator).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `file` read-write, shared.
    pub fn map_rw(file: &File, len: usize) -> Result<MappedRegion> {
        let raw = MmapOptions::new().len(len).map_raw(file)?;
        Ok(MappedRegion {
            ptr: raw.as_mut_ptr(),
            len: raw.len(),
            _backing: Backing::Rw(raw),
        })
    }

    /// Map `len` bytes of `file` read-only, shared. Writing through the
    /// returned pointer faults; callers gate on the handle's access mode.
    pub fn map_ro(file: &File, len: usize) -> Result<MappedRegion> {
        // SAFETY: the mapping is shared file memory; concurrent file writes
        // are part of this store's access model.
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        Ok(MappedRegion {
            ptr: map.as_ptr() as *mut u8,
            len: map.len(),
            _backing: Backing::Ro(map),
        })
    }

    /// Anonymous mapping for memory-only databases.
    pub fn map_anon(len: usize) -> Result<MappedRegion> {
        let mut map = MmapOptions::new().len(len).map_anon()?;
        Ok(MappedRegion {
            ptr: map.as_mut_ptr(),
            len: map.len(),
            _backing: Backing::Anon(map),
        })
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Asynchronous msync of the whole region.
    pub fn sync_async(&self) -> Result<()> {
        // SAFETY: ptr/len describe this live mapping.
        let rc = unsafe { libc::msync(self.ptr as *mut libc::c_void, self.len, libc::MS_ASYNC) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Pin the region into memory (open flag `lock_pages`).
    pub fn lock_pages(&self) -> Result<()> {
        // SAFETY: ptr/len describe this live mapping.
        let rc = unsafe { libc::mlock(self.ptr as *const libc::c_void, self.len) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// mprotect a sub-range. Used by protect mode to fence off the
    /// directory pages between operations.
    pub fn protect_range(&self, offset: usize, len: usize, readable_writable: bool) -> Result<()> {
        if offset + len > self.len || len == 0 {
            return Ok(());
        }
        let prot = if readable_writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        // SAFETY: the range is inside this live mapping and page-aligned by
        // the caller.
        let rc = unsafe {
            libc::mprotect(self.ptr.add(offset) as *mut libc::c_void, len, prot)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_rw_roundtrip() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[0u8; 8192]).unwrap();
        let region = MappedRegion::map_rw(&f, 8192).unwrap();
        assert_eq!(region.len(), 8192);
        // SAFETY: fresh private mapping of our own temp file.
        unsafe {
            *region.ptr() = 0xab;
            assert_eq!(*region.ptr(), 0xab);
        }
        region.sync_async().unwrap();
    }

    #[test]
    fn test_map_anon_zeroed() {
        let region = MappedRegion::map_anon(4096).unwrap();
        // SAFETY: region was just mapped with at least 16 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(region.ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sys_page_size_sane() {
        let s = sys_page_size();
        assert!(s >= 512 && s.is_power_of_two());
    }
}
