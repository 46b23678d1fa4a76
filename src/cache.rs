// Cache-eviction engine. Active only when the DB was created in a cache
// mode; picks victims on a full page by LFU, LRU or GDSF priority,
// optionally preferring clean entries and offering dirty ones to a user
// clean-back hook first.

use tracing::debug;

use crate::common::LogicalPage;
use crate::db::{CleanDisposition, Db};
use crate::dir::PageAlloc;
use crate::error::Result;
use crate::format::{CacheMeta, CacheModeKind, CACHE_META_SIZE, EFLAG_SYNC_ERROR};
use crate::page::PageView;
use crate::stats::{StatTag, time_secs};

impl Db {
    pub(crate) fn cache_meta(&self, view: &PageView, i: u32) -> CacheMeta {
        let off = view.val_offset(i);
        *bytemuck::from_bytes(view.bytes(off, CACHE_META_SIZE as u32))
    }

    pub(crate) fn set_cache_meta(&self, view: &PageView, i: u32, meta: CacheMeta) {
        let off = view.val_offset(i);
        view.bytes_mut(off, CACHE_META_SIZE as u32)
            .copy_from_slice(bytemuck::bytes_of(&meta));
    }

    /// Bump access statistics on a fetch hit.
    pub(crate) fn touch_cache_entry(&self, view: &PageView, i: u32, user_len: u32) {
        let mut meta = self.cache_meta(view, i);
        meta.num_accesses += 1;
        match self.cache_policy {
            CacheModeKind::Lfu | CacheModeKind::Lru => {
                meta.set_access_time(time_secs());
            }
            CacheModeKind::Gdsf => {
                let e = view.entry(i);
                meta.set_priority(
                    meta.num_accesses as f32 / (e.key_len() + user_len) as f32,
                );
            }
            CacheModeKind::None => {}
        }
        self.set_cache_meta(view, i, meta);
    }

    /// Evict entries from `logical`'s page until at least `needed` bytes
    /// are free (starting from `free_bytes`) or no eligible entry
    /// remains. With `want_large` set, only large-object entries are
    /// eligible and their full chunk allocation counts as freed. Returns
    /// the bytes now free.
    pub(crate) fn cache_evict(
        &mut self,
        logical: LogicalPage,
        mut free_bytes: i64,
        needed: i64,
        want_large: bool,
    ) -> Result<i64> {
        let mut clean = self.evict_clean_first;

        // Forget previous clean-back failures.
        {
            let page = self
                .pagenum_to_page(logical, PageAlloc::Exists)?
                .expect("Exists always yields a page");
            let view = self.view(page);
            for i in 0..view.num_entries() {
                let mut e = view.entry(i);
                if !e.is_tombstone() {
                    e.flag_clear(EFLAG_SYNC_ERROR);
                    view.set_entry(i, e);
                }
            }
            self.release_chunk(page);
        }

        let mut nerror = 0u64;
        while free_bytes < needed {
            // The page chunk can move (shrink) under del_entry, so
            // re-resolve every round.
            let page = self
                .pagenum_to_page(logical, PageAlloc::Exists)?
                .expect("Exists always yields a page");
            let view = self.view(page);

            let victim = self.pick_victim(&view, clean, want_large)?;
            let Some((index, evict_bytes, evict_priority)) = victim else {
                self.release_chunk(page);
                if clean {
                    // Nothing eligible with the clean preference; retry
                    // without it.
                    clean = false;
                    continue;
                }
                break;
            };

            if self.clean.is_some() && view.entry(index).is_dirty() {
                let key = view.key_bytes(index).to_vec();
                let val = self.read_entry_value(&view, index)?;
                let mut cb = self.clean.take().expect("checked above");
                let disposition = cb.clean(&key, &val);
                self.clean = Some(cb);
                match disposition {
                    CleanDisposition::Evictable => {}
                    CleanDisposition::Skip => {
                        let mut e = view.entry(index);
                        e.flag_set(EFLAG_SYNC_ERROR);
                        view.set_entry(index, e);
                        nerror += 1;
                        self.release_chunk(page);
                        continue;
                    }
                    CleanDisposition::Stop => {
                        nerror += 1;
                        self.release_chunk(page);
                        break;
                    }
                }
            }

            if self.cache_policy == CacheModeKind::Gdsf {
                // Aging: pull every surviving priority down by the
                // evicted one.
                for i in 0..view.num_entries() {
                    if !view.entry(i).is_tombstone() {
                        let mut meta = self.cache_meta(&view, i);
                        meta.set_priority(meta.priority() - evict_priority);
                        self.set_cache_meta(&view, i, meta);
                    }
                }
            }

            free_bytes += evict_bytes as i64;
            debug!(logical, index, evict_bytes, "cache eviction");
            self.del_entry(page, index)?;
            self.release_chunk(page);
        }

        self.stats.bump(&self.stats.cache_evicts);
        if nerror > 0 {
            self.stats.bump(&self.stats.cache_evict_errors);
        }
        if let Some(cb) = &self.stats_cb {
            cb.on_stat(StatTag::CacheEvict, 1);
        }
        Ok(free_bytes)
    }

    /// Scan a page for the policy's next victim. Returns the entry
    /// index, bytes freed by deleting it, and its GDSF priority.
    fn pick_victim(
        &mut self,
        view: &PageView,
        clean: bool,
        want_large: bool,
    ) -> Result<Option<(u32, u32, f32)>> {
        let mut best: Option<(u32, u32, f32)> = None;
        let mut best_accesses = 0u32;
        let mut best_time = 0u32;
        let mut best_priority = 0f32;

        for i in 0..view.num_entries() {
            let e = view.entry(i);
            if e.is_tombstone() {
                continue;
            }
            // Entries that already failed the clean-back sit out the
            // rest of this eviction cycle.
            if e.flags() & EFLAG_SYNC_ERROR != 0 {
                continue;
            }
            if clean && e.is_dirty() {
                continue;
            }
            if want_large && !e.is_large_obj() {
                continue;
            }
            let meta = self.cache_meta(view, i);

            // Count the whole reclaimed entry (kv bytes + descriptor) so
            // eviction stops as soon as the incoming entry actually fits.
            let evict_bytes = if want_large {
                let (_, alloc_len) = self.lob_alloc_len(view, i)?;
                alloc_len
            } else {
                view.entry_size(i)
            };

            let better = match self.cache_policy {
                CacheModeKind::Lfu => {
                    best.is_none()
                        || meta.num_accesses < best_accesses
                        || (meta.num_accesses == best_accesses
                            && meta.access_time() < best_time)
                }
                CacheModeKind::Lru => {
                    best.is_none()
                        || meta.access_time() < best_time
                        || (meta.access_time() == best_time
                            && meta.num_accesses < best_accesses)
                }
                CacheModeKind::Gdsf => {
                    let mut priority = meta.priority();
                    if want_large {
                        let (vallen, alloc_len) = self.lob_alloc_len(view, i)?;
                        priority =
                            meta.num_accesses as f32 * (alloc_len - vallen) as f32 - priority;
                    }
                    if best.is_none() || priority < best_priority {
                        best_priority = priority;
                        best = Some((i, evict_bytes, priority));
                        continue;
                    }
                    false
                }
                CacheModeKind::None => false,
            };
            if better {
                best_accesses = meta.num_accesses;
                best_time = meta.access_time();
                best = Some((i, evict_bytes, meta.priority()));
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{CacheMode, DbOptions};
    use crate::format::CacheModeKind;
    use crate::ops::{StoreMode, StoreOptions};

    fn cache_db(policy: CacheModeKind) -> (tempfile::TempDir, crate::db::Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = DbOptions::new()
            .create(true)
            .cache_mode(CacheMode {
                policy,
                evict_clean_first: false,
            })
            .open(dir.path().join("cache.db"))
            .unwrap();
        (dir, db)
    }

    #[test]
    fn test_lru_cache_evicts_oldest() {
        let (_dir, mut db) = cache_db(CacheModeKind::Lru);
        db.limit_size(1, None).unwrap();

        // Fill one page with records until an insert must evict.
        for i in 0u64..64 {
            db.store(
                &i.to_le_bytes(),
                &[0xab; 100],
                &StoreOptions::mode(StoreMode::Replace),
            )
            .unwrap();
        }
        // The page holds fewer than 64 of these, so early keys are gone
        // and late keys are present.
        assert!(db.fetch(&0u64.to_le_bytes()).is_err());
        assert!(db.fetch(&63u64.to_le_bytes()).is_ok());
    }

    #[test]
    fn test_gdsf_cache_stays_bounded() {
        let (_dir, mut db) = cache_db(CacheModeKind::Gdsf);
        db.limit_size(1, None).unwrap();
        for i in 0u64..100 {
            db.store(
                &i.to_le_bytes(),
                &[1u8; 64],
                &StoreOptions::mode(StoreMode::Replace),
            )
            .unwrap();
        }
        assert!(db.count_records().unwrap() < 100);
        assert!(db.count_records().unwrap() > 0);
    }
}
