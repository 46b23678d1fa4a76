// The database handle: open/create, the mapping lifecycle, duplicate
// handles, and the administrative surface. Point operations (fetch, store,
// delete, iteration) live in ops.rs; the allocator, directory, page, cache
// and split engines are impl blocks in their own modules.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytemuck::Zeroable;
use tracing::{debug, error, warn};

use crate::common::{
    dir_bytes, dir_width, hash_mask, pages_rounded_up, LogicalPage, PhysPage, MAX_NUM_PAGES,
    MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_ALIGN,
};
use crate::error::{DbError, Result};
use crate::format::{
    CacheModeKind, ChunkHeader, ChunkType, DbHeader, PtEntry, CHUNK_HEADER_SIZE, DB_MAGIC,
    DIR_CHUNK_MAGIC, HDR_SIZE, HFLAG_LARGEOBJ, HFLAG_PERFECT, HFLAG_REPLACED, PT_ENTRY_SIZE,
};
use crate::hash::{hash_func, HashFn, DEFAULT_HASH};
use crate::lock::{LockMode, LockScope, Locker, ProcessLocker};
use crate::map::{sys_page_size, MapState, MappedRegion, SharedMap, WindowData};
use crate::stats::{Stats, StatsCallback};

const GUARD_WORD: u32 = !DB_MAGIC;
const DEFAULT_PAGESIZE: u32 = 4096;
const DEFAULT_WINDOW_PAGES: u32 = 8;

/// Key/value alignment stored in the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Byte,
    TwoBytes,
    FourBytes,
    EightBytes,
}

impl Alignment {
    pub(crate) fn mask(self) -> u32 {
        match self {
            Alignment::Byte => 0,
            Alignment::TwoBytes => 1,
            Alignment::FourBytes => 3,
            Alignment::EightBytes => 7,
        }
    }
}

/// Cache configuration: the eviction policy plus the clean-first bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMode {
    pub policy: CacheModeKind,
    pub evict_clean_first: bool,
}

impl CacheMode {
    pub fn none() -> CacheMode {
        CacheMode {
            policy: CacheModeKind::None,
            evict_clean_first: false,
        }
    }

    pub(crate) fn as_byte(self) -> u8 {
        let mut b = self.policy.as_byte();
        if self.evict_clean_first && self.policy != CacheModeKind::None {
            b |= CacheModeKind::EVICT_CLEAN_FIRST;
        }
        b
    }
}

/// User hook invoked when a store finds its page full, before a split is
/// attempted. Implementations pick entries for the engine to drop.
pub trait ShakeFunc: Send {
    /// `entries` holds every live entry on the page (tombstones excluded).
    /// Return the indices of entries to delete.
    fn shake(&mut self, key: &[u8], val: &[u8], entries: &[ShakeItem]) -> Vec<usize>;
}

/// One live entry offered to a shake callback.
pub struct ShakeItem {
    pub key: Vec<u8>,
    pub val: Vec<u8>,
    /// Bytes the entry releases if dropped.
    pub size: u32,
}

/// What a clean callback decided about one dirty entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanDisposition {
    /// Entry was persisted; it may be evicted.
    Evictable,
    /// Could not persist; skip it for this eviction cycle.
    Skip,
    /// Could not persist; stop evicting altogether.
    Stop,
}

/// User hook invoked before evicting a dirty entry in cache mode.
pub trait CleanFunc: Send {
    fn clean(&mut self, key: &[u8], val: &[u8]) -> CleanDisposition;
}

/// Open-time configuration, builder style.
#[derive(Clone)]
pub struct DbOptions {
    pub(crate) create: bool,
    pub(crate) truncate: bool,
    pub(crate) rdonly: bool,
    pub(crate) pagesize: u32,
    pub(crate) initial_size: u64,
    pub(crate) max_dir_shift: u8,
    pub(crate) spill_size: u32,
    pub(crate) large_objects: bool,
    pub(crate) cache_mode: CacheMode,
    pub(crate) align: Alignment,
    pub(crate) hash: u8,
    pub(crate) lock_mode: LockMode,
    pub(crate) window_size: Option<usize>,
    pub(crate) header_only: bool,
    pub(crate) memory_only: bool,
    pub(crate) protect: bool,
    pub(crate) lock_pages: bool,
    pub(crate) fsync_on_close: bool,
    pub(crate) locker: Option<Arc<dyn Locker>>,
}

impl Default for DbOptions {
    fn default() -> DbOptions {
        DbOptions {
            create: false,
            truncate: false,
            rdonly: false,
            pagesize: DEFAULT_PAGESIZE,
            initial_size: 0,
            max_dir_shift: 0,
            spill_size: 0,
            large_objects: false,
            cache_mode: CacheMode::none(),
            align: Alignment::Byte,
            hash: DEFAULT_HASH,
            lock_mode: LockMode::Exclusive,
            window_size: None,
            header_only: false,
            memory_only: false,
            protect: false,
            lock_pages: false,
            fsync_on_close: false,
            locker: None,
        }
    }
}

impl DbOptions {
    pub fn new() -> DbOptions {
        DbOptions::default()
    }

    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    pub fn truncate(mut self, yes: bool) -> Self {
        self.truncate = yes;
        self
    }

    pub fn read_only(mut self, yes: bool) -> Self {
        self.rdonly = yes;
        self
    }

    pub fn pagesize(mut self, bytes: u32) -> Self {
        self.pagesize = bytes;
        self
    }

    /// Pre-size the file; rounded up to whole pages.
    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = bytes;
        self
    }

    pub fn max_dir_shift(mut self, shift: u8) -> Self {
        self.max_dir_shift = shift;
        self
    }

    /// Enable large objects with the given spill threshold (0 picks
    /// three quarters of the page size).
    pub fn large_objects(mut self, spill_size: u32) -> Self {
        self.large_objects = true;
        self.spill_size = spill_size;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn alignment(mut self, align: Alignment) -> Self {
        self.align = align;
        self
    }

    pub fn hash(mut self, hash_id: u8) -> Self {
        self.hash = hash_id;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Map a rolling window of the given size instead of the whole file.
    pub fn windowed(mut self, window_bytes: usize) -> Self {
        self.window_size = Some(window_bytes);
        self
    }

    /// Map only the header; for administrative tools.
    pub fn header_only(mut self, yes: bool) -> Self {
        self.header_only = yes;
        self
    }

    /// Anonymous mapping, no backing file.
    pub fn memory_only(mut self, yes: bool) -> Self {
        self.memory_only = yes;
        self
    }

    pub fn protect(mut self, yes: bool) -> Self {
        self.protect = yes;
        self
    }

    pub fn lock_pages(mut self, yes: bool) -> Self {
        self.lock_pages = yes;
        self
    }

    pub fn fsync_on_close(mut self, yes: bool) -> Self {
        self.fsync_on_close = yes;
        self
    }

    /// Supply an external lock collaborator instead of the in-process one.
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Db> {
        Db::open_with(path.as_ref(), self)
    }

    fn validate(&self) -> Result<()> {
        let ps = self.pagesize;
        if !ps.is_power_of_two() || ps < MIN_PAGE_SIZE || ps > MAX_PAGE_SIZE || ps % PAGE_ALIGN != 0
        {
            return Err(DbError::InvalidArg(format!("bad page size {ps}")));
        }
        if self.max_dir_shift > crate::common::MAX_DIR_SHIFT {
            return Err(DbError::InvalidArg(format!(
                "bad max dir shift {}",
                self.max_dir_shift
            )));
        }
        if hash_func(self.hash).is_none() {
            return Err(DbError::InvalidArg(format!("bad hash id {}", self.hash)));
        }
        if self.spill_size > ps {
            return Err(DbError::InvalidArg(format!(
                "spill size {} exceeds page size {ps}",
                self.spill_size
            )));
        }
        if self.memory_only && (self.window_size.is_some() || self.rdonly || self.header_only) {
            return Err(DbError::InvalidArg(
                "memory-only excludes windowed, read-only and header-only".into(),
            ));
        }
        if self.header_only && self.window_size.is_some() {
            return Err(DbError::InvalidArg(
                "header-only excludes windowed mode".into(),
            ));
        }
        if let Some(w) = self.window_size {
            if w < 2 * ps as usize {
                return Err(DbError::InvalidArg(
                    "window must be at least two pages".into(),
                ));
            }
        }
        Ok(())
    }
}

/// One chunk of the file as seen by `walk_chunks`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    pub start: PhysPage,
    pub num_pages: u32,
    pub chunk_type: Option<ChunkType>,
    /// Owning logical page for DATA/LOB chunks.
    pub owner: u32,
    /// Type-dependent word: entry count, next free, or value length.
    pub data: u32,
}

/// Geometry snapshot for tools.
#[derive(Debug, Clone, Copy)]
pub struct DbInfo {
    pub pagesize: u32,
    pub num_pages: u32,
    pub max_pages: u32,
    pub dir_shift: u8,
    pub max_dir_shift: u8,
    pub dir_width: u32,
    pub num_dir_pages: u32,
    pub hash_id: u8,
    pub spill_size: u32,
    pub cache_mode: CacheModeKind,
    pub dir_gen: u32,
}

/// A database handle. Not internally synchronized: one handle per thread,
/// with `dup` producing siblings that share the mapping and locks.
pub struct Db {
    guard1: u32,
    pub(crate) path: PathBuf,
    pub(crate) locker: Arc<dyn Locker>,
    pub(crate) lock_mode: LockMode,
    pub(crate) shared: Arc<SharedMap>,
    pub(crate) region: Arc<MappedRegion>,
    pub(crate) file: Option<Arc<File>>,
    pub(crate) map_gen: u64,

    pub(crate) rdonly: bool,
    pub(crate) windowed: bool,
    window_size_req: usize,
    pub(crate) memory_only: bool,
    pub(crate) hdr_only: bool,
    pub(crate) protect: bool,
    pub(crate) lock_pages_flag: bool,
    pub(crate) fsync_on_close: bool,

    pub(crate) pagesize: u32,
    pub(crate) num_pages: u32,
    pub(crate) align_mask: u32,
    pub(crate) spill_size: u32,
    pub(crate) cache_policy: CacheModeKind,
    pub(crate) evict_clean_first: bool,

    pub(crate) dir_shift: u8,
    pub(crate) max_dir_shift: u8,
    pub(crate) max_dirbit: u32,
    pub(crate) dir_gen: u32,
    pub(crate) dir_perfect: bool,
    pub(crate) dir_copy: Vec<u8>,

    pub(crate) hash_id: u8,
    pub(crate) hash_fn: HashFn,

    pub(crate) window: Option<WindowData>,
    pub(crate) shake: Option<Box<dyn ShakeFunc>>,
    pub(crate) clean: Option<Box<dyn CleanFunc>>,
    pub(crate) stats_cb: Option<Box<dyn StatsCallback>>,
    pub stats: Stats,
    guard2: u32,
}

// SAFETY: the raw base pointer aliases shared mapped memory whose access is
// serialized by the lock collaborator; the handle itself is only used
// through &mut.
unsafe impl Send for Db {}

impl Db {
    /// Open with default options (read-write, existing file).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        DbOptions::new().open(path)
    }

    fn open_with(path: &Path, opts: DbOptions) -> Result<Db> {
        opts.validate()?;

        if opts.memory_only {
            return Db::open_memory_only(path, opts);
        }

        let exists = path.exists();
        if !exists && !opts.create {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        let fresh = !exists || opts.truncate;

        let file = OpenOptions::new()
            .read(true)
            .write(!opts.rdonly)
            .create(opts.create)
            .truncate(opts.truncate && !opts.rdonly)
            .open(path)?;
        let file = Arc::new(file);

        let locker: Arc<dyn Locker> = match &opts.locker {
            Some(l) => Arc::clone(l),
            None => {
                let canon = path
                    .canonicalize()
                    .unwrap_or_else(|_| path.to_path_buf());
                ProcessLocker::open(&canon, opts.lock_mode)?
            }
        };
        let needs_check = locker.needs_check();

        let mut db = Db::empty(path.to_path_buf(), locker, opts.lock_mode, &opts);
        db.file = Some(Arc::clone(&file));

        if fresh {
            if opts.rdonly {
                return Err(DbError::InvalidArg("cannot create read-only".into()));
            }
            let data_pages = db.initial_data_pages(&opts);
            db.write_initial_image(&file, &opts, data_pages)?;
            db.internal_remap(0)?;
            db.shared = Arc::new(SharedMap::new(MapState {
                region: Arc::clone(&db.region),
                file: db.file.clone(),
            }));
            db.map_gen = db.shared.generation();
            db.pre_split(data_pages)?;
        } else {
            db.internal_remap(0)?;
            db.shared = Arc::new(SharedMap::new(MapState {
                region: Arc::clone(&db.region),
                file: db.file.clone(),
            }));
            db.map_gen = db.shared.generation();
        }

        if needs_check {
            warn!(path = %db.path.display(), "previous lock owner died; running check");
            let errors = db.check(3, false)?;
            if errors > 0 {
                return Err(DbError::LockDeadOwner);
            }
        }
        Ok(db)
    }

    fn open_memory_only(path: &Path, opts: DbOptions) -> Result<Db> {
        let locker: Arc<dyn Locker> = match &opts.locker {
            Some(l) => Arc::clone(l),
            None => Arc::new(ProcessLocker::new(opts.lock_mode)),
        };
        let mut db = Db::empty(path.to_path_buf(), locker, opts.lock_mode, &opts);
        db.memory_only = true;

        let data_pages = db.initial_data_pages(&opts);
        let (image, tot_pages) = build_initial_image(&opts, data_pages);
        let region = MappedRegion::map_anon(tot_pages as usize * opts.pagesize as usize)?;
        // SAFETY: the anonymous region is at least image.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(image.as_ptr(), region.ptr(), image.len());
        }
        db.region = Arc::new(region);
        db.init_from_header()?;
        db.shared = Arc::new(SharedMap::new(MapState {
            region: Arc::clone(&db.region),
            file: None,
        }));
        db.map_gen = db.shared.generation();
        db.pre_split(data_pages)?;
        // An allocation failure must never remap away the anonymous data.
        db.hdr_mut().max_pages = db.num_pages;
        Ok(db)
    }

    fn empty(path: PathBuf, locker: Arc<dyn Locker>, lock_mode: LockMode, opts: &DbOptions) -> Db {
        Db {
            guard1: GUARD_WORD,
            path,
            locker,
            lock_mode,
            // Placeholder 1-page region, replaced before use.
            shared: Arc::new(SharedMap::new(MapState {
                region: Arc::new(MappedRegion::map_anon(4096).expect("anon map")),
                file: None,
            })),
            region: Arc::new(MappedRegion::map_anon(4096).expect("anon map")),
            file: None,
            map_gen: 0,
            rdonly: opts.rdonly,
            windowed: opts.window_size.is_some(),
            window_size_req: opts.window_size.unwrap_or(0),
            memory_only: false,
            hdr_only: opts.header_only,
            protect: opts.protect,
            lock_pages_flag: opts.lock_pages,
            fsync_on_close: opts.fsync_on_close,
            pagesize: opts.pagesize,
            num_pages: 0,
            align_mask: opts.align.mask(),
            spill_size: 0,
            cache_policy: CacheModeKind::None,
            evict_clean_first: false,
            dir_shift: 0,
            max_dir_shift: opts.max_dir_shift,
            max_dirbit: 0,
            dir_gen: 0,
            dir_perfect: false,
            dir_copy: Vec::new(),
            hash_id: opts.hash,
            hash_fn: hash_func(opts.hash).expect("validated hash id"),
            window: None,
            shake: None,
            clean: None,
            stats_cb: None,
            stats: Stats::default(),
            guard2: GUARD_WORD,
        }
    }

    fn initial_data_pages(&self, opts: &DbOptions) -> u32 {
        let n = pages_rounded_up(opts.pagesize, opts.initial_size);
        n.max(1).min(MAX_NUM_PAGES)
    }

    /// Write a fresh single-logical-page DB image at the start of the file
    /// and size the file for `data_pages` data pages.
    fn write_initial_image(&self, file: &File, opts: &DbOptions, data_pages: u32) -> Result<()> {
        let (image, tot_pages) = build_initial_image(opts, data_pages);
        file.set_len(tot_pages as u64 * opts.pagesize as u64)?;
        file.write_all_at(&image, 0)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mapping lifecycle
    // ------------------------------------------------------------------

    /// Unmap and remap the file. `dbsize == 0` means "derive from the
    /// on-disk header" (used at open).
    pub(crate) fn internal_remap(&mut self, dbsize: u64) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .cloned()
            .ok_or_else(|| DbError::InvalidArg("no backing file".into()))?;

        let mut hdr = DbHeader::zeroed();
        let hdr_bytes = bytemuck::bytes_of_mut(&mut hdr);
        file.read_exact_at(hdr_bytes, CHUNK_HEADER_SIZE as u64)?;
        hdr.validate()?;

        let dbsize = if dbsize != 0 {
            dbsize
        } else {
            hdr.num_pages as u64 * hdr.pagesize as u64
        };

        let region = if self.windowed {
            let ndir = num_dir_pages(hdr.pagesize, hdr.dir_shift);
            let mut mapsz = ndir as usize * hdr.pagesize as usize;
            let syspg = sys_page_size();
            mapsz = pages_rounded_up(syspg as u32, mapsz as u64) as usize * syspg;
            MappedRegion::map_rw(&file, mapsz)?
        } else if self.hdr_only {
            let len = (CHUNK_HEADER_SIZE + HDR_SIZE).min(dbsize as usize);
            if self.rdonly {
                MappedRegion::map_ro(&file, len)?
            } else {
                MappedRegion::map_rw(&file, len)?
            }
        } else if self.rdonly {
            MappedRegion::map_ro(&file, dbsize as usize)?
        } else {
            MappedRegion::map_rw(&file, dbsize as usize)?
        };

        self.region = Arc::new(region);
        if self.lock_pages_flag {
            self.region.lock_pages()?;
        }
        self.init_from_header()?;

        if self.windowed {
            let wsize = self
                .window
                .as_ref()
                .map(|w| w.num_pages() * self.pagesize as usize)
                .unwrap_or_else(|| {
                    if self.window_size_req != 0 {
                        self.window_size_req
                    } else {
                        DEFAULT_WINDOW_PAGES as usize * self.pagesize as usize
                    }
                });
            self.window = Some(WindowData::new(&file, wsize, self.pagesize)?);
        }
        if self.protect {
            self.protect_dir(true)?;
        }
        Ok(())
    }

    /// Derive handle fields from the (mapped) header.
    pub(crate) fn init_from_header(&mut self) -> Result<()> {
        let hdr = *self.hdr();
        hdr.validate()?;
        self.pagesize = hdr.pagesize;
        self.num_pages = hdr.num_pages;
        self.align_mask = hdr.align_mask();
        self.cache_policy = hdr.cache_policy();
        self.evict_clean_first = hdr.evict_clean_first();
        self.dir_shift = hdr.dir_shift;
        self.max_dir_shift = hdr.max_dir_shift;
        self.max_dirbit = hash_mask(hdr.dir_shift as u32);
        self.spill_size = if hdr.large_objects() {
            hdr.spill_size
        } else {
            0
        };
        self.hash_id = hdr.hash_func;
        self.hash_fn = hash_func(hdr.hash_func)
            .ok_or_else(|| DbError::Corrupt(format!("bad hash id {}", hdr.hash_func)))?;
        self.sync_dir();
        Ok(())
    }

    /// Grow (or shrink) the file to `npages` and remap, rolling back to
    /// the previous size on failure.
    pub(crate) fn resize_db(&mut self, npages: u32) -> Result<()> {
        if npages > MAX_NUM_PAGES {
            return Err(DbError::NoMemory(format!(
                "cannot grow to {npages} pages (max {MAX_NUM_PAGES})"
            )));
        }
        if self.memory_only {
            return Err(DbError::NoMemory("memory-only DB cannot be resized".into()));
        }
        let prev = self.num_pages;
        let dbsize = npages as u64 * self.pagesize as u64;
        self.num_pages = npages;
        self.hdr_mut().num_pages = npages;

        let file = self.file.as_ref().cloned().expect("file-backed");
        if let Err(e) = file.set_len(dbsize) {
            self.num_pages = prev;
            self.hdr_mut().num_pages = prev;
            error!(npages, error = %e, "ftruncate failed in resize");
            return Err(e.into());
        }

        if let Err(e) = self.internal_remap(dbsize) {
            warn!(npages, error = %e, "remap failed in resize; rolling back");
            self.num_pages = prev;
            let prev_size = prev as u64 * self.pagesize as u64;
            let _ = file.set_len(prev_size);
            self.internal_remap(prev_size)?;
            self.hdr_mut().num_pages = prev;
            self.init_from_header()?;
            return Err(DbError::NoMemory(format!("cannot resize to {npages} pages")));
        }
        self.publish_map();
        Ok(())
    }

    pub(crate) fn publish_map(&mut self) {
        self.map_gen = self.shared.publish(MapState {
            region: Arc::clone(&self.region),
            file: self.file.clone(),
        });
    }

    /// Sibling-handle fast path: notice a remap published by another
    /// handle of this family and adopt it.
    fn sync_shared_map(&mut self) -> Result<()> {
        if let Some((state, gen)) = self.shared.refresh(self.map_gen) {
            self.region = state.region;
            self.file = state.file;
            self.map_gen = gen;
            if let Some(w) = self.window.as_mut() {
                w.release_all();
            }
            self.init_from_header()?;
        }
        Ok(())
    }

    /// Called at the top of every public operation that touches the
    /// mapping: guard check, shared-map refresh, replaced-file takeover,
    /// and private-directory resync.
    pub(crate) fn enter_op(&mut self) -> Result<()> {
        self.check_guard()?;
        if self.hdr_only {
            return Err(DbError::InvalidArg(
                "data access on a header-only handle".into(),
            ));
        }
        self.sync_shared_map()?;
        if let Some(w) = self.window.as_mut() {
            // Slots from finished operations become reclaimable.
            w.new_epoch();
        }
        let (replaced, dir_gen, dir_shift) = {
            let hdr = self.hdr();
            (hdr.is_replaced(), hdr.dir_gen, hdr.dir_shift)
        };
        if replaced {
            debug!(path = %self.path.display(), "file replaced; reopening");
            self.reopen_replaced()?;
        } else if dir_gen != self.dir_gen || dir_shift != self.dir_shift {
            self.sync_dir();
        }
        Ok(())
    }

    fn check_guard(&self) -> Result<()> {
        if self.guard1 != GUARD_WORD || self.guard2 != GUARD_WORD {
            return Err(DbError::Corrupt("handle guard words damaged".into()));
        }
        Ok(())
    }

    /// Re-open the path after another process renamed a new file over it.
    fn reopen_replaced(&mut self) -> Result<()> {
        if self.memory_only {
            return Err(DbError::Replaced);
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(!self.rdonly)
                .open(&self.path)?,
        );
        self.file = Some(file);
        self.internal_remap(0)?;
        self.publish_map();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw access to mapped structures
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.region.ptr()
    }

    #[inline]
    pub(crate) fn hdr_ptr(&self) -> *mut DbHeader {
        // SAFETY: every mapping covers at least the chunk header + header.
        unsafe { self.base().add(CHUNK_HEADER_SIZE) as *mut DbHeader }
    }

    #[inline]
    pub(crate) fn hdr(&self) -> &DbHeader {
        // SAFETY: header is mapped and validated at open/remap.
        unsafe { &*self.hdr_ptr() }
    }

    #[inline]
    pub(crate) fn hdr_mut(&mut self) -> &mut DbHeader {
        // SAFETY: as above; &mut self serializes in-handle access.
        unsafe { &mut *self.hdr_ptr() }
    }

    /// Pointer to the chunk header at physical page `p` in the pinned
    /// mapping. Windowed handles may only use this for the directory
    /// chunk; all other chunks go through `map_chunk`.
    #[inline]
    pub(crate) fn chunk_ptr(&self, p: PhysPage) -> *mut ChunkHeader {
        debug_assert!(!self.windowed || p == 0 || (p as u64 * self.pagesize as u64) < self.region.len() as u64);
        // SAFETY: callers pass physical pages inside the mapping.
        unsafe { self.base().add(p as usize * self.pagesize as usize) as *mut ChunkHeader }
    }

    /// Window-aware chunk access: returns a pointer valid for the whole
    /// chunk (header + payload).
    pub(crate) fn map_chunk(&mut self, p: PhysPage) -> Result<*mut ChunkHeader> {
        if !self.windowed {
            if p >= self.num_pages {
                return Err(DbError::Corrupt(format!(
                    "chunk index {p} out of range ({} pages)",
                    self.num_pages
                )));
            }
            return Ok(self.chunk_ptr(p));
        }
        let file = self.file.as_ref().cloned().expect("windowed DB has a file");
        let w = self.window.as_mut().expect("windowed DB has a window");
        // Map one page to read the chunk length, then widen if needed.
        let ptr = w.get(&file, p, 1, 0, 0)?;
        // SAFETY: at least one page including the chunk header is mapped.
        let npages = unsafe { (*(ptr as *mut ChunkHeader)).num_pages() };
        if npages <= 1 {
            return Ok(ptr as *mut ChunkHeader);
        }
        // Give the narrow slot back before claiming the full run, so
        // short-lived header peeks cannot exhaust the window.
        w.release(ptr);
        Ok(w.get(&file, p, npages, 0, 0)? as *mut ChunkHeader)
    }

    /// Release a window slot when done with a chunk pointer.
    pub(crate) fn release_chunk(&mut self, ptr: *const ChunkHeader) {
        if let Some(w) = self.window.as_mut() {
            w.release(ptr as *const u8);
        }
    }

    #[inline]
    pub(crate) fn dir_bits_ptr(&self) -> *mut u8 {
        // SAFETY: directory bits follow the header in the pinned region.
        unsafe { self.base().add(CHUNK_HEADER_SIZE + HDR_SIZE) }
    }

    #[inline]
    pub(crate) fn ptable_ptr(&self) -> *mut PtEntry {
        self.ptable_ptr_for_shift(self.dir_shift)
    }

    #[inline]
    pub(crate) fn ptable_ptr_for_shift(&self, shift: u8) -> *mut PtEntry {
        // SAFETY: the page table follows the directory bits.
        unsafe { self.dir_bits_ptr().add(dir_bytes(shift)) as *mut PtEntry }
    }

    #[inline]
    pub(crate) fn pt_get(&self, logical: LogicalPage) -> PhysPage {
        debug_assert!(logical <= self.max_dirbit);
        // SAFETY: logical <= max_dirbit < dir_width, inside the table.
        unsafe { (*self.ptable_ptr().add(logical as usize)).pagenum() }
    }

    #[inline]
    pub(crate) fn pt_set(&mut self, logical: LogicalPage, phys: PhysPage) {
        debug_assert!(logical <= self.max_dirbit);
        // SAFETY: as in pt_get; &mut self serializes in-handle access.
        unsafe { (*self.ptable_ptr().add(logical as usize)).set_pagenum(phys) }
    }

    pub(crate) fn num_dir_pages(&self) -> u32 {
        num_dir_pages(self.pagesize, self.dir_shift)
    }

    /// mprotect the slack pages of the directory chunk. Only active when
    /// the handle was opened with `protect`.
    pub(crate) fn protect_dir(&mut self, protect: bool) -> Result<()> {
        if !self.protect || self.hdr_only {
            return Ok(());
        }
        let dir_size = CHUNK_HEADER_SIZE
            + HDR_SIZE
            + dir_bytes(self.dir_shift)
            + dir_width(self.dir_shift) as usize * PT_ENTRY_SIZE;
        let syspg = sys_page_size();
        let used = (dir_size + syspg - 1) & !(syspg - 1);
        let mut total = dir_size + self.pagesize as usize - 1;
        if self.pagesize as usize > syspg {
            total -= total % self.pagesize as usize;
        }
        total -= total % syspg;
        if total > used {
            self.region
                .protect_range(used, total - used, !protect || self.rdonly)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locking helpers
    // ------------------------------------------------------------------

    pub(crate) fn lock_internal(&self) -> Result<()> {
        self.locker.lock(LockScope::Internal, true)?;
        Ok(())
    }

    pub(crate) fn unlock_internal(&self) {
        let _ = self.locker.unlock(LockScope::Internal);
    }

    pub(crate) fn lock_db(&self) -> Result<()> {
        self.locker.lock(LockScope::Db, true)?;
        Ok(())
    }

    pub(crate) fn trylock_db(&self) -> Result<bool> {
        self.locker.lock(LockScope::Db, false)
    }

    pub(crate) fn unlock_db(&self) {
        let _ = self.locker.unlock(LockScope::Db);
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.locker.owned()
    }

    /// Public lock surface, mirroring the collaborator contract.
    pub fn lock(&self) -> Result<()> {
        self.lock_db()
    }

    pub fn trylock(&self) -> Result<bool> {
        self.trylock_db()
    }

    pub fn unlock(&self) -> Result<()> {
        self.locker.unlock(LockScope::Db)
    }

    pub fn lock_shared(&self) -> Result<()> {
        self.locker.lock(LockScope::Read, true)?;
        Ok(())
    }

    pub fn trylock_shared(&self) -> Result<bool> {
        self.locker.lock(LockScope::Read, false)
    }

    pub fn unlock_shared(&self) -> Result<()> {
        self.locker.unlock(LockScope::Read)
    }

    pub fn plock(&self, key: &[u8]) -> Result<()> {
        let part = crate::lock::partition_of(self.key_logical_page(key));
        self.locker.lock(LockScope::Part(part), true)?;
        Ok(())
    }

    pub fn tryplock(&self, key: &[u8]) -> Result<bool> {
        let part = crate::lock::partition_of(self.key_logical_page(key));
        self.locker.lock(LockScope::Part(part), false)
    }

    pub fn punlock(&self, key: &[u8]) -> Result<()> {
        let part = crate::lock::partition_of(self.key_logical_page(key));
        self.locker.unlock(LockScope::Part(part))
    }

    pub fn islocked(&self) -> bool {
        self.locker.locked()
    }

    pub fn isowned(&self) -> bool {
        self.locker.owned()
    }

    // ------------------------------------------------------------------
    // Info getters
    // ------------------------------------------------------------------

    pub fn pagesize(&self) -> u32 {
        self.pagesize
    }

    pub fn hash_id(&self) -> u8 {
        self.hash_id
    }

    pub fn spill_size(&self) -> u32 {
        self.spill_size
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_pages as u64 * self.pagesize as u64
    }

    pub fn limit_bytes(&self) -> u64 {
        self.hdr().max_pages as u64 * self.pagesize as u64
    }

    pub fn info(&self) -> DbInfo {
        let hdr = self.hdr();
        DbInfo {
            pagesize: hdr.pagesize,
            num_pages: hdr.num_pages,
            max_pages: hdr.max_pages,
            dir_shift: hdr.dir_shift,
            max_dir_shift: hdr.max_dir_shift,
            dir_width: dir_width(hdr.dir_shift),
            num_dir_pages: num_dir_pages(hdr.pagesize, hdr.dir_shift),
            hash_id: hdr.hash_func,
            spill_size: hdr.spill_size,
            cache_mode: hdr.cache_policy(),
            dir_gen: hdr.dir_gen,
        }
    }

    /// Hash of a key under this DB's hash function.
    pub fn hash_value(&self, key: &[u8]) -> u32 {
        (self.hash_fn)(key)
    }

    /// Logical page a key currently maps to.
    pub fn key_logical_page(&self, key: &[u8]) -> LogicalPage {
        self.hash_to_logical_page(self.hash_value(key))
    }

    pub fn window_stats(&self) -> Option<(u64, u64, usize)> {
        self.window
            .as_ref()
            .map(|w| (w.num_reused, w.num_remapped, w.max_used_bytes()))
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    pub fn set_shake(&mut self, shake: Option<Box<dyn ShakeFunc>>) {
        self.shake = shake;
    }

    pub fn set_clean(&mut self, clean: Option<Box<dyn CleanFunc>>) {
        self.clean = clean;
    }

    pub fn set_stats_callback(&mut self, cb: Option<Box<dyn StatsCallback>>) {
        self.stats_cb = cb;
    }

    // ------------------------------------------------------------------
    // Empty-DB header mutators
    // ------------------------------------------------------------------

    fn require_empty(&mut self) -> Result<()> {
        if self.count_records()? != 0 {
            return Err(DbError::InvalidArg("DB must be empty".into()));
        }
        Ok(())
    }

    pub fn set_hash(&mut self, hash_id: u8) -> Result<()> {
        self.enter_op()?;
        let f = hash_func(hash_id)
            .ok_or_else(|| DbError::InvalidArg(format!("bad hash id {hash_id}")))?;
        self.lock_db()?;
        let r = self.require_empty().map(|_| {
            self.hdr_mut().hash_func = hash_id;
            self.hash_id = hash_id;
            self.hash_fn = f;
        });
        self.unlock_db();
        r
    }

    pub fn set_spill_size(&mut self, size: u32) -> Result<()> {
        self.enter_op()?;
        if size > self.pagesize {
            return Err(DbError::InvalidArg(format!(
                "spill size {size} exceeds page size {}",
                self.pagesize
            )));
        }
        self.lock_db()?;
        if !self.hdr().large_objects() {
            self.unlock_db();
            return Err(DbError::InvalidArg(
                "large objects are not enabled".into(),
            ));
        }
        self.hdr_mut().spill_size = size;
        self.spill_size = size;
        self.unlock_db();
        Ok(())
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) -> Result<()> {
        self.enter_op()?;
        self.lock_db()?;
        let r = self.require_empty().map(|_| {
            self.hdr_mut().cache_mode = mode.as_byte();
            self.cache_policy = mode.policy;
            self.evict_clean_first = mode.evict_clean_first && mode.policy != CacheModeKind::None;
        });
        self.unlock_db();
        r
    }

    pub fn set_alignment(&mut self, align: Alignment) -> Result<()> {
        self.enter_op()?;
        self.lock_db()?;
        let r = self.require_empty().map(|_| {
            self.hdr_mut().dbflags |= align.mask() as u16;
            self.align_mask = align.mask();
        });
        self.unlock_db();
        r
    }

    /// Cap growth to `pages` data pages (plus directory overhead) and
    /// install an optional shake callback.
    pub fn limit_size(&mut self, pages: u32, shake: Option<Box<dyn ShakeFunc>>) -> Result<()> {
        self.enter_op()?;
        let mut dir_shift: u8 = 0;
        let mut npages: u32 = 1;
        while 2 * npages <= pages {
            dir_shift += 1;
            npages <<= 1;
        }
        let total = pages + num_dir_pages(self.pagesize, dir_shift);
        self.lock_db()?;
        if self.hdr().num_pages > total {
            self.unlock_db();
            return Err(DbError::InvalidArg(format!(
                "existing pages {} exceed new limit {total}",
                self.hdr().num_pages
            )));
        }
        self.hdr_mut().max_pages = total;
        self.unlock_db();
        self.shake = shake;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Asynchronous msync of the mapping.
    pub fn sync(&mut self) -> Result<()> {
        self.enter_op()?;
        if self.rdonly || self.memory_only {
            return Ok(());
        }
        self.region.sync_async()
    }

    /// fsync the file descriptor under the DB lock.
    pub fn fsync(&mut self) -> Result<()> {
        self.enter_op()?;
        if self.rdonly || self.memory_only {
            return Ok(());
        }
        let file = self.file.as_ref().cloned().expect("file-backed");
        self.lock_db()?;
        let r = file.sync_all().map_err(DbError::from);
        self.unlock_db();
        r
    }

    // ------------------------------------------------------------------
    // Admin operations
    // ------------------------------------------------------------------

    /// Empty every page but keep the configuration (hash, spill, cache
    /// mode, size limit).
    pub fn purge(&mut self) -> Result<()> {
        self.enter_op()?;
        self.lock_db()?;
        for i in 0..=self.max_dirbit {
            let p = self.pt_get(i);
            if p == 0 {
                continue;
            }
            let page = match self.map_chunk(p) {
                Ok(p) => p,
                Err(e) => {
                    self.unlock_db();
                    return Err(e);
                }
            };
            // SAFETY: map_chunk returned a live chunk mapping.
            unsafe {
                (*page).data = 0;
                let sentinel = (page as *mut u8).add(CHUNK_HEADER_SIZE)
                    as *mut crate::format::EntryDesc;
                (*sentinel).init_sentinel((*page).num_pages() * self.pagesize);
            }
            self.release_chunk(page);
        }
        if self.spill_size != 0 {
            self.free_large_object_chunks();
        }
        self.unlock_db();
        Ok(())
    }

    /// Reset the file to an empty DB with the original page size. Drops
    /// large-object support, spill size, hash choice and size limit.
    pub fn truncate_reset(&mut self) -> Result<()> {
        self.enter_op()?;
        if self.rdonly {
            return Err(DbError::InvalidArg("read-only handle".into()));
        }
        self.lock_db()?;
        let r = self.truncate_inner();
        self.unlock_db();
        r
    }

    fn truncate_inner(&mut self) -> Result<()> {
        let hdr = self.hdr();
        if hdr.large_objects() || hdr.spill_size != 0 {
            warn!("truncate drops large-object support");
        }
        if hdr.hash_func != DEFAULT_HASH {
            warn!(hash = hdr.hash_func, "truncate resets the hash function");
        }
        if hdr.max_pages != 0 {
            warn!(max_pages = hdr.max_pages, "truncate drops the size limit");
        }
        let opts = DbOptions {
            pagesize: self.pagesize,
            ..DbOptions::default()
        };
        if self.memory_only {
            let (image, tot_pages) = build_initial_image(&opts, 1);
            let region =
                MappedRegion::map_anon(tot_pages as usize * self.pagesize as usize)?;
            // SAFETY: fresh anonymous region of at least image.len() bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(image.as_ptr(), region.ptr(), image.len());
            }
            self.region = Arc::new(region);
            self.init_from_header()?;
            self.publish_map();
            self.pre_split(1)?;
            self.hdr_mut().max_pages = self.num_pages;
            return Ok(());
        }
        let file = self.file.as_ref().cloned().expect("file-backed");
        self.write_initial_image(&file, &opts, 1)?;
        self.internal_remap(0)?;
        self.publish_map();
        self.pre_split(1)
    }

    /// Atomically install `new_path` (a compatible DB file) over this DB.
    /// Peer handles notice on their next operation and re-open.
    pub fn replace_db<P: AsRef<Path>>(&mut self, new_path: P) -> Result<()> {
        let new_path = new_path.as_ref();
        self.enter_op()?;
        if self.memory_only {
            return Err(DbError::InvalidArg("memory-only DB".into()));
        }
        // Validate the incoming file before committing.
        {
            let f = File::open(new_path)?;
            let mut hdr = DbHeader::zeroed();
            f.read_exact_at(bytemuck::bytes_of_mut(&mut hdr), CHUNK_HEADER_SIZE as u64)?;
            hdr.validate()?;
        }
        self.lock_db()?;
        self.hdr_mut().dbflags |= HFLAG_REPLACED;
        let r = match std::fs::rename(new_path, &self.path) {
            Ok(()) => self.reopen_replaced(),
            Err(e) => {
                // Nothing was installed; un-mark the live file.
                self.hdr_mut().dbflags &= !HFLAG_REPLACED;
                Err(e.into())
            }
        };
        self.unlock_db();
        r
    }

    /// Write a consistent snapshot of the DB to `out`. With `lock_all`,
    /// the DB lock is held for the whole copy; otherwise the header is
    /// copied under the DB lock and each page under its own lock, and
    /// the copy is abandoned if the directory changed mid-flight.
    pub fn fcopy(&mut self, out: &mut File, lock_all: bool) -> Result<()> {
        self.enter_op()?;
        if lock_all {
            self.lock_db()?;
            let r = self.fcopy_whole(out);
            self.unlock_db();
            return r;
        }
        self.fcopy_per_page(out)
    }

    fn fcopy_whole(&mut self, out: &mut File) -> Result<()> {
        use std::io::Write;
        let len = self.size_bytes();
        out.set_len(0)?;
        if self.windowed {
            // The mapping is partial; copy through the fd.
            let file = self.file.as_ref().cloned().expect("file-backed");
            let mut off = 0u64;
            let mut buf = vec![0u8; self.pagesize as usize];
            while off < len {
                let n = buf.len().min((len - off) as usize);
                file.read_exact_at(&mut buf[..n], off)?;
                out.write_all(&buf[..n])?;
                off += n as u64;
            }
        } else {
            // SAFETY: the whole DB is mapped; we hold the DB lock.
            let bytes = unsafe { std::slice::from_raw_parts(self.base(), len as usize) };
            out.write_all(bytes)?;
        }
        out.flush()?;
        Ok(())
    }

    fn fcopy_per_page(&mut self, out: &mut File) -> Result<()> {
        let pgsz = self.pagesize as u64;
        let dir_shift_start = self.dir_shift;
        let num_pages_start = self.num_pages;

        // Header, directory and page table first, under the DB lock.
        self.lock_db()?;
        let dir_pages = self.num_dir_pages() as u64;
        let r = (|| -> Result<()> {
            out.set_len(0)?;
            let mut buf = vec![0u8; self.pagesize as usize];
            for p in 0..dir_pages {
                // SAFETY: directory pages are always pinned in the map.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.base().add((p * pgsz) as usize),
                        buf.as_mut_ptr(),
                        buf.len(),
                    );
                }
                out.write_all_at(&buf, p * pgsz)?;
            }
            Ok(())
        })();
        self.unlock_db();
        r?;

        // Data pages (and their large objects) under per-page locks.
        for logical in 0..=self.max_dirbit {
            let scope = self.op_scope(false, logical);
            if let Some(s) = scope {
                self.locker.lock(s, true)?;
            }
            let r = self.fcopy_one_page(out, logical);
            if let Some(s) = scope {
                let _ = self.locker.unlock(s);
            }
            r?;
        }

        // Free-chunk headers, so the copy walks cleanly.
        let mut pno: PhysPage = 0;
        while pno < num_pages_start {
            let hdr = self.chunk_hdr(pno)?;
            if hdr.num_pages() == 0 {
                break;
            }
            if hdr.is_type(ChunkType::Free) {
                let mut buf = vec![0u8; self.pagesize as usize];
                buf[..CHUNK_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&hdr));
                out.write_all_at(&buf, pno as u64 * pgsz)?;
            }
            pno += hdr.num_pages();
        }

        if dir_shift_start != self.hdr().dir_shift || num_pages_start != self.hdr().num_pages {
            out.set_len(0)?;
            return Err(DbError::WouldBlock);
        }
        out.set_len(num_pages_start as u64 * pgsz)?;
        Ok(())
    }

    fn fcopy_one_page(&mut self, out: &mut File, logical: LogicalPage) -> Result<()> {
        use crate::dir::PageAlloc;
        let Some(page) = self.pagenum_to_page(logical, PageAlloc::NoAlloc)? else {
            return Ok(());
        };
        let pgsz = self.pagesize as u64;
        let phys = self.pt_get(logical);
        let view = self.view(page);
        let nbytes = view.num_pages() as usize * self.pagesize as usize;
        // SAFETY: the chunk is mapped for its full length.
        let bytes = unsafe { std::slice::from_raw_parts(page as *const u8, nbytes) };
        out.write_all_at(bytes, phys as u64 * pgsz)?;

        for i in 0..view.num_entries() {
            let e = view.entry(i);
            if !e.is_tombstone() && e.is_large_obj() {
                let rec = self.lob_record(&view, i);
                let lob = self.map_chunk(rec.pagenum())?;
                // SAFETY: the LOB chunk is mapped for its full length.
                let nbytes = unsafe { (*lob).num_pages() } as usize * self.pagesize as usize;
                let bytes = unsafe { std::slice::from_raw_parts(lob as *const u8, nbytes) };
                out.write_all_at(bytes, rec.pagenum() as u64 * pgsz)?;
                self.release_chunk(lob);
            }
        }
        self.release_chunk(page);
        Ok(())
    }

    /// Walk the chunk list; for administrative tools and tests.
    pub fn walk_chunks(&mut self) -> Result<Vec<ChunkInfo>> {
        self.enter_op()?;
        self.lock_db()?;
        let r = (|| {
            let mut out = Vec::new();
            let mut pno: PhysPage = 0;
            while pno < self.num_pages {
                let hdr = self.chunk_hdr(pno)?;
                if hdr.num_pages() == 0 {
                    break;
                }
                out.push(ChunkInfo {
                    start: pno,
                    num_pages: hdr.num_pages(),
                    chunk_type: hdr.chunk_type(),
                    owner: hdr.num(),
                    data: hdr.data,
                });
                pno += hdr.num_pages();
            }
            Ok(out)
        })();
        self.unlock_db();
        r
    }

    /// Duplicate this handle: shares the file, mapping and locks; carries
    /// its own iterator and window state.
    pub fn dup(&self) -> Result<Db> {
        self.check_guard()?;
        self.shared.add_ref();
        let mut db = Db {
            guard1: GUARD_WORD,
            path: self.path.clone(),
            locker: Arc::clone(&self.locker),
            lock_mode: self.lock_mode,
            shared: Arc::clone(&self.shared),
            region: Arc::clone(&self.region),
            file: self.file.clone(),
            map_gen: self.map_gen,
            rdonly: self.rdonly,
            windowed: self.windowed,
            window_size_req: self.window_size_req,
            memory_only: self.memory_only,
            hdr_only: self.hdr_only,
            protect: self.protect,
            lock_pages_flag: self.lock_pages_flag,
            fsync_on_close: self.fsync_on_close,
            pagesize: self.pagesize,
            num_pages: self.num_pages,
            align_mask: self.align_mask,
            spill_size: self.spill_size,
            cache_policy: self.cache_policy,
            evict_clean_first: self.evict_clean_first,
            dir_shift: self.dir_shift,
            max_dir_shift: self.max_dir_shift,
            max_dirbit: self.max_dirbit,
            dir_gen: self.dir_gen,
            dir_perfect: self.dir_perfect,
            dir_copy: self.dir_copy.clone(),
            hash_id: self.hash_id,
            hash_fn: self.hash_fn,
            window: None,
            shake: None,
            clean: None,
            stats_cb: None,
            stats: Stats::default(),
            guard2: GUARD_WORD,
        };
        if self.windowed {
            let file = self.file.as_ref().cloned().expect("windowed DB has a file");
            let wsize = self
                .window
                .as_ref()
                .map(|w| w.num_pages() * self.pagesize as usize)
                .unwrap_or(DEFAULT_WINDOW_PAGES as usize * self.pagesize as usize);
            db.window = Some(WindowData::new(&file, wsize, self.pagesize)?);
        }
        Ok(db)
    }

    /// Resize the rolling window (windowed handles only).
    pub fn set_window_size(&mut self, bytes: usize) -> Result<()> {
        if !self.windowed {
            return Err(DbError::InvalidArg("not a windowed handle".into()));
        }
        if bytes < 2 * self.pagesize as usize {
            return Err(DbError::InvalidArg(
                "window must be at least two pages".into(),
            ));
        }
        let file = self.file.as_ref().cloned().expect("windowed DB has a file");
        self.window = Some(WindowData::new(&file, bytes, self.pagesize)?);
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.fsync_on_close && !self.rdonly && !self.memory_only {
            if let Some(f) = &self.file {
                let _ = f.sync_all();
            }
        }
        self.shared.release();
    }
}

/// Directory-region pages needed for a shift: chunk header + DB header +
/// directory bits + page table, rounded up to whole DB pages.
pub(crate) fn num_dir_pages(pagesize: u32, dir_shift: u8) -> u32 {
    let bytes = CHUNK_HEADER_SIZE
        + HDR_SIZE
        + dir_bytes(dir_shift)
        + dir_width(dir_shift) as usize * PT_ENTRY_SIZE;
    pages_rounded_up(pagesize, bytes as u64)
}

/// Build the initial on-disk image: the directory chunk with a valid
/// header, sized for `data_pages` data pages. Returns the image (the
/// directory chunk bytes) and the total page count for the file.
fn build_initial_image(opts: &DbOptions, data_pages: u32) -> (Vec<u8>, u32) {
    let pagesize = opts.pagesize;
    let mut dir_shift: u8 = 0;
    let mut n: u32 = 1;
    while (n << 1) <= data_pages {
        dir_shift += 1;
        n <<= 1;
    }
    let dir_pages = num_dir_pages(pagesize, dir_shift);
    let mut tot_pages = data_pages;
    if n == data_pages {
        tot_pages += dir_pages;
    }

    let mut image = vec![0u8; dir_pages as usize * pagesize as usize];

    let mut chunk = ChunkHeader::zeroed();
    chunk.init(ChunkType::Dir, 0, dir_pages, 0);
    chunk.data = DIR_CHUNK_MAGIC;
    image[..CHUNK_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&chunk));

    let mut hdr = DbHeader::zeroed();
    hdr.magic = DB_MAGIC;
    hdr.dbflags = opts.align.mask() as u16;
    if opts.large_objects {
        hdr.dbflags |= HFLAG_LARGEOBJ;
        hdr.spill_size = if opts.spill_size != 0 {
            opts.spill_size
        } else {
            pagesize * 3 / 4
        };
    }
    hdr.dbflags |= HFLAG_PERFECT;
    hdr.cache_mode = opts.cache_mode.as_byte();
    hdr.dir_shift = 0;
    hdr.hash_func = opts.hash;
    hdr.max_dir_shift = opts.max_dir_shift;
    hdr.pagesize = pagesize;
    hdr.num_pages = tot_pages;
    hdr.max_pages = 0;
    hdr.last_chunk = 0;
    hdr.first_free = 0;
    image[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + HDR_SIZE]
        .copy_from_slice(bytemuck::bytes_of(&hdr));

    (image, tot_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_dir_pages() {
        // 16 + 232 + 1 + 4 bytes easily fit one 4k page.
        assert_eq!(num_dir_pages(4096, 0), 1);
        // 2^14 logical pages: 2048 dir bytes + 64k page table.
        assert!(num_dir_pages(4096, 14) > 1);
    }

    #[test]
    fn test_build_initial_image_geometry() {
        let opts = DbOptions::default();
        let (image, tot) = build_initial_image(&opts, 1);
        assert_eq!(tot, 2);
        assert_eq!(image.len(), 4096);
        let hdr: &DbHeader =
            bytemuck::from_bytes(&image[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + HDR_SIZE]);
        assert_eq!(hdr.magic, DB_MAGIC);
        assert_eq!(hdr.num_pages, 2);
        assert_eq!(hdr.dir_shift, 0);
        assert!(hdr.validate().is_ok());
    }

    #[test]
    fn test_alignment_masks() {
        assert_eq!(Alignment::Byte.mask(), 0);
        assert_eq!(Alignment::TwoBytes.mask(), 1);
        assert_eq!(Alignment::FourBytes.mask(), 3);
        assert_eq!(Alignment::EightBytes.mask(), 7);
    }

    #[test]
    fn test_options_validation() {
        assert!(DbOptions::new().pagesize(100).validate().is_err());
        assert!(DbOptions::new().pagesize(4096).validate().is_ok());
        assert!(DbOptions::new().hash(99).validate().is_err());
        assert!(DbOptions::new()
            .memory_only(true)
            .read_only(true)
            .validate()
            .is_err());
    }
}
