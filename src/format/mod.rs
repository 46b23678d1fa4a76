// On-disk structures. Everything here is written to the file through the
// mapping, so layouts are #[repr(C)] with explicit padding, little-endian,
// and size-asserted at compile time. Changing any of them breaks the file
// format.

mod chunk;
mod entry;
mod header;

pub use chunk::{ChunkHeader, ChunkType, CHUNK_HEADER_SIZE, DIR_CHUNK_MAGIC};
pub use entry::{
    CacheMeta, EntryDesc, LobRecord, PtEntry, CACHE_META_SIZE, EFLAG_DIRTY, EFLAG_LARGEOBJ,
    EFLAG_PAD_MASK, EFLAG_SYNC_ERROR, ENTRY_SIZE, LOB_RECORD_SIZE, PT_ENTRY_SIZE,
    TOP_OF_PAGE_MARKER,
};
pub use header::{
    CacheModeKind, DbHeader, HdrStats, ALIGN_MASK, DB_MAGIC, HDR_SIZE, HFLAG_LARGEOBJ,
    HFLAG_PERFECT, HFLAG_REPLACED,
};
