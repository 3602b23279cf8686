//! Byte-level input plumbing: sources, archive scanning, LZ4 frames,
//! and the read-ahead prefetcher.

pub mod lz4;
pub mod prefetch;
pub mod source;
pub mod tar;

pub use prefetch::TwoSlotPrefetcher;
pub use source::{open_raw_file, open_tar_entry, read_exact, ByteSource};
pub use tar::{TarArchive, TarEntry};
