//! Caching layer: metadata cache, type cache, and
//! the on-disk read-through file cache.

pub mod file_cache;
pub mod metadata_cache;
pub mod type_cache;

pub use file_cache::{CacheKey, DownloadJob, FileCache, FileCachePolicy, JobState};
pub use metadata_cache::{MetadataCache, MetadataEntry, MetadataValue, Ttl};
pub use type_cache::{EntryType, TypeCache};
