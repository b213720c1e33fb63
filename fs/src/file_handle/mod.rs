//! File handle state machines for the read and write paths.

pub mod read;
pub mod write;

pub use read::{OpenFileTarget, ReadHandle, ReadMode};
pub use write::{FinalizeHandle, StagedWriteHandle, StreamingWriteHandle, UploadHandler, UploadState, WriteHandle};
