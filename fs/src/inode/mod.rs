//! Inode graph: the table of live inodes plus the name-resolution
//! algorithm that populates it.

pub mod resolve;
pub mod table;

pub use resolve::{Resolver, CONFLICT_SUFFIX};
pub use table::{DirInodeData, FileInodeData, Inode, InodeKind, InodeTable, ROOT_ID};
