//! Directory handle: materializes a directory listing once per open,
//! then serves stable-offset reads out of the materialized vector.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{FsError, FsResult};
use crate::inode::{InodeKind, InodeTable, CONFLICT_SUFFIX};
use crate::object_client::{ObjectClient, ObjectClientFacade};

pub const LIST_PAGE_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: InodeKind,
    pub inode_id: u64,
    pub offset: i64,
}

#[derive(Default)]
struct Listing {
    entries: Vec<DirEntry>,
}

/// One per `opendir`; `read`/`rewinddir` operate on whatever listing is
/// currently materialized.
pub struct DirHandle {
    listing: Mutex<Listing>,
}

impl DirHandle {
    pub fn new() -> Self {
        Self {
            listing: Mutex::new(Listing::default()),
        }
    }

    /// Fetches and materializes the full listing for `dir_prefix`,
    /// replacing whatever was previously materialized (used both for
    /// the first `read` at `offset == 0` and for `rewinddir`).
    pub async fn materialize<C: ObjectClient>(
        &self,
        bucket: &str,
        dir_prefix: &str,
        dir_inode: u64,
        table: &InodeTable,
        object_client: &ObjectClientFacade<C>,
    ) -> FsResult<()> {
        let raw = fetch_all_pages(bucket, dir_prefix, object_client).await?;
        let entries = repair_and_offset(raw, dir_inode, table)?;
        *self.listing.lock() = Listing { entries };
        Ok(())
    }

    /// Copies entries `offset..N` until the caller-supplied budget
    /// predicate says the reply buffer is full; `offset > N` is
    /// rejected, `offset == N` yields an empty slice (end of
    /// directory).
    pub fn read(&self, offset: i64) -> FsResult<Vec<DirEntry>> {
        let listing = self.listing.lock();
        let n = listing.entries.len() as i64;
        if offset < 0 || offset > n {
            return Err(FsError::InvalidArgument(format!(
                "readdir offset {offset} out of range for {n} entries"
            )));
        }
        if offset == n {
            return Ok(Vec::new());
        }
        Ok(listing.entries[offset as usize..].to_vec())
    }
}

impl Default for DirHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct RawEntry {
    name: String,
    kind: InodeKind,
}

/// Streams `list_page` pages through a bounded channel so the paginator
/// can run ahead of the consumer without unbounded buffering, then
/// drains the channel into a flat vector.
async fn fetch_all_pages<C: ObjectClient>(
    bucket: &str,
    prefix: &str,
    object_client: &ObjectClientFacade<C>,
) -> FsResult<Vec<RawEntry>> {
    let (tx, mut rx) = mpsc::channel::<FsResult<Vec<RawEntry>>>(LIST_PAGE_CHANNEL_CAPACITY);

    let bucket = bucket.to_string();
    let prefix = prefix.to_string();
    // object_client is borrowed for the duration of this call (no
    // `'static` bound available), so the paginator runs inline rather
    // than as a detached task; the channel still bounds how far ahead
    // a page can be staged before the drain loop consumes it.
    let mut continuation: Option<String> = None;
    loop {
        let page = object_client
            .list_page(&bucket, &prefix, "/", continuation.as_deref())
            .await
            .map_err(FsError::from);
        let (batch, next, stop) = match page {
            Ok(p) => {
                let mut batch = Vec::with_capacity(p.objects.len() + p.subdirs.len());
                for obj in &p.objects {
                    if let Some(name) = relative_child_name(&obj.name, &prefix) {
                        batch.push(RawEntry {
                            name,
                            kind: InodeKind::File,
                        });
                    }
                }
                for sub in &p.subdirs {
                    if let Some(name) = relative_child_name(sub, &prefix) {
                        batch.push(RawEntry {
                            name,
                            kind: InodeKind::Directory,
                        });
                    }
                }
                let next = p.next_continuation.clone();
                let stop = next.is_none();
                (Ok(batch), next, stop)
            }
            Err(e) => (Err(e), None, true),
        };
        if tx.send(batch).await.is_err() {
            break;
        }
        if stop {
            break;
        }
        continuation = next;
    }
    drop(tx);

    let mut out = Vec::new();
    while let Some(batch) = rx.recv().await {
        out.extend(batch?);
    }
    Ok(out)
}

fn relative_child_name(full: &str, prefix: &str) -> Option<String> {
    let rest = full.strip_prefix(prefix)?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Sorts by name, repairs file/directory clashes with the conflict
/// suffix, and resolves each surviving name to an inode id, assigning
/// consecutive `1..N` offsets.
fn repair_and_offset(
    mut raw: Vec<RawEntry>,
    dir_inode: u64,
    table: &InodeTable,
) -> FsResult<Vec<DirEntry>> {
    raw.sort_by(|a, b| a.name.cmp(&b.name));

    let mut repaired: Vec<RawEntry> = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let mut j = i + 1;
        while j < raw.len() && raw[j].name == raw[i].name {
            j += 1;
        }
        let group = &raw[i..j];
        match group.len() {
            1 => repaired.push(group[0].clone()),
            2 => {
                let file = group.iter().find(|e| e.kind == InodeKind::File);
                let dir = group
                    .iter()
                    .find(|e| e.kind == InodeKind::Directory || e.kind == InodeKind::ImplicitDirectory);
                match (file, dir) {
                    (Some(f), Some(d)) => {
                        repaired.push(RawEntry {
                            name: format!("{}{CONFLICT_SUFFIX}", f.name),
                            kind: f.kind,
                        });
                        repaired.push(d.clone());
                    }
                    _ => {
                        return Err(FsError::CorruptListing(format!(
                            "two non-file entries share the name {:?}",
                            group[0].name
                        )));
                    }
                }
            }
            _ => {
                return Err(FsError::CorruptListing(format!(
                    "more than two entries share the name {:?}",
                    group[0].name
                )));
            }
        }
        i = j;
    }
    repaired.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = Vec::with_capacity(repaired.len());
    for (idx, entry) in repaired.into_iter().enumerate() {
        let lookup_name = entry.name.trim_end_matches(CONFLICT_SUFFIX);
        let inode_id = table
            .lookup_by_name(dir_inode, lookup_name)
            .map(|i| i.id)
            .unwrap_or(dir_inode);
        out.push(DirEntry {
            name: entry.name,
            kind: entry.kind,
            inode_id,
            offset: (idx + 1) as i64,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, kind: InodeKind) -> RawEntry {
        RawEntry {
            name: name.to_string(),
            kind,
        }
    }

    #[test]
    fn conflict_repair_suffixes_the_file() {
        let table = InodeTable::new();
        let entries = repair_and_offset(
            vec![raw("foo", InodeKind::File), raw("foo", InodeKind::Directory)],
            crate::inode::ROOT_ID,
            &table,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "foo\u{000A}" && e.kind == InodeKind::File));
        assert!(entries.iter().any(|e| e.name == "foo" && e.kind == InodeKind::Directory));
        assert_eq!(entries[0].offset, 1);
        assert_eq!(entries[1].offset, 2);
    }

    #[test]
    fn two_directories_with_same_name_is_corrupt() {
        let table = InodeTable::new();
        let err = repair_and_offset(
            vec![
                raw("foo", InodeKind::Directory),
                raw("foo", InodeKind::ImplicitDirectory),
            ],
            crate::inode::ROOT_ID,
            &table,
        )
        .unwrap_err();
        assert!(matches!(err, FsError::CorruptListing(_)));
    }

    #[test]
    fn read_past_end_is_invalid_argument() {
        let handle = DirHandle::new();
        handle.listing.lock().entries = vec![DirEntry {
            name: "a".to_string(),
            kind: InodeKind::File,
            inode_id: 2,
            offset: 1,
        }];
        assert!(handle.read(2).unwrap().is_empty());
        assert!(matches!(handle.read(3), Err(FsError::InvalidArgument(_))));
    }
}
