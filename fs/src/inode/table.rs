//! Inode table: lookup-count-refcounted inodes keyed
//! by id, with a back-index by `(parent_id, name)`. The table is the
//! sole owner of every inode; a parent reference is just a
//! `parent_id` plus a lookup back into this table, which sidesteps
//! the cyclic-reference problem that a direct parent pointer would create.

use std::collections::HashMap;

use parking_lot::RwLock;

pub const ROOT_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
    ImplicitDirectory,
}

#[derive(Debug, Clone)]
pub struct FileInodeData {
    pub generation: u64,
    pub size: u64,
    pub source_object_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct DirInodeData {
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub id: u64,
    pub kind: InodeKind,
    pub parent_id: u64,
    pub name_in_parent: String,
    pub lookup_count: u64,
    pub file: Option<FileInodeData>,
    pub dir: Option<DirInodeData>,
}

impl Inode {
    pub fn full_name_in_parent(&self) -> &str {
        &self.name_in_parent
    }
}

struct State {
    inodes: HashMap<u64, Inode>,
    by_parent_name: HashMap<(u64, String), u64>,
    next_id: u64,
}

/// Owns every inode reachable from the mount. All mutation goes
/// through `&self` methods guarded by an internal lock; callers are
/// expected to take the per-inode mutex (held elsewhere, per
/// handle/inode type) before this table's lock, never the reverse.
pub struct InodeTable {
    state: RwLock<State>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_ID,
            Inode {
                id: ROOT_ID,
                kind: InodeKind::Directory,
                parent_id: ROOT_ID,
                name_in_parent: String::new(),
                lookup_count: 1,
                file: None,
                dir: Some(DirInodeData { prefix: Some(String::new()) }),
            },
        );
        Self {
            state: RwLock::new(State {
                inodes,
                by_parent_name: HashMap::new(),
                next_id: ROOT_ID + 1,
            }),
        }
    }

    pub fn get(&self, id: u64) -> Option<Inode> {
        self.state.read().inodes.get(&id).cloned()
    }

    pub fn lookup_by_name(&self, parent: u64, name: &str) -> Option<Inode> {
        let state = self.state.read();
        let id = *state.by_parent_name.get(&(parent, name.to_string()))?;
        state.inodes.get(&id).cloned()
    }

    /// Inserts a brand-new inode for `(parent, name)` with
    /// `lookup_count = 0`; the caller bumps the count to 1 itself via
    /// `record_lookup` as part of the same kernel reply, keeping the
    /// "every successful lookup reply increments by 1" invariant in
    /// one place.
    pub fn insert(
        &self,
        kind: InodeKind,
        parent_id: u64,
        name_in_parent: String,
        file: Option<FileInodeData>,
        dir: Option<DirInodeData>,
    ) -> u64 {
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.by_parent_name.insert((parent_id, name_in_parent.clone()), id);
        state.inodes.insert(
            id,
            Inode {
                id,
                kind,
                parent_id,
                name_in_parent,
                lookup_count: 0,
                file,
                dir,
            },
        );
        id
    }

    pub fn record_lookup(&self, id: u64) {
        if let Some(inode) = self.state.write().inodes.get_mut(&id) {
            inode.lookup_count += 1;
        }
    }

    pub fn update_file_data(&self, id: u64, file: FileInodeData) {
        if let Some(inode) = self.state.write().inodes.get_mut(&id) {
            inode.file = Some(file);
        }
    }

    /// `forget(n)`: decrements by `n`; at 0 the inode (and its name
    /// index entry) is destroyed and the id is never reissued.
    pub fn forget(&self, id: u64, n: u64) {
        if id == ROOT_ID {
            return;
        }
        let mut state = self.state.write();
        let destroy = if let Some(inode) = state.inodes.get_mut(&id) {
            inode.lookup_count = inode.lookup_count.saturating_sub(n);
            inode.lookup_count == 0
        } else {
            false
        };
        if destroy {
            if let Some(inode) = state.inodes.remove(&id) {
                state
                    .by_parent_name
                    .remove(&(inode.parent_id, inode.name_in_parent));
            }
        }
    }

    /// Renames the back-index entry in place (used by `rename` and by
    /// conflict-suffix repair); the inode's own `name_in_parent` is
    /// updated to match.
    pub fn rename_entry(&self, id: u64, new_parent: u64, new_name: String) {
        let mut state = self.state.write();
        if let Some(inode) = state.inodes.get(&id).cloned() {
            state
                .by_parent_name
                .remove(&(inode.parent_id, inode.name_in_parent));
            state
                .by_parent_name
                .insert((new_parent, new_name.clone()), id);
            if let Some(inode) = state.inodes.get_mut(&id) {
                inode.parent_id = new_parent;
                inode.name_in_parent = new_name;
            }
        }
    }

    /// Removes the `(parent, name)` index entry without touching
    /// `lookup_count`; used when unlink races a still-referenced
    /// inode (the kernel may still hold it via an open file handle).
    pub fn unlink_name(&self, parent: u64, name: &str) {
        self.state
            .write()
            .by_parent_name
            .remove(&(parent, name.to_string()));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.read().inodes.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_always_present() {
        let table = InodeTable::new();
        let root = table.get(ROOT_ID).unwrap();
        assert_eq!(root.lookup_count, 1);
        assert_eq!(root.kind, InodeKind::Directory);
    }

    #[test]
    fn forget_to_zero_destroys_inode() {
        let table = InodeTable::new();
        let id = table.insert(InodeKind::File, ROOT_ID, "foo".to_string(), None, None);
        table.record_lookup(id);
        table.record_lookup(id);
        assert!(table.get(id).is_some());
        table.forget(id, 1);
        assert!(table.get(id).is_some());
        table.forget(id, 1);
        assert!(table.get(id).is_none());
        assert!(table.lookup_by_name(ROOT_ID, "foo").is_none());
    }

    #[test]
    fn forgetting_root_is_a_no_op() {
        let table = InodeTable::new();
        table.forget(ROOT_ID, 1);
        assert!(table.get(ROOT_ID).is_some());
    }
}
