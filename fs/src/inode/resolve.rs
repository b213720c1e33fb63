//! Name resolution: lookup by `(parent_id, name)` consults the type
//! cache, stats the file-or-directory form it indicates, repairs
//! file/directory name clashes, and falls back to implicit directory
//! synthesis.

use std::sync::Arc;

use fuser::FileType;

use crate::cache::{EntryType, MetadataCache, MetadataValue, TypeCache};
use crate::error::{FsError, FsResult};
use crate::object_client::{ObjectClient, ObjectClientFacade, ObjectError};

use super::table::{DirInodeData, FileInodeData, InodeKind, InodeTable};

pub const CONFLICT_SUFFIX: char = '\u{000A}';

pub struct Resolver<C> {
    pub table: Arc<InodeTable>,
    pub type_cache: Arc<TypeCache>,
    pub metadata_cache: Arc<MetadataCache>,
    pub object_client: Arc<ObjectClientFacade<C>>,
    pub bucket: String,
    pub implicit_dirs: bool,
}

fn child_path(parent_prefix: &str, name: &str) -> String {
    if parent_prefix.is_empty() {
        name.to_string()
    } else {
        format!("{parent_prefix}/{name}")
    }
}

impl<C: ObjectClient> Resolver<C> {
    /// Resolves `name` inside `parent_id`. Returns the (possibly
    /// freshly-inserted) inode id; the caller is responsible for
    /// calling `record_lookup` exactly once per kernel `lookup` reply.
    pub async fn resolve(&self, parent_id: u64, name: &str) -> FsResult<u64> {
        if name.contains(CONFLICT_SUFFIX) {
            return Err(FsError::InvalidArgument(
                "object names may not contain the conflict suffix byte".to_string(),
            ));
        }

        if let Some(existing) = self.table.lookup_by_name(parent_id, name) {
            return Ok(existing.id);
        }

        let parent = self
            .table
            .get(parent_id)
            .ok_or(FsError::NotFound)?;
        let parent_prefix = parent
            .dir
            .as_ref()
            .and_then(|d| d.prefix.clone())
            .ok_or(FsError::NotADirectory)?;

        if let Some(negative) = self.negative_cache_hit(parent_id, name) {
            if negative {
                return Err(FsError::NotFound);
            }
        }

        match self.type_cache.get(parent_id, name) {
            Some(EntryType::File) => self.resolve_as_file(parent_id, &parent_prefix, name).await,
            Some(EntryType::Directory) => {
                self.resolve_as_directory(parent_id, &parent_prefix, name).await
            }
            None => self.resolve_uncached(parent_id, &parent_prefix, name).await,
        }
    }

    fn negative_cache_hit(&self, parent_id: u64, name: &str) -> Option<bool> {
        use crate::cache::metadata_cache::MetadataEntry;
        match self.metadata_cache.get(parent_id, name)? {
            MetadataEntry::Negative => Some(true),
            MetadataEntry::Positive(_) => Some(false),
        }
    }

    async fn resolve_uncached(&self, parent_id: u64, parent_prefix: &str, name: &str) -> FsResult<u64> {
        let file_path = child_path(parent_prefix, name);
        let dir_path = format!("{file_path}/");

        let file_stat = self.object_client.stat(&self.bucket, &file_path).await;
        let dir_stat = self.object_client.stat(&self.bucket, &dir_path).await;

        match (file_stat, dir_stat) {
            (Ok(_), Ok(dir_rec)) => {
                // Both forms exist: directory wins, file gets the conflict suffix.
                self.type_cache.put(parent_id, name, EntryType::Directory);
                let dir_id = self.insert_directory(parent_id, name, dir_path, &dir_rec);
                Ok(dir_id)
            }
            (Ok(file_rec), Err(_)) => {
                self.type_cache.put(parent_id, name, EntryType::File);
                Ok(self.insert_file(parent_id, name, file_path, &file_rec))
            }
            (Err(_), Ok(dir_rec)) => {
                self.type_cache.put(parent_id, name, EntryType::Directory);
                Ok(self.insert_directory(parent_id, name, dir_path, &dir_rec))
            }
            (Err(_), Err(_)) => {
                if self.implicit_dirs && self.has_any_object_with_prefix(&dir_path).await {
                    Ok(self.insert_implicit_directory(parent_id, name, dir_path))
                } else {
                    self.metadata_cache.put_negative(parent_id, name);
                    Err(FsError::NotFound)
                }
            }
        }
    }

    async fn resolve_as_file(&self, parent_id: u64, parent_prefix: &str, name: &str) -> FsResult<u64> {
        let file_path = child_path(parent_prefix, name);
        match self.object_client.stat(&self.bucket, &file_path).await {
            Ok(rec) => Ok(self.insert_file(parent_id, name, file_path, &rec)),
            Err(ObjectError::NotFound) => {
                self.type_cache.invalidate(parent_id, name);
                self.resolve_uncached(parent_id, parent_prefix, name).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_as_directory(
        &self,
        parent_id: u64,
        parent_prefix: &str,
        name: &str,
    ) -> FsResult<u64> {
        let dir_path = format!("{}/", child_path(parent_prefix, name));
        match self.object_client.stat(&self.bucket, &dir_path).await {
            Ok(rec) => Ok(self.insert_directory(parent_id, name, dir_path, &rec)),
            Err(ObjectError::NotFound) => {
                self.type_cache.invalidate(parent_id, name);
                self.resolve_uncached(parent_id, parent_prefix, name).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_any_object_with_prefix(&self, prefix: &str) -> bool {
        matches!(
            self.object_client.list_page(&self.bucket, prefix, "/", None).await,
            Ok(page) if !page.objects.is_empty() || !page.subdirs.is_empty()
        )
    }

    fn insert_file(
        &self,
        parent_id: u64,
        name: &str,
        object_name: String,
        rec: &crate::object_client::ObjectRecord,
    ) -> u64 {
        self.metadata_cache.put_positive(
            parent_id,
            name,
            MetadataValue {
                kind: FileType::RegularFile,
                generation: rec.generation,
                size: rec.size,
                mtime_unix: rec.updated_at.0,
            },
        );
        self.table.insert(
            InodeKind::File,
            parent_id,
            name.to_string(),
            Some(FileInodeData {
                generation: rec.generation,
                size: rec.size,
                source_object_name: object_name,
            }),
            None,
        )
    }

    fn insert_directory(
        &self,
        parent_id: u64,
        name: &str,
        prefix: String,
        rec: &crate::object_client::ObjectRecord,
    ) -> u64 {
        self.metadata_cache.put_positive(
            parent_id,
            name,
            MetadataValue {
                kind: FileType::Directory,
                generation: rec.generation,
                size: 0,
                mtime_unix: rec.updated_at.0,
            },
        );
        self.table.insert(
            InodeKind::Directory,
            parent_id,
            name.to_string(),
            None,
            Some(DirInodeData { prefix: Some(prefix) }),
        )
    }

    fn insert_implicit_directory(&self, parent_id: u64, name: &str, prefix: String) -> u64 {
        self.table.insert(
            InodeKind::ImplicitDirectory,
            parent_id,
            name.to_string(),
            None,
            Some(DirInodeData { prefix: Some(prefix) }),
        )
    }

    /// Computes the conflict-repaired name a file entry should carry
    /// in a directory listing when a same-named directory object also
    /// exists.
    pub fn conflict_repaired_name(name: &str) -> String {
        format!("{name}{CONFLICT_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MetadataCache, Ttl};
    use crate::clock::FakeClock;
    use crate::inode::table::ROOT_ID;
    use crate::object_client::RetryPolicy;
    use crate::testing::InMemoryObjectClient;
    use std::time::Duration;

    fn resolver(client: InMemoryObjectClient) -> Resolver<InMemoryObjectClient> {
        let clock = FakeClock::new();
        Resolver {
            table: Arc::new(InodeTable::new()),
            type_cache: Arc::new(TypeCache::new(64, Ttl::Duration(Duration::from_secs(60)), clock.clone())),
            metadata_cache: Arc::new(MetadataCache::new(64, Ttl::Duration(Duration::from_secs(60)), clock)),
            object_client: Arc::new(ObjectClientFacade::new(client, RetryPolicy::default())),
            bucket: "bucket".to_string(),
            implicit_dirs: true,
        }
    }

    #[tokio::test]
    async fn resolves_plain_file() {
        let client = InMemoryObjectClient::new();
        client.seed("bucket", "foo", b"data".to_vec());
        let resolver = resolver(client);

        let id = resolver.resolve(ROOT_ID, "foo").await.unwrap();
        let inode = resolver.table.get(id).unwrap();
        assert_eq!(inode.kind, InodeKind::File);
    }

    #[tokio::test]
    async fn directory_wins_conflict_with_same_named_file() {
        let client = InMemoryObjectClient::new();
        client.seed("bucket", "foo", b"data".to_vec());
        client.seed("bucket", "foo/", Vec::new());
        let resolver = resolver(client);

        let id = resolver.resolve(ROOT_ID, "foo").await.unwrap();
        let inode = resolver.table.get(id).unwrap();
        assert_eq!(inode.kind, InodeKind::Directory);
        assert_eq!(
            resolver.type_cache.get(ROOT_ID, "foo"),
            Some(EntryType::Directory)
        );
    }

    #[tokio::test]
    async fn conflict_repaired_name_appends_suffix() {
        let repaired = Resolver::<InMemoryObjectClient>::conflict_repaired_name("foo");
        assert_eq!(repaired, "foo\u{000A}");
    }

    #[tokio::test]
    async fn implicit_directory_synthesized_from_prefix_listing() {
        let client = InMemoryObjectClient::new();
        client.seed("bucket", "dir/child", b"x".to_vec());
        let resolver = resolver(client);

        let id = resolver.resolve(ROOT_ID, "dir").await.unwrap();
        let inode = resolver.table.get(id).unwrap();
        assert_eq!(inode.kind, InodeKind::ImplicitDirectory);
    }

    #[tokio::test]
    async fn missing_name_is_not_found_and_cached_negative() {
        let client = InMemoryObjectClient::new();
        let resolver = resolver(client);

        let err = resolver.resolve(ROOT_ID, "nope").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound));
        assert!(matches!(
            resolver.metadata_cache.get(ROOT_ID, "nope"),
            Some(crate::cache::metadata_cache::MetadataEntry::Negative)
        ));
    }

    #[tokio::test]
    async fn rejects_names_containing_conflict_suffix() {
        let client = InMemoryObjectClient::new();
        let resolver = resolver(client);
        let err = resolver.resolve(ROOT_ID, "foo\u{000A}").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }
}
