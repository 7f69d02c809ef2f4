//! Object-store tier
//!
//! Builds flagged at creation keep a second copy of their metadata and
//! chunks in an object store (Amazon S3 in production; the in-memory or
//! local-filesystem stores for tests and development). Reads for such
//! builds are routed exclusively here.
//!
//! Layout, one object per chunk, keys zero-padded so lexicographic order
//! equals sequence order:
//!
//! ```text
//! builds/{build_id}/metadata.json
//! builds/{build_id}/chunks/{seq:010}.json
//! builds/{build_id}/tests/{test_id}/metadata.json
//! builds/{build_id}/tests/{test_id}/chunks/{seq:010}.json
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};

use loghouse_core::{ChunkPayload, LogLine};

use crate::error::Result;
use crate::types::{Build, Test};
use crate::{LineStream, LogStore};

/// Object-store-backed implementation of [`LogStore`].
pub struct BucketLogStore {
    store: Arc<dyn ObjectStore>,
}

impl BucketLogStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn build_prefix(build_id: &str) -> Path {
        Path::from(format!("builds/{}", build_id))
    }

    fn owner_prefix(build_id: &str, test_id: Option<&str>) -> Path {
        match test_id {
            Some(test_id) => Path::from(format!("builds/{}/tests/{}", build_id, test_id)),
            None => Self::build_prefix(build_id),
        }
    }

    fn chunk_key(build_id: &str, test_id: Option<&str>, seq: i64) -> Path {
        Self::owner_prefix(build_id, test_id)
            .child("chunks")
            .child(format!("{:010}.json", seq))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.store.get(path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let payload = PutPayload::from(Bytes::from(serde_json::to_vec(value)?));
        self.store.put(path, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for BucketLogStore {
    async fn upload_build_metadata(&self, build: &Build) -> Result<()> {
        let path = Self::build_prefix(&build.id).child("metadata.json");
        self.put_json(&path, build).await
    }

    async fn upload_test_metadata(&self, test: &Test) -> Result<()> {
        let path =
            Self::owner_prefix(&test.build_id, Some(&test.id)).child("metadata.json");
        self.put_json(&path, test).await
    }

    async fn insert_chunks(
        &self,
        build_id: &str,
        test_id: Option<&str>,
        last_seq: i64,
        chunks: &[ChunkPayload],
    ) -> Result<()> {
        let base = last_seq - chunks.len() as i64;
        let create = PutOptions::from(PutMode::Create);

        for (k, chunk) in chunks.iter().enumerate() {
            let path = Self::chunk_key(build_id, test_id, base + k as i64 + 1);
            let payload = PutPayload::from(Bytes::from(serde_json::to_vec(&chunk.lines)?));
            // Create mode refuses to overwrite an existing sequence number.
            self.store.put_opts(&path, payload, create.clone()).await?;
        }
        Ok(())
    }

    async fn find_build(&self, build_id: &str) -> Result<Option<Build>> {
        let path = Self::build_prefix(build_id).child("metadata.json");
        self.get_json(&path).await
    }

    async fn find_test(&self, build_id: &str, test_id: &str) -> Result<Option<Test>> {
        let path = Self::owner_prefix(build_id, Some(test_id)).child("metadata.json");
        self.get_json(&path).await
    }

    async fn find_tests_for_build(&self, build_id: &str) -> Result<Vec<Test>> {
        let prefix = Self::build_prefix(build_id).child("tests");
        let listing = self.store.list_with_delimiter(Some(&prefix)).await?;

        let mut tests = Vec::with_capacity(listing.common_prefixes.len());
        for test_prefix in listing.common_prefixes {
            let path = test_prefix.child("metadata.json");
            if let Some(test) = self.get_json::<Test>(&path).await? {
                tests.push(test);
            }
        }

        tests.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
        Ok(tests)
    }

    async fn log_lines(&self, build_id: &str, test_id: Option<&str>) -> Result<LineStream> {
        let prefix = Self::owner_prefix(build_id, test_id).child("chunks");

        // Chunk keys are small; collect and sort them up front, then fetch
        // the objects themselves one at a time as the consumer pulls.
        let mut keys: Vec<Path> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        keys.sort();

        let store = Arc::clone(&self.store);
        let chunks = stream::try_unfold(
            (store, VecDeque::from(keys)),
            |(store, mut keys)| async move {
                match keys.pop_front() {
                    Some(key) => {
                        let bytes = store.get(&key).await?.bytes().await?;
                        let lines: Vec<LogLine> = serde_json::from_slice(&bytes)?;
                        Ok::<_, crate::Error>(Some((lines, (store, keys))))
                    }
                    None => Ok::<_, crate::Error>(None),
                }
            },
        );

        Ok(chunks
            .map_ok(|lines| stream::iter(lines.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn delete_build(&self, build_id: &str) -> Result<u64> {
        let prefix = Self::build_prefix(build_id);
        let locations: Vec<Path> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        let mut removed = 0u64;
        for location in &locations {
            self.store.delete(location).await?;
            removed += 1;
        }

        tracing::debug!(build_id = %build_id, removed, "removed build from object store");
        Ok(removed)
    }
}
