//! Exposes a [`BucketStore`]'s file index to the flood overlay.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use cairn_net::{FileIndex, IndexedFile};
use cairn_store::BucketStore;

/// Answers searches from the bucket's file records and serves the stored
/// (still encrypted) file bytes.
#[derive(Debug, Clone)]
pub struct BucketFileIndex {
    bucket: Arc<BucketStore>,
}

impl BucketFileIndex {
    pub fn new(bucket: Arc<BucketStore>) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl FileIndex for BucketFileIndex {
    async fn search(&self, query: &str) -> Vec<IndexedFile> {
        self.bucket
            .search_files(query)
            .await
            .into_iter()
            .map(|record| IndexedFile {
                file_id: record.id,
                name: record.name,
                size: record.size,
            })
            .collect()
    }

    async fn read(&self, filename: &str, file_id: Option<&str>) -> Option<Vec<u8>> {
        let record = match file_id {
            Some(id) => self.bucket.file(id).await.filter(|r| r.name == filename),
            None => self.bucket.file_by_name(filename).await,
        };
        let Some(record) = record else {
            debug!(filename = %filename, file_id = ?file_id, "No such file in bucket");
            return None;
        };
        self.bucket.get_file_ciphertext(&record.id).await
    }
}
