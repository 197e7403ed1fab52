//! Storage backends.
//!
//! Two capability-typed stores are exposed: [`ChunkStore`] for
//! content-addressed, zstd-compressed chunks, and [`BlobStore`] for
//! whole compressed NAR files and metadata blobs stored verbatim. Each
//! has a local-filesystem and an S3-compatible implementation sharing
//! the same contract.

mod local;
mod s3;

use futures::stream::BoxStream;
use tokio::io::AsyncRead;

use crate::error::ServerResult;

pub(crate) use self::local::{LocalChunkStore, LocalBlobStore, LocalStorageConfig};
pub(crate) use self::s3::{S3ChunkStore, S3BlobStore, S3StorageConfig};

/// Outcome of a `PutChunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutChunkResult {
    /// Whether this call created the chunk (`false` if another writer
    /// won the race or the chunk already existed).
    pub is_new: bool,

    /// The size of the chunk after compression.
    pub compressed_size: usize,
}

/// A content-addressed, zstd-compressed chunk store, keyed by chunk hash.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync + std::fmt::Debug {
    /// Returns whether a chunk is present.
    async fn has_chunk(&self, hash: &str) -> ServerResult<bool>;

    /// Returns a stream of the chunk's decompressed bytes.
    async fn get_chunk(&self, hash: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>>;

    /// Stores a chunk's bytes, compressing them along the way.
    ///
    /// Idempotent: if the chunk already exists, the existing copy wins
    /// and `is_new` is `false`.
    async fn put_chunk(
        &self,
        hash: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<PutChunkResult>;

    /// Deletes a chunk. Absent chunks succeed silently.
    async fn delete_chunk(&self, hash: &str) -> ServerResult<()>;

    /// Walks every chunk hash present in the store.
    ///
    /// Returns `StorageIterationUnsupported` if the backend cannot
    /// enumerate its contents.
    async fn walk_chunks(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>>;
}

/// A content-addressed store for whole compressed NARs and metadata
/// blobs, keyed by an opaque name (typically `{hash}.{compression}` or
/// a narinfo hash).
///
/// Unlike [`ChunkStore`], blobs are stored verbatim: payload
/// compression, if any, is already embedded in the bytes handed to
/// `put_blob`.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Returns whether a blob is present.
    async fn has_blob(&self, name: &str) -> ServerResult<bool>;

    /// Returns a stream of the blob's bytes.
    async fn get_blob(&self, name: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>>;

    /// Stores a blob's bytes verbatim.
    async fn put_blob(
        &self,
        name: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()>;

    /// Deletes a blob. Absent blobs succeed silently.
    async fn delete_blob(&self, name: &str) -> ServerResult<()>;

    /// Walks every blob name present in the store.
    async fn walk_nars(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>>;
}

/// Storage backend selection, as read from configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    Local(LocalStorageConfig),
    S3(S3StorageConfig),
}
