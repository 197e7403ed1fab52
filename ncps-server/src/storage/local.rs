//! Local filesystem storage.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use super::{BlobStore, ChunkStore, PutChunkResult};
use crate::error::ServerResult;

/// Configuration for the local filesystem backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    pub path: PathBuf,

    /// zstd compression level used by the chunk store.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_zstd_level() -> i32 {
    3
}

/// A pool of reusable zstd encoders/decoders.
///
/// Chunks are bounded in size by the chunker's `max` setting, so whole
/// chunks are compressed/decompressed in memory rather than streamed.
/// Pooling the (de)compressor avoids paying zstd's context setup cost
/// on every call.
pub struct ChunkCodecPool {
    compressors: ArrayQueue<zstd::bulk::Compressor<'static>>,
    decompressors: ArrayQueue<zstd::bulk::Decompressor<'static>>,
    level: i32,
}

impl std::fmt::Debug for ChunkCodecPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCodecPool")
            .field("level", &self.level)
            .finish()
    }
}

impl ChunkCodecPool {
    pub fn new(level: i32, capacity: usize) -> Self {
        Self {
            compressors: ArrayQueue::new(capacity),
            decompressors: ArrayQueue::new(capacity),
            level,
        }
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut compressor = self
            .compressors
            .pop()
            .map(Ok)
            .unwrap_or_else(|| zstd::bulk::Compressor::new(self.level))?;

        let out = compressor.compress(data)?;
        let _ = self.compressors.push(compressor);
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8], capacity_hint: usize) -> io::Result<Vec<u8>> {
        let mut decompressor = self
            .decompressors
            .pop()
            .map(Ok)
            .unwrap_or_else(zstd::bulk::Decompressor::new)?;

        let out = decompressor.decompress(data, capacity_hint)?;
        let _ = self.decompressors.push(decompressor);
        Ok(out)
    }
}

#[derive(Debug)]
pub struct LocalChunkStore {
    config: LocalStorageConfig,
    codec: ChunkCodecPool,
}

#[derive(Debug)]
pub struct LocalBlobStore {
    config: LocalStorageConfig,
}

/// Shards a content-addressed key into `<base>/<h[0]>/<h[0:2]>/<key>` to
/// avoid huge flat directories.
fn sharded_path(base: &Path, key: &str) -> PathBuf {
    let level1 = &key[0..1];
    let level2 = &key[0..2];
    base.join(level1).join(level2).join(key)
}

fn bytes_to_async_read(bytes: Vec<u8>) -> Box<dyn AsyncRead + Unpin + Send> {
    let stream = futures::stream::once(async move { io::Result::Ok(Bytes::from(bytes)) });
    Box::new(StreamReader::new(stream))
}

impl LocalChunkStore {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        let base = config.path.join("chunk");
        fs::create_dir_all(&base)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let level = config.zstd_level;
        Ok(Self {
            config,
            codec: ChunkCodecPool::new(level, 16),
        })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        sharded_path(&self.config.path.join("chunk"), hash)
    }
}

impl LocalBlobStore {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        let base = config.path.join("nar");
        fs::create_dir_all(&base)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        Ok(Self { config })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        sharded_path(&self.config.path.join("nar"), name)
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn has_chunk(&self, hash: &str) -> ServerResult<bool> {
        Ok(fs::metadata(self.path_for(hash)).await.is_ok())
    }

    async fn get_chunk(&self, hash: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>> {
        let mut file = File::open(self.path_for(hash))
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let mut compressed = Vec::new();
        file.read_to_end(&mut compressed)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let decompressed = self
            .codec
            .decompress(&compressed, compressed.len() * 4)
            .map_err(crate::error::ServerError::storage_error)?;

        Ok(bytes_to_async_read(decompressed))
    }

    async fn put_chunk(
        &self,
        hash: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<PutChunkResult> {
        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let compressed = self
            .codec
            .compress(&raw)
            .map_err(crate::error::ServerError::storage_error)?;
        let compressed_size = compressed.len();

        let final_path = self.path_for(hash);
        if fs::metadata(&final_path).await.is_ok() {
            return Ok(PutChunkResult {
                is_new: false,
                compressed_size,
            });
        }

        let parent = final_path.parent().unwrap();
        fs::create_dir_all(parent)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let temp_path = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut temp = File::create(&temp_path)
                .await
                .map_err(crate::error::ServerError::storage_error)?;
            io::copy(&mut Cursor::new(&compressed), &mut temp)
                .await
                .map_err(crate::error::ServerError::storage_error)?;
            temp.sync_all()
                .await
                .map_err(crate::error::ServerError::storage_error)?;
        }

        match fs::hard_link(&temp_path, &final_path).await {
            Ok(()) => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(PutChunkResult {
                    is_new: true,
                    compressed_size,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Another writer won the race; the existing file stands.
                let _ = fs::remove_file(&temp_path).await;
                Ok(PutChunkResult {
                    is_new: false,
                    compressed_size,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(crate::error::ServerError::storage_error(e))
            }
        }
    }

    async fn delete_chunk(&self, hash: &str) -> ServerResult<()> {
        match fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::ServerError::storage_error(e)),
        }
    }

    async fn walk_chunks(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>> {
        let base = self.config.path.join("chunk");
        let s = try_stream! {
            let mut level1 = fs::read_dir(&base).await.map_err(crate::error::ServerError::storage_error)?;
            while let Some(l1) = level1.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                if !l1.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_dir() {
                    continue;
                }
                let mut level2 = fs::read_dir(l1.path()).await.map_err(crate::error::ServerError::storage_error)?;
                while let Some(l2) = level2.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                    if !l2.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_dir() {
                        continue;
                    }
                    let mut files = fs::read_dir(l2.path()).await.map_err(crate::error::ServerError::storage_error)?;
                    while let Some(file) = files.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                        if file.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_file() {
                            if let Some(name) = file.file_name().to_str() {
                                if !name.starts_with(".tmp-") {
                                    yield name.to_string();
                                }
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(s))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn has_blob(&self, name: &str) -> ServerResult<bool> {
        Ok(fs::metadata(self.path_for(name)).await.is_ok())
    }

    async fn get_blob(&self, name: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>> {
        let file = File::open(self.path_for(name))
            .await
            .map_err(crate::error::ServerError::storage_error)?;
        Ok(Box::new(file))
    }

    async fn put_blob(
        &self,
        name: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let final_path = self.path_for(name);
        let parent = final_path.parent().unwrap();
        fs::create_dir_all(parent)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        let temp_path = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut temp = File::create(&temp_path)
                .await
                .map_err(crate::error::ServerError::storage_error)?;
            io::copy(stream, &mut temp)
                .await
                .map_err(crate::error::ServerError::storage_error)?;
            temp.sync_all()
                .await
                .map_err(crate::error::ServerError::storage_error)?;
        }

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(crate::error::ServerError::storage_error)?;

        Ok(())
    }

    async fn delete_blob(&self, name: &str) -> ServerResult<()> {
        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::ServerError::storage_error(e)),
        }
    }

    async fn walk_nars(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>> {
        let base = self.config.path.join("nar");
        let s = try_stream! {
            let mut level1 = fs::read_dir(&base).await.map_err(crate::error::ServerError::storage_error)?;
            while let Some(l1) = level1.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                if !l1.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_dir() {
                    continue;
                }
                let mut level2 = fs::read_dir(l1.path()).await.map_err(crate::error::ServerError::storage_error)?;
                while let Some(l2) = level2.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                    if !l2.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_dir() {
                        continue;
                    }
                    let mut files = fs::read_dir(l2.path()).await.map_err(crate::error::ServerError::storage_error)?;
                    while let Some(file) = files.next_entry().await.map_err(crate::error::ServerError::storage_error)? {
                        if file.file_type().await.map_err(crate::error::ServerError::storage_error)?.is_file() {
                            if let Some(name) = file.file_name().to_str() {
                                if !name.starts_with(".tmp-") {
                                    yield name.to_string();
                                }
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(s))
    }
}
