//! S3-compatible storage.

use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use async_stream::try_stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use super::{BlobStore, ChunkStore, PutChunkResult};
use crate::error::{ServerError, ServerResult};
use ncps_core::stream::read_chunk_async;

/// The chunk size for each part in a multipart upload.
const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// S3-compatible storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    pub region: String,

    /// The name of the bucket.
    pub bucket: String,

    /// Prefix under which objects are stored (e.g. `store`).
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    pub endpoint: Option<String>,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    pub credentials: Option<S3CredentialsConfig>,

    /// zstd compression level used by the chunk store.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_prefix() -> String {
    "store".to_string()
}

fn default_zstd_level() -> i32 {
    3
}

/// S3 credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug)]
pub struct S3ChunkStore {
    client: Client,
    config: S3StorageConfig,
}

#[derive(Debug)]
pub struct S3BlobStore {
    client: Client,
    config: S3StorageConfig,
}

async fn build_client(config: &S3StorageConfig) -> ServerResult<Client> {
    let shared_config = aws_config::load_from_env().await;
    let mut builder = S3ConfigBuilder::from(&shared_config).region(Region::new(config.region.clone()));

    if let Some(credentials) = &config.credentials {
        builder = builder.credentials_provider(Credentials::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            None,
            None,
            "s3",
        ));
    }

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    Ok(Client::from_conf(builder.build()))
}

fn bytes_to_async_read(bytes: Vec<u8>) -> Box<dyn AsyncRead + Unpin + Send> {
    let stream = futures::stream::once(async move { std::io::Result::Ok(Bytes::from(bytes)) });
    Box::new(StreamReader::new(stream))
}

impl S3ChunkStore {
    pub async fn new(config: S3StorageConfig) -> ServerResult<Self> {
        let client = build_client(&config).await?;
        Ok(Self { client, config })
    }

    fn key_for(&self, hash: &str) -> String {
        format!("{}/chunk/{}/{}/{}", self.config.prefix, &hash[0..1], &hash[0..2], hash)
    }
}

impl S3BlobStore {
    pub async fn new(config: S3StorageConfig) -> ServerResult<Self> {
        let client = build_client(&config).await?;
        Ok(Self { client, config })
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}/nar/{}/{}/{}", self.config.prefix, &name[0..1], &name[0..2], name)
    }
}

#[async_trait]
impl ChunkStore for S3ChunkStore {
    async fn has_chunk(&self, hash: &str) -> ServerResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(hash))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn get_chunk(&self, hash: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(hash))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        let compressed = output
            .body
            .collect()
            .await
            .map_err(ServerError::storage_error)?
            .into_bytes();

        let decompressed = zstd::bulk::decompress(&compressed, compressed.len() * 4)
            .map_err(ServerError::storage_error)?;

        Ok(bytes_to_async_read(decompressed))
    }

    async fn put_chunk(
        &self,
        hash: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<PutChunkResult> {
        // TODO: guard with a lock keyed by `chunk-put:<hash>` once concurrent
        // migration workers can race a fresh upload against this check.
        if self.has_chunk(hash).await? {
            let raw = {
                let mut buf = Vec::new();
                stream
                    .read_to_end(&mut buf)
                    .await
                    .map_err(ServerError::storage_error)?;
                buf
            };
            let compressed_size = zstd::bulk::compress(&raw, self.config.zstd_level)
                .map_err(ServerError::storage_error)?
                .len();
            return Ok(PutChunkResult {
                is_new: false,
                compressed_size,
            });
        }

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(ServerError::storage_error)?;

        let compressed =
            zstd::bulk::compress(&raw, self.config.zstd_level).map_err(ServerError::storage_error)?;
        let compressed_size = compressed.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(hash))
            .body(compressed.into())
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(PutChunkResult {
            is_new: true,
            compressed_size,
        })
    }

    async fn delete_chunk(&self, hash: &str) -> ServerResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(hash))
            .send()
            .await
            .map_err(ServerError::storage_error)?;
        Ok(())
    }

    async fn walk_chunks(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>> {
        let client = self.client.clone();
        let bucket = self.config.bucket.clone();
        let prefix = format!("{}/chunk/", self.config.prefix);

        let s = try_stream! {
            let mut continuation = None;
            loop {
                let mut req = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&prefix);
                if let Some(token) = continuation.take() {
                    req = req.continuation_token(token);
                }
                let output = req.send().await.map_err(ServerError::storage_error)?;

                for object in output.contents() {
                    if let Some(key) = object.key() {
                        if let Some(hash) = key.rsplit('/').next() {
                            yield hash.to_string();
                        }
                    }
                }

                if output.is_truncated().unwrap_or(false) {
                    continuation = output.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
        };
        Ok(Box::pin(s))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn has_blob(&self, name: &str) -> ServerResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(name))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn get_blob(&self, name: &str) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        let stream = output
            .body
            .map(|item| item.map_err(|e| IoError::new(IoErrorKind::Other, e)));

        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn put_blob(
        &self,
        name: &str,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let key = self.key_for(name);

        let buf = BytesMut::with_capacity(MULTIPART_CHUNK_SIZE);
        let first_chunk = read_chunk_async(&mut stream, buf)
            .await
            .map_err(ServerError::storage_error)?;

        if first_chunk.len() < MULTIPART_CHUNK_SIZE {
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .body(first_chunk.into())
                .send()
                .await
                .map_err(ServerError::storage_error)?;
            return Ok(());
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(ServerError::storage_error)?;
        let upload_id = multipart.upload_id().unwrap().to_string();

        let mut part_number = 1;
        let mut parts = Vec::new();
        let mut first_chunk = Some(first_chunk);

        loop {
            let chunk = if part_number == 1 {
                first_chunk.take().unwrap()
            } else {
                let buf = BytesMut::with_capacity(MULTIPART_CHUNK_SIZE);
                read_chunk_async(&mut stream, buf)
                    .await
                    .map_err(ServerError::storage_error)?
            };

            if chunk.is_empty() {
                break;
            }

            let client = self.client.clone();
            let bucket = self.config.bucket.clone();
            let key = key.clone();
            let upload_id = upload_id.clone();
            let fut = tokio::task::spawn(async move {
                client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(chunk.into())
                    .send()
                    .await
            });

            parts.push(fut);
            part_number += 1;
        }

        let completed_parts = join_all(parts)
            .await
            .into_iter()
            .map(|r| r.map_err(|e| IoError::new(IoErrorKind::Other, e)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ServerError::storage_error)?
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ServerError::storage_error)?
            .into_iter()
            .enumerate()
            .map(|(idx, part)| {
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .set_part_number(Some((idx + 1) as i32))
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn delete_blob(&self, name: &str) -> ServerResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.key_for(name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;
        Ok(())
    }

    async fn walk_nars(&self) -> ServerResult<BoxStream<'static, ServerResult<String>>> {
        let client = self.client.clone();
        let bucket = self.config.bucket.clone();
        let prefix = format!("{}/nar/", self.config.prefix);

        let s = try_stream! {
            let mut continuation = None;
            loop {
                let mut req = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&prefix);
                if let Some(token) = continuation.take() {
                    req = req.continuation_token(token);
                }
                let output = req.send().await.map_err(ServerError::storage_error)?;

                for object in output.contents() {
                    if let Some(key) = object.key() {
                        if let Some(name) = key.rsplit('/').next() {
                            yield name.to_string();
                        }
                    }
                }

                if output.is_truncated().unwrap_or(false) {
                    continuation = output.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
        };
        Ok(Box::pin(s))
    }
}
