//! Chunking.
//!
//! We perform content-defined chunking on raw NAR payload bytes using the
//! FastCDC algorithm. Each chunk is identified by its BLAKE3-256 hash, which
//! is what makes deduplication across NARs possible: two NARs that share a
//! run of bytes at the same content boundary produce the same chunk hash
//! regardless of where that run falls in either file.

use async_stream::try_stream;
use bytes::{BufMut, Bytes, BytesMut};
use fastcdc::ronomon::FastCDC;
use futures::stream::Stream;
use tokio::io::AsyncRead;

use crate::hash::Hash;
use crate::stream::read_chunk_async;

/// A single content-defined chunk produced by [`chunk_stream`].
#[derive(Debug, Clone)]
pub struct Chunk {
    /// BLAKE3-256 hash of `bytes`.
    pub hash: Hash,

    /// Byte offset of this chunk within the original stream.
    pub offset: u64,

    /// Number of bytes in this chunk. Always equal to `bytes.len()`.
    pub size: u32,

    /// The chunk's raw (uncompressed) bytes.
    pub bytes: Bytes,
}

/// Splits a stream into content-defined chunks.
///
/// This is a wrapper over fastcdc-rs that takes an `AsyncRead` and returns a
/// `Stream` of [`Chunk`]s, each carrying its own BLAKE3-256 hash and offset
/// within the original stream.
pub fn chunk_stream<R>(
    mut stream: R,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
) -> impl Stream<Item = std::io::Result<Chunk>>
where
    R: AsyncRead + Unpin + Send,
{
    let s = try_stream! {
        let mut buf = BytesMut::with_capacity(max_size);
        let mut stream_offset: u64 = 0;

        loop {
            let read = read_chunk_async(&mut stream, buf).await?;

            let mut eof = false;
            if read.is_empty() {
                // Already EOF
                break;
            } else if read.len() < max_size {
                // Last read
                eof = true;
            }

            let chunks = FastCDC::with_eof(&read, min_size, avg_size, max_size, eof);
            let mut consumed = 0;

            for chunk in chunks {
                consumed += chunk.length;

                let slice = read.slice(chunk.offset..chunk.offset + chunk.length);
                let hash = Hash::blake3_from_bytes(&slice);

                yield Chunk {
                    hash,
                    offset: stream_offset + chunk.offset as u64,
                    size: chunk.length as u32,
                    bytes: slice,
                };
            }

            stream_offset += consumed as u64;

            if eof {
                break;
            }

            buf = BytesMut::with_capacity(max_size);

            if consumed < read.len() {
                // remaining bytes for the next read
                buf.put_slice(&read[consumed..]);
            }
        }
    };

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use futures::StreamExt;
    use rand::RngCore;

    /// Generates deterministic-enough pseudorandom test data of a given size.
    fn fake_data(size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Chunks and reconstructs a file, checking that offsets line up and
    /// that every chunk's hash matches its bytes.
    #[tokio::test]
    async fn test_chunking_basic() {
        async fn case(size: usize) {
            let test_file = fake_data(size);
            let mut reconstructed_file = Vec::new();

            let cursor = Cursor::new(&test_file);
            let mut chunks = chunk_stream(cursor, 8 * 1024, 16 * 1024, 32 * 1024);

            let mut expected_offset = 0u64;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.unwrap();
                assert_eq!(chunk.offset, expected_offset);
                assert_eq!(chunk.size as usize, chunk.bytes.len());
                assert_eq!(chunk.hash, Hash::blake3_from_bytes(&chunk.bytes));

                expected_offset += chunk.size as u64;
                reconstructed_file.extend_from_slice(&chunk.bytes);
            }

            assert_eq!(reconstructed_file, test_file);
        }

        case(32 * 1024 * 1024 - 1).await;
        case(32 * 1024 * 1024).await;
        case(32 * 1024 * 1024 + 1).await;
    }

    /// The same input always chunks identically (idempotence), and an
    /// insertion near the end of a file doesn't perturb chunk boundaries
    /// far away from the edit (locality).
    #[tokio::test]
    async fn test_chunking_locality() {
        let base = fake_data(4 * 1024 * 1024);

        let hashes_of = |data: &[u8]| {
            let cursor = Cursor::new(data.to_vec());
            let chunks = chunk_stream(cursor, 8 * 1024, 16 * 1024, 32 * 1024);
            futures::executor::block_on(async {
                chunks
                    .map(|c| c.unwrap().hash)
                    .collect::<Vec<_>>()
                    .await
            })
        };

        let hashes_a = hashes_of(&base);
        let hashes_b = hashes_of(&base);
        assert_eq!(hashes_a, hashes_b, "chunking must be idempotent");

        let mut edited = base.clone();
        edited.truncate(edited.len() - 16);
        edited.extend_from_slice(&fake_data(16));

        let hashes_edited = hashes_of(&edited);

        // The prefix of chunks before the edit should be untouched.
        let common_prefix = hashes_a
            .iter()
            .zip(hashes_edited.iter())
            .take_while(|(a, b)| a == b)
            .count();
        assert!(
            common_prefix >= hashes_a.len() - 2,
            "an edit near the end should only perturb the last chunk or two"
        );
    }
}
