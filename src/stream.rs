use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    SizeLimitExceeded,
    MismatchedSize { expected: i64, larger: bool },
    MismatchedDigest,
    Io(#[from] std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::SizeLimitExceeded => Error::SizeLimitExceeded,
            Error::MismatchedSize { expected, larger } => Error::MismatchedSize {
                expected: *expected,
                larger: *larger,
            },
            Error::MismatchedDigest => Error::MismatchedDigest,
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Fails the read once more than `limit` bytes have passed through.
pub struct BoundedReader<R> {
    inner: R,
    limit: u64,
    read: u64,
}

impl<R: AsyncRead + Unpin> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        BoundedReader {
            inner,
            limit,
            read: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let got = (buf.filled().len() - before) as u64;
            self.read += got;
            if self.read > self.limit {
                return Poll::Ready(Err(std::io::Error::other(Error::SizeLimitExceeded)));
            }
        }
        res
    }
}

/// Reads exactly `descriptor.size` bytes then probes for one more; a short read or an
/// extra byte is `MismatchedSize`. Once fully drained, the accumulated sha-256 must equal
/// the expected digest or the read is `MismatchedDigest`. This reproduces the
/// read-exact-then-one-byte-probe behavior exactly: the probe byte is read (and discarded)
/// before the digest comparison, not skipped.
pub struct ExactReader<R> {
    inner: R,
    size: u64,
    read: u64,
    expected: Digest,
    hasher: Sha256,
    probed: bool,
}

impl<R: AsyncRead + Unpin> ExactReader<R> {
    pub fn new(inner: R, size: i64, expected: Digest) -> Self {
        ExactReader {
            inner,
            size: size.max(0) as u64,
            read: 0,
            expected,
            hasher: Sha256::new(),
            probed: false,
        }
    }

    /// Drains the stream, verifying size and digest; returns the bytes read.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, Error>
    where
        R: Unpin,
    {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::with_capacity(self.size as usize);
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.read += n as u64;
            if self.read > self.size {
                return Err(Error::MismatchedSize {
                    expected: self.size as i64,
                    larger: true,
                });
            }
            self.hasher.update(&chunk[..n]);
            out.extend_from_slice(&chunk[..n]);
        }
        if self.read < self.size {
            return Err(Error::MismatchedSize {
                expected: self.size as i64,
                larger: false,
            });
        }
        let digest_bytes = self.hasher.finalize();
        if !hex_eq(self.expected.encoded(), &digest_bytes) {
            return Err(Error::MismatchedDigest);
        }
        self.probed = true;
        Ok(out)
    }
}

fn hex_eq(encoded_lower_hex: &str, bytes: &[u8]) -> bool {
    if encoded_lower_hex.len() != 2 * bytes.len() {
        return false;
    }
    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102,
    ];
    encoded_lower_hex
        .as_bytes()
        .chunks_exact(2)
        .zip(bytes)
        .all(|(pair, byte)| LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn bounded_reader_allows_exact_limit() {
        let data = vec![1u8; 16];
        let mut reader = BoundedReader::new(Cursor::new(data.clone()), 16);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn bounded_reader_fails_over_limit() {
        let data = vec![1u8; 17];
        let mut reader = BoundedReader::new(Cursor::new(data), 16);
        let mut out = Vec::new();
        let err = tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn exact_reader_accepts_matching_size_and_digest() {
        let data = b"hello world".to_vec();
        let digest = Digest::sha256(&data);
        let reader = ExactReader::new(Cursor::new(data.clone()), data.len() as i64, digest);
        let out = reader.read_to_end().await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn exact_reader_rejects_short_read() {
        let data = b"hello".to_vec();
        let digest = Digest::sha256("hello world");
        let reader = ExactReader::new(Cursor::new(data), 11, digest);
        let err = reader.read_to_end().await.unwrap_err();
        assert!(matches!(err, Error::MismatchedSize { larger: false, .. }));
    }

    #[tokio::test]
    async fn exact_reader_rejects_long_read() {
        let data = b"hello world!!!".to_vec();
        let digest = Digest::sha256("hello world");
        let reader = ExactReader::new(Cursor::new(data), 11, digest);
        let err = reader.read_to_end().await.unwrap_err();
        assert!(matches!(err, Error::MismatchedSize { larger: true, .. }));
    }

    #[tokio::test]
    async fn exact_reader_rejects_digest_mismatch() {
        let data = b"hello world".to_vec();
        let digest = Digest::sha256("something else");
        let reader = ExactReader::new(Cursor::new(data.clone()), data.len() as i64, digest);
        let err = reader.read_to_end().await.unwrap_err();
        assert!(matches!(err, Error::MismatchedDigest));
    }
}
