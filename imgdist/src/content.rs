//! Content-addressable blob store contract and the verification helpers
//! shared by everything that moves blobs in or out of it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use ociclient::{Descriptor, Digester, OciDigest};

use crate::error::{Error, Result};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn has(&self, digest: &OciDigest) -> Result<bool>;

    /// Read a whole blob. Fails with `NotFound` when the digest is absent.
    async fn read(&self, digest: &OciDigest) -> Result<Bytes>;

    /// Store `content` under `digest`. The content must hash to `digest`;
    /// writing a digest that is already present is a successful no-op.
    async fn write(&self, digest: &OciDigest, content: Bytes) -> Result<()>;
}

/// Check `content` against the size and digest a descriptor promises.
pub fn verify(desc: &Descriptor, content: &[u8]) -> Result<()> {
    let actual_size = content.len() as u64;
    if actual_size != desc.size {
        return Err(Error::SizeMismatch {
            digest: desc.digest.clone(),
            expected: desc.size,
            actual: actual_size,
        });
    }
    verify_digest(&desc.digest, content)
}

pub fn verify_digest(expected: &OciDigest, content: &[u8]) -> Result<()> {
    let actual = OciDigest::sha256(content);
    if &actual != expected {
        return Err(Error::DigestMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

/// Drain a byte stream for `desc`, refusing to read past its size and
/// verifying the digest once the stream ends.
pub async fn read_verified<S>(desc: &Descriptor, mut stream: S) -> Result<Bytes>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut digester = Digester::new();
    let mut buf = BytesMut::with_capacity(desc.size.min(64 * 1024 * 1024) as usize);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        digester.update(&chunk);
        if digester.len() > desc.size {
            return Err(Error::SizeMismatch {
                digest: desc.digest.clone(),
                expected: desc.size,
                actual: digester.len(),
            });
        }
        buf.extend_from_slice(&chunk);
    }

    if digester.len() != desc.size {
        return Err(Error::SizeMismatch {
            digest: desc.digest.clone(),
            expected: desc.size,
            actual: digester.len(),
        });
    }

    let actual = digester.finish();
    if actual != desc.digest {
        return Err(Error::DigestMismatch {
            expected: desc.digest.clone(),
            actual,
        });
    }

    Ok(buf.freeze())
}
