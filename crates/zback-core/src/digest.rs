use std::io::Write;

use md5::{Digest as _, Md5};
use sha2::Sha256;

/// Digests of one uploaded payload.
///
/// MD5 is what backends with server-side verification echo back
/// (Content-MD5 / ETag); SHA-256 is the end-to-end integrity record in the
/// manifest, independent of backend trust. Both are computed over the final
/// bytes handed to the backend, after compression and encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDigests {
    pub md5: [u8; 16],
    pub sha256: [u8; 32],
    pub len: u64,
}

impl PayloadDigests {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// Tee writer that feeds both digests while passing bytes through.
pub struct DigestWriter<W: Write> {
    inner: W,
    md5: Md5,
    sha256: Sha256,
    len: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            md5: Md5::new(),
            sha256: Sha256::new(),
            len: 0,
        }
    }

    pub fn finalize(mut self) -> std::io::Result<(W, PayloadDigests)> {
        self.inner.flush()?;
        let digests = PayloadDigests {
            md5: self.md5.finalize().into(),
            sha256: self.sha256.finalize().into(),
            len: self.len,
        };
        Ok((self.inner, digests))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.md5.update(&buf[..n]);
        self.sha256.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// One-shot SHA-256, used when verifying downloaded volumes.
pub fn sha256_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
